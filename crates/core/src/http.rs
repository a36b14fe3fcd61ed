//! The small slice of HTTP/1.1 the load generator needs: building the fixed GET request,
//! classifying responses by status line, and an optional framing helper.

use crate::url::ParsedUrl;

pub const USER_AGENT: &str = "mrk a HTTP benchmarking tool";

const HEADER_END: &[u8] = b"\r\n\r\n";

/// Builds the keep-alive GET request sent on every cycle.
pub fn build_request(url: &ParsedUrl, extra_headers: &[String]) -> Vec<u8> {
    let mut request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {USER_AGENT}\r\nConnection: keep-alive\r\n",
        url.path,
        url.host_header()
    );
    for header in extra_headers {
        request.push_str(header.trim());
        request.push_str("\r\n");
    }
    request.push_str("\r\n");
    request.into_bytes()
}

/// Extracts the numeric status code of the first status line, if any.
pub fn status_code(response: &[u8]) -> Option<u16> {
    let line_end = find(response, b"\r\n").unwrap_or(response.len());
    let line = std::str::from_utf8(&response[..line_end]).ok()?;
    let mut tokens = line.split_ascii_whitespace();
    if !tokens.next()?.starts_with("HTTP/") {
        return None;
    }
    let code = tokens.next()?;
    if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    code.parse().ok()
}

/// Returns the length of the first complete response at the start of `buf`, or `None`
/// if more bytes are needed.
///
/// Bodies are delimited by `Content-Length` or chunked transfer encoding; a response with
/// neither is taken to end with its headers.
pub fn framed_len(buf: &[u8]) -> Option<usize> {
    let header_len = find(buf, HEADER_END)? + HEADER_END.len();
    let headers = std::str::from_utf8(&buf[..header_len]).ok()?;

    let mut content_length = None;
    let mut chunked = false;
    for line in headers.split("\r\n").skip(1) {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            content_length = value.parse::<usize>().ok();
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            chunked = value
                .rsplit(',')
                .next()
                .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"));
        }
    }

    if chunked {
        return chunked_len(&buf[header_len..]).map(|body| header_len + body);
    }
    let total = header_len + content_length.unwrap_or(0);
    (buf.len() >= total).then_some(total)
}

/// Length of a complete chunked body including the trailer section.
fn chunked_len(body: &[u8]) -> Option<usize> {
    let mut pos = 0;
    loop {
        let line_end = pos + find(&body[pos..], b"\r\n")?;
        let size_line = std::str::from_utf8(&body[pos..line_end]).ok()?;
        let size_hex = size_line.split(';').next()?.trim();
        let size = usize::from_str_radix(size_hex, 16).ok()?;
        pos = line_end + 2;
        if size == 0 {
            // trailers end with an empty line
            loop {
                let end = pos + find(&body[pos..], b"\r\n")?;
                if end == pos {
                    return Some(end + 2);
                }
                pos = end + 2;
            }
        }
        pos = pos.checked_add(size)?.checked_add(2)?;
        if body.len() < pos {
            return None;
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_layout() {
        let url = ParsedUrl::parse("localhost:8080/index.html").unwrap();
        let request = build_request(&url, &["X-Test: 1".to_owned()]);
        assert_eq!(
            String::from_utf8(request).unwrap(),
            "GET /index.html HTTP/1.1\r\n\
             Host: localhost:8080\r\n\
             User-Agent: mrk a HTTP benchmarking tool\r\n\
             Connection: keep-alive\r\n\
             X-Test: 1\r\n\
             \r\n"
        );
    }

    #[test]
    fn extracts_status() {
        assert_eq!(status_code(b"HTTP/1.1 200 OK\r\n\r\n"), Some(200));
        assert_eq!(status_code(b"HTTP/1.1 404 Not Found\r\n"), Some(404));
        assert_eq!(status_code(b"HTTP/1.0 503"), Some(503));
        assert_eq!(status_code(b"HTTP/1.1 abc OK\r\n"), None);
        assert_eq!(status_code(b"HTTP/1.1\r\n"), None);
        assert_eq!(status_code(b"garbage 200 OK\r\n"), None);
        assert_eq!(status_code(b""), None);
    }

    #[test]
    fn frames_content_length() {
        let full = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        assert_eq!(framed_len(full), Some(full.len()));
        assert_eq!(framed_len(&full[..full.len() - 1]), None);
        assert_eq!(framed_len(b"HTTP/1.1 200 OK\r\nContent-Le"), None);

        let mut two = full.to_vec();
        two.extend_from_slice(full);
        assert_eq!(framed_len(&two), Some(full.len()));
    }

    #[test]
    fn frames_without_body() {
        let response = b"HTTP/1.1 204 No Content\r\n\r\n";
        assert_eq!(framed_len(response), Some(response.len()));
    }

    #[test]
    fn frames_chunked() {
        let response =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n";
        assert_eq!(framed_len(response), Some(response.len()));
        assert_eq!(framed_len(&response[..response.len() - 2]), None);

        let partial = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhel";
        assert_eq!(framed_len(partial), None);
    }
}
