use std::fmt::Display;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UrlError {
    #[error("unsupported scheme `{0}`, expected http or https")]
    UnsupportedScheme(String),
    #[error("missing host in `{0}`")]
    MissingHost(String),
    #[error("invalid port `{0}`")]
    InvalidPort(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

impl Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scheme::Http => write!(f, "http"),
            Scheme::Https => write!(f, "https"),
        }
    }
}

/// Target of the benchmark, split into the parts needed to connect and build requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedUrl {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl ParsedUrl {
    /// Parses `[scheme://]host[:port][/path]`.
    ///
    /// The scheme defaults to `http`, the port to the scheme default and the path to `/`.
    pub fn parse(input: &str) -> Result<Self, UrlError> {
        let input = input.trim();
        let (scheme, rest) = match input.split_once("://") {
            Some((scheme, rest)) => {
                let scheme = match scheme.to_ascii_lowercase().as_str() {
                    "http" => Scheme::Http,
                    "https" => Scheme::Https,
                    _ => return Err(UrlError::UnsupportedScheme(scheme.to_owned())),
                };
                (scheme, rest)
            }
            None => (Scheme::Http, input),
        };

        let (authority, path) = match rest.find('/') {
            Some(idx) => rest.split_at(idx),
            None => (rest, "/"),
        };

        let (host, port) = split_authority(authority)?;
        if host.is_empty() {
            return Err(UrlError::MissingHost(input.to_owned()));
        }
        let port = match port {
            Some(port) if !port.is_empty() => port
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| UrlError::InvalidPort(port.to_owned()))?,
            _ => scheme.default_port(),
        };

        Ok(ParsedUrl {
            scheme,
            host: host.to_owned(),
            port,
            path: path.to_owned(),
        })
    }

    /// Value for the `Host` header; the port is omitted when it is the scheme default.
    pub fn host_header(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == self.scheme.default_port() {
            host
        } else {
            format!("{host}:{}", self.port)
        }
    }
}

fn split_authority(authority: &str) -> Result<(&str, Option<&str>), UrlError> {
    // bracketed IPv6 literal
    if let Some(stripped) = authority.strip_prefix('[') {
        let (host, rest) = stripped
            .split_once(']')
            .ok_or_else(|| UrlError::MissingHost(authority.to_owned()))?;
        return match rest.strip_prefix(':') {
            Some(port) => Ok((host, Some(port))),
            None if rest.is_empty() => Ok((host, None)),
            None => Err(UrlError::InvalidPort(rest.to_owned())),
        };
    }
    Ok(match authority.rsplit_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (authority, None),
    })
}

impl Display for ParsedUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.host_header(), self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_scheme_and_port() {
        let url = ParsedUrl::parse("example.com/path").unwrap();
        assert_eq!(
            url,
            ParsedUrl {
                scheme: Scheme::Http,
                host: "example.com".into(),
                port: 80,
                path: "/path".into(),
            }
        );
    }

    #[test]
    fn explicit_port_and_missing_path() {
        let url = ParsedUrl::parse("https://example.com:8443").unwrap();
        assert_eq!(
            url,
            ParsedUrl {
                scheme: Scheme::Https,
                host: "example.com".into(),
                port: 8443,
                path: "/".into(),
            }
        );
    }

    #[test]
    fn host_with_port_without_scheme() {
        let url = ParsedUrl::parse("localhost:8080/a/b?q=1").unwrap();
        assert_eq!(url.scheme, Scheme::Http);
        assert_eq!(url.host, "localhost");
        assert_eq!(url.port, 8080);
        assert_eq!(url.path, "/a/b?q=1");
        assert_eq!(url.host_header(), "localhost:8080");
    }

    #[test]
    fn https_default_port() {
        let url = ParsedUrl::parse("https://example.com/").unwrap();
        assert_eq!(url.port, 443);
        assert_eq!(url.host_header(), "example.com");
    }

    #[test]
    fn ipv6_literal() {
        let url = ParsedUrl::parse("http://[::1]:9000/x").unwrap();
        assert_eq!(url.host, "::1");
        assert_eq!(url.port, 9000);
        assert_eq!(url.host_header(), "[::1]:9000");
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(
            ParsedUrl::parse("ftp://example.com"),
            Err(UrlError::UnsupportedScheme("ftp".into()))
        );
        assert!(matches!(
            ParsedUrl::parse("http:///path"),
            Err(UrlError::MissingHost(_))
        ));
        assert_eq!(
            ParsedUrl::parse("example.com:http"),
            Err(UrlError::InvalidPort("http".into()))
        );
        assert_eq!(
            ParsedUrl::parse("example.com:0"),
            Err(UrlError::InvalidPort("0".into()))
        );
    }
}
