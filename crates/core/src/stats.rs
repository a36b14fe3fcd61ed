use std::ops::AddAssign;

use serde::Serialize;

use crate::connection::ConnectionError;

/// Per-worker tally of failures, summed by the coordinator once the run ends.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ErrorCounters {
    pub connect: u64,
    pub read: u64,
    pub write: u64,
    /// Non-2xx/3xx responses and unparsable status lines.
    pub status: u64,
    /// Latency samples beyond the histogram range.
    pub timeout: u64,
}

impl ErrorCounters {
    pub(crate) fn record(&mut self, error: &ConnectionError) {
        match error {
            ConnectionError::Connect(_) => self.connect += 1,
            ConnectionError::Write(_) => self.write += 1,
            ConnectionError::Read(_) => self.read += 1,
        }
    }

    pub fn socket_errors(&self) -> u64 {
        self.connect + self.read + self.write + self.timeout
    }
}

impl AddAssign for ErrorCounters {
    fn add_assign(&mut self, rhs: Self) {
        self.connect += rhs.connect;
        self.read += rhs.read;
        self.write += rhs.write;
        self.status += rhs.status;
        self.timeout += rhs.timeout;
    }
}

/// Running totals owned by a single worker.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    /// Responses with a parsable status line.
    pub completed: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub errors: ErrorCounters,
}

impl AddAssign for WorkerStats {
    fn add_assign(&mut self, rhs: Self) {
        self.completed += rhs.completed;
        self.bytes_sent += rhs.bytes_sent;
        self.bytes_received += rhs.bytes_received;
        self.errors += rhs.errors;
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[test]
    fn classifies_connection_errors() {
        let mut errors = ErrorCounters::default();
        errors.record(&ConnectionError::Connect(io::ErrorKind::ConnectionRefused.into()));
        errors.record(&ConnectionError::Read(io::ErrorKind::ConnectionReset.into()));
        errors.record(&ConnectionError::Read(io::ErrorKind::UnexpectedEof.into()));
        errors.record(&ConnectionError::Write(io::ErrorKind::BrokenPipe.into()));
        assert_eq!(
            errors,
            ErrorCounters {
                connect: 1,
                read: 2,
                write: 1,
                status: 0,
                timeout: 0,
            }
        );
        assert_eq!(errors.socket_errors(), 4);
    }

    #[test]
    fn sums_worker_totals() {
        let mut total = WorkerStats::default();
        for completed in [3, 4] {
            total += WorkerStats {
                completed,
                bytes_sent: 10,
                bytes_received: 20,
                errors: ErrorCounters {
                    status: 1,
                    ..Default::default()
                },
            };
        }
        assert_eq!(total.completed, 7);
        assert_eq!(total.bytes_sent, 20);
        assert_eq!(total.bytes_received, 40);
        assert_eq!(total.errors.status, 2);
    }
}
