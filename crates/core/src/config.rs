use std::time::Duration;

use serde::{Serialize, Serializer};
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::{
    units::{scan_metric, scan_time},
    url::{ParsedUrl, UrlError},
};

/// Current version of the crate.
pub const PCK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default number of open connections.
pub const DEFAULT_CONNECTIONS: u64 = 10;
/// Default benchmark duration.
pub const DEFAULT_DURATION: Duration = Duration::from_secs(10);
/// Default number of worker threads.
pub const DEFAULT_THREADS: u64 = 1;
/// Latency beyond which a response counts as a timeout error.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
/// Upper bound for the timeout, which sizes the latency histogram (one bucket per µs).
pub const MAX_TIMEOUT: Duration = Duration::from_secs(30);
/// Deepest request pipeline accepted on one connection.
pub const MAX_PIPELINE: u64 = 1024;
/// Highest per-worker requests/second the throughput histogram can hold.
pub const MAX_THREAD_RATE_S: u64 = 10_000_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error(transparent)]
    Url(#[from] UrlError),
    #[error("number of threads must be greater than zero")]
    ZeroThreads,
    #[error("duration must be greater than zero")]
    ZeroDuration,
    #[error("number of connections must be greater than zero")]
    ZeroConnections,
    #[error("number of connections must be >= threads ({connections} < {threads})")]
    TooFewConnections { connections: u64, threads: u64 },
    #[error("pipeline depth must be greater than zero")]
    ZeroPipeline,
    #[error("pipeline depth must be at most {MAX_PIPELINE} (got {0})")]
    PipelineTooDeep(u64),
    #[error("timeout must be between 1s and {}s", MAX_TIMEOUT.as_secs())]
    InvalidTimeout,
    #[error("malformed header `{0}`, expected `Name: value`")]
    InvalidHeader(String),
}

/// How the end of a response is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// A response is complete once no more bytes are immediately available.
    Opportunistic,
    /// Responses are delimited by `Content-Length` or chunked encoding.
    Strict,
}

#[derive(clap::Parser, Debug, Clone)]
#[command(
    name = "mrk",
    version = concat!(env!("CARGO_PKG_VERSION"), ", based on wrk"),
    about = "HTTP benchmarking tool",
    disable_version_flag = true,
    after_help = "Numeric arguments may include a SI unit (1k, 1M, 1G)\n\
                  Time arguments may include a time unit (2s, 2m, 2h)"
)]
pub struct BenchArgs {
    /// Connections to keep open.
    #[arg(short, long, env = "MRK_CONNECTIONS", value_parser = scan_metric, default_value = "10")]
    pub connections: u64,

    /// Duration of test.
    #[arg(short, long, env = "MRK_DURATION", value_parser = scan_time, default_value = "10s")]
    pub duration: Duration,

    /// Number of threads to use.
    #[arg(short, long, env = "MRK_THREADS", value_parser = scan_metric, default_value = "1")]
    pub threads: u64,

    /// Latency beyond which a response is recorded as a timeout.
    #[arg(long, env = "MRK_TIMEOUT", value_parser = scan_time, default_value = "2s")]
    pub timeout: Duration,

    /// Requests written back to back on each connection before awaiting the responses.
    /// Depths above one imply strict response framing.
    #[arg(long, env = "MRK_PIPELINE", value_parser = scan_metric, default_value = "1")]
    pub pipeline: u64,

    /// Delimit responses by Content-Length/chunked encoding instead of read readiness.
    #[arg(long, env = "MRK_STRICT")]
    pub strict: bool,

    /// Additional request header, may be repeated.
    #[arg(short = 'H', long = "header", value_name = "NAME: VALUE")]
    pub headers: Vec<String>,

    /// Print the latency distribution.
    #[arg(long)]
    pub latency: bool,

    /// Print the report as JSON.
    #[arg(long)]
    pub json: bool,

    #[arg(long, env = "MRK_LOG_LEVEL")]
    pub log_level: Option<LevelFilter>,

    /// Print version details.
    #[arg(short = 'v', long, action = clap::ArgAction::Version)]
    pub version: Option<bool>,

    /// Target URL, `[http://]host[:port][/path]`.
    pub url: String,
}

impl BenchArgs {
    /// Parses the target and validates the run parameters.
    pub fn build(self) -> Result<Config, ConfigError> {
        let config = Config {
            url: ParsedUrl::parse(&self.url)?,
            connections: self.connections,
            threads: self.threads,
            duration: self.duration,
            timeout: self.timeout,
            pipeline: self.pipeline,
            strict: self.strict,
            headers: self.headers,
            print_latency: self.latency,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Validated parameters of a benchmark run, shared read-only by every worker.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub url: ParsedUrl,
    pub connections: u64,
    pub threads: u64,
    #[serde(serialize_with = "as_secs")]
    pub duration: Duration,
    #[serde(serialize_with = "as_secs")]
    pub timeout: Duration,
    pub pipeline: u64,
    pub strict: bool,
    pub headers: Vec<String>,
    #[serde(skip)]
    pub print_latency: bool,
}

impl Config {
    /// A configuration with the command line defaults, targeting `url`.
    pub fn new(url: ParsedUrl) -> Self {
        Self {
            url,
            connections: DEFAULT_CONNECTIONS,
            threads: DEFAULT_THREADS,
            duration: DEFAULT_DURATION,
            timeout: DEFAULT_TIMEOUT,
            pipeline: 1,
            strict: false,
            headers: Vec::new(),
            print_latency: false,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threads == 0 {
            return Err(ConfigError::ZeroThreads);
        }
        if self.duration.is_zero() {
            return Err(ConfigError::ZeroDuration);
        }
        if self.connections == 0 {
            return Err(ConfigError::ZeroConnections);
        }
        if self.connections < self.threads {
            return Err(ConfigError::TooFewConnections {
                connections: self.connections,
                threads: self.threads,
            });
        }
        if self.pipeline == 0 {
            return Err(ConfigError::ZeroPipeline);
        }
        if self.pipeline > MAX_PIPELINE {
            return Err(ConfigError::PipelineTooDeep(self.pipeline));
        }
        if self.timeout.is_zero() || self.timeout > MAX_TIMEOUT {
            return Err(ConfigError::InvalidTimeout);
        }
        if let Some(header) = self
            .headers
            .iter()
            .find(|h| !h.split_once(':').is_some_and(|(name, _)| !name.trim().is_empty()))
        {
            return Err(ConfigError::InvalidHeader(header.clone()));
        }
        Ok(())
    }

    pub fn framing(&self) -> Framing {
        if self.strict || self.pipeline > 1 {
            Framing::Strict
        } else {
            Framing::Opportunistic
        }
    }

    /// Bucket count of the latency histogram: every microsecond up to the timeout.
    pub fn latency_limit(&self) -> u64 {
        self.timeout.as_micros() as u64 + 1
    }

    /// Connections opened by each worker; the remainder goes to the first workers.
    pub fn connection_shares(&self) -> impl Iterator<Item = u64> {
        let base = self.connections / self.threads;
        let extra = self.connections % self.threads;
        (0..self.threads).map(move |i| base + u64::from(i < extra))
    }
}

fn as_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

pub fn set_logger(level: Option<LevelFilter>) {
    #[cfg(feature = "trace")]
    {
        use std::sync::atomic::{AtomicBool, Ordering};

        static LOGGER_SET: AtomicBool = AtomicBool::new(false);
        if LOGGER_SET
            .compare_exchange(false, true, Ordering::Release, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        if let Err(error) = crate::tracing::tracer::init_tracer(level) {
            eprintln!("failed tracing initialization: {error}");
        }
    }
    #[cfg(not(feature = "trace"))]
    let _ = level;
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    fn parse(args: &[&str]) -> Result<Config, ConfigError> {
        let args = BenchArgs::try_parse_from(std::iter::once("mrk").chain(args.iter().copied()))
            .expect("valid command line");
        args.build()
    }

    #[test]
    fn parses_command_line() {
        let config = parse(&["-c", "1k", "-d", "2m", "-t", "4", "localhost:8080/x"]).unwrap();
        assert_eq!(config.connections, 1000);
        assert_eq!(config.duration, Duration::from_secs(120));
        assert_eq!(config.threads, 4);
        assert_eq!(config.url.port, 8080);
        assert_eq!(config.framing(), Framing::Opportunistic);
        assert_eq!(config.latency_limit(), 2_000_001);
    }

    #[test]
    fn defaults() {
        let config = parse(&["example.com"]).unwrap();
        assert_eq!(config.connections, DEFAULT_CONNECTIONS);
        assert_eq!(config.duration, DEFAULT_DURATION);
        assert_eq!(config.threads, DEFAULT_THREADS);
        assert_eq!(config.pipeline, 1);
    }

    #[test]
    fn pipelining_implies_strict_framing() {
        let config = parse(&["--pipeline", "4", "example.com"]).unwrap();
        assert_eq!(config.framing(), Framing::Strict);
    }

    #[test]
    fn rejects_invalid_runs() {
        assert_eq!(
            parse(&["-t", "0", "example.com"]).unwrap_err(),
            ConfigError::ZeroThreads
        );
        assert_eq!(
            parse(&["-d", "0", "example.com"]).unwrap_err(),
            ConfigError::ZeroDuration
        );
        assert_eq!(
            parse(&["-c", "0", "example.com"]).unwrap_err(),
            ConfigError::ZeroConnections
        );
        assert_eq!(
            parse(&["-c", "2", "-t", "4", "example.com"]).unwrap_err(),
            ConfigError::TooFewConnections {
                connections: 2,
                threads: 4
            }
        );
        assert_eq!(
            parse(&["--pipeline", "0", "example.com"]).unwrap_err(),
            ConfigError::ZeroPipeline
        );
        assert_eq!(
            parse(&["--pipeline", "1P", "example.com"]).unwrap_err(),
            ConfigError::PipelineTooDeep(10u64.pow(15))
        );
        assert!(parse(&["--pipeline", "1k", "example.com"]).is_ok());
        assert_eq!(
            parse(&["--timeout", "1h", "example.com"]).unwrap_err(),
            ConfigError::InvalidTimeout
        );
        assert_eq!(
            parse(&["-H", "no-colon", "example.com"]).unwrap_err(),
            ConfigError::InvalidHeader("no-colon".into())
        );
        assert!(matches!(
            parse(&["ftp://example.com"]).unwrap_err(),
            ConfigError::Url(_)
        ));
    }

    #[test]
    fn bad_units_are_usage_errors() {
        assert!(BenchArgs::try_parse_from(["mrk", "-c", "10x", "example.com"]).is_err());
        assert!(BenchArgs::try_parse_from(["mrk", "-c", "10"]).is_err());
    }

    #[test]
    fn shares_cover_every_connection() {
        let mut config = Config::new(ParsedUrl::parse("example.com").unwrap());
        config.connections = 10;
        config.threads = 4;
        assert_eq!(config.connection_shares().collect::<Vec<_>>(), [3, 3, 2, 2]);
        config.threads = 5;
        assert_eq!(config.connection_shares().sum::<u64>(), 10);
    }
}
