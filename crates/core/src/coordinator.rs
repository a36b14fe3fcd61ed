//! Run orchestration: splits the connection budget across workers, waits out the run and
//! folds the per-worker totals into a [`Summary`].

use std::{
    io,
    net::{SocketAddr, ToSocketAddrs},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::{
    config::{Config, ConfigError, MAX_THREAD_RATE_S, PCK_VERSION},
    histogram::Histogram,
    http,
    stats::WorkerStats,
    transport::{Connector, PlainConnector},
    url::Scheme,
    worker::{SharedState, Worker},
};

#[derive(Debug, Error)]
pub enum BenchError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("request of {len} bytes cannot be pipelined {depth} times")]
    RequestTooLarge { len: usize, depth: u64 },
    #[error("unable to resolve {host}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("no address found for {0}")]
    NoAddress(String),
    #[error("https targets are not supported yet")]
    TlsUnsupported,
    #[error("failed to create event loop")]
    Poll(#[source] io::Error),
    #[error("failed to spawn worker thread")]
    Spawn(#[source] io::Error),
    #[error("worker state still referenced after join")]
    SharedStateInUse,
}

/// Aggregated outcome of one run.
#[derive(Debug, Serialize)]
pub struct Summary {
    pub version: &'static str,
    pub config: Arc<Config>,
    #[serde(serialize_with = "as_secs")]
    pub elapsed: Duration,
    pub totals: WorkerStats,
    pub latency: Histogram,
    pub throughput: Histogram,
    /// The run was stopped before its configured duration.
    pub interrupted: bool,
    /// Inter-request interval (µs) used for the coordinated-omission correction, if applied.
    pub corrected_interval_us: Option<u64>,
    pub requests_per_sec: f64,
    pub transfer_per_sec: f64,
}

impl Summary {
    pub(crate) fn new(
        config: Arc<Config>,
        elapsed: Duration,
        totals: WorkerStats,
        shared: SharedState,
        interrupted: bool,
    ) -> Self {
        let secs = elapsed.as_secs_f64();
        let rate = |n: u64| if secs > 0.0 { n as f64 / secs } else { 0.0 };

        let corrected_interval_us = coordinated_omission_interval(
            elapsed,
            totals.completed,
            config.connections,
        );
        if let Some(interval) = corrected_interval_us {
            tracing::debug!(interval_us = interval, "Correcting latency for coordinated omission");
            shared.latency.correct(interval);
        }

        Self {
            version: PCK_VERSION,
            requests_per_sec: rate(totals.completed),
            transfer_per_sec: rate(totals.bytes_received),
            config,
            elapsed,
            totals,
            latency: shared.latency,
            throughput: shared.throughput,
            interrupted,
            corrected_interval_us,
        }
    }
}

/// Average time between two requests on one connection, available once every connection
/// completed at least one full round.
fn coordinated_omission_interval(
    elapsed: Duration,
    completed: u64,
    connections: u64,
) -> Option<u64> {
    let rounds = completed.checked_div(connections).filter(|r| *r > 0)?;
    Some(elapsed.as_micros() as u64 / rounds)
}

fn as_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Raises the stop request of a [`Benchmark`] registered through [`Benchmark::stop_on`].
pub struct StopHandle {
    tx: Sender<()>,
    raised: AtomicBool,
}

impl StopHandle {
    pub fn new() -> (Self, Receiver<()>) {
        let (tx, rx) = channel::bounded(1);
        let handle = Self {
            tx,
            raised: AtomicBool::new(false),
        };
        (handle, rx)
    }

    /// Requests the run to stop. Returns `false` if a stop was already requested.
    pub fn request(&self) -> bool {
        if self.raised.swap(true, Ordering::AcqRel) {
            return false;
        }
        // the receiver may be gone once the run is over
        let _ = self.tx.try_send(());
        true
    }
}

pub struct Benchmark {
    config: Arc<Config>,
    stop: Option<Receiver<()>>,
}

impl Benchmark {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            stop: None,
        }
    }

    /// Ends the run early when a message arrives on `stop`.
    pub fn stop_on(mut self, stop: Receiver<()>) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Checks that [`Benchmark::run`] can start, without any I/O.
    pub fn check(&self) -> Result<(), BenchError> {
        self.config.validate()?;
        match self.config.url.scheme {
            Scheme::Http => Ok(()),
            Scheme::Https => Err(BenchError::TlsUnsupported),
        }
    }

    /// Runs the benchmark with the transport matching the target scheme.
    pub fn run(&self) -> Result<Summary, BenchError> {
        self.check()?;
        self.run_with(PlainConnector)
    }

    /// Runs the benchmark over connections opened by `connector`.
    pub fn run_with<C: Connector>(&self, connector: C) -> Result<Summary, BenchError> {
        self.config.validate()?;
        let request = self.pipelined_request()?;
        let addr = self.resolve()?;
        let connector = Arc::new(connector);
        let shared = Arc::new(SharedState::new(
            self.config.latency_limit(),
            MAX_THREAD_RATE_S,
        ));

        tracing::info!(
            %addr,
            threads = self.config.threads,
            connections = self.config.connections,
            framing = ?self.config.framing(),
            "Starting benchmark"
        );

        let start = Instant::now();
        let mut handles = Vec::with_capacity(self.config.threads as usize);
        for (id, quota) in self.config.connection_shares().enumerate() {
            let spawned = Worker::new(
                id,
                quota as usize,
                addr,
                request.clone(),
                &self.config,
                connector.clone(),
                shared.clone(),
            )
            .map_err(BenchError::Poll)
            .and_then(|worker| {
                thread::Builder::new()
                    .name(format!("mrk-worker-{id}"))
                    .spawn(move || worker.run())
                    .map_err(BenchError::Spawn)
            });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    tracing::error!(worker = id, error = %err, "Aborting run");
                    shared.stop();
                    join_all(handles);
                    return Err(err);
                }
            }
        }

        let interrupted = self.wait();
        shared.stop();
        let totals = join_all(handles);
        let elapsed = start.elapsed();

        let shared = Arc::try_unwrap(shared).map_err(|_| BenchError::SharedStateInUse)?;
        tracing::info!(
            completed = totals.completed,
            elapsed_ms = elapsed.as_millis() as u64,
            interrupted,
            "Benchmark finished"
        );
        Ok(Summary::new(
            self.config.clone(),
            elapsed,
            totals,
            shared,
            interrupted,
        ))
    }

    /// One cycle of outbound bytes: `pipeline` copies of the request.
    fn pipelined_request(&self) -> Result<Arc<[u8]>, BenchError> {
        let request = http::build_request(&self.config.url, &self.config.headers);
        let depth = self.config.pipeline;
        usize::try_from(depth)
            .ok()
            .and_then(|depth| request.len().checked_mul(depth))
            .filter(|len| isize::try_from(*len).is_ok())
            .ok_or(BenchError::RequestTooLarge {
                len: request.len(),
                depth,
            })?;
        Ok(Arc::from(request.repeat(depth as usize)))
    }

    fn resolve(&self) -> Result<SocketAddr, BenchError> {
        let url = &self.config.url;
        let addrs: Vec<_> = (url.host.as_str(), url.port)
            .to_socket_addrs()
            .map_err(|source| BenchError::Resolve {
                host: url.host.clone(),
                source,
            })?
            .collect();
        addrs
            .iter()
            .find(|addr| addr.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| BenchError::NoAddress(url.host.clone()))
    }

    /// Blocks for the configured duration; returns `true` if stopped early.
    fn wait(&self) -> bool {
        let duration = self.config.duration;
        let deadline = Instant::now() + duration;
        if let Some(stop) = &self.stop {
            match stop.recv_timeout(duration) {
                Ok(()) => {
                    tracing::info!("Stop requested, ending run early");
                    return true;
                }
                Err(RecvTimeoutError::Timeout) => return false,
                Err(RecvTimeoutError::Disconnected) => {}
            }
        }
        thread::sleep(deadline.saturating_duration_since(Instant::now()));
        false
    }
}

fn join_all(handles: Vec<JoinHandle<WorkerStats>>) -> WorkerStats {
    let mut totals = WorkerStats::default();
    for handle in handles {
        let name = handle.thread().name().unwrap_or("worker").to_owned();
        match handle.join() {
            Ok(stats) => totals += stats,
            Err(_) => tracing::error!(worker = %name, "Worker panicked, its totals are lost"),
        }
    }
    totals
}

#[cfg(test)]
mod tests {
    use crossbeam::channel;

    use super::*;
    use crate::url::ParsedUrl;

    #[test]
    fn interval_requires_a_full_round() {
        let elapsed = Duration::from_secs(1);
        assert_eq!(coordinated_omission_interval(elapsed, 3, 4), None);
        assert_eq!(coordinated_omission_interval(elapsed, 0, 4), None);
        // two full rounds on four connections
        assert_eq!(coordinated_omission_interval(elapsed, 9, 4), Some(500_000));
    }

    #[test]
    fn https_is_rejected_before_any_io() {
        let config = Config::new(ParsedUrl::parse("https://localhost:1").unwrap());
        let err = Benchmark::new(config).run().unwrap_err();
        assert!(matches!(err, BenchError::TlsUnsupported));
    }

    #[test]
    fn check_rejects_before_any_io() {
        let config = Config::new(ParsedUrl::parse("https://localhost:1").unwrap());
        assert!(matches!(
            Benchmark::new(config).check(),
            Err(BenchError::TlsUnsupported)
        ));

        let mut config = Config::new(ParsedUrl::parse("localhost:1").unwrap());
        config.pipeline = 10u64.pow(15);
        let bench = Benchmark::new(config);
        assert!(matches!(
            bench.check(),
            Err(BenchError::Config(ConfigError::PipelineTooDeep(_)))
        ));
        assert!(matches!(
            bench.run_with(PlainConnector),
            Err(BenchError::Config(ConfigError::PipelineTooDeep(_)))
        ));
    }

    #[test]
    fn pipelined_request_repeats_request() {
        let mut config = Config::new(ParsedUrl::parse("localhost").unwrap());
        config.pipeline = 3;
        let single = http::build_request(&config.url, &[]);
        let request = Benchmark::new(config).pipelined_request().unwrap();
        assert_eq!(request.len(), 3 * single.len());
        assert!(request.starts_with(&single));
    }

    #[test]
    fn repeated_stop_requests_are_reported() {
        let mut config = Config::new(ParsedUrl::parse("localhost").unwrap());
        config.duration = Duration::from_secs(30);
        let (stop, rx) = StopHandle::new();
        let bench = Benchmark::new(config).stop_on(rx);

        assert!(stop.request());
        // the run consumes the first request, the second must still be seen as repeated
        assert!(bench.wait());
        assert!(!stop.request());
        assert!(!stop.request());
    }

    #[test]
    fn stop_channel_ends_wait_early() {
        let mut config = Config::new(ParsedUrl::parse("localhost").unwrap());
        config.duration = Duration::from_secs(30);
        let (tx, rx) = channel::bounded(1);
        let bench = Benchmark::new(config).stop_on(rx);

        tx.send(()).unwrap();
        let start = Instant::now();
        assert!(bench.wait());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn disconnected_stop_channel_waits_full_duration() {
        let mut config = Config::new(ParsedUrl::parse("localhost").unwrap());
        config.duration = Duration::from_millis(200);
        let (tx, rx) = channel::bounded::<()>(1);
        drop(tx);
        let bench = Benchmark::new(config).stop_on(rx);

        let start = Instant::now();
        assert!(!bench.wait());
        assert!(start.elapsed() >= Duration::from_millis(200));
    }
}
