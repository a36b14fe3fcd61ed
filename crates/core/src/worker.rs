//! Per-thread event loop.
//!
//! Each worker owns its connections and a `mio` poll instance. Readiness is edge-triggered,
//! so a ready connection is driven until one of its operations would block; this keeps the
//! `Connect -> Write -> Read` cycle going without re-arming interest.

use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use mio::{Events, Interest, Poll, Token};

use crate::{
    config::{Config, Framing},
    connection::{Connection, CycleContext, Drive},
    histogram::Histogram,
    stats::WorkerStats,
    transport::Connector,
};

/// Bounded readiness wait, keeps the loop responsive to the stop signal.
const POLL_TIMEOUT: Duration = Duration::from_secs(1);
/// Interval between throughput samples.
const SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

const EVENTS_CAPACITY: usize = 1024;

/// State shared by the coordinator and every worker for the duration of a run.
pub(crate) struct SharedState {
    pub running: AtomicBool,
    pub latency: Histogram,
    pub throughput: Histogram,
}

impl SharedState {
    pub fn new(latency_limit: u64, throughput_limit: u64) -> Self {
        Self {
            running: AtomicBool::new(true),
            latency: Histogram::new(latency_limit),
            throughput: Histogram::new(throughput_limit),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

struct Tick {
    start: Instant,
    completed: u64,
}

pub(crate) struct Worker<C: Connector> {
    id: usize,
    quota: usize,
    addr: SocketAddr,
    request: Arc<[u8]>,
    framing: Framing,
    pipeline: u64,
    connector: Arc<C>,
    shared: Arc<SharedState>,
    poll: Poll,
    connections: HashMap<Token, Connection<C::Transport>>,
    next_token: usize,
    stats: WorkerStats,
}

impl<C: Connector> Worker<C> {
    pub fn new(
        id: usize,
        quota: usize,
        addr: SocketAddr,
        request: Arc<[u8]>,
        config: &Config,
        connector: Arc<C>,
        shared: Arc<SharedState>,
    ) -> io::Result<Self> {
        Ok(Self {
            id,
            quota,
            addr,
            request,
            framing: config.framing(),
            pipeline: config.pipeline,
            connector,
            shared,
            poll: Poll::new()?,
            connections: HashMap::with_capacity(quota),
            next_token: 0,
            stats: WorkerStats::default(),
        })
    }

    /// Runs until the shared running flag is cleared or the readiness wait fails.
    ///
    /// Open connections are abandoned as they are; they are closed when the worker drops.
    pub fn run(mut self) -> WorkerStats {
        tracing::debug!(worker = self.id, connections = self.quota, "Worker starting");
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        let mut tick = Tick {
            start: Instant::now(),
            completed: 0,
        };

        while self.shared.is_running() {
            self.top_up();

            if let Err(error) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if error.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!(worker = self.id, %error, "Readiness wait failed, stopping worker");
                break;
            }

            for event in events.iter() {
                self.dispatch(event.token());
            }

            self.sample_throughput(&mut tick);
        }

        tracing::debug!(
            worker = self.id,
            completed = self.stats.completed,
            open = self.connections.len(),
            "Worker finished"
        );
        self.stats
    }

    fn dispatch(&mut self, token: Token) {
        // events for a connection replaced earlier in this batch
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        let mut cx = CycleContext {
            stats: &mut self.stats,
            latency: &self.shared.latency,
            framing: self.framing,
            pipeline: self.pipeline,
        };

        let outcome = conn.drive(&mut cx);
        let phase = conn.phase();
        match outcome {
            Ok(Drive::Pending) => {}
            Ok(Drive::Closed) => {
                tracing::trace!(worker = self.id, ?token, "Peer closed connection");
                self.replace(token);
            }
            Err(error) => {
                tracing::debug!(worker = self.id, ?token, ?phase, %error, "Connection failed, replacing");
                self.stats.errors.record(&error);
                self.replace(token);
            }
        }
    }

    /// Opens one connection and registers it for read and write readiness.
    fn open(&mut self) -> bool {
        let mut transport = match self.connector.connect(self.addr) {
            Ok(transport) => transport,
            Err(error) => {
                tracing::debug!(worker = self.id, addr = %self.addr, %error, "Connect failed");
                self.stats.errors.connect += 1;
                return false;
            }
        };

        let token = Token(self.next_token);
        self.next_token = self.next_token.wrapping_add(1);
        if let Err(error) = self.poll.registry().register(
            &mut transport,
            token,
            Interest::READABLE | Interest::WRITABLE,
        ) {
            tracing::debug!(worker = self.id, %error, "Failed to register connection");
            self.stats.errors.connect += 1;
            // dropping the connection closes the transport
            drop(Connection::new(transport, self.request.clone()));
            return false;
        }

        self.connections
            .insert(token, Connection::new(transport, self.request.clone()));
        true
    }

    /// Tears down the connection behind `token` and opens a new one in its place.
    fn replace(&mut self, token: Token) {
        if let Some(mut conn) = self.connections.remove(&token) {
            if let Err(error) = self.poll.registry().deregister(conn.transport_mut()) {
                tracing::trace!(worker = self.id, ?token, %error, "Deregister failed");
            }
        }
        self.open();
    }

    /// Restores the connection quota after failed replacement attempts.
    fn top_up(&mut self) {
        while self.connections.len() < self.quota {
            if !self.open() {
                break;
            }
        }
    }

    fn sample_throughput(&mut self, tick: &mut Tick) {
        let elapsed = tick.start.elapsed();
        if elapsed < SAMPLE_INTERVAL {
            return;
        }
        let completed = self.stats.completed - tick.completed;
        let rate = (completed as f64 / elapsed.as_secs_f64()) as u64;
        self.shared.throughput.record(rate);

        tick.start = Instant::now();
        tick.completed = self.stats.completed;
    }
}
