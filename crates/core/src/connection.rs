//! Per-socket request/response state machine.
//!
//! A connection cycles `Connect -> Write -> Read -> Connect` for as long as the peer keeps
//! it alive. `Connect` is re-entered after every response and asks the transport whether
//! the stream is ready for the next request; for plain TCP that is only meaningful the
//! first time and a pass-through afterwards.

use std::{io, sync::Arc, time::Instant};

use thiserror::Error;

use crate::{
    config::Framing,
    histogram::Histogram,
    http,
    stats::WorkerStats,
    transport::{Step, Transport},
};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),
    #[error("write failed: {0}")]
    Write(#[source] io::Error),
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connect,
    Write,
    Read,
}

/// What the worker should do with a connection after driving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Drive {
    /// Waiting for the next readiness event.
    Pending,
    /// The peer closed the stream after a complete response.
    Closed,
}

enum ReadOutcome {
    Pending,
    Complete,
    Closed,
}

/// Worker-owned state a connection updates while completing a cycle.
pub(crate) struct CycleContext<'a> {
    pub stats: &'a mut WorkerStats,
    pub latency: &'a Histogram,
    pub framing: Framing,
    pub pipeline: u64,
}

impl CycleContext<'_> {
    fn record_response(&mut self, response: &[u8], start: Instant) {
        let Some(status) = http::status_code(response) else {
            self.stats.errors.status += 1;
            return;
        };
        self.stats.completed += 1;
        if status >= 400 {
            self.stats.errors.status += 1;
        }
        let elapsed = start.elapsed().as_micros() as u64;
        if !self.latency.record(elapsed) {
            self.stats.errors.timeout += 1;
        }
    }
}

pub(crate) struct Connection<T: Transport> {
    transport: T,
    phase: Phase,
    /// Outbound bytes for one cycle, `pipeline` copies of the request.
    request: Arc<[u8]>,
    written: usize,
    inbound: Vec<u8>,
    /// Bytes of `inbound` already attributed to framed responses.
    framed: usize,
    /// Responses still outstanding in this cycle.
    pending: u64,
    start: Instant,
}

impl<T: Transport> Connection<T> {
    pub fn new(transport: T, request: Arc<[u8]>) -> Self {
        Self {
            transport,
            phase: Phase::Connect,
            request,
            written: 0,
            inbound: Vec::new(),
            framed: 0,
            pending: 0,
            start: Instant::now(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Advances the state machine until an operation would block.
    pub fn drive(&mut self, cx: &mut CycleContext<'_>) -> Result<Drive, ConnectionError> {
        loop {
            match self.phase {
                Phase::Connect => match self
                    .transport
                    .connect_check()
                    .map_err(ConnectionError::Connect)?
                {
                    Step::Ready(()) => self.phase = Phase::Write,
                    Step::WouldBlock => return Ok(Drive::Pending),
                },
                Phase::Write => {
                    if !self.write(cx)? {
                        return Ok(Drive::Pending);
                    }
                    self.phase = Phase::Read;
                }
                Phase::Read => match self.read(cx)? {
                    ReadOutcome::Pending => return Ok(Drive::Pending),
                    ReadOutcome::Complete => self.phase = Phase::Connect,
                    ReadOutcome::Closed => {
                        self.phase = Phase::Connect;
                        return Ok(Drive::Closed);
                    }
                },
            }
        }
    }

    /// Returns `true` once the whole request has been sent.
    fn write(&mut self, cx: &mut CycleContext<'_>) -> Result<bool, ConnectionError> {
        if self.written == 0 {
            self.inbound.clear();
            self.framed = 0;
            self.start = Instant::now();
            self.pending = cx.pipeline;
        }

        while self.written < self.request.len() {
            match self
                .transport
                .write(&self.request[self.written..])
                .map_err(ConnectionError::Write)?
            {
                Step::Ready(n) => {
                    self.written += n;
                    cx.stats.bytes_sent += n as u64;
                }
                Step::WouldBlock => return Ok(false),
            }
        }
        Ok(true)
    }

    fn read(&mut self, cx: &mut CycleContext<'_>) -> Result<ReadOutcome, ConnectionError> {
        let mut eof = false;
        loop {
            match self.transport.read(&mut self.inbound) {
                Ok(Step::Ready(0)) => {
                    eof = true;
                    break;
                }
                Ok(Step::Ready(_)) => {}
                Ok(Step::WouldBlock) => break,
                // what already arrived still counts; the stream is finished either way
                Err(error) if !self.inbound.is_empty() => {
                    tracing::debug!(%error, buffered = self.inbound.len(), "Read failed after data");
                    eof = true;
                    break;
                }
                Err(error) => return Err(ConnectionError::Read(error)),
            }
        }

        if self.inbound.is_empty() {
            if eof {
                return Err(ConnectionError::Read(io::ErrorKind::UnexpectedEof.into()));
            }
            return Ok(ReadOutcome::Pending);
        }

        match cx.framing {
            Framing::Opportunistic => cx.record_response(&self.inbound, self.start),
            Framing::Strict => {
                while self.pending > 0 {
                    let Some(len) = http::framed_len(&self.inbound[self.framed..]) else {
                        break;
                    };
                    let end = self.framed + len;
                    cx.record_response(&self.inbound[self.framed..end], self.start);
                    self.framed = end;
                    self.pending -= 1;
                }
                if self.pending > 0 {
                    if eof {
                        return Err(ConnectionError::Read(io::ErrorKind::UnexpectedEof.into()));
                    }
                    return Ok(ReadOutcome::Pending);
                }
            }
        }

        cx.stats.bytes_received += self.inbound.len() as u64;
        self.written = 0;
        Ok(if eof {
            ReadOutcome::Closed
        } else {
            ReadOutcome::Complete
        })
    }
}

impl<T: Transport> Drop for Connection<T> {
    fn drop(&mut self) {
        self.transport.close();
    }
}
