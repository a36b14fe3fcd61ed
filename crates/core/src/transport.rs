//! Byte stream abstraction driven by the connection state machine.
//!
//! A [`Connector`] opens non-blocking [`Transport`]s towards the target; the worker is
//! generic over the connector so alternative transports (e.g. an encrypted one) plug in
//! without touching the event loop.

use std::{
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr},
};

use mio::{event::Source, net::TcpStream, Interest, Registry, Token};

/// Size of each read issued against the socket.
pub(crate) const RECV_CHUNK: usize = 8192;

/// Outcome of a non-blocking transport operation that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step<T> {
    Ready(T),
    WouldBlock,
}

pub trait Transport: Send {
    /// Confirms the stream can carry the next request.
    fn connect_check(&mut self) -> io::Result<Step<()>>;

    /// Writes a prefix of `buf`, returning how many bytes were accepted.
    fn write(&mut self, buf: &[u8]) -> io::Result<Step<usize>>;

    /// Appends whatever is immediately readable to `buf`; `Ready(0)` signals end of stream.
    fn read(&mut self, buf: &mut Vec<u8>) -> io::Result<Step<usize>>;

    /// Releases the stream. Called once, when the owning connection is dropped.
    fn close(&mut self);
}

pub trait Connector: Send + Sync + 'static {
    type Transport: Transport + Source;

    /// Starts a non-blocking connection to `addr`.
    fn connect(&self, addr: SocketAddr) -> io::Result<Self::Transport>;
}

/// Plain TCP connector.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainConnector;

impl Connector for PlainConnector {
    type Transport = PlainTransport;

    fn connect(&self, addr: SocketAddr) -> io::Result<PlainTransport> {
        let stream = TcpStream::connect(addr)?;
        Ok(PlainTransport {
            stream,
            established: false,
        })
    }
}

#[derive(Debug)]
pub struct PlainTransport {
    stream: TcpStream,
    established: bool,
}

impl Transport for PlainTransport {
    fn connect_check(&mut self) -> io::Result<Step<()>> {
        if self.established {
            return Ok(Step::Ready(()));
        }
        if let Some(err) = self.stream.take_error()? {
            return Err(err);
        }
        match self.stream.peer_addr() {
            Ok(_) => {
                self.established = true;
                if let Err(error) = self.stream.set_nodelay(true) {
                    tracing::debug!(%error, "Failed to set TCP_NODELAY");
                }
                Ok(Step::Ready(()))
            }
            Err(err)
                if err.kind() == io::ErrorKind::NotConnected
                    || err.kind() == io::ErrorKind::WouldBlock =>
            {
                Ok(Step::WouldBlock)
            }
            Err(err) => Err(err),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<Step<usize>> {
        loop {
            match self.stream.write(buf) {
                Ok(0) if !buf.is_empty() => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => return Ok(Step::Ready(n)),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(Step::WouldBlock),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }

    fn read(&mut self, buf: &mut Vec<u8>) -> io::Result<Step<usize>> {
        let mut chunk = [0u8; RECV_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    return Ok(Step::Ready(n));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(Step::WouldBlock),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }

    fn close(&mut self) {
        // the descriptor itself is released when the stream drops
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl Source for PlainTransport {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        self.stream.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.stream.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.stream.deregister(registry)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted in-memory transport for exercising the state machine without sockets.

    use std::{
        collections::VecDeque,
        sync::{atomic::AtomicUsize, Arc},
    };

    use super::*;

    #[derive(Debug)]
    pub(crate) enum ReadEvent {
        Data(Vec<u8>),
        WouldBlock,
        Eof,
        Fail(io::ErrorKind),
    }

    #[derive(Debug, Default)]
    pub(crate) struct ScriptedTransport {
        pub fail_connect: bool,
        /// Caps how many bytes a single write accepts.
        pub write_limit: Option<usize>,
        pub written: Vec<u8>,
        pub reads: VecDeque<ReadEvent>,
        pub closed: Arc<AtomicUsize>,
    }

    impl ScriptedTransport {
        pub fn responding<B: AsRef<[u8]>>(chunks: &[B]) -> Self {
            let mut transport = Self::default();
            for chunk in chunks {
                transport.push_response(chunk.as_ref());
            }
            transport
        }

        /// Queues `data` followed by a would-block.
        pub fn push_response(&mut self, data: &[u8]) {
            self.reads.push_back(ReadEvent::Data(data.to_vec()));
            self.reads.push_back(ReadEvent::WouldBlock);
        }
    }

    impl Transport for ScriptedTransport {
        fn connect_check(&mut self) -> io::Result<Step<()>> {
            if self.fail_connect {
                return Err(io::ErrorKind::ConnectionRefused.into());
            }
            Ok(Step::Ready(()))
        }

        fn write(&mut self, buf: &[u8]) -> io::Result<Step<usize>> {
            let n = self.write_limit.map_or(buf.len(), |l| l.min(buf.len()));
            if n == 0 {
                return Ok(Step::WouldBlock);
            }
            self.written.extend_from_slice(&buf[..n]);
            Ok(Step::Ready(n))
        }

        fn read(&mut self, buf: &mut Vec<u8>) -> io::Result<Step<usize>> {
            match self.reads.pop_front() {
                Some(ReadEvent::Data(data)) => {
                    buf.extend_from_slice(&data);
                    Ok(Step::Ready(data.len()))
                }
                Some(ReadEvent::Eof) => Ok(Step::Ready(0)),
                Some(ReadEvent::Fail(kind)) => Err(kind.into()),
                Some(ReadEvent::WouldBlock) | None => Ok(Step::WouldBlock),
            }
        }

        fn close(&mut self) {
            self.closed
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }
}
