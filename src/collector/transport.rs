//! Byte-stream transports between the DAQ and the FEBs
//!
//! The collector only needs "give me up to N bytes, or tell me nothing
//! arrived". [`TcpConnector`] provides that over `std::net::TcpStream` with a
//! read timeout; [`ScriptedConnector`] replays canned byte chunks in memory.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use tracing::debug;

use crate::source::SourceEndpoint;

/// Outcome of one receive attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// `n` bytes (always > 0) were copied into the buffer
    Data(usize),
    /// Nothing arrived within the read timeout
    Idle,
    /// The peer closed the stream
    Closed,
}

/// Connected byte stream from one FEB
pub trait SourceTransport: Send {
    /// Receive up to `buf.len()` bytes
    fn receive(&mut self, buf: &mut [u8]) -> io::Result<Received>;
}

/// Opens transports to FEB endpoints
pub trait Connector: Sync {
    fn connect(&self, endpoint: &SourceEndpoint) -> io::Result<Box<dyn SourceTransport>>;
}

// =============================================================================
// TCP
// =============================================================================

/// Connects to FEBs over TCP
#[derive(Debug, Clone)]
pub struct TcpConnector {
    /// Bound on one receive call; lets one thread round-robin many sockets
    ///
    /// A quiet source delays the others on its collector by up to this much
    /// per pass, see `Config::poll_timeout`.
    pub read_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(10),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl TcpConnector {
    pub fn new(read_timeout: Duration) -> Self {
        Self {
            read_timeout,
            ..Default::default()
        }
    }
}

impl Connector for TcpConnector {
    fn connect(&self, endpoint: &SourceEndpoint) -> io::Result<Box<dyn SourceTransport>> {
        let mut last_error = None;
        for addr in (endpoint.host.as_str(), endpoint.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    stream.set_read_timeout(Some(self.read_timeout))?;
                    debug!(endpoint = %endpoint, peer = %addr, "Connected");
                    return Ok(Box::new(TcpTransport { stream }));
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{endpoint} did not resolve to any address"),
            )
        }))
    }
}

struct TcpTransport {
    stream: TcpStream,
}

impl SourceTransport for TcpTransport {
    fn receive(&mut self, buf: &mut [u8]) -> io::Result<Received> {
        match self.stream.read(buf) {
            Ok(0) => Ok(Received::Closed),
            Ok(n) => Ok(Received::Data(n)),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(Received::Idle)
            }
            Err(e) => Err(e),
        }
    }
}

// =============================================================================
// In-memory
// =============================================================================

/// Canned byte stream for one endpoint
#[derive(Debug, Clone, Default)]
pub struct Script {
    chunks: VecDeque<Bytes>,
    close_at_end: bool,
    fail_at_end: bool,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one chunk; it may be delivered over several receive calls
    pub fn chunk(mut self, bytes: impl Into<Bytes>) -> Self {
        self.chunks.push_back(bytes.into());
        self
    }

    /// Report `Closed` once every chunk has been delivered (default: `Idle`)
    pub fn then_close(mut self) -> Self {
        self.close_at_end = true;
        self
    }

    /// Report a connection reset once every chunk has been delivered
    pub fn then_fail(mut self) -> Self {
        self.fail_at_end = true;
        self
    }
}

impl SourceTransport for Script {
    fn receive(&mut self, buf: &mut [u8]) -> io::Result<Received> {
        let Some(front) = self.chunks.front_mut() else {
            if self.fail_at_end {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "scripted failure"));
            }
            if self.close_at_end {
                return Ok(Received::Closed);
            }
            std::thread::sleep(Duration::from_millis(1));
            return Ok(Received::Idle);
        };

        let n = front.len().min(buf.len());
        buf[..n].copy_from_slice(&front[..n]);
        front.advance(n);
        if front.is_empty() {
            self.chunks.pop_front();
        }
        Ok(Received::Data(n))
    }
}

/// Hands out pre-registered [`Script`]s by endpoint
///
/// Each script can be connected once; unknown endpoints are refused.
#[derive(Debug, Default)]
pub struct ScriptedConnector {
    scripts: Mutex<HashMap<SourceEndpoint, Script>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(self, endpoint: SourceEndpoint, script: Script) -> Self {
        self.scripts.lock().insert(endpoint, script);
        self
    }
}

impl Connector for ScriptedConnector {
    fn connect(&self, endpoint: &SourceEndpoint) -> io::Result<Box<dyn SourceTransport>> {
        match self.scripts.lock().remove(endpoint) {
            Some(script) => Ok(Box::new(script)),
            None => Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("no script registered for {endpoint}"),
            )),
        }
    }
}
