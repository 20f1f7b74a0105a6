//! Datagram sources
//!
//! The stage only needs "next datagram, or nothing within the wait bound".
//! [`UdpDatagramSource`] provides it over a blocking UDP socket with a read
//! timeout; [`ScriptedSource`] replays a prepared sequence for tests.

use std::collections::VecDeque;
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use tracing::info;

/// Outcome of one bounded receive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// A datagram of the given length was written to the buffer
    Datagram(usize),
    /// Nothing arrived within the wait bound
    Timeout,
}

/// Capability to receive one datagram with a bounded wait
///
/// Any `Err` is a fatal transport failure.
pub trait DatagramSource {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Received>;
}

impl<S: DatagramSource + ?Sized> DatagramSource for &mut S {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Received> {
        (**self).recv(buf)
    }
}

impl<S: DatagramSource + ?Sized> DatagramSource for Box<S> {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Received> {
        (**self).recv(buf)
    }
}

/// Blocking UDP socket with a read timeout
#[derive(Debug)]
pub struct UdpDatagramSource {
    socket: UdpSocket,
}

impl UdpDatagramSource {
    /// Bind to `address:port` and set the receive wait bound
    pub fn bind(address: &str, port: u16, timeout: Duration) -> io::Result<Self> {
        let addr = (address, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    ErrorKind::InvalidInput,
                    format!("cannot resolve {}:{}", address, port),
                )
            })?;
        let socket = UdpSocket::bind(addr)?;
        // A zero duration is rejected by the OS; treat it as "shortest wait"
        socket.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;

        info!(address = %addr, timeout_ms = timeout.as_millis() as u64, "UDP source bound");
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl DatagramSource for UdpDatagramSource {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Received> {
        match self.socket.recv(buf) {
            Ok(n) => Ok(Received::Datagram(n)),
            // Unix reports an expired read timeout as WouldBlock, Windows as TimedOut
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Ok(Received::Timeout)
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(Received::Timeout),
            Err(e) => Err(e),
        }
    }
}

/// One scripted receive result
#[derive(Debug, Clone)]
pub enum Scripted {
    Datagram(Vec<u8>),
    Timeout,
    Error(ErrorKind),
}

/// Replays a fixed sequence of receive results
///
/// Once the script is exhausted every receive times out.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSource {
    script: VecDeque<Scripted>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Source that yields each datagram once, in order
    pub fn from_datagrams<I>(datagrams: I) -> Self
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        Self {
            script: datagrams.into_iter().map(Scripted::Datagram).collect(),
        }
    }

    pub fn push_datagram(&mut self, datagram: Vec<u8>) -> &mut Self {
        self.script.push_back(Scripted::Datagram(datagram));
        self
    }

    pub fn push_timeout(&mut self) -> &mut Self {
        self.script.push_back(Scripted::Timeout);
        self
    }

    pub fn push_error(&mut self, kind: ErrorKind) -> &mut Self {
        self.script.push_back(Scripted::Error(kind));
        self
    }

    /// Entries not yet consumed
    pub fn remaining(&self) -> usize {
        self.script.len()
    }
}

impl DatagramSource for ScriptedSource {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Received> {
        match self.script.pop_front() {
            Some(Scripted::Datagram(data)) => {
                // Same truncation a real socket applies to oversized datagrams
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(Received::Datagram(n))
            }
            Some(Scripted::Error(kind)) => Err(io::Error::new(kind, "scripted transport error")),
            Some(Scripted::Timeout) | None => Ok(Received::Timeout),
        }
    }
}
