//! Byte-oriented transport under the comm handler. A link carries no
//! framing: it moves bytes and classifies its failures as transient (worth a
//! close-and-reopen cycle) or fatal (the device handler goes to LinkDown).

use std::collections::VecDeque;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::{self, ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::info;
use serialport::SerialPort;
use thiserror::Error;

use crate::config::LinkConfig;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(2000);
const SERIAL_POLL_TIMEOUT: Duration = Duration::from_millis(1);

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("transient link error: {0}")]
    Transient(#[source] io::Error),
    #[error("fatal link error: {0}")]
    Fatal(#[source] io::Error),
}

impl LinkError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, LinkError::Fatal(_))
    }

    fn classify(err: io::Error) -> LinkError {
        match err.kind() {
            ErrorKind::NotFound
            | ErrorKind::PermissionDenied
            | ErrorKind::InvalidInput
            | ErrorKind::AddrNotAvailable
            | ErrorKind::Unsupported => LinkError::Fatal(err),
            _ => LinkError::Transient(err),
        }
    }
}

/// Full-duplex byte conduit. `read_nonblocking` and `write` never block the
/// event loop; both report zero bytes when the other side has nothing for
/// us, or no room.
pub trait Link: Send {
    fn open(&mut self) -> Result<(), LinkError>;
    fn close(&mut self);
    fn read_nonblocking(&mut self, buf: &mut [u8]) -> Result<usize, LinkError>;
    fn write(&mut self, buf: &[u8]) -> Result<usize, LinkError>;
    fn operational(&self) -> bool;
    fn config_hash(&self) -> u64;
}

pub fn create_link(config: &LinkConfig) -> Option<Box<dyn Link>> {
    match config {
        LinkConfig::Serial { port, baud } => Some(Box::new(SerialLink::new(port.clone(), *baud))),
        LinkConfig::Udp { host, port } => Some(Box::new(UdpLink::new(host.clone(), *port))),
        LinkConfig::Tcp { host, port } => Some(Box::new(TcpLink::new(host.clone(), *port))),
        LinkConfig::Rtt { host, port } => Some(Box::new(RttLink::new(host.clone(), *port))),
        LinkConfig::None => None,
    }
}

fn hash_of(value: &impl Hash) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

fn nonblocking_read_result(result: io::Result<usize>) -> Result<usize, LinkError> {
    match result {
        // a zero-length read on a stream means the peer went away
        Ok(0) => Err(LinkError::Transient(io::Error::new(
            ErrorKind::UnexpectedEof,
            "connection closed by peer",
        ))),
        Ok(n) => Ok(n),
        Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(0),
        Err(e) if e.kind() == ErrorKind::Interrupted => Ok(0),
        Err(e) => Err(LinkError::classify(e)),
    }
}

fn nonblocking_write_result(result: io::Result<usize>) -> Result<usize, LinkError> {
    match result {
        Ok(n) => Ok(n),
        Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => Ok(0),
        Err(e) => Err(LinkError::classify(e)),
    }
}

pub struct TcpLink {
    host: String,
    port: u16,
    stream: Option<TcpStream>,
}

impl TcpLink {
    pub fn new(host: String, port: u16) -> Self {
        TcpLink {
            host,
            port,
            stream: None,
        }
    }
}

impl Link for TcpLink {
    fn open(&mut self) -> Result<(), LinkError> {
        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(LinkError::Fatal)?
            .next()
            .ok_or_else(|| {
                LinkError::Fatal(io::Error::new(
                    ErrorKind::AddrNotAvailable,
                    "hostname did not resolve",
                ))
            })?;
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).map_err(LinkError::classify)?;
        stream.set_nonblocking(true).map_err(LinkError::Fatal)?;
        stream.set_nodelay(true).ok();
        info!("tcp link connected to {addr}");
        self.stream = Some(stream);
        Ok(())
    }

    fn close(&mut self) {
        self.stream = None;
    }

    fn read_nonblocking(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        match &mut self.stream {
            Some(stream) => nonblocking_read_result(stream.read(buf)),
            None => Ok(0),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, LinkError> {
        match &mut self.stream {
            Some(stream) => nonblocking_write_result(stream.write(buf)),
            None => Ok(0),
        }
    }

    fn operational(&self) -> bool {
        self.stream.is_some()
    }

    fn config_hash(&self) -> u64 {
        hash_of(&("tcp", &self.host, self.port))
    }
}

/// Datagram boundaries are ignored: received datagrams are treated as a byte
/// stream and concatenated by the comm handler.
pub struct UdpLink {
    host: String,
    port: u16,
    socket: Option<UdpSocket>,
}

impl UdpLink {
    pub fn new(host: String, port: u16) -> Self {
        UdpLink {
            host,
            port,
            socket: None,
        }
    }
}

impl Link for UdpLink {
    fn open(&mut self) -> Result<(), LinkError> {
        let socket = UdpSocket::bind("0.0.0.0:0").map_err(LinkError::classify)?;
        socket
            .connect((self.host.as_str(), self.port))
            .map_err(LinkError::classify)?;
        socket.set_nonblocking(true).map_err(LinkError::Fatal)?;
        info!("udp link bound for {}:{}", self.host, self.port);
        self.socket = Some(socket);
        Ok(())
    }

    fn close(&mut self) {
        self.socket = None;
    }

    fn read_nonblocking(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        match &self.socket {
            Some(socket) => match socket.recv(buf) {
                Ok(n) => Ok(n),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                    Ok(0)
                }
                // ICMP unreachable surfaces here on connected sockets
                Err(e) if e.kind() == ErrorKind::ConnectionRefused => Ok(0),
                Err(e) => Err(LinkError::classify(e)),
            },
            None => Ok(0),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, LinkError> {
        match &self.socket {
            Some(socket) => nonblocking_write_result(socket.send(buf)),
            None => Ok(0),
        }
    }

    fn operational(&self) -> bool {
        self.socket.is_some()
    }

    fn config_hash(&self) -> u64 {
        hash_of(&("udp", &self.host, self.port))
    }
}

/// RTT reached through a SEGGER-style telnet bridge; on the wire it is a TCP
/// byte stream like any other.
pub struct RttLink {
    inner: TcpLink,
}

impl RttLink {
    pub fn new(host: String, port: u16) -> Self {
        RttLink {
            inner: TcpLink::new(host, port),
        }
    }
}

impl Link for RttLink {
    fn open(&mut self) -> Result<(), LinkError> {
        self.inner.open()
    }

    fn close(&mut self) {
        self.inner.close()
    }

    fn read_nonblocking(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        self.inner.read_nonblocking(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, LinkError> {
        self.inner.write(buf)
    }

    fn operational(&self) -> bool {
        self.inner.operational()
    }

    fn config_hash(&self) -> u64 {
        hash_of(&("rtt", &self.inner.host, self.inner.port))
    }
}

pub struct SerialLink {
    port_name: String,
    baud: u32,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialLink {
    pub fn new(port_name: String, baud: u32) -> Self {
        SerialLink {
            port_name,
            baud,
            port: None,
        }
    }
}

impl Link for SerialLink {
    fn open(&mut self) -> Result<(), LinkError> {
        let port = serialport::new(&self.port_name, self.baud)
            .timeout(SERIAL_POLL_TIMEOUT)
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => {
                    LinkError::Fatal(io::Error::new(ErrorKind::NotFound, e))
                }
                _ => LinkError::Transient(io::Error::other(e)),
            })?;
        info!("serial link opened on {} at {} baud", self.port_name, self.baud);
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        self.port = None;
    }

    fn read_nonblocking(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        match &mut self.port {
            Some(port) => match port.read(buf) {
                Ok(n) => Ok(n),
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => Ok(0),
                Err(e) => Err(LinkError::classify(e)),
            },
            None => Ok(0),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, LinkError> {
        match &mut self.port {
            Some(port) => nonblocking_write_result(port.write(buf)),
            None => Ok(0),
        }
    }

    fn operational(&self) -> bool {
        self.port.is_some()
    }

    fn config_hash(&self) -> u64 {
        hash_of(&("serial", &self.port_name, self.baud))
    }
}

#[derive(Default)]
struct DummyPipes {
    a_to_b: VecDeque<u8>,
    b_to_a: VecDeque<u8>,
}

/// In-memory loopback used by tests: two crossed byte queues.
pub struct DummyLink {
    pipes: Arc<Mutex<DummyPipes>>,
    is_side_a: bool,
    open: bool,
}

impl DummyLink {
    pub fn pair() -> (DummyLink, DummyLink) {
        let pipes = Arc::new(Mutex::new(DummyPipes::default()));
        (
            DummyLink {
                pipes: pipes.clone(),
                is_side_a: true,
                open: false,
            },
            DummyLink {
                pipes,
                is_side_a: false,
                open: false,
            },
        )
    }
}

impl Link for DummyLink {
    fn open(&mut self) -> Result<(), LinkError> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn read_nonblocking(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        if !self.open {
            return Ok(0);
        }
        let mut pipes = self.pipes.lock().unwrap();
        let queue = if self.is_side_a {
            &mut pipes.b_to_a
        } else {
            &mut pipes.a_to_b
        };
        let mut n = 0;
        while n < buf.len() {
            match queue.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, LinkError> {
        if !self.open {
            return Ok(0);
        }
        let mut pipes = self.pipes.lock().unwrap();
        let queue = if self.is_side_a {
            &mut pipes.a_to_b
        } else {
            &mut pipes.b_to_a
        };
        queue.extend(buf.iter().copied());
        Ok(buf.len())
    }

    fn operational(&self) -> bool {
        self.open
    }

    fn config_hash(&self) -> u64 {
        hash_of(&(Arc::as_ptr(&self.pipes) as usize))
    }
}
