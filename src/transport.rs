// Copyright 2020 Joyent, Inc.

//! Byte-stream transports. One connection carries exactly one call.
//!
//! Before the call frame the client writes a text preamble naming the target
//! and carrying request attributes:
//!
//! ```text
//! FAST/1 /calc?id=7\r\n
//! Authorization: Basic dXNlcjpwdw==\r\n
//! \r\n
//! ```
//!
//! and the server answers with a status preamble, `FAST/1 200 OK\r\n\r\n`,
//! before the reply frames. Any status other than 200 is followed by plain
//! text up to the end of the stream.

use std::collections::BTreeMap;
use std::io::{self, BufRead, BufReader, Cursor, Error, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use url::Url;

use crate::config::{Config, DEFAULT_PORT, URL_SCHEME};
use crate::error;
use crate::registry::Registry;

pub const PREAMBLE_VERSION: &str = "FAST/1";

pub const STATUS_OK: u16 = 200;
pub const STATUS_BAD_REQUEST: u16 = 400;
pub const STATUS_NOT_FOUND: u16 = 404;
pub const STATUS_SERVER_ERROR: u16 = 500;

pub const AUTHORIZATION: &str = "authorization";

pub fn reason(status: u16) -> &'static str {
    match status {
        STATUS_OK => "OK",
        STATUS_BAD_REQUEST => "Bad Request",
        STATUS_NOT_FOUND => "Not Found",
        STATUS_SERVER_ERROR => "Server Error",
        _ => "Error",
    }
}

/// Everything before the last `?`.
pub fn endpoint_of(url: &str) -> &str {
    match url.rfind('?') {
        Some(idx) => &url[..idx],
        None => url,
    }
}

/// Opens a fresh connection per call.
pub trait Transport: Send + Sync {
    fn open(&self, url: &str) -> Result<Box<dyn Connection>, error::Error>;
}

/// A single bidirectional exchange: attributes and a frame go out, a status
/// and a body come back.
pub trait Connection: Send {
    fn set_attribute(&mut self, name: &str, value: &str);

    /// Write the preamble and the frame, then flush.
    fn send(&mut self, frame: &[u8]) -> io::Result<()>;

    fn status(&mut self) -> io::Result<u16>;

    fn body(&mut self) -> &mut dyn Read;

    fn close(&mut self);
}

/// The request preamble as the server sees it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RequestHead {
    pub target: String,
    pub attributes: BTreeMap<String, String>,
}

impl RequestHead {
    pub fn new<T: Into<String>>(target: T) -> RequestHead {
        RequestHead {
            target: target.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn path(&self) -> &str {
        endpoint_of(&self.target)
    }

    pub fn object_id(&self) -> Option<&str> {
        let idx = self.target.rfind('?')?;
        self.target[idx + 1..].strip_prefix("id=")
    }

    /// Attribute names are case-insensitive.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn set_attribute(&mut self, name: &str, value: &str) {
        self.attributes
            .insert(name.to_ascii_lowercase(), String::from(value));
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(
            format!("{} {}\r\n", PREAMBLE_VERSION, self.target).as_bytes(),
        );
        for (name, value) in &self.attributes {
            buf.put_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        buf.put_slice(b"\r\n");
    }

    pub fn parse_request_line(line: &str) -> io::Result<String> {
        let mut parts = line.splitn(2, ' ');
        match (parts.next(), parts.next()) {
            (Some(PREAMBLE_VERSION), Some(target)) if target.starts_with('/') => {
                Ok(String::from(target))
            }
            _ => Err(Error::new(
                ErrorKind::InvalidData,
                format!("malformed request line: {:?}", line),
            )),
        }
    }

    pub fn parse_attribute_line(line: &str) -> io::Result<(String, String)> {
        match line.split_once(':') {
            Some((name, value)) => {
                Ok((name.trim().to_ascii_lowercase(), value.trim().to_string()))
            }
            None => Err(Error::new(
                ErrorKind::InvalidData,
                format!("malformed attribute line: {:?}", line),
            )),
        }
    }

    pub fn read_from<R: BufRead>(reader: &mut R) -> io::Result<RequestHead> {
        let line = read_line(reader)?;
        let mut head = RequestHead::new(RequestHead::parse_request_line(&line)?);
        loop {
            let line = read_line(reader)?;
            if line.is_empty() {
                return Ok(head);
            }
            let (name, value) = RequestHead::parse_attribute_line(&line)?;
            head.attributes.insert(name, value);
        }
    }
}

pub fn write_status(buf: &mut BytesMut, status: u16) {
    buf.put_slice(
        format!("{} {} {}\r\n\r\n", PREAMBLE_VERSION, status, reason(status))
            .as_bytes(),
    );
}

/// A complete non-success response: status preamble and plain text body.
pub fn status_reply(status: u16, message: &str) -> BytesMut {
    let mut buf = BytesMut::with_capacity(message.len() + 32);
    write_status(&mut buf, status);
    buf.put_slice(message.as_bytes());
    buf
}

pub fn parse_status_line(line: &str) -> io::Result<u16> {
    let mut parts = line.splitn(3, ' ');
    match (parts.next(), parts.next().map(str::parse::<u16>)) {
        (Some(PREAMBLE_VERSION), Some(Ok(status))) => Ok(status),
        _ => Err(Error::new(
            ErrorKind::InvalidData,
            format!("malformed status line: {:?}", line),
        )),
    }
}

/// Consume the status preamble, leaving the reader at the start of the body.
pub fn read_status<R: BufRead>(reader: &mut R) -> io::Result<u16> {
    let status = parse_status_line(&read_line(reader)?)?;
    while !read_line(reader)?.is_empty() {}
    Ok(status)
}

fn read_line<R: BufRead>(reader: &mut R) -> io::Result<String> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Err(Error::new(
            ErrorKind::UnexpectedEof,
            "stream closed before end of preamble",
        ));
    }
    Ok(line.trim_end_matches(|c| c == '\r' || c == '\n').to_string())
}

fn request_bytes(head: &RequestHead, frame: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(frame.len() + 128);
    head.encode(&mut buf);
    buf.put_slice(frame);
    buf
}

/// Blocking TCP, one connection per call.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
}

impl TcpTransport {
    pub fn new() -> TcpTransport {
        TcpTransport::default()
    }

    pub fn from_config(config: &Config) -> TcpTransport {
        TcpTransport {
            connect_timeout: config.connect_timeout(),
            read_timeout: config.read_timeout(),
        }
    }

    /// Split a `fast://host:port/path?id=...` URL into the socket address and
    /// the request target. The target is taken verbatim from the URL.
    pub fn address(url: &str) -> Result<(String, String), error::Error> {
        let parsed = Url::parse(url).map_err(|e| {
            error::Error::Config(format!("invalid url '{}': {}", url, e))
        })?;
        if parsed.scheme() != URL_SCHEME {
            return Err(error::Error::Config(format!(
                "unsupported url scheme '{}' in {}",
                parsed.scheme(),
                url
            )));
        }
        let host = parsed.host_str().ok_or_else(|| {
            error::Error::Config(format!("url has no host: {}", url))
        })?;
        let port = parsed.port().unwrap_or(DEFAULT_PORT);

        let authority_start = url.find("://").map(|i| i + 3).unwrap_or(0);
        let target = match url[authority_start..].find('/') {
            Some(idx) => String::from(&url[authority_start + idx..]),
            None => String::from("/"),
        };

        Ok((format!("{}:{}", host, port), target))
    }

    fn connect(&self, addr: &str) -> io::Result<TcpStream> {
        let stream = match self.connect_timeout {
            Some(timeout) => {
                let sockaddr = addr.to_socket_addrs()?.next().ok_or_else(|| {
                    Error::new(ErrorKind::NotFound, "address did not resolve")
                })?;
                TcpStream::connect_timeout(&sockaddr, timeout)?
            }
            None => TcpStream::connect(addr)?,
        };
        stream.set_read_timeout(self.read_timeout)?;
        Ok(stream)
    }
}

impl Transport for TcpTransport {
    fn open(&self, url: &str) -> Result<Box<dyn Connection>, error::Error> {
        let (addr, target) = TcpTransport::address(url)?;
        let stream = self
            .connect(&addr)
            .map_err(|e| error::Error::transport(url, e))?;

        Ok(Box::new(TcpConnection {
            head: RequestHead::new(target),
            stream: BufReader::new(stream),
            closed: false,
        }))
    }
}

struct TcpConnection {
    head: RequestHead,
    stream: BufReader<TcpStream>,
    closed: bool,
}

impl Connection for TcpConnection {
    fn set_attribute(&mut self, name: &str, value: &str) {
        self.head.set_attribute(name, value);
    }

    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        let buf = request_bytes(&self.head, frame);
        let stream = self.stream.get_mut();
        stream.write_all(&buf)?;
        stream.flush()
    }

    fn status(&mut self) -> io::Result<u16> {
        read_status(&mut self.stream)
    }

    fn body(&mut self) -> &mut dyn Read {
        &mut self.stream
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.stream.get_ref().shutdown(Shutdown::Both);
        }
    }
}

/// Serves calls in-process through the same byte format, against a local
/// [`Registry`].
#[derive(Clone)]
pub struct LoopbackTransport {
    registry: Arc<Registry>,
}

impl LoopbackTransport {
    pub fn new(registry: Arc<Registry>) -> LoopbackTransport {
        LoopbackTransport { registry }
    }
}

impl Transport for LoopbackTransport {
    fn open(&self, url: &str) -> Result<Box<dyn Connection>, error::Error> {
        let (_, target) = TcpTransport::address(url)?;

        Ok(Box::new(LoopbackConnection {
            head: RequestHead::new(target),
            registry: Arc::clone(&self.registry),
            response: Cursor::new(Vec::new()),
        }))
    }
}

struct LoopbackConnection {
    head: RequestHead,
    registry: Arc<Registry>,
    response: Cursor<Vec<u8>>,
}

impl Connection for LoopbackConnection {
    fn set_attribute(&mut self, name: &str, value: &str) {
        self.head.set_attribute(name, value);
    }

    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        let request = request_bytes(&self.head, frame);
        let response = self.registry.handle_request(&mut &request[..]);
        self.response = Cursor::new(response.to_vec());
        Ok(())
    }

    fn status(&mut self) -> io::Result<u16> {
        read_status(&mut self.response)
    }

    fn body(&mut self) -> &mut dyn Read {
        &mut self.response
    }

    fn close(&mut self) {
        self.response = Cursor::new(Vec::new());
    }
}
