// Copyright 2025 rdcap Authors
// SPDX-License-Identifier: Apache-2.0

//! Framed TCP connection
//!
//! A reliable bidirectional byte stream with typed send/recv helpers for
//! the capture protocol: message-type tags, big-endian integers,
//! length-prefixed strings, and buffered file transfer.
//!
//! The stream is not packet-framed; the message layouts themselves
//! determine boundaries. Short reads loop until the requested buffer is
//! filled, and a peer close mid-message surfaces as a hard error.

use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::message::MessageType;
use crate::{ProtocolError, Result};

/// Chunk size for buffered file transfer.
const FILE_CHUNK_SIZE: usize = 4096;

/// Upper bound on length-prefixed string fields. Paths and counter names
/// are far below this; anything larger indicates a corrupt stream.
const MAX_STRING_LEN: usize = 64 * 1024;

/// Interval at which a pending accept re-checks for an incoming
/// connection within its poll window.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A connected protocol stream.
pub struct Connection {
    stream: TcpStream,
}

impl Connection {
    /// Connect to a listening capture service.
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port))?;
        stream.set_nodelay(true).ok();
        Ok(Self { stream })
    }

    fn from_stream(stream: TcpStream) -> Self {
        stream.set_nodelay(true).ok();
        Self { stream }
    }

    /// Send the full buffer, looping on partial writes.
    pub fn send_bytes(&mut self, buf: &[u8]) -> Result<()> {
        self.stream.write_all(buf)?;
        Ok(())
    }

    /// Fill the full buffer, looping on short reads. A peer close before
    /// the buffer is filled is reported as an error.
    pub fn recv_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        self.stream.read_exact(buf)?;
        Ok(())
    }

    /// Send a one-byte message-type tag.
    pub fn send_message_type(&mut self, tag: MessageType) -> Result<()> {
        self.send_bytes(&[tag as u8])
    }

    /// Receive a one-byte message-type tag.
    ///
    /// Returns `None` on a clean peer close at a message boundary.
    pub fn recv_message_type(&mut self) -> Result<Option<MessageType>> {
        let mut buf = [0u8; 1];
        match self.stream.read_exact(&mut buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        Ok(Some(MessageType::try_from(buf[0])?))
    }

    /// Send a big-endian `u32`.
    pub fn send_u32(&mut self, value: u32) -> Result<()> {
        self.send_bytes(&value.to_be_bytes())
    }

    /// Receive a big-endian `u32`.
    pub fn recv_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.recv_bytes(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    /// Send a length-prefixed string: `u32` big-endian byte count, then
    /// the raw UTF-8 bytes.
    pub fn send_string(&mut self, s: &str) -> Result<()> {
        if s.len() > MAX_STRING_LEN {
            return Err(ProtocolError::StringTooLong(s.len()));
        }
        self.send_u32(s.len() as u32)?;
        self.send_bytes(s.as_bytes())
    }

    /// Receive a length-prefixed string.
    pub fn read_string(&mut self) -> Result<String> {
        let len = self.recv_u32()? as usize;
        if len > MAX_STRING_LEN {
            return Err(ProtocolError::StringTooLong(len));
        }
        let mut buf = vec![0u8; len];
        self.recv_bytes(&mut buf)?;
        Ok(String::from_utf8(buf)?)
    }

    /// Stream the contents of a file to the peer in buffered chunks.
    ///
    /// The caller is expected to have announced the byte count already;
    /// only the raw contents cross the wire here.
    pub fn send_file<P: AsRef<Path>>(&mut self, path: P) -> Result<u64> {
        let path = path.as_ref();
        let mut file = File::open(path)
            .map_err(|_| ProtocolError::BadCaptureFile(path.display().to_string()))?;
        let mut buf = [0u8; FILE_CHUNK_SIZE];
        let mut sent: u64 = 0;
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            self.send_bytes(&buf[..n])?;
            sent += n as u64;
        }
        debug!("sent {} bytes of {}", sent, path.display());
        Ok(sent)
    }

    /// Receive exactly `size` bytes from the peer into a file at `path`.
    pub fn receive_file<P: AsRef<Path>>(&mut self, path: P, size: u64) -> Result<()> {
        let path = path.as_ref();
        let mut file = File::create(path)?;
        let mut buf = [0u8; FILE_CHUNK_SIZE];
        let mut left = size;
        while left > 0 {
            let want = left.min(FILE_CHUNK_SIZE as u64) as usize;
            self.recv_bytes(&mut buf[..want])?;
            file.write_all(&buf[..want])?;
            left -= want as u64;
        }
        debug!("received {} bytes into {}", size, path.display());
        Ok(())
    }

    /// Shut down both directions of the stream. Any blocked peer I/O
    /// surfaces as an error on its next operation.
    pub fn shutdown(&self) {
        self.stream.shutdown(std::net::Shutdown::Both).ok();
    }
}

/// A listening socket with poll-style accept.
///
/// The listener is kept non-blocking so the accept loop can observe a
/// shutdown flag between waits instead of parking forever in `accept`.
pub struct Listener {
    inner: TcpListener,
    port: u16,
}

impl Listener {
    /// Bind on `host:port`. Port 0 requests an ephemeral port; the bound
    /// port is available via [`Listener::local_port`].
    pub fn bind(host: &str, port: u16) -> Result<Self> {
        let inner = TcpListener::bind((host, port))?;
        inner.set_nonblocking(true)?;
        let port = inner.local_addr()?.port();
        debug!("listening on {}:{}", host, port);
        Ok(Self { inner, port })
    }

    /// The port this listener is bound on.
    pub fn local_port(&self) -> u16 {
        self.port
    }

    /// Wait up to `timeout` for an incoming connection.
    ///
    /// Returns `Ok(None)` when the window elapses without a connection,
    /// which gives the caller a chance to observe its shutdown flag.
    pub fn accept(&self, timeout: Duration) -> Result<Option<Connection>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.inner.accept() {
                Ok((stream, peer)) => {
                    debug!("accepted connection from {}", peer);
                    stream.set_nonblocking(false)?;
                    return Ok(Some(Connection::from_stream(stream)));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    std::thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => {
                    warn!("accept failed: {}", e);
                    return Err(e.into());
                }
            }
        }
    }
}
