//! Stream flow shared by TCP and Unix domain sockets.

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

use super::{
    Flow, READ_BUFFER_SIZE, ReadOutcome, WriteOutcome, read_failed, shutdown_failed, write_failed,
};
use crate::registry::Registration;

/// Readiness-based I/O on a connected stream socket.
///
/// Implemented for `tokio::net::TcpStream` and `tokio::net::UnixStream`.
#[async_trait]
pub trait StreamSocket: Send + Sync + 'static {
    /// Wait until the socket may be readable.
    async fn wait_readable(&self) -> io::Result<()>;
    /// Wait until the socket may be writable.
    async fn wait_writable(&self) -> io::Result<()>;
    /// Non-blocking read.
    fn try_read_buf(&self, buf: &mut [u8]) -> io::Result<usize>;
    /// Non-blocking write.
    fn try_write_buf(&self, buf: &[u8]) -> io::Result<usize>;
    /// Half or full close of the native socket.
    fn shutdown_socket(&self, how: Shutdown) -> io::Result<()>;
}

/// A connected stream socket bound to a registry entry.
pub struct StreamFlow<S: StreamSocket> {
    socket: S,
    description: String,
    registration: Registration,
    closed: AtomicBool,
    read_closed: AtomicBool,
    write_closed: AtomicBool,
}

impl<S: StreamSocket> StreamFlow<S> {
    pub(crate) fn new(socket: S, description: String, registration: Registration) -> Self {
        Self {
            socket,
            description,
            registration,
            closed: AtomicBool::new(false),
            read_closed: AtomicBool::new(false),
            write_closed: AtomicBool::new(false),
        }
    }

    /// The underlying socket.
    pub fn socket(&self) -> &S {
        &self.socket
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn shutdown(&self, how: Shutdown) {
        if let Err(e) = self.socket.shutdown_socket(how) {
            shutdown_failed(&self.description, &e);
        }
    }
}

#[async_trait]
impl<S: StreamSocket> Flow for StreamFlow<S> {
    async fn read(&self) -> ReadOutcome {
        if self.is_closed() || self.read_closed.load(Ordering::Acquire) {
            return ReadOutcome::Eof;
        }
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            if let Err(e) = self.socket.wait_readable().await {
                return read_failed(&self.description, &e);
            }
            match self.socket.try_read_buf(&mut buf) {
                Ok(0) => return ReadOutcome::Eof,
                Ok(n) => {
                    buf.truncate(n);
                    return ReadOutcome::Data(Bytes::from(buf));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return read_failed(&self.description, &e),
            }
        }
    }

    async fn write(&self, buf: &[u8]) -> WriteOutcome {
        if self.is_closed() || self.write_closed.load(Ordering::Acquire) {
            return WriteOutcome::Eof;
        }
        let mut written = 0;
        while written < buf.len() {
            if let Err(e) = self.socket.wait_writable().await {
                return write_failed(&self.description, &e);
            }
            match self.socket.try_write_buf(&buf[written..]) {
                Ok(0) => {
                    let e = io::Error::from(io::ErrorKind::WriteZero);
                    return write_failed(&self.description, &e);
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return write_failed(&self.description, &e),
            }
        }
        WriteOutcome::Written
    }

    async fn shutdown_read(&self) {
        if !self.read_closed.swap(true, Ordering::AcqRel) {
            self.shutdown(Shutdown::Read);
        }
    }

    async fn shutdown_write(&self) {
        if !self.write_closed.swap(true, Ordering::AcqRel) {
            self.shutdown(Shutdown::Write);
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("{}: already closed", self.description);
            return;
        }
        // Wakes any task blocked in read/write on this socket.
        self.shutdown(Shutdown::Both);
        self.registration.release();
    }

    fn description(&self) -> &str {
        &self.description
    }
}
