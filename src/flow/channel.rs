//! Flow adapter for transport channels and other async byte streams.

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, watch};
use tracing::debug;

use super::{
    Flow, READ_BUFFER_SIZE, ReadOutcome, WriteOutcome, read_failed, shutdown_failed, signalled,
    write_failed,
};
use crate::registry::Registration;

/// How long `close` waits for a clean end-of-stream to be sent.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// A [`Flow`] over any `AsyncRead + AsyncWrite` stream.
///
/// The stream is split so that one task can read while another writes.
pub struct ChannelFlow {
    reader: Mutex<Reader>,
    writer: Mutex<Writer>,
    description: String,
    registration: Option<Registration>,
    closed: watch::Sender<bool>,
    read_closed: AtomicBool,
    write_closed: AtomicBool,
}

impl ChannelFlow {
    /// Wrap `io`, optionally tied to a registry entry.
    pub fn new<T>(io: T, description: impl Into<String>, registration: Option<Registration>) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        let (closed, _) = watch::channel(false);
        Self {
            reader: Mutex::new(Box::new(reader)),
            writer: Mutex::new(Box::new(writer)),
            description: description.into(),
            registration,
            closed,
            read_closed: AtomicBool::new(false),
            write_closed: AtomicBool::new(false),
        }
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl Flow for ChannelFlow {
    async fn read(&self) -> ReadOutcome {
        if self.is_closed() || self.read_closed.load(Ordering::Acquire) {
            return ReadOutcome::Eof;
        }
        let mut closed = self.closed.subscribe();
        let mut reader = tokio::select! {
            _ = signalled(&mut closed) => return ReadOutcome::Eof,
            reader = self.reader.lock() => reader,
        };
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let read = tokio::select! {
            _ = signalled(&mut closed) => return ReadOutcome::Eof,
            read = reader.read(&mut buf) => read,
        };
        match read {
            Ok(0) => ReadOutcome::Eof,
            Ok(n) => {
                buf.truncate(n);
                ReadOutcome::Data(Bytes::from(buf))
            }
            Err(e) => read_failed(&self.description, &e),
        }
    }

    async fn write(&self, buf: &[u8]) -> WriteOutcome {
        if self.is_closed() || self.write_closed.load(Ordering::Acquire) {
            return WriteOutcome::Eof;
        }
        let mut closed = self.closed.subscribe();
        let mut writer = tokio::select! {
            _ = signalled(&mut closed) => return WriteOutcome::Eof,
            writer = self.writer.lock() => writer,
        };
        let written = tokio::select! {
            _ = signalled(&mut closed) => return WriteOutcome::Eof,
            written = async {
                writer.write_all(buf).await?;
                writer.flush().await
            } => written,
        };
        match written {
            Ok(()) => WriteOutcome::Written,
            Err(e) => write_failed(&self.description, &e),
        }
    }

    async fn shutdown_read(&self) {
        // A byte stream has no read half to shut; stop delivering data.
        self.read_closed.store(true, Ordering::Release);
    }

    async fn shutdown_write(&self) {
        if self.write_closed.swap(true, Ordering::AcqRel) || self.is_closed() {
            return;
        }
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            shutdown_failed(&self.description, &e);
        }
    }

    async fn close(&self) {
        if self.closed.send_replace(true) {
            debug!("{}: already closed", self.description);
            return;
        }
        // Pending reads and writes bail out on the signal above, so the lock
        // is free shortly.
        if !self.write_closed.swap(true, Ordering::AcqRel) {
            let finish = async {
                let mut writer = self.writer.lock().await;
                writer.shutdown().await
            };
            match tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, finish).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => shutdown_failed(&self.description, &e),
                Err(_) => {
                    let e = io::Error::new(io::ErrorKind::TimedOut, "close timed out");
                    shutdown_failed(&self.description, &e);
                }
            }
        }
        if let Some(registration) = &self.registration {
            registration.release();
        }
    }

    fn description(&self) -> &str {
        &self.description
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionRegistry;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_read_write_over_duplex() {
        let (near, mut far) = tokio::io::duplex(1024);
        let flow = ChannelFlow::new(near, "channel:test", None);

        assert_eq!(flow.write(b"ping").await, WriteOutcome::Written);
        let mut buf = [0u8; 4];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        far.write_all(b"pong").await.unwrap();
        assert_eq!(flow.read().await, ReadOutcome::Data(Bytes::from_static(b"pong")));

        drop(far);
        assert_eq!(flow.read().await, ReadOutcome::Eof);
    }

    #[tokio::test]
    async fn test_shutdown_write_signals_eof() {
        let (near, mut far) = tokio::io::duplex(1024);
        let flow = ChannelFlow::new(near, "channel:test", None);
        flow.shutdown_write().await;
        flow.shutdown_write().await;
        let mut rest = Vec::new();
        far.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert_eq!(flow.write(b"late").await, WriteOutcome::Eof);
    }

    #[tokio::test]
    async fn test_close_wakes_reader_and_releases() {
        let registry = Arc::new(ConnectionRegistry::new());
        let registration = registry.acquire("channel:test").unwrap();
        let (near, _far) = tokio::io::duplex(1024);
        let flow = Arc::new(ChannelFlow::new(near, "channel:test", Some(registration)));

        let reading = {
            let flow = Arc::clone(&flow);
            tokio::spawn(async move { flow.read().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        flow.close().await;
        flow.close().await;

        assert_eq!(reading.await.unwrap(), ReadOutcome::Eof);
        assert!(flow.is_closed());
        assert!(registry.is_empty());
    }
}
