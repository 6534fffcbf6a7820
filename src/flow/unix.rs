//! Unix domain stream flows and servers.

use async_trait::async_trait;
use nix::sys::stat::{SFlag, stat};
use socket2::SockRef;
use std::io;
use std::net::Shutdown;
use std::os::unix::fs::DirBuilderExt;
use std::future::poll_fn;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::stream::{StreamFlow, StreamSocket};
use super::{
    Flow, FlowError, FlowResult, StreamListener, UNKNOWN_PEER, connect_within, is_listener_fault,
    lock, signalled,
};
use crate::registry::{ConnectionRegistry, Registration};

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

#[async_trait]
impl StreamSocket for UnixStream {
    async fn wait_readable(&self) -> io::Result<()> {
        self.readable().await
    }

    async fn wait_writable(&self) -> io::Result<()> {
        self.writable().await
    }

    fn try_read_buf(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.try_read(buf)
    }

    fn try_write_buf(&self, buf: &[u8]) -> io::Result<usize> {
        self.try_write(buf)
    }

    fn shutdown_socket(&self, how: Shutdown) -> io::Result<()> {
        SockRef::from(self).shutdown(how)
    }
}

/// A connected Unix domain stream flow.
pub type UnixFlow = StreamFlow<UnixStream>;

impl StreamFlow<UnixStream> {
    /// Connect to the socket at `path`.
    ///
    /// # Errors
    ///
    /// [`FlowError::TooManyConnections`] or [`FlowError::Connect`].
    pub async fn connect(path: &Path, registry: &Arc<ConnectionRegistry>) -> FlowResult<Self> {
        let description = format!("unix:{}", path.display());
        let registration = registry.acquire(description.clone())?;
        let stream = UnixStream::connect(path)
            .await
            .map_err(|source| FlowError::Connect {
                peer: path.display().to_string(),
                source,
            })?;
        Ok(Self::new(stream, description, registration))
    }

    /// Connect to the socket at `path`, giving up after `timeout`.
    pub async fn connect_timeout(
        path: &Path,
        timeout: Duration,
        registry: &Arc<ConnectionRegistry>,
    ) -> FlowResult<Self> {
        let peer = path.display().to_string();
        connect_within(&peer, timeout, Self::connect(path, registry)).await
    }
}

/// Whether `path` may be unlinked before binding: it is absent or a socket.
pub(crate) fn is_safe_to_remove(path: &Path) -> bool {
    match stat(path) {
        Ok(st) => SFlag::from_bits_truncate(st.st_mode) & SFlag::S_IFMT == SFlag::S_IFSOCK,
        Err(nix::errno::Errno::ENOENT) => true,
        // Cannot stat: something is wrong, leave it alone.
        Err(_) => false,
    }
}

/// Device and inode of a filesystem entry.
type FileId = (libc::dev_t, libc::ino_t);

fn file_id(path: &Path) -> Option<FileId> {
    stat(path).ok().map(|st| (st.st_dev, st.st_ino))
}

/// Remove a stale socket at `path`, refusing to touch anything else.
fn remove_existing_socket(path: &Path) -> FlowResult<()> {
    if !is_safe_to_remove(path) {
        return Err(FlowError::UnsafePath(path.to_path_buf()));
    }
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!("Removed stale socket {:?}", path);
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(FlowError::Io(e)),
    }
}

/// A listening Unix domain socket server.
///
/// Closing or dropping the server closes the listening socket and removes
/// the socket file, unless the file at that path is no longer the one this
/// server created.
pub struct UnixServer {
    listener: Mutex<Option<UnixListener>>,
    path: PathBuf,
    owned_file: Mutex<Option<FileId>>,
    registry: Arc<ConnectionRegistry>,
    registration: Registration,
    closed: watch::Sender<bool>,
}

impl UnixServer {
    /// Bind a listening socket at `path`.
    ///
    /// A stale socket at `path` is replaced. Any other kind of file there is
    /// left untouched and the bind fails with [`FlowError::UnsafePath`].
    /// Missing parent directories are created. The listening socket is
    /// registered without checking the connection ceiling.
    pub fn bind(path: &Path, registry: &Arc<ConnectionRegistry>) -> FlowResult<Self> {
        remove_existing_socket(path)?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(parent)?;
        }

        let listener = UnixListener::bind(path).map_err(|source| FlowError::Bind {
            address: path.display().to_string(),
            source,
        })?;
        let owned_file = file_id(path);
        if owned_file.is_none() {
            debug!("Cannot stat {:?} after bind; it will not be removed", path);
        }
        let registration =
            registry.acquire_unconditional(format!("unix:{} (listening)", path.display()));

        let (closed, _) = watch::channel(false);
        Ok(Self {
            listener: Mutex::new(Some(listener)),
            path: path.to_path_buf(),
            owned_file: Mutex::new(owned_file),
            registry: Arc::clone(registry),
            registration,
            closed,
        })
    }

    /// Path of the socket file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn poll_next_peer(
        &self,
        cx: &mut Context<'_>,
    ) -> Poll<Option<io::Result<(UnixStream, tokio::net::unix::SocketAddr)>>> {
        match lock(&self.listener).as_ref() {
            Some(listener) => listener.poll_accept(cx).map(Some),
            None => Poll::Ready(None),
        }
    }

    /// Unlink the socket file once, and only if it is still ours.
    ///
    /// Must run while the listener is open: the open socket pins the inode,
    /// so a matching id cannot belong to a newer file.
    fn remove_socket_file(&self) {
        let Some(owned) = lock(&self.owned_file).take() else {
            return;
        };
        if file_id(&self.path) != Some(owned) {
            debug!("{:?} now belongs to another socket; leaving it", self.path);
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!("Failed to remove socket file {:?}: {}", self.path, e);
        }
    }
}

#[async_trait]
impl StreamListener for UnixServer {
    async fn accept(&self) -> FlowResult<Option<Box<dyn Flow>>> {
        let mut closed = self.closed.subscribe();
        loop {
            if *closed.borrow() {
                return Ok(None);
            }
            let accepted = tokio::select! {
                _ = signalled(&mut closed) => return Ok(None),
                accepted = poll_fn(|cx| self.poll_next_peer(cx)) => accepted,
            };
            let Some(accepted) = accepted else {
                return Ok(None);
            };
            match accepted {
                Ok((stream, peer)) => {
                    let peer = peer
                        .as_pathname()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| UNKNOWN_PEER.to_string());
                    let description =
                        format!("unix:{} (accepted on {})", peer, self.path.display());
                    match self.registry.acquire(description.clone()) {
                        Ok(registration) => {
                            let flow = UnixFlow::new(stream, description, registration);
                            return Ok(Some(Box::new(flow)));
                        }
                        Err(_) => {
                            debug!("Dropping connection on {:?}: too many connections", self.path);
                            drop(stream);
                        }
                    }
                }
                Err(e) if is_listener_fault(&e) => return Err(FlowError::Io(e)),
                Err(e) => {
                    warn!("Accept on {:?} failed: {}", self.path, e);
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
    }

    fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        self.remove_socket_file();
        lock(&self.listener).take();
        self.registration.release();
    }

    fn local_addr(&self) -> String {
        format!("unix:{}", self.path.display())
    }
}

impl Drop for UnixServer {
    fn drop(&mut self) {
        self.remove_socket_file();
    }
}
