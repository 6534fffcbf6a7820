//! Byte relay between two flows.
//!
//! Each direction is copied until its source reports end of stream, at which
//! point the destination's write side is shut so the far end sees EOF too.
//! Neither flow is closed here; the caller owns them.

use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

use crate::flow::{Flow, ReadOutcome, WriteOutcome, signalled};

/// Bytes moved by a finished relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes copied from the first flow to the second.
    pub a_to_b: u64,
    /// Bytes copied from the second flow to the first.
    pub b_to_a: u64,
}

/// Why a relay ended early.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The quit signal fired.
    #[error("Relay cancelled after {a_to_b}/{b_to_a} bytes")]
    Cancelled {
        /// Bytes copied from the first flow before cancellation.
        a_to_b: u64,
        /// Bytes copied from the second flow before cancellation.
        b_to_a: u64,
    },
}

async fn copy(src: &dyn Flow, dst: &dyn Flow, copied: &AtomicU64) {
    loop {
        match src.read().await {
            ReadOutcome::Data(bytes) => {
                if dst.write(&bytes).await == WriteOutcome::Eof {
                    debug!("{}: peer {} stopped accepting data", src.description(), dst.description());
                    src.shutdown_read().await;
                    return;
                }
                copied.fetch_add(bytes.len() as u64, Ordering::Relaxed);
            }
            ReadOutcome::Eof => {
                dst.shutdown_write().await;
                return;
            }
        }
    }
}

/// Copy in both directions until both finish or `quit` fires.
///
/// # Errors
///
/// [`RelayError::Cancelled`] if `quit` was signalled first.
pub async fn proxy(
    a: &dyn Flow,
    b: &dyn Flow,
    mut quit: watch::Receiver<bool>,
) -> Result<RelayStats, RelayError> {
    let a_to_b = AtomicU64::new(0);
    let b_to_a = AtomicU64::new(0);
    let finished = tokio::select! {
        _ = signalled(&mut quit) => false,
        _ = async { tokio::join!(copy(a, b, &a_to_b), copy(b, a, &b_to_a)) } => true,
    };
    let a_to_b = a_to_b.load(Ordering::Relaxed);
    let b_to_a = b_to_a.load(Ordering::Relaxed);
    if finished {
        Ok(RelayStats { a_to_b, b_to_a })
    } else {
        Err(RelayError::Cancelled { a_to_b, b_to_a })
    }
}

/// Copy from `src` to `dst` only, until `src` ends or `quit` fires.
///
/// Returns the number of bytes copied.
///
/// # Errors
///
/// [`RelayError::Cancelled`] if `quit` was signalled first.
pub async fn copy_until(
    src: &dyn Flow,
    dst: &dyn Flow,
    mut quit: watch::Receiver<bool>,
) -> Result<u64, RelayError> {
    let copied = AtomicU64::new(0);
    let finished = tokio::select! {
        _ = signalled(&mut quit) => false,
        _ = copy(src, dst, &copied) => true,
    };
    let copied = copied.load(Ordering::Relaxed);
    if finished {
        Ok(copied)
    } else {
        Err(RelayError::Cancelled {
            a_to_b: copied,
            b_to_a: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::ChannelFlow;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};

    fn pair(name: &str) -> (ChannelFlow, DuplexStream) {
        let (near, far) = duplex(1024);
        (ChannelFlow::new(near, name, None), far)
    }

    #[tokio::test]
    async fn test_proxy_copies_both_ways_until_eof() {
        let (a, mut a_far) = pair("a");
        let (b, mut b_far) = pair("b");
        let (_quit_tx, quit) = watch::channel(false);

        let ends = tokio::spawn(async move {
            a_far.write_all(b"request").await.unwrap();
            a_far.shutdown().await.unwrap();
            let mut got = Vec::new();
            b_far.read_to_end(&mut got).await.unwrap();
            assert_eq!(got, b"request");
            b_far.write_all(b"response!").await.unwrap();
            b_far.shutdown().await.unwrap();
            let mut reply = Vec::new();
            a_far.read_to_end(&mut reply).await.unwrap();
            reply
        });

        let stats = proxy(&a, &b, quit).await.unwrap();
        assert_eq!(stats, RelayStats { a_to_b: 7, b_to_a: 9 });
        assert_eq!(ends.await.unwrap(), b"response!");
        // The relay never closes its flows.
        assert!(!a.is_closed());
        assert!(!b.is_closed());
    }

    #[tokio::test]
    async fn test_proxy_stops_on_quit() {
        let (a, _a_far) = pair("a");
        let (b, _b_far) = pair("b");
        let (quit_tx, quit) = watch::channel(false);

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            quit_tx.send_replace(true);
            quit_tx
        });
        let result = proxy(&a, &b, quit).await;
        assert!(matches!(result, Err(RelayError::Cancelled { .. })));
        drop(stopper.await.unwrap());
    }

    #[tokio::test]
    async fn test_copy_until_one_direction() {
        let (src, mut src_far) = pair("src");
        let (dst, mut dst_far) = pair("dst");
        let (_quit_tx, quit) = watch::channel(false);

        src_far.write_all(b"one way").await.unwrap();
        drop(src_far);
        assert_eq!(copy_until(&src, &dst, quit).await.unwrap(), 7);
        let mut got = Vec::new();
        dst_far.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"one way");
    }
}
