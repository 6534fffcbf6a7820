//! Accept loop for stream forwards (TCP and Unix).

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::Shared;
use crate::flow::{Flow, StreamListener, signalled};
use crate::mux::{MuxError, MuxResult};
use crate::relay::{self, RelayError};

/// Dial the destination through the current multiplexer.
///
/// Returns `None` if `quit` fires first.
pub(super) async fn dial(
    shared: &Shared,
    quit: &mut watch::Receiver<bool>,
) -> Option<MuxResult<Box<dyn Flow>>> {
    let Some(mux) = shared.control.mux() else {
        return Some(Err(MuxError::Closed));
    };
    tokio::select! {
        _ = signalled(quit) => None,
        dialled = mux.dial(&shared.destination) => Some(dialled),
    }
}

pub(super) async fn run(
    shared: Arc<Shared>,
    listener: Arc<dyn StreamListener>,
    quit: watch::Receiver<bool>,
) {
    let port = &shared.port;
    let mut relays = JoinSet::new();
    let mut quit_rx = quit.clone();

    loop {
        let accepted = tokio::select! {
            _ = signalled(&mut quit_rx) => break,
            Some(_) = relays.join_next(), if !relays.is_empty() => continue,
            accepted = listener.accept() => accepted,
        };
        let peer = match accepted {
            Ok(Some(peer)) => peer,
            Ok(None) => break,
            Err(e) => {
                error!("Listener for {} failed: {}", port, e);
                break;
            }
        };

        let channel = match dial(&shared, &mut quit_rx).await {
            Some(Ok(channel)) => channel,
            Some(Err(e)) => {
                // Fail fast: stop accepting.
                warn!("unable to connect on {}: {}", port, e);
                peer.close().await;
                break;
            }
            None => {
                peer.close().await;
                break;
            }
        };

        debug!("Relaying {} to {}", peer.description(), channel.description());
        let quit = quit.clone();
        let label = port.to_string();
        relays.spawn(async move {
            match relay::proxy(&*peer, &*channel, quit).await {
                Ok(stats) => debug!(
                    "Relay on {} finished: {} bytes out, {} bytes back",
                    label, stats.a_to_b, stats.b_to_a
                ),
                Err(RelayError::Cancelled { .. }) => debug!("Relay on {} cancelled", label),
            }
            peer.close().await;
            channel.close().await;
        });
    }

    info!("Stopping accepting connections on {}", port);
    while relays.join_next().await.is_some() {}
}
