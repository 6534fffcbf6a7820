//! Receive loop for UDP forwards.
//!
//! Datagrams are demultiplexed by source address. The first datagram from a
//! new source dials the destination and opens a session; later datagrams
//! from that source are written into the session's channel, and a task per
//! session carries replies back to the source. Sessions that stay silent
//! for longer than the idle timeout are closed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::Shared;
use super::stream::dial;
use crate::flow::{Flow, ReadOutcome, UdpEndpoint, UdpFlow, WriteOutcome, signalled};
use crate::relay;

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

struct Session {
    channel: Arc<dyn Flow>,
    last_seen: Instant,
}

type Sessions = HashMap<SocketAddr, Session>;

async fn evict_idle(sessions: &mut Sessions, idle_timeout: Duration) {
    let now = Instant::now();
    let idle: Vec<SocketAddr> = sessions
        .iter()
        .filter(|(_, session)| now.duration_since(session.last_seen) > idle_timeout)
        .map(|(from, _)| *from)
        .collect();
    for from in idle {
        if let Some(session) = sessions.remove(&from) {
            debug!("Closing idle UDP session for {}", from);
            session.channel.close().await;
        }
    }
}

pub(super) async fn run(
    shared: Arc<Shared>,
    endpoint: Arc<UdpEndpoint>,
    quit: watch::Receiver<bool>,
) {
    let port = &shared.port;
    let idle_timeout = shared.options.udp_idle_timeout;
    let mut sessions: Sessions = HashMap::new();
    let mut replies: JoinSet<(SocketAddr, Arc<dyn Flow>)> = JoinSet::new();
    let mut quit_rx = quit.clone();
    let mut sweep = tokio::time::interval((idle_timeout / 2).max(MIN_SWEEP_INTERVAL));
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let received = tokio::select! {
            _ = signalled(&mut quit_rx) => break,
            _ = sweep.tick() => {
                evict_idle(&mut sessions, idle_timeout).await;
                continue;
            }
            Some(finished) = replies.join_next(), if !replies.is_empty() => {
                if let Ok((from, channel)) = finished
                    && sessions
                        .get(&from)
                        .is_some_and(|session| Arc::ptr_eq(&session.channel, &channel))
                {
                    debug!("UDP session for {} ended", from);
                    sessions.remove(&from);
                }
                continue;
            }
            received = endpoint.recv() => received,
        };
        let (payload, from) = match received {
            Ok(Some(datagram)) => datagram,
            Ok(None) => break,
            Err(e) => {
                error!("Endpoint for {} failed: {}", port, e);
                break;
            }
        };

        if let Some(session) = sessions.get_mut(&from) {
            session.last_seen = Instant::now();
            if session.channel.write(&payload).await == WriteOutcome::Eof
                && let Some(session) = sessions.remove(&from)
            {
                debug!("UDP session for {} closed by the remote side", from);
                session.channel.close().await;
            }
            continue;
        }

        let flow = UdpFlow::already_read(&endpoint, from, payload);
        let channel: Arc<dyn Flow> = match dial(&shared, &mut quit_rx).await {
            Some(Ok(channel)) => Arc::from(channel),
            Some(Err(e)) => {
                warn!("unable to connect on {}: {}; dropping datagram from {}", port, e, from);
                continue;
            }
            None => break,
        };
        if let ReadOutcome::Data(first) = flow.read().await
            && channel.write(&first).await == WriteOutcome::Eof
        {
            warn!("{} refused the first datagram from {}", channel.description(), from);
            channel.close().await;
            continue;
        }

        debug!("New UDP session for {} via {}", from, channel.description());
        sessions.insert(
            from,
            Session {
                channel: Arc::clone(&channel),
                last_seen: Instant::now(),
            },
        );
        let quit = quit.clone();
        replies.spawn(async move {
            if let Ok(bytes) = relay::copy_until(&*channel, &flow, quit).await {
                debug!("UDP session for {} sent {} bytes back", from, bytes);
            }
            channel.close().await;
            flow.close().await;
            (from, channel)
        });
    }

    info!("Stopping receiving datagrams on {}", port);
    for (_, session) in sessions.drain() {
        session.channel.close().await;
    }
    while replies.join_next().await.is_some() {}
}
