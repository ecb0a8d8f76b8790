//! Connection-quality sampling
//!
//! Every `stats_interval` the sampler reads the round-trip time of each
//! peer's transport, maps it to a [`SignalQuality`] tier and publishes a
//! [`RoomEvent::QualityChanged`] when the tier moves. It only ever writes the
//! advisory `signal_quality` field and never touches negotiation state.

use crate::identity::PeerId;
use crate::media_transport::MediaTransport;
use crate::session::PeerInfo;
use crate::types::{RoomEvent, SignalQuality};
use chrono::Utc;
use futures::future::join_all;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// One peer to sample
pub struct SampleTarget<T: MediaTransport> {
    /// Peer id
    pub peer_id: PeerId,
    /// Metadata the tier is written to
    pub info: Arc<RwLock<PeerInfo>>,
    /// Transport the RTT is read from
    pub transport: Arc<T>,
}

/// Sample one peer, returning an event if its tier changed
///
/// A failed stats read leaves the current tier untouched.
pub async fn sample_peer<T: MediaTransport>(target: &SampleTarget<T>) -> Option<RoomEvent> {
    let rtt_ms = match target.transport.round_trip_time_ms().await {
        Ok(rtt) => rtt,
        Err(e) => {
            tracing::trace!(peer = %target.peer_id, error = %e, "Stats read failed");
            return None;
        }
    };

    let quality = SignalQuality::from_rtt_ms(rtt_ms);
    {
        let mut info = target.info.write();
        if info.signal_quality == quality {
            return None;
        }
        info.signal_quality = quality;
    }

    tracing::debug!(peer = %target.peer_id, quality = ?quality, rtt_ms = ?rtt_ms, "Signal quality changed");
    Some(RoomEvent::QualityChanged {
        peer_id: target.peer_id.clone(),
        quality,
        rtt_ms,
        sampled_at: Utc::now(),
    })
}

/// Spawn the periodic sampler
///
/// `targets` is called on every tick; returning `None` stops the sampler.
/// The first sample is taken one `period` after spawning.
pub fn spawn_sampler<T, L>(
    period: Duration,
    targets: L,
    events: broadcast::Sender<RoomEvent>,
) -> JoinHandle<()>
where
    T: MediaTransport,
    L: Fn() -> Option<Vec<SampleTarget<T>>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let Some(targets) = targets() else {
                break;
            };
            let changes = join_all(targets.iter().map(sample_peer)).await;
            for event in changes.into_iter().flatten() {
                let _ = events.send(event);
            }
        }
        tracing::debug!("Quality sampler stopped");
    })
}
