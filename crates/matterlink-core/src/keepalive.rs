// ── Keepalive monitor ──
//
// Periodically proves the connection is alive: REST ping, then (unless a
// reconnect is already running) the stream's listen error, a stream ping,
// and the age of the last confirmed pong. A failed probe gets one recheck
// after a grace period before a reconnect is requested.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use matterlink_api::StreamHandle;

use crate::config::KeepaliveConfig;
use crate::ratelimit::retry_rate_limited;
use crate::session::Session;

/// Time of the last confirmed pong on one connection.
///
/// Starts at creation time and only ever moves forward.
#[derive(Debug)]
pub struct LivenessClock {
    last_ack: Mutex<Instant>,
}

impl LivenessClock {
    pub fn new() -> Self {
        Self {
            last_ack: Mutex::new(Instant::now()),
        }
    }

    /// Record a pong received now.
    pub fn record_ack(&self) {
        let now = Instant::now();
        let mut last = self.last_ack.lock().unwrap_or_else(PoisonError::into_inner);
        if now > *last {
            *last = now;
        }
    }

    pub fn last_ack(&self) -> Instant {
        *self.last_ack.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn since_last_ack(&self) -> Duration {
        self.last_ack().elapsed()
    }
}

impl Default for LivenessClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a pong this old means the stream is dead.
pub fn ack_overdue(since_last_ack: Duration, threshold: Duration) -> bool {
    since_last_ack > threshold
}

/// Why a liveness probe failed.
#[derive(Debug, Error)]
pub enum LivenessError {
    #[error("REST ping failed: {0}")]
    RestPing(String),

    #[error("event stream reported: {0}")]
    ListenError(String),

    #[error("could not send stream ping: {0}")]
    PingSend(String),

    #[error("no pong for {}s", elapsed.as_secs())]
    PongOverdue { elapsed: Duration },
}

/// One liveness probe.
pub(crate) async fn probe(
    session: &Session,
    stream: &StreamHandle,
    clock: &LivenessClock,
    threshold: Duration,
) -> Result<(), LivenessError> {
    let client = session
        .rest()
        .map_err(|e| LivenessError::RestPing(e.to_string()))?;
    retry_rate_limited("ping", || client.ping())
        .await
        .map_err(|e| LivenessError::RestPing(e.to_string()))?;

    if session.is_reconnecting() {
        debug!("reconnect in flight, skipping stream checks");
        return Ok(());
    }

    if let Some(err) = stream.listen_error() {
        return Err(LivenessError::ListenError(err));
    }

    stream
        .ping()
        .await
        .map_err(|e| LivenessError::PingSend(e.to_string()))?;

    let elapsed = clock.since_last_ack();
    if ack_overdue(elapsed, threshold) {
        return Err(LivenessError::PongOverdue { elapsed });
    }
    Ok(())
}

/// Keepalive task for one connection. Exits when `scope` is cancelled or
/// after requesting a reconnect.
pub(crate) async fn run(
    session: Session,
    stream: StreamHandle,
    clock: Arc<LivenessClock>,
    config: KeepaliveConfig,
    scope: CancellationToken,
) {
    let dead = supervise(config, &scope, || {
        probe(&session, &stream, &clock, config.pong_threshold)
    })
    .await;
    if let Some(e) = dead {
        session.trigger_reconnect(&format!("keepalive: {e}"));
    }
    debug!("keepalive exiting");
}

/// Run `check` every interval. A failure is rechecked once after the
/// grace period; a second failure is returned. `None` once `scope` is
/// cancelled.
pub(crate) async fn supervise<F, Fut>(
    config: KeepaliveConfig,
    scope: &CancellationToken,
    mut check: F,
) -> Option<LivenessError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), LivenessError>>,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + config.interval, config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = scope.cancelled() => return None,
            _ = ticker.tick() => {
                let Err(first) = check().await else {
                    continue;
                };
                warn!(error = %first, grace_secs = config.grace.as_secs(), "liveness check failed, rechecking");

                tokio::select! {
                    biased;
                    () = scope.cancelled() => return None,
                    () = tokio::time::sleep(config.grace) => {}
                }

                match check().await {
                    Ok(()) => info!("liveness restored within grace period"),
                    Err(e) => return Some(e),
                }
            }
        }
    }
}
