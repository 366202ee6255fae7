// ── Anti-idle ──
//
// Marks a fixed channel as viewed on a timer so the server keeps the
// account active. Failures are logged and retried on the next tick.

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::AntiIdleConfig;
use crate::session::Session;

/// Anti-idle task for one connection.
pub(crate) async fn run(session: Session, config: AntiIdleConfig, scope: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + config.interval, config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = scope.cancelled() => break,
            _ = ticker.tick() => tick(&session, &config.channel).await,
        }
    }
    debug!("anti-idle exiting");
}

async fn tick(session: &Session, channel: &str) {
    let cache = session.cache();
    let team_id = cache.primary_team().await.map(|t| t.id);
    let Some(channel_id) = cache.channel_id(channel, team_id.as_deref()).await else {
        warn!(channel, "anti-idle channel not found");
        return;
    };
    match session.update_last_viewed(&channel_id).await {
        Ok(()) => debug!(channel, "marked channel viewed"),
        Err(e) => warn!(channel, error = %e, "anti-idle update failed"),
    }
}
