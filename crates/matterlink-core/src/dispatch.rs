// ── Dispatch loop ──
//
// One task per connection. Multiplexes cancellation, the stream's hard
// timeout, inbound events, action replies, and a self-check tick. Events
// are decoded, normalized against the entity cache, and forwarded to the
// consumer in transport order. Any sign of a dead stream ends the loop
// and requests a reconnect.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use matterlink_api::models::{ChannelKind, Post};
use matterlink_api::{
    EventPayload, MembershipChange, RawEvent, ServerEvent, StreamHandle, StreamInbound,
};

use crate::cache::normalized_name;
use crate::event::{EventKind, InboundEvent, UNKNOWN_USER, post_timestamp};
use crate::keepalive::LivenessClock;
use crate::session::Session;

enum Exit {
    Cancelled,
    Failed(String),
}

/// Dispatch task for one connection.
pub(crate) async fn run(
    session: Session,
    stream: StreamHandle,
    mut inbound: StreamInbound,
    clock: Arc<LivenessClock>,
    tick: Duration,
    scope: CancellationToken,
) {
    let events_tx = session.event_sender();
    let hard_timeout = stream.hard_timeout();
    let mut ticker = tokio::time::interval_at(Instant::now() + tick, tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut responses_open = true;

    let exit = loop {
        tokio::select! {
            biased;
            () = scope.cancelled() => break Exit::Cancelled,
            () = hard_timeout.cancelled() => break Exit::Failed("stream hard timeout".into()),
            event = inbound.events.recv() => {
                let Some(raw) = event else {
                    let reason = stream
                        .listen_error()
                        .unwrap_or_else(|| "event stream closed".into());
                    break Exit::Failed(reason);
                };
                if !forward(&session, raw, events_tx.as_ref(), &scope).await {
                    break Exit::Cancelled;
                }
            }
            response = inbound.responses.recv(), if responses_open => {
                match response {
                    Some(response) if response.is_pong() => {
                        trace!(seq = response.seq_reply, "pong");
                        clock.record_ack();
                    }
                    Some(response) => {
                        trace!(seq = response.seq_reply, status = %response.status, "action reply");
                    }
                    None => responses_open = false,
                }
            }
            _ = ticker.tick() => {
                if let Some(err) = stream.listen_error() {
                    break Exit::Failed(err);
                }
            }
        }
    };

    match exit {
        Exit::Cancelled => debug!("dispatch exiting"),
        Exit::Failed(reason) => session.trigger_reconnect(&format!("dispatch: {reason}")),
    }
}

/// Decode, normalize, and deliver one event. Returns `false` when the
/// connection scope was cancelled while waiting for the consumer.
async fn forward(
    session: &Session,
    raw: RawEvent,
    events_tx: Option<&mpsc::Sender<InboundEvent>>,
    scope: &CancellationToken,
) -> bool {
    let Some(decoded) = ServerEvent::decode(&raw) else {
        return true;
    };
    let Some(event) = normalize(session, decoded, Arc::new(raw)).await else {
        return true;
    };
    let Some(tx) = events_tx else {
        trace!(kind = %event.kind, "no consumer, dropping event");
        return true;
    };

    tokio::select! {
        biased;
        () = scope.cancelled() => false,
        sent = tx.send(event) => {
            if sent.is_err() {
                trace!("consumer gone, dropping event");
            }
            true
        }
    }
}

// ── Normalization ────────────────────────────────────────────────

/// Resolve identifiers of a decoded event. `None` for suppressed reposts.
pub(crate) async fn normalize(
    session: &Session,
    event: ServerEvent,
    raw: Arc<RawEvent>,
) -> Option<InboundEvent> {
    let cache = session.cache();

    match event.payload {
        EventPayload::Posted {
            post,
            raw_post,
            channel_kind,
            team_id,
            sender_name,
        } => {
            if !session.first_delivery(&event.event, &raw_post) {
                debug!(post_id = %post.id, "suppressing repeated post");
                return None;
            }
            let hints = Hints {
                channel_kind,
                team_id,
                sender_name,
            };
            Some(message_event(session, EventKind::Posted, post, hints, raw).await)
        }
        EventPayload::PostEdited { post, raw_post } => {
            if !session.first_delivery(&event.event, &raw_post) {
                debug!(post_id = %post.id, "suppressing repeated edit");
                return None;
            }
            Some(message_event(session, EventKind::Edited, post, Hints::default(), raw).await)
        }
        EventPayload::PostDeleted { post } => {
            Some(message_event(session, EventKind::Deleted, post, Hints::default(), raw).await)
        }
        EventPayload::UserUpdated { user } => {
            let mut out = InboundEvent::new(EventKind::UserUpdated, raw);
            out.user_id.clone_from(&user.id);
            out.username.clone_from(&user.username);
            cache.upsert_user(user).await;
            Some(out)
        }
        EventPayload::MembershipChanged {
            change,
            user_id,
            channel_id,
            team_id,
        } => {
            let me = cache.me().await;
            let concerns_me = user_id
                .as_deref()
                .is_some_and(|id| me.as_ref().is_some_and(|me| me.id == id));
            if concerns_me || change == MembershipChange::ChannelAdded {
                cache.schedule_channel_refresh();
            }

            let mut out = InboundEvent::new(EventKind::MembershipChanged(change), raw);
            if let Some(id) = channel_id {
                out.channel = cache.channel_name(&id).await.unwrap_or_default();
                out.channel_id = id;
            }
            if let Some(id) = team_id {
                out.team = cache.team_name(&id).await.unwrap_or_default();
                out.team_id = id;
            }
            if let Some(id) = user_id {
                out.username = cache
                    .resolve_user(&id)
                    .await
                    .map_or_else(|| UNKNOWN_USER.to_owned(), |u| u.username.clone());
                out.user_id = id;
            }
            Some(out)
        }
        EventPayload::Other { event: name } => {
            let mut out = InboundEvent::new(EventKind::Other(name), raw);
            out.channel_id.clone_from(&event.broadcast.channel_id);
            out.team_id.clone_from(&event.broadcast.team_id);
            Some(out)
        }
    }
}

/// Routing details some events carry alongside the post.
#[derive(Default)]
struct Hints {
    channel_kind: Option<ChannelKind>,
    team_id: Option<String>,
    /// Display form of the sender (`@name`), used when the user lookup fails.
    sender_name: Option<String>,
}

async fn message_event(
    session: &Session,
    kind: EventKind,
    post: Post,
    hints: Hints,
    raw: Arc<RawEvent>,
) -> InboundEvent {
    let cache = session.cache();

    let username = match cache.resolve_user(&post.user_id).await {
        Some(user) => user.username.clone(),
        None => hints
            .sender_name
            .as_deref()
            .map(|name| name.trim_start_matches('@'))
            .filter(|name| !name.is_empty())
            .unwrap_or(UNKNOWN_USER)
            .to_owned(),
    };

    let channel = cache.channel(&post.channel_id).await;
    if channel.is_none() {
        debug!(channel_id = %post.channel_id, "channel not cached, scheduling refresh");
        cache.schedule_channel_refresh();
    }

    let channel_kind = channel.as_ref().map(|c| c.kind).or(hints.channel_kind);
    let channel_name = if channel_kind == Some(ChannelKind::Direct) {
        username.clone()
    } else {
        channel.as_ref().map(normalized_name).unwrap_or_default()
    };

    let mut team_id = match hints.team_id {
        Some(id) => id,
        None => cache
            .channel_team_id(&post.channel_id)
            .await
            .unwrap_or_default(),
    };
    if team_id.is_empty() {
        team_id = cache.primary_team().await.map(|t| t.id).unwrap_or_default();
    }
    let team = cache.team_name(&team_id).await.unwrap_or_default();

    let mut out = InboundEvent::new(kind, raw);
    out.team = team;
    out.team_id = team_id;
    out.channel = channel_name;
    out.channel_id.clone_from(&post.channel_id);
    out.username = username;
    out.user_id.clone_from(&post.user_id);
    out.text.clone_from(&post.message);
    out.timestamp = post_timestamp(&post);
    out.post = Some(post);
    out
}
