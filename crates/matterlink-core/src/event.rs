// ── Normalized inbound events ──
//
// What the bridging consumer sees: wire identifiers resolved to names,
// delivered in transport order through a bounded channel.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures_core::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use matterlink_api::models::Post;
use matterlink_api::{MembershipChange, RawEvent};

/// Username reported when the sender cannot be resolved.
pub const UNKNOWN_USER: &str = "unknown";

/// Kind tag of an [`InboundEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Posted,
    Edited,
    Deleted,
    UserUpdated,
    MembershipChanged(MembershipChange),
    /// Any other server event, by name.
    Other(String),
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Posted => f.write_str("posted"),
            Self::Edited => f.write_str("edited"),
            Self::Deleted => f.write_str("deleted"),
            Self::UserUpdated => f.write_str("user_updated"),
            Self::MembershipChanged(change) => write!(f, "membership:{change}"),
            Self::Other(name) => f.write_str(name),
        }
    }
}

/// A server event with its identifiers resolved through the entity cache.
///
/// Names are best effort: a channel that is not cached yet yields an empty
/// name (a refresh is scheduled), an unresolvable sender yields
/// [`UNKNOWN_USER`].
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub kind: EventKind,
    pub team: String,
    pub team_id: String,
    pub channel: String,
    pub channel_id: String,
    pub username: String,
    pub user_id: String,
    pub text: String,
    pub post: Option<Post>,
    pub timestamp: DateTime<Utc>,
    pub raw: Arc<RawEvent>,
}

impl InboundEvent {
    /// Bare event carrying only the kind and raw frame.
    pub(crate) fn new(kind: EventKind, raw: Arc<RawEvent>) -> Self {
        Self {
            kind,
            team: String::new(),
            team_id: String::new(),
            channel: String::new(),
            channel_id: String::new(),
            username: String::new(),
            user_id: String::new(),
            text: String::new(),
            post: None,
            timestamp: Utc::now(),
            raw,
        }
    }

    /// Whether this event carries a message.
    pub fn is_message(&self) -> bool {
        matches!(
            self.kind,
            EventKind::Posted | EventKind::Edited | EventKind::Deleted
        )
    }
}

/// Post timestamps are milliseconds since the epoch.
pub(crate) fn post_timestamp(post: &Post) -> DateTime<Utc> {
    let millis = if post.update_at > 0 {
        post.update_at
    } else {
        post.create_at
    };
    DateTime::from_timestamp_millis(millis)
        .filter(|_| millis > 0)
        .unwrap_or_else(Utc::now)
}

/// The consumer's receive side. Ends after logout.
///
/// Implements [`Stream`]; [`recv`](Self::recv) is provided for callers that
/// prefer a plain loop.
pub struct InboundEvents {
    inner: ReceiverStream<InboundEvent>,
}

impl InboundEvents {
    pub(crate) fn new(rx: mpsc::Receiver<InboundEvent>) -> Self {
        Self {
            inner: ReceiverStream::new(rx),
        }
    }

    /// Next event, or `None` once the session is closed.
    pub async fn recv(&mut self) -> Option<InboundEvent> {
        self.inner.as_mut().recv().await
    }
}

impl Stream for InboundEvents {
    type Item = InboundEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl fmt::Debug for InboundEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundEvents").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_timestamp_prefers_update_time() {
        let post = Post {
            channel_id: "c1".into(),
            create_at: 1_700_000_000_000,
            update_at: 1_700_000_005_000,
            ..Post::default()
        };
        assert_eq!(post_timestamp(&post).timestamp_millis(), 1_700_000_005_000);
    }

    #[test]
    fn kind_display_names() {
        assert_eq!(EventKind::Posted.to_string(), "posted");
        assert_eq!(
            EventKind::MembershipChanged(MembershipChange::UserAdded).to_string(),
            "membership:user_added"
        );
        assert_eq!(EventKind::Other("typing".into()).to_string(), "typing");
    }
}
