//! Stream frame records and typed event decoding.
//!
//! The server multiplexes two kinds of text frames over the WebSocket:
//! events (`{"event", "data", "broadcast", "seq"}`) and replies to our own
//! actions (`{"status", "seq_reply", "data"}`). [`RawEvent`] and
//! [`RawResponse`] mirror those shapes; [`ServerEvent::decode`] turns a raw
//! event into the [`EventPayload`] sum type exactly once, at the transport
//! boundary.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{Display, EnumString};
use tracing::debug;

use crate::models::{ChannelKind, Post, User};

// ── Raw frames ───────────────────────────────────────────────────────

/// Routing metadata attached to every event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Broadcast {
    #[serde(default)]
    pub channel_id: String,
    #[serde(default)]
    pub team_id: String,
    #[serde(default)]
    pub user_id: String,
}

/// An event frame as received.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub broadcast: Broadcast,
    #[serde(default)]
    pub seq: i64,
}

impl RawEvent {
    /// An event is well formed when it names its kind.
    pub fn is_valid(&self) -> bool {
        !self.event.is_empty()
    }

    fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// A reply to an action we sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub seq_reply: i64,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

impl RawResponse {
    /// `true` for the reply to a `ping` action.
    pub fn is_pong(&self) -> bool {
        self.data
            .as_ref()
            .and_then(|d| d.get("text"))
            .and_then(Value::as_str)
            == Some("pong")
    }

    pub fn is_ok(&self) -> bool {
        self.status == "OK"
    }
}

/// Outbound action frame.
#[derive(Debug, Clone, Serialize)]
pub struct ActionFrame {
    pub seq: i64,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A classified inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Event(RawEvent),
    Response(RawResponse),
}

impl Frame {
    /// Classify a text frame. Events carry an `event` field, responses a
    /// `status` or `seq_reply`. Anything else (or invalid JSON) is `None`.
    pub fn parse(text: &str) -> Option<Self> {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "discarding unparseable stream frame");
                return None;
            }
        };
        let obj = value.as_object()?;

        if obj.contains_key("event") {
            return serde_json::from_value(value).ok().map(Frame::Event);
        }
        if obj.contains_key("status") || obj.contains_key("seq_reply") {
            return serde_json::from_value(value).ok().map(Frame::Response);
        }
        None
    }
}

// ── Typed events ─────────────────────────────────────────────────────

/// Event names the engine reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum EventName {
    Posted,
    PostEdited,
    PostDeleted,
    UserUpdated,
    UserAdded,
    UserRemoved,
    AddedToTeam,
    LeaveTeam,
    ChannelCreated,
    DirectAdded,
    GroupAdded,
    Hello,
}

/// How a membership event changed the session's view of the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum MembershipChange {
    /// A user joined a channel.
    UserAdded,
    /// A user left or was removed from a channel.
    UserRemoved,
    /// A user was added to a team.
    AddedToTeam,
    /// A user left a team.
    LeftTeam,
    /// A channel appeared (created, or a DM/group conversation opened).
    ChannelAdded,
}

/// Decoded payload of a server event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Posted {
        post: Post,
        /// The post exactly as it arrived (JSON text), for digesting.
        raw_post: String,
        channel_kind: Option<ChannelKind>,
        team_id: Option<String>,
        sender_name: Option<String>,
    },
    PostEdited {
        post: Post,
        raw_post: String,
    },
    PostDeleted {
        post: Post,
    },
    UserUpdated {
        user: User,
    },
    MembershipChanged {
        change: MembershipChange,
        user_id: Option<String>,
        channel_id: Option<String>,
        team_id: Option<String>,
    },
    /// Any other well-formed event; only the name is kept.
    Other {
        event: String,
    },
}

/// A decoded event with its routing metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerEvent {
    pub event: String,
    pub seq: i64,
    pub broadcast: Broadcast,
    pub payload: EventPayload,
}

impl ServerEvent {
    /// Decode a raw event. Returns `None` for frames that are not well
    /// formed (missing name, or a post payload that does not parse).
    pub fn decode(raw: &RawEvent) -> Option<Self> {
        if !raw.is_valid() {
            return None;
        }

        let payload = match raw.event.parse::<EventName>() {
            Ok(EventName::Posted) => {
                let (post, raw_post) = decode_post(raw)?;
                EventPayload::Posted {
                    post,
                    raw_post,
                    channel_kind: raw
                        .data_str("channel_type")
                        .and_then(|k| k.parse().ok()),
                    team_id: non_empty(raw.data_str("team_id"))
                        .or_else(|| non_empty(Some(&raw.broadcast.team_id))),
                    sender_name: non_empty(raw.data_str("sender_name")),
                }
            }
            Ok(EventName::PostEdited) => {
                let (post, raw_post) = decode_post(raw)?;
                EventPayload::PostEdited { post, raw_post }
            }
            Ok(EventName::PostDeleted) => {
                let (post, _) = decode_post(raw)?;
                EventPayload::PostDeleted { post }
            }
            Ok(EventName::UserUpdated) => {
                let user = raw.data.get("user").cloned()?;
                match serde_json::from_value(user) {
                    Ok(user) => EventPayload::UserUpdated { user },
                    Err(e) => {
                        debug!(error = %e, "discarding user_updated with bad user record");
                        return None;
                    }
                }
            }
            Ok(EventName::UserAdded) => membership(raw, MembershipChange::UserAdded),
            Ok(EventName::UserRemoved) => membership(raw, MembershipChange::UserRemoved),
            Ok(EventName::AddedToTeam) => membership(raw, MembershipChange::AddedToTeam),
            Ok(EventName::LeaveTeam) => membership(raw, MembershipChange::LeftTeam),
            Ok(EventName::ChannelCreated | EventName::DirectAdded | EventName::GroupAdded) => {
                membership(raw, MembershipChange::ChannelAdded)
            }
            Ok(EventName::Hello) | Err(_) => EventPayload::Other {
                event: raw.event.clone(),
            },
        };

        Some(Self {
            event: raw.event.clone(),
            seq: raw.seq,
            broadcast: raw.broadcast.clone(),
            payload,
        })
    }
}

/// Posts travel as a JSON string inside `data.post`.
fn decode_post(raw: &RawEvent) -> Option<(Post, String)> {
    let text = raw.data_str("post")?;
    match serde_json::from_str::<Post>(text) {
        Ok(post) => Some((post, text.to_owned())),
        Err(e) => {
            debug!(event = %raw.event, error = %e, "discarding event with bad post payload");
            None
        }
    }
}

fn membership(raw: &RawEvent, change: MembershipChange) -> EventPayload {
    EventPayload::MembershipChanged {
        change,
        user_id: non_empty(raw.data_str("user_id"))
            .or_else(|| non_empty(Some(&raw.broadcast.user_id))),
        channel_id: non_empty(raw.data_str("channel_id"))
            .or_else(|| non_empty(Some(&raw.broadcast.channel_id))),
        team_id: non_empty(raw.data_str("team_id"))
            .or_else(|| non_empty(Some(&raw.broadcast.team_id))),
    }
}

fn non_empty(s: Option<&str>) -> Option<String> {
    s.filter(|s| !s.is_empty()).map(String::from)
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn posted_frame() -> String {
        let post = r#"{"id":"p1","channel_id":"c1","user_id":"u1","message":"hello"}"#;
        serde_json::json!({
            "event": "posted",
            "data": {
                "channel_type": "O",
                "post": post,
                "sender_name": "@alice",
                "team_id": "t1"
            },
            "broadcast": { "channel_id": "c1", "team_id": "", "user_id": "" },
            "seq": 4
        })
        .to_string()
    }

    #[test]
    fn posted_event_decodes_embedded_post() {
        let Some(Frame::Event(raw)) = Frame::parse(&posted_frame()) else {
            panic!("expected event frame");
        };
        let event = ServerEvent::decode(&raw).unwrap();
        assert_eq!(event.seq, 4);

        match event.payload {
            EventPayload::Posted {
                post,
                channel_kind,
                team_id,
                sender_name,
                ..
            } => {
                assert_eq!(post.message, "hello");
                assert_eq!(channel_kind, Some(ChannelKind::Open));
                assert_eq!(team_id.as_deref(), Some("t1"));
                assert_eq!(sender_name.as_deref(), Some("@alice"));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn pong_reply_is_classified_as_response() {
        let frame = Frame::parse(r#"{"status":"OK","seq_reply":2,"data":{"text":"pong"}}"#);
        let Some(Frame::Response(resp)) = frame else {
            panic!("expected response frame");
        };
        assert!(resp.is_pong());
        assert!(resp.is_ok());
        assert_eq!(resp.seq_reply, 2);
    }

    #[test]
    fn garbage_frames_are_discarded() {
        assert_eq!(Frame::parse("not json"), None);
        assert_eq!(Frame::parse(r#"{"hello":"world"}"#), None);
        assert_eq!(Frame::parse("[1,2,3]"), None);
    }

    #[test]
    fn event_without_name_is_not_well_formed() {
        let raw = RawEvent::default();
        assert!(ServerEvent::decode(&raw).is_none());
    }

    #[test]
    fn posted_with_unparseable_post_is_dropped() {
        let mut raw = RawEvent {
            event: "posted".into(),
            ..RawEvent::default()
        };
        raw.data.insert("post".into(), Value::String("{broken".into()));
        assert!(ServerEvent::decode(&raw).is_none());
    }

    #[test]
    fn direct_added_is_a_channel_addition_from_broadcast() {
        let raw: RawEvent = serde_json::from_str(
            r#"{"event":"direct_added","data":{"teammate_id":"u2"},
                "broadcast":{"channel_id":"dm1","team_id":"","user_id":"u1"},"seq":9}"#,
        )
        .unwrap();
        let event = ServerEvent::decode(&raw).unwrap();
        assert_eq!(
            event.payload,
            EventPayload::MembershipChanged {
                change: MembershipChange::ChannelAdded,
                user_id: Some("u1".into()),
                channel_id: Some("dm1".into()),
                team_id: None,
            }
        );
    }

    #[test]
    fn unknown_events_are_kept_by_name() {
        let raw = RawEvent {
            event: "typing".into(),
            ..RawEvent::default()
        };
        let event = ServerEvent::decode(&raw).unwrap();
        assert_eq!(
            event.payload,
            EventPayload::Other {
                event: "typing".into()
            }
        );
    }
}
