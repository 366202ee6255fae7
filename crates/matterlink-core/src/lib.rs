//! Resilient session layer between `matterlink-api` and bridging consumers.
//!
//! - **[`Session`]**: Supervisor owning the full lifecycle:
//!   [`connect()`](Session::connect) probes the server, authenticates,
//!   populates the [`EntityCache`], attaches the event stream, and spawns the
//!   per-connection dispatch, keepalive and anti-idle tasks. Any failure
//!   detected afterwards funnels into a single-flight reconnection with
//!   jittered exponential [`Backoff`].
//!
//! - **[`EntityCache`]**: Teams, channels and users keyed by id, with
//!   lazy user resolution and single-flight background channel refresh.
//!
//! - **[`InboundEvents`]**: The consumer's ordered stream of normalized
//!   [`InboundEvent`]s, ids resolved to names. Ends on logout.
//!
//! - **Outbound helpers** on [`Session`] (post, edit, delete, upload,
//!   status) transparently honor server rate limits.

mod anti_idle;
pub mod backoff;
pub mod cache;
pub mod config;
mod dispatch;
pub mod error;
pub mod event;
pub mod keepalive;
pub mod observer;
pub mod ratelimit;
pub mod session;

// ── Primary re-exports ──────────────────────────────────────────────
pub use backoff::Backoff;
pub use cache::{EntityCache, TeamEntry};
pub use config::{
    AntiIdleConfig, AuthMode, BackoffConfig, Credentials, KeepaliveConfig, SessionConfig,
    TlsVerification,
};
pub use error::CoreError;
pub use event::{EventKind, InboundEvent, InboundEvents, UNKNOWN_USER};
pub use observer::SessionObserver;
pub use session::{Session, SessionState};

// Wire types consumers commonly need alongside events.
pub use matterlink_api::MembershipChange;
pub use matterlink_api::models::{Channel, ChannelKind, FileInfo, Post, Team, User, UserStatus};
