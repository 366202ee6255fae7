// matterlink-api: Async Rust client for the Mattermost REST API v4 and its WebSocket event stream

pub mod error;
pub mod events;
pub mod models;
pub mod rest;
pub mod stream;
pub mod transport;

pub use error::Error;
pub use events::{EventPayload, MembershipChange, RawEvent, RawResponse, ServerEvent};
pub use rest::RestClient;
pub use stream::{StreamConnection, StreamHandle, StreamInbound, StreamOptions, stream_url};
pub use transport::{TlsMode, TransportConfig};
