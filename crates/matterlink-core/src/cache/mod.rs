// ── Entity cache ──
//
// Teams, channels, and users known to the session, behind one async
// RwLock. Misses are filled from the REST API through the shared client
// slot; a failed fill degrades to "unknown" rather than an error.

mod entity_cache;
mod normalize;

pub use entity_cache::{ClientSlot, EntityCache, TeamEntry};
pub use normalize::{group_name, normalized_name};
