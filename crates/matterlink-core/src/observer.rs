// ── Session observers ──
//
// Hooks invoked by the supervisor. `on_connected` runs every time the
// session goes live (first connect and every reconnect), after the cache is
// populated and the stream is attached.

use crate::session::Session;

/// Receives session lifecycle notifications.
///
/// Callbacks run on the supervisor's task and must not block. Spawn a task
/// for anything slow.
pub trait SessionObserver: Send + Sync {
    fn on_connected(&self, session: &Session);
}

impl<F> SessionObserver for F
where
    F: Fn(&Session) + Send + Sync,
{
    fn on_connected(&self, session: &Session) {
        self(session);
    }
}
