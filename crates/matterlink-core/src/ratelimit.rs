// ── Rate-limit handling ──
//
// The REST layer classifies HTTP 429 by its reset header. Here we turn that
// classification into a verdict: sleep exactly the advertised delay and
// retry, or give up.

use std::future::Future;
use std::time::Duration;

use matterlink_api::Error;
use tracing::{debug, warn};

/// What to do after a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Retry,
    Fail,
}

/// Inspect `error` from the operation named `call`.
///
/// A well-formed rate limit sleeps for the reset delay and yields
/// [`Verdict::Retry`]. Anything else (a malformed reset header included)
/// yields [`Verdict::Fail`].
pub async fn handle_rate_limit(call: &str, error: &Error) -> Verdict {
    match error {
        Error::RateLimited { retry_after_secs } => {
            warn!(call, retry_after_secs, "rate limited, waiting for reset");
            tokio::time::sleep(Duration::from_secs(*retry_after_secs)).await;
            Verdict::Retry
        }
        Error::RateLimitMalformed { value } => {
            warn!(call, ?value, "rate limited with unusable reset header");
            Verdict::Fail
        }
        _ => Verdict::Fail,
    }
}

/// Run `op` until it succeeds or fails with something other than a
/// well-formed rate limit.
pub async fn retry_rate_limited<T, F, Fut>(call: &str, mut op: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => match handle_rate_limit(call, &e).await {
                Verdict::Retry => debug!(call, "retrying after rate limit"),
                Verdict::Fail => return Err(e),
            },
        }
    }
}
