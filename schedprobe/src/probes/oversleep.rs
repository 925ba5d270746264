use std::time::{Duration, Instant};

use log::debug;

/// Sleeps for `requested` and returns the instant the sleeping task ran again.
pub async fn sleep_until_woken(requested: Duration) -> Instant {
    tokio::time::sleep(requested).await;
    Instant::now()
}

/// Wake latency beyond the requested sleep.
///
/// A wake before the deadline can only come from timer resolution noise and
/// is reported as zero.
pub fn excess(elapsed: Duration, requested: Duration) -> Duration {
    match elapsed.checked_sub(requested) {
        Some(extra) => extra,
        None => {
            debug!(
                "Woke {:?} before the requested {:?} sleep",
                requested - elapsed,
                requested
            );
            Duration::ZERO
        }
    }
}
