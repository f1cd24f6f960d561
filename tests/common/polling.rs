//! Polling helper for assertions about work running on spawned tasks.

use std::time::Duration;

/// Polls `condition` until it holds, panicking after roughly two seconds.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
