//! Run-once coordination for cache warmups.

use std::future::Future;

use tokio::sync::Mutex;

/// Ensures a warmup runs on exactly one of many concurrent workers.
///
/// The lock is held for the entire warmup, so every other worker waits until it is done and then
/// skips it. The flag is set before the warmup starts: if it fails, nobody retries.
#[derive(Debug, Default)]
pub struct WarmupOnce {
    done: Mutex<bool>,
}

impl WarmupOnce {
    /// Creates a coordinator whose warmup has not run yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `warmup` unless another caller already did.
    ///
    /// The future is only polled by the first caller. Returns `Ok(true)` if this caller ran the
    /// warmup and `Ok(false)` if it was skipped.
    pub async fn run_once<F, E>(&self, warmup: F) -> Result<bool, E>
    where
        F: Future<Output = Result<(), E>>,
    {
        let mut done = self.done.lock().await;
        if *done {
            return Ok(false);
        }

        *done = true;
        warmup.await?;
        Ok(true)
    }
}
