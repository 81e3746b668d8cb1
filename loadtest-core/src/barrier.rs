//! A busy counter that gates the start of a measurement phase.
//!
//! Workers [`enter`](BusyBarrier::enter) when they begin their setup and
//! [`leave`](BusyBarrier::leave) once they are ready. [`wait`](BusyBarrier::wait) resolves as
//! soon as the counter is observed at zero. The check is level-triggered, so workers may come and
//! go while others wait. The barrier does not stop a worker from entering again after it left;
//! each worker is expected to go through setup exactly once.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::BarrierTimeout;

/// Interval at which a waiting worker reports the busy count.
const DEFAULT_LOG_INTERVAL: Duration = Duration::from_secs(1);

/// Shared busy counter with a rendezvous for waiters.
#[derive(Debug)]
pub struct BusyBarrier {
    busy: Mutex<usize>,
    released: Notify,
    log_interval: Duration,
}

impl Default for BusyBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl BusyBarrier {
    /// Creates a barrier with a busy count of zero.
    pub fn new() -> Self {
        Self {
            busy: Mutex::new(0),
            released: Notify::new(),
            log_interval: DEFAULT_LOG_INTERVAL,
        }
    }

    /// Marks one more worker as busy.
    pub fn enter(&self) {
        let mut busy = self.busy.lock().unwrap();
        *busy += 1;
        tracing::debug!(busy = *busy, "worker entered setup");
    }

    /// Marks one worker as ready, waking waiters once nobody is busy.
    pub fn leave(&self) {
        let mut busy = self.busy.lock().unwrap();
        match busy.checked_sub(1) {
            Some(remaining) => *busy = remaining,
            None => tracing::warn!("busy counter is already zero"),
        }
        tracing::debug!(busy = *busy, "worker is ready");

        if *busy == 0 {
            self.released.notify_waiters();
        }
    }

    /// Returns the number of busy workers.
    pub fn busy(&self) -> usize {
        *self.busy.lock().unwrap()
    }

    /// Waits until no worker is busy.
    ///
    /// Without a timeout this waits forever if a worker never leaves. With a timeout,
    /// [`BarrierTimeout`] is returned once it elapses.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<(), BarrierTimeout> {
        let Some(timeout) = timeout else {
            self.wait_idle().await;
            return Ok(());
        };

        tokio::time::timeout(timeout, self.wait_idle())
            .await
            .map_err(|_| BarrierTimeout {
                busy: self.busy(),
                timeout,
            })
    }

    async fn wait_idle(&self) {
        let start = Instant::now() + self.log_interval;
        let mut ticker = tokio::time::interval_at(start, self.log_interval);

        loop {
            let released = self.released.notified();
            let busy = self.busy();
            if busy == 0 {
                return;
            }

            tokio::select! {
                _ = released => {}
                _ = ticker.tick() => {
                    tracing::info!(busy, "waiting for all workers to become ready");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn idle_barrier_does_not_block() {
        let barrier = BusyBarrier::new();
        let wait = Box::pin(barrier.wait(None));
        assert!(futures::poll!(wait).is_ready());
    }

    #[tokio::test]
    async fn waiter_unblocks_when_all_leave() {
        let barrier = BusyBarrier::new();
        for _ in 0..3 {
            barrier.enter();
        }
        assert_eq!(barrier.busy(), 3);

        let mut wait = Box::pin(barrier.wait(None));
        assert!(futures::poll!(&mut wait).is_pending());

        barrier.leave();
        barrier.leave();
        assert!(futures::poll!(&mut wait).is_pending());

        barrier.leave();
        assert_eq!(barrier.busy(), 0);
        assert!(futures::poll!(&mut wait).is_ready());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_workers_synchronize() {
        let barrier = Arc::new(BusyBarrier::new());
        for _ in 0..8 {
            barrier.enter();
        }

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    barrier.leave();
                    barrier.wait(Some(Duration::from_secs(10))).await
                })
            })
            .collect();

        for result in futures::future::join_all(workers).await {
            result.unwrap().unwrap();
        }
        assert_eq!(barrier.busy(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_a_worker_never_leaves() {
        let barrier = BusyBarrier::new();
        barrier.enter();
        barrier.enter();
        barrier.leave();

        let err = barrier
            .wait(Some(Duration::from_secs(30)))
            .await
            .unwrap_err();
        assert_eq!(err.busy, 1);
        assert_eq!(err.timeout, Duration::from_secs(30));
    }

    #[test]
    fn leave_does_not_underflow() {
        let barrier = BusyBarrier::new();
        barrier.leave();
        assert_eq!(barrier.busy(), 0);
    }
}
