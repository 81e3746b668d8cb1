//! Strictly sequential worker stages for throughput measurements.
//!
//! Each worker walks through [`Stage`]s in order: it connects, optionally warms the cache (on
//! exactly one worker), signals readiness, waits for all peers, runs its workload and stops.

use std::fmt;
use std::time::Duration;

use crate::barrier::BusyBarrier;
use crate::error::WorkerResult;
use crate::warmup::WarmupOnce;

/// The stages of a staged worker.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stage {
    /// Connecting and preparing the session.
    Setup,
    /// Running the shared warmup, or skipping it.
    WarmupCheck,
    /// Setup is done, waiting for the other workers.
    Ready,
    /// Executing the measured workload.
    Running,
    /// Done. The worker's loop terminates.
    Stopped,
}

impl Stage {
    /// Returns the stage that follows this one. [`Stage::Stopped`] is terminal.
    pub fn next(self) -> Self {
        match self {
            Stage::Setup => Stage::WarmupCheck,
            Stage::WarmupCheck => Stage::Ready,
            Stage::Ready => Stage::Running,
            Stage::Running | Stage::Stopped => Stage::Stopped,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Setup => "setup",
            Stage::WarmupCheck => "warmup-check",
            Stage::Ready => "ready",
            Stage::Running => "running",
            Stage::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// A worker that can be driven through the [`Stage`]s by [`run_staged`].
#[async_trait::async_trait]
pub trait StagedWorker: Send {
    /// Connects and prepares the worker.
    async fn setup(&mut self) -> WorkerResult<()>;

    /// Warms caches. Called on at most one worker per [`Coordination`].
    async fn warmup(&mut self) -> WorkerResult<()>;

    /// Runs the measured workload to completion.
    async fn run(&mut self) -> WorkerResult<()>;
}

/// State shared by all staged workers of a run.
#[derive(Debug)]
pub struct Coordination {
    /// Busy counter gating the [`Stage::Running`] stage.
    pub barrier: BusyBarrier,
    /// Guard making sure the warmup runs once.
    pub warmup: WarmupOnce,
    /// Whether a warmup should run at all.
    pub warmup_enabled: bool,
    /// Maximum time to wait for peers in [`Stage::Ready`].
    pub barrier_timeout: Option<Duration>,
    /// Pause after setup, giving workers that are still spawning a chance to enter the barrier.
    pub settle_delay: Duration,
    /// Whether all workers were registered with the barrier up front.
    pub preregistered: bool,
}

impl Coordination {
    /// Creates a fresh coordination state.
    pub fn new(warmup_enabled: bool) -> Self {
        Self {
            barrier: BusyBarrier::new(),
            warmup: WarmupOnce::new(),
            warmup_enabled,
            barrier_timeout: None,
            settle_delay: Duration::ZERO,
            preregistered: false,
        }
    }

    /// Registers `workers` busy slots with the barrier before any worker starts.
    ///
    /// Needed when workers are spawned over time: otherwise the first workers find the barrier
    /// idle and start measuring before the last ones were even spawned. Every registered worker
    /// must reach [`run_staged`], or release its slot with `barrier.leave()`.
    pub fn expect_workers(mut self, workers: usize) -> Self {
        for _ in 0..workers {
            self.barrier.enter();
        }
        self.preregistered = true;
        self
    }

    /// Sets the maximum time to wait for peers.
    pub fn barrier_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.barrier_timeout = timeout;
        self
    }

    /// Sets the pause after setup.
    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }
}

/// Drives `worker` through all stages until it is [`Stage::Stopped`].
///
/// The worker enters the busy barrier before setup, unless its slot was registered through
/// [`Coordination::expect_workers`], and always leaves it again, even if setup or warmup fail, so
/// that a broken worker does not stall its peers.
pub async fn run_staged<W>(worker: &mut W, coordination: &Coordination) -> WorkerResult<Stage>
where
    W: StagedWorker + ?Sized,
{
    let mut stage = Stage::Setup;
    if !coordination.preregistered {
        coordination.barrier.enter();
    }

    let prepared = async {
        worker.setup().await?;
        if !coordination.settle_delay.is_zero() {
            tokio::time::sleep(coordination.settle_delay).await;
        }

        stage = stage.next();
        debug_assert_eq!(stage, Stage::WarmupCheck);
        if coordination.warmup_enabled {
            let ran = coordination.warmup.run_once(worker.warmup()).await?;
            if ran {
                tracing::info!("warmup complete");
            }
        }
        WorkerResult::Ok(())
    }
    .await;

    coordination.barrier.leave();
    if let Err(err) = prepared {
        tracing::error!(%stage, error = &err as &dyn std::error::Error, "worker failed to prepare");
        return Err(err);
    }

    stage = stage.next();
    tracing::info!(%stage, "worker is ready");
    coordination
        .barrier
        .wait(coordination.barrier_timeout)
        .await?;

    stage = stage.next();
    tracing::info!(%stage, "starting workload");
    worker.run().await?;

    stage = stage.next();
    tracing::info!(%stage, "workload completed");
    Ok(stage)
}
