//! Spawning and joining a swarm of concurrent workers.

use std::future::Future;
use std::time::Duration;

use crate::error::{WorkerError, WorkerResult};

/// Spawns `users` workers and waits for all of them to finish.
///
/// `make_worker` is called with the index of each worker and returns the future driving it. With
/// a `spawn_rate`, workers are started at that many per second instead of all at once.
///
/// Returns one result per worker, in spawn order. A panicking worker yields
/// [`WorkerError::Panicked`] instead of tearing down the run.
pub async fn run_swarm<F, Fut>(
    users: usize,
    spawn_rate: Option<f64>,
    mut make_worker: F,
) -> Vec<WorkerResult<()>>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = WorkerResult<()>> + Send + 'static,
{
    let spawn_interval = spawn_rate
        .filter(|rate| rate.is_finite() && *rate > 0.0)
        .map(|rate| Duration::from_secs_f64(1.0 / rate));

    let mut handles = Vec::with_capacity(users);
    for index in 0..users {
        if index > 0
            && let Some(interval) = spawn_interval
        {
            tokio::time::sleep(interval).await;
        }

        tracing::debug!(index, "spawning worker");
        handles.push(tokio::spawn(make_worker(index)));
    }
    tracing::info!(users, "all workers spawned");

    futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|joined| match joined {
            Ok(result) => result,
            Err(err) => Err(WorkerError::Panicked(err.to_string())),
        })
        .collect()
}
