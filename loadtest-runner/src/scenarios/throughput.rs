//! Throughput test: every user runs the whole workload in order after a shared warmup.
//!
//! Users go through the stages of [`run_staged`]. Measurement only starts once every user is
//! connected and the warmup finished, so the warmup never overlaps with measured queries.

use std::sync::Arc;

use loadtest_core::error::WorkerResult;
use loadtest_core::logged::LoggedClient;
use loadtest_core::staging::{Coordination, StagedWorker, run_staged};
use loadtest_core::swarm::run_swarm;
use tokio::time::Instant;

use super::Environment;
use crate::config::Config;
use crate::sql::QuerySet;

pub async fn run(
    config: &Config,
    env: Arc<Environment>,
    queries: Arc<QuerySet>,
    coordination: Coordination,
    iterations: u32,
    deadline: Option<Instant>,
) -> Vec<WorkerResult<()>> {
    // Workers may be spawned over time, all of them have to be set up before anyone measures.
    let coordination = Arc::new(coordination.expect_workers(config.users));

    run_swarm(config.users, config.spawn_rate, |_| {
        let env = Arc::clone(&env);
        let queries = Arc::clone(&queries);
        let coordination = Arc::clone(&coordination);
        async move {
            let client = match env.client() {
                Ok(client) => client,
                Err(err) => {
                    coordination.barrier.leave();
                    return Err(err);
                }
            };
            let mut worker = ThroughputWorker {
                client,
                env,
                queries,
                iterations,
                deadline,
            };
            run_staged(&mut worker, &coordination).await?;
            Ok(())
        }
    })
    .await
}

#[derive(Debug)]
struct ThroughputWorker {
    env: Arc<Environment>,
    queries: Arc<QuerySet>,
    client: LoggedClient,
    iterations: u32,
    deadline: Option<Instant>,
}

#[async_trait::async_trait]
impl StagedWorker for ThroughputWorker {
    async fn setup(&mut self) -> WorkerResult<()> {
        self.env.connect(&mut self.client).await
    }

    async fn warmup(&mut self) -> WorkerResult<()> {
        tracing::info!(queries = self.queries.len(), "warming up");
        for query in self.queries.queries() {
            if let Err(err) = self.client.execute_unlogged(query.sql()).await {
                tracing::warn!(
                    query = query.name(),
                    error = &err as &dyn std::error::Error,
                    "warmup query failed"
                );
            }
        }
        Ok(())
    }

    async fn run(&mut self) -> WorkerResult<()> {
        for iteration in 0..self.iterations {
            tracing::debug!(iteration, "starting iteration");
            for query in self.queries.queries() {
                if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    tracing::info!(iteration, "duration elapsed, stopping early");
                    return Ok(());
                }
                if let Err(err) = self.client.logged_query(query).send().await {
                    tracing::debug!(
                        query = query.name(),
                        error = &err as &dyn std::error::Error,
                        "query failed, continuing with the next one"
                    );
                }
            }
        }
        Ok(())
    }
}
