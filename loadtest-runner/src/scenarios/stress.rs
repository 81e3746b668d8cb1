//! Stress test mixing regular queries with queries that are cancelled while running.
//!
//! A query is only cancelled once it has completed normally at least once. The cancellation
//! delay is a random multiple of its median response time, so cancellations hit queries at
//! different points of their execution.

use std::sync::Arc;

use loadtest_core::client::Query;
use loadtest_core::error::{ConfigError, WorkerResult};
use loadtest_core::logged::LoggedClient;
use loadtest_core::tasks::{Flow, User, WeightedChoice};
use rand::Rng;
use rand::rngs::SmallRng;

use super::Environment;
use crate::config::StressWeights;
use crate::sql::QuerySet;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StressTask {
    RunBasicQuery,
    CancelQuery,
}

pub fn task_weights(weights: &StressWeights) -> Result<WeightedChoice<StressTask>, ConfigError> {
    WeightedChoice::new([
        (StressTask::RunBasicQuery, weights.run_basic_query),
        (StressTask::CancelQuery, weights.cancel_query),
    ])
}

#[derive(Debug)]
pub struct StressUser {
    env: Arc<Environment>,
    queries: Arc<QuerySet>,
    client: LoggedClient,
    bounds: (f64, f64),
    rng: SmallRng,
}

impl StressUser {
    pub fn new(
        env: Arc<Environment>,
        queries: Arc<QuerySet>,
        bounds: (f64, f64),
        rng: SmallRng,
    ) -> WorkerResult<Self> {
        let client = env.client()?;
        Ok(Self {
            env,
            queries,
            client,
            bounds,
            rng,
        })
    }

    async fn run_basic_query(&mut self) -> WorkerResult<()> {
        let index = self.rng.random_range(0..self.queries.len());
        let query = &self.queries.queries()[index];
        self.client.logged_query(query).send().await?;
        tracing::debug!(query = query.name(), "ran query");
        Ok(())
    }

    async fn cancel_query(&mut self) -> WorkerResult<()> {
        let stats = self.env.stats();
        let candidates: Vec<(&Query, _)> = self
            .queries
            .queries()
            .iter()
            .filter_map(|query| Some((query, stats.median(query.name())?)))
            .collect();

        if candidates.is_empty() {
            tracing::debug!("no completed queries to cancel yet");
            return Ok(());
        }

        let (query, median) = candidates[self.rng.random_range(0..candidates.len())];
        let (lower, upper) = self.bounds;
        let delay = median.mul_f64(self.rng.random_range(lower..=upper));

        tracing::debug!(query = query.name(), ?delay, "starting query to cancel");
        self.client.logged_cancel(query, delay).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl User for StressUser {
    type Task = StressTask;

    async fn on_start(&mut self) -> WorkerResult<()> {
        self.env.connect(&mut self.client).await
    }

    async fn run_task(&mut self, task: StressTask) -> WorkerResult<Flow> {
        match task {
            StressTask::RunBasicQuery => self.run_basic_query().await?,
            StressTask::CancelQuery => self.cancel_query().await?,
        }
        Ok(Flow::Continue)
    }
}
