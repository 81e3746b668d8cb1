//! Randomly selected queries from a workload, with occasional reconnects.

use std::sync::Arc;

use loadtest_core::error::{ConfigError, WorkerResult};
use loadtest_core::logged::LoggedClient;
use loadtest_core::tasks::{Flow, User, WeightedChoice};
use rand::Rng;
use rand::rngs::SmallRng;

use super::Environment;
use crate::config::RandomWeights;
use crate::sql::QuerySet;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RandomTask {
    RunQuery,
    Reconnect,
}

pub fn task_weights(weights: &RandomWeights) -> Result<WeightedChoice<RandomTask>, ConfigError> {
    WeightedChoice::new([
        (RandomTask::RunQuery, weights.run_query),
        (RandomTask::Reconnect, weights.reconnect),
    ])
}

#[derive(Debug)]
pub struct RandomUser {
    env: Arc<Environment>,
    queries: Arc<QuerySet>,
    client: LoggedClient,
    rng: SmallRng,
}

impl RandomUser {
    pub fn new(env: Arc<Environment>, queries: Arc<QuerySet>, rng: SmallRng) -> WorkerResult<Self> {
        let client = env.client()?;
        Ok(Self {
            env,
            queries,
            client,
            rng,
        })
    }
}

#[async_trait::async_trait]
impl User for RandomUser {
    type Task = RandomTask;

    async fn on_start(&mut self) -> WorkerResult<()> {
        self.env.connect(&mut self.client).await
    }

    async fn run_task(&mut self, task: RandomTask) -> WorkerResult<Flow> {
        match task {
            RandomTask::RunQuery => {
                let index = self.rng.random_range(0..self.queries.len());
                let query = &self.queries.queries()[index];
                self.client.logged_query(query).send().await?;
            }
            RandomTask::Reconnect => {
                self.env.reconnect(&mut self.client).await?;
            }
        }
        Ok(Flow::Continue)
    }
}
