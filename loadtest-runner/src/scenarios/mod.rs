//! The load tests that can be run against a cluster.
//!
//! Every scenario spawns `users` concurrent workers through [`run_swarm`]. Each worker owns its
//! own [`LoggedClient`], so every measured query ends up in the shared [`Stats`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use loadtest_core::client::{ClientFactory, QueryClient};
use loadtest_core::error::{WorkerError, WorkerResult};
use loadtest_core::events::Stats;
use loadtest_core::logged::LoggedClient;
use loadtest_core::nodes::NodeRotation;
use loadtest_core::staging::Coordination;
use loadtest_core::swarm::run_swarm;
use loadtest_core::tasks::{User, WeightedChoice, run_user};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use tokio::time::Instant;

use crate::config::{Config, Scenario};
use crate::sql::{QuerySet, parse_queries_from_file};

mod partitions;
mod random;
mod stress;
mod throughput;

pub use self::partitions::parse_partition_count;

/// Outcome of a finished run.
#[derive(Debug)]
pub struct RunSummary {
    /// Name of the scenario type.
    pub scenario: &'static str,
    /// Number of users that were started.
    pub users: usize,
    /// Wall-clock time from the first spawn until the last user finished.
    pub elapsed: Duration,
    /// One result per user, in spawn order.
    pub results: Vec<WorkerResult<()>>,
}

impl RunSummary {
    /// Users that ended with an error.
    pub fn failed_users(&self) -> impl Iterator<Item = (usize, &WorkerError)> {
        self.results
            .iter()
            .enumerate()
            .filter_map(|(index, result)| result.as_ref().err().map(|err| (index, err)))
    }
}

/// Runs the configured scenario to completion.
///
/// Creates clients from `factory` and records every measured query in `stats`.
pub async fn run(config: &Config, factory: ClientFactory, stats: Arc<Stats>) -> Result<RunSummary> {
    config.validate()?;
    let scenario = config.scenario()?;
    let env = Arc::new(Environment::new(config, factory, stats)?);

    if let Some(setup) = &config.setup {
        let statements = parse_queries_from_file(&setup.file, &setup.replacements)?;
        env.run_setup(&statements)
            .await
            .context("failed to run setup script")?;
    }

    let start = Instant::now();
    let deadline = config.duration.map(|duration| start + duration);
    tracing::info!(
        scenario = scenario.name(),
        users = config.users,
        duration = ?config.duration,
        "starting load test"
    );

    let results = match scenario {
        Scenario::Random {
            queries, weights, ..
        } => {
            let queries = Arc::new(load_queries(queries)?);
            let tasks = random::task_weights(weights)?;
            spawn_users(config, tasks, deadline, |rng| {
                random::RandomUser::new(Arc::clone(&env), Arc::clone(&queries), rng)
            })
            .await
        }
        Scenario::Throughput {
            queries,
            num_iterations,
            warmup,
            barrier_timeout,
            settle_delay,
        } => {
            let queries = Arc::new(load_queries(queries)?);
            let coordination = Coordination::new(*warmup)
                .barrier_timeout(*barrier_timeout)
                .settle_delay(*settle_delay);
            throughput::run(config, env, queries, coordination, *num_iterations, deadline).await
        }
        Scenario::Stress {
            queries,
            weights,
            query_timeout,
        } => {
            let queries = Arc::new(load_queries(queries)?);
            let tasks = stress::task_weights(weights)?;
            let bounds = (query_timeout.lower_bound, query_timeout.upper_bound);
            spawn_users(config, tasks, deadline, |rng| {
                stress::StressUser::new(Arc::clone(&env), Arc::clone(&queries), bounds, rng)
            })
            .await
        }
        Scenario::Partitions {
            partition_limit,
            setup_database,
            add_partition_task,
            drop_database_task,
        } => {
            let target = Arc::new(partitions::Target::new(
                setup_database,
                add_partition_task,
                drop_database_task,
                *partition_limit,
            ));
            partitions::setup_database(&env, &target)
                .await
                .context("failed to set up test database")?;
            let tasks = partitions::task_weights(add_partition_task, drop_database_task)?;
            spawn_users(config, tasks, deadline, |_| {
                partitions::PartitionUser::new(Arc::clone(&env), Arc::clone(&target))
            })
            .await
        }
    };

    let elapsed = start.elapsed();
    tracing::info!(?elapsed, "load test finished");

    Ok(RunSummary {
        scenario: scenario.name(),
        users: config.users,
        elapsed,
        results,
    })
}

fn load_queries(dir: &std::path::Path) -> Result<QuerySet> {
    let queries = QuerySet::from_dir(dir)?;
    tracing::info!(dir = %dir.display(), count = queries.len(), "loaded workload");
    Ok(queries)
}

/// Spawns `config.users` users that run weighted random tasks until they stop or time runs out.
///
/// `make_user` receives a random generator for the user's own choices.
async fn spawn_users<U, F>(
    config: &Config,
    tasks: WeightedChoice<U::Task>,
    deadline: Option<Instant>,
    mut make_user: F,
) -> Vec<WorkerResult<()>>
where
    U: User + 'static,
    U::Task: 'static,
    F: FnMut(SmallRng) -> WorkerResult<U>,
{
    let tasks = Arc::new(tasks);
    let wait_time = config.wait_time.to_wait_time();
    let seed = config.seed;

    run_swarm(config.users, config.spawn_rate, |index| {
        let mut rng = user_rng(seed, index);
        let user = make_user(SmallRng::from_rng(&mut rng));
        let tasks = Arc::clone(&tasks);
        async move {
            let user = user?;
            run_user(user, &tasks, wait_time, deadline, rng).await
        }
    })
    .await
}

/// Returns the random generator of one user, reproducible if a seed is configured.
pub(crate) fn user_rng(seed: Option<u64>, index: usize) -> SmallRng {
    match seed {
        Some(seed) => SmallRng::seed_from_u64(seed.wrapping_add(index as u64)),
        None => SmallRng::from_os_rng(),
    }
}

/// Everything users need to create and connect their clients.
#[derive(Debug)]
pub(crate) struct Environment {
    factory: ClientFactory,
    stats: Arc<Stats>,
    nodes: NodeRotation,
    port: u16,
    target_db: Option<String>,
}

impl Environment {
    fn new(config: &Config, factory: ClientFactory, stats: Arc<Stats>) -> Result<Self> {
        // A coordinator takes all connections, so it replaces the rotation.
        let nodes = match &config.coordinator {
            Some(coordinator) => NodeRotation::new([coordinator.as_str()])?,
            None => NodeRotation::new(config.nodes.iter().map(String::as_str))?,
        };

        Ok(Self {
            factory,
            stats,
            nodes,
            port: config.port,
            target_db: config.target_db.clone(),
        })
    }

    pub(crate) fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    /// Creates a new, unconnected client reporting to the shared stats.
    pub(crate) fn client(&self) -> WorkerResult<LoggedClient> {
        let client = self.factory.create()?;
        Ok(LoggedClient::new(client, self.stats.clone()))
    }

    /// Connects to the next node of the rotation and switches to the target database.
    pub(crate) async fn connect(&self, client: &mut LoggedClient) -> WorkerResult<()> {
        let host = self.nodes.next().to_owned();
        self.connect_to(client, &host).await
    }

    /// Closes the connection and opens a new one to the same host.
    pub(crate) async fn reconnect(&self, client: &mut LoggedClient) -> WorkerResult<()> {
        let host = match client.host() {
            Some(host) => host.to_owned(),
            None => self.nodes.next().to_owned(),
        };
        client.disconnect().await?;
        self.connect_to(client, &host).await
    }

    async fn connect_to(&self, client: &mut LoggedClient, host: &str) -> WorkerResult<()> {
        client.connect(host, self.port).await?;
        if let Some(db) = &self.target_db {
            client.execute_unlogged(&format!("USE {db}")).await?;
        }
        tracing::debug!(host, "connected");
        Ok(())
    }

    /// Connects a one-off client to the first node, for work done before the users start.
    pub(crate) async fn setup_client(&self) -> WorkerResult<LoggedClient> {
        let mut client = self.client()?;
        let host = self.nodes.nodes()[0].clone();
        client.connect(&host, self.port).await?;
        Ok(client)
    }

    async fn run_setup(&self, statements: &[String]) -> WorkerResult<()> {
        let mut client = self.setup_client().await?;
        for statement in statements {
            tracing::info!(statement = %statement, "running setup statement");
            client.execute_unlogged(statement).await?;
        }
        client.disconnect().await?;
        Ok(())
    }
}
