//! Partition growth test: users add partitions to one table until its database is dropped.
//!
//! The test table is created before any user starts:
//!
//! ```sql
//! CREATE TABLE <db>.<table> (s string) PARTITIONED BY (key1 int, key2 int)
//! ```
//!
//! Once the partition count exceeds the limit, some user drops the whole database. Adding
//! partitions fails from then on, which stops the users one after another. Those failures are
//! expected and show up in the report.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use loadtest_core::client::{Query, QueryClient, Rows};
use loadtest_core::error::{ConfigError, WorkerResult};
use loadtest_core::logged::LoggedClient;
use loadtest_core::tasks::{Flow, User, WeightedChoice};

use super::Environment;
use crate::config::{AddPartitionTask, DropDatabaseTask, SetupDatabase};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PartitionTask {
    AddPartition,
    DropDatabase,
}

pub fn task_weights(
    add: &AddPartitionTask,
    drop: &DropDatabaseTask,
) -> Result<WeightedChoice<PartitionTask>, ConfigError> {
    WeightedChoice::new([
        (PartitionTask::AddPartition, add.frequency),
        (PartitionTask::DropDatabase, drop.frequency),
    ])
}

/// The database and table under test, with all statements resolved.
#[derive(Debug)]
pub struct Target {
    db: String,
    table: String,
    add_partition: String,
    drop_database: String,
    explain: String,
    partition_limit: u64,
}

impl Target {
    pub fn new(
        setup: &SetupDatabase,
        add: &AddPartitionTask,
        drop: &DropDatabaseTask,
        partition_limit: u64,
    ) -> Self {
        let table = format!("{}.{}", setup.db, setup.table);
        Self {
            add_partition: add.query.replace("{tbl}", &table),
            drop_database: drop.query.replace("{db}", &setup.db),
            explain: format!("EXPLAIN SELECT count(*) FROM {table}"),
            db: setup.db.clone(),
            table,
            partition_limit,
        }
    }
}

/// Creates the test database and table with `SYNC_DDL`, so every node sees them right away.
pub async fn setup_database(env: &Environment, target: &Target) -> WorkerResult<()> {
    tracing::info!(db = %target.db, table = %target.table, "setting up test database");

    let mut client = env.setup_client().await?;
    let statements = [
        format!("CREATE DATABASE IF NOT EXISTS {}", target.db),
        format!(
            "CREATE TABLE IF NOT EXISTS {} (s string) PARTITIONED BY (key1 int, key2 int)",
            target.table
        ),
    ];
    for statement in statements {
        let query = Query::new(statement);
        client.logged_query(&query).sync_ddl(true).send().await?;
    }
    client.disconnect().await?;
    Ok(())
}

/// Extracts the partition count from `EXPLAIN SELECT count(*)` output.
///
/// The count is the total in a row like `   partitions=0/1590 files=0 size=0B`.
pub fn parse_partition_count(rows: &Rows) -> Option<u64> {
    let line = rows
        .iter()
        .filter_map(|row| row.first()?.as_str())
        .find(|line| line.contains("partitions="))?;

    let (_, total) = line.split_once('/')?;
    total.split_whitespace().next()?.parse().ok()
}

/// Partition keys that are unique per 10ns, derived from the current time.
fn partition_keys(now: SystemTime) -> String {
    let since_epoch = now.duration_since(UNIX_EPOCH).unwrap_or_default();
    format!(
        "(key1={}, key2={})",
        since_epoch.subsec_nanos() / 10,
        since_epoch.as_secs()
    )
}

#[derive(Debug)]
pub struct PartitionUser {
    env: Arc<Environment>,
    target: Arc<Target>,
    client: LoggedClient,
}

impl PartitionUser {
    pub fn new(env: Arc<Environment>, target: Arc<Target>) -> WorkerResult<Self> {
        let client = env.client()?;
        Ok(Self {
            env,
            target,
            client,
        })
    }

    /// Query names carry the short host name, so the report shows which node was slow.
    fn named(&self, sql: String, template: &str) -> Query {
        let name = format!("{}: {template}", self.client.hostname());
        Query::new(sql).with_name(name)
    }

    async fn add_partition(&mut self) -> Flow {
        let sql = format!(
            "{} {}",
            self.target.add_partition,
            partition_keys(SystemTime::now())
        );
        let query = self.named(sql, &self.target.add_partition);

        match self.client.logged_query(&query).send().await {
            Ok(_) => Flow::Continue,
            Err(err) => {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "adding partition failed, stopping user"
                );
                Flow::Stop
            }
        }
    }

    async fn drop_database(&mut self) -> WorkerResult<()> {
        let explain = self.named(self.target.explain.clone(), &self.target.explain);
        let rows = self
            .client
            .logged_query(&explain)
            .return_response(true)
            .send()
            .await?;

        let Some(partitions) = rows.as_ref().and_then(parse_partition_count) else {
            tracing::warn!("no partition count in EXPLAIN output");
            return Ok(());
        };
        tracing::info!(partitions, "current partition count");

        if partitions > self.target.partition_limit {
            let drop_database = self.named(
                self.target.drop_database.clone(),
                &self.target.drop_database,
            );
            self.client.logged_query(&drop_database).send().await?;
            tracing::info!(db = %self.target.db, partitions, "dropped database");
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl User for PartitionUser {
    type Task = PartitionTask;

    async fn on_start(&mut self) -> WorkerResult<()> {
        self.env.connect(&mut self.client).await
    }

    async fn run_task(&mut self, task: PartitionTask) -> WorkerResult<Flow> {
        match task {
            PartitionTask::AddPartition => Ok(self.add_partition().await),
            PartitionTask::DropDatabase => {
                self.drop_database().await?;
                Ok(Flow::Continue)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    #[test]
    fn partition_count_from_explain() {
        let rows = Rows::new(vec![
            vec![json!("Max Per-Host Resource Reservation: Memory=0B")],
            vec![json!("")],
            vec![json!("00:SCAN HDFS [db.t]")],
            vec![json!("   partitions=0/1590 files=0 size=0B")],
        ]);
        assert_eq!(parse_partition_count(&rows), Some(1590));
    }

    #[test]
    fn partition_count_missing() {
        assert_eq!(parse_partition_count(&Rows::default()), None);

        let rows = Rows::new(vec![vec![json!(42)], vec![json!("partitions=garbage")]]);
        assert_eq!(parse_partition_count(&rows), None);
    }

    #[test]
    fn keys_from_time() {
        let now = UNIX_EPOCH + Duration::new(1_600_000_000, 123_456_789);
        assert_eq!(partition_keys(now), "(key1=12345678, key2=1600000000)");
    }

    #[test]
    fn statements_are_resolved() {
        let target = Target::new(
            &SetupDatabase::default(),
            &AddPartitionTask::default(),
            &DropDatabaseTask::default(),
            10,
        );
        assert_eq!(
            target.add_partition,
            "ALTER TABLE loadtest_db.loadtest_table ADD PARTITION"
        );
        assert_eq!(target.drop_database, "DROP DATABASE loadtest_db CASCADE");
        assert_eq!(
            target.explain,
            "EXPLAIN SELECT count(*) FROM loadtest_db.loadtest_table"
        );
    }
}
