//! An in-process client that imitates an Impala coordinator.
//!
//! Latencies follow a *LogNormal* distribution defined by `p50` and `p99`, which matches the
//! usual shape of query response times: most queries are fast, with a long tail. Statements that
//! do not produce rows (DDL, `SET`, `USE`, ...) raise [`ClientError::NoResultSet`], just like a
//! DB-API driver does when fetching from them.
//!
//! A [`SimulatedCluster`] is shared between all clients of a run. It tracks databases and
//! partition counts so that the partition growth scenario behaves like it does on a real cluster.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, LogNormal};
use serde_json::json;

use super::{ClientError, ClientResult, QueryClient, Rows, SimulatedConfig};

/// Number of most recent statements a [`SimulatedCluster`] remembers.
const RECORDED_STATEMENTS: usize = 10_000;

/// Cluster state shared by all [`SimulatedClient`]s of a run.
#[derive(Clone, Debug, Default)]
pub struct SimulatedCluster(Arc<Mutex<ClusterState>>);

#[derive(Debug, Default)]
struct ClusterState {
    dropped: HashSet<String>,
    partitions: HashMap<String, u64>,
    executed: VecDeque<String>,
    cancelled: u64,
}

impl SimulatedCluster {
    /// Returns the most recent statements, oldest first.
    ///
    /// Only the last 10 000 statements are kept, so long runs do not grow without bound.
    pub fn executed(&self) -> Vec<String> {
        self.0.lock().unwrap().executed.iter().cloned().collect()
    }

    /// Returns how often exactly this statement occurs among the recorded statements.
    pub fn count_of(&self, sql: &str) -> usize {
        let state = self.0.lock().unwrap();
        state.executed.iter().filter(|s| *s == sql).count()
    }

    /// Returns the number of cancelled asynchronous statements.
    pub fn cancelled(&self) -> u64 {
        self.0.lock().unwrap().cancelled
    }

    /// Returns the current partition count of a table.
    pub fn partitions(&self, table: &str) -> u64 {
        let state = self.0.lock().unwrap();
        state.partitions.get(table).copied().unwrap_or_default()
    }

    fn execute(&self, sql: &str) -> ClientResult<Option<Rows>> {
        let mut state = self.0.lock().unwrap();
        if state.executed.len() == RECORDED_STATEMENTS {
            state.executed.pop_front();
        }
        state.executed.push_back(sql.to_owned());

        let tokens: Vec<&str> = sql.split_whitespace().collect();
        let rest = |idx: usize| tokens.get(idx..).unwrap_or(&[]);
        let keyword = |idx: usize| {
            tokens
                .get(idx)
                .map(|t| t.to_ascii_uppercase())
                .unwrap_or_default()
        };

        match keyword(0).as_str() {
            "" => Err(ClientError::Query("empty statement".into())),
            "CREATE" if keyword(1) == "DATABASE" => {
                let db = object_name(rest(2));
                state.dropped.remove(&db);
                Err(ClientError::NoResultSet)
            }
            "CREATE" if keyword(1) == "TABLE" => {
                let table = object_name(rest(2));
                state.check_database(&table)?;
                state.partitions.entry(table).or_default();
                Err(ClientError::NoResultSet)
            }
            "DROP" if keyword(1) == "DATABASE" => {
                let db = object_name(rest(2));
                state.partitions.retain(|table, _| database_of(table) != db);
                state.dropped.insert(db);
                Err(ClientError::NoResultSet)
            }
            "ALTER" => {
                let table = object_name(rest(2));
                state.check_database(&table)?;
                if sql.to_ascii_uppercase().contains("ADD PARTITION") {
                    *state.partitions.entry(table).or_default() += 1;
                }
                Err(ClientError::NoResultSet)
            }
            "USE" => {
                state.check_database(&object_name(rest(1)))?;
                Err(ClientError::NoResultSet)
            }
            "EXPLAIN" => {
                let from = tokens.iter().position(|t| t.eq_ignore_ascii_case("FROM"));
                let table = from.map(|idx| object_name(rest(idx + 1)));
                let table = table.unwrap_or_default();
                state.check_database(&table)?;
                let count = state.partitions.get(&table).copied().unwrap_or_default();
                Ok(Some(Rows::new(vec![
                    vec![json!("Max Per-Host Resource Reservation: Memory=0B")],
                    vec![json!("")],
                    vec![json!(format!("00:SCAN HDFS [{table}]"))],
                    vec![json!(format!("   partitions=0/{count} files=0 size=0B"))],
                ])))
            }
            "SET" | "INVALIDATE" | "REFRESH" | "COMPUTE" | "INSERT" | "DROP" | "CREATE" => {
                Err(ClientError::NoResultSet)
            }
            _ => Ok(None),
        }
    }
}

impl ClusterState {
    fn check_database(&self, object: &str) -> ClientResult<()> {
        let db = database_of(object);
        if self.dropped.contains(db) {
            return Err(ClientError::Query(format!(
                "AnalysisException: Database does not exist: {db}"
            )));
        }
        Ok(())
    }
}

/// Extracts the object name following optional `IF [NOT] EXISTS` clauses.
fn object_name(tokens: &[&str]) -> String {
    let name = tokens
        .iter()
        .find(|t| {
            !["IF", "NOT", "EXISTS"]
                .iter()
                .any(|kw| t.eq_ignore_ascii_case(kw))
        })
        .copied()
        .unwrap_or_default();

    name.trim_matches(|c: char| !(c.is_alphanumeric() || c == '_' || c == '.'))
        .to_ascii_lowercase()
}

fn database_of(object: &str) -> &str {
    object.split('.').next().unwrap_or(object)
}

#[derive(Debug)]
enum Latency {
    Fixed(Duration),
    LogNormal(LogNormal<f64>),
}

impl Latency {
    fn new(p50: Duration, p99: Duration) -> Self {
        if p50.is_zero() || p99 <= p50 {
            return Latency::Fixed(p50);
        }

        // Same derivation as for payload sizes: p99 sits 2.3263 standard deviations above the median.
        let mu = p50.as_secs_f64().ln();
        let sigma = (p99.as_secs_f64().ln() - mu) / 2.3263;
        match LogNormal::new(mu, sigma) {
            Ok(distribution) => Latency::LogNormal(distribution),
            Err(_) => Latency::Fixed(p50),
        }
    }

    fn sample(&self, rng: &mut SmallRng) -> Duration {
        match self {
            Latency::Fixed(duration) => *duration,
            Latency::LogNormal(distribution) => {
                Duration::from_secs_f64(distribution.sample(rng).min(3600.0))
            }
        }
    }
}

/// A [`QueryClient`] that answers from a [`SimulatedCluster`] instead of a real server.
#[derive(Debug)]
pub struct SimulatedClient {
    cluster: SimulatedCluster,
    rng: SmallRng,
    latency: Latency,
    failure_rate: f64,
    host: Option<String>,
    pending: Option<String>,
}

impl SimulatedClient {
    /// Creates a new, unconnected client.
    pub fn new(config: &SimulatedConfig, cluster: SimulatedCluster, seed: u64) -> Self {
        Self {
            cluster,
            rng: SmallRng::seed_from_u64(seed),
            latency: Latency::new(config.p50, config.p99),
            failure_rate: config.failure_rate.clamp(0.0, 1.0),
            host: None,
            pending: None,
        }
    }

    fn check_connected(&self) -> ClientResult<()> {
        match self.host {
            Some(_) => Ok(()),
            None => Err(ClientError::NotConnected),
        }
    }
}

#[async_trait::async_trait]
impl QueryClient for SimulatedClient {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn connect(&mut self, host: &str, _port: u16) -> ClientResult<()> {
        if host.is_empty() {
            return Err(ClientError::Connection("empty host name".into()));
        }
        self.host = Some(host.to_owned());
        Ok(())
    }

    async fn disconnect(&mut self) -> ClientResult<()> {
        self.host = None;
        self.pending = None;
        Ok(())
    }

    async fn query(&mut self, sql: &str) -> ClientResult<Rows> {
        self.check_connected()?;

        let latency = self.latency.sample(&mut self.rng);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        match self.cluster.execute(sql)? {
            Some(rows) => Ok(rows),
            None => {
                if self.failure_rate > 0.0 && self.rng.random_bool(self.failure_rate) {
                    return Err(ClientError::Query("simulated failure".into()));
                }
                let len = self.rng.random_range(1..=10);
                let rows = (0..len).map(|i| vec![json!(i), json!(format!("row-{i}"))]);
                Ok(Rows::new(rows.collect()))
            }
        }
    }

    async fn execute_async(&mut self, sql: &str) -> ClientResult<()> {
        self.check_connected()?;
        self.pending = Some(sql.to_owned());
        Ok(())
    }

    async fn cancel_operation(&mut self) -> ClientResult<()> {
        self.check_connected()?;
        match self.pending.take() {
            Some(_) => {
                self.cluster.0.lock().unwrap().cancelled += 1;
                Ok(())
            }
            None => Err(ClientError::NoPendingOperation),
        }
    }
}
