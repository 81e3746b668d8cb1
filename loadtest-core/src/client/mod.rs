//! The capability set every database client adapter implements.
//!
//! Workers never talk to a driver directly. They hold a [`BoxedClient`], usually wrapped in a
//! [`LoggedClient`](crate::logged::LoggedClient), so one adapter can be swapped for another
//! without touching the scenarios.

use std::fmt::{self, Debug};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod http;
mod simulated;

pub use self::http::HttpClient;
pub use self::simulated::{SimulatedClient, SimulatedCluster};

/// User agent used for outgoing HTTP requests.
pub const USER_AGENT: &str = concat!("impala-loadtest/", env!("CARGO_PKG_VERSION"));

/// A type-erased [`QueryClient`] instance.
pub type BoxedClient = Box<dyn QueryClient>;

/// The operations the harness needs from a database client.
///
/// Adapters must implement all of them. Whether an error counts as a real failure is decided by
/// [`is_benign`](QueryClient::is_benign), since drivers differ in how they report statements that
/// succeed without producing a result set.
#[async_trait::async_trait]
pub trait QueryClient: Debug + Send + Sync + 'static {
    /// The adapter name, used for diagnostics.
    fn name(&self) -> &'static str;

    /// Opens a connection to the given host.
    async fn connect(&mut self, host: &str, port: u16) -> ClientResult<()>;

    /// Closes the current connection, if any.
    async fn disconnect(&mut self) -> ClientResult<()>;

    /// Executes a statement and fetches all of its rows.
    async fn query(&mut self, sql: &str) -> ClientResult<Rows>;

    /// Starts a statement without waiting for it to finish.
    async fn execute_async(&mut self, sql: &str) -> ClientResult<()>;

    /// Cancels the statement started by the last [`execute_async`](QueryClient::execute_async).
    async fn cancel_operation(&mut self) -> ClientResult<()>;

    /// Returns `true` if the error means "succeeded, but there is nothing to fetch".
    fn is_benign(&self, error: &ClientError) -> bool {
        matches!(error, ClientError::NoResultSet)
    }
}

/// Errors reported by a [`QueryClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// The statement succeeded but has no fetchable rows, e.g. `INVALIDATE METADATA`.
    #[error("statement returned no result set")]
    NoResultSet,

    /// A statement was issued before `connect`.
    #[error("client is not connected")]
    NotConnected,

    /// `cancel_operation` was called without a running asynchronous statement.
    #[error("no asynchronous operation to cancel")]
    NoPendingOperation,

    /// Establishing the connection failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The server rejected or failed the statement.
    #[error("query failed: {0}")]
    Query(String),

    /// Transport errors from the HTTP adapter.
    #[error("http error: {context}")]
    Http {
        /// What the client was doing.
        context: String,
        /// The underlying reqwest error.
        #[source]
        cause: reqwest::Error,
    },
}

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// A single row of a result set.
pub type Row = Vec<serde_json::Value>;

/// All rows fetched for one statement.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rows(Vec<Row>);

impl Rows {
    /// Creates a result set from the given rows.
    pub fn new(rows: Vec<Row>) -> Self {
        Self(rows)
    }

    /// Returns the number of rows.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if there are no rows.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over the rows in order.
    pub fn iter(&self) -> impl Iterator<Item = &Row> {
        self.0.iter()
    }

    /// Size of the result set in bytes, as serialized to JSON.
    ///
    /// Empty result sets have size `0`.
    pub fn serialized_size(&self) -> u64 {
        if self.0.is_empty() {
            return 0;
        }
        serde_json::to_vec(&self.0)
            .map(|bytes| bytes.len() as u64)
            .unwrap_or_default()
    }
}

impl From<Vec<Row>> for Rows {
    fn from(rows: Vec<Row>) -> Self {
        Self(rows)
    }
}

/// A statement together with the name it is reported under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Query {
    sql: String,
    name: String,
}

impl Query {
    /// Creates a query that is reported under its own text.
    pub fn new(sql: impl Into<String>) -> Self {
        let sql = sql.into();
        Self {
            name: sql.clone(),
            sql,
        }
    }

    /// Reports the query under the given name instead of its text.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// The statement text.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// The name used for grouping statistics.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Configuration of the simulated client.
#[derive(Clone, Debug)]
pub struct SimulatedConfig {
    /// Median statement latency.
    pub p50: Duration,
    /// 99th percentile statement latency.
    pub p99: Duration,
    /// Probability in `[0, 1]` that a read query fails.
    pub failure_rate: f64,
    /// Seed for reproducible runs. Each client derives its own seed from it.
    pub seed: Option<u64>,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            p50: Duration::ZERO,
            p99: Duration::ZERO,
            failure_rate: 0.0,
            seed: None,
        }
    }
}

/// Configuration of the HTTP gateway client.
#[derive(Clone, Default)]
pub struct HttpConfig {
    /// Use `https` instead of `http`.
    pub ssl: bool,
    /// User for basic authentication.
    pub user: Option<String>,
    /// Password for basic authentication.
    pub password: Option<String>,
    /// Timeout applied to every request.
    pub timeout: Option<Duration>,
}

impl fmt::Debug for HttpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConfig")
            .field("ssl", &self.ssl)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[redacted]"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Which adapter to create for each worker.
#[derive(Clone, Debug)]
pub enum ClientConfig {
    /// In-process client with synthetic latencies, see [`SimulatedClient`].
    Simulated(SimulatedConfig),
    /// Client for an HTTP SQL gateway, see [`HttpClient`].
    Http(HttpConfig),
}

/// Creates a fresh client for every worker from a shared [`ClientConfig`].
///
/// All simulated clients created by one factory share a single [`SimulatedCluster`].
#[derive(Clone, Debug)]
pub struct ClientFactory {
    config: ClientConfig,
    cluster: SimulatedCluster,
    created: Arc<AtomicU64>,
}

impl ClientFactory {
    /// Creates a factory for the given configuration.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            cluster: SimulatedCluster::default(),
            created: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The state shared by all simulated clients of this factory.
    pub fn cluster(&self) -> &SimulatedCluster {
        &self.cluster
    }

    /// Creates a new, unconnected client.
    pub fn create(&self) -> ClientResult<BoxedClient> {
        let index = self.created.fetch_add(1, Ordering::Relaxed);
        let client: BoxedClient = match &self.config {
            ClientConfig::Simulated(config) => {
                let seed = match config.seed {
                    Some(seed) => seed.wrapping_add(index),
                    None => rand::random(),
                };
                Box::new(SimulatedClient::new(config, self.cluster.clone(), seed))
            }
            ClientConfig::Http(config) => Box::new(HttpClient::new(config.clone())?),
        };
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn query_name_defaults_to_sql() {
        let query = Query::new("select 1");
        assert_eq!(query.name(), "select 1");

        let query = query.with_name("q1.sql");
        assert_eq!(query.name(), "q1.sql");
        assert_eq!(query.sql(), "select 1");
    }

    #[test]
    fn serialized_size() {
        assert_eq!(Rows::default().serialized_size(), 0);

        let rows = Rows::new(vec![vec![json!(1), json!("a")]]);
        assert_eq!(rows.serialized_size(), r#"[[1,"a"]]"#.len() as u64);
    }

    #[test]
    fn benign_default() {
        let client = SimulatedClient::new(
            &SimulatedConfig::default(),
            SimulatedCluster::default(),
            0,
        );
        assert!(client.is_benign(&ClientError::NoResultSet));
        assert!(!client.is_benign(&ClientError::Query("boom".into())));
        assert!(!client.is_benign(&ClientError::NotConnected));
    }

    #[test]
    fn factory_creates_simulated_clients() {
        let factory = ClientFactory::new(ClientConfig::Simulated(SimulatedConfig::default()));
        let a = factory.create().unwrap();
        let b = factory.create().unwrap();
        assert_eq!(a.name(), "simulated");
        assert_eq!(b.name(), "simulated");
    }
}
