//! Configuration for the load test runner.
//!
//! Configuration can be loaded from multiple sources with the following precedence (highest to
//! lowest):
//!
//! 1. Environment variables (prefixed with `LOADTEST__`)
//! 2. YAML configuration file (specified via `-c` or `--config` flag)
//! 3. Defaults
//!
//! # Environment Variables
//!
//! Environment variables use `LOADTEST__` as a prefix and double underscores (`__`) to denote
//! nested configuration structures. For example:
//!
//! - `LOADTEST__USERS=20` sets the number of concurrent users
//! - `LOADTEST__CLIENT__TYPE=http` selects the HTTP gateway client
//! - `LOADTEST__SCENARIO__QUERIES=workloads/tpcds/queries` sets the query directory
//!
//! # YAML Configuration File
//!
//! ```yaml
//! nodes: [impalad-1.example.com, impalad-2.example.com]
//! target_db: tpcds_parquet
//! users: 20
//! duration: 10m
//!
//! scenario:
//!   type: random
//!   queries: workloads/tpcds/queries
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use figment::providers::{Env, Format, Serialized, Yaml};
use loadtest_core::client::{ClientConfig, HttpConfig, SimulatedConfig};
use loadtest_core::error::ConfigError;
use loadtest_core::tasks::WaitTime;
use secrecy::{CloneableSecret, ExposeSecret, SecretBox, SerializableSecret, zeroize::Zeroize};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

/// Environment variable prefix for all configuration options.
const ENV_PREFIX: &str = "LOADTEST__";

/// Default port of the Impala HiveServer2 endpoint.
const DEFAULT_PORT: u16 = 21050;

/// Newtype around `String` that protects against accidental logging of secrets in the
/// configuration. Use with [`secrecy::SecretBox`].
///
/// Serializes as `[redacted]`, so printing the configuration never reveals the value.
#[derive(Clone, Default, Deserialize, PartialEq)]
pub struct ConfigSecret(String);

impl ConfigSecret {
    /// Returns the secret value.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for ConfigSecret {
    fn from(str: &str) -> Self {
        ConfigSecret(str.to_string())
    }
}

impl fmt::Debug for ConfigSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "[redacted]")
    }
}

impl Serialize for ConfigSecret {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("[redacted]")
    }
}

impl CloneableSecret for ConfigSecret {}
impl SerializableSecret for ConfigSecret {}
impl Zeroize for ConfigSecret {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

/// Database client configuration.
///
/// The `type` field in YAML or `__TYPE` in environment variables determines which variant is used.
#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Client {
    /// In-process client with synthetic latencies (type `"simulated"`).
    ///
    /// Useful to try out scenarios and configuration without a cluster.
    Simulated {
        /// Median query latency.
        #[serde(default, with = "humantime_serde")]
        p50: Duration,
        /// 99th percentile query latency.
        #[serde(default, with = "humantime_serde")]
        p99: Duration,
        /// Probability in `[0, 1]` that a read query fails.
        #[serde(default)]
        failure_rate: f64,
    },

    /// Client for an HTTP SQL gateway in front of the cluster (type `"http"`).
    ///
    /// # Example
    ///
    /// ```yaml
    /// client:
    ///   type: http
    ///   ssl: true
    ///   user: loadtest
    ///   password: hunter2
    /// ```
    Http {
        /// Use `https` instead of `http`.
        #[serde(default)]
        ssl: bool,
        /// User for basic authentication.
        #[serde(default)]
        user: Option<String>,
        /// Password for basic authentication. Redacted from logs.
        #[serde(default)]
        password: Option<SecretBox<ConfigSecret>>,
        /// Timeout for each request to the gateway.
        #[serde(default, with = "humantime_serde")]
        timeout: Option<Duration>,
    },
}

impl Default for Client {
    fn default() -> Self {
        Client::Simulated {
            p50: Duration::from_millis(50),
            p99: Duration::from_millis(500),
            failure_rate: 0.0,
        }
    }
}

impl Client {
    /// Converts this into the configuration used by the client factory.
    pub fn to_client_config(&self, seed: Option<u64>) -> ClientConfig {
        match self {
            Client::Simulated {
                p50,
                p99,
                failure_rate,
            } => ClientConfig::Simulated(SimulatedConfig {
                p50: *p50,
                p99: *p99,
                failure_rate: *failure_rate,
                seed,
            }),
            Client::Http {
                ssl,
                user,
                password,
                timeout,
            } => ClientConfig::Http(HttpConfig {
                ssl: *ssl,
                user: user.clone(),
                password: password
                    .as_ref()
                    .map(|password| password.expose_secret().as_str().to_owned()),
                timeout: *timeout,
            }),
        }
    }
}

/// Bounds of the random pause between two tasks of a user.
#[derive(Debug, Deserialize, Serialize)]
pub struct Wait {
    /// Shortest pause.
    #[serde(with = "humantime_serde")]
    pub min: Duration,
    /// Longest pause.
    #[serde(with = "humantime_serde")]
    pub max: Duration,
}

impl Default for Wait {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(1),
            max: Duration::from_secs(2),
        }
    }
}

impl Wait {
    /// Converts the bounds for use by the users.
    pub fn to_wait_time(&self) -> WaitTime {
        WaitTime::between(self.min, self.max)
    }
}

/// Statements run once before any user starts, e.g. to create tables.
#[derive(Debug, Deserialize, Serialize)]
pub struct SetupScript {
    /// SQL file with statements separated by `;`.
    pub file: PathBuf,
    /// Literal substrings to replace in the statements before running them.
    #[serde(default)]
    pub replacements: BTreeMap<String, String>,
}

/// Task weights of the `random` scenario.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RandomWeights {
    /// Run a random query from the workload.
    pub run_query: u32,
    /// Close the connection and open a new one to the same host.
    pub reconnect: u32,
}

impl Default for RandomWeights {
    fn default() -> Self {
        Self {
            run_query: 10,
            reconnect: 2,
        }
    }
}

/// Task weights of the `stress` scenario.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct StressWeights {
    /// Must be at least `1`, since cancellations need timings of regular runs.
    pub run_basic_query: u32,
    /// Start a query and cancel it before it is expected to finish.
    pub cancel_query: u32,
}

impl Default for StressWeights {
    fn default() -> Self {
        Self {
            run_basic_query: 4,
            cancel_query: 1,
        }
    }
}

/// When to cancel a query, as multiples of its median response time.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct QueryTimeout {
    /// Earliest cancellation.
    pub lower_bound: f64,
    /// Latest cancellation.
    pub upper_bound: f64,
}

impl Default for QueryTimeout {
    fn default() -> Self {
        Self {
            lower_bound: 0.25,
            upper_bound: 0.75,
        }
    }
}

/// Database and table created before the `partitions` scenario starts.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SetupDatabase {
    /// Database name.
    pub db: String,
    /// Name of the partitioned table in `db`.
    pub table: String,
}

impl Default for SetupDatabase {
    fn default() -> Self {
        Self {
            db: "loadtest_db".into(),
            table: "loadtest_table".into(),
        }
    }
}

/// The `ALTER TABLE ... ADD PARTITION` task. `{tbl}` is replaced with the table name.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct AddPartitionTask {
    /// Statement template. The partition key is appended.
    pub query: String,
    /// Task weight.
    pub frequency: u32,
}

impl Default for AddPartitionTask {
    fn default() -> Self {
        Self {
            query: "ALTER TABLE {tbl} ADD PARTITION".into(),
            frequency: 10,
        }
    }
}

/// The `DROP DATABASE` task. `{db}` is replaced with the database name.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct DropDatabaseTask {
    /// Statement template.
    pub query: String,
    /// Task weight. The drop only happens once the partition limit is exceeded.
    pub frequency: u32,
}

impl Default for DropDatabaseTask {
    fn default() -> Self {
        Self {
            query: "DROP DATABASE {db} CASCADE".into(),
            frequency: 1,
        }
    }
}

/// The load test to run.
///
/// The `type` field in YAML or `__TYPE` in environment variables determines which variant is used.
#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Scenario {
    /// Users run random queries from a directory and occasionally reconnect (type `"random"`).
    Random {
        /// Directory with one `.sql` file per query.
        queries: PathBuf,
        /// How often each task is picked.
        #[serde(default)]
        weights: RandomWeights,
    },

    /// Every user runs all queries in order, after a shared warmup (type `"throughput"`).
    Throughput {
        /// Directory with one `.sql` file per query.
        queries: PathBuf,
        /// How often each user runs the full query set.
        #[serde(default = "default_iterations")]
        num_iterations: u32,
        /// Run every query once, unmeasured, before the measurement starts.
        #[serde(default = "default_warmup")]
        warmup: bool,
        /// Give up if not all users are ready within this time.
        #[serde(default, with = "humantime_serde")]
        barrier_timeout: Option<Duration>,
        /// Pause after connecting, so that users still being spawned can check in.
        #[serde(default = "default_settle_delay", with = "humantime_serde")]
        settle_delay: Duration,
    },

    /// Random queries mixed with queries that are cancelled mid-flight (type `"stress"`).
    Stress {
        /// Directory with one `.sql` file per query.
        queries: PathBuf,
        /// How often each task is picked.
        #[serde(default)]
        weights: StressWeights,
        /// When cancelled queries are cancelled.
        #[serde(default)]
        query_timeout: QueryTimeout,
    },

    /// Users add partitions to a table until it is dropped (type `"partitions"`).
    Partitions {
        /// The database is dropped once the table has more partitions than this.
        partition_limit: u64,
        /// Created once before the users start.
        #[serde(default)]
        setup_database: SetupDatabase,
        /// Adds one partition with a unique key.
        #[serde(default)]
        add_partition_task: AddPartitionTask,
        /// Drops the database once it has too many partitions, ending the run.
        #[serde(default)]
        drop_database_task: DropDatabaseTask,
    },
}

fn default_iterations() -> u32 {
    1
}

fn default_warmup() -> bool {
    true
}

fn default_settle_delay() -> Duration {
    Duration::from_secs(1)
}

impl Scenario {
    /// Short name of the scenario type.
    pub fn name(&self) -> &'static str {
        match self {
            Scenario::Random { .. } => "random",
            Scenario::Throughput { .. } => "throughput",
            Scenario::Stress { .. } => "stress",
            Scenario::Partitions { .. } => "partitions",
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Scenario::Random { weights, .. } => {
                if weights.run_query == 0 && weights.reconnect == 0 {
                    return Err(ConfigError::InvalidWeights(
                        "at least one task weight must be positive".into(),
                    ));
                }
            }
            Scenario::Throughput { num_iterations, .. } => {
                if *num_iterations == 0 {
                    return Err(invalid("scenario.num_iterations", "must be at least 1"));
                }
            }
            Scenario::Stress {
                weights,
                query_timeout,
                ..
            } => {
                if weights.run_basic_query < 1 {
                    return Err(ConfigError::InvalidWeights(
                        "run_basic_query must be at least 1".into(),
                    ));
                }
                let QueryTimeout {
                    lower_bound,
                    upper_bound,
                } = *query_timeout;
                if !(lower_bound >= 0.0 && lower_bound <= upper_bound && upper_bound.is_finite()) {
                    return Err(invalid(
                        "scenario.query_timeout",
                        "bounds must satisfy 0 <= lower_bound <= upper_bound",
                    ));
                }
            }
            Scenario::Partitions {
                add_partition_task,
                drop_database_task,
                ..
            } => {
                if add_partition_task.frequency == 0 && drop_database_task.frequency == 0 {
                    return Err(ConfigError::InvalidWeights(
                        "at least one task frequency must be positive".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// A cluster taking part in a result comparison.
#[derive(Debug, Deserialize, Serialize)]
pub struct Endpoint {
    /// Host to connect to.
    pub host: String,
    /// Port of the query endpoint. Defaults to the top-level `port`.
    #[serde(default)]
    pub port: Option<u16>,
    /// Database to switch to after connecting.
    #[serde(default)]
    pub db: Option<String>,
}

/// Settings of the `confirm` command, which compares query results between two clusters.
///
/// # Example
///
/// ```yaml
/// confirm:
///   queries: workloads/tpcds/queries
///   reference:
///     host: impalad-ref.example.com
///     db: tpcds_parquet
///   test:
///     host: impalad-1.example.com
///     db: tpcds_parquet
/// ```
#[derive(Debug, Deserialize, Serialize)]
pub struct Confirm {
    /// Directory with one `.sql` file per query.
    pub queries: PathBuf,
    /// The cluster with known good results.
    pub reference: Endpoint,
    /// The cluster under test.
    pub test: Endpoint,
    /// Compare a hash of every row instead of every value.
    #[serde(default)]
    pub compare_by_hash: bool,
}

/// Log output format.
///
/// Controls how log messages are formatted. The format can be explicitly specified or
/// auto-detected based on whether output is to a TTY.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect the best format.
    ///
    /// This chooses [`LogFormat::Pretty`] for TTY, otherwise [`LogFormat::Simplified`].
    Auto,

    /// Pretty printing with colors.
    Pretty,

    /// Simplified plain text output.
    Simplified,

    /// Dump out JSON lines.
    Json,
}

mod display_fromstr {
    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
        T: std::fmt::Display,
    {
        serializer.collect_str(&value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        D: serde::Deserializer<'de>,
        T: std::str::FromStr,
        <T as std::str::FromStr>::Err: std::fmt::Display,
    {
        use serde::Deserialize;
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Logging configuration.
///
/// Logs are always written to stderr, so they do not interfere with the report on stdout.
#[derive(Debug, Deserialize, Serialize)]
pub struct Logging {
    /// Minimum log level to output.
    ///
    /// The `RUST_LOG` environment variable takes precedence if set.
    #[serde(with = "display_fromstr")]
    pub level: LevelFilter,

    /// Log output format. See [`LogFormat`].
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Where results are written besides the console.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Report {
    /// Prefix for `<prefix>_requests.csv` and `<prefix>_failures.csv`.
    pub csv: Option<PathBuf>,
}

/// Runner configuration.
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    /// Cluster nodes. Users are assigned to them in round-robin order.
    pub nodes: Vec<String>,

    /// Send all users to this host instead of rotating through `nodes`.
    pub coordinator: Option<String>,

    /// Port of the query endpoint on every node.
    ///
    /// # Default
    ///
    /// `21050`
    pub port: u16,

    /// Database every user switches to after connecting.
    pub target_db: Option<String>,

    /// Number of concurrent users.
    pub users: usize,

    /// Users started per second. All users start at once if unset.
    pub spawn_rate: Option<f64>,

    /// Stop users after this time. Scenarios that finish by themselves may leave this unset.
    #[serde(default, with = "humantime_serde")]
    pub duration: Option<Duration>,

    /// Pause between two tasks of a user.
    pub wait_time: Wait,

    /// Seed for reproducible task selection and simulated latencies.
    pub seed: Option<u64>,

    /// Statements run once before the users start.
    pub setup: Option<SetupScript>,

    /// How queries reach the cluster.
    pub client: Client,

    /// Log level and format.
    pub logging: Logging,

    /// Result export.
    pub report: Report,

    /// The load test to run. Required by `run`.
    pub scenario: Option<Scenario>,

    /// Clusters and queries for `confirm`.
    pub confirm: Option<Confirm>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nodes: vec!["localhost".into()],
            coordinator: None,
            port: DEFAULT_PORT,
            target_db: None,
            users: 1,
            spawn_rate: None,
            duration: None,
            wait_time: Wait::default(),
            seed: None,
            setup: None,
            client: Client::default(),
            logging: Logging::default(),
            report: Report::default(),
            scenario: None,
            confirm: None,
        }
    }
}

impl Config {
    /// Loads configuration from the provided arguments.
    ///
    /// Configuration is merged in the following order (later sources override earlier ones):
    /// 1. Default values
    /// 2. YAML configuration file (if provided)
    /// 3. Environment variables (prefixed with `LOADTEST__`)
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML file cannot be read or parsed, or if any value is malformed,
    /// including required scenario keys that are missing.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = figment::Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        Ok(config)
    }

    /// Checks values that are well-formed but cannot be used to run a test.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.users == 0 {
            return Err(invalid("users", "must be at least 1"));
        }
        if self.coordinator.is_none() && self.nodes.is_empty() {
            return Err(ConfigError::EmptyNodeList);
        }
        if let Some(rate) = self.spawn_rate
            && !(rate.is_finite() && rate > 0.0)
        {
            return Err(invalid("spawn_rate", "must be a positive number"));
        }
        if self.wait_time.max < self.wait_time.min {
            return Err(invalid("wait_time", "max must not be smaller than min"));
        }
        if let Client::Simulated { failure_rate, .. } = self.client
            && !(0.0..=1.0).contains(&failure_rate)
        {
            return Err(invalid("client.failure_rate", "must be between 0 and 1"));
        }

        self.scenario()?.validate()
    }

    /// The configured scenario.
    pub fn scenario(&self) -> Result<&Scenario, ConfigError> {
        self.scenario
            .as_ref()
            .ok_or_else(|| ConfigError::MissingKey("scenario".into()))
    }

    /// The settings of the `confirm` command.
    pub fn confirm(&self) -> Result<&Confirm, ConfigError> {
        self.confirm
            .as_ref()
            .ok_or_else(|| ConfigError::MissingKey("confirm".into()))
    }
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.into(),
        reason: reason.into(),
    }
}
