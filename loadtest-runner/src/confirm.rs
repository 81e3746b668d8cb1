//! Comparing query results between a reference and a test cluster.
//!
//! Before load testing a new build, the workload's queries can be run once against a cluster
//! known to be correct and once against the cluster under test. Every query whose result sets
//! differ is reported as a mismatch.

use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};

use anyhow::{Context, Result, anyhow};
use loadtest_core::client::{
    BoxedClient, ClientError, ClientFactory, Query, QueryClient, Row, Rows,
};
use yansi::Paint;

use crate::config::{Config, Endpoint};
use crate::sql::QuerySet;

/// Outcome of running one query on both clusters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Comparison {
    /// Both clusters returned the same rows.
    Matched,
    /// The clusters returned a different number of rows.
    RowCountDiffers {
        /// Rows returned by the reference cluster.
        expected: usize,
        /// Rows returned by the test cluster.
        actual: usize,
    },
    /// The row at this position differs.
    RowDiffers {
        /// Zero-based position of the first differing row.
        row: usize,
    },
    /// The query failed on one of the clusters.
    Failed(String),
}

impl Comparison {
    /// Returns `true` if both result sets are equal.
    pub fn is_match(&self) -> bool {
        matches!(self, Comparison::Matched)
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Comparison::Matched => write!(f, "matched"),
            Comparison::RowCountDiffers { expected, actual } => {
                write!(f, "expected {expected} rows, got {actual}")
            }
            Comparison::RowDiffers { row } => write!(f, "row {row} differs"),
            Comparison::Failed(message) => f.write_str(message),
        }
    }
}

/// Compares two result sets row by row, in order.
///
/// With `by_hash`, only a hash of every row is compared. Rows with a different number of columns
/// never match.
pub fn compare_rows(expected: &Rows, actual: &Rows, by_hash: bool) -> Comparison {
    if expected.len() != actual.len() {
        return Comparison::RowCountDiffers {
            expected: expected.len(),
            actual: actual.len(),
        };
    }

    for (row, (left, right)) in expected.iter().zip(actual.iter()).enumerate() {
        let equal = if by_hash {
            row_hash(left) == row_hash(right)
        } else {
            left == right
        };
        if !equal {
            return Comparison::RowDiffers { row };
        }
    }

    Comparison::Matched
}

fn row_hash(row: &Row) -> u64 {
    let mut hasher = DefaultHasher::new();
    row.len().hash(&mut hasher);
    for value in row {
        value.to_string().hash(&mut hasher);
    }
    hasher.finish()
}

/// Results of comparing a set of queries.
#[derive(Debug, Default)]
pub struct ConfirmReport {
    /// One entry per query, in the order they ran.
    pub results: Vec<(String, Comparison)>,
}

impl ConfirmReport {
    /// Queries whose results did not match.
    pub fn mismatches(&self) -> impl Iterator<Item = (&str, &Comparison)> {
        self.results
            .iter()
            .filter(|(_, comparison)| !comparison.is_match())
            .map(|(name, comparison)| (name.as_str(), comparison))
    }
}

/// Runs every query on both clients and compares the results.
///
/// A failing query is reported as a mismatch and does not stop the comparison of the others.
pub async fn confirm(
    queries: &[Query],
    reference: &mut dyn QueryClient,
    test: &mut dyn QueryClient,
    by_hash: bool,
) -> ConfirmReport {
    let mut report = ConfirmReport::default();

    for query in queries {
        let comparison = match fetch(reference, query).await {
            Err(err) => Comparison::Failed(format!("reference cluster: {err}")),
            Ok(expected) => match fetch(test, query).await {
                Err(err) => Comparison::Failed(format!("test cluster: {err}")),
                Ok(actual) => compare_rows(&expected, &actual, by_hash),
            },
        };

        tracing::debug!(query = query.name(), %comparison, "compared results");
        report.results.push((query.name().to_owned(), comparison));
    }

    report
}

async fn fetch(client: &mut dyn QueryClient, query: &Query) -> Result<Rows, ClientError> {
    match client.query(query.sql()).await {
        Ok(rows) => Ok(rows),
        Err(err) if client.is_benign(&err) => Ok(Rows::new(Vec::new())),
        Err(err) => Err(err),
    }
}

/// Compares the configured query directory between the reference and the test endpoint.
///
/// With `only`, just the query from that file of the directory is compared.
pub async fn run(
    config: &Config,
    factory: &ClientFactory,
    by_hash: bool,
    only: Option<&str>,
) -> Result<ConfirmReport> {
    let settings = config.confirm()?;
    let queries = QuerySet::from_dir(&settings.queries)?;
    let selected = match only {
        Some(name) => vec![queries.get(name).cloned().ok_or_else(|| {
            anyhow!("no query {name} in {}", queries.dir().display())
        })?],
        None => queries.queries().to_vec(),
    };

    let by_hash = by_hash || settings.compare_by_hash;
    tracing::info!(
        dir = %queries.dir().display(),
        count = selected.len(),
        reference = %settings.reference.host,
        test = %settings.test.host,
        by_hash,
        "comparing query results"
    );

    let mut reference = connect(factory, &settings.reference, config.port).await?;
    let mut test = connect(factory, &settings.test, config.port).await?;

    let report = confirm(&selected, reference.as_mut(), test.as_mut(), by_hash).await;

    for client in [&mut reference, &mut test] {
        if let Err(err) = client.disconnect().await {
            tracing::warn!(error = &err as &dyn std::error::Error, "failed to disconnect");
        }
    }

    Ok(report)
}

async fn connect(factory: &ClientFactory, endpoint: &Endpoint, port: u16) -> Result<BoxedClient> {
    let mut client = factory.create()?;
    let port = endpoint.port.unwrap_or(port);
    client
        .connect(&endpoint.host, port)
        .await
        .with_context(|| format!("failed to connect to {}:{port}", endpoint.host))?;

    if let Some(db) = &endpoint.db {
        match client.query(&format!("USE {db}")).await {
            Ok(_) => {}
            Err(err) if client.is_benign(&err) => {}
            Err(err) => {
                return Err(err).with_context(|| format!("failed to use {db} on {}", endpoint.host));
            }
        }
    }

    Ok(client)
}

/// Prints one line per query and a summary to stdout.
pub fn print(report: &ConfirmReport) {
    println!();
    for (name, comparison) in &report.results {
        if comparison.is_match() {
            println!("{}: {}", name.bold(), "matched".green());
        } else {
            println!(
                "{}: {} ({comparison})",
                name.bold(),
                "DID NOT MATCH".bold().red()
            );
        }
    }

    let mismatches = report.mismatches().count();
    println!();
    if mismatches == 0 {
        println!(
            "{}",
            format!("all {} queries matched", report.results.len()).bold().green()
        );
    } else {
        println!(
            "{}",
            format!("{mismatches} of {} queries did not match", report.results.len())
                .bold()
                .red()
        );
    }
    println!();
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use loadtest_core::client::{ClientConfig, SimulatedCluster, SimulatedConfig, SimulatedClient};
    use serde_json::json;

    use super::*;
    use crate::config::Confirm;

    fn rows(rows: Vec<Row>) -> Rows {
        Rows::new(rows)
    }

    fn simulated(failure_rate: f64, seed: u64) -> SimulatedClient {
        let config = SimulatedConfig {
            failure_rate,
            ..Default::default()
        };
        SimulatedClient::new(&config, SimulatedCluster::default(), seed)
    }

    fn workload() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("q1.sql"), "SELECT 1").unwrap();
        std::fs::write(dir.path().join("q2.sql"), "SELECT 2").unwrap();
        std::fs::write(dir.path().join("q3.sql"), "CREATE TABLE t (s string)").unwrap();
        dir
    }

    fn config(queries: &Path) -> Config {
        Config {
            confirm: Some(Confirm {
                queries: queries.to_owned(),
                reference: Endpoint {
                    host: "reference.example.com".into(),
                    port: None,
                    db: Some("tpcds".into()),
                },
                test: Endpoint {
                    host: "test.example.com".into(),
                    port: Some(21000),
                    db: Some("tpcds".into()),
                },
                compare_by_hash: false,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn equal_rows_match() {
        let expected = rows(vec![vec![json!(1), json!("a")], vec![json!(2), json!(null)]]);
        let actual = rows(vec![vec![json!(1), json!("a")], vec![json!(2), json!(null)]]);

        assert_eq!(compare_rows(&expected, &actual, false), Comparison::Matched);
        assert_eq!(compare_rows(&expected, &actual, true), Comparison::Matched);
    }

    #[test]
    fn row_count_is_compared_first() {
        let expected = rows(vec![vec![json!(1)], vec![json!(2)]]);
        let actual = rows(vec![vec![json!(3)]]);

        assert_eq!(
            compare_rows(&expected, &actual, false),
            Comparison::RowCountDiffers {
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn first_differing_row_is_reported() {
        let expected = rows(vec![vec![json!(1)], vec![json!(2)], vec![json!(3)]]);
        let actual = rows(vec![vec![json!(1)], vec![json!("2")], vec![json!(4)]]);

        assert_eq!(
            compare_rows(&expected, &actual, false),
            Comparison::RowDiffers { row: 1 }
        );
        assert_eq!(
            compare_rows(&expected, &actual, true),
            Comparison::RowDiffers { row: 1 }
        );
    }

    #[test]
    fn extra_columns_do_not_match() {
        let expected = rows(vec![vec![json!(1), json!(2)]]);
        let actual = rows(vec![vec![json!(1), json!(2), json!(3)]]);

        assert!(!compare_rows(&expected, &actual, false).is_match());
        assert!(!compare_rows(&expected, &actual, true).is_match());
    }

    #[tokio::test]
    async fn identical_clusters_match() {
        let queries = QuerySet::from_dir(workload().path()).unwrap();
        let mut reference = simulated(0.0, 7);
        let mut test = simulated(0.0, 7);

        let report = confirm(queries.queries(), &mut reference, &mut test, false).await;

        let names: Vec<_> = report.results.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, ["q1.sql", "q2.sql", "q3.sql"]);
        assert_eq!(report.mismatches().count(), 0);
    }

    #[tokio::test]
    async fn failing_test_cluster_is_a_mismatch() {
        let queries = QuerySet::from_dir(workload().path()).unwrap();
        let mut reference = simulated(0.0, 7);
        let mut test = simulated(1.0, 7);

        let report = confirm(queries.queries(), &mut reference, &mut test, true).await;

        let mismatches: Vec<_> = report.mismatches().map(|(name, _)| name).collect();
        assert_eq!(mismatches, ["q1.sql", "q2.sql"]);
        let (_, comparison) = report.mismatches().next().unwrap();
        assert_eq!(
            *comparison,
            Comparison::Failed("test cluster: query failed: simulated failure".into())
        );
    }

    #[tokio::test]
    async fn compares_a_single_query() {
        let queries = workload();
        let config = config(queries.path());
        let factory = ClientFactory::new(ClientConfig::Simulated(SimulatedConfig::default()));

        let report = run(&config, &factory, false, Some("q2.sql")).await.unwrap();
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].0, "q2.sql");

        let executed = factory.cluster().executed();
        assert_eq!(executed, ["USE tpcds", "USE tpcds", "SELECT 2", "SELECT 2"]);

        assert!(run(&config, &factory, false, Some("q9.sql")).await.is_err());
    }

    #[tokio::test]
    async fn requires_confirm_section() {
        let factory = ClientFactory::new(ClientConfig::Simulated(SimulatedConfig::default()));
        let err = run(&Config::default(), &factory, false, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("confirm"));
    }
}
