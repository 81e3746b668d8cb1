//! Loading workload queries from `.sql` files.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use loadtest_core::client::Query;
use loadtest_core::error::ConfigError;

/// Reads a file containing a single statement.
///
/// Lines starting with `--` are dropped, trailing `--` comments are stripped, and the remaining
/// lines are joined with single spaces.
pub fn parse_sql_file(path: &Path) -> Result<String> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(clean_sql(&contents))
}

/// Reads a file containing any number of statements separated by `;`.
///
/// Comments are handled like in [`parse_sql_file`]. Every key of `replacements` is replaced
/// literally by its value before splitting.
pub fn parse_queries_from_file(
    path: &Path,
    replacements: &BTreeMap<String, String>,
) -> Result<Vec<String>> {
    let mut sql = parse_sql_file(path)?;
    for (pattern, replacement) in replacements {
        sql = sql.replace(pattern.as_str(), replacement);
    }

    Ok(sql
        .split(';')
        .map(str::trim)
        .filter(|statement| !statement.is_empty())
        .map(str::to_owned)
        .collect())
}

fn clean_sql(contents: &str) -> String {
    let lines = contents
        .lines()
        .filter(|line| !line.starts_with("--"))
        .map(|line| line.split("--").next().unwrap_or_default().trim())
        .filter(|line| !line.is_empty());

    lines.collect::<Vec<_>>().join(" ")
}

/// All queries of a workload, one per `.sql` file, in file name order.
#[derive(Clone, Debug)]
pub struct QuerySet {
    dir: PathBuf,
    queries: Vec<Query>,
}

impl QuerySet {
    /// Loads every `*.sql` file in `dir`. Each query is named after its file.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let entries = fs::read_dir(dir)
            .with_context(|| format!("failed to read query directory {}", dir.display()))?;

        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "sql") {
                files.push(path);
            }
        }
        files.sort();

        let mut queries = Vec::with_capacity(files.len());
        for path in files {
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let sql = parse_sql_file(&path)?;
            queries.push(Query::new(sql).with_name(name));
        }

        if queries.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "scenario.queries".into(),
                reason: format!("no .sql files in {}", dir.display()),
            }
            .into());
        }

        tracing::debug!(dir = %dir.display(), count = queries.len(), "loaded queries");
        Ok(Self {
            dir: dir.to_owned(),
            queries,
        })
    }

    /// The directory the queries were loaded from.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// All queries in file name order.
    pub fn queries(&self) -> &[Query] {
        &self.queries
    }

    /// Looks up a query by its file name.
    pub fn get(&self, name: &str) -> Option<&Query> {
        self.queries.iter().find(|query| query.name() == name)
    }

    /// Number of queries.
    pub fn len(&self) -> usize {
        self.queries.len()
    }

    /// Always `false`, since loading fails for empty directories.
    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}
