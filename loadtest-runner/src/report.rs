//! Printing and exporting the results of a run.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use loadtest_core::events::{RequestStats, Stats};
use yansi::Paint;

use crate::scenarios::RunSummary;

/// Shows a spinner with the elapsed time while the load test is running.
pub fn spinner(message: &str) -> Result<ProgressBar> {
    let bar = ProgressBar::new_spinner()
        .with_style(ProgressStyle::with_template("{spinner} {msg} {elapsed}")?)
        .with_message(message.to_owned());
    bar.enable_steady_tick(Duration::from_millis(100));
    Ok(bar)
}

/// Prints per-request statistics, totals and failure messages to stdout.
pub fn print(summary: &RunSummary, stats: &Stats) {
    let duration = summary.elapsed;
    let entries = stats.snapshot();

    println!();
    println!(
        "{} {} (users: {}, elapsed: {:.2?})",
        "## Scenario".bold(),
        summary.scenario.bold().blue(),
        summary.users.bold(),
        duration
    );

    for (name, entry) in &entries {
        println!();
        print_request(name, entry, duration);
    }

    println!();
    println!("{}", "## TOTALS".bold());
    print_request("all requests", &stats.total(), duration);

    let failures: Vec<_> = entries
        .iter()
        .flat_map(|(name, entry)| entry.errors.iter().map(move |(msg, n)| (name, msg, n)))
        .collect();
    if !failures.is_empty() {
        println!();
        println!("{}", "## FAILURES".bold().red());
        for (name, message, count) in failures {
            println!("  {count:>6}x {}: {message}", name.bold());
        }
    }

    let failed_users: Vec<_> = summary.failed_users().collect();
    if !failed_users.is_empty() {
        println!();
        println!(
            "{}",
            format!("## {} USER(S) ENDED WITH AN ERROR", failed_users.len())
                .bold()
                .red()
        );
        for (index, err) in failed_users {
            println!("  user {index}: {err}");
        }
    }
    println!();
}

fn print_request(name: &str, entry: &RequestStats, duration: Duration) {
    print!("{} ({} ops", name.bold().green(), entry.requests().bold());
    if entry.failures > 0 {
        print!(
            ", {}",
            format!("{} FAILURES", entry.failures).bold().red()
        );
    }
    println!(")");

    if entry.successes == 0 {
        return;
    }

    let ops_ps = entry.requests() as f64 / duration.as_secs_f64().max(f64::EPSILON);
    println!(
        "  {:.2} operations/s, avg size: {} bytes",
        ops_ps.bold(),
        entry.avg_size().bold()
    );
    println!(
        "  avg: {}; p50: {}; p90: {}; p99: {}",
        fmt_duration(entry.avg()).bold(),
        fmt_duration(entry.quantile(0.5)),
        fmt_duration(entry.quantile(0.9)),
        fmt_duration(entry.quantile(0.99)),
    );
}

fn fmt_duration(duration: Option<Duration>) -> String {
    match duration {
        Some(duration) => format!("{duration:.2?}"),
        None => "-".to_owned(),
    }
}

fn millis(duration: Option<Duration>) -> String {
    duration
        .map(|d| d.as_millis().to_string())
        .unwrap_or_default()
}

/// Writes `<prefix>_requests.csv` and `<prefix>_failures.csv`.
///
/// Returns the paths of both files.
pub fn write_csv(prefix: &Path, stats: &Stats, elapsed: Duration) -> Result<(PathBuf, PathBuf)> {
    let entries = stats.snapshot();
    let requests_path = suffixed(prefix, "_requests.csv");
    let failures_path = suffixed(prefix, "_failures.csv");

    let mut writer = csv::Writer::from_path(&requests_path)
        .with_context(|| format!("failed to create {}", requests_path.display()))?;
    write_requests(&mut writer, &entries, &stats.total(), elapsed)?;
    writer.flush()?;

    let mut writer = csv::Writer::from_path(&failures_path)
        .with_context(|| format!("failed to create {}", failures_path.display()))?;
    write_failures(&mut writer, &entries)?;
    writer.flush()?;

    tracing::info!(
        requests = %requests_path.display(),
        failures = %failures_path.display(),
        "wrote csv reports"
    );
    Ok((requests_path, failures_path))
}

fn suffixed(prefix: &Path, suffix: &str) -> PathBuf {
    let mut path = prefix.as_os_str().to_owned();
    path.push(suffix);
    PathBuf::from(path)
}

fn write_requests<W: io::Write>(
    writer: &mut csv::Writer<W>,
    entries: &[(String, RequestStats)],
    total: &RequestStats,
    elapsed: Duration,
) -> Result<()> {
    writer.write_record([
        "Name",
        "# requests",
        "# failures",
        "Median response time",
        "Average response time",
        "90%",
        "99%",
        "Average content size",
        "Requests/s",
    ])?;

    let rows = entries
        .iter()
        .map(|(name, entry)| (name.as_str(), entry))
        .chain([("Aggregated", total)]);
    for (name, entry) in rows {
        let rate = entry.requests() as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
        writer.write_record([
            name.to_owned(),
            entry.requests().to_string(),
            entry.failures.to_string(),
            millis(entry.quantile(0.5)),
            millis(entry.avg()),
            millis(entry.quantile(0.9)),
            millis(entry.quantile(0.99)),
            entry.avg_size().to_string(),
            format!("{rate:.2}"),
        ])?;
    }
    Ok(())
}

fn write_failures<W: io::Write>(
    writer: &mut csv::Writer<W>,
    entries: &[(String, RequestStats)],
) -> Result<()> {
    writer.write_record(["Name", "Error", "Occurrences"])?;
    for (name, entry) in entries {
        for (message, count) in &entry.errors {
            writer.write_record([name.as_str(), message.as_str(), &count.to_string()])?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use loadtest_core::client::ClientError;
    use loadtest_core::events::EventSink;

    use super::*;

    fn sample_stats() -> Stats {
        let stats = Stats::new();
        stats.success("q1.sql", 100, 50);
        stats.success("q1.sql", 300, 150);
        stats.failure("q2.sql", 10, 9, &ClientError::Query("boom".into()));
        stats
    }

    #[test]
    fn requests_csv() {
        let stats = sample_stats();
        let mut writer = csv::Writer::from_writer(Vec::new());
        write_requests(
            &mut writer,
            &stats.snapshot(),
            &stats.total(),
            Duration::from_secs(1),
        )
        .unwrap();

        let output = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        let lines: Vec<_> = output.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("Name,# requests,# failures"));
        assert!(lines[1].starts_with("q1.sql,2,0,"));
        assert!(lines[1].ends_with(",100,2.00"));
        // No successful request, so there are no timings.
        assert_eq!(lines[2], "q2.sql,1,1,,,,,0,1.00");
        assert!(lines[3].starts_with("Aggregated,3,1,"));
    }

    #[test]
    fn failures_csv() {
        let stats = sample_stats();
        let mut writer = csv::Writer::from_writer(Vec::new());
        write_failures(&mut writer, &stats.snapshot()).unwrap();

        let output = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        assert_eq!(
            output,
            "Name,Error,Occurrences\nq2.sql,query failed: boom,1\n"
        );
    }

    #[test]
    fn csv_files_use_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("run");

        let (requests, failures) =
            write_csv(&prefix, &sample_stats(), Duration::from_secs(1)).unwrap();
        assert_eq!(requests, dir.path().join("run_requests.csv"));
        assert_eq!(failures, dir.path().join("run_failures.csv"));
        assert!(std::fs::read_to_string(requests).unwrap().contains("q1.sql"));
    }
}
