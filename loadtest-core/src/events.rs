//! Telemetry emitted for every observed query.
//!
//! The [`EventSink`] is the only channel through which results leave a worker. [`Stats`]
//! aggregates events per request name for the final report, [`EventLog`] keeps every event
//! verbatim.

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sketches_ddsketch::DDSketch;

/// Receives one call per observed query.
pub trait EventSink: fmt::Debug + Send + Sync {
    /// Records a successful query.
    fn success(&self, name: &str, duration_ms: u64, size: u64);

    /// Records a failed query.
    fn failure(&self, name: &str, duration_ms: u64, size: u64, error: &(dyn Error + 'static));
}

impl<T: EventSink + ?Sized> EventSink for Arc<T> {
    fn success(&self, name: &str, duration_ms: u64, size: u64) {
        (**self).success(name, duration_ms, size)
    }

    fn failure(&self, name: &str, duration_ms: u64, size: u64, error: &(dyn Error + 'static)) {
        (**self).failure(name, duration_ms, size, error)
    }
}

/// Outcome of an observed query.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventKind {
    /// The query succeeded, possibly with an empty result.
    Success,
    /// The query failed.
    Failure,
}

/// A single success or failure report.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    /// Whether the query succeeded.
    pub kind: EventKind,
    /// The request name used for grouping.
    pub name: String,
    /// Wall-clock duration of the call.
    pub duration_ms: u64,
    /// Result size for successes, length of the error message for failures.
    pub size_metric: u64,
    /// The error message of a failure.
    pub error: Option<String>,
}

/// A sink that keeps every event in order of arrival.
#[derive(Debug, Default)]
pub struct EventLog(Mutex<Vec<Event>>);

impl EventLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all events recorded so far.
    pub fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    /// Returns the number of recorded events of the given kind.
    pub fn count(&self, kind: EventKind) -> usize {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }
}

impl EventSink for EventLog {
    fn success(&self, name: &str, duration_ms: u64, size: u64) {
        self.0.lock().unwrap().push(Event {
            kind: EventKind::Success,
            name: name.to_owned(),
            duration_ms,
            size_metric: size,
            error: None,
        });
    }

    fn failure(&self, name: &str, duration_ms: u64, size: u64, error: &(dyn Error + 'static)) {
        self.0.lock().unwrap().push(Event {
            kind: EventKind::Failure,
            name: name.to_owned(),
            duration_ms,
            size_metric: size,
            error: Some(error.to_string()),
        });
    }
}

/// Aggregated results for one request name.
#[derive(Clone, Default)]
pub struct RequestStats {
    /// Response times of successful requests, in milliseconds.
    pub timing: DDSketch,
    /// Number of successful requests.
    pub successes: u64,
    /// Number of failed requests.
    pub failures: u64,
    /// Sum of the result sizes of successful requests.
    pub total_size: u64,
    /// Failure messages and how often each occurred.
    pub errors: BTreeMap<String, u64>,
}

impl fmt::Debug for RequestStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestStats")
            .field("successes", &self.successes)
            .field("failures", &self.failures)
            .field("total_size", &self.total_size)
            .field("errors", &self.errors)
            .finish_non_exhaustive()
    }
}

impl RequestStats {
    /// Total number of requests.
    pub fn requests(&self) -> u64 {
        self.successes + self.failures
    }

    /// Average result size of successful requests.
    pub fn avg_size(&self) -> u64 {
        self.total_size.checked_div(self.successes).unwrap_or(0)
    }

    /// The given response time quantile, if any request succeeded.
    pub fn quantile(&self, q: f64) -> Option<Duration> {
        let ms = self.timing.quantile(q).ok().flatten()?;
        Some(Duration::from_secs_f64(ms.max(0.0) / 1000.0))
    }

    /// Average response time of successful requests.
    pub fn avg(&self) -> Option<Duration> {
        let count = self.timing.count();
        let sum = self.timing.sum()?;
        (count > 0).then(|| Duration::from_secs_f64(sum.max(0.0) / count as f64 / 1000.0))
    }

    fn merge(&mut self, other: &RequestStats) {
        // Both sketches use the default configuration, so merging cannot fail.
        self.timing.merge(&other.timing).ok();
        self.successes += other.successes;
        self.failures += other.failures;
        self.total_size += other.total_size;
        for (message, count) in &other.errors {
            *self.errors.entry(message.clone()).or_default() += count;
        }
    }
}

/// A sink that aggregates events per request name.
#[derive(Debug, Default)]
pub struct Stats(Mutex<BTreeMap<String, RequestStats>>);

impl Stats {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the statistics for one request name.
    pub fn get(&self, name: &str) -> Option<RequestStats> {
        self.0.lock().unwrap().get(name).cloned()
    }

    /// Returns the median response time of a request name, if it succeeded at least once.
    pub fn median(&self, name: &str) -> Option<Duration> {
        self.0.lock().unwrap().get(name)?.quantile(0.5)
    }

    /// Returns all entries sorted by request name.
    pub fn snapshot(&self) -> Vec<(String, RequestStats)> {
        let stats = self.0.lock().unwrap();
        stats.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// Returns all entries merged into one.
    pub fn total(&self) -> RequestStats {
        let stats = self.0.lock().unwrap();
        let mut total = RequestStats::default();
        for entry in stats.values() {
            total.merge(entry);
        }
        total
    }
}

impl EventSink for Stats {
    fn success(&self, name: &str, duration_ms: u64, size: u64) {
        let mut stats = self.0.lock().unwrap();
        let entry = stats.entry(name.to_owned()).or_default();
        entry.timing.add(duration_ms as f64);
        entry.successes += 1;
        entry.total_size += size;
    }

    fn failure(&self, name: &str, _duration_ms: u64, _size: u64, error: &(dyn Error + 'static)) {
        let mut stats = self.0.lock().unwrap();
        let entry = stats.entry(name.to_owned()).or_default();
        entry.failures += 1;
        *entry.errors.entry(error.to_string()).or_default() += 1;
    }
}
