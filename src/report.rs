//! Result sink and the human-readable run summary.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const SEPARATOR1: &str =
    "======================================================================";
const SEPARATOR2: &str =
    "----------------------------------------------------------------------";

/// Final classification of one execution unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    Error,
    Skipped,
    ExpectedFailure,
    UnexpectedSuccess,
}

/// A named entry with the message explaining it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub name: String,
    pub detail: String,
}

/// Counters and entries for a whole run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunReport {
    pub tests_run: usize,
    pub successes: Vec<String>,
    pub failures: Vec<Entry>,
    pub errors: Vec<Entry>,
    pub skipped: Vec<Entry>,
    pub expected_failures: Vec<Entry>,
    pub unexpected_successes: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_secs: f64,
}

impl RunReport {
    /// True when nothing failed or errored.
    pub fn was_successful(&self) -> bool {
        self.failures.is_empty() && self.errors.is_empty()
    }

    /// Render the error listing followed by the summary lines.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for (flavour, entries) in [("ERROR", &self.errors), ("FAIL", &self.failures)] {
            for entry in entries {
                out.push_str(SEPARATOR1);
                out.push('\n');
                out.push_str(&format!("{}: {}\n", flavour, entry.name));
                out.push_str(SEPARATOR2);
                out.push('\n');
                out.push_str(&entry.detail);
                out.push_str("\n\n");
            }
        }
        out.push_str(SEPARATOR2);
        out.push('\n');
        let run = self.tests_run;
        out.push_str(&format!(
            "Ran {} test{} in {:.3}s\n\n",
            run,
            if run == 1 { "" } else { "s" },
            self.elapsed_secs
        ));
        out.push_str(&self.status_line());
        out.push('\n');
        out
    }

    /// `OK` or `FAILED (...)`, with the optional counters appended.
    pub fn status_line(&self) -> String {
        let mut infos = Vec::new();
        let mut line = if self.was_successful() {
            "OK".to_string()
        } else {
            infos.push(format!("failures={}", self.failures.len()));
            infos.push(format!("errors={}", self.errors.len()));
            "FAILED".to_string()
        };
        if !self.skipped.is_empty() {
            infos.push(format!("skipped={}", self.skipped.len()));
        }
        if !self.expected_failures.is_empty() {
            infos.push(format!("expected failures={}", self.expected_failures.len()));
        }
        if !self.unexpected_successes.is_empty() {
            infos.push(format!(
                "unexpected successes={}",
                self.unexpected_successes.len()
            ));
        }
        if !infos.is_empty() {
            line.push_str(&format!(" ({})", infos.join(", ")));
        }
        line
    }
}

struct SinkState {
    report: RunReport,
    clock: Option<Instant>,
    should_stop: bool,
}

/// Shared handle where units record their outcomes.
///
/// Only the producer currently being stepped touches it; the mutex exists so
/// the handle can travel with producers across threads.
#[derive(Clone)]
pub struct ResultSink {
    state: Arc<Mutex<SinkState>>,
    failfast: bool,
}

impl ResultSink {
    pub fn new(failfast: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(SinkState {
                report: RunReport::default(),
                clock: None,
                should_stop: false,
            })),
            failfast,
        }
    }

    pub fn start_run(&self) {
        let mut state = self.state.lock();
        state.clock = Some(Instant::now());
        state.report.started_at = Some(Utc::now());
    }

    pub fn stop_run(&self) {
        let mut state = self.state.lock();
        if let Some(clock) = state.clock.take() {
            state.report.elapsed_secs = clock.elapsed().as_secs_f64();
        }
    }

    pub fn start_unit(&self, name: &str) {
        let mut state = self.state.lock();
        state.report.tests_run += 1;
        debug!("Starting {}", name);
    }

    /// Record the final outcome of a unit.
    pub fn record(&self, name: &str, outcome: Outcome, detail: Option<String>) {
        let mut state = self.state.lock();
        let entry = || Entry {
            name: name.to_string(),
            detail: detail.clone().unwrap_or_default(),
        };
        match outcome {
            Outcome::Success => state.report.successes.push(name.to_string()),
            Outcome::Failure => state.report.failures.push(entry()),
            Outcome::Error => state.report.errors.push(entry()),
            Outcome::Skipped => state.report.skipped.push(entry()),
            Outcome::ExpectedFailure => state.report.expected_failures.push(entry()),
            Outcome::UnexpectedSuccess => {
                state.report.unexpected_successes.push(name.to_string())
            }
        }
        if self.failfast && matches!(outcome, Outcome::Failure | Outcome::Error) {
            state.should_stop = true;
        }
        match outcome {
            Outcome::Failure | Outcome::Error => warn!("{} ... {:?}", name, outcome),
            _ => info!("{} ... {:?}", name, outcome),
        }
    }

    /// Record an error that does not belong to a single unit, such as a
    /// failing class-level setup.
    pub fn add_error(&self, name: &str, detail: impl Into<String>) {
        let mut state = self.state.lock();
        state.report.errors.push(Entry {
            name: name.to_string(),
            detail: detail.into(),
        });
        if self.failfast {
            state.should_stop = true;
        }
        warn!("{} ... Error", name);
    }

    pub fn stop_unit(&self, name: &str) {
        debug!("Finished {}", name);
    }

    pub fn should_stop(&self) -> bool {
        self.state.lock().should_stop
    }

    pub fn snapshot(&self) -> RunReport {
        self.state.lock().report.clone()
    }
}
