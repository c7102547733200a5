//! Job result files and console output.
//!
//! `results.json` is written at the job root from a [`ResultSnapshot`];
//! `results.xml` comes from the [`JUnitReport`] listener.

pub mod junit;

pub use junit::JUnitReport;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Serialize;

use crate::message::TestStatus;
use crate::result::ResultSnapshot;

/// One finished test in `results.json`.
#[derive(Debug, Clone, Serialize)]
pub struct TestEntry {
    pub id: String,
    pub status: Option<TestStatus>,
    pub time_elapsed: Option<f64>,
    pub fail_reason: Option<String>,
    pub logdir: Option<PathBuf>,
    pub whiteboard: String,
}

/// Contents of `results.json`.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job_id: String,
    pub logdir: PathBuf,
    /// Every status, lowercased, with its count (zero included).
    pub counts: BTreeMap<String, usize>,
    pub total: usize,
    pub time: f64,
    pub tests: Vec<TestEntry>,
}

impl JobReport {
    pub fn new(job_id: &str, logdir: &Path, snapshot: &ResultSnapshot) -> Self {
        Self {
            job_id: job_id.to_string(),
            logdir: logdir.to_path_buf(),
            counts: TestStatus::ALL
                .iter()
                .map(|s| (s.as_str().to_ascii_lowercase(), snapshot.count(*s)))
                .collect(),
            total: snapshot.total,
            time: snapshot.time,
            tests: snapshot
                .tests
                .iter()
                .map(|t| TestEntry {
                    id: t.id.to_string(),
                    status: t.status,
                    time_elapsed: t.time_elapsed,
                    fail_reason: t.fail_reason.clone(),
                    logdir: t.logdir.clone(),
                    whiteboard: t.whiteboard.clone(),
                })
                .collect(),
        }
    }

    /// Writes the report as pretty-printed JSON.
    pub fn write(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize results")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        tracing::info!("JSON results written to: {}", path.display());
        Ok(())
    }
}

/// Prints a summary of the job's results to the console.
pub fn print_summary(snapshot: &ResultSnapshot, logdir: &Path) {
    println!();
    println!("Test Results:");
    println!("  Total:       {}", snapshot.total);
    println!(
        "  Pass:        {}",
        console::style(snapshot.count(TestStatus::Pass)).green()
    );
    println!(
        "  Fail:        {}",
        console::style(snapshot.count(TestStatus::Fail)).red()
    );
    println!(
        "  Error:       {}",
        console::style(snapshot.count(TestStatus::Error)).red().bold()
    );
    println!(
        "  Skip:        {}",
        console::style(snapshot.count(TestStatus::Skip)).yellow()
    );
    for status in [TestStatus::Warn, TestStatus::Interrupted, TestStatus::Cancel] {
        let count = snapshot.count(status);
        if count > 0 {
            let label = format!("{}:", title_case(status.as_str()));
            println!("  {:<12} {}", label, console::style(count).yellow());
        }
    }
    println!("  Time:        {:.2} s", snapshot.time);
    println!("  Results:     {}", logdir.display());

    println!();
    if snapshot.total == 0 {
        println!("{}", console::style("No tests were recorded.").yellow().bold());
    } else if snapshot.passed() {
        println!("{}", console::style("All tests passed!").green().bold());
    } else {
        println!("{}", console::style("Some tests failed.").red().bold());
        println!();
        println!("Failed tests:");
        for test in snapshot
            .tests
            .iter()
            .filter(|t| t.status.is_none_or(|s| s.is_failing()))
        {
            println!("  - {}", test.id);
            if let Some(reason) = &test.fail_reason {
                println!("    {}", console::style(reason).dim());
            }
        }
    }
}

fn title_case(s: &str) -> String {
    let lower = s.to_ascii_lowercase();
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}
