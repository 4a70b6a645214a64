//! Run artifacts
//!
//! Layout under the artifacts directory:
//!
//! ```text
//! final_report.json
//! internal/latest_patch.<ext>
//! internal/patch.diff
//! internal/events.jsonl
//! presentation/summary.txt
//! presentation/pr_description.md
//! ```
//!
//! Writing is best effort. A failed file is logged and listed in the
//! returned [`WriteSummary`]; it never changes the run status.

use crate::orchestrator::{RunOutcome, Status};
use crate::patch::{ChangedBlock, DiffSummary};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

pub const FINAL_REPORT_FILE: &str = "final_report.json";
const INTERNAL_DIR: &str = "internal";
const PRESENTATION_DIR: &str = "presentation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Retries {
    pub reproduction: u32,
    pub fix: u32,
}

/// Machine-readable summary of one run. Also what `--json` prints.
#[derive(Debug, Clone, Serialize)]
pub struct FinalReport {
    pub run_id: String,
    pub status: Status,
    pub reason: String,
    pub error_category: &'static str,
    pub target_file: String,
    pub retries: Retries,
    pub diff_summary: DiffSummary,
    pub final_diff_text: String,
    pub changed_blocks: Vec<ChangedBlock>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl FinalReport {
    pub fn from_outcome(outcome: &RunOutcome) -> Self {
        Self {
            run_id: outcome.run_id.clone(),
            status: outcome.status,
            reason: outcome.reason.clone(),
            error_category: outcome.error_category.as_str(),
            target_file: outcome.target_file.display().to_string(),
            retries: Retries {
                reproduction: outcome.counters.reproduction,
                fix: outcome.counters.fix,
            },
            diff_summary: outcome.diff_summary,
            final_diff_text: outcome.diff.clone(),
            changed_blocks: outcome.changed_blocks.clone(),
            started_at: outcome.started_at,
            finished_at: outcome.finished_at,
        }
    }
}

#[derive(Debug, Default)]
pub struct WriteSummary {
    pub written: Vec<PathBuf>,
    pub failures: Vec<String>,
}

impl WriteSummary {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct ArtifactWriter {
    root: PathBuf,
}

impl ArtifactWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn write(&self, outcome: &RunOutcome) -> WriteSummary {
        let mut summary = WriteSummary::default();
        let report = FinalReport::from_outcome(outcome);

        let mut files: Vec<(PathBuf, Result<String>)> = vec![
            (
                self.root.join(FINAL_REPORT_FILE),
                serde_json::to_string_pretty(&report).context("Failed to serialize final report"),
            ),
            (
                self.root.join(INTERNAL_DIR).join("events.jsonl"),
                events_jsonl(outcome),
            ),
            (
                self.root.join(PRESENTATION_DIR).join("summary.txt"),
                Ok(summary_text(outcome)),
            ),
        ];
        if let Some(patch) = &outcome.latest_patch {
            files.push((
                self.root
                    .join(INTERNAL_DIR)
                    .join(format!("latest_patch.{}", patch_extension(&outcome.target_file))),
                Ok(patch.clone()),
            ));
        }
        if !outcome.diff.is_empty() {
            files.push((
                self.root.join(INTERNAL_DIR).join("patch.diff"),
                Ok(outcome.diff.clone()),
            ));
        }
        if let Some(description) = &outcome.pr_description {
            files.push((
                self.root.join(PRESENTATION_DIR).join("pr_description.md"),
                Ok(description.clone()),
            ));
        }

        for (path, content) in files {
            match content.and_then(|c| write_file(&path, &c)) {
                Ok(()) => summary.written.push(path),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Artifact not written");
                    summary.failures.push(format!("{}: {:#}", path.display(), e));
                }
            }
        }
        tracing::info!(
            dir = %self.root.display(),
            written = summary.written.len(),
            failed = summary.failures.len(),
            "Artifacts written"
        );
        summary
    }
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory '{}'", parent.display()))?;
    }
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write '{}'", path.display()))?;
    Ok(())
}

fn events_jsonl(outcome: &RunOutcome) -> Result<String> {
    let mut out = String::new();
    for event in &outcome.events {
        out.push_str(&serde_json::to_string(event).context("Failed to serialize event")?);
        out.push('\n');
    }
    Ok(out)
}

fn patch_extension(target: &Path) -> String {
    target
        .extension()
        .and_then(|ext| ext.to_str())
        .map(crate::util::sanitize_component)
        .filter(|ext| !ext.is_empty())
        .unwrap_or_else(|| "txt".to_string())
}

/// Human-readable run summary.
pub fn summary_text(outcome: &RunOutcome) -> String {
    let mut text = String::new();
    text.push_str(&format!("Run {}\n", outcome.run_id));
    text.push_str(&format!("Status:   {}\n", outcome.status));
    if !outcome.reason.is_empty() {
        text.push_str(&format!("Reason:   {}\n", outcome.reason));
    }
    text.push_str(&format!("Target:   {}\n", outcome.target_file.display()));
    text.push_str(&format!("Category: {}\n", outcome.error_category.as_str()));
    text.push_str(&format!(
        "Attempts: {} reproduction, {} fix\n",
        outcome.counters.reproduction, outcome.counters.fix
    ));
    let elapsed = outcome.finished_at - outcome.started_at;
    text.push_str(&format!(
        "Elapsed:  {:.1}s\n",
        elapsed.num_milliseconds() as f64 / 1000.0
    ));

    if outcome.diff_summary.is_empty() {
        text.push_str("\nNo changes proposed.\n");
    } else {
        text.push_str(&format!(
            "\nChanges: +{} -{} in {} block(s)\n",
            outcome.diff_summary.lines_added,
            outcome.diff_summary.lines_removed,
            outcome.changed_blocks.len()
        ));
        for block in &outcome.changed_blocks {
            text.push_str(&format!("  line {}\n", block.line_number));
        }
        if outcome.status != Status::Success {
            text.push_str("The last candidate was not verified and was not kept.\n");
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ErrorCategory;
    use crate::orchestrator::{Counters, RunEvent, Stage};
    use crate::patch::{changed_blocks, unified_diff};
    use tempfile::TempDir;

    const BEFORE: &str = "def divide(a, b):\n    return a / b\n";
    const AFTER: &str = "def divide(a, b):\n    if b == 0:\n        return None\n    return a / b\n";

    fn outcome(status: Status, patched: bool) -> RunOutcome {
        let now = Utc::now();
        let (latest_patch, diff, diff_summary, blocks) = if patched {
            (
                Some(AFTER.to_string()),
                unified_diff(BEFORE, AFTER, "app.py"),
                DiffSummary::between(BEFORE, AFTER),
                changed_blocks(BEFORE, AFTER),
            )
        } else {
            (None, String::new(), DiffSummary::default(), Vec::new())
        };
        RunOutcome {
            run_id: "run-1".to_string(),
            status,
            reason: "Fix verified on attempt 1".to_string(),
            error_category: ErrorCategory::Code,
            target_file: PathBuf::from("app.py"),
            counters: Counters {
                reproduction: 0,
                fix: 1,
            },
            latest_patch,
            diff,
            diff_summary,
            changed_blocks: blocks,
            pr_description: None,
            events: vec![
                RunEvent {
                    ordinal: 1,
                    stage: Stage::Reproduce,
                    message: "Reproduction attempt 1".to_string(),
                    verdict: Some("exit=1: ZeroDivisionError".to_string()),
                    at: now,
                },
                RunEvent {
                    ordinal: 2,
                    stage: Stage::Teardown,
                    message: "Workspace destroyed".to_string(),
                    verdict: None,
                    at: now,
                },
            ],
            started_at: now,
            finished_at: now,
        }
    }

    #[test]
    fn test_writes_full_layout() {
        let dir = TempDir::new().unwrap();
        let mut run = outcome(Status::Success, true);
        run.pr_description = Some("Guard against zero.\n".to_string());

        let summary = ArtifactWriter::new(dir.path()).write(&run);
        assert!(summary.is_complete());
        assert_eq!(summary.written.len(), 6);

        let report: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join(FINAL_REPORT_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(report["status"], "SUCCESS");
        assert_eq!(report["error_category"], "CODE");
        assert_eq!(report["retries"]["fix"], 1);
        assert_eq!(report["diff_summary"]["lines_added"], 2);
        assert!(report["final_diff_text"]
            .as_str()
            .unwrap()
            .contains("+    if b == 0:"));

        assert_eq!(
            std::fs::read_to_string(dir.path().join("internal/latest_patch.py")).unwrap(),
            AFTER
        );
        assert!(dir.path().join("internal/patch.diff").exists());
        assert!(dir.path().join("presentation/pr_description.md").exists());
    }

    #[test]
    fn test_events_are_one_object_per_line() {
        let dir = TempDir::new().unwrap();
        ArtifactWriter::new(dir.path()).write(&outcome(Status::Success, true));

        let content = std::fs::read_to_string(dir.path().join("internal/events.jsonl")).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["stage"], "REPRODUCE");
        assert_eq!(lines[0]["verdict"], "exit=1: ZeroDivisionError");
        assert!(lines[1].get("verdict").is_none());
    }

    #[test]
    fn test_optional_files_skipped_without_patch() {
        let dir = TempDir::new().unwrap();
        let summary = ArtifactWriter::new(dir.path()).write(&outcome(Status::NotReproducible, false));

        assert_eq!(summary.written.len(), 3);
        assert!(!dir.path().join("internal/latest_patch.py").exists());
        assert!(!dir.path().join("internal/patch.diff").exists());
    }

    #[test]
    fn test_write_failure_is_reported_not_raised() {
        let dir = TempDir::new().unwrap();
        // A file where the directory should be.
        let blocked = dir.path().join("artifacts");
        std::fs::write(&blocked, "not a directory").unwrap();

        let summary = ArtifactWriter::new(&blocked).write(&outcome(Status::Success, true));
        assert!(!summary.is_complete());
        assert!(summary.written.is_empty());
    }

    #[test]
    fn test_summary_text() {
        let text = summary_text(&outcome(Status::Success, true));
        assert!(text.contains("Status:   SUCCESS"));
        assert!(text.contains("Attempts: 0 reproduction, 1 fix"));
        assert!(text.contains("Changes: +2 -0 in 1 block(s)"));

        let failed = summary_text(&outcome(Status::Failed, true));
        assert!(failed.contains("was not verified"));

        let clean = summary_text(&outcome(Status::NotReproducible, false));
        assert!(clean.contains("No changes proposed."));
    }
}
