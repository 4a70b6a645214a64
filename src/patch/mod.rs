//! Full-file patch engine
//!
//! Candidates are whole replacement bodies, never hunks. The diff is always
//! regenerated from the two full texts, so the written file and the reported
//! diff cannot drift apart.

pub mod preflight;

pub use preflight::{preflight, top_level_symbols, ParseResult, SourceLanguage, SyntaxIssue};

use crate::error::PatchError;
use serde::{Deserialize, Serialize};
use similar::{DiffTag, TextDiff};
use std::ops::Range;
use std::path::{Path, PathBuf};

/// Context lines around each hunk.
const CONTEXT_RADIUS: usize = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub lines_added: usize,
    pub lines_removed: usize,
}

impl DiffSummary {
    pub fn between(previous: &str, new: &str) -> Self {
        let diff = TextDiff::from_lines(previous, new);
        let mut summary = DiffSummary::default();
        for op in diff.ops() {
            let (tag, old_range, new_range) = op.as_tag_tuple();
            match tag {
                DiffTag::Equal => {}
                DiffTag::Delete => summary.lines_removed += old_range.len(),
                DiffTag::Insert => summary.lines_added += new_range.len(),
                DiffTag::Replace => {
                    summary.lines_removed += old_range.len();
                    summary.lines_added += new_range.len();
                }
            }
        }
        summary
    }

    pub fn is_empty(&self) -> bool {
        self.lines_added == 0 && self.lines_removed == 0
    }
}

/// A contiguous run of changed lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedBlock {
    /// 1-based line in the original file where the change starts.
    pub line_number: usize,
    pub before: String,
    pub after: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedPatch {
    pub written_path: PathBuf,
    pub unified_diff: String,
}

/// Unified diff between two full texts. Empty when they are identical.
pub fn unified_diff(previous: &str, new: &str, label: &str) -> String {
    if previous == new {
        return String::new();
    }
    TextDiff::from_lines(previous, new)
        .unified_diff()
        .context_radius(CONTEXT_RADIUS)
        .header(&format!("a/{}", label), &format!("b/{}", label))
        .to_string()
}

pub fn changed_blocks(previous: &str, new: &str) -> Vec<ChangedBlock> {
    let old_lines: Vec<&str> = previous.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();
    let diff = TextDiff::from_lines(previous, new);

    let mut blocks = Vec::new();
    let mut pending: Option<(Range<usize>, Range<usize>)> = None;

    for op in diff.ops() {
        let (tag, old_range, new_range) = op.as_tag_tuple();
        if tag == DiffTag::Equal {
            if let Some((old, new)) = pending.take() {
                blocks.push(build_block(&old_lines, &new_lines, old, new));
            }
            continue;
        }
        pending = Some(match pending {
            Some((old, new)) => (old.start..old_range.end, new.start..new_range.end),
            None => (old_range, new_range),
        });
    }
    if let Some((old, new)) = pending {
        blocks.push(build_block(&old_lines, &new_lines, old, new));
    }
    blocks
}

fn build_block(
    old_lines: &[&str],
    new_lines: &[&str],
    old: Range<usize>,
    new: Range<usize>,
) -> ChangedBlock {
    ChangedBlock {
        line_number: old.start + 1,
        before: old_lines.get(old).unwrap_or(&[]).join("\n"),
        after: new_lines.get(new).unwrap_or(&[]).join("\n"),
    }
}

/// Match the original file's trailing-newline convention (LF or CRLF).
/// Model output tends to gain or lose the final newline, which would
/// otherwise show up as a spurious last-line change.
pub fn normalize_trailing_newline(original: &str, content: String) -> String {
    let mut normalized = content;

    if original.ends_with('\n') {
        if !normalized.ends_with('\n') {
            if original.ends_with("\r\n") {
                normalized.push_str("\r\n");
            } else {
                normalized.push('\n');
            }
        }
    } else {
        while normalized.ends_with('\n') {
            let cut = if normalized.ends_with("\r\n") { 2 } else { 1 };
            let new_len = normalized.len().saturating_sub(cut);
            normalized.truncate(new_len);
        }
    }

    normalized
}

/// Writes candidates for a single target file inside one run's workspace.
#[derive(Debug, Clone)]
pub struct PatchEngine {
    workspace_root: PathBuf,
    target: PathBuf,
    language: SourceLanguage,
}

impl PatchEngine {
    /// `target` is relative to `workspace_root`.
    pub fn new(workspace_root: &Path, target: &Path) -> Self {
        Self {
            workspace_root: workspace_root.to_path_buf(),
            target: target.to_path_buf(),
            language: SourceLanguage::from_path(target),
        }
    }

    pub fn target_path(&self) -> PathBuf {
        self.workspace_root.join(&self.target)
    }

    /// Label used in diff headers, always with forward slashes.
    pub fn label(&self) -> String {
        self.target
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn read_target(&self) -> Result<String, PatchError> {
        let path = self.target_path();
        if !path.is_file() {
            return Err(PatchError::TargetMissing(path));
        }
        std::fs::read_to_string(&path).map_err(|source| PatchError::Io {
            action: "read",
            path,
            source,
        })
    }

    pub fn preflight(&self, candidate: &str) -> ParseResult {
        preflight(candidate, self.language)
    }

    /// Write `new` over the target and diff it against `previous`.
    pub fn apply(&self, previous: &str, new: &str) -> Result<AppliedPatch, PatchError> {
        let path = self.target_path();
        if !path.is_file() {
            return Err(PatchError::TargetMissing(path));
        }
        std::fs::write(&path, new).map_err(|source| PatchError::Io {
            action: "write",
            path: path.clone(),
            source,
        })?;
        Ok(AppliedPatch {
            written_path: path,
            unified_diff: unified_diff(previous, new, &self.label()),
        })
    }

    /// Put the baseline back after a rejected attempt.
    pub fn restore(&self, original: &str) -> Result<(), PatchError> {
        let path = self.target_path();
        std::fs::write(&path, original).map_err(|source| PatchError::Io {
            action: "restore",
            path,
            source,
        })
    }
}
