//! Output validation for generated text
//!
//! Anything that is not a bare source body is rejected. PR descriptions are
//! prose by nature and only get the encoding checks.

use super::{GenerationContext, PromptKind};
use crate::patch::{preflight, top_level_symbols, DiffSummary, ParseResult, SourceLanguage, SyntaxIssue};
use std::path::Path;

/// Lowercase line openers that mark commentary rather than code.
pub const PROSE_MARKERS: &[&str] = &[
    "here is",
    "here's",
    "fixed code",
    "updated code",
    "explanation",
    "this fixes",
    "the issue",
    "sure,",
    "certainly",
];

const LARGE_FILE_CHARS: usize = 2000;
const LARGE_FILE_LINES: usize = 120;
const MASS_DELETION_LINES: usize = 80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Empty,
    Binary,
    MarkdownFence,
    Prose { line: usize, marker: &'static str },
    Syntax(SyntaxIssue),
    Truncated(String),
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::Empty => write!(f, "empty response"),
            Rejection::Binary => write!(f, "response contains binary or control characters"),
            Rejection::MarkdownFence => write!(f, "response contains markdown code fences"),
            Rejection::Prose { line, marker } => {
                write!(f, "prose on line {} (starts with \"{}\")", line, marker)
            }
            Rejection::Syntax(issue) => write!(f, "syntax error at {}", issue),
            Rejection::Truncated(reason) => write!(f, "possible truncation: {}", reason),
        }
    }
}

/// Validate `text` for `kind` and return the cleaned body.
pub fn validate(kind: PromptKind, text: &str, ctx: &GenerationContext) -> Result<String, Rejection> {
    check_encoding(text)?;
    match kind {
        PromptKind::PrDescription => clean_description(text),
        PromptKind::ReproductionScript => validate_source(text, SourceLanguage::Python),
        PromptKind::FixContent => {
            let language = SourceLanguage::from_path(Path::new(&ctx.target_file));
            let body = validate_source(text, language)?;
            check_truncation(&ctx.original_content, &body)?;
            Ok(body)
        }
    }
}

fn check_encoding(text: &str) -> Result<(), Rejection> {
    if text.trim().is_empty() {
        return Err(Rejection::Empty);
    }
    let binary = text
        .chars()
        .any(|c| c == '\0' || (c.is_control() && !matches!(c, '\n' | '\r' | '\t' | '\x0c')));
    if binary {
        return Err(Rejection::Binary);
    }
    Ok(())
}

fn is_fence(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("```") || trimmed.starts_with("~~~")
}

fn validate_source(text: &str, language: SourceLanguage) -> Result<String, Rejection> {
    if text.lines().any(is_fence) {
        return Err(Rejection::MarkdownFence);
    }

    for (idx, line) in text.lines().enumerate() {
        // Indented lines belong to code blocks or docstrings.
        if line.starts_with(char::is_whitespace) || line.starts_with('#') {
            continue;
        }
        let lower = line.to_lowercase();
        if let Some(&marker) = PROSE_MARKERS.iter().find(|m| lower.starts_with(**m)) {
            return Err(Rejection::Prose {
                line: idx + 1,
                marker,
            });
        }
    }

    let body = strip_outer_blank_lines(text);
    if let ParseResult::SyntaxInvalid(issue) = preflight(&body, language) {
        return Err(Rejection::Syntax(issue));
    }
    Ok(body)
}

fn strip_outer_blank_lines(text: &str) -> String {
    let trimmed = text.trim_start_matches(['\n', '\r']).trim_end();
    format!("{}\n", trimmed)
}

fn clean_description(text: &str) -> Result<String, Rejection> {
    let cleaned = text
        .lines()
        .filter(|line| !is_fence(line))
        .collect::<Vec<_>>()
        .join("\n");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return Err(Rejection::Empty);
    }
    Ok(format!("{}\n", cleaned))
}

/// Full-file candidates that lose most of the file are almost always cut off
/// by the provider's output limit.
pub fn check_truncation(original: &str, candidate: &str) -> Result<(), Rejection> {
    if candidate.trim().is_empty() {
        return Err(Rejection::Empty);
    }

    let original_chars = original.chars().count();
    let candidate_chars = candidate.chars().count();
    if original_chars >= LARGE_FILE_CHARS && candidate_chars < original_chars * 9 / 10 {
        return Err(Rejection::Truncated(format!(
            "{} of {} characters kept",
            candidate_chars, original_chars
        )));
    }

    let original_lines = original.lines().count();
    let candidate_lines = candidate.lines().count();
    if original_lines >= LARGE_FILE_LINES && candidate_lines < original_lines * 9 / 10 {
        return Err(Rejection::Truncated(format!(
            "{} of {} lines kept",
            candidate_lines, original_lines
        )));
    }

    if let Some(original_symbols) = top_level_symbols(original).filter(|s| !s.is_empty()) {
        let candidate_symbols = top_level_symbols(candidate).unwrap_or_default();
        let preserved = original_symbols.intersection(&candidate_symbols).count();
        if preserved * 10 < original_symbols.len() * 9 {
            return Err(Rejection::Truncated(format!(
                "{} of {} top-level definitions kept",
                preserved,
                original_symbols.len()
            )));
        }
    }

    let summary = DiffSummary::between(original, candidate);
    if summary.lines_removed >= MASS_DELETION_LINES
        && summary.lines_removed > summary.lines_added * 3
    {
        return Err(Rejection::Truncated(format!(
            "{} lines removed, {} added",
            summary.lines_removed, summary.lines_added
        )));
    }

    Ok(())
}
