//! Relevance-scored compaction of historical tool output.
//!
//! Tool output is the largest consumer of a transcript's budget, and most of
//! it stops mattering once the model has acted on it. This module scores
//! every eligible tool result and replaces the low scorers with a one-line
//! summary, without any model call.
//!
//! The pass runs in three steps:
//!
//! 1. [`FileOpIndex::build`] records, per file path, the last record index at
//!    which it was read and at which it was modified.
//! 2. [`plan`] scores every completed, uncompacted tool result outside the
//!    protected tail and returns the [`Eviction`]s below the mode threshold.
//!    It never mutates.
//! 3. [`apply`] writes the summaries back and stamps `compacted_at`, which
//!    makes a record permanently ineligible for later passes.
//!
//! Separately, [`strip_stale_bundles`] removes previously injected rule
//! bundles from text parts anywhere in the transcript, since every turn gets
//! a freshly computed one.
//!
//! Scoring starts at 100 and subtracts:
//!
//! | Signal | Penalty |
//! |---|---|
//! | each record between this one and the end | 6 |
//! | read superseded by a later read of the same file | 60 |
//! | read followed by a later edit/write of the same file | 50 |
//! | output over 2000 tokens (else over 500) | 15 (8) |
//! | cheaply re-runnable tool | 10 |

use crate::aggregate::{BUNDLE_END, BUNDLE_START};
use crate::config::TrimConfig;
use crate::estimate_tokens;
use crate::transcript::{Part, ToolInvocation, ToolStatus, TranscriptRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

/// Starting score for every candidate.
pub const BASE_SCORE: u32 = 100;
/// Outputs below this many estimated tokens are never compacted.
pub const MIN_OUTPUT_TOKENS: u64 = 100;

const AGE_PENALTY: u32 = 6;
const SUPERSEDED_READ_PENALTY: u32 = 60;
const STALE_READ_PENALTY: u32 = 50;
const HUGE_OUTPUT_TOKENS: u64 = 2000;
const HUGE_OUTPUT_PENALTY: u32 = 15;
const LARGE_OUTPUT_TOKENS: u64 = 500;
const LARGE_OUTPUT_PENALTY: u32 = 8;
const EPHEMERAL_PENALTY: u32 = 10;

/// What a tool does to the file named in its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Read,
    Edit,
    Write,
}

impl OpKind {
    /// Classify a tool name. Tools that are not file operations yield `None`.
    pub fn classify(tool: &str) -> Option<Self> {
        match tool.to_ascii_lowercase().as_str() {
            "read" | "read_file" | "view" | "cat" => Some(OpKind::Read),
            "edit" | "edit_file" | "multiedit" | "patch" | "apply_patch" => Some(OpKind::Edit),
            "write" | "write_file" | "create" => Some(OpKind::Write),
            _ => None,
        }
    }
}

/// Tools whose output is cheap to regenerate on demand.
pub fn is_ephemeral(tool: &str) -> bool {
    matches!(
        tool.to_ascii_lowercase().as_str(),
        "bash" | "shell" | "glob" | "grep" | "find" | "ls" | "list_files" | "find_files" | "search"
    )
}

#[derive(Debug, Clone, Copy, Default)]
struct FileHistory {
    last_read: Option<usize>,
    last_modified: Option<usize>,
}

/// Per-file index of the latest read and modification, by record index.
#[derive(Debug, Default)]
pub struct FileOpIndex {
    files: HashMap<String, FileHistory>,
}

impl FileOpIndex {
    /// One pass over the transcript. Only completed or errored file
    /// operations count.
    pub fn build(records: &[TranscriptRecord]) -> Self {
        let mut index = Self::default();
        for (i, record) in records.iter().enumerate() {
            for tool in record.parts.iter().filter_map(Part::as_tool) {
                if !matches!(tool.status, ToolStatus::Completed | ToolStatus::Error) {
                    continue;
                }
                let (Some(kind), Some(path)) = (OpKind::classify(&tool.tool), tool.file_path())
                else {
                    continue;
                };
                index.record(path, i, kind);
            }
        }
        index
    }

    fn record(&mut self, path: &str, index: usize, kind: OpKind) {
        let history = self.files.entry(path.to_string()).or_default();
        let slot = match kind {
            OpKind::Read => &mut history.last_read,
            OpKind::Edit | OpKind::Write => &mut history.last_modified,
        };
        *slot = Some(slot.map_or(index, |prev| prev.max(index)));
    }

    /// Was `path` read again at an index after `index`?
    pub fn read_again_after(&self, path: &str, index: usize) -> bool {
        self.files
            .get(path)
            .and_then(|h| h.last_read)
            .is_some_and(|last| last > index)
    }

    /// Was `path` edited or written at an index after `index`?
    pub fn modified_after(&self, path: &str, index: usize) -> bool {
        self.files
            .get(path)
            .and_then(|h| h.last_modified)
            .is_some_and(|last| last > index)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Score one tool result at record `index` of a transcript of `len` records.
pub fn score(tool: &ToolInvocation, output_tokens: u64, index: usize, len: usize, files: &FileOpIndex) -> u32 {
    let mut penalty: u64 = 0;

    let distance = len.saturating_sub(index + 1) as u64;
    penalty += distance * AGE_PENALTY as u64;

    if OpKind::classify(&tool.tool) == Some(OpKind::Read)
        && let Some(path) = tool.file_path()
    {
        if files.read_again_after(path, index) {
            penalty += SUPERSEDED_READ_PENALTY as u64;
        }
        if files.modified_after(path, index) {
            penalty += STALE_READ_PENALTY as u64;
        }
    }

    if output_tokens > HUGE_OUTPUT_TOKENS {
        penalty += HUGE_OUTPUT_PENALTY as u64;
    } else if output_tokens > LARGE_OUTPUT_TOKENS {
        penalty += LARGE_OUTPUT_PENALTY as u64;
    }

    if is_ephemeral(&tool.tool) {
        penalty += EPHEMERAL_PENALTY as u64;
    }

    (BASE_SCORE as u64).saturating_sub(penalty) as u32
}

/// A tool result selected for compaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    pub record: usize,
    pub part: usize,
    pub score: u32,
    /// Estimated tokens of the original output.
    pub tokens: u64,
    pub summary: String,
}

/// Score every eligible tool result and return those to compact.
///
/// Pure: the transcript is only read. Records in the last
/// `preserve_last_n` positions are never selected.
pub fn plan(records: &[TranscriptRecord], config: &TrimConfig) -> Vec<Eviction> {
    if !config.enabled {
        return Vec::new();
    }
    let len = records.len();
    let boundary = len.saturating_sub(config.preserve_last_n);
    let threshold = config.mode.threshold();
    let files = FileOpIndex::build(records);

    let mut evictions = Vec::new();
    for (i, record) in records.iter().enumerate().take(boundary) {
        for (p, part) in record.parts.iter().enumerate() {
            let Some(tool) = part.as_tool() else {
                continue;
            };
            if tool.status != ToolStatus::Completed || tool.is_compacted() {
                continue;
            }
            let Some(ref output) = tool.output else {
                continue;
            };
            let tokens = estimate_tokens(output);
            if tokens < MIN_OUTPUT_TOKENS {
                continue;
            }

            let score = score(tool, tokens, i, len, &files);
            if score < threshold {
                evictions.push(Eviction {
                    record: i,
                    part: p,
                    score,
                    tokens,
                    summary: summarize(tool, tokens),
                });
            }
        }
    }

    debug!(
        candidates = evictions.len(),
        boundary,
        files = files.len(),
        "compaction planned"
    );
    evictions
}

/// Tool-specific one-line replacement for a compacted output.
pub fn summarize(tool: &ToolInvocation, tokens: u64) -> String {
    let name = tool.tool.as_str();
    let what = match (OpKind::classify(name), tool.file_path()) {
        (Some(OpKind::Read), Some(path)) => format!("read of {path}"),
        (Some(_), Some(path)) => format!("{name} on {path}"),
        _ => {
            if let Some(command) = tool.input_str(&["command", "cmd"]) {
                format!("ran `{}`", truncate(command, 80))
            } else if let Some(pattern) = tool.input_str(&["pattern", "query", "glob"]) {
                format!("{name} for \"{}\"", truncate(pattern, 80))
            } else {
                format!("{name} output")
            }
        }
    };
    format!(
        "[compacted] {what} (~{tokens} tokens reclaimed)\nRe-run the tool if you need this content again."
    )
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let head: String = text.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{head}...")
    }
}

/// Write planned summaries back and stamp them as compacted.
///
/// Returns the estimated tokens reclaimed. Evictions pointing at parts that
/// are no longer completed, uncompacted tool results are skipped.
pub fn apply(records: &mut [TranscriptRecord], evictions: &[Eviction], now: DateTime<Utc>) -> (usize, u64) {
    let mut applied = 0;
    let mut reclaimed = 0;
    for eviction in evictions {
        let Some(Part::Tool(tool)) = records
            .get_mut(eviction.record)
            .and_then(|r| r.parts.get_mut(eviction.part))
        else {
            continue;
        };
        if tool.is_compacted() || tool.status != ToolStatus::Completed {
            continue;
        }
        let new_tokens = estimate_tokens(&eviction.summary);
        tool.output = Some(eviction.summary.clone());
        tool.compacted_at = Some(now);
        applied += 1;
        reclaimed += eviction.tokens.saturating_sub(new_tokens);
    }
    (applied, reclaimed)
}

/// Remove every previously injected bundle from text parts, tail included.
///
/// Returns `(bundles removed, estimated tokens reclaimed)`.
pub fn strip_stale_bundles(records: &mut [TranscriptRecord]) -> (usize, u64) {
    let mut removed = 0;
    let mut chars_before = 0u64;
    let mut chars_after = 0u64;

    for record in records.iter_mut() {
        for part in record.parts.iter_mut() {
            let Part::Text(text) = part else {
                continue;
            };
            if !text.text.contains(BUNDLE_START) {
                continue;
            }
            let (stripped, count) = strip_bundles(&text.text);
            if count == 0 {
                continue;
            }
            chars_before += text.text.chars().count() as u64;
            chars_after += stripped.chars().count() as u64;
            removed += count;
            text.text = stripped;
        }
    }

    (removed, crate::tokens_for_chars(chars_before.saturating_sub(chars_after)))
}

/// Remove complete `BUNDLE_START … BUNDLE_END` spans. An unterminated start
/// marker and everything after it are left alone.
fn strip_bundles(text: &str) -> (String, usize) {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    let mut count = 0;
    while let Some((before, opened)) = rest.split_once(BUNDLE_START)
        && let Some((_, after)) = opened.split_once(BUNDLE_END)
    {
        out.push_str(before);
        rest = after.strip_prefix('\n').unwrap_or(after);
        count += 1;
    }
    out.push_str(rest);
    (out, count)
}

/// What a compaction pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrimStats {
    /// Tool results that were eligible for scoring.
    pub scored: usize,
    pub compacted: usize,
    pub tool_tokens_reclaimed: u64,
    pub bundles_stripped: usize,
    pub bundle_tokens_reclaimed: u64,
}

impl TrimStats {
    pub fn total_reclaimed(&self) -> u64 {
        self.tool_tokens_reclaimed + self.bundle_tokens_reclaimed
    }
}

/// Full pass: plan, apply, strip stale bundles.
pub fn compact(records: &mut [TranscriptRecord], config: &TrimConfig) -> TrimStats {
    compact_at(records, config, Utc::now())
}

/// [`compact`] with an explicit clock.
pub fn compact_at(records: &mut [TranscriptRecord], config: &TrimConfig, now: DateTime<Utc>) -> TrimStats {
    if !config.enabled {
        return TrimStats::default();
    }

    let scored = count_scorable(records, config.preserve_last_n);
    let evictions = plan(records, config);
    let (compacted, tool_tokens_reclaimed) = apply(records, &evictions, now);
    let (bundles_stripped, bundle_tokens_reclaimed) = strip_stale_bundles(records);

    let stats = TrimStats {
        scored,
        compacted,
        tool_tokens_reclaimed,
        bundles_stripped,
        bundle_tokens_reclaimed,
    };
    if stats.compacted > 0 || stats.bundles_stripped > 0 {
        info!(
            compacted = stats.compacted,
            tool_tokens = stats.tool_tokens_reclaimed,
            bundles = stats.bundles_stripped,
            bundle_tokens = stats.bundle_tokens_reclaimed,
            "transcript compacted"
        );
    }
    stats
}

fn count_scorable(records: &[TranscriptRecord], preserve_last_n: usize) -> usize {
    let boundary = records.len().saturating_sub(preserve_last_n);
    records[..boundary]
        .iter()
        .flat_map(|r| r.parts.iter().filter_map(Part::as_tool))
        .filter(|t| {
            t.status == ToolStatus::Completed
                && !t.is_compacted()
                && t.output
                    .as_deref()
                    .is_some_and(|o| estimate_tokens(o) >= MIN_OUTPUT_TOKENS)
        })
        .count()
}
