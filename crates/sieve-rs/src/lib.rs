//! Context budget management for conversational agents.
//!
//! `sieve-rs` decides, once per turn, which instruction content belongs in an
//! agent's prompt and which historical transcript content has gone stale
//! enough to evict. Every decision is deterministic: keyword and glob
//! matching, a small escalation state machine, and a precisely specified
//! relevance score. Token counts are an approximation (characters / 4).
//!
//! The [`Engine`](engine::Engine) ties the pieces together and owns the
//! per-session store. A host calls it twice per turn:
//!
//! ```ignore
//! use sieve_rs::prelude::*;
//! use std::path::Path;
//!
//! let loaded = sieve_rs::config::load(Path::new(".sieve/config.json"))?;
//! let mut engine = Engine::new(loaded)?;
//!
//! // Before the model call: select the instruction bundle.
//! let outcome = engine.prepare_turn("sess-1", "~/project", prompt, &open_files);
//! let block = outcome.bundle.render();
//!
//! // After the host has appended to the transcript: compact stale output.
//! let stats = engine.trim_history("sess-1", &mut transcript);
//! ```
//!
//! # Where to find things
//!
//! - **Which rule groups fire for a prompt:** [`matcher`]. Boundary-aware
//!   keyword matching, path globs, `*command` tokens.
//! - **How guidance escalates as a session ages:** [`escalation`].
//! - **What gets injected and what it would cost to inject everything:**
//!   [`aggregate`], [`RuleBundle`](aggregate::RuleBundle) and
//!   [`estimate_baseline`](aggregate::estimate_baseline).
//! - **Which tool outputs are safe to compact:** [`trim`]. The scoring pass
//!   is pure ([`trim::plan`]); mutation happens only in [`trim::apply`].
//! - **Durable accounting:** [`session`] for per-conversation state and
//!   [`rollup`] for the cross-session totals.
//! - **Configuration and rule documents:** [`config`] and [`rules`].
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`matcher`] | Per-turn rule group activation |
//! | [`escalation`] | Prompt-count driven urgency levels |
//! | [`aggregate`] | Injected bundle assembly and flat-injection baseline |
//! | [`trim`] | Transcript relevance scoring and compaction |
//! | [`session`] | Session records, overrides, savings ledger |
//! | [`rollup`] | Cross-session savings totals |
//! | [`transcript`] | Transcript record model |
//! | [`engine`] | Turn coordinator |

pub mod aggregate;
pub mod config;
pub mod engine;
pub mod error;
pub mod escalation;
pub mod matcher;
pub mod prelude;
pub mod rollup;
pub mod rules;
pub mod session;
pub mod transcript;
pub mod trim;

pub use error::{Error, Result};

/// Characters per token used for every size estimate in this crate.
pub const CHARS_PER_TOKEN: u64 = 4;

/// Estimate the token cost of `chars` characters, rounding up.
pub fn tokens_for_chars(chars: u64) -> u64 {
    chars.div_ceil(CHARS_PER_TOKEN)
}

/// Estimate the token cost of a piece of text.
pub fn estimate_tokens(text: &str) -> u64 {
    tokens_for_chars(text.chars().count() as u64)
}

/// Estimate the token cost of a list of instruction lines.
pub fn estimate_lines_tokens<S: AsRef<str>>(lines: &[S]) -> u64 {
    tokens_for_chars(
        lines
            .iter()
            .map(|l| l.as_ref().chars().count() as u64)
            .sum(),
    )
}
