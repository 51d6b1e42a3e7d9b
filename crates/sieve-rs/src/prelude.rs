//! Convenience re-exports for common `sieve-rs` types.
//!
//! ```ignore
//! use sieve_rs::prelude::*;
//! ```
//!
//! Covers what a host needs to drive turns: the [`Engine`], configuration
//! loading, and the transcript model. Scoring internals (file-op index,
//! evictions, glob cache) are left to their modules.

// ── Engine ──────────────────────────────────────────────────────────
pub use crate::engine::{Engine, TurnOutcome};
pub use crate::{Error, Result};

// ── Configuration ───────────────────────────────────────────────────
pub use crate::config::{Config, LoadedConfig, RuleGroup, RuleSource, TrimConfig, TrimMode};

// ── Per-turn results ────────────────────────────────────────────────
pub use crate::aggregate::RuleBundle;
pub use crate::escalation::EscalationLevel;
pub use crate::matcher::ActivationResult;
pub use crate::trim::TrimStats;

// ── Sessions ────────────────────────────────────────────────────────
pub use crate::rollup::{RollupWindow, SavingsTotals};
pub use crate::session::{SavingsLedger, Session, SessionOverrides};

// ── Transcript ──────────────────────────────────────────────────────
pub use crate::transcript::{Part, ToolInvocation, ToolStatus, TranscriptRecord};
