//! Cross-session savings totals.
//!
//! The [`RollupLedger`] keeps one [`SessionSnapshot`] per session and derives
//! its totals by summing them. Totals are never incremented directly, so
//! recording the same session twice cannot double-count.

use crate::config::SCHEMA_VERSION;
use crate::error::Result;
use crate::session::{SavingsLedger, Session, read_json_or_discard, write_json_atomic};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

fn schema_version() -> u32 {
    SCHEMA_VERSION
}

/// The latest known state of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub cwd: String,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub prompt_count: u64,
    #[serde(default)]
    pub savings: SavingsLedger,
}

impl From<&Session> for SessionSnapshot {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            title: session.title.clone(),
            cwd: session.cwd.clone(),
            last_activity: session.last_activity,
            prompt_count: session.prompt_count,
            savings: session.savings,
        }
    }
}

/// Sum of savings over a set of sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SavingsTotals {
    pub sessions: u64,
    pub prompts: u64,
    pub turns: u64,
    pub tokens_avoided: u64,
    pub tokens_injected: u64,
    pub tool_output_reclaimed: u64,
    pub stale_bundle_reclaimed: u64,
    pub total_saved: u64,
}

impl SavingsTotals {
    fn add(&mut self, snapshot: &SessionSnapshot) {
        let s = &snapshot.savings;
        self.sessions += 1;
        self.prompts += snapshot.prompt_count;
        self.turns += s.turns;
        self.tokens_avoided += s.tokens_avoided;
        self.tokens_injected += s.tokens_injected;
        self.tool_output_reclaimed += s.tool_output_reclaimed;
        self.stale_bundle_reclaimed += s.stale_bundle_reclaimed;
        self.total_saved += s.total_saved();
    }
}

impl<'a> FromIterator<&'a SessionSnapshot> for SavingsTotals {
    fn from_iter<I: IntoIterator<Item = &'a SessionSnapshot>>(iter: I) -> Self {
        let mut totals = Self::default();
        for snapshot in iter {
            totals.add(snapshot);
        }
        totals
    }
}

/// Time filter for [`RollupLedger::totals_within`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RollupWindow {
    #[default]
    All,
    /// Sessions active within the last N hours.
    Hours(u64),
}

impl FromStr for RollupWindow {
    type Err = String;

    /// Accepts `all`, `<n>h`, `<n>d`, or a bare number of hours.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if s == "all" {
            return Ok(RollupWindow::All);
        }
        let (digits, per_unit) = if let Some(d) = s.strip_suffix('d') {
            (d, 24)
        } else if let Some(h) = s.strip_suffix('h') {
            (h, 1)
        } else {
            (s.as_str(), 1)
        };
        digits
            .parse::<u64>()
            .map(|n| RollupWindow::Hours(n.saturating_mul(per_unit)))
            .map_err(|_| format!("invalid window '{s}': expected all, <n>h, or <n>d"))
    }
}

impl RollupWindow {
    fn contains(self, at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self {
            RollupWindow::All => true,
            RollupWindow::Hours(hours) => {
                let span = i64::try_from(hours)
                    .ok()
                    .and_then(Duration::try_hours)
                    .unwrap_or(Duration::MAX);
                now.signed_duration_since(at) <= span
            }
        }
    }
}

/// Snapshots of every known session plus their derived totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupLedger {
    #[serde(default = "schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub sessions: BTreeMap<String, SessionSnapshot>,
    #[serde(default)]
    pub totals: SavingsTotals,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for RollupLedger {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            sessions: BTreeMap::new(),
            totals: SavingsTotals::default(),
            updated_at: None,
        }
    }
}

impl RollupLedger {
    /// Replace the snapshot for `session` and recompute.
    pub fn upsert(&mut self, session: &Session) {
        self.sessions
            .insert(session.id.clone(), SessionSnapshot::from(session));
        self.recompute();
    }

    /// Drop snapshots. Returns how many existed.
    pub fn forget<S: AsRef<str>>(&mut self, ids: &[S]) -> usize {
        let removed = ids
            .iter()
            .filter(|id| self.sessions.remove(id.as_ref()).is_some())
            .count();
        if removed > 0 {
            self.recompute();
        }
        removed
    }

    pub fn recompute(&mut self) {
        self.totals = self.sessions.values().collect();
        self.updated_at = Some(Utc::now());
    }

    /// Totals over sessions active inside `window`, summed from snapshots.
    pub fn totals_within(&self, window: RollupWindow, now: DateTime<Utc>) -> SavingsTotals {
        self.sessions
            .values()
            .filter(|s| window.contains(s.last_activity, now))
            .collect()
    }
}

/// The single `rollup.json` file.
#[derive(Debug, Clone)]
pub struct RollupStore {
    path: PathBuf,
}

impl RollupStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current ledger. Missing or corrupt files give an empty ledger.
    pub fn load(&self) -> Result<RollupLedger> {
        Ok(read_json_or_discard(&self.path)?.unwrap_or_default())
    }

    /// Upsert a session's snapshot and persist.
    pub fn record(&self, session: &Session) -> Result<RollupLedger> {
        let mut ledger = self.load()?;
        ledger.upsert(session);
        write_json_atomic(&self.path, &ledger)?;
        debug!(
            session = %session.id,
            sessions = ledger.totals.sessions,
            total_saved = ledger.totals.total_saved,
            "rollup updated"
        );
        Ok(ledger)
    }

    /// Remove snapshots and persist if anything changed.
    pub fn forget<S: AsRef<str>>(&self, ids: &[S]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut ledger = self.load()?;
        let removed = ledger.forget(ids);
        if removed > 0 {
            write_json_atomic(&self.path, &ledger)?;
        }
        Ok(removed)
    }

    pub fn rollup(&self, window: RollupWindow) -> Result<SavingsTotals> {
        Ok(self.load()?.totals_within(window, Utc::now()))
    }
}
