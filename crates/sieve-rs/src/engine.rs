//! Turn coordinator.
//!
//! The [`Engine`] owns the loaded configuration, the resolved rule library,
//! the matcher's glob cache, and both stores. A host drives it twice per
//! turn: [`prepare_turn`](Engine::prepare_turn) before the model call and
//! [`trim_history`](Engine::trim_history) after the transcript has grown.
//!
//! Neither call fails. Persistence errors are logged and the in-memory
//! result is still returned, so a broken state directory degrades the
//! savings accounting without breaking the host's turn loop.

use crate::aggregate::{RuleBundle, aggregate, estimate_baseline};
use crate::config::{Config, LoadedConfig};
use crate::error::Result;
use crate::escalation::{EscalationLevel, resolve};
use crate::matcher::{ActivationResult, KeywordMatcher};
use crate::rollup::{RollupStore, RollupWindow, SavingsTotals};
use crate::rules::RuleLibrary;
use crate::session::{Session, SessionOverrides, SessionStore, apply_overrides, max_age};
use crate::transcript::TranscriptRecord;
use crate::trim::{TrimStats, compact};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Everything decided for one turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub session_id: String,
    /// The session was created by this turn.
    pub is_new: bool,
    pub prompt_count: u64,
    pub activation: ActivationResult,
    pub bundle: RuleBundle,
    /// Flat-injection cost under this session's effective configuration.
    pub baseline: u64,
    /// Estimated cost of the selected bundle.
    pub injected: u64,
}

impl TurnOutcome {
    pub fn tokens_avoided(&self) -> u64 {
        self.baseline.saturating_sub(self.injected)
    }
}

pub struct Engine {
    loaded: LoadedConfig,
    library: RuleLibrary,
    matcher: KeywordMatcher,
    sessions: SessionStore,
    rollup: RollupStore,
    /// Sessions whose last write failed. Persisted sessions are read back
    /// from the store.
    unsaved: HashMap<String, Session>,
}

impl Engine {
    /// Build an engine over a loaded configuration, creating the state
    /// directory if needed.
    pub fn new(loaded: LoadedConfig) -> Result<Self> {
        let state_dir = loaded.state_dir();
        let sessions = SessionStore::new(state_dir.join("sessions"))?;
        let rollup = RollupStore::new(state_dir.join("rollup.json"));
        let library = RuleLibrary::load(&loaded);
        debug!(
            groups = loaded.config.groups.len(),
            commands = loaded.config.commands.len(),
            state_dir = %state_dir.display(),
            "engine ready"
        );
        Ok(Self {
            loaded,
            library,
            matcher: KeywordMatcher::new(),
            sessions,
            rollup,
            unsaved: HashMap::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.loaded.config
    }

    pub fn library(&self) -> &RuleLibrary {
        &self.library
    }

    /// Configuration and rule document problems found at load time.
    pub fn warnings(&self) -> impl Iterator<Item = &String> {
        self.loaded.warnings.iter().chain(self.library.warnings())
    }

    // ── Per-turn operations ────────────────────────────────────────

    /// Count the prompt, select the instruction bundle, and record the
    /// selection saving.
    pub fn prepare_turn(
        &mut self,
        session_id: &str,
        cwd: &str,
        prompt: &str,
        active_paths: &[String],
    ) -> TurnOutcome {
        let (mut session, is_new) = self.session(session_id, cwd);
        let previous_level = self.level_for(&session);
        session.record_turn(prompt);

        let effective = apply_overrides(&self.loaded.config, &session.overrides);
        let activation = self.matcher.match_prompt(
            prompt,
            active_paths,
            &effective.groups,
            &effective.global_exclude,
        );
        let escalation = resolve(
            session.prompt_count,
            &effective.escalation.thresholds,
            &self.library.levels(&effective),
        );
        if escalation.level != previous_level && effective.escalation.enabled {
            info!(
                session = session_id,
                from = %previous_level,
                to = %escalation.level,
                prompt_count = session.prompt_count,
                "escalation level changed"
            );
        }

        let bundle = aggregate(&activation, &escalation, &effective, &self.library);
        let baseline = estimate_baseline(&effective, &self.library);
        let injected = bundle.estimated_tokens();
        session.savings.record_selection(baseline, injected);

        debug!(
            session = session_id,
            prompt_count = session.prompt_count,
            activated = ?activation.activated.keys().collect::<Vec<_>>(),
            injected,
            baseline,
            "turn prepared"
        );

        let outcome = TurnOutcome {
            session_id: session_id.to_string(),
            is_new,
            prompt_count: session.prompt_count,
            activation,
            bundle,
            baseline,
            injected,
        };
        self.store(session);
        outcome
    }

    /// Compact stale tool output and strip old bundles from `transcript`,
    /// recording what was reclaimed. An unknown session is only created
    /// when something was reclaimed.
    pub fn trim_history(&mut self, session_id: &str, transcript: &mut [TranscriptRecord]) -> TrimStats {
        let (mut session, is_new) = self.session(session_id, "");
        let effective = apply_overrides(&self.loaded.config, &session.overrides);
        let stats = compact(transcript, &effective.trim);
        if is_new && stats.total_reclaimed() == 0 {
            debug!(session = session_id, "nothing reclaimed for unknown session");
            return stats;
        }
        session.savings.record_trim(&stats);
        self.store(session);
        stats
    }

    // ── Session management ─────────────────────────────────────────

    /// A session's current overrides. Unknown sessions have none.
    pub fn overrides(&self, session_id: &str) -> SessionOverrides {
        self.session(session_id, "").0.overrides
    }

    /// Replace a session's overrides.
    pub fn set_overrides(&mut self, session_id: &str, overrides: SessionOverrides) -> Result<()> {
        let (mut session, _) = self.session(session_id, "");
        session.overrides = overrides;
        self.sessions.persist(&session)?;
        self.unsaved.remove(&session.id);
        Ok(())
    }

    /// Delete sessions idle past `max_age_hours` (the configured window when
    /// `None`) and drop them from the rollup. Returns the removed ids.
    pub fn sweep(&mut self, max_age_hours: Option<u64>) -> Result<Vec<String>> {
        self.sweep_at(max_age_hours, Utc::now())
    }

    fn sweep_at(&mut self, max_age_hours: Option<u64>, now: DateTime<Utc>) -> Result<Vec<String>> {
        let hours = max_age_hours.unwrap_or(self.loaded.config.session.max_age_hours);
        let removed = self.sessions.sweep_stale_at(hours, now)?;
        let cutoff = max_age(hours);
        self.unsaved
            .retain(|id, session| !removed.contains(id) && session.idle_for(now) <= cutoff);
        self.rollup.forget(&removed)?;
        Ok(removed)
    }

    pub fn rollup(&self, window: RollupWindow) -> Result<SavingsTotals> {
        self.rollup.rollup(window)
    }

    pub fn sessions(&self) -> Result<Vec<Session>> {
        self.sessions.list()
    }

    /// Flat-injection baseline under the global configuration.
    pub fn baseline(&self) -> u64 {
        estimate_baseline(&self.loaded.config, &self.library)
    }

    fn session(&self, session_id: &str, cwd: &str) -> (Session, bool) {
        if let Some(session) = self.unsaved.get(session_id) {
            return (session.clone(), false);
        }
        match self.sessions.get_or_create(session_id, cwd) {
            Ok(found) => found,
            Err(e) => {
                warn!("Failed to load session {session_id}, starting fresh: {e}");
                (Session::new(session_id, cwd), true)
            }
        }
    }

    fn level_for(&self, session: &Session) -> EscalationLevel {
        self.loaded
            .config
            .escalation
            .thresholds
            .level_for(session.prompt_count)
            .0
    }

    fn store(&mut self, session: Session) {
        if let Err(e) = self.sessions.persist(&session) {
            warn!("Failed to persist session {}: {e}", session.id);
            self.unsaved.insert(session.id.clone(), session);
            return;
        }
        self.unsaved.remove(&session.id);
        if let Err(e) = self.rollup.record(&session) {
            warn!("Failed to update rollup: {e}");
        }
    }
}
