//! Per-session state: prompt counter, overrides, and the savings ledger.
//!
//! Each session is a single JSON file in the store directory:
//!
//! ```text
//! state/sessions/
//!   sess-1.json
//!   sess-2.json
//!   team%2Falpha.json
//! ```
//!
//! Writes are atomic (temp file, then rename). A file that fails to parse is
//! deleted and replaced by a fresh session rather than surfacing an error.

use crate::config::{Config, SCHEMA_VERSION};
use crate::error::{Error, Result};
use crate::trim::TrimStats;
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Titles are derived from the first prompts only.
const TITLE_PROMPTS: u64 = 3;
const TITLE_MAX_CHARS: usize = 60;

fn schema_version() -> u32 {
    SCHEMA_VERSION
}

// ── Session ────────────────────────────────────────────────────────

/// Durable state for one conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    #[serde(default = "schema_version")]
    pub schema_version: u32,
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Working-directory label supplied by the host.
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub prompt_count: u64,
    #[serde(default)]
    pub overrides: SessionOverrides,
    #[serde(default)]
    pub savings: SavingsLedger,
}

impl Session {
    pub fn new(id: impl Into<String>, cwd: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION,
            id: id.into(),
            created_at: now,
            last_activity: now,
            cwd: cwd.into(),
            title: None,
            prompt_count: 0,
            overrides: SessionOverrides::default(),
            savings: SavingsLedger::default(),
        }
    }

    /// Count a user prompt and derive a title from the first few.
    pub fn record_turn(&mut self, prompt: &str) {
        self.record_turn_at(prompt, Utc::now());
    }

    pub fn record_turn_at(&mut self, prompt: &str, now: DateTime<Utc>) {
        self.prompt_count += 1;
        self.last_activity = now;
        if self.title.is_none() && self.prompt_count <= TITLE_PROMPTS {
            self.title = derive_title(prompt);
        }
    }

    /// Time since the last recorded activity.
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.last_activity)
    }
}

/// Collapse whitespace and cap at 60 characters. Empty prompts give no title.
pub fn derive_title(prompt: &str) -> Option<String> {
    let collapsed = prompt.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return None;
    }
    if collapsed.chars().count() > TITLE_MAX_CHARS {
        let head: String = collapsed.chars().take(TITLE_MAX_CHARS - 3).collect();
        Some(format!("{head}..."))
    } else {
        Some(collapsed)
    }
}

// ── Overrides ──────────────────────────────────────────────────────

/// Per-session feature switches. `None` inherits the configured value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOverrides {
    pub escalation: Option<bool>,
    pub star_commands: Option<bool>,
    pub trim: Option<bool>,
    /// Per-group enablement, keyed by group id.
    pub groups: BTreeMap<String, Option<bool>>,
}

impl SessionOverrides {
    pub fn is_empty(&self) -> bool {
        self.escalation.is_none()
            && self.star_commands.is_none()
            && self.trim.is_none()
            && self.groups.values().all(Option::is_none)
    }
}

/// The configuration as seen by one session. The input is never modified.
pub fn apply_overrides(config: &Config, overrides: &SessionOverrides) -> Config {
    let mut effective = config.clone();
    if let Some(enabled) = overrides.escalation {
        effective.escalation.enabled = enabled;
    }
    if let Some(enabled) = overrides.star_commands {
        effective.star_commands_enabled = enabled;
    }
    if let Some(enabled) = overrides.trim {
        effective.trim.enabled = enabled;
    }
    for (id, enabled) in &overrides.groups {
        let Some(enabled) = *enabled else {
            continue;
        };
        match effective.groups.iter_mut().find(|g| &g.id == id) {
            Some(group) => group.enabled = enabled,
            None => debug!(group = %id, "override for unknown group ignored"),
        }
    }
    effective
}

// ── Savings ────────────────────────────────────────────────────────

/// Monotone token counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SavingsLedger {
    /// Baseline minus injected, summed over turns.
    pub tokens_avoided: u64,
    pub tokens_injected: u64,
    pub tool_output_reclaimed: u64,
    pub stale_bundle_reclaimed: u64,
    pub turns: u64,
}

impl SavingsLedger {
    /// Record one turn's selection against the flat-injection baseline.
    pub fn record_selection(&mut self, baseline: u64, injected: u64) {
        self.tokens_avoided += baseline.saturating_sub(injected);
        self.tokens_injected += injected;
        self.turns += 1;
    }

    pub fn record_trim(&mut self, stats: &TrimStats) {
        self.tool_output_reclaimed += stats.tool_tokens_reclaimed;
        self.stale_bundle_reclaimed += stats.bundle_tokens_reclaimed;
    }

    /// Everything saved, by selection and by compaction.
    pub fn total_saved(&self) -> u64 {
        self.tokens_avoided + self.tool_output_reclaimed + self.stale_bundle_reclaimed
    }
}

// ── SessionStore ───────────────────────────────────────────────────

/// Directory of `<id>.json` session files.
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    /// Create a store, ensuring the directory exists.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn session_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(id)))
    }

    /// Load a session. Missing gives `None`; a corrupt file is deleted and
    /// also gives `None`. A file holding a different id (case-folding
    /// filesystems) is left alone and also gives `None`.
    pub fn load(&self, id: &str) -> Result<Option<Session>> {
        let loaded: Option<Session> = read_json_or_discard(&self.session_path(id))?;
        Ok(loaded.filter(|session| {
            let same = session.id == id;
            if !same {
                debug!(session = id, stored = %session.id, "session file belongs to another id");
            }
            same
        }))
    }

    /// Load a session or start a fresh one. The flag is `true` for new
    /// sessions. Nothing is written until [`persist`](Self::persist).
    pub fn get_or_create(&self, id: &str, cwd: &str) -> Result<(Session, bool)> {
        match self.load(id)? {
            Some(session) => Ok((session, false)),
            None => {
                debug!(session = id, "new session");
                Ok((Session::new(id, cwd), true))
            }
        }
    }

    pub fn persist(&self, session: &Session) -> Result<()> {
        write_json_atomic(&self.session_path(&session.id), session)
    }

    /// Every readable session. Unreadable files are skipped.
    pub fn list(&self) -> Result<Vec<Session>> {
        let mut sessions = Vec::new();
        for path in self.session_files()? {
            match read_json::<Session>(&path) {
                Ok(session) => sessions.push(session),
                Err(e) => warn!("Skipping unreadable session: {e}"),
            }
        }
        sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(sessions)
    }

    /// Delete sessions idle for longer than `max_age_hours`, and any file
    /// that does not parse. Returns the ids removed (file stems for
    /// unparsable files).
    pub fn sweep_stale(&self, max_age_hours: u64) -> Result<Vec<String>> {
        self.sweep_stale_at(max_age_hours, Utc::now())
    }

    pub fn sweep_stale_at(&self, max_age_hours: u64, now: DateTime<Utc>) -> Result<Vec<String>> {
        let max_age = max_age(max_age_hours);
        let mut removed = Vec::new();

        for path in self.session_files()? {
            let id = match read_json::<Session>(&path) {
                Ok(session) if session.idle_for(now) > max_age => session.id,
                Ok(_) => continue,
                Err(e) => {
                    warn!("Deleting unreadable session: {e}");
                    path.file_stem()
                        .map(|s| id_from_stem(&s.to_string_lossy()))
                        .unwrap_or_default()
                }
            };
            match std::fs::remove_file(&path) {
                Ok(()) => removed.push(id),
                Err(e) => warn!("Failed to delete {}: {e}", path.display()),
            }
        }

        if !removed.is_empty() {
            info!(count = removed.len(), "swept stale sessions");
        }
        Ok(removed)
    }

    fn session_files(&self) -> Result<Vec<PathBuf>> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| Error::io(&self.dir, e))?;
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(&self.dir, e))?;
            let path = entry.path();
            if entry.file_type().is_ok_and(|ft| ft.is_file())
                && path.extension().is_some_and(|ext| ext == "json")
            {
                files.push(path);
            }
        }
        Ok(files)
    }
}

/// Staleness window; absurd hour counts saturate instead of overflowing.
pub(crate) fn max_age(hours: u64) -> Duration {
    i64::try_from(hours)
        .ok()
        .and_then(Duration::try_hours)
        .unwrap_or(Duration::MAX)
}

/// Session ids come from the host. Bytes outside `[A-Za-z0-9_-]` are
/// written as `%XX`, so distinct ids never share a file.
fn file_stem(id: &str) -> String {
    let mut stem = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            stem.push(char::from(byte));
        } else {
            stem.push_str(&format!("%{byte:02X}"));
        }
    }
    stem
}

/// Inverse of [`file_stem`]. Malformed escapes are kept literally.
fn id_from_stem(stem: &str) -> String {
    let mut bytes = Vec::with_capacity(stem.len());
    let mut rest = stem.as_bytes();
    while let Some((&byte, tail)) = rest.split_first() {
        if byte == b'%'
            && let Some(hex) = tail.get(..2)
            && let Ok(hex) = std::str::from_utf8(hex)
            && let Ok(decoded) = u8::from_str_radix(hex, 16)
        {
            bytes.push(decoded);
            rest = tail.get(2..).unwrap_or_default();
            continue;
        }
        bytes.push(byte);
        rest = tail;
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

// ── JSON persistence helpers ───────────────────────────────────────

/// Atomic write: serialize to a temp file, then rename into place.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));

    let json = serde_json::to_string_pretty(value).map_err(|e| Error::json(path, e))?;
    std::fs::write(&tmp_path, json).map_err(|e| Error::io(&tmp_path, e))?;
    std::fs::rename(&tmp_path, path).map_err(|e| Error::io(path, e))?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let json = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    serde_json::from_str(&json).map_err(|e| Error::json(path, e))
}

/// Read a JSON document. A missing file gives `None`; one that does not
/// parse is deleted and also gives `None`.
pub(crate) fn read_json_or_discard<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    match read_json(path) {
        Ok(value) => Ok(Some(value)),
        Err(Error::Json { source, .. }) => {
            warn!("Discarding corrupt state file {}: {source}", path.display());
            std::fs::remove_file(path).map_err(|e| Error::io(path, e))?;
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuleGroup;
    use std::fs;

    fn store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("sessions")).unwrap();
        (dir, store)
    }

    #[test]
    fn title_comes_from_early_prompts() {
        let mut session = Session::new("s", "~");
        session.record_turn("   ");
        assert_eq!(session.title, None);
        session.record_turn("  fix   the\n\tlogin bug ");
        assert_eq!(session.title.as_deref(), Some("fix the login bug"));
        session.record_turn("something else");
        assert_eq!(session.title.as_deref(), Some("fix the login bug"));
        assert_eq!(session.prompt_count, 3);
    }

    #[test]
    fn no_title_after_third_prompt() {
        let mut session = Session::new("s", "~");
        for _ in 0..3 {
            session.record_turn("");
        }
        session.record_turn("late prompt");
        assert_eq!(session.title, None);
    }

    #[test]
    fn long_titles_are_truncated() {
        let title = derive_title(&"word ".repeat(30)).unwrap();
        assert_eq!(title.chars().count(), 60);
        assert!(title.ends_with("..."));

        let exact = "a".repeat(60);
        assert_eq!(derive_title(&exact), Some(exact.clone()));
    }

    #[test]
    fn overrides_do_not_touch_the_input() {
        let config = Config {
            groups: vec![RuleGroup::new("docs"), RuleGroup::new("rust")],
            ..Config::default()
        };
        let mut overrides = SessionOverrides {
            escalation: Some(false),
            trim: Some(false),
            ..SessionOverrides::default()
        };
        overrides.groups.insert("rust".into(), Some(false));
        overrides.groups.insert("docs".into(), None);
        overrides.groups.insert("ghost".into(), Some(true));

        let effective = apply_overrides(&config, &overrides);
        assert!(!effective.escalation.enabled);
        assert!(!effective.trim.enabled);
        assert!(effective.star_commands_enabled);
        assert!(effective.groups[0].enabled);
        assert!(!effective.groups[1].enabled);

        assert!(config.escalation.enabled);
        assert!(config.trim.enabled);
        assert!(config.groups[1].enabled);
    }

    #[test]
    fn empty_overrides_are_identity() {
        let config = Config::default();
        let overrides = SessionOverrides::default();
        assert!(overrides.is_empty());
        assert_eq!(apply_overrides(&config, &overrides), config);
    }

    #[test]
    fn ledger_accumulates() {
        let mut ledger = SavingsLedger::default();
        ledger.record_selection(500, 120);
        ledger.record_selection(500, 600);
        ledger.record_trim(&TrimStats {
            tool_tokens_reclaimed: 300,
            bundle_tokens_reclaimed: 40,
            ..TrimStats::default()
        });
        assert_eq!(ledger.tokens_avoided, 380);
        assert_eq!(ledger.tokens_injected, 720);
        assert_eq!(ledger.turns, 2);
        assert_eq!(ledger.total_saved(), 720);
    }

    #[test]
    fn persist_and_reload() {
        let (_dir, store) = store();
        let (mut session, is_new) = store.get_or_create("sess-1", "~/work").unwrap();
        assert!(is_new);
        session.record_turn("hello");
        store.persist(&session).unwrap();
        store.persist(&session).unwrap();

        let (loaded, is_new) = store.get_or_create("sess-1", "ignored").unwrap();
        assert!(!is_new);
        assert_eq!(loaded, session);
        assert!(!store.dir().join(".sess-1.json.tmp").exists());
    }

    #[test]
    fn corrupt_session_is_replaced() {
        let (_dir, store) = store();
        let path = store.dir().join("broken.json");
        fs::write(&path, "{ not json").unwrap();

        let (session, is_new) = store.get_or_create("broken", "~").unwrap();
        assert!(is_new);
        assert_eq!(session.prompt_count, 0);
        assert!(!path.exists());
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let (_dir, store) = store();
        fs::write(
            store.dir().join("old.json"),
            r#"{"id":"old","created_at":"2026-01-01T00:00:00Z","last_activity":"2026-01-01T00:00:00Z","future_field":1}"#,
        )
        .unwrap();
        let session = store.load("old").unwrap().unwrap();
        assert_eq!(session.schema_version, SCHEMA_VERSION);
        assert_eq!(session.savings, SavingsLedger::default());
    }

    #[test]
    fn ids_are_escaped_for_the_filesystem() {
        let (_dir, store) = store();
        let session = Session::new("../escape/attempt", "~");
        store.persist(&session).unwrap();
        assert!(store.dir().join("%2E%2E%2Fescape%2Fattempt.json").exists());
        assert_eq!(store.load("../escape/attempt").unwrap().unwrap().id, "../escape/attempt");
        assert_eq!(id_from_stem(&file_stem("../escape/attempt")), "../escape/attempt");
        assert_eq!(id_from_stem(&file_stem("naïve 100%")), "naïve 100%");
    }

    #[test]
    fn similar_ids_do_not_share_a_file() {
        let (_dir, store) = store();
        let mut slashed = Session::new("team/alpha", "~");
        slashed.record_turn("first");
        store.persist(&slashed).unwrap();

        let (session, is_new) = store.get_or_create("team_alpha", "~").unwrap();
        assert!(is_new);
        assert_eq!(session.prompt_count, 0);
        store.persist(&session).unwrap();

        assert_eq!(store.load("team/alpha").unwrap().unwrap().prompt_count, 1);
        assert_eq!(store.list().unwrap().len(), 2);
    }

    #[test]
    fn file_holding_another_id_is_not_loaded() {
        let (_dir, store) = store();
        let other = Session::new("Alpha", "~");
        fs::write(
            store.dir().join("alpha.json"),
            serde_json::to_string(&other).unwrap(),
        )
        .unwrap();

        assert!(store.load("alpha").unwrap().is_none());
        assert!(store.dir().join("alpha.json").exists());
    }

    #[test]
    fn sweeping_a_corrupt_escaped_file_reports_its_id() {
        let (_dir, store) = store();
        fs::write(store.dir().join("team%2Falpha.json"), "not json").unwrap();
        assert_eq!(store.sweep_stale_at(24, Utc::now()).unwrap(), vec!["team/alpha"]);
    }

    #[test]
    fn sweep_removes_stale_and_corrupt() {
        let (_dir, store) = store();
        let now = Utc::now();

        let mut fresh = Session::new("fresh", "~");
        fresh.last_activity = now - Duration::hours(1);
        let mut stale = Session::new("stale", "~");
        stale.last_activity = now - Duration::hours(30);
        store.persist(&fresh).unwrap();
        store.persist(&stale).unwrap();
        fs::write(store.dir().join("garbage.json"), "[]").unwrap();

        let mut removed = store.sweep_stale_at(24, now).unwrap();
        removed.sort();
        assert_eq!(removed, vec!["garbage", "stale"]);
        assert_eq!(store.list().unwrap().len(), 1);
        assert!(store.load("fresh").unwrap().is_some());
    }
}
