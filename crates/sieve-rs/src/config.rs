//! Static configuration: rule groups, commands, escalation, trimming.
//!
//! Loaded once per process from a JSON file. Every field has a default, so
//! a config file only needs to name what it changes:
//!
//! ```json
//! {
//!   "groups": [
//!     { "id": "docs", "recall": ["setup", "readme"], "rules_file": "rules/docs.md" },
//!     { "id": "core", "always_on": true, "rules": ["Prefer small diffs."] }
//!   ],
//!   "commands": { "brief": { "rules": ["Answer in three sentences or fewer."] } },
//!   "escalation": { "thresholds": { "moderate": 15, "heavy": 35, "critical": 50 } },
//!   "trim": { "mode": "balanced", "preserve_last_n": 6 }
//! }
//! ```
//!
//! Defects inside a config that exists are never fatal: they degrade the
//! affected feature and land in [`LoadedConfig::warnings`]. Only a missing
//! file is an error ([`Error::ConfigNotFound`]).

use crate::error::{Error, Result};
use crate::escalation::Thresholds;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Current schema version written into persisted documents.
pub const SCHEMA_VERSION: u32 = 1;

fn default_true() -> bool {
    true
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub schema_version: u32,
    /// Rule groups in priority order.
    pub groups: Vec<RuleGroup>,
    /// `*command` definitions keyed by lower-case command name.
    pub commands: BTreeMap<String, RuleSource>,
    /// Keywords that suppress every group for the turn.
    pub global_exclude: Vec<String>,
    pub star_commands_enabled: bool,
    pub escalation: EscalationConfig,
    pub trim: TrimConfig,
    pub session: SessionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            groups: Vec::new(),
            commands: BTreeMap::new(),
            global_exclude: Vec::new(),
            star_commands_enabled: true,
            escalation: EscalationConfig::default(),
            trim: TrimConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

/// A named, independently toggleable set of instruction lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleGroup {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Always injected; keyword lists are never evaluated.
    #[serde(default)]
    pub always_on: bool,
    /// Activation keywords (case-insensitive, word-boundary match).
    #[serde(default)]
    pub recall: Vec<String>,
    /// Suppression keywords; a hit excludes the group for the turn.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// File path globs that activate the group.
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(flatten)]
    pub source: RuleSource,
}

impl RuleGroup {
    /// A group with inline rules and no activation triggers.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            enabled: true,
            always_on: false,
            recall: Vec::new(),
            exclude: Vec::new(),
            paths: Vec::new(),
            source: RuleSource::default(),
        }
    }

    pub fn with_recall(mut self, keywords: &[&str]) -> Self {
        self.recall = keywords.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn with_exclude(mut self, keywords: &[&str]) -> Self {
        self.exclude = keywords.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn with_paths(mut self, globs: &[&str]) -> Self {
        self.paths = globs.iter().map(|g| g.to_string()).collect();
        self
    }

    pub fn with_rules(mut self, rules: &[&str]) -> Self {
        self.source.rules = rules.iter().map(|r| r.to_string()).collect();
        self
    }

    pub fn always_on(mut self) -> Self {
        self.always_on = true;
        self
    }
}

/// Where a set of instruction lines comes from: inline, a document, or both
/// (inline lines first).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleSource {
    pub rules: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules_file: Option<PathBuf>,
}

impl RuleSource {
    pub fn inline(rules: &[&str]) -> Self {
        Self {
            rules: rules.iter().map(|r| r.to_string()).collect(),
            rules_file: None,
        }
    }
}

/// Rules for one escalation level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LevelConfig {
    pub enabled: bool,
    #[serde(flatten)]
    pub source: RuleSource,
}

impl Default for LevelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            source: RuleSource::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    pub enabled: bool,
    pub thresholds: Thresholds,
    pub nominal: LevelConfig,
    pub reinforced: LevelConfig,
    pub heavy: LevelConfig,
    /// Overlay reported once the critical threshold is reached.
    pub critical_warning: String,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            thresholds: Thresholds::default(),
            nominal: LevelConfig::default(),
            reinforced: LevelConfig::default(),
            heavy: LevelConfig::default(),
            critical_warning: "Context is nearly exhausted. Wrap up the current task or start a fresh session.".into(),
        }
    }
}

/// How eagerly old tool output is compacted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrimMode {
    Conservative,
    #[default]
    Balanced,
    Aggressive,
}

impl TrimMode {
    /// Records scoring strictly below this value are compacted.
    pub fn threshold(self) -> u32 {
        match self {
            TrimMode::Conservative => 20,
            TrimMode::Balanced => 40,
            TrimMode::Aggressive => 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrimConfig {
    pub enabled: bool,
    pub mode: TrimMode,
    /// Trailing transcript records that are never touched.
    pub preserve_last_n: usize,
}

impl Default for TrimConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: TrimMode::Balanced,
            preserve_last_n: 6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Directory holding `sessions/` and `rollup.json`. Relative paths
    /// resolve against the config file's directory.
    pub state_dir: PathBuf,
    /// Sessions untouched for longer than this are swept.
    pub max_age_hours: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("state"),
            max_age_hours: 24,
        }
    }
}

impl Config {
    /// Fix what can be fixed and describe every defect found.
    pub fn validate(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();

        let (thresholds, warning) = self.escalation.thresholds.validated();
        self.escalation.thresholds = thresholds;
        warnings.extend(warning);

        let mut seen = HashSet::new();
        self.groups.retain(|group| {
            if group.id.trim().is_empty() {
                warnings.push("rule group with an empty id ignored".to_string());
                return false;
            }
            if !seen.insert(group.id.clone()) {
                warnings.push(format!("duplicate rule group '{}' ignored", group.id));
                return false;
            }
            true
        });

        let mut commands = BTreeMap::new();
        for (name, source) in std::mem::take(&mut self.commands) {
            let lowered = name.to_lowercase();
            if commands.contains_key(&lowered) {
                warnings.push(format!(
                    "command '*{name}' duplicates '*{lowered}' (names are case-insensitive) and was ignored"
                ));
                continue;
            }
            commands.insert(lowered, source);
        }
        self.commands = commands;

        warnings
    }

    /// Look up a group by id.
    pub fn group(&self, id: &str) -> Option<&RuleGroup> {
        self.groups.iter().find(|g| g.id == id)
    }
}

/// A parsed configuration together with where it came from and what was
/// wrong with it.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: Config,
    /// Directory that relative paths in the config resolve against.
    pub base_dir: PathBuf,
    pub warnings: Vec<String>,
}

impl LoadedConfig {
    /// Resolve a config-relative path.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        resolve_path(&self.base_dir, path)
    }

    /// Absolute state directory.
    pub fn state_dir(&self) -> PathBuf {
        self.resolve(&self.config.session.state_dir)
    }
}

pub(crate) fn resolve_path(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

/// Load a configuration file.
///
/// Returns [`Error::ConfigNotFound`] if the file does not exist. Malformed
/// JSON degrades to [`Config::default`] with a warning.
pub fn load(path: &Path) -> Result<LoadedConfig> {
    if !path.exists() {
        return Err(Error::ConfigNotFound(path.to_path_buf()));
    }
    let json = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    let base_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    Ok(parse(&json, base_dir))
}

/// Parse configuration text. Never fails.
pub fn parse(json: &str, base_dir: impl Into<PathBuf>) -> LoadedConfig {
    let mut warnings = Vec::new();
    let mut config = match serde_json::from_str::<Config>(json) {
        Ok(config) => config,
        Err(e) => {
            warnings.push(format!("malformed configuration ({e}); using defaults"));
            Config::default()
        }
    };
    warnings.extend(config.validate());

    for warning in &warnings {
        warn!("config: {warning}");
    }

    LoadedConfig {
        config,
        base_dir: base_dir.into(),
        warnings,
    }
}
