//! Instruction documents and the resolved rule library.
//!
//! Rule documents are plain Markdown. Only bullet lines count:
//!
//! ```markdown
//! # Docs rules          <- heading, ignored
//!
//! - Keep READMEs short. <- rule "Keep READMEs short."
//! Some prose.           <- ignored
//! ```
//!
//! [`RuleLibrary`] resolves every group, command, and escalation level of a
//! [`Config`] into its instruction lines once per process. A document that
//! cannot be read yields zero lines and a warning, never an error.

use crate::config::{Config, LevelConfig, LoadedConfig, RuleSource, resolve_path};
use crate::escalation::{LevelDefinitions, LevelRules};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, warn};

/// Extract bullet lines from document text.
pub fn parse_instruction_lines(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.strip_prefix('-'))
        .map(str::trim)
        .filter(|rule| !rule.is_empty())
        .map(String::from)
        .collect()
}

/// Read bullet lines from a document. Unreadable documents yield nothing.
pub fn read_instruction_lines(path: &Path) -> Vec<String> {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_instruction_lines(&content),
        Err(e) => {
            debug!("could not read rule document {}: {e}", path.display());
            Vec::new()
        }
    }
}

/// Instruction lines for every configured source, resolved once.
#[derive(Debug, Clone, Default)]
pub struct RuleLibrary {
    groups: HashMap<String, Vec<String>>,
    commands: BTreeMap<String, Vec<String>>,
    nominal: Vec<String>,
    reinforced: Vec<String>,
    heavy: Vec<String>,
    warnings: Vec<String>,
}

impl RuleLibrary {
    /// Resolve every rule source in a loaded configuration.
    pub fn load(loaded: &LoadedConfig) -> Self {
        Self::resolve(&loaded.config, &loaded.base_dir)
    }

    /// Resolve every rule source, reading documents relative to `base_dir`.
    pub fn resolve(config: &Config, base_dir: &Path) -> Self {
        let mut library = Self::default();

        for group in &config.groups {
            let lines = library.read_source(&format!("group '{}'", group.id), &group.source, base_dir);
            library.groups.insert(group.id.clone(), lines);
        }
        for (name, source) in &config.commands {
            let lines = library.read_source(&format!("command '*{name}'"), source, base_dir);
            library.commands.insert(name.clone(), lines);
        }

        let esc = &config.escalation;
        library.nominal = library.read_level("nominal", &esc.nominal, base_dir);
        library.reinforced = library.read_level("reinforced", &esc.reinforced, base_dir);
        library.heavy = library.read_level("heavy", &esc.heavy, base_dir);

        library
    }

    fn read_level(&mut self, name: &str, level: &LevelConfig, base_dir: &Path) -> Vec<String> {
        self.read_source(&format!("escalation level '{name}'"), &level.source, base_dir)
    }

    fn read_source(&mut self, owner: &str, source: &RuleSource, base_dir: &Path) -> Vec<String> {
        let mut lines = source.rules.clone();
        if let Some(ref file) = source.rules_file {
            let path = resolve_path(base_dir, file);
            if path.is_file() {
                lines.extend(read_instruction_lines(&path));
            } else {
                let warning = format!("{owner}: rule document {} not found", path.display());
                warn!("{warning}");
                self.warnings.push(warning);
            }
        }
        lines
    }

    /// Lines for a group. Unknown groups have none.
    pub fn group(&self, id: &str) -> &[String] {
        self.groups.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Lines for a defined command, `None` if the command is undefined.
    pub fn command(&self, name: &str) -> Option<&[String]> {
        self.commands.get(name).map(Vec::as_slice)
    }

    /// Every defined command with its lines.
    pub fn commands(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.commands
            .iter()
            .map(|(name, lines)| (name.as_str(), lines.as_slice()))
    }

    /// Escalation level definitions, with enablement taken from `config`.
    pub fn levels(&self, config: &Config) -> LevelDefinitions {
        let esc = &config.escalation;
        LevelDefinitions {
            nominal: LevelRules::new(esc.nominal.enabled, self.nominal.clone()),
            reinforced: LevelRules::new(esc.reinforced.enabled, self.reinforced.clone()),
            heavy: LevelRules::new(esc.heavy.enabled, self.heavy.clone()),
            critical_warning: esc.critical_warning.clone(),
        }
    }

    /// Non-fatal problems found while reading documents.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}
