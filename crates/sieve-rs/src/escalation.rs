//! Prompt-count driven escalation levels.
//!
//! As a conversation ages, earlier guidance drifts out of the model's
//! attention. The escalation tracker maps a session's prompt counter onto
//! four ordered levels, each carrying its own reinforcement instructions:
//!
//! | Prompt count | Level |
//! |---|---|
//! | `< moderate` | [`EscalationLevel::Nominal`] |
//! | `moderate ..< heavy` | [`EscalationLevel::Reinforced`] |
//! | `heavy ..< critical` | [`EscalationLevel::Heavy`] |
//! | `>= critical` | [`EscalationLevel::Critical`] |
//!
//! Critical has no instruction set of its own. It reuses the heavy lines
//! verbatim and adds a warning overlay.

use serde::{Deserialize, Serialize};

/// Ordered urgency levels. `Ord` follows declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationLevel {
    Nominal,
    Reinforced,
    Heavy,
    Critical,
}

impl std::fmt::Display for EscalationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EscalationLevel::Nominal => write!(f, "nominal"),
            EscalationLevel::Reinforced => write!(f, "reinforced"),
            EscalationLevel::Heavy => write!(f, "heavy"),
            EscalationLevel::Critical => write!(f, "critical"),
        }
    }
}

/// Prompt counts at which each level begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub moderate: u64,
    pub heavy: u64,
    pub critical: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            moderate: 15,
            heavy: 35,
            critical: 50,
        }
    }
}

impl Thresholds {
    /// Whether `moderate < heavy < critical` holds.
    pub fn is_ordered(&self) -> bool {
        self.moderate < self.heavy && self.heavy < self.critical
    }

    /// Return these thresholds if ordered, otherwise the defaults together
    /// with a warning describing the defect.
    pub fn validated(self) -> (Self, Option<String>) {
        if self.is_ordered() {
            (self, None)
        } else {
            let warning = format!(
                "escalation thresholds must ascend (got moderate={}, heavy={}, critical={}); using defaults",
                self.moderate, self.heavy, self.critical
            );
            (Self::default(), Some(warning))
        }
    }

    /// The level for a prompt count, and the threshold that level starts at.
    pub fn level_for(&self, prompt_count: u64) -> (EscalationLevel, u64) {
        if prompt_count >= self.critical {
            (EscalationLevel::Critical, self.critical)
        } else if prompt_count >= self.heavy {
            (EscalationLevel::Heavy, self.heavy)
        } else if prompt_count >= self.moderate {
            (EscalationLevel::Reinforced, self.moderate)
        } else {
            (EscalationLevel::Nominal, 0)
        }
    }
}

/// Instruction lines for one level, plus its enablement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LevelRules {
    pub enabled: bool,
    pub lines: Vec<String>,
}

impl LevelRules {
    pub fn new(enabled: bool, lines: Vec<String>) -> Self {
        Self { enabled, lines }
    }

    /// Lines to inject: empty when the level is disabled.
    fn effective_lines(&self) -> &[String] {
        if self.enabled { self.lines.as_slice() } else { &[] }
    }
}

/// Resolved instruction sets for the three levels that own rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LevelDefinitions {
    pub nominal: LevelRules,
    pub reinforced: LevelRules,
    pub heavy: LevelRules,
    /// Warning overlay reported at the critical level.
    pub critical_warning: String,
}

impl LevelDefinitions {
    /// Instruction lines for a level, honouring enablement. Critical reads
    /// the heavy set.
    pub fn lines_for(&self, level: EscalationLevel) -> &[String] {
        match level {
            EscalationLevel::Nominal => self.nominal.effective_lines(),
            EscalationLevel::Reinforced => self.reinforced.effective_lines(),
            EscalationLevel::Heavy | EscalationLevel::Critical => self.heavy.effective_lines(),
        }
    }

    /// The largest instruction set any level can inject.
    pub fn longest(&self) -> &[String] {
        [
            self.nominal.effective_lines(),
            self.reinforced.effective_lines(),
            self.heavy.effective_lines(),
        ]
        .into_iter()
        .max_by_key(|lines| lines.iter().map(|l| l.chars().count()).sum::<usize>())
        .unwrap_or(&[])
    }
}

/// Outcome of [`resolve`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EscalationResult {
    pub level: EscalationLevel,
    pub instructions: Vec<String>,
    /// Threshold the current level began at (0 for nominal).
    pub threshold: u64,
    /// Present only at the critical level.
    pub warning: Option<String>,
}

/// Map a prompt counter to its escalation level and instruction lines.
///
/// Total and pure. Unordered thresholds are not corrected here; callers
/// pass [`Thresholds::validated`] output.
pub fn resolve(
    prompt_count: u64,
    thresholds: &Thresholds,
    levels: &LevelDefinitions,
) -> EscalationResult {
    let (level, threshold) = thresholds.level_for(prompt_count);
    let warning = (level == EscalationLevel::Critical && !levels.critical_warning.is_empty())
        .then(|| levels.critical_warning.clone());

    EscalationResult {
        level,
        instructions: levels.lines_for(level).to_vec(),
        threshold,
        warning,
    }
}
