//! Assemble the per-turn instruction bundle and its flat-injection baseline.
//!
//! The bundle collects, in order: always-on groups, activated groups,
//! defined `*commands`, and the current escalation level's lines. Undefined
//! commands are ignored. The baseline is what injecting every enabled group,
//! every enabled command, and the largest escalation set would cost on every
//! turn; the gap between the two is the selection saving.
//!
//! Both functions take the *effective* configuration, i.e. after
//! [`apply_overrides`](crate::session::apply_overrides).

use crate::config::Config;
use crate::escalation::{EscalationLevel, EscalationResult};
use crate::matcher::ActivationResult;
use crate::rules::RuleLibrary;
use crate::{estimate_lines_tokens, tokens_for_chars};
use serde::Serialize;

/// Opening marker of a rendered bundle.
pub const BUNDLE_START: &str = "<sieve-rules>";
/// Closing marker of a rendered bundle.
pub const BUNDLE_END: &str = "</sieve-rules>";

/// Why a section is in the bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum SectionSource {
    AlwaysOn(String),
    Activated(String),
    Command(String),
    Escalation(EscalationLevel),
}

impl std::fmt::Display for SectionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SectionSource::AlwaysOn(id) | SectionSource::Activated(id) => write!(f, "{id}"),
            SectionSource::Command(name) => write!(f, "*{name}"),
            SectionSource::Escalation(level) => write!(f, "escalation: {level}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BundleSection {
    pub source: SectionSource,
    pub lines: Vec<String>,
}

/// An enabled group that did not fire, with the keywords that would.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InactiveGroup {
    pub id: String,
    pub recall: Vec<String>,
}

/// A suppression that applied this turn. `group` is `None` for global
/// suppression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Exclusion {
    pub group: Option<String>,
    pub keywords: Vec<String>,
}

/// Everything selected for injection this turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleBundle {
    pub sections: Vec<BundleSection>,
    pub inactive: Vec<InactiveGroup>,
    pub exclusions: Vec<Exclusion>,
    pub escalation: EscalationLevel,
    pub warning: Option<String>,
}

impl RuleBundle {
    /// Every injected line, in bundle order.
    pub fn lines(&self) -> impl Iterator<Item = &String> {
        self.sections.iter().flat_map(|s| s.lines.iter())
    }

    /// Estimated token cost of the injected lines.
    pub fn estimated_tokens(&self) -> u64 {
        tokens_for_chars(self.lines().map(|l| l.chars().count() as u64).sum())
    }

    pub fn is_empty(&self) -> bool {
        self.lines().next().is_none() && self.warning.is_none()
    }

    /// Render as an injectable block between [`BUNDLE_START`] and
    /// [`BUNDLE_END`]. Empty bundles render as an empty string.
    pub fn render(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        let mut out = String::from(BUNDLE_START);
        out.push('\n');
        for section in self.sections.iter().filter(|s| !s.lines.is_empty()) {
            out.push_str(&format!("[{}]\n", section.source));
            for line in &section.lines {
                out.push_str(&format!("- {line}\n"));
            }
        }
        if let Some(ref warning) = self.warning {
            out.push_str(&format!("WARNING: {warning}\n"));
        }
        out.push_str(BUNDLE_END);
        out
    }
}

/// Combine activation and escalation into the bundle to inject.
pub fn aggregate(
    activation: &ActivationResult,
    escalation: &EscalationResult,
    config: &Config,
    library: &RuleLibrary,
) -> RuleBundle {
    let mut sections = Vec::new();
    let mut inactive = Vec::new();

    let enabled = config.groups.iter().filter(|g| g.enabled);
    for group in enabled.clone().filter(|g| activation.always_on.contains(&g.id)) {
        sections.push(BundleSection {
            source: SectionSource::AlwaysOn(group.id.clone()),
            lines: library.group(&group.id).to_vec(),
        });
    }
    for group in enabled {
        if activation.activated.contains_key(&group.id) {
            sections.push(BundleSection {
                source: SectionSource::Activated(group.id.clone()),
                lines: library.group(&group.id).to_vec(),
            });
        } else if !activation.always_on.contains(&group.id) {
            inactive.push(InactiveGroup {
                id: group.id.clone(),
                recall: group.recall.clone(),
            });
        }
    }

    if config.star_commands_enabled {
        for name in &activation.star_commands {
            if let Some(lines) = library.command(name) {
                sections.push(BundleSection {
                    source: SectionSource::Command(name.clone()),
                    lines: lines.to_vec(),
                });
            }
        }
    }

    let mut warning = None;
    if config.escalation.enabled {
        if !escalation.instructions.is_empty() {
            sections.push(BundleSection {
                source: SectionSource::Escalation(escalation.level),
                lines: escalation.instructions.clone(),
            });
        }
        warning = escalation.warning.clone();
    }

    let mut exclusions = Vec::new();
    if !activation.global_suppressed.is_empty() {
        exclusions.push(Exclusion {
            group: None,
            keywords: activation.global_suppressed.iter().cloned().collect(),
        });
    }
    exclusions.extend(activation.suppressed.iter().map(|(id, keywords)| Exclusion {
        group: Some(id.clone()),
        keywords: keywords.clone(),
    }));

    RuleBundle {
        sections,
        inactive,
        exclusions,
        escalation: escalation.level,
        warning,
    }
}

/// Token cost of injecting everything on every turn.
pub fn estimate_baseline(config: &Config, library: &RuleLibrary) -> u64 {
    let levels = library.levels(config);
    let mut lines: Vec<&str> = Vec::new();
    for group in config.groups.iter().filter(|g| g.enabled) {
        lines.extend(library.group(&group.id).iter().map(String::as_str));
    }
    if config.star_commands_enabled {
        for (_, command) in library.commands() {
            lines.extend(command.iter().map(String::as_str));
        }
    }
    if config.escalation.enabled {
        lines.extend(levels.longest().iter().map(String::as_str));
    }
    estimate_lines_tokens(&lines)
}
