//! Per-turn rule group activation.
//!
//! For one user prompt, [`KeywordMatcher::match_prompt`] decides which rule
//! groups are always on, which are activated (and by what), and which are
//! suppressed. It also collects `*command` tokens. Matching is plain text:
//!
//! - keywords match case-insensitively on word boundaries, so `test` does
//!   not fire on `latest`;
//! - path globs match against the host's active file paths plus any
//!   file-like tokens found in the prompt;
//! - a global suppression keyword empties the activation for the turn but
//!   never hides command tokens.
//!
//! Per group the checks run in a fixed order and the first decisive one
//! wins: always-on, then suppression, then paths, then keywords.

use crate::config::RuleGroup;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::OnceLock;
use tracing::{debug, trace};

/// Which groups fire for one turn, and why.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActivationResult {
    pub always_on: BTreeSet<String>,
    /// Group id → every activation keyword that matched.
    pub activated: BTreeMap<String, Vec<String>>,
    /// Group id → every suppression keyword that matched.
    pub suppressed: BTreeMap<String, Vec<String>>,
    /// Global suppression keywords that matched.
    pub global_suppressed: BTreeSet<String>,
    /// Lower-case command identifiers in first-seen order, deduplicated.
    pub star_commands: Vec<String>,
    /// Group id → the path that activated it (path activations only).
    pub path_hits: BTreeMap<String, String>,
}

impl ActivationResult {
    /// Whether a group will contribute rules this turn.
    pub fn is_active(&self, id: &str) -> bool {
        self.always_on.contains(id) || self.activated.contains_key(id)
    }
}

/// Keyword/path matcher with a compiled-glob cache.
///
/// Glob patterns are static for a process, so each one is translated to a
/// regex once and reused across turns.
#[derive(Debug, Default)]
pub struct KeywordMatcher {
    globs: GlobCache,
}

impl KeywordMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve activation for one prompt. Never fails.
    pub fn match_prompt(
        &mut self,
        prompt: &str,
        active_paths: &[String],
        groups: &[RuleGroup],
        global_exclude: &[String],
    ) -> ActivationResult {
        let lowered = prompt.to_lowercase();
        let mut result = ActivationResult {
            star_commands: star_commands(&lowered),
            ..ActivationResult::default()
        };

        result.always_on = groups
            .iter()
            .filter(|g| g.enabled && g.always_on)
            .map(|g| g.id.clone())
            .collect();

        result.global_suppressed = global_exclude
            .iter()
            .filter(|kw| keyword_matches(&lowered, kw))
            .cloned()
            .collect();
        if !result.global_suppressed.is_empty() {
            debug!(keywords = ?result.global_suppressed, "global suppression matched");
            return result;
        }

        let mut candidates: Vec<&str> = active_paths.iter().map(String::as_str).collect();
        let prompt_paths = file_tokens(prompt);
        candidates.extend(prompt_paths.iter().map(String::as_str));

        for group in groups.iter().filter(|g| g.enabled) {
            if group.always_on {
                continue;
            }

            let excluded = matching_keywords(&lowered, &group.exclude);
            if !excluded.is_empty() {
                trace!(group = %group.id, keywords = ?excluded, "group suppressed");
                result.suppressed.insert(group.id.clone(), excluded);
                continue;
            }

            if let Some(path) = self.first_path_hit(&group.paths, &candidates) {
                trace!(group = %group.id, path, "group activated by path");
                result.path_hits.insert(group.id.clone(), path.to_string());
                result.activated.insert(group.id.clone(), Vec::new());
                continue;
            }

            let recalled = matching_keywords(&lowered, &group.recall);
            if !recalled.is_empty() {
                trace!(group = %group.id, keywords = ?recalled, "group activated");
                result.activated.insert(group.id.clone(), recalled);
            }
        }

        debug!(
            always_on = result.always_on.len(),
            activated = result.activated.len(),
            suppressed = result.suppressed.len(),
            commands = result.star_commands.len(),
            "activation resolved"
        );
        result
    }

    fn first_path_hit<'a>(&mut self, patterns: &[String], candidates: &[&'a str]) -> Option<&'a str> {
        for pattern in patterns {
            for path in candidates {
                if self.globs.matches(pattern, path) {
                    return Some(*path);
                }
            }
        }
        None
    }
}

/// Every keyword from `keywords` that occurs in `lowered` on word boundaries.
fn matching_keywords(lowered: &str, keywords: &[String]) -> Vec<String> {
    keywords
        .iter()
        .filter(|kw| keyword_matches(lowered, kw))
        .cloned()
        .collect()
}

/// Boundary-aware substring match, equivalent to `(^|\W)keyword($|\W)`
/// against already lower-cased text.
pub fn keyword_matches(lowered: &str, keyword: &str) -> bool {
    let keyword = keyword.trim().to_lowercase();
    if keyword.is_empty() {
        return false;
    }
    lowered.match_indices(&keyword).any(|(start, _)| {
        let end = start + keyword.len();
        let before = lowered.get(..start).and_then(|s| s.chars().next_back());
        let after = lowered.get(end..).and_then(|s| s.chars().next());
        before.is_none_or(|c| !is_word_char(c)) && after.is_none_or(|c| !is_word_char(c))
    })
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Command identifiers introduced by a leading asterisk (`*brief`).
pub fn star_commands(lowered: &str) -> Vec<String> {
    static STAR_RE: OnceLock<Regex> = OnceLock::new();
    let re = STAR_RE.get_or_init(|| {
        Regex::new(r"(?:^|[^\w*])\*([a-z][a-z0-9_-]*)").expect("star command pattern is valid")
    });

    let mut seen = BTreeSet::new();
    re.captures_iter(lowered)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

/// File-like tokens in free text: anything containing `/` or ending in a
/// short extension.
pub fn file_tokens(text: &str) -> Vec<String> {
    const TRIM: &[char] = &[
        '"', '\'', '`', '(', ')', '[', ']', '{', '}', '<', '>', ',', ';', ':', '!', '?',
    ];

    text.split_whitespace()
        .map(|token| token.trim_matches(TRIM).trim_end_matches('.'))
        .filter(|token| !token.is_empty() && !token.starts_with('*'))
        .filter(|token| token.contains('/') || has_short_extension(token))
        .map(String::from)
        .collect()
}

fn has_short_extension(token: &str) -> bool {
    match token.rsplit_once('.') {
        Some((stem, ext)) => {
            !stem.is_empty()
                && (1..=5).contains(&ext.len())
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
                && ext.chars().any(|c| c.is_ascii_alphabetic())
        }
        None => false,
    }
}

/// Translate a glob into an anchored regex source.
///
/// `**` crosses path separators (`**/` also matches zero directories),
/// `*` stays within one segment, `?` matches one non-separator character.
/// Everything else is literal.
pub fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    chars.next();
                    out.push_str("(?:.*/)?");
                } else {
                    out.push_str(".*");
                }
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    out
}

/// Compiled glob patterns, keyed by source text.
#[derive(Debug, Default)]
pub struct GlobCache {
    compiled: HashMap<String, Option<Regex>>,
}

impl GlobCache {
    /// Whether `path` matches `pattern`. Patterns that fail to compile
    /// never match.
    pub fn matches(&mut self, pattern: &str, path: &str) -> bool {
        let compiled = self
            .compiled
            .entry(pattern.to_string())
            .or_insert_with(|| Regex::new(&glob_to_regex(pattern)).ok());
        compiled.as_ref().is_some_and(|re| re.is_match(path))
    }

    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(prompt: &str, groups: &[RuleGroup], global: &[&str]) -> ActivationResult {
        let global: Vec<String> = global.iter().map(|s| s.to_string()).collect();
        KeywordMatcher::new().match_prompt(prompt, &[], groups, &global)
    }

    #[test]
    fn docs_setup_with_star_commands() {
        let groups = vec![RuleGroup::new("docs").with_recall(&["setup"])];
        let result = run("please *brief explain the *carly setup", &groups, &[]);

        assert_eq!(
            result.activated,
            BTreeMap::from([("docs".to_string(), vec!["setup".to_string()])])
        );
        assert_eq!(result.star_commands, vec!["brief", "carly"]);
    }

    #[test]
    fn keyword_requires_word_boundaries() {
        assert!(keyword_matches("run the test suite", "test"));
        assert!(keyword_matches("test", "test"));
        assert!(keyword_matches("(test)", "test"));
        assert!(!keyword_matches("the latest build", "test"));
        assert!(!keyword_matches("testing now", "test"));
        assert!(!keyword_matches("my_test", "test"));
        assert!(keyword_matches("deploy to prod now", "Deploy To Prod"));
    }

    #[test]
    fn later_occurrence_can_match_after_partial_one() {
        assert!(keyword_matches("latest test", "test"));
    }

    #[test]
    fn all_matching_keywords_are_recorded() {
        let groups = vec![RuleGroup::new("rust").with_recall(&["cargo", "crate", "borrow"])];
        let result = run("cargo says the borrow checker failed", &groups, &[]);
        assert_eq!(result.activated["rust"], vec!["cargo", "borrow"]);
    }

    #[test]
    fn global_suppression_empties_activation_but_keeps_commands() {
        let groups = vec![
            RuleGroup::new("docs").with_recall(&["setup"]),
            RuleGroup::new("trap").with_exclude(&["setup"]),
        ];
        let result = run("*brief setup, quiet mode please", &groups, &["quiet mode"]);

        assert!(result.activated.is_empty());
        assert!(result.suppressed.is_empty());
        assert_eq!(
            result.global_suppressed,
            BTreeSet::from(["quiet mode".to_string()])
        );
        assert_eq!(result.star_commands, vec!["brief"]);
    }

    #[test]
    fn global_suppression_keeps_always_on_groups() {
        let groups = vec![
            RuleGroup::new("core").always_on(),
            RuleGroup::new("docs").with_recall(&["setup"]),
        ];
        let result = run("setup, quiet mode please", &groups, &["quiet mode"]);

        assert!(result.activated.is_empty());
        assert_eq!(result.always_on, BTreeSet::from(["core".to_string()]));
        assert!(result.is_active("core"));
        assert!(!result.is_active("docs"));
    }

    #[test]
    fn global_suppression_ignores_partial_words() {
        let groups = vec![RuleGroup::new("docs").with_recall(&["setup"])];
        let result = run("setup the quietness", &groups, &["quiet"]);
        assert!(result.global_suppressed.is_empty());
        assert!(result.activated.contains_key("docs"));
    }

    #[test]
    fn always_on_never_consults_keywords() {
        let groups = vec![
            RuleGroup::new("core")
                .always_on()
                .with_exclude(&["trap"])
                .with_recall(&["nothing"]),
        ];
        let result = run("this prompt contains the trap keyword", &groups, &[]);

        assert!(result.always_on.contains("core"));
        assert!(!result.suppressed.contains_key("core"));
        assert!(!result.activated.contains_key("core"));
        assert!(result.is_active("core"));
    }

    #[test]
    fn suppression_beats_activation() {
        let groups = vec![
            RuleGroup::new("docs")
                .with_recall(&["setup"])
                .with_exclude(&["skip docs", "setup"]),
        ];
        let result = run("setup but skip docs", &groups, &[]);

        assert!(!result.activated.contains_key("docs"));
        assert_eq!(result.suppressed["docs"], vec!["skip docs", "setup"]);
    }

    #[test]
    fn disabled_groups_are_ignored() {
        let mut group = RuleGroup::new("docs").with_recall(&["setup"]).always_on();
        group.enabled = false;
        let result = run("setup", &[group], &[]);
        assert!(result.always_on.is_empty());
        assert!(result.activated.is_empty());
    }

    #[test]
    fn path_hit_from_active_files_skips_keywords() {
        let groups = vec![
            RuleGroup::new("rust")
                .with_paths(&["**/*.rs"])
                .with_recall(&["cargo"]),
        ];
        let paths = vec!["crates/core/src/lib.rs".to_string()];
        let result = KeywordMatcher::new().match_prompt("cargo build fails", &paths, &groups, &[]);

        assert_eq!(result.activated["rust"], Vec::<String>::new());
        assert_eq!(result.path_hits["rust"], "crates/core/src/lib.rs");
    }

    #[test]
    fn path_hit_from_prompt_tokens() {
        let groups = vec![RuleGroup::new("py").with_paths(&["*.py"])];
        let result = run("why does `main.py` crash?", &groups, &[]);
        assert!(result.activated.contains_key("py"));
    }

    #[test]
    fn file_tokens_extraction() {
        let tokens = file_tokens("open src/lib.rs and README.md, not version 1.2 or e.g. *brief.");
        assert!(tokens.contains(&"src/lib.rs".to_string()));
        assert!(tokens.contains(&"README.md".to_string()));
        assert!(!tokens.iter().any(|t| t == "1.2"));
        assert!(!tokens.iter().any(|t| t.starts_with('*')));
    }

    #[test]
    fn star_commands_deduplicate_and_lowercase() {
        assert_eq!(star_commands("*brief *brief *deep"), vec!["brief", "deep"]);
        assert!(star_commands("2*3 is math").is_empty());
        assert!(star_commands("**bold**").is_empty());
    }

    #[test]
    fn glob_semantics() {
        let mut cache = GlobCache::default();
        assert!(cache.matches("**/*.rs", "src/main.rs"));
        assert!(cache.matches("**/*.rs", "main.rs"));
        assert!(cache.matches("**/*.rs", "crates/foo/src/lib.rs"));
        assert!(!cache.matches("**/*.rs", "src/main.py"));
        assert!(cache.matches("src/*.rs", "src/main.rs"));
        assert!(!cache.matches("src/*.rs", "src/deep/main.rs"));
        assert!(cache.matches("docs/**", "docs/a/b/c.md"));
        assert!(cache.matches("file?.txt", "file1.txt"));
        assert!(!cache.matches("file?.txt", "file12.txt"));
        assert!(cache.matches("a+b(c).md", "a+b(c).md"));
        assert!(!cache.matches("README.md", "docs/README.md"));
    }

    #[test]
    fn glob_cache_compiles_once() {
        let mut cache = GlobCache::default();
        cache.matches("**/*.rs", "a.rs");
        cache.matches("**/*.rs", "b.rs");
        assert_eq!(cache.len(), 1);
    }
}
