//! Integration tests for a multi-turn session driven through the engine.
//!
//! Each test writes a real config file and rule documents into a temp
//! directory, loads them the way the CLI does, and runs turns end to end.

use std::fs;
use std::path::Path;

use serde_json::json;
use sieve_rs::aggregate::{BUNDLE_END, BUNDLE_START, SectionSource};
use sieve_rs::prelude::*;

/// Helper: write a config with document-backed groups and escalation levels.
fn write_project(dir: &Path) -> std::path::PathBuf {
    fs::create_dir_all(dir.join("rules")).unwrap();
    fs::write(
        dir.join("rules/docs.md"),
        "# Documentation\n\n- Keep READMEs short.\n- Link instead of copying.\n",
    )
    .unwrap();
    fs::write(dir.join("rules/heavy.md"), "- Summarise progress.\n- Avoid re-reading files.\n").unwrap();

    let config = json!({
        "groups": [
            { "id": "core", "always_on": true, "exclude": ["core"], "rules": ["Be precise."] },
            { "id": "docs", "recall": ["setup", "readme"], "rules_file": "rules/docs.md" },
            { "id": "rust", "recall": ["cargo"], "exclude": ["no rust"], "paths": ["**/*.rs"],
              "rules": ["Run clippy before committing."] },
            { "id": "ghost", "recall": ["ghost"], "rules_file": "rules/missing.md" }
        ],
        "commands": {
            "brief": { "rules": ["Answer in three sentences or fewer."] }
        },
        "global_exclude": ["just chatting"],
        "escalation": {
            "thresholds": { "moderate": 15, "heavy": 35, "critical": 50 },
            "nominal": { "rules": ["Stay on task."] },
            "reinforced": { "rules": ["Re-read the original request."] },
            "heavy": { "rules_file": "rules/heavy.md" }
        },
        "trim": { "mode": "balanced", "preserve_last_n": 3 },
        "session": { "state_dir": "state" }
    });
    let path = dir.join("config.json");
    fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();
    path
}

fn engine(dir: &Path) -> Engine {
    let path = write_project(dir);
    Engine::new(sieve_rs::config::load(&path).unwrap()).unwrap()
}

// ── Selection ────────────────────────────────────────────────────────

#[test]
fn star_commands_and_keyword_activation() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = engine(dir.path());

    let outcome = engine.prepare_turn("s1", "~/p", "please *brief explain the *carly setup", &[]);
    assert_eq!(
        outcome.activation.activated.get("docs"),
        Some(&vec!["setup".to_string()])
    );
    assert_eq!(outcome.activation.star_commands, vec!["brief", "carly"]);

    let lines: Vec<&String> = outcome.bundle.lines().collect();
    assert!(lines.iter().any(|l| *l == "Keep READMEs short."));
    assert!(lines.iter().any(|l| *l == "Answer in three sentences or fewer."));
    assert!(lines.iter().any(|l| *l == "Stay on task."));
}

#[test]
fn always_on_ignores_its_own_keyword_lists() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = engine(dir.path());
    let outcome = engine.prepare_turn("s1", "~", "touch the core module", &[]);
    assert!(outcome.activation.always_on.contains("core"));
    assert!(!outcome.activation.suppressed.contains_key("core"));
}

#[test]
fn global_suppression_empties_activation_but_keeps_always_on() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = engine(dir.path());
    let outcome = engine.prepare_turn("s1", "~", "just chatting about the readme *brief", &[]);
    assert!(outcome.activation.activated.is_empty());
    assert!(outcome.activation.always_on.contains("core"));
    assert!(outcome.bundle.lines().any(|l| l == "Be precise."));
    assert_eq!(outcome.activation.star_commands, vec!["brief"]);
    assert_eq!(outcome.bundle.exclusions[0].group, None);
}

#[test]
fn paths_activate_and_suppression_wins() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = engine(dir.path());

    let outcome = engine.prepare_turn("s1", "~", "look at this", &["src/lib.rs".into()]);
    assert_eq!(
        outcome.activation.path_hits.get("rust").map(String::as_str),
        Some("src/lib.rs")
    );

    let outcome = engine.prepare_turn("s1", "~", "edit src/main.rs, no rust rules", &[]);
    assert!(!outcome.activation.is_active("rust"));
    assert!(outcome.activation.suppressed.contains_key("rust"));
}

#[test]
fn missing_documents_degrade_to_warnings() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = engine(dir.path());
    assert!(engine.warnings().any(|w| w.contains("missing.md")));

    let outcome = engine.prepare_turn("s1", "~", "ghost", &[]);
    assert!(outcome.activation.is_active("ghost"));
    assert!(
        outcome
            .bundle
            .sections
            .iter()
            .any(|s| s.source == SectionSource::Activated("ghost".into()) && s.lines.is_empty())
    );
}

// ── Escalation ───────────────────────────────────────────────────────

#[test]
fn escalation_climbs_and_critical_reuses_heavy() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = engine(dir.path());

    let mut levels = Vec::new();
    let mut heavy_lines = None;
    let mut critical_lines = None;
    for turn in 1..=51u64 {
        let outcome = engine.prepare_turn("s1", "~", "keep going", &[]);
        assert_eq!(outcome.prompt_count, turn);
        let level = outcome.bundle.escalation;
        levels.push(level);

        let escalation_lines: Vec<String> = outcome
            .bundle
            .sections
            .iter()
            .filter(|s| matches!(s.source, SectionSource::Escalation(_)))
            .flat_map(|s| s.lines.clone())
            .collect();
        match turn {
            40 => heavy_lines = Some(escalation_lines),
            51 => {
                critical_lines = Some(escalation_lines);
                assert!(outcome.bundle.warning.is_some());
            }
            _ => {}
        }
    }

    assert!(levels.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(levels[39], EscalationLevel::Heavy);
    assert_eq!(levels[50], EscalationLevel::Critical);
    assert_eq!(heavy_lines, critical_lines);
    assert_eq!(
        heavy_lines.unwrap(),
        vec!["Summarise progress.", "Avoid re-reading files."]
    );
}

// ── Baseline ─────────────────────────────────────────────────────────

#[test]
fn bundles_never_exceed_the_baseline() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = engine(dir.path());
    let baseline = engine.baseline();

    let prompts = [
        "setup the readme with cargo *brief",
        "ghost",
        "nothing at all",
        "just chatting",
        "*brief *brief *brief",
    ];
    for i in 0..60 {
        let prompt = prompts[i % prompts.len()];
        let outcome = engine.prepare_turn("s1", "~", prompt, &["a/b.rs".into()]);
        assert!(outcome.injected <= baseline, "{prompt} on turn {i}");
        assert_eq!(outcome.baseline, baseline);
    }
}

// ── Compaction across turns ──────────────────────────────────────────

#[test]
fn transcript_is_compacted_between_turns() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = engine(dir.path());

    let mut transcript: Vec<TranscriptRecord> = Vec::new();
    for i in 0..12 {
        let outcome = engine.prepare_turn("s1", "~", &format!("step {i} of the setup"), &[]);
        let record = match i {
            2 | 9 => TranscriptRecord::tool(ToolInvocation::completed(
                "read",
                json!({"file_path": "a.py"}),
                format!("# revision {i}\n{}", "print('x')\n".repeat(60)),
            )),
            _ => TranscriptRecord::user(format!("{}\nstep {i}", outcome.bundle.render())),
        };
        transcript.push(record);
    }

    let stats = engine.trim_history("s1", &mut transcript);

    let first = transcript[2].parts[0].as_tool().unwrap();
    assert!(first.is_compacted());
    assert!(first.output.as_deref().unwrap().starts_with("[compacted] read of a.py"));
    let second = transcript[9].parts[0].as_tool().unwrap();
    assert!(!second.is_compacted());
    assert_eq!(stats.compacted, 1);

    assert_eq!(stats.bundles_stripped, 10);
    for record in &transcript {
        if let Part::Text(text) = &record.parts[0] {
            assert!(!text.text.contains(BUNDLE_START));
            assert!(!text.text.contains(BUNDLE_END));
        }
    }

    let again = engine.trim_history("s1", &mut transcript);
    assert_eq!(again.compacted, 0);
    assert_eq!(again.bundles_stripped, 0);
    assert_eq!(again.total_reclaimed(), 0);

    let totals = engine.rollup(RollupWindow::All).unwrap();
    assert_eq!(totals.turns, 12);
    assert_eq!(totals.tool_output_reclaimed, stats.tool_tokens_reclaimed);
    assert_eq!(totals.stale_bundle_reclaimed, stats.bundle_tokens_reclaimed);
}

// ── Persistence ──────────────────────────────────────────────────────

#[test]
fn sessions_survive_restarts_and_corruption() {
    let dir = tempfile::tempdir().unwrap();
    engine(dir.path()).prepare_turn("s1", "~/p", "first", &[]);
    engine(dir.path()).prepare_turn("s1", "~/p", "second", &[]);

    let sessions = engine(dir.path()).sessions().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].prompt_count, 2);
    assert_eq!(sessions[0].title.as_deref(), Some("first"));

    fs::write(dir.path().join("state/sessions/s1.json"), "garbage").unwrap();
    let outcome = engine(dir.path()).prepare_turn("s1", "~/p", "third", &[]);
    assert!(outcome.is_new);
    assert_eq!(outcome.prompt_count, 1);
}

#[test]
fn missing_config_is_the_only_hard_failure() {
    let dir = tempfile::tempdir().unwrap();
    let result = sieve_rs::config::load(&dir.path().join("absent.json"));
    assert!(matches!(result, Err(Error::ConfigNotFound(_))));

    let path = dir.path().join("broken.json");
    fs::write(&path, "{ definitely not json").unwrap();
    let loaded = sieve_rs::config::load(&path).unwrap();
    assert!(!loaded.warnings.is_empty());
    assert_eq!(loaded.config, Config::default());
}
