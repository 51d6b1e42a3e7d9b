//! Command-line front end for sieve-rs.
//!
//! Hosts that cannot link the library shell out to `sieve` once per turn.
//! Stdout carries only the requested output (the rendered bundle or JSON);
//! logs go to stderr, filtered by the `SIEVE_LOG` environment variable.
//!
//! # Examples
//!
//! ```sh
//! # Select instructions for a prompt
//! sieve --config .sieve/config.json turn --session s1 --prompt "update the readme"
//!
//! # Compact a transcript file in place
//! sieve --config .sieve/config.json trim --session s1 --transcript transcript.json
//!
//! # Savings over the last week
//! sieve --config .sieve/config.json stats --window 7d
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use sieve_rs::prelude::*;
use sieve_rs::transcript::{read_transcript, write_transcript};
use tracing_subscriber::EnvFilter;

/// Per-turn instruction selection and transcript compaction.
#[derive(Parser)]
#[command(name = "sieve", version)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, default_value = ".sieve/config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Select the instruction bundle for one prompt and print it.
    Turn {
        #[arg(long)]
        session: String,

        /// Working-directory label recorded on new sessions.
        #[arg(long, default_value = "")]
        cwd: String,

        /// File the host currently has open. Repeatable.
        #[arg(long = "path")]
        paths: Vec<String>,

        #[arg(long)]
        prompt: String,

        /// Print the full turn outcome as JSON instead of the bundle.
        #[arg(long)]
        json: bool,
    },

    /// Compact a transcript file in place and print what was reclaimed.
    Trim {
        #[arg(long)]
        session: String,

        #[arg(long)]
        transcript: PathBuf,
    },

    /// Set per-session overrides. Omitted switches keep their value.
    Overrides {
        #[arg(long)]
        session: String,

        #[arg(long)]
        escalation: Option<Switch>,

        #[arg(long)]
        star_commands: Option<Switch>,

        #[arg(long)]
        trim: Option<Switch>,

        /// Group override as `<id>=on|off|inherit`. Repeatable.
        #[arg(long = "group", value_parser = parse_group_switch)]
        groups: Vec<(String, Switch)>,
    },

    /// Delete idle sessions.
    Sweep {
        /// Defaults to the configured `session.max_age_hours`.
        #[arg(long)]
        max_age_hours: Option<u64>,
    },

    /// Print savings totals as JSON.
    Stats {
        /// `all`, `<n>h`, or `<n>d`.
        #[arg(long, default_value = "all")]
        window: RollupWindow,
    },

    /// Print the flat-injection baseline in estimated tokens.
    Baseline,
}

#[derive(Clone, Copy, ValueEnum)]
enum Switch {
    On,
    Off,
    Inherit,
}

impl Switch {
    fn value(self) -> Option<bool> {
        match self {
            Switch::On => Some(true),
            Switch::Off => Some(false),
            Switch::Inherit => None,
        }
    }
}

fn parse_group_switch(s: &str) -> Result<(String, Switch), String> {
    let (id, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected <id>=on|off|inherit, got '{s}'"))?;
    let switch = Switch::from_str(value, true)?;
    Ok((id.trim().to_string(), switch))
}

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_env("SIEVE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let loaded = sieve_rs::config::load(&cli.config)?;
    let mut engine = Engine::new(loaded)?;

    match cli.command {
        Command::Turn {
            session,
            cwd,
            paths,
            prompt,
            json,
        } => {
            let outcome = engine.prepare_turn(&session, &cwd, &prompt, &paths);
            if json {
                print_json(&outcome);
            } else {
                let rendered = outcome.bundle.render();
                if !rendered.is_empty() {
                    println!("{rendered}");
                }
            }
        }
        Command::Trim {
            session,
            transcript,
        } => {
            let mut records = read_transcript(&transcript)?;
            let stats = engine.trim_history(&session, &mut records);
            if stats.compacted > 0 || stats.bundles_stripped > 0 {
                write_transcript(&transcript, &records)?;
            }
            print_json(&stats);
        }
        Command::Overrides {
            session,
            escalation,
            star_commands,
            trim,
            groups,
        } => {
            let mut overrides = engine.overrides(&session);
            if let Some(switch) = escalation {
                overrides.escalation = switch.value();
            }
            if let Some(switch) = star_commands {
                overrides.star_commands = switch.value();
            }
            if let Some(switch) = trim {
                overrides.trim = switch.value();
            }
            for (id, switch) in groups {
                overrides.groups.insert(id, switch.value());
            }
            engine.set_overrides(&session, overrides.clone())?;
            print_json(&overrides);
        }
        Command::Sweep { max_age_hours } => {
            let removed = engine.sweep(max_age_hours)?;
            print_json(&removed);
        }
        Command::Stats { window } => {
            print_json(&engine.rollup(window)?);
        }
        Command::Baseline => {
            println!("{}", engine.baseline());
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("Error: failed to serialize output: {e}"),
    }
}
