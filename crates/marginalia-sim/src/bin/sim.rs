#![forbid(unsafe_code)]

use std::env;
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use marginalia_core::{AnnotationConfig, load_config, load_user_config};
use marginalia_sim::campaign::{CampaignConfig, format_violation, replay_seed, run_campaign};
use marginalia_sim::oracle::ConvergenceOracle;
use marginalia_sim::{SimulationConfig, Simulator};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Deterministic convergence simulation for marginalia annotations",
    long_about = None
)]
struct Cli {
    /// Emit JSON output instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    /// Editor config file; defaults to `<config_dir>/marginalia/config.toml`.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one seeded simulation and check it.
    Run {
        #[arg(long, default_value_t = 0)]
        seed: u64,
        #[arg(long, default_value_t = 3)]
        agents: usize,
        #[arg(long, default_value_t = 24)]
        rounds: u64,
    },
    /// Run seeds `0..N` and report failures.
    Campaign {
        #[arg(long, default_value_t = 100)]
        seeds: u64,
        #[arg(long, default_value_t = 3)]
        agents: usize,
        #[arg(long, default_value_t = 24)]
        rounds: u64,
    },
    /// Re-run one seed with the campaign defaults and print its full trace.
    Replay {
        #[arg(long)]
        seed: u64,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("MARGINALIA_LOG")
        .unwrap_or_else(|_| EnvFilter::new("marginalia=info,warn"));

    let format = env::var("MARGINALIA_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn editor_config(path: Option<&Path>) -> Result<AnnotationConfig> {
    let mut config = match path {
        Some(path) => load_config(path)?,
        None => load_user_config()?,
    };
    config.apply_env_overrides();
    Ok(config)
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let editor = editor_config(cli.config.as_deref())?;
    tracing::debug!(?editor, "editor config loaded");

    match cli.command {
        Commands::Run {
            seed,
            agents,
            rounds,
        } => {
            let config = SimulationConfig {
                seed,
                agent_count: agents,
                rounds,
                editor,
                ..SimulationConfig::default()
            };
            let result = Simulator::new(config)?.run()?;
            let oracle = ConvergenceOracle::check_all(&result);
            if cli.json {
                println!(
                    "{}",
                    serde_json::json!({
                        "seed": seed,
                        "trace_events": result.trace.len(),
                        "passed": oracle.passed,
                        "interesting": result.interesting_state_reached,
                        "violations": oracle.violations,
                    })
                );
            } else {
                println!(
                    "simulation complete: seed={seed} trace_events={} passed={} interesting={}",
                    result.trace.len(),
                    oracle.passed,
                    result.interesting_state_reached
                );
                for violation in &oracle.violations {
                    println!("  {}", format_violation(violation));
                }
            }
            if !oracle.passed {
                std::process::exit(1);
            }
        }
        Commands::Campaign {
            seeds,
            agents,
            rounds,
        } => {
            let config = CampaignConfig {
                seed_range: 0..seeds,
                agent_count: agents,
                rounds,
                editor,
                ..CampaignConfig::default()
            };
            let report = run_campaign(&config)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "campaign complete: seeds={} passed={} interesting={}",
                    report.seeds_run, report.seeds_passed, report.interesting_states_reached
                );
                if let Some(seed) = report.first_failure {
                    println!("first failure: seed {seed} (replay with `marginalia-sim replay --seed {seed}`)");
                }
                for failure in &report.failures {
                    for violation in &failure.violations {
                        println!("  seed {}: {violation}", failure.seed);
                    }
                }
            }
            if !report.all_passed() {
                std::process::exit(1);
            }
        }
        Commands::Replay { seed } => {
            let config = CampaignConfig {
                editor,
                ..CampaignConfig::default()
            };
            let trace = replay_seed(seed, &config)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&trace)?);
            } else {
                for event in &trace.result.trace {
                    println!("{:>4} {:?}", event.round, event.kind);
                }
                println!(
                    "replay complete: seed={seed} passed={}",
                    trace.oracle.passed
                );
                for violation in &trace.oracle.violations {
                    println!("  {}", format_violation(violation));
                }
            }
        }
    }

    Ok(())
}
