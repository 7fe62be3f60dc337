//! Campaign runner for deterministic simulation campaigns.
//!
//! Executes many seeds with the same parameters, collecting pass/fail
//! results and the first failing seed for replay.

use std::ops::Range;

use anyhow::{Result, bail};
use marginalia_core::AnnotationConfig;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::network::FaultConfig;
use crate::oracle::{ConvergenceOracle, InvariantViolation, OracleResult};
use crate::{DEFAULT_DOCUMENT, SimulationConfig, SimulationResult, Simulator};

/// Campaign-level configuration: which seeds to run and the simulation
/// parameters shared by every seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignConfig {
    /// Range of seeds to execute, e.g., `0..100`.
    pub seed_range: Range<u64>,
    pub agent_count: usize,
    pub rounds: u64,
    /// Structural edit every `barrier_every` rounds; `0` disables them.
    pub barrier_every: u64,
    pub fault_drop_percent: u8,
    pub fault_duplicate_percent: u8,
    pub fault_reorder_percent: u8,
    pub fault_partition_percent: u8,
    /// Maximum delivery delay in rounds.
    pub fault_max_delay: u8,
    /// Editor settings handed to every simulated agent.
    #[serde(default)]
    pub editor: AnnotationConfig,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            seed_range: 0..100,
            agent_count: 3,
            rounds: 24,
            barrier_every: 4,
            fault_drop_percent: 10,
            fault_duplicate_percent: 5,
            fault_reorder_percent: 10,
            fault_partition_percent: 5,
            fault_max_delay: 3,
            editor: AnnotationConfig::default(),
        }
    }
}

impl CampaignConfig {
    /// Build a [`SimulationConfig`] for a specific seed.
    #[must_use]
    pub fn sim_config_for_seed(&self, seed: u64) -> SimulationConfig {
        SimulationConfig {
            seed,
            agent_count: self.agent_count,
            rounds: self.rounds,
            barrier_every: self.barrier_every,
            document: DEFAULT_DOCUMENT.to_string(),
            fault: FaultConfig {
                max_delay_rounds: self.fault_max_delay,
                drop_rate_percent: self.fault_drop_percent,
                duplicate_rate_percent: self.fault_duplicate_percent,
                reorder_rate_percent: self.fault_reorder_percent,
                partition_rate_percent: self.fault_partition_percent,
            },
            editor: self.editor.clone(),
        }
    }

    /// Validate configuration before running.
    ///
    /// # Errors
    ///
    /// Returns an error if any parameter is out of valid range.
    pub fn validate(&self) -> Result<()> {
        if self.seed_range.is_empty() {
            bail!("seed_range must not be empty");
        }
        if self.agent_count == 0 {
            bail!("agent_count must be > 0");
        }
        if self.rounds == 0 {
            bail!("rounds must be > 0");
        }
        let percents = [
            self.fault_drop_percent,
            self.fault_duplicate_percent,
            self.fault_reorder_percent,
            self.fault_partition_percent,
        ];
        if percents.iter().any(|p| *p > 100) {
            bail!("fault percentages must be within 0..=100");
        }
        Ok(())
    }
}

/// Failure details for a single seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedFailure {
    pub seed: u64,
    /// Human-readable invariant violations.
    pub violations: Vec<String>,
}

/// Aggregate report produced by a campaign run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignReport {
    pub seeds_run: usize,
    pub seeds_passed: usize,
    /// First seed that failed (for prioritized replay).
    pub first_failure: Option<u64>,
    pub failures: Vec<SeedFailure>,
    /// Seeds that hit a fault, an unresolved anchor, or a relocation.
    pub interesting_states_reached: usize,
}

impl CampaignReport {
    /// True if every seed passed.
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Detailed trace produced by replaying a single seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetailedTrace {
    pub result: SimulationResult,
    pub oracle: OracleResult,
}

fn simulate(seed: u64, config: &CampaignConfig) -> Result<DetailedTrace> {
    let mut simulator = Simulator::new(config.sim_config_for_seed(seed))?;
    let result = simulator.run()?;
    let oracle = ConvergenceOracle::check_all(&result);
    Ok(DetailedTrace { result, oracle })
}

/// Run a full campaign across all seeds in the config.
///
/// # Errors
///
/// Returns an error if config validation fails or a simulation encounters
/// an internal error.
pub fn run_campaign(config: &CampaignConfig) -> Result<CampaignReport> {
    config.validate()?;

    let mut seeds_run = 0_usize;
    let mut seeds_passed = 0_usize;
    let mut failures = Vec::new();
    let mut interesting_states_reached = 0_usize;

    for seed in config.seed_range.clone() {
        seeds_run += 1;
        let trace = simulate(seed, config)?;
        if trace.result.interesting_state_reached {
            interesting_states_reached += 1;
        }
        if trace.oracle.passed {
            seeds_passed += 1;
        } else {
            warn!(
                seed,
                violations = trace.oracle.violations.len(),
                "seed failed"
            );
            failures.push(SeedFailure {
                seed,
                violations: trace.oracle.violations.iter().map(format_violation).collect(),
            });
        }
    }

    let first_failure = failures.first().map(|failure| failure.seed);
    info!(seeds_run, seeds_passed, interesting_states_reached, "campaign complete");
    Ok(CampaignReport {
        seeds_run,
        seeds_passed,
        first_failure,
        failures,
        interesting_states_reached,
    })
}

/// Run a single seed and return `Ok(())` on pass, `Err(violations)` on
/// failure.
///
/// # Errors
///
/// The outer error is an internal simulation error (invalid config, editor
/// failure); the inner `Result` distinguishes pass from invariant violations.
pub fn run_single_seed(
    seed: u64,
    config: &CampaignConfig,
) -> Result<std::result::Result<(), Vec<InvariantViolation>>> {
    let trace = simulate(seed, config)?;
    if trace.oracle.passed {
        Ok(Ok(()))
    } else {
        Ok(Err(trace.oracle.violations))
    }
}

/// Replay a single seed with full trace details for debugging.
///
/// # Errors
///
/// Returns an error when config validation or simulation fails.
pub fn replay_seed(seed: u64, config: &CampaignConfig) -> Result<DetailedTrace> {
    config.validate()?;
    simulate(seed, config)
}

/// Format an invariant violation into a human-readable string.
#[must_use]
pub fn format_violation(v: &InvariantViolation) -> String {
    match v {
        InvariantViolation::DocumentDivergence {
            agent_a,
            agent_b,
            html_a,
            html_b,
        } => format!("DocumentDivergence: agents {agent_a} and {agent_b} differ ({html_a} vs {html_b})"),
        InvariantViolation::StoreDivergence {
            agent_a,
            agent_b,
            only_in_a,
            only_in_b,
            differing,
        } => format!(
            "StoreDivergence: agents {agent_a} and {agent_b} diverge \
             (only_in_a={only_in_a:?}, only_in_b={only_in_b:?}, differing={differing:?})"
        ),
        InvariantViolation::DecorationDivergence {
            agent_a,
            agent_b,
            spans_a,
            spans_b,
        } => format!(
            "DecorationDivergence: agents {agent_a} and {agent_b} decorate differently \
             ({spans_a:?} vs {spans_b:?})"
        ),
        InvariantViolation::RemoteMonotonicity { sample } => format!(
            "RemoteMonotonicity: agent {} at round {} has {} annotations but {} decorations \
             and {} unresolved",
            sample.agent, sample.round, sample.store_len, sample.decorations, sample.unresolved
        ),
        InvariantViolation::MalformedDecoration {
            agent,
            id,
            start,
            end,
            doc_size,
        } => format!(
            "MalformedDecoration: agent {agent} decoration {id} spans {start}..{end} \
             in a document of size {doc_size}"
        ),
        InvariantViolation::Idempotence {
            agent,
            html_changed,
            store_changed,
            decorations_changed,
        } => format!(
            "Idempotence: re-delivery changed agent {agent} \
             (html={html_changed}, store={store_changed}, decorations={decorations_changed})"
        ),
    }
}
