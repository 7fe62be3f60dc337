//! marginalia-sim library.
//!
//! Deterministic multi-replica simulation of annotated documents. Each agent
//! wraps a [`marginalia_core::Editor`]; agents make random local edits and
//! annotation changes, exchange [`SyncMessage`]s over a fault-injecting
//! network, and take turns making structural edits (block splits and joins)
//! at barrier rounds, where the network is drained and every replica is
//! brought up to date first. After the last round the oracle checks that
//! every replica converged.
//!
//! # Conventions
//!
//! - **Errors**: `anyhow::Result` throughout; an editor error inside a run is
//!   a simulation failure, not an invariant violation.
//! - **Logging**: `tracing` macros; per-step records at `trace`.

pub mod agent;
pub mod campaign;
pub mod network;
pub mod oracle;
pub mod rng;

use anyhow::{Result, bail};
use marginalia_core::{AnnotationConfig, Editor, ReplicaId, SyncMessage, TelemetrySnapshot};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::agent::{AgentId, AgentState, LocalOp, MonotonicitySample, SimAgent, StructuralOp};
use crate::network::{Envelope, FaultConfig, SendOutcome, SimulatedNetwork};
use crate::oracle::IdempotenceProbe;
use crate::rng::DeterministicRng;

/// Starting document for every run.
pub const DEFAULT_DOCUMENT: &str =
    "<h1>notes</h1><p>first paragraph</p><p>second paragraph</p><p>third</p>";

/// Parameters of one simulation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub seed: u64,
    pub agent_count: usize,
    pub rounds: u64,
    /// Every `barrier_every`-th round is a barrier with one structural edit;
    /// `0` disables barriers.
    pub barrier_every: u64,
    /// Initial block markup shared by all replicas.
    pub document: String,
    pub fault: FaultConfig,
    /// Editor settings shared by every agent; `instance` is set per agent.
    #[serde(default)]
    pub editor: AnnotationConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            agent_count: 3,
            rounds: 24,
            barrier_every: 4,
            document: DEFAULT_DOCUMENT.to_string(),
            fault: FaultConfig::default(),
            editor: AnnotationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TraceEventKind {
    Local {
        agent: AgentId,
        op: LocalOp,
    },
    Send {
        from: AgentId,
        to: AgentId,
        seq: u64,
        outcome: SendOutcome,
    },
    Deliver {
        from: AgentId,
        to: AgentId,
        seq: u64,
        doc_ops: usize,
        map_writes: usize,
    },
    Reordered {
        count: usize,
    },
    Partition {
        agent: AgentId,
        isolated: bool,
    },
    Structural {
        agent: AgentId,
        op: StructuralOp,
    },
    /// Anti-entropy exchange of full states.
    Repair {
        messages: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceEvent {
    pub round: u64,
    #[serde(flatten)]
    pub kind: TraceEventKind,
}

/// Everything a run produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SimulationResult {
    pub seed: u64,
    pub trace: Vec<TraceEvent>,
    pub states: Vec<AgentState>,
    pub samples: Vec<MonotonicitySample>,
    pub telemetry: Vec<TelemetrySnapshot>,
    pub idempotence: Option<IdempotenceProbe>,
    /// A fault fired, an anchor went unresolved, or a relocation moved
    /// annotations.
    pub interesting_state_reached: bool,
}

/// Drives one seeded run.
#[derive(Debug)]
pub struct Simulator {
    config: SimulationConfig,
    agents: Vec<SimAgent>,
    network: SimulatedNetwork,
    rng: DeterministicRng,
    net_rng: DeterministicRng,
    next_seq: Vec<u64>,
    trace: Vec<TraceEvent>,
    faults_seen: bool,
}

fn replica_for(agent: AgentId) -> ReplicaId {
    ReplicaId(u64::try_from(agent).unwrap_or(u64::MAX - 1) + 1)
}

fn editor_config(base: &AnnotationConfig, agent: AgentId) -> AnnotationConfig {
    AnnotationConfig {
        instance: format!("agent-{agent}"),
        ..base.clone()
    }
}

impl Simulator {
    /// # Errors
    ///
    /// Invalid configuration or unparsable initial document.
    pub fn new(config: SimulationConfig) -> Result<Self> {
        if config.agent_count == 0 {
            bail!("agent_count must be > 0");
        }
        let mut rng = DeterministicRng::new(config.seed);
        let net_rng = rng.split(u64::MAX);

        let root = Editor::with_content(
            &config.document,
            replica_for(0),
            editor_config(&config.editor, 0),
        )?;
        let mut agents = Vec::with_capacity(config.agent_count);
        for id in 1..config.agent_count {
            let editor = root.fork(replica_for(id), editor_config(&config.editor, id));
            let stream = u64::try_from(id).unwrap_or(u64::MAX);
            agents.push(SimAgent::new(id, editor, rng.split(stream)));
        }
        agents.insert(0, SimAgent::new(0, root, rng.split(0)));

        Ok(Self {
            network: SimulatedNetwork::new(config.fault),
            next_seq: vec![0; config.agent_count],
            config,
            agents,
            rng,
            net_rng,
            trace: Vec::new(),
            faults_seen: false,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &SimulationConfig {
        &self.config
    }

    #[must_use]
    pub fn agents(&self) -> &[SimAgent] {
        &self.agents
    }

    fn record(&mut self, round: u64, kind: TraceEventKind) {
        self.trace.push(TraceEvent { round, kind });
    }

    const fn is_barrier(&self, round: u64) -> bool {
        self.config.barrier_every > 0 && round % self.config.barrier_every == self.config.barrier_every - 1
    }

    /// Run every round, then drain, repair and snapshot.
    ///
    /// # Errors
    ///
    /// Editor errors raised by any agent.
    pub fn run(&mut self) -> Result<SimulationResult> {
        info!(
            seed = self.config.seed,
            agents = self.config.agent_count,
            rounds = self.config.rounds,
            "simulation start"
        );
        for round in 0..self.config.rounds {
            self.maybe_toggle_partition(round);
            if self.is_barrier(round) {
                self.barrier(round)?;
            } else {
                for id in 0..self.agents.len() {
                    let op = self.agents[id].local_step()?;
                    if op != LocalOp::Idle {
                        self.record(round, TraceEventKind::Local { agent: id, op });
                    }
                    self.broadcast(id, round);
                }
            }
            self.deliver_ready(round)?;
        }
        self.finish()
    }

    fn maybe_toggle_partition(&mut self, round: u64) {
        if self.agents.len() < 2
            || !self
                .rng
                .hit_rate_percent(self.config.fault.partition_rate_percent)
        {
            return;
        }
        let agent = self.rng.next_index(self.agents.len());
        let isolated = !self.network.is_partitioned(agent);
        self.network.set_partitioned(agent, isolated);
        self.faults_seen = true;
        self.record(round, TraceEventKind::Partition { agent, isolated });
    }

    fn broadcast(&mut self, from: AgentId, round: u64) {
        let Some(payload) = self.agents[from].outgoing() else {
            return;
        };
        for to in (0..self.agents.len()).filter(|to| *to != from) {
            let seq = self.next_seq[from];
            self.next_seq[from] += 1;
            let envelope = Envelope {
                from,
                to,
                seq,
                payload: payload.clone(),
            };
            let outcome = self.network.send(envelope, round, &mut self.net_rng);
            self.faults_seen |= outcome.dropped || outcome.duplicated;
            self.record(
                round,
                TraceEventKind::Send {
                    from,
                    to,
                    seq,
                    outcome,
                },
            );
        }
    }

    fn deliver(&mut self, envelope: &Envelope, round: u64) -> Result<()> {
        self.agents[envelope.to].deliver(&envelope.payload, round)?;
        let map_writes = envelope.payload.map.iter().map(|b| b.writes.len()).sum();
        self.record(
            round,
            TraceEventKind::Deliver {
                from: envelope.from,
                to: envelope.to,
                seq: envelope.seq,
                doc_ops: envelope.payload.doc.len(),
                map_writes,
            },
        );
        Ok(())
    }

    fn deliver_ready(&mut self, round: u64) -> Result<()> {
        let outcome = self.network.deliver_ready(round, &mut self.net_rng);
        if outcome.reordered {
            self.faults_seen = true;
            self.record(
                round,
                TraceEventKind::Reordered {
                    count: outcome.delivered.len(),
                },
            );
        }
        for envelope in &outcome.delivered {
            self.deliver(envelope, round)?;
        }
        Ok(())
    }

    /// Bring every replica to the same state: flush local changes, deliver
    /// everything in flight, then exchange full states.
    fn quiesce(&mut self, round: u64) -> Result<()> {
        self.network.heal();
        for id in 0..self.agents.len() {
            self.broadcast(id, round);
        }
        for envelope in self.network.drain_all() {
            self.deliver(&envelope, round)?;
        }
        let states: Vec<SyncMessage> = self.agents.iter().map(SimAgent::state_message).collect();
        let mut messages = 0;
        for (from, state) in states.iter().enumerate() {
            for to in (0..self.agents.len()).filter(|to| *to != from) {
                self.agents[to].deliver(state, round)?;
                messages += 1;
            }
        }
        self.record(round, TraceEventKind::Repair { messages });
        Ok(())
    }

    fn barrier(&mut self, round: u64) -> Result<()> {
        self.quiesce(round)?;
        let agent = self.rng.next_index(self.agents.len());
        let op = self.agents[agent].structural_step()?;
        debug!(round, agent, ?op, "structural edit");
        self.record(round, TraceEventKind::Structural { agent, op });

        if let Some(payload) = self.agents[agent].outgoing() {
            for to in (0..self.agents.len()).filter(|to| *to != agent) {
                let seq = self.next_seq[agent];
                self.next_seq[agent] += 1;
                let envelope = Envelope {
                    from: agent,
                    to,
                    seq,
                    payload: payload.clone(),
                };
                self.deliver(&envelope, round)?;
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<SimulationResult> {
        let round = self.config.rounds;
        self.quiesce(round)?;

        let idempotence = if self.agents.len() >= 2 {
            let duplicate = self.agents[1].state_message();
            let before = self.agents[0].snapshot();
            self.agents[0].deliver(&duplicate, round)?;
            let after = self.agents[0].snapshot();
            Some(IdempotenceProbe {
                agent: 0,
                before,
                after,
            })
        } else {
            None
        };

        let states: Vec<AgentState> = self.agents.iter().map(SimAgent::snapshot).collect();
        let telemetry: Vec<TelemetrySnapshot> =
            self.agents.iter().map(|a| a.editor().telemetry()).collect();
        let samples = self
            .agents
            .iter()
            .flat_map(|a| a.samples().iter().copied())
            .collect();
        let interesting_state_reached = self.faults_seen
            || telemetry
                .iter()
                .any(|t| t.unresolved_anchors > 0 || t.relocations > 0);

        info!(
            seed = self.config.seed,
            trace_events = self.trace.len(),
            interesting = interesting_state_reached,
            "simulation complete"
        );
        Ok(SimulationResult {
            seed: self.config.seed,
            trace: std::mem::take(&mut self.trace),
            states,
            samples,
            telemetry,
            idempotence,
            interesting_state_reached,
        })
    }
}
