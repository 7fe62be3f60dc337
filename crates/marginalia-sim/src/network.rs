use std::collections::BTreeSet;

use marginalia_core::SyncMessage;
use serde::{Deserialize, Serialize};

use crate::agent::AgentId;
use crate::rng::DeterministicRng;

/// Fault injection knobs for simulated delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultConfig {
    /// Maximum delivery delay in rounds.
    pub max_delay_rounds: u8,
    pub drop_rate_percent: u8,
    pub duplicate_rate_percent: u8,
    /// Chance per tick of shuffling the messages that are ready.
    pub reorder_rate_percent: u8,
    /// Chance per round of toggling one agent's partition.
    pub partition_rate_percent: u8,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            max_delay_rounds: 2,
            drop_rate_percent: 5,
            duplicate_rate_percent: 3,
            reorder_rate_percent: 5,
            partition_rate_percent: 2,
        }
    }
}

impl FaultConfig {
    /// Perfect network: no delay and no faults.
    #[must_use]
    pub const fn reliable() -> Self {
        Self {
            max_delay_rounds: 0,
            drop_rate_percent: 0,
            duplicate_rate_percent: 0,
            reorder_rate_percent: 0,
            partition_rate_percent: 0,
        }
    }
}

/// One sync message in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: AgentId,
    pub to: AgentId,
    /// Sender-local sequence number.
    pub seq: u64,
    pub payload: SyncMessage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Pending {
    deliver_at_round: u64,
    envelope: Envelope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOutcome {
    pub dropped: bool,
    pub duplicated: bool,
    pub delay_rounds: u8,
}

impl SendOutcome {
    const DROPPED: Self = Self {
        dropped: true,
        duplicated: false,
        delay_rounds: 0,
    };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliverOutcome {
    pub delivered: Vec<Envelope>,
    pub reordered: bool,
}

/// Deterministic, fault-injecting message queue between agents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedNetwork {
    pending: Vec<Pending>,
    partitioned: BTreeSet<AgentId>,
    fault: FaultConfig,
}

impl SimulatedNetwork {
    #[must_use]
    pub const fn new(fault: FaultConfig) -> Self {
        Self {
            pending: Vec::new(),
            partitioned: BTreeSet::new(),
            fault,
        }
    }

    #[must_use]
    pub const fn fault_config(&self) -> FaultConfig {
        self.fault
    }

    pub fn set_partitioned(&mut self, agent: AgentId, isolated: bool) {
        if isolated {
            self.partitioned.insert(agent);
        } else {
            self.partitioned.remove(&agent);
        }
    }

    #[must_use]
    pub fn is_partitioned(&self, agent: AgentId) -> bool {
        self.partitioned.contains(&agent)
    }

    /// Reconnect every partitioned agent.
    pub fn heal(&mut self) {
        self.partitioned.clear();
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Enqueue `envelope`, subject to partitions and faults.
    pub fn send(
        &mut self,
        envelope: Envelope,
        round: u64,
        rng: &mut DeterministicRng,
    ) -> SendOutcome {
        if self.is_partitioned(envelope.from) || self.is_partitioned(envelope.to) {
            return SendOutcome::DROPPED;
        }
        if rng.hit_rate_percent(self.fault.drop_rate_percent) {
            return SendOutcome::DROPPED;
        }

        let bound = u64::from(self.fault.max_delay_rounds) + 1;
        let delay = u8::try_from(rng.next_bounded(bound)).unwrap_or(self.fault.max_delay_rounds);
        let deliver_at_round = round.saturating_add(u64::from(delay));

        let duplicated = rng.hit_rate_percent(self.fault.duplicate_rate_percent);
        if duplicated {
            self.pending.push(Pending {
                deliver_at_round,
                envelope: envelope.clone(),
            });
        }
        self.pending.push(Pending {
            deliver_at_round,
            envelope,
        });

        SendOutcome {
            dropped: false,
            duplicated,
            delay_rounds: delay,
        }
    }

    /// Remove and return every envelope due at or before `round`.
    pub fn deliver_ready(&mut self, round: u64, rng: &mut DeterministicRng) -> DeliverOutcome {
        let (ready, future): (Vec<_>, Vec<_>) = self
            .pending
            .drain(..)
            .partition(|pending| pending.deliver_at_round <= round);
        self.pending = future;

        let mut delivered: Vec<Envelope> = ready.into_iter().map(|p| p.envelope).collect();
        let reordered =
            delivered.len() > 1 && rng.hit_rate_percent(self.fault.reorder_rate_percent);
        if reordered {
            let pivot = rng.next_in(1, delivered.len() - 1);
            delivered.rotate_left(pivot);
            delivered.reverse();
        }
        DeliverOutcome {
            delivered,
            reordered,
        }
    }

    /// Everything still in flight, regardless of its delivery round.
    pub fn drain_all(&mut self) -> Vec<Envelope> {
        self.pending.drain(..).map(|p| p.envelope).collect()
    }
}
