use std::collections::BTreeSet;

use serde::Serialize;

use crate::SimulationResult;
use crate::agent::{AgentId, AgentState, MonotonicitySample};

// ── Core result types ─────────────────────────────────────────────────────────

/// Oracle result for an invariant check.
///
/// Returned by each checker and by [`ConvergenceOracle::check_all`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OracleResult {
    /// `true` iff no violations were found.
    pub passed: bool,
    pub violations: Vec<InvariantViolation>,
}

impl OracleResult {
    #[must_use]
    const fn pass() -> Self {
        Self {
            passed: true,
            violations: Vec::new(),
        }
    }

    fn from_violations(violations: Vec<InvariantViolation>) -> Self {
        if violations.is_empty() {
            Self::pass()
        } else {
            Self {
                passed: false,
                violations,
            }
        }
    }

    /// Merge another result into this one (failures accumulate).
    #[must_use]
    fn merge(mut self, other: Self) -> Self {
        if !other.passed {
            self.passed = false;
            self.violations.extend(other.violations);
        }
        self
    }
}

/// Agent state around a re-delivered full-state message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdempotenceProbe {
    pub agent: AgentId,
    pub before: AgentState,
    pub after: AgentState,
}

// ── Invariant violation diagnostics ──────────────────────────────────────────

/// Diagnostic information for a single failed invariant check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "invariant", rename_all = "kebab-case")]
pub enum InvariantViolation {
    /// Two agents render different documents after full delivery.
    DocumentDivergence {
        agent_a: AgentId,
        agent_b: AgentId,
        html_a: String,
        html_b: String,
    },

    /// Two agents hold different annotation maps after full delivery.
    StoreDivergence {
        agent_a: AgentId,
        agent_b: AgentId,
        only_in_a: Vec<String>,
        only_in_b: Vec<String>,
        /// Ids present on both sides with different anchors or data.
        differing: Vec<String>,
    },

    /// Same document and store, different decorations.
    DecorationDivergence {
        agent_a: AgentId,
        agent_b: AgentId,
        spans_a: Vec<(usize, usize)>,
        spans_b: Vec<(usize, usize)>,
    },

    /// After a remote update some live annotation was neither decorated nor
    /// reported unresolved.
    RemoteMonotonicity { sample: MonotonicitySample },

    /// A decoration is empty, out of bounds, or duplicated.
    MalformedDecoration {
        agent: AgentId,
        id: String,
        start: usize,
        end: usize,
        doc_size: usize,
    },

    /// Re-applying a state message the agent already had changed its state.
    Idempotence {
        agent: AgentId,
        html_changed: bool,
        store_changed: bool,
        decorations_changed: bool,
    },
}

// ── Oracle ────────────────────────────────────────────────────────────────────

/// Checks convergence invariants over the final agent states.
pub struct ConvergenceOracle;

impl ConvergenceOracle {
    /// Every agent renders the same document as agent 0.
    #[must_use]
    pub fn check_documents(states: &[AgentState]) -> OracleResult {
        let Some(first) = states.first() else {
            return OracleResult::pass();
        };
        let violations = states[1..]
            .iter()
            .filter(|state| state.html != first.html)
            .map(|state| InvariantViolation::DocumentDivergence {
                agent_a: first.id,
                agent_b: state.id,
                html_a: first.html.clone(),
                html_b: state.html.clone(),
            })
            .collect();
        OracleResult::from_violations(violations)
    }

    /// Every agent holds the same annotation entries as agent 0.
    #[must_use]
    pub fn check_stores(states: &[AgentState]) -> OracleResult {
        let Some(first) = states.first() else {
            return OracleResult::pass();
        };
        let mut violations = Vec::new();
        for state in &states[1..] {
            if state.store == first.store {
                continue;
            }
            let a = &first.store.entries;
            let b = &state.store.entries;
            violations.push(InvariantViolation::StoreDivergence {
                agent_a: first.id,
                agent_b: state.id,
                only_in_a: a.keys().filter(|k| !b.contains_key(*k)).cloned().collect(),
                only_in_b: b.keys().filter(|k| !a.contains_key(*k)).cloned().collect(),
                differing: a
                    .iter()
                    .filter(|(k, entry)| b.get(*k).is_some_and(|other| other != *entry))
                    .map(|(k, _)| k.clone())
                    .collect(),
            });
        }
        OracleResult::from_violations(violations)
    }

    /// Agents that agree on document and store derive the same decorations.
    #[must_use]
    pub fn check_decorations(states: &[AgentState]) -> OracleResult {
        let Some(first) = states.first() else {
            return OracleResult::pass();
        };
        let violations = states[1..]
            .iter()
            .filter(|state| {
                state.html == first.html
                    && state.store == first.store
                    && state.decorations != first.decorations
            })
            .map(|state| InvariantViolation::DecorationDivergence {
                agent_a: first.id,
                agent_b: state.id,
                spans_a: first.decorations.spans(),
                spans_b: state.decorations.spans(),
            })
            .collect();
        OracleResult::from_violations(violations)
    }

    #[must_use]
    pub fn check_monotonicity(samples: &[MonotonicitySample]) -> OracleResult {
        let violations = samples
            .iter()
            .filter(|sample| !sample.holds())
            .map(|sample| InvariantViolation::RemoteMonotonicity { sample: *sample })
            .collect();
        OracleResult::from_violations(violations)
    }

    /// Decorations are non-empty, in bounds, and at most one per annotation.
    #[must_use]
    pub fn check_well_formed(states: &[AgentState]) -> OracleResult {
        let mut violations = Vec::new();
        for state in states {
            let mut seen = BTreeSet::new();
            for deco in &state.decorations {
                let fresh = seen.insert(deco.id.as_str());
                if !fresh || deco.start >= deco.end || deco.end > state.doc_size {
                    violations.push(InvariantViolation::MalformedDecoration {
                        agent: state.id,
                        id: deco.id.clone(),
                        start: deco.start,
                        end: deco.end,
                        doc_size: state.doc_size,
                    });
                }
            }
        }
        OracleResult::from_violations(violations)
    }

    #[must_use]
    pub fn check_idempotence(probe: Option<&IdempotenceProbe>) -> OracleResult {
        let Some(probe) = probe else {
            return OracleResult::pass();
        };
        if probe.before == probe.after {
            return OracleResult::pass();
        }
        OracleResult::from_violations(vec![InvariantViolation::Idempotence {
            agent: probe.agent,
            html_changed: probe.before.html != probe.after.html,
            store_changed: probe.before.store != probe.after.store,
            decorations_changed: probe.before.decorations != probe.after.decorations,
        }])
    }

    /// Run every check.
    #[must_use]
    pub fn check_all(result: &SimulationResult) -> OracleResult {
        Self::check_documents(&result.states)
            .merge(Self::check_stores(&result.states))
            .merge(Self::check_decorations(&result.states))
            .merge(Self::check_monotonicity(&result.samples))
            .merge(Self::check_well_formed(&result.states))
            .merge(Self::check_idempotence(result.idempotence.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marginalia_core::{AnnotationConfig, Editor, ReplicaId};
    use serde_json::json;

    const DOC: &str = "<h1>t</h1><p>one</p><p>two</p>";

    fn state(id: AgentId, editor: &Editor) -> AgentState {
        AgentState {
            id,
            html: editor.html(),
            doc_size: marginalia_core::DocumentView::size(editor.document()),
            store: editor.store().snapshot(),
            decorations: editor.decorations().clone(),
            unresolved: Vec::new(),
        }
    }

    fn annotated() -> Editor {
        let mut ed = Editor::with_content(DOC, ReplicaId(1), AnnotationConfig::default()).unwrap();
        ed.set_cursor(4).unwrap();
        ed.add_annotation_with_id("a1", json!("x")).unwrap();
        ed
    }

    #[test]
    fn identical_states_pass() {
        let ed = annotated();
        let states = vec![state(0, &ed), state(1, &ed)];
        assert!(ConvergenceOracle::check_documents(&states).passed);
        assert!(ConvergenceOracle::check_stores(&states).passed);
        assert!(ConvergenceOracle::check_decorations(&states).passed);
        assert!(ConvergenceOracle::check_well_formed(&states).passed);
    }

    #[test]
    fn store_divergence_lists_missing_ids() {
        let ed = annotated();
        let plain = Editor::with_content(DOC, ReplicaId(2), AnnotationConfig::default()).unwrap();
        let states = vec![state(0, &ed), state(1, &plain)];
        let result = ConvergenceOracle::check_stores(&states);
        assert!(!result.passed);
        assert!(matches!(
            &result.violations[0],
            InvariantViolation::StoreDivergence { only_in_a, only_in_b, .. }
                if only_in_a == &vec!["a1".to_string()] && only_in_b.is_empty()
        ));
    }

    #[test]
    fn document_divergence_detected() {
        let a = annotated();
        let mut b = annotated();
        b.insert_text(4, "z").unwrap();
        let result = ConvergenceOracle::check_documents(&[state(0, &a), state(1, &b)]);
        assert_eq!(result.violations.len(), 1);
    }

    #[test]
    fn out_of_bounds_decoration_is_malformed() {
        let ed = annotated();
        let mut s = state(0, &ed);
        s.doc_size = 4;
        let result = ConvergenceOracle::check_well_formed(&[s]);
        assert!(!result.passed);
    }

    #[test]
    fn broken_monotonicity_sample() {
        let sample = MonotonicitySample {
            agent: 0,
            round: 1,
            store_len: 2,
            decorations: 1,
            unresolved: 0,
        };
        assert!(!ConvergenceOracle::check_monotonicity(&[sample]).passed);
    }

    #[test]
    fn idempotence_flags_changed_fields() {
        let ed = annotated();
        let before = state(0, &ed);
        let mut after = before.clone();
        after.html.push('x');
        let probe = IdempotenceProbe {
            agent: 0,
            before,
            after,
        };
        let result = ConvergenceOracle::check_idempotence(Some(&probe));
        assert_eq!(
            result.violations,
            vec![InvariantViolation::Idempotence {
                agent: 0,
                html_changed: true,
                store_changed: false,
                decorations_changed: false,
            }]
        );
    }
}
