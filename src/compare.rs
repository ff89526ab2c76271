//! The Comparator: how far a state is from a goal, in causal steps.
//!
//! Distances are heuristics built from learned knowledge. An auxiliary goal
//! asks "which rules raise (or lower) this value, and how far is the grid
//! from satisfying their conditions"; a reach goal measures plain Manhattan
//! distance between two cell values.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::knowledge::{ActionId, Direction, KnowledgeStore, RuleId};
use crate::observation::{Offset, Symbol};
use crate::state::WorkingState;

/// A target the Planner searches toward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Goal {
    /// Move auxiliary value `index` in `direction`.
    Aux { index: usize, direction: Direction },
    /// Bring a `target` cell to `subject + offset`.
    Reach {
        subject: Symbol,
        #[serde(default = "Offset::zero")]
        offset: Offset,
        target: Symbol,
    },
}

impl std::fmt::Display for Goal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Goal::Aux { index, direction } => write!(f, "aux[{index}]{direction}"),
            Goal::Reach {
                subject,
                offset,
                target,
            } => write!(f, "reach {target} at {subject}({offset})"),
        }
    }
}

/// Comparator verdict for one state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Assessment {
    /// `None` when no knowledge bears on the goal.
    pub distance: Option<u32>,
    /// The action of the rule that would achieve an auxiliary goal.
    pub action: Option<ActionId>,
    pub rule: Option<RuleId>,
}

impl Assessment {
    pub fn reached(&self) -> bool {
        self.distance == Some(0)
    }
}

/// Assess `state` against the closest of `goals`. Earlier goals win ties.
pub fn compare(store: &KnowledgeStore, state: &WorkingState, goals: &[Goal]) -> Assessment {
    let mut best = Assessment::default();
    for goal in goals {
        let a = compare_goal(store, state, goal);
        match (a.distance, best.distance) {
            (Some(d), Some(b)) if d < b => best = a,
            (Some(_), None) => best = a,
            _ => {}
        }
    }
    best
}

pub fn compare_goal(store: &KnowledgeStore, state: &WorkingState, goal: &Goal) -> Assessment {
    match *goal {
        Goal::Aux { index, direction } => aux_distance(store, state, index, direction),
        Goal::Reach {
            subject,
            offset,
            target,
        } => Assessment {
            distance: reach_distance(state, subject, offset, target),
            action: None,
            rule: None,
        },
    }
}

fn aux_distance(
    store: &KnowledgeStore,
    state: &WorkingState,
    index: usize,
    direction: Direction,
) -> Assessment {
    let mut best = Assessment::default();
    for rule in store.rules_with_aux_effect(index, direction) {
        let Some(instances) = state.index.positions(rule.trigger) else {
            continue;
        };
        for &pos in instances {
            let targets: Option<Vec<_>> = rule
                .inclusions
                .iter()
                .map(|inc| state.grid.resolve(pos, inc.offset).map(|at| (at, inc.expected)))
                .collect();
            let Some(targets) = targets else {
                continue;
            };
            let distance: u32 = targets
                .iter()
                .map(|(at, expected)| state.index.nearest(*at, *expected).unwrap_or(1))
                .sum();
            if best.distance.is_none_or(|d| distance < d) {
                best = Assessment {
                    distance: Some(distance),
                    action: rule.primary_action(),
                    rule: Some(rule.id),
                };
            }
        }
    }
    best
}

fn reach_distance(state: &WorkingState, subject: Symbol, offset: Offset, target: Symbol) -> Option<u32> {
    state
        .index
        .positions(subject)?
        .iter()
        .filter_map(|pos| pos.shifted(offset))
        .filter_map(|at| state.index.nearest(at, target))
        .min()
}

/// Whether applied auxiliary deltas push a tracked dimension the wrong way.
pub fn opposes(goals: &[Goal], aux_effects: &BTreeMap<usize, i64>) -> bool {
    goals.iter().any(|goal| match goal {
        Goal::Aux { index, direction } => aux_effects
            .get(index)
            .and_then(|d| Direction::of(*d))
            .is_some_and(|d| d != *direction),
        Goal::Reach { .. } => false,
    })
}
