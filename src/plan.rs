//! The Planner: best-first search over predicted futures.
//!
//! Two frontiers are kept. The confident frontier holds states whose
//! prediction was certain and is searched first, ordered by estimated
//! distance plus depth. The uncertain frontier collects everything else;
//! when confident search runs dry, its best entry becomes an exploration
//! target, since acting there is how the agent learns.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};

use serde::{Deserialize, Serialize};

use crate::compare::{Assessment, Goal, compare, opposes};
use crate::knowledge::{ActionId, KnowledgeStore};
use crate::predict::predict;
use crate::state::{PlanStep, StateArena, StateHash, StateId, WorkingState};

/// Search limits and frontier penalties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Initial expansion budget, used until the store has its own.
    pub plan_depth: usize,
    /// Added to the budget when a search exceeds it.
    pub budget_increment: usize,
    /// Added when the uncertain frontier is drained.
    pub exhausted_increment: usize,
    /// Added when both frontiers are empty.
    pub stalled_increment: usize,
    pub anti_goal_penalty: f64,
    pub confident_anti_goal_penalty: f64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            plan_depth: 1000,
            budget_increment: 1000,
            exhausted_increment: 10,
            stalled_increment: 1,
            anti_goal_penalty: 1000.0,
            confident_anti_goal_penalty: 6000.0,
        }
    }
}

/// Frontier ordering key: lower score first, then lower state id.
#[derive(Debug, Clone, Copy)]
pub struct FrontierKey {
    pub score: f64,
    pub state: StateId,
}

impl PartialEq for FrontierKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FrontierKey {}

impl PartialOrd for FrontierKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FrontierKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then(self.state.cmp(&other.state))
    }
}

type Frontier = BinaryHeap<Reverse<FrontierKey>>;

/// `(state, action)` pairs already acted on while no plan was running.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct History(HashSet<(StateHash, ActionId)>);

impl History {
    pub fn insert(&mut self, state: StateHash, action: ActionId) -> bool {
        self.0.insert((state, action))
    }

    pub fn contains(&self, state: StateHash, action: ActionId) -> bool {
        self.0.contains(&(state, action))
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// How a plan came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    /// Ends in a state predicted to satisfy the goal.
    Goal,
    /// Budget ran out; heads for the closest state found.
    BestEffort,
    /// Heads for an uncertain prediction to learn from.
    Explore,
    /// Nothing could be distinguished; tries an action never taken here.
    Novel,
}

impl std::fmt::Display for PlanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PlanKind::Goal => "goal",
            PlanKind::BestEffort => "best-effort",
            PlanKind::Explore => "explore",
            PlanKind::Novel => "novel",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanOutcome {
    pub steps: Vec<PlanStep>,
    pub kind: PlanKind,
    pub expansions: usize,
    /// The first step's prediction rested on no applicable rule.
    pub no_rule_found: bool,
}

/// One planning episode's view of the world.
#[derive(Debug, Clone, Copy)]
pub struct Planner<'a> {
    pub store: &'a KnowledgeStore,
    pub config: &'a PlannerConfig,
    pub goals: &'a [Goal],
    pub actions: &'a [ActionId],
}

impl Planner<'_> {
    /// Search from `root`, filling `arena` with every predicted state.
    ///
    /// Always terminates: every iteration either expands a state within
    /// `budget` or returns. `budget` and `history` are updated in place.
    pub fn plan(
        &self,
        root: WorkingState,
        arena: &mut StateArena,
        history: &mut History,
        budget: &mut usize,
    ) -> PlanOutcome {
        arena.clear();
        let root_hash = root.hash();
        let root_id = arena.push(root);
        let assessment = self.assess(arena, root_id);

        if assessment.reached()
            && let Some(action) = assessment.action
            && !history.contains(root_hash, action)
            && let Some((state, anti_goal)) = self.step(arena, root_id, action)
            && !anti_goal
        {
            let id = arena.push(state);
            tracing::debug!(%action, "goal action available from the current state");
            return self.outcome(arena, id, PlanKind::Goal, 0);
        }

        let mut confident: Frontier = BinaryHeap::new();
        let mut uncertain: Frontier = BinaryHeap::new();
        let mut seen: HashSet<StateHash> = HashSet::from([root_hash]);
        confident.push(Reverse(FrontierKey {
            score: 0.0,
            state: root_id,
        }));

        let mut expansions = 0;
        loop {
            expansions += 1;
            let current = if expansions <= *budget {
                confident.pop().map(|Reverse(key)| key.state)
            } else {
                None
            };
            let Some(current) = current else {
                return self.fallback(arena, history, budget, &mut uncertain, expansions);
            };

            for &action in self.actions {
                let Some((mut state, anti_goal)) = self.step(arena, current, action) else {
                    continue;
                };
                let assessment = compare(self.store, &state, self.goals);
                state.distance = assessment.distance;

                let hash = state.hash();
                let certain = state.confidence.is_certain();
                let confidence = state.confidence.value();
                let (depth, distance, no_rule) = (state.depth, state.distance, state.no_rule_found);
                let id = arena.push(state);

                if seen.insert(hash) {
                    if assessment.reached() && !anti_goal {
                        match assessment.action {
                            None => {
                                tracing::info!(expansions, depth, "goal state found");
                                return self.outcome(arena, id, PlanKind::Goal, expansions);
                            }
                            Some(goal_action) => {
                                if let Some((follow, follow_anti)) = self.step(arena, id, goal_action)
                                    && !history.contains(hash, goal_action)
                                    && !follow_anti
                                {
                                    let goal = arena.push(follow);
                                    tracing::info!(expansions, depth, "goal state found");
                                    return self.outcome(arena, goal, PlanKind::Goal, expansions);
                                }
                            }
                        }
                    }
                    if certain && !anti_goal {
                        let score = distance.map_or(depth, |d| d as usize + depth);
                        confident.push(Reverse(FrontierKey {
                            score: score as f64,
                            state: id,
                        }));
                    }
                }
                if let Some(score) = self.uncertain_score(confidence, certain, no_rule, anti_goal, distance) {
                    uncertain.push(Reverse(FrontierKey { score, state: id }));
                }
            }
        }
    }

    fn assess(&self, arena: &mut StateArena, id: StateId) -> Assessment {
        let Some(state) = arena.get_mut(id) else {
            return Assessment::default();
        };
        let assessment = compare(self.store, state, self.goals);
        state.distance = assessment.distance;
        assessment
    }

    /// Predict `action` from `from`; also reports whether the result is anti-goal.
    fn step(&self, arena: &StateArena, from: StateId, action: ActionId) -> Option<(WorkingState, bool)> {
        let prediction = predict(self.store, arena.get(from)?, action);
        let anti_goal = opposes(self.goals, &prediction.aux_effects);
        let mut state = prediction.state;
        state.anti_goal = anti_goal;
        Some((state, anti_goal))
    }

    fn uncertain_score(
        &self,
        confidence: f64,
        certain: bool,
        no_rule: bool,
        anti_goal: bool,
        distance: Option<u32>,
    ) -> Option<f64> {
        let d = distance.map(f64::from);
        if certain && no_rule {
            return Some(d.map_or(0.99, |d| 0.99 + d + 1.0));
        }
        if certain && anti_goal {
            return Some(confidence + self.config.confident_anti_goal_penalty + d.unwrap_or(0.0));
        }
        if certain {
            return None;
        }
        let penalty = if anti_goal {
            self.config.anti_goal_penalty
        } else {
            0.0
        };
        Some(confidence + penalty + d.unwrap_or(0.0))
    }

    fn tried(&self, arena: &StateArena, history: &History, id: StateId) -> bool {
        let Some(state) = arena.get(id) else {
            return false;
        };
        match (state.previous.and_then(|p| arena.get(p)), state.action) {
            (Some(parent), Some(action)) => history.contains(parent.hash(), action),
            _ => false,
        }
    }

    /// Decide what to do once confident search stops.
    fn fallback(
        &self,
        arena: &mut StateArena,
        history: &mut History,
        budget: &mut usize,
        uncertain: &mut Frontier,
        expansions: usize,
    ) -> PlanOutcome {
        if expansions > *budget {
            *budget += self.config.budget_increment;
            tracing::info!(budget = *budget, "planning budget exceeded");
            let view: &StateArena = arena;
            let best = view
                .iter()
                .filter(|s| s.previous.is_some() && !s.anti_goal)
                .filter(|s| !self.tried(view, history, s.id))
                .min_by_key(|s| (s.distance.unwrap_or(u32::MAX), s.depth, s.id))
                .map(|s| s.id);
            if let Some(best) = best {
                return self.outcome(arena, best, PlanKind::BestEffort, expansions);
            }
        } else if let Some(Reverse(first)) = uncertain.pop() {
            let mut best = first.state;
            while !uncertain.is_empty() && self.tried(arena, history, best) {
                if let Some(Reverse(next)) = uncertain.pop() {
                    best = next.state;
                }
            }
            if uncertain.is_empty() {
                if self.tried(arena, history, best) {
                    tracing::warn!(tried = history.len(), "every uncertain prediction was tried; resetting history");
                    history.clear();
                }
                *budget += self.config.exhausted_increment;
            }
            return self.outcome(arena, best, PlanKind::Explore, expansions);
        } else {
            *budget += self.config.stalled_increment;
        }
        self.novel(arena, history, expansions)
    }

    /// Act without a prediction: an action never taken from the root,
    /// preferring ones nothing has been learned about.
    fn novel(&self, arena: &mut StateArena, history: &mut History, expansions: usize) -> PlanOutcome {
        let root_hash = arena.get(StateId::ROOT).map(WorkingState::hash);
        let untried: Vec<ActionId> = self
            .actions
            .iter()
            .copied()
            .filter(|a| root_hash.is_none_or(|h| !history.contains(h, *a)))
            .collect();
        let action = untried
            .iter()
            .copied()
            .find(|a| !self.store.knows_action(*a))
            .or_else(|| untried.first().copied())
            .or_else(|| {
                history.clear();
                self.actions.first().copied()
            });
        let Some((action, (state, _))) =
            action.and_then(|a| Some((a, self.step(arena, StateId::ROOT, a)?)))
        else {
            return PlanOutcome {
                steps: Vec::new(),
                kind: PlanKind::Novel,
                expansions,
                no_rule_found: true,
            };
        };
        tracing::warn!(%action, "no usable prediction; trying an untried action");
        let id = arena.push(state);
        self.outcome(arena, id, PlanKind::Novel, expansions)
    }

    fn outcome(&self, arena: &StateArena, target: StateId, kind: PlanKind, expansions: usize) -> PlanOutcome {
        let steps: Vec<PlanStep> = arena
            .path_to(target)
            .into_iter()
            .filter_map(|id| {
                let state = arena.get(id)?;
                Some(PlanStep {
                    action: state.action?,
                    state: id,
                })
            })
            .collect();
        let no_rule_found = steps
            .first()
            .and_then(|s| arena.get(s.state))
            .is_none_or(|s| s.no_rule_found);
        tracing::debug!(%kind, steps = steps.len(), expansions, states = arena.len(), "plan ready");
        PlanOutcome {
            steps,
            kind,
            expansions,
            no_rule_found,
        }
    }
}
