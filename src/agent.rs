//! The agent: a two-call step protocol over the knowledge store.
//!
//! Every environment step is `observe_before` (decide) followed by
//! `observe_after` (learn). The agent keeps the current plan between steps
//! and only replans once the plan is used up or a prediction was wrong.

use crate::config::AgentConfig;
use crate::error::{AgentError, AirisResult};
use crate::knowledge::{ActionId, KnowledgeStore};
use crate::learn::{LearnReport, Transition, learn};
use crate::observation::{FocusSet, Observation, Pos, Symbol};
use crate::plan::{History, PlanKind, Planner};
use crate::predict::{Prediction, predict};
use crate::state::{Confidence, Plan, StateArena, WorkingState, observation_hash};

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

/// What the agent chose to do for one step.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub action: ActionId,
    pub label: String,
    pub output: i64,
    /// How the plan this action belongs to came about.
    pub kind: PlanKind,
    pub confidence: Confidence,
    /// Steps still queued after this one.
    pub plan_len: usize,
    /// Least frequent salient value in the observation.
    pub focus: Option<Symbol>,
    pub no_rule_found: bool,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}({}) [{}] confidence {} ({} queued)",
            self.label, self.output, self.kind, self.confidence, self.plan_len
        )
    }
}

/// Grid dimensions and auxiliary length fixed by the first observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Shape {
    width: usize,
    height: usize,
    aux: usize,
}

impl Shape {
    fn of(observation: &Observation) -> Self {
        Self {
            width: observation.grid.width(),
            height: observation.grid.height(),
            aux: observation.aux.len(),
        }
    }
}

/// The observation an action was taken from, and what was expected of it.
#[derive(Debug, Clone)]
struct Pending {
    prior: Observation,
    action: ActionId,
    predicted: WorkingState,
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

pub struct Agent {
    config: AgentConfig,
    store: KnowledgeStore,
    actions: Vec<ActionId>,
    arena: StateArena,
    plan: Plan,
    plan_kind: PlanKind,
    history: History,
    focus: FocusSet,
    /// Cells that changed on the last step; seeds the next root prediction.
    pos_change: Vec<Pos>,
    pending: Option<Pending>,
    time_step: u64,
    shape: Option<Shape>,
}

impl Agent {
    /// Create an agent with an empty knowledge store.
    pub fn new(config: AgentConfig) -> AirisResult<Self> {
        Self::with_store(config, KnowledgeStore::new())
    }

    /// Create an agent over previously learned knowledge.
    pub fn with_store(config: AgentConfig, mut store: KnowledgeStore) -> AirisResult<Self> {
        config.validate()?;
        let actions: Vec<ActionId> = config
            .action_space()
            .iter()
            .map(|(label, output)| store.intern_action(label, *output))
            .collect();
        tracing::info!(
            name = %config.name,
            actions = actions.len(),
            goals = config.goals.len(),
            rules = store.stats().rules,
            "agent ready"
        );
        Ok(Self {
            config,
            store,
            actions,
            arena: StateArena::new(),
            plan: Plan::default(),
            plan_kind: PlanKind::Novel,
            history: History::default(),
            focus: FocusSet::default(),
            pos_change: Vec::new(),
            pending: None,
            time_step: 0,
            shape: None,
        })
    }

    /// Choose the next action for `observation`.
    ///
    /// Plans when no plan is queued, otherwise continues the current plan.
    pub fn observe_before(&mut self, observation: &Observation) -> AirisResult<Decision> {
        self.check_shape(observation)?;
        let root = WorkingState::root(observation, self.pos_change.clone());
        let focus = root.index.focus_value(&mut self.focus);

        if self.plan.is_empty() {
            let mut budget = self
                .store
                .planning_budget()
                .unwrap_or(self.config.planner.plan_depth);
            let planner = Planner {
                store: &self.store,
                config: &self.config.planner,
                goals: &self.config.goals,
                actions: &self.actions,
            };
            let outcome = planner.plan(root.clone(), &mut self.arena, &mut self.history, &mut budget);
            self.store.set_planning_budget(budget);
            tracing::info!(
                step = self.time_step,
                kind = %outcome.kind,
                steps = outcome.steps.len(),
                expansions = outcome.expansions,
                budget,
                "planned"
            );
            self.plan = Plan::from_steps(outcome.steps);
            self.plan_kind = outcome.kind;
        }

        let action = match self.plan.next_step() {
            Some(step) => step.action,
            None => {
                // Only reachable with an action space the planner could not expand.
                self.plan_kind = PlanKind::Novel;
                self.actions[0]
            }
        };
        let prediction = predict(&self.store, &root, action);
        let confidence = match self.plan_kind {
            PlanKind::Novel => Confidence::Unreachable,
            _ if prediction.no_rule_found && prediction.confidence().is_certain() => Confidence::NoRule,
            _ => prediction.confidence(),
        };
        let decision = self.decision(action, confidence, focus, prediction.no_rule_found);
        tracing::debug!(step = self.time_step, %decision, "decided");

        self.pending = Some(Pending {
            prior: observation.clone(),
            action,
            predicted: prediction.state,
        });
        Ok(decision)
    }

    /// Predict the outcome of a caller-chosen action.
    ///
    /// Any queued plan is dropped; the following `observe_after` learns from
    /// this prediction.
    pub fn predict_action(&mut self, observation: &Observation, label: &str, output: i64) -> AirisResult<Prediction> {
        self.check_shape(observation)?;
        let action = self
            .store
            .action_id(label, output)
            .filter(|id| self.actions.contains(id))
            .ok_or_else(|| AgentError::UnknownAction {
                label: label.to_string(),
                output,
            })?;
        let root = WorkingState::root(observation, self.pos_change.clone());
        let prediction = predict(&self.store, &root, action);
        self.plan.clear();
        self.pending = Some(Pending {
            prior: observation.clone(),
            action,
            predicted: prediction.state.clone(),
        });
        Ok(prediction)
    }

    /// Learn from the observation that followed `action`.
    pub fn observe_after(&mut self, observation: &Observation, action: ActionId) -> AirisResult<LearnReport> {
        self.check_shape(observation)?;
        if !self.actions.contains(&action) {
            let (label, output) = self
                .store
                .action(action)
                .map_or_else(|| (action.to_string(), 0), |a| (a.label.clone(), a.output));
            return Err(AgentError::UnknownAction { label, output }.into());
        }
        let pending = self.pending.take().ok_or(AgentError::NoPriorObservation)?;
        let predicted = if pending.action == action {
            pending.predicted
        } else {
            tracing::debug!(decided = %pending.action, taken = %action, "action differs from decision; re-predicting");
            self.plan.clear();
            predict(
                &self.store,
                &WorkingState::root(&pending.prior, self.pos_change.clone()),
                action,
            )
            .state
        };

        let report = learn(
            &mut self.store,
            Transition {
                prior: &pending.prior,
                predicted: &predicted,
                actual: observation,
                action,
                step: self.time_step,
            },
        )?;

        if report.mismatch && !self.plan.is_empty() {
            tracing::info!(step = self.time_step, dropped = self.plan.len(), "prediction failed; plan invalidated");
            self.plan.clear();
        }
        if !report.changed_cells.is_empty() {
            for pos in &report.changed_cells {
                for value in [pending.prior.grid.get(*pos), observation.grid.get(*pos)].into_iter().flatten() {
                    self.focus.insert(value);
                }
            }
            self.pos_change = report.changed_cells.clone();
        }
        if self.plan.is_empty() {
            self.history.insert(observation_hash(&pending.prior), action);
        }
        if !report.broken.is_empty() {
            tracing::warn!(step = self.time_step, broken = report.broken.len(), "knowledge store is structurally broken");
        }
        tracing::debug!(step = self.time_step, %report, "learned");
        self.time_step += 1;
        Ok(report)
    }

    fn decision(&self, action: ActionId, confidence: Confidence, focus: Option<Symbol>, no_rule_found: bool) -> Decision {
        let (label, output) = self
            .store
            .action(action)
            .map_or_else(|| (action.to_string(), 0), |a| (a.label.clone(), a.output));
        Decision {
            action,
            label,
            output,
            kind: self.plan_kind,
            confidence,
            plan_len: self.plan.len(),
            focus,
            no_rule_found,
        }
    }

    fn check_shape(&mut self, observation: &Observation) -> Result<(), AgentError> {
        let actual = Shape::of(observation);
        let Some(expected) = self.shape else {
            self.shape = Some(actual);
            return Ok(());
        };
        if (expected.width, expected.height) != (actual.width, actual.height) {
            return Err(AgentError::ShapeMismatch {
                expected_width: expected.width,
                expected_height: expected.height,
                actual_width: actual.width,
                actual_height: actual.height,
            });
        }
        if expected.aux != actual.aux {
            return Err(AgentError::AuxLength {
                expected: expected.aux,
                actual: actual.aux,
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn store(&self) -> &KnowledgeStore {
        &self.store
    }

    /// Hand the learned knowledge back, e.g. for persistence.
    pub fn into_store(self) -> KnowledgeStore {
        self.store
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Action ids of the configured action space, in declaration order.
    pub fn actions(&self) -> &[ActionId] {
        &self.actions
    }

    pub fn action_id(&self, label: &str, output: i64) -> Option<ActionId> {
        self.store
            .action_id(label, output)
            .filter(|id| self.actions.contains(id))
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn focus(&self) -> &FocusSet {
        &self.focus
    }

    pub fn time_step(&self) -> u64 {
        self.time_step
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.config.name)
            .field("time_step", &self.time_step)
            .field("plan", &self.plan.len())
            .field("rules", &self.store.stats().rules)
            .finish()
    }
}
