//! Working states: hypothetical futures produced by the Predictor.
//!
//! A planning episode owns a [`StateArena`]; every state links back to its
//! parent by [`StateId`], so plan reconstruction is a walk over indices.

use std::collections::{BTreeMap, VecDeque};
use std::hash::{DefaultHasher, Hash, Hasher};

use crate::knowledge::{ActionId, ExceptionId, RuleId};
use crate::observation::{Grid, Observation, Pos, Scalar, Symbol, ValueIndex};

/// Index of a state inside its [`StateArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(u32);

impl StateId {
    pub const ROOT: StateId = StateId(0);

    fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for StateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "state:{}", self.0)
    }
}

/// Structural hash of grid + auxiliary vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateHash(u64);

/// Aggregate match confidence of a prediction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Confidence {
    /// Mean match ratio of everything the Predictor recorded.
    Score(f64),
    /// Certain, but only because no applicable rule exists.
    NoRule,
    /// A move chosen without any usable prediction.
    Unreachable,
}

impl Confidence {
    pub const NO_RULE: f64 = 0.99;
    pub const UNREACHABLE: f64 = 999_999.0;

    pub fn value(self) -> f64 {
        match self {
            Confidence::Score(v) => v,
            Confidence::NoRule => Self::NO_RULE,
            Confidence::Unreachable => Self::UNREACHABLE,
        }
    }

    pub fn is_certain(self) -> bool {
        matches!(self, Confidence::Score(v) if v == 1.0)
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Confidence::Score(v) => write!(f, "{v:.3}"),
            Confidence::NoRule => write!(f, "no-rule"),
            Confidence::Unreachable => write!(f, "unreachable"),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-cell prediction records
// ---------------------------------------------------------------------------

/// What the Predictor selected for one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    Change(RuleId),
    NoChange(RuleId),
    /// The value is known, but no rule applied under this action.
    Placeholder,
}

impl CellKind {
    pub fn rule(self) -> Option<RuleId> {
        match self {
            CellKind::Change(id) | CellKind::NoChange(id) => Some(id),
            CellKind::Placeholder => None,
        }
    }
}

/// Best exception evaluated against a selected rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Guard {
    /// A change rule with no exceptions on record.
    Unguarded,
    /// A no-change rule (or placeholder) with no exceptions on record.
    Quiet,
    Exception {
        id: ExceptionId,
        ratio: f64,
        uncertainty: f64,
    },
}

impl Guard {
    pub fn exception(self) -> Option<ExceptionId> {
        match self {
            Guard::Exception { id, .. } => Some(id),
            _ => None,
        }
    }
}

/// One recorded per-cell decision.
#[derive(Debug, Clone, PartialEq)]
pub struct CellPrediction {
    pub pos: Pos,
    /// Cell value the decision was made for.
    pub value: Symbol,
    pub kind: CellKind,
    pub delta: i64,
    pub ratio: f64,
    pub uncertainty: f64,
    pub guard: Guard,
}

impl CellPrediction {
    pub fn placeholder(pos: Pos, value: Symbol) -> Self {
        Self {
            pos,
            value,
            kind: CellKind::Placeholder,
            delta: 0,
            ratio: 0.01,
            uncertainty: 0.0,
            guard: Guard::Quiet,
        }
    }

    /// A change rule that was allowed to fire.
    pub fn is_change(&self) -> bool {
        matches!(self.kind, CellKind::Change(_))
    }

    /// A no-change rule or a placeholder.
    pub fn is_inert(&self) -> bool {
        !self.is_change()
    }
}

// ---------------------------------------------------------------------------
// Working state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WorkingState {
    pub id: StateId,
    pub grid: Grid,
    pub aux: Vec<Scalar>,
    pub index: ValueIndex,
    pub previous: Option<StateId>,
    pub action: Option<ActionId>,
    pub depth: usize,
    pub confidence: Confidence,
    /// Rules recorded per cell (fired change rules, no-change rules, placeholders).
    pub applied: BTreeMap<Pos, CellPrediction>,
    /// Cells whose selected rule was overridden by an exception.
    pub suppressed: BTreeMap<Pos, CellPrediction>,
    pub last_changed: Vec<Pos>,
    pub anti_goal: bool,
    /// Comparator distance, `None` when no knowledge applies.
    pub distance: Option<u32>,
    pub no_rule_found: bool,
}

impl WorkingState {
    /// The root of a planning episode: the current observation as-is.
    pub fn root(observation: &Observation, last_changed: Vec<Pos>) -> Self {
        Self {
            id: StateId::ROOT,
            index: ValueIndex::from_grid(&observation.grid),
            grid: observation.grid.clone(),
            aux: observation.aux.clone(),
            previous: None,
            action: None,
            depth: 0,
            confidence: Confidence::Score(1.0),
            applied: BTreeMap::new(),
            suppressed: BTreeMap::new(),
            last_changed,
            anti_goal: false,
            distance: None,
            no_rule_found: false,
        }
    }

    /// A child of `self` about to receive predicted changes for `action`.
    pub fn successor(&self, action: ActionId) -> Self {
        Self {
            id: self.id,
            grid: self.grid.clone(),
            aux: self.aux.clone(),
            index: self.index.clone(),
            previous: Some(self.id),
            action: Some(action),
            depth: self.depth + 1,
            confidence: Confidence::Score(0.0),
            applied: BTreeMap::new(),
            suppressed: BTreeMap::new(),
            last_changed: self.last_changed.clone(),
            anti_goal: false,
            distance: None,
            no_rule_found: false,
        }
    }

    pub fn hash(&self) -> StateHash {
        let mut hasher = DefaultHasher::new();
        self.grid.hash(&mut hasher);
        self.aux.hash(&mut hasher);
        StateHash(hasher.finish())
    }

    /// Set a cell, keeping the value index in sync.
    pub fn update_cell(&mut self, pos: Pos, value: Symbol) {
        if let Some(old) = self.grid.set(pos, value) {
            self.index.update_cell(pos, old, value);
        }
    }

    pub fn update_aux(&mut self, index: usize, value: Scalar) {
        if let Some(slot) = self.aux.get_mut(index) {
            *slot = value;
        }
    }

    /// Fired change rules, in position order.
    pub fn fired(&self) -> impl Iterator<Item = (&Pos, &CellPrediction)> {
        self.applied.iter().filter(|(_, cell)| cell.is_change())
    }

    pub fn to_observation(&self) -> Observation {
        Observation::new(self.grid.clone(), self.aux.clone())
    }
}

pub fn observation_hash(observation: &Observation) -> StateHash {
    let mut hasher = DefaultHasher::new();
    observation.grid.hash(&mut hasher);
    observation.aux.hash(&mut hasher);
    StateHash(hasher.finish())
}

// ---------------------------------------------------------------------------
// Arena
// ---------------------------------------------------------------------------

/// Append-only storage for one planning episode.
#[derive(Debug, Clone, Default)]
pub struct StateArena {
    states: Vec<WorkingState>,
}

impl StateArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, mut state: WorkingState) -> StateId {
        let id = StateId(self.states.len() as u32);
        state.id = id;
        self.states.push(state);
        id
    }

    pub fn get(&self, id: StateId) -> Option<&WorkingState> {
        self.states.get(id.index())
    }

    pub fn get_mut(&mut self, id: StateId) -> Option<&mut WorkingState> {
        self.states.get_mut(id.index())
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn clear(&mut self) {
        self.states.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkingState> {
        self.states.iter()
    }

    /// States from just below the root down to `id`, in execution order.
    pub fn path_to(&self, id: StateId) -> Vec<StateId> {
        let mut path = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let Some(state) = self.get(current) else {
                break;
            };
            if state.previous.is_none() {
                break;
            }
            path.push(current);
            cursor = state.previous;
        }
        path.reverse();
        path
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanStep {
    pub action: ActionId,
    /// Predicted state after taking `action`.
    pub state: StateId,
}

/// Ordered action sequence, consumed from the front.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    steps: VecDeque<PlanStep>,
}

impl Plan {
    pub fn from_steps(steps: impl IntoIterator<Item = PlanStep>) -> Self {
        Self {
            steps: steps.into_iter().collect(),
        }
    }

    pub fn next_step(&mut self) -> Option<PlanStep> {
        self.steps.pop_front()
    }

    pub fn peek(&self) -> Option<&PlanStep> {
        self.steps.front()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn clear(&mut self) {
        self.steps.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlanStep> {
        self.steps.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation() -> Observation {
        Observation::from_rows(vec![vec![0, 1, 0]], vec![0]).unwrap()
    }

    #[test]
    fn path_walks_back_to_root() {
        let mut arena = StateArena::new();
        let root = arena.push(WorkingState::root(&observation(), Vec::new()));
        let action = crate::knowledge::KnowledgeStore::new().intern_action("right", 1);

        let a = arena.push(arena.get(root).unwrap().successor(action));
        let b = arena.push(arena.get(a).unwrap().successor(action));
        let c = arena.push(arena.get(b).unwrap().successor(action));

        assert_eq!(arena.path_to(c), vec![a, b, c]);
        assert_eq!(arena.path_to(root), Vec::<StateId>::new());
        assert_eq!(arena.get(c).unwrap().depth, 3);
    }

    #[test]
    fn hash_follows_content() {
        let obs = observation();
        let mut state = WorkingState::root(&obs, Vec::new());
        let before = state.hash();
        assert_eq!(before, observation_hash(&obs));

        state.update_cell(Pos::new(1, 0), 0);
        assert_ne!(state.hash(), before);
        state.update_cell(Pos::new(1, 0), 1);
        assert_eq!(state.hash(), before);

        state.update_aux(0, 5);
        assert_ne!(state.hash(), before);
    }

    #[test]
    fn update_cell_keeps_index_in_sync() {
        let mut state = WorkingState::root(&observation(), Vec::new());
        state.update_cell(Pos::new(2, 0), 1);
        assert_eq!(state.index.count(1), 2);
        assert_eq!(state.index, ValueIndex::from_grid(&state.grid));
    }

    #[test]
    fn confidence_sentinels() {
        assert!(Confidence::Score(1.0).is_certain());
        assert!(!Confidence::Score(0.5).is_certain());
        assert!(!Confidence::NoRule.is_certain());
        assert_eq!(Confidence::NoRule.value(), 0.99);
        assert_eq!(Confidence::Unreachable.value(), 999_999.0);
    }

    #[test]
    fn plan_consumes_in_order() {
        let action = crate::knowledge::KnowledgeStore::new().intern_action("up", 1);
        let mut plan = Plan::from_steps([
            PlanStep {
                action,
                state: StateId(1),
            },
            PlanStep {
                action,
                state: StateId(2),
            },
        ]);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.next_step().unwrap().state, StateId(1));
        assert_eq!(plan.peek().unwrap().state, StateId(2));
        plan.clear();
        assert!(plan.is_empty());
    }
}
