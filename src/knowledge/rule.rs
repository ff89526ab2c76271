//! Rule and exception records, plus the small value types they are built from.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::observation::{Offset, Pos, Scalar, Symbol};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! arena_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[repr(transparent)]
        pub struct $name(u32);

        impl $name {
            pub(crate) fn from_index(index: usize) -> Self {
                Self(index as u32)
            }

            pub(crate) fn index(self) -> usize {
                self.0 as usize
            }

            /// Get the underlying `u32` value.
            pub fn get(self) -> u32 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, ":{}"), self.0)
            }
        }
    };
}

arena_id!(
    /// Index of a [`RuleRecord`] in the knowledge store's rule arena.
    RuleId,
    "rule"
);
arena_id!(
    /// Index of an [`ExceptionRecord`] in the knowledge store's exception arena.
    ExceptionId,
    "exc"
);
arena_id!(
    /// An interned `(label, output)` action.
    ActionId,
    "act"
);

/// Label and numeric output behind an [`ActionId`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionLabel {
    pub label: String,
    pub output: i64,
}

impl std::fmt::Display for ActionLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.label, self.output)
    }
}

// ---------------------------------------------------------------------------
// Counts and conditions
// ---------------------------------------------------------------------------

/// Hit/total counter backing every count-based confidence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub hits: u32,
    pub total: u32,
}

impl Counts {
    /// A counter that has been confirmed once.
    pub fn first() -> Self {
        Self { hits: 1, total: 1 }
    }

    pub fn hit(&mut self) {
        self.hits += 1;
        self.total += 1;
    }

    pub fn miss(&mut self) {
        self.total += 1;
    }

    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            f64::from(self.hits) / f64::from(self.total)
        }
    }
}

/// Relative spatial condition `(dx, dy, expected_value, observed_delta)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Inclusion {
    pub offset: Offset,
    pub expected: Symbol,
    pub delta: i64,
}

impl Inclusion {
    pub fn new(offset: Offset, expected: Symbol, delta: i64) -> Self {
        Self {
            offset,
            expected,
            delta,
        }
    }
}

/// Pre-value and delta of one auxiliary index across a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxChange {
    pub pre: Scalar,
    pub delta: i64,
}

impl AuxChange {
    /// Pair up a before/after auxiliary vector, index by index.
    pub fn between(before: &[Scalar], after: &[Scalar]) -> Vec<AuxChange> {
        before
            .iter()
            .zip(after)
            .map(|(pre, post)| AuxChange {
                pre: *pre,
                delta: post - pre,
            })
            .collect()
    }
}

/// Sign of a desired or observed auxiliary change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Increase,
    Decrease,
}

impl Direction {
    /// Direction of a non-zero delta.
    pub fn of(delta: i64) -> Option<Direction> {
        match delta.signum() {
            1 => Some(Direction::Increase),
            -1 => Some(Direction::Decrease),
            _ => None,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Increase => write!(f, "+"),
            Direction::Decrease => write!(f, "-"),
        }
    }
}

/// Observed preconditions and effects on one auxiliary index.
///
/// An empty `pre` map means the precondition was widened to "any value".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxCondition {
    pub pre: BTreeMap<Scalar, Counts>,
    pub deltas: BTreeMap<i64, Counts>,
}

/// How an observation lines up with a record's auxiliary conditions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AuxFit {
    /// Every recorded index has the observed pre-value and delta.
    Exact,
    /// Deltas match everywhere; these indices need their precondition widened.
    Widen(Vec<usize>),
    /// Some recorded delta was not observed.
    Differs,
}

impl AuxCondition {
    pub fn observed(change: AuxChange) -> Self {
        Self {
            pre: BTreeMap::from([(change.pre, Counts::first())]),
            deltas: BTreeMap::from([(change.delta, Counts::first())]),
        }
    }

    /// Most reliable delta: highest ratio, then most hits, then the smaller delta.
    pub fn best_delta(&self) -> Option<i64> {
        self.deltas
            .iter()
            .max_by(|(da, ca), (db, cb)| {
                ca.ratio()
                    .total_cmp(&cb.ratio())
                    .then(ca.hits.cmp(&cb.hits))
                    .then(db.cmp(da))
            })
            .map(|(delta, _)| *delta)
    }

    /// Score the current value against the recorded preconditions.
    ///
    /// `None` when the precondition has been widened away.
    pub fn pre_score(&self, value: Scalar) -> Option<f64> {
        if self.pre.is_empty() {
            return None;
        }
        if self.pre.contains_key(&value) {
            return Some(1.0);
        }
        self.pre
            .keys()
            .map(|key| similarity(*key, value))
            .max_by(f64::total_cmp)
    }

    pub fn same_keys(&self, other: &AuxCondition) -> bool {
        self.pre.keys().eq(other.pre.keys()) && self.deltas.keys().eq(other.deltas.keys())
    }

    fn record(&mut self, change: AuxChange) {
        if let Some(counts) = self.pre.get_mut(&change.pre) {
            counts.hit();
        }
        self.deltas
            .entry(change.delta)
            .and_modify(Counts::hit)
            .or_insert_with(Counts::first);
    }
}

/// Compare recorded auxiliary conditions with an observed transition.
pub(crate) fn aux_fit(conditions: &BTreeMap<usize, AuxCondition>, observed: &[AuxChange]) -> AuxFit {
    let mut widen = Vec::new();
    for (index, condition) in conditions {
        let Some(change) = observed.get(*index) else {
            return AuxFit::Differs;
        };
        if !condition.deltas.contains_key(&change.delta) {
            return AuxFit::Differs;
        }
        if !condition.pre.is_empty() && !condition.pre.contains_key(&change.pre) {
            widen.push(*index);
        }
    }
    if widen.is_empty() {
        AuxFit::Exact
    } else {
        AuxFit::Widen(widen)
    }
}

/// Fold an observation into matching auxiliary conditions.
pub(crate) fn merge_aux(
    conditions: &mut BTreeMap<usize, AuxCondition>,
    observed: &[AuxChange],
    fit: &AuxFit,
) {
    if let AuxFit::Widen(indices) = fit {
        for index in indices {
            if let Some(condition) = conditions.get_mut(index) {
                condition.pre.clear();
            }
        }
    }
    for (index, condition) in conditions.iter_mut() {
        if let Some(change) = observed.get(*index) {
            condition.record(*change);
        }
    }
}

pub(crate) fn aux_keys_equal(
    a: &BTreeMap<usize, AuxCondition>,
    b: &BTreeMap<usize, AuxCondition>,
) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b)
            .all(|((ia, ca), (ib, cb))| ia == ib && ca.same_keys(cb))
}

/// Ratio-based closeness of two values, in `[0, 1]`.
///
/// Equal values score 1 and anything paired with zero scores 0. Same-sign
/// values score the ratio of their magnitudes; opposite signs score the
/// positive magnitude over the total span.
pub fn similarity(expected: i64, actual: i64) -> f64 {
    if expected == actual {
        return 1.0;
    }
    if expected == 0 || actual == 0 {
        return 0.0;
    }
    let (a, b) = (expected as f64, actual as f64);
    if (expected > 0) == (actual > 0) {
        let (lo, hi) = (a.abs().min(b.abs()), a.abs().max(b.abs()));
        lo / hi
    } else {
        let (pos, neg) = (a.max(b), a.min(b));
        pos / (pos - neg)
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Effect a rule applies to its triggering cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Effect {
    /// Relative delta added by the Predictor.
    pub delta: i64,
    /// Absolute post-value observed when the rule was learned.
    pub post: Symbol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleStatus {
    Active,
    /// Merged into an older duplicate; kept for history, skipped everywhere else.
    Combined { into: RuleId },
}

/// One condition group under a triggering value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleRecord {
    pub id: RuleId,
    pub trigger: Symbol,
    /// Index of this condition group among the rules of its trigger.
    pub group: usize,
    pub actions: BTreeMap<ActionId, Counts>,
    pub effect: Effect,
    pub inclusions: Vec<Inclusion>,
    /// Inclusions as first learned. Never pruned.
    pub footprint: BTreeSet<Inclusion>,
    pub removed: Vec<Inclusion>,
    /// Absolute-position restriction; empty means anywhere.
    pub positions: BTreeMap<Pos, Counts>,
    pub aux: BTreeMap<usize, AuxCondition>,
    pub mutual: BTreeSet<RuleId>,
    pub exceptions: Vec<ExceptionId>,
    pub created_step: u64,
    pub last_step: u64,
    pub seen: u32,
    pub status: RuleStatus,
    pub broken: bool,
}

impl RuleRecord {
    pub fn is_no_change(&self) -> bool {
        self.effect.delta == 0
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, RuleStatus::Active) && !self.broken
    }

    pub fn action_ratio(&self, action: ActionId) -> Option<f64> {
        self.actions.get(&action).map(Counts::ratio)
    }

    /// The single action this rule was learned under.
    pub fn primary_action(&self) -> Option<ActionId> {
        self.actions.keys().next().copied()
    }

    /// Best auxiliary delta on `index`, if the rule has an effect there.
    pub fn aux_effect(&self, index: usize) -> Option<i64> {
        self.aux
            .get(&index)
            .and_then(AuxCondition::best_delta)
            .filter(|d| *d != 0)
    }
}

/// A learned carve-out under one parent rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionRecord {
    pub id: ExceptionId,
    pub parent: RuleId,
    pub actions: BTreeMap<ActionId, Counts>,
    pub inclusions: Vec<Inclusion>,
    pub removed: Vec<Inclusion>,
    pub positions: BTreeMap<Pos, Counts>,
    pub aux: BTreeMap<usize, AuxCondition>,
    pub mutual: BTreeSet<RuleId>,
    pub created_step: u64,
    pub last_step: u64,
    pub seen: u32,
    /// Times the carve-out predicted "no change" and the cell changed anyway.
    pub contradictions: u32,
}
