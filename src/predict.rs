//! The Predictor: applies learned rules to a state to produce its successor.
//!
//! Prediction is local. Only positions near the last change are examined
//! (the whole grid on a cold start), each cell's value is looked up in the
//! knowledge store, and the best-matching condition group decides whether
//! the cell changes. Auxiliary effects ride on the rules that fired.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

use crate::knowledge::{
    ActionId, AuxCondition, Counts, Inclusion, KnowledgeStore, RuleRecord, similarity,
};
use crate::observation::{Grid, Offset, Pos, Scalar};
use crate::state::{CellKind, CellPrediction, Confidence, Guard, WorkingState};

/// Result of applying one action to one state.
#[derive(Debug, Clone)]
pub struct Prediction {
    /// The successor. `applied` holds the rules recorded per cell,
    /// `suppressed` the cells an exception overrode.
    pub state: WorkingState,
    pub uncertainty: f64,
    pub exception_uncertainty: f64,
    /// Every recorded cell was a placeholder or a no-change rule.
    pub no_rule_found: bool,
    /// Auxiliary deltas that were applied, by index.
    pub aux_effects: BTreeMap<usize, i64>,
}

impl Prediction {
    /// Mean match ratio over recorded rules and fired exceptions; 0 when
    /// nothing was recorded.
    pub fn confidence(&self) -> Confidence {
        confidence_of(&self.state)
    }
}

pub(crate) fn confidence_of(state: &WorkingState) -> Confidence {
    let ratios: Vec<f64> = state
        .applied
        .values()
        .map(|cell| cell.ratio)
        .chain(state.suppressed.values().filter_map(|cell| match cell.guard {
            Guard::Exception { ratio, .. } => Some(ratio),
            _ => None,
        }))
        .collect();
    if ratios.is_empty() {
        return Confidence::Score(0.0);
    }
    Confidence::Score(ratios.iter().sum::<f64>() / ratios.len() as f64)
}

// ---------------------------------------------------------------------------
// Condition scoring
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
struct Score {
    ratio: f64,
    uncertainty: f64,
}

/// Conditions shared by rules and exceptions.
struct Conditions<'a> {
    actions: &'a BTreeMap<ActionId, Counts>,
    inclusions: &'a [Inclusion],
    aux: &'a BTreeMap<usize, AuxCondition>,
    no_change: bool,
}

fn score(conditions: &Conditions<'_>, grid: &Grid, aux: &[Scalar], pos: Pos, action: ActionId) -> Score {
    let mut matched = conditions
        .actions
        .get(&action)
        .map_or(0.0, Counts::ratio);
    let mut count = 1.0;
    let mut uncertainty = 0.0;

    let mut per_cell: BTreeMap<Offset, (f64, f64)> = BTreeMap::new();
    for inclusion in conditions.inclusions {
        let (cell_score, cell_uncertainty) = match grid.value_at(pos, inclusion.offset) {
            // Exceptions may reach outside the grid; that counts as agreement.
            None => (1.0, 0.0),
            Some(actual) if actual == inclusion.expected => (1.0, 0.0),
            Some(actual) if actual != 0 && inclusion.expected != 0 => {
                let s = similarity(inclusion.expected, actual);
                (s, s)
            }
            Some(_) => (0.0, 1.0),
        };
        per_cell
            .entry(inclusion.offset)
            .and_modify(|best| {
                if cell_score > best.0 {
                    *best = (cell_score, cell_uncertainty);
                }
            })
            .or_insert((cell_score, cell_uncertainty));
    }
    for (cell_score, cell_uncertainty) in per_cell.values() {
        matched += cell_score;
        uncertainty += cell_uncertainty;
        count += 1.0;
    }

    for (index, condition) in conditions.aux {
        let Some(value) = aux.get(*index) else {
            continue;
        };
        if let Some(s) = condition.pre_score(*value) {
            matched += s;
            count += 1.0;
        }
    }

    if conditions.no_change {
        matched = count;
    }
    Score {
        ratio: matched / count,
        uncertainty,
    }
}

#[derive(Debug, Clone)]
struct Candidate<'a> {
    rule: &'a RuleRecord,
    score: Score,
    guard: Guard,
}

impl Candidate<'_> {
    fn exception_ratio(&self) -> f64 {
        match self.guard {
            Guard::Exception { ratio, .. } => ratio,
            _ => 0.0,
        }
    }
}

fn candidates<'a>(
    store: &'a KnowledgeStore,
    state: &WorkingState,
    pos: Pos,
    value: i64,
    action: ActionId,
) -> Vec<Candidate<'a>> {
    let mut out: Vec<Candidate<'a>> = store
        .lookup_rules(value, action)
        .into_iter()
        .filter(|rule| rule.is_active())
        .filter(|rule| rule.positions.is_empty() || rule.positions.contains_key(&pos))
        .filter(|rule| {
            rule.inclusions
                .iter()
                .all(|inc| state.grid.resolve(pos, inc.offset).is_some())
        })
        .map(|rule| {
            let score = score(
                &Conditions {
                    actions: &rule.actions,
                    inclusions: &rule.inclusions,
                    aux: &rule.aux,
                    no_change: rule.is_no_change(),
                },
                &state.grid,
                &state.aux,
                pos,
                action,
            );
            let guard = guard_for(store, rule, state, pos, action);
            Candidate { rule, score, guard }
        })
        .collect();
    out.sort_by(|a, b| {
        b.score
            .ratio
            .total_cmp(&a.score.ratio)
            .then(a.rule.id.cmp(&b.rule.id))
    });
    out
}

/// Best-matching exception of `rule`, ties to the lowest id.
fn guard_for(
    store: &KnowledgeStore,
    rule: &RuleRecord,
    state: &WorkingState,
    pos: Pos,
    action: ActionId,
) -> Guard {
    let mut best: Option<Guard> = None;
    for eid in &rule.exceptions {
        let Some(exception) = store.exception(*eid) else {
            continue;
        };
        let s = score(
            &Conditions {
                actions: &exception.actions,
                inclusions: &exception.inclusions,
                aux: &exception.aux,
                no_change: false,
            },
            &state.grid,
            &state.aux,
            pos,
            action,
        );
        let better = match best {
            Some(Guard::Exception { ratio, .. }) => s.ratio > ratio,
            _ => true,
        };
        if better {
            best = Some(Guard::Exception {
                id: *eid,
                ratio: s.ratio,
                uncertainty: s.uncertainty,
            });
        }
    }
    best.unwrap_or(if rule.is_no_change() {
        Guard::Quiet
    } else {
        Guard::Unguarded
    })
}

/// Pick the winning candidate from a list sorted by ratio, then id.
fn select(entries: &[Candidate<'_>]) -> Option<usize> {
    let mut idx = 0;
    let mut best = None;
    while idx < entries.len() && entries[idx].rule.is_no_change() {
        best = Some(idx);
        idx += 1;
    }
    if idx < entries.len() {
        match best {
            None => {
                best = Some(idx);
                idx += 1;
            }
            Some(_) if entries[idx].guard == Guard::Unguarded => {
                best = Some(idx);
                idx += 1;
            }
            Some(_) => {}
        }
    }
    let mut best = best?;

    while idx < entries.len()
        && entries[idx].score.ratio == entries[best].score.ratio
        && entries[best].guard != Guard::Unguarded
    {
        let next = &entries[idx];
        let displace = next.guard != Guard::Quiet
            && (entries[best].rule.is_no_change()
                || next.guard == Guard::Unguarded
                || next.exception_ratio() < entries[best].exception_ratio());
        if displace {
            best = idx;
        }
        idx += 1;
    }
    Some(best)
}

// ---------------------------------------------------------------------------
// Prediction
// ---------------------------------------------------------------------------

/// Predict the successor of `base` under `action`.
///
/// A pure function of its inputs: the same store, state and action always
/// yield the same prediction.
pub fn predict(store: &KnowledgeStore, base: &WorkingState, action: ActionId) -> Prediction {
    let seeds: BTreeSet<Pos> = if base.last_changed.is_empty() {
        base.grid.positions().collect()
    } else {
        base.last_changed
            .iter()
            .copied()
            .filter(|p| base.grid.contains(*p))
            .collect()
    };
    let mut queued = seeds.clone();
    let mut queue: BinaryHeap<Reverse<Pos>> = seeds.iter().copied().map(Reverse).collect();

    let mut state = base.successor(action);
    let mut uncertainty = 0.0;
    let mut exception_uncertainty = 0.0;

    while let Some(Reverse(pos)) = queue.pop() {
        let Some(value) = base.grid.get(pos) else {
            continue;
        };
        if !store.knows_value(value) {
            continue;
        }

        let entries = candidates(store, base, pos, value, action);
        let Some(winner) = select(&entries) else {
            tracing::debug!(%pos, value, "no applicable rule; placeholder");
            state
                .applied
                .insert(pos, CellPrediction::placeholder(pos, value));
            continue;
        };
        let chosen = &entries[winner];
        let rule = chosen.rule;
        let kind = if rule.is_no_change() {
            CellKind::NoChange(rule.id)
        } else {
            CellKind::Change(rule.id)
        };
        let cell = CellPrediction {
            pos,
            value,
            kind,
            delta: rule.effect.delta,
            ratio: chosen.score.ratio,
            uncertainty: chosen.score.uncertainty,
            guard: chosen.guard,
        };

        match chosen.guard {
            Guard::Exception {
                id,
                ratio,
                uncertainty: exc_uncertainty,
            } if ratio >= chosen.score.ratio => {
                tracing::debug!(%pos, rule = %rule.id, exception = %id, ratio, "exception overrides rule");
                exception_uncertainty += exc_uncertainty;
                state.suppressed.insert(pos, cell);
            }
            _ => {
                tracing::debug!(%pos, rule = %rule.id, delta = rule.effect.delta, ratio = chosen.score.ratio, "rule selected");
                uncertainty += chosen.score.uncertainty;
                state.applied.insert(pos, cell);
            }
        }

        if seeds.contains(&pos) && chosen.guard != Guard::Quiet {
            for inclusion in &rule.footprint {
                if let Some(at) = base.grid.resolve(pos, inclusion.offset)
                    && queued.insert(at)
                {
                    queue.push(Reverse(at));
                }
            }
        }
    }

    let changed: Vec<(Pos, i64)> = state
        .fired()
        .map(|(pos, cell)| (*pos, cell.value + cell.delta))
        .collect();
    for (pos, value) in &changed {
        state.update_cell(*pos, *value);
    }
    if !changed.is_empty() {
        state.last_changed = changed.iter().map(|(pos, _)| *pos).collect();
    }

    let aux_effects = apply_aux_effects(store, &mut state);

    state.no_rule_found =
        state.suppressed.is_empty() && state.applied.values().all(CellPrediction::is_inert);
    state.confidence = confidence_of(&state);

    Prediction {
        no_rule_found: state.no_rule_found,
        state,
        uncertainty,
        exception_uncertainty,
        aux_effects,
    }
}

/// Apply the best auxiliary delta of every fired rule, in position order.
///
/// The first fired rule always counts as used, even without aux effects. A
/// rule that co-fires with one it is mutual to does not apply the same
/// effect again.
fn apply_aux_effects(store: &KnowledgeStore, state: &mut WorkingState) -> BTreeMap<usize, i64> {
    let mut used: BTreeSet<_> = BTreeSet::new();
    let mut mutual: BTreeSet<_> = BTreeSet::new();
    let mut effects: BTreeMap<usize, i64> = BTreeMap::new();

    let fired: Vec<_> = state
        .fired()
        .filter_map(|(_, cell)| cell.kind.rule())
        .filter_map(|id| store.rule(id))
        .collect();
    for rule in fired {
        let deltas: Vec<(usize, i64)> = rule
            .aux
            .keys()
            .filter_map(|index| rule.aux_effect(*index).map(|d| (*index, d)))
            .collect();
        if used.is_empty() || (!used.contains(&rule.id) && !mutual.contains(&rule.id)) {
            for (index, delta) in deltas {
                *effects.entry(index).or_default() += delta;
            }
            used.insert(rule.id);
        }
        mutual.extend(rule.mutual.iter().copied());
    }

    for (index, delta) in &effects {
        if let Some(current) = state.aux.get(*index).copied() {
            state.update_aux(*index, current + delta);
        }
    }
    effects
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::{AuxChange, ExceptionObservation, RuleObservation};
    use crate::observation::Observation;

    struct Learned<'a> {
        trigger: i64,
        pos: Pos,
        delta: i64,
        evidence: Vec<Inclusion>,
        prior: &'a Grid,
        aux: &'a [AuxChange],
    }

    fn learn(store: &mut KnowledgeStore, action: ActionId, l: Learned<'_>) -> crate::knowledge::RuleId {
        store.find_or_create_rule(RuleObservation {
            trigger: l.trigger,
            action,
            pos: l.pos,
            delta: l.delta,
            post: l.trigger + l.delta,
            evidence: l.evidence,
            prior: l.prior,
            aux: l.aux,
            mutual: BTreeSet::new(),
            step: 0,
        })
    }

    /// Player (1) steps right over floor (0) in a 3x1 corridor.
    fn corridor_store() -> (KnowledgeStore, ActionId, Grid) {
        let mut store = KnowledgeStore::new();
        let right = store.intern_action("right", 1);
        let prior = Grid::from_rows(vec![vec![0, 1, 0]]).unwrap();
        let aux = [AuxChange { pre: 0, delta: 0 }];
        learn(
            &mut store,
            right,
            Learned {
                trigger: 1,
                pos: Pos::new(1, 0),
                delta: -1,
                evidence: vec![Inclusion::new(Offset::new(1, 0), 0, 1)],
                prior: &prior,
                aux: &aux,
            },
        );
        learn(
            &mut store,
            right,
            Learned {
                trigger: 0,
                pos: Pos::new(2, 0),
                delta: 1,
                evidence: vec![Inclusion::new(Offset::new(-1, 0), 1, -1)],
                prior: &prior,
                aux: &aux,
            },
        );
        (store, right, prior)
    }

    fn root(grid: &Grid, aux: Vec<i64>) -> WorkingState {
        WorkingState::root(&Observation::new(grid.clone(), aux), Vec::new())
    }

    #[test]
    fn empty_store_predicts_nothing() {
        let mut store = KnowledgeStore::new();
        let right = store.intern_action("right", 1);
        let grid = Grid::from_rows(vec![vec![0, 1, 0]]).unwrap();
        let prediction = predict(&store, &root(&grid, vec![0]), right);

        assert!(prediction.no_rule_found);
        assert_eq!(prediction.state.grid, grid);
        assert!(prediction.state.applied.is_empty());
        assert_eq!(prediction.confidence(), Confidence::Score(0.0));
        assert_eq!(prediction.state.depth, 1);
    }

    #[test]
    fn learned_move_is_predicted() {
        let (store, right, prior) = corridor_store();
        let prediction = predict(&store, &root(&prior, vec![0]), right);

        assert_eq!(prediction.state.grid.rows(), vec![vec![0, 0, 1]]);
        assert_eq!(prediction.state.last_changed, vec![Pos::new(1, 0), Pos::new(2, 0)]);
        assert!(!prediction.no_rule_found);
        // The left floor cell has no rule whose inclusions fit inside the grid.
        assert_eq!(
            prediction.state.applied[&Pos::new(0, 0)].kind,
            CellKind::Placeholder
        );
        assert_eq!(prediction.state.index, crate::observation::ValueIndex::from_grid(&prediction.state.grid));
    }

    #[test]
    fn prediction_is_deterministic() {
        let (store, right, prior) = corridor_store();
        let base = root(&prior, vec![0]);
        let a = predict(&store, &base, right);
        let b = predict(&store, &base, right);
        assert_eq!(a.state.grid, b.state.grid);
        assert_eq!(a.state.applied, b.state.applied);
        assert_eq!(a.state.hash(), b.state.hash());
        assert_eq!(a.confidence(), b.confidence());
    }

    #[test]
    fn exception_fires_on_equal_or_better_match() {
        let (mut store, right, _) = corridor_store();
        let blocked = Grid::from_rows(vec![vec![0, 1, 2]]).unwrap();
        let aux = [AuxChange { pre: 0, delta: 0 }];
        let player = store.lookup_rules(1, right)[0].id;
        let eid = store
            .find_or_create_exception(
                player,
                ExceptionObservation {
                    action: right,
                    pos: Pos::new(1, 0),
                    prior: &blocked,
                    actual: &blocked,
                    aux: &aux,
                    mutual: BTreeSet::new(),
                    step: 1,
                },
            )
            .unwrap();

        let prediction = predict(&store, &root(&blocked, vec![0]), right);
        assert_eq!(prediction.state.grid, blocked);
        let cell = &prediction.state.suppressed[&Pos::new(1, 0)];
        assert_eq!(cell.kind, CellKind::Change(player));
        assert_eq!(cell.guard.exception(), Some(eid));
        assert!(!prediction.no_rule_found);

        // In open floor the same exception scores below the rule and stays quiet.
        let open = Grid::from_rows(vec![vec![0, 1, 0]]).unwrap();
        let prediction = predict(&store, &root(&open, vec![0]), right);
        assert!(prediction.state.suppressed.is_empty());
        assert_eq!(prediction.state.grid.rows(), vec![vec![0, 0, 1]]);
    }

    #[test]
    fn mutual_rules_apply_aux_effect_once() {
        let mut store = KnowledgeStore::new();
        let right = store.intern_action("right", 1);
        let prior = Grid::from_rows(vec![vec![1, 3]]).unwrap();
        let aux = [AuxChange { pre: 0, delta: 1 }];
        let player = learn(
            &mut store,
            right,
            Learned {
                trigger: 1,
                pos: Pos::new(0, 0),
                delta: -1,
                evidence: vec![Inclusion::new(Offset::new(1, 0), 3, -2)],
                prior: &prior,
                aux: &aux,
            },
        );
        let battery = learn(
            &mut store,
            right,
            Learned {
                trigger: 3,
                pos: Pos::new(1, 0),
                delta: -2,
                evidence: vec![Inclusion::new(Offset::new(-1, 0), 1, -1)],
                prior: &prior,
                aux: &aux,
            },
        );

        let unlinked = predict(&store, &root(&prior, vec![0]), right);
        assert_eq!(unlinked.aux_effects, BTreeMap::from([(0, 2)]));

        store.link_mutual(player, battery).unwrap();
        store.link_mutual(battery, player).unwrap();
        let prediction = predict(&store, &root(&prior, vec![0]), right);
        assert_eq!(prediction.state.grid.rows(), vec![vec![0, 1]]);
        assert_eq!(prediction.aux_effects, BTreeMap::from([(0, 1)]));
        assert_eq!(prediction.state.aux, vec![1]);
    }

    #[test]
    fn first_fired_rule_claims_aux_slot_without_effect() {
        let mut store = KnowledgeStore::new();
        let right = store.intern_action("right", 1);
        let prior = Grid::from_rows(vec![vec![1, 3]]).unwrap();
        let player = learn(
            &mut store,
            right,
            Learned {
                trigger: 1,
                pos: Pos::new(0, 0),
                delta: -1,
                evidence: vec![Inclusion::new(Offset::new(1, 0), 3, -2)],
                prior: &prior,
                aux: &[AuxChange { pre: 0, delta: 0 }],
            },
        );
        let battery = learn(
            &mut store,
            right,
            Learned {
                trigger: 3,
                pos: Pos::new(1, 0),
                delta: -2,
                evidence: vec![Inclusion::new(Offset::new(-1, 0), 1, -1)],
                prior: &prior,
                aux: &[AuxChange { pre: 0, delta: 1 }],
            },
        );

        let unlinked = predict(&store, &root(&prior, vec![0]), right);
        assert_eq!(unlinked.aux_effects, BTreeMap::from([(0, 1)]));

        // The player rule fires first and has no aux effect, yet its mutual
        // partner may no longer apply one.
        store.link_mutual(player, battery).unwrap();
        let prediction = predict(&store, &root(&prior, vec![0]), right);
        assert_eq!(prediction.state.grid.rows(), vec![vec![0, 1]]);
        assert!(prediction.aux_effects.is_empty());
        assert_eq!(prediction.state.aux, vec![0]);
    }

    #[test]
    fn tied_no_change_rules_keep_the_last() {
        let (mut store, right, prior) = corridor_store();
        let quiet = learn(
            &mut store,
            right,
            Learned {
                trigger: 0,
                pos: Pos::new(0, 0),
                delta: 0,
                evidence: Vec::new(),
                prior: &prior,
                aux: &[AuxChange { pre: 0, delta: 0 }],
            },
        );
        let first = store.rule(quiet).unwrap().clone();
        let mut second = first.clone();
        second.id = crate::knowledge::RuleId::from_index(first.id.index() + 1);
        let entries: Vec<Candidate<'_>> = [&first, &second]
            .into_iter()
            .map(|rule| Candidate {
                rule,
                score: Score {
                    ratio: 1.0,
                    uncertainty: 0.0,
                },
                guard: Guard::Quiet,
            })
            .collect();
        assert_eq!(select(&entries), Some(1));
    }

    #[test]
    fn seeded_scan_stays_local() {
        let (store, right, _) = corridor_store();
        let wide = Grid::from_rows(vec![vec![0, 1, 0, 0, 0, 0]]).unwrap();
        let obs = Observation::new(wide, vec![0]);
        let base = WorkingState::root(&obs, vec![Pos::new(1, 0)]);
        let prediction = predict(&store, &base, right);

        // Only the seed and its footprint neighbour were examined.
        let examined: Vec<Pos> = prediction.state.applied.keys().copied().collect();
        assert_eq!(examined, vec![Pos::new(1, 0), Pos::new(2, 0)]);
        assert_eq!(prediction.state.grid.rows(), vec![vec![0, 0, 1, 0, 0, 0]]);
    }
}
