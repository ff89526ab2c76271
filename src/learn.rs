//! The Rule Learner: compares a prediction with what actually happened and
//! updates the knowledge store.
//!
//! Learning never edits a rule in place to explain a failure. A wrong
//! prediction files an exception under the rule that made it; a correct one
//! reinforces the rule; an unexplained change creates a new condition group.
//! Pruning then drops inclusions that the exceptions show to be irrelevant.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::error::{AirisResult, KnowledgeError};
use crate::knowledge::{
    ActionId, AuxChange, ExceptionId, ExceptionObservation, Inclusion, KnowledgeStore, RuleId,
    RuleObservation,
};
use crate::observation::{Grid, Observation, Pos};
use crate::state::{CellKind, WorkingState};

/// One observed step: the state before, what was predicted, what happened.
#[derive(Debug, Clone, Copy)]
pub struct Transition<'a> {
    pub prior: &'a Observation,
    pub predicted: &'a WorkingState,
    pub actual: &'a Observation,
    pub action: ActionId,
    pub step: u64,
}

/// What one learning pass did to the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LearnReport {
    /// The prediction disagreed with the observation somewhere.
    pub mismatch: bool,
    pub changed_cells: Vec<Pos>,
    pub changed_aux: Vec<usize>,
    /// Rules created or reinforced.
    pub rules: Vec<RuleId>,
    /// Exceptions created, reinforced or contradicted.
    pub exceptions: Vec<ExceptionId>,
    /// Inclusions removed by pruning.
    pub pruned: usize,
    /// Duplicate groups folded together after pruning.
    pub combined: usize,
    /// Rules that lost their last inclusion this step.
    pub broken: Vec<RuleId>,
}

impl std::fmt::Display for LearnReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} cell(s) changed, {} aux; {} rule(s), {} exception(s), {} pruned{}",
            self.changed_cells.len(),
            self.changed_aux.len(),
            self.rules.len(),
            self.exceptions.len(),
            self.pruned,
            if self.mismatch { " [mismatch]" } else { "" }
        )?;
        if !self.broken.is_empty() {
            write!(f, " [{} broken]", self.broken.len())?;
        }
        Ok(())
    }
}

/// Learn from one transition.
///
/// A rule that pruning leaves without conditions is marked broken and listed
/// in [`LearnReport::broken`]; the step still completes, but the store
/// refuses to persist from then on.
pub fn learn(store: &mut KnowledgeStore, t: Transition<'_>) -> AirisResult<LearnReport> {
    let prior = &t.prior.grid;
    let actual = &t.actual.grid;
    let predicted = t.predicted;
    let aux = AuxChange::between(&t.prior.aux, &t.actual.aux);

    let mut report = LearnReport {
        mismatch: predicted.grid != *actual || predicted.aux != t.actual.aux,
        changed_cells: prior.diff(actual),
        changed_aux: aux
            .iter()
            .enumerate()
            .filter(|(_, change)| change.delta != 0)
            .map(|(i, _)| i)
            .collect(),
        ..LearnReport::default()
    };

    // Fired change rules whose trigger and delta explain their own cell.
    let confirmed: BTreeMap<Pos, RuleId> = predicted
        .fired()
        .filter(|(pos, cell)| {
            prior.get(**pos) == Some(cell.value)
                && actual.get(**pos).map(|v| v - cell.value) == Some(cell.delta)
        })
        .filter_map(|(pos, cell)| cell.kind.rule().map(|id| (*pos, id)))
        .collect();
    let confirmed_ids: BTreeSet<RuleId> = confirmed.values().copied().collect();

    let observe = |pos: Pos| ExceptionObservation {
        action: t.action,
        pos,
        prior,
        actual,
        aux: &aux,
        mutual: confirmed_ids.clone(),
        step: t.step,
    };

    let mut exceptions: BTreeSet<ExceptionId> = BTreeSet::new();
    let mut excepted: BTreeSet<(RuleId, Pos)> = BTreeSet::new();
    let mut prune: BTreeSet<(RuleId, Pos)> = BTreeSet::new();

    // Wrong cell predictions.
    let wrong: Vec<(Pos, RuleId)> = predicted
        .fired()
        .filter(|(pos, _)| actual.get(**pos) != predicted.grid.get(**pos))
        .filter_map(|(pos, cell)| cell.kind.rule().map(|id| (*pos, id)))
        .collect();
    for (pos, rule) in wrong {
        if excepted.insert((rule, pos)) {
            let eid = store.find_or_create_exception(rule, observe(pos))?;
            tracing::debug!(%pos, %rule, exception = %eid, "cell prediction failed");
            exceptions.insert(eid);
            prune.insert((rule, pos));
        }
    }

    // Wrong auxiliary predictions.
    for (index, change) in aux.iter().enumerate() {
        if predicted.aux.get(index) == t.actual.aux.get(index) {
            continue;
        }
        let blamed: Vec<(Pos, RuleId)> = predicted
            .fired()
            .filter_map(|(pos, cell)| cell.kind.rule().map(|id| (*pos, id)))
            .filter(|(_, id)| {
                store
                    .rule(*id)
                    .and_then(|r| r.aux_effect(index))
                    .unwrap_or(0)
                    != change.delta
            })
            .collect();
        for (pos, rule) in blamed {
            if excepted.insert((rule, pos)) {
                let eid = store.find_or_create_exception(rule, observe(pos))?;
                tracing::debug!(%pos, %rule, index, exception = %eid, "aux prediction failed");
                exceptions.insert(eid);
                prune.insert((rule, pos));
            }
        }
    }

    // Exceptions that fired: strengthen when right, contradict when wrong.
    let suppressed: Vec<(Pos, RuleId, Option<ExceptionId>)> = predicted
        .suppressed
        .iter()
        .filter_map(|(pos, cell)| cell.kind.rule().map(|id| (*pos, id, cell.guard.exception())))
        .collect();
    for (pos, rule, fired) in suppressed {
        if prior.get(pos) == actual.get(pos) {
            if excepted.insert((rule, pos)) {
                let eid = store.find_or_create_exception(rule, observe(pos))?;
                exceptions.insert(eid);
                prune.insert((rule, pos));
            }
        } else if let Some(eid) = fired {
            store.contradict_exception(eid, t.action)?;
            exceptions.insert(eid);
        }
    }

    // Unexplained changes become (or reinforce) rules.
    let mut changed_rules: Vec<RuleId> = Vec::new();
    for &pos in &report.changed_cells {
        let (Some(before), Some(after)) = (prior.get(pos), actual.get(pos)) else {
            continue;
        };
        let evidence = evidence_for(store, predicted, &confirmed, &report.changed_cells, prior, actual, pos);
        let id = store.find_or_create_rule(RuleObservation {
            trigger: before,
            action: t.action,
            pos,
            delta: after - before,
            post: after,
            evidence,
            prior,
            aux: &aux,
            mutual: confirmed_ids.clone(),
            step: t.step,
        });
        changed_rules.push(id);
        prune.insert((id, pos));
    }

    // Placeholders that stayed put become no-change rules.
    let quiet: Vec<(Pos, i64)> = predicted
        .applied
        .iter()
        .filter(|(_, cell)| cell.kind == CellKind::Placeholder)
        .filter(|(pos, cell)| {
            prior.get(**pos) == Some(cell.value) && actual.get(**pos) == Some(cell.value)
        })
        .map(|(pos, cell)| (*pos, cell.value))
        .collect();
    let mut quiet_rules = Vec::new();
    for (pos, value) in quiet {
        quiet_rules.push(store.find_or_create_rule(RuleObservation {
            trigger: value,
            action: t.action,
            pos,
            delta: 0,
            post: value,
            evidence: Vec::new(),
            prior,
            aux: &aux,
            mutual: BTreeSet::new(),
            step: t.step,
        }));
    }

    for a in &changed_rules {
        for b in &changed_rules {
            store.link_mutual(*a, *b)?;
        }
    }

    let mut broken: BTreeSet<RuleId> = BTreeSet::new();
    for (rule, pos) in prune {
        match store.prune_rule(rule, pos, prior, actual) {
            Ok(0) => {}
            Ok(removed) => {
                report.pruned += removed;
                if store.combine_duplicates(rule)?.is_some() {
                    report.combined += 1;
                }
            }
            Err(KnowledgeError::StructurallyBroken { .. }) => {
                broken.insert(rule);
            }
            Err(err) => return Err(err.into()),
        }
    }
    if !broken.is_empty() {
        tracing::error!(step = t.step, ?broken, "structural break; knowledge can no longer be saved");
    }

    let rules: BTreeSet<RuleId> = changed_rules.into_iter().chain(quiet_rules).collect();
    report.rules = rules.into_iter().collect();
    report.exceptions = exceptions.into_iter().collect();
    report.broken = broken.into_iter().collect();
    tracing::debug!(
        step = t.step,
        changed = report.changed_cells.len(),
        rules = report.rules.len(),
        exceptions = report.exceptions.len(),
        pruned = report.pruned,
        mismatch = report.mismatch,
        "transition learned"
    );
    Ok(report)
}

/// Candidate inclusions for a new rule at `at`.
///
/// Draws on the footprints of confirmed rules, the footprints of rules whose
/// exception fired although the cell changed, and every other changed cell.
fn evidence_for(
    store: &KnowledgeStore,
    predicted: &WorkingState,
    confirmed: &BTreeMap<Pos, RuleId>,
    changed: &[Pos],
    prior: &Grid,
    actual: &Grid,
    at: Pos,
) -> Vec<Inclusion> {
    let relative = |q: Pos| -> Option<Inclusion> {
        if q == at {
            return None;
        }
        let before = prior.get(q)?;
        let after = actual.get(q)?;
        Some(Inclusion::new(at.offset_to(q), before, after - before))
    };
    let footprint = |pos: Pos, rule: RuleId| -> Vec<Inclusion> {
        store
            .rule(rule)
            .map(|r| {
                r.footprint
                    .iter()
                    .filter_map(|inc| prior.resolve(pos, inc.offset))
                    .filter_map(relative)
                    .collect()
            })
            .unwrap_or_default()
    };

    let mut evidence: Vec<Inclusion> = Vec::new();
    for (pos, rule) in confirmed {
        evidence.extend(footprint(*pos, *rule));
    }
    for (pos, cell) in &predicted.suppressed {
        if prior.get(*pos) != actual.get(*pos)
            && let Some(rule) = cell.kind.rule()
        {
            evidence.extend(footprint(*pos, rule));
        }
    }
    evidence.extend(changed.iter().copied().filter_map(relative));

    let mut seen = BTreeSet::new();
    evidence.retain(|inc| seen.insert(*inc));
    evidence
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation::Offset;
    use crate::predict::predict;

    fn obs(row: Vec<i64>) -> Observation {
        Observation::from_rows(vec![row], vec![0]).unwrap()
    }

    fn step(
        store: &mut KnowledgeStore,
        action: ActionId,
        prior: &Observation,
        actual: &Observation,
        n: u64,
    ) -> LearnReport {
        let root = WorkingState::root(prior, Vec::new());
        let predicted = predict(store, &root, action).state;
        learn(
            store,
            Transition {
                prior,
                predicted: &predicted,
                actual,
                action,
                step: n,
            },
        )
        .unwrap()
    }

    #[test]
    fn first_move_creates_linked_rules() {
        let mut store = KnowledgeStore::new();
        let right = store.intern_action("right", 1);
        let report = step(&mut store, right, &obs(vec![0, 1, 0]), &obs(vec![0, 0, 1]), 0);

        assert!(report.mismatch);
        assert_eq!(report.changed_cells, vec![Pos::new(1, 0), Pos::new(2, 0)]);
        assert_eq!(report.rules.len(), 2);
        assert!(report.exceptions.is_empty());

        let player = store.lookup_rules(1, right)[0];
        assert_eq!(player.effect.delta, -1);
        assert_eq!(player.inclusions, vec![Inclusion::new(Offset::new(1, 0), 0, 1)]);
        let floor = store.lookup_rules(0, right)[0];
        assert!(player.mutual.contains(&floor.id));
        assert!(floor.mutual.contains(&player.id));
    }

    #[test]
    fn repeated_transition_collapses_into_one_rule() {
        let mut store = KnowledgeStore::new();
        let right = store.intern_action("right", 1);
        let (before, after) = (obs(vec![0, 1, 0]), obs(vec![0, 0, 1]));
        step(&mut store, right, &before, &after, 0);
        let report = step(&mut store, right, &before, &after, 1);

        assert!(!report.mismatch);
        let movers: Vec<_> = store
            .lookup_rules(1, right)
            .into_iter()
            .filter(|r| !r.is_no_change())
            .collect();
        assert_eq!(movers.len(), 1);
        assert_eq!(movers[0].seen, 2);
        assert_eq!(movers[0].actions[&right].hits, 2);
    }

    #[test]
    fn repeated_mismatch_reuses_exception() {
        let mut store = KnowledgeStore::new();
        let right = store.intern_action("right", 1);
        step(&mut store, right, &obs(vec![0, 1, 0]), &obs(vec![0, 0, 1]), 0);

        let blocked = obs(vec![0, 1, 2]);
        let first = step(&mut store, right, &blocked, &blocked, 1);
        assert!(first.mismatch);
        assert_eq!(first.exceptions.len(), 1);

        let second = step(&mut store, right, &blocked, &blocked, 2);
        assert!(!second.mismatch);
        assert_eq!(second.exceptions, first.exceptions);
        assert_eq!(store.exception(first.exceptions[0]).unwrap().seen, 2);
        assert_eq!(store.stats().exceptions, 1);
    }

    #[test]
    fn stuck_move_breaks_rules_but_finishes_learning() {
        let mut store = KnowledgeStore::new();
        let right = store.intern_action("right", 1);
        step(&mut store, right, &obs(vec![0, 1, 0]), &obs(vec![0, 0, 1]), 0);

        // Same neighbourhood, nothing moves: both movers lose their only condition.
        let stuck = obs(vec![0, 1, 0]);
        let report = step(&mut store, right, &stuck, &stuck, 1);
        assert!(report.mismatch);
        assert_eq!(report.broken.len(), 2);
        assert_eq!(report.exceptions.len(), 2);
        assert!(report.to_string().ends_with("[2 broken]"));
        for id in &report.broken {
            let rule = store.rule(*id).unwrap();
            assert!(rule.broken);
            assert!(rule.inclusions.is_empty());
        }
        assert_eq!(store.stats().broken, 2);
        assert!(store.to_bytes().is_err());

        // Broken rules no longer predict, and a further step reports nothing new.
        let report = step(&mut store, right, &stuck, &stuck, 2);
        assert!(report.broken.is_empty());
    }

    #[test]
    fn contradicted_exception_loses_confidence() {
        let mut store = KnowledgeStore::new();
        let right = store.intern_action("right", 1);
        step(&mut store, right, &obs(vec![0, 1, 0]), &obs(vec![0, 0, 1]), 0);
        let blocked = obs(vec![0, 1, 2]);
        let report = step(&mut store, right, &blocked, &blocked, 1);
        let eid = report.exceptions[0];

        // The "wall" turns out to be passable this time.
        let report = step(&mut store, right, &blocked, &obs(vec![0, 0, 1]), 2);
        assert!(report.mismatch);
        assert!(report.exceptions.contains(&eid));
        let exception = store.exception(eid).unwrap();
        assert_eq!(exception.contradictions, 1);
        assert!(exception.actions[&right].ratio() < 1.0);
    }

    #[test]
    fn aux_change_is_recorded_on_rules() {
        let mut store = KnowledgeStore::new();
        let right = store.intern_action("right", 1);
        let before = Observation::from_rows(vec![vec![1, 3]], vec![0]).unwrap();
        let after = Observation::from_rows(vec![vec![0, 1]], vec![1]).unwrap();
        let report = step(&mut store, right, &before, &after, 0);

        assert_eq!(report.changed_aux, vec![0]);
        let rule = store.lookup_rules(3, right)[0];
        assert_eq!(rule.aux_effect(0), Some(1));
        assert_eq!(
            store
                .rules_with_aux_effect(0, crate::knowledge::Direction::Increase)
                .len(),
            2
        );
    }
}
