//! The knowledge store: every learned rule and exception, plus the indexes
//! the Predictor and Comparator query.
//!
//! Records live in two arenas addressed by [`RuleId`] and [`ExceptionId`].
//! Only the Rule Learner mutates the store; planning borrows it immutably, so
//! ids stay stable for the duration of a planning episode.

pub mod export;
pub mod rule;
pub mod snapshot;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{KnowledgeError, KnowledgeResult};
use crate::observation::{Grid, Pos, Symbol};

pub use rule::{
    ActionId, ActionLabel, AuxChange, AuxCondition, Counts, Direction, Effect, ExceptionId,
    ExceptionRecord, Inclusion, RuleId, RuleRecord, RuleStatus, similarity,
};
use rule::{AuxFit, aux_fit, aux_keys_equal, merge_aux};

/// Evidence for one changed (or confirmed unchanged) cell.
#[derive(Debug, Clone)]
pub struct RuleObservation<'a> {
    pub trigger: Symbol,
    pub action: ActionId,
    pub pos: Pos,
    pub delta: i64,
    pub post: Symbol,
    /// Candidate inclusion conditions, relative to `pos`.
    pub evidence: Vec<Inclusion>,
    pub prior: &'a Grid,
    pub aux: &'a [AuxChange],
    pub mutual: BTreeSet<RuleId>,
    pub step: u64,
}

/// Evidence that a rule's effect did not occur at `pos`.
#[derive(Debug, Clone)]
pub struct ExceptionObservation<'a> {
    pub action: ActionId,
    pub pos: Pos,
    pub prior: &'a Grid,
    pub actual: &'a Grid,
    pub aux: &'a [AuxChange],
    pub mutual: BTreeSet<RuleId>,
    pub step: u64,
}

/// Summary statistics about the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KnowledgeStats {
    pub rules: usize,
    pub active_rules: usize,
    pub no_change_rules: usize,
    pub exceptions: usize,
    pub triggers: usize,
    pub actions: usize,
    pub broken: usize,
}

impl std::fmt::Display for KnowledgeStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "airis knowledge store")?;
        writeln!(
            f,
            "  rules:      {} ({} active, {} no-change)",
            self.rules, self.active_rules, self.no_change_rules
        )?;
        writeln!(f, "  exceptions: {}", self.exceptions)?;
        writeln!(f, "  triggers:   {}", self.triggers)?;
        writeln!(f, "  actions:    {}", self.actions)?;
        write!(f, "  broken:     {}", self.broken)
    }
}

/// Arena-backed rule store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnowledgeStore {
    rules: Vec<RuleRecord>,
    exceptions: Vec<ExceptionRecord>,
    actions: Vec<ActionLabel>,
    planning_budget: Option<usize>,
    #[serde(skip)]
    by_trigger: BTreeMap<Symbol, Vec<RuleId>>,
    #[serde(skip)]
    by_trigger_action: HashMap<(Symbol, ActionId), Vec<RuleId>>,
    #[serde(skip)]
    by_aux_effect: BTreeMap<usize, BTreeSet<RuleId>>,
    #[serde(skip)]
    action_ids: HashMap<ActionLabel, ActionId>,
}

impl KnowledgeStore {
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Actions
    // -----------------------------------------------------------------------

    /// Intern a `(label, output)` action, returning its stable id.
    pub fn intern_action(&mut self, label: &str, output: i64) -> ActionId {
        let key = ActionLabel {
            label: label.to_string(),
            output,
        };
        if let Some(id) = self.action_ids.get(&key) {
            return *id;
        }
        let id = ActionId::from_index(self.actions.len());
        self.actions.push(key.clone());
        self.action_ids.insert(key, id);
        id
    }

    pub fn action_id(&self, label: &str, output: i64) -> Option<ActionId> {
        self.action_ids
            .get(&ActionLabel {
                label: label.to_string(),
                output,
            })
            .copied()
    }

    pub fn action(&self, id: ActionId) -> Option<&ActionLabel> {
        self.actions.get(id.index())
    }

    pub fn actions(&self) -> impl Iterator<Item = (ActionId, &ActionLabel)> {
        self.actions
            .iter()
            .enumerate()
            .map(|(i, a)| (ActionId::from_index(i), a))
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn rule(&self, id: RuleId) -> Option<&RuleRecord> {
        self.rules.get(id.index())
    }

    pub fn exception(&self, id: ExceptionId) -> Option<&ExceptionRecord> {
        self.exceptions.get(id.index())
    }

    pub fn rules(&self) -> impl Iterator<Item = &RuleRecord> {
        self.rules.iter()
    }

    pub fn exceptions(&self) -> impl Iterator<Item = &ExceptionRecord> {
        self.exceptions.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether any rule, under any action, is filed under `value`.
    pub fn knows_value(&self, value: Symbol) -> bool {
        self.by_trigger.contains_key(&value)
    }

    /// Whether any rule was learned under `action`.
    pub fn knows_action(&self, action: ActionId) -> bool {
        self.by_trigger_action.keys().any(|(_, a)| *a == action)
    }

    /// Every rule filed under `value` for `action`, combined ones included.
    pub fn lookup_rules(&self, value: Symbol, action: ActionId) -> Vec<&RuleRecord> {
        self.by_trigger_action
            .get(&(value, action))
            .map(|ids| ids.iter().filter_map(|id| self.rule(*id)).collect())
            .unwrap_or_default()
    }

    /// The condition group `rule` if it is filed under `value`.
    pub fn lookup_condition_group(&self, value: Symbol, rule: RuleId) -> Option<&RuleRecord> {
        self.rule(rule).filter(|r| r.trigger == value)
    }

    /// Active rules whose best auxiliary effect on `index` points in `direction`.
    pub fn rules_with_aux_effect(&self, index: usize, direction: Direction) -> Vec<&RuleRecord> {
        self.by_aux_effect
            .get(&index)
            .into_iter()
            .flatten()
            .filter_map(|id| self.rule(*id))
            .filter(|r| r.is_active())
            .filter(|r| r.aux_effect(index).and_then(Direction::of) == Some(direction))
            .collect()
    }

    pub fn broken_rules(&self) -> impl Iterator<Item = &RuleRecord> {
        self.rules.iter().filter(|r| r.broken)
    }

    pub fn planning_budget(&self) -> Option<usize> {
        self.planning_budget
    }

    pub fn set_planning_budget(&mut self, budget: usize) {
        self.planning_budget = Some(budget);
    }

    pub fn stats(&self) -> KnowledgeStats {
        KnowledgeStats {
            rules: self.rules.len(),
            active_rules: self.rules.iter().filter(|r| r.is_active()).count(),
            no_change_rules: self.rules.iter().filter(|r| r.is_no_change()).count(),
            exceptions: self.exceptions.len(),
            triggers: self.by_trigger.len(),
            actions: self.actions.len(),
            broken: self.broken_rules().count(),
        }
    }

    // -----------------------------------------------------------------------
    // Learning
    // -----------------------------------------------------------------------

    /// Deduplicate `obs` into an existing rule, or file a new one.
    ///
    /// A rule matches when it is active, was learned under the same action,
    /// has the same effect delta, every one of its inclusions holds in the
    /// prior grid, and its auxiliary deltas agree with the observed ones.
    /// No-change rules match on action and delta alone.
    pub fn find_or_create_rule(&mut self, obs: RuleObservation<'_>) -> RuleId {
        let candidates = self
            .by_trigger_action
            .get(&(obs.trigger, obs.action))
            .cloned()
            .unwrap_or_default();

        for id in candidates {
            let rule = &self.rules[id.index()];
            if !rule.is_active() || rule.effect.delta != obs.delta {
                continue;
            }
            let fit = if obs.delta == 0 {
                AuxFit::Exact
            } else {
                let inclusions_hold = rule
                    .inclusions
                    .iter()
                    .all(|inc| obs.prior.value_at(obs.pos, inc.offset) == Some(inc.expected));
                if !inclusions_hold {
                    continue;
                }
                match aux_fit(&rule.aux, obs.aux) {
                    AuxFit::Differs => continue,
                    fit => fit,
                }
            };

            let rule = &mut self.rules[id.index()];
            merge_aux(&mut rule.aux, obs.aux, &fit);
            rule.actions
                .entry(obs.action)
                .and_modify(Counts::hit)
                .or_insert_with(Counts::first);
            narrow_positions(&mut rule.positions, obs.pos);
            rule.mutual.extend(obs.mutual.iter().filter(|m| **m != id));
            rule.seen += 1;
            rule.last_step = obs.step;
            tracing::debug!(rule = %id, trigger = obs.trigger, pos = %obs.pos, seen = rule.seen, "rule reinforced");
            return id;
        }

        let id = RuleId::from_index(self.rules.len());
        let group = self.by_trigger.get(&obs.trigger).map_or(0, Vec::len);
        let (inclusions, aux, mutual) = if obs.delta == 0 {
            (Vec::new(), BTreeMap::new(), BTreeSet::new())
        } else {
            let mut seen_offsets = BTreeSet::new();
            let inclusions: Vec<Inclusion> = obs
                .evidence
                .iter()
                .filter(|inc| !inc.offset.is_zero() && seen_offsets.insert(inc.offset))
                .copied()
                .collect();
            let aux = obs
                .aux
                .iter()
                .enumerate()
                .map(|(i, change)| (i, AuxCondition::observed(*change)))
                .collect();
            let mutual = obs.mutual.iter().copied().filter(|m| *m != id).collect();
            (inclusions, aux, mutual)
        };

        let record = RuleRecord {
            id,
            trigger: obs.trigger,
            group,
            actions: BTreeMap::from([(obs.action, Counts::first())]),
            effect: Effect {
                delta: obs.delta,
                post: obs.post,
            },
            footprint: inclusions.iter().copied().collect(),
            inclusions,
            removed: Vec::new(),
            positions: BTreeMap::from([(obs.pos, Counts::first())]),
            aux,
            mutual,
            exceptions: Vec::new(),
            created_step: obs.step,
            last_step: obs.step,
            seen: 1,
            status: RuleStatus::Active,
            broken: false,
        };
        tracing::debug!(
            rule = %id,
            trigger = obs.trigger,
            delta = obs.delta,
            inclusions = record.inclusions.len(),
            pos = %obs.pos,
            "rule created"
        );
        self.index_rule(&record);
        self.rules.push(record);
        id
    }

    /// Deduplicate `obs` into an exception of `rule`, or file a new one.
    ///
    /// Exception inclusions that fall outside the grid count as matching.
    pub fn find_or_create_exception(
        &mut self,
        rule: RuleId,
        obs: ExceptionObservation<'_>,
    ) -> KnowledgeResult<ExceptionId> {
        let existing = self
            .rule(rule)
            .ok_or(KnowledgeError::RuleNotFound { rule: rule.get() })?
            .exceptions
            .clone();

        for eid in existing {
            let exception = &self.exceptions[eid.index()];
            if !exception.actions.contains_key(&obs.action) {
                continue;
            }
            let inclusions_hold = exception.inclusions.iter().all(|inc| {
                obs.prior
                    .value_at(obs.pos, inc.offset)
                    .is_none_or(|v| v == inc.expected)
            });
            if !inclusions_hold {
                continue;
            }
            let fit = match aux_fit(&exception.aux, obs.aux) {
                AuxFit::Differs => continue,
                fit => fit,
            };

            let exception = &mut self.exceptions[eid.index()];
            merge_aux(&mut exception.aux, obs.aux, &fit);
            if let Some(counts) = exception.actions.get_mut(&obs.action) {
                counts.hit();
            }
            narrow_positions(&mut exception.positions, obs.pos);
            exception.mutual.extend(obs.mutual.iter().copied());
            exception.seen += 1;
            exception.last_step = obs.step;
            tracing::debug!(exception = %eid, %rule, pos = %obs.pos, seen = exception.seen, "exception reinforced");
            return Ok(eid);
        }

        let inclusions = self.rules[rule.index()]
            .inclusions
            .iter()
            .filter_map(|inc| {
                let at = obs.prior.resolve(obs.pos, inc.offset)?;
                let before = obs.prior.get(at)?;
                let after = obs.actual.get(at)?;
                Some(Inclusion::new(inc.offset, before, after - before))
            })
            .collect();

        let eid = ExceptionId::from_index(self.exceptions.len());
        self.exceptions.push(ExceptionRecord {
            id: eid,
            parent: rule,
            actions: BTreeMap::from([(obs.action, Counts::first())]),
            inclusions,
            removed: Vec::new(),
            positions: BTreeMap::from([(obs.pos, Counts::first())]),
            aux: obs
                .aux
                .iter()
                .enumerate()
                .map(|(i, change)| (i, AuxCondition::observed(*change)))
                .collect(),
            mutual: obs.mutual,
            created_step: obs.step,
            last_step: obs.step,
            seen: 1,
            contradictions: 0,
        });
        self.rules[rule.index()].exceptions.push(eid);
        tracing::debug!(exception = %eid, %rule, pos = %obs.pos, "exception created");
        Ok(eid)
    }

    /// Record that `exception` suppressed a change that happened anyway.
    pub fn contradict_exception(
        &mut self,
        exception: ExceptionId,
        action: ActionId,
    ) -> KnowledgeResult<()> {
        let record = self
            .exceptions
            .get_mut(exception.index())
            .ok_or(KnowledgeError::ExceptionNotFound {
                exception: exception.get(),
            })?;
        record.actions.entry(action).or_default().miss();
        record.contradictions += 1;
        tracing::debug!(%exception, contradictions = record.contradictions, "exception contradicted");
        Ok(())
    }

    /// Record that `other` co-fired with `rule` and explained its own cell.
    pub fn link_mutual(&mut self, rule: RuleId, other: RuleId) -> KnowledgeResult<()> {
        if rule == other {
            return Ok(());
        }
        if self.rule(other).is_none() {
            return Err(KnowledgeError::RuleNotFound { rule: other.get() });
        }
        let record = self
            .rules
            .get_mut(rule.index())
            .ok_or(KnowledgeError::RuleNotFound { rule: rule.get() })?;
        record.mutual.insert(other);
        Ok(())
    }

    /// Drop inclusions of `rule` that one of its exceptions shows to be irrelevant.
    ///
    /// An inclusion with a non-zero delta is dropped, together with the
    /// matching exception inclusion, when an exception with identical
    /// auxiliary conditions (values and counts) holds the same offset and expected value, that
    /// value is present in `prior` at `pos + offset`, and the cell there did
    /// not change in `actual`. Returns the number of inclusions removed.
    ///
    /// Emptying the inclusion set marks the rule broken and fails with
    /// [`KnowledgeError::StructurallyBroken`]. A rule already broken has
    /// nothing left to prune.
    pub fn prune_rule(
        &mut self,
        rule: RuleId,
        pos: Pos,
        prior: &Grid,
        actual: &Grid,
    ) -> KnowledgeResult<usize> {
        let record = self
            .rules
            .get(rule.index())
            .ok_or(KnowledgeError::RuleNotFound { rule: rule.get() })?;
        if record.broken {
            return Ok(0);
        }

        let candidates: Vec<Inclusion> = record
            .inclusions
            .iter()
            .filter(|inc| inc.delta != 0)
            .filter(|inc| {
                prior.resolve(pos, inc.offset).is_some_and(|at| {
                    prior.get(at) == Some(inc.expected) && actual.get(at) == prior.get(at)
                })
            })
            .copied()
            .collect();
        let exception_ids = record.exceptions.clone();

        let mut removed = 0;
        for inclusion in candidates {
            for eid in &exception_ids {
                let rule_aux = &self.rules[rule.index()].aux;
                let exception = &mut self.exceptions[eid.index()];
                if *rule_aux != exception.aux {
                    continue;
                }
                let Some(k) = exception.inclusions.iter().position(|e| {
                    e.offset == inclusion.offset && e.expected == inclusion.expected
                }) else {
                    continue;
                };
                let dropped = exception.inclusions.remove(k);
                exception.removed.push(dropped);

                let record = &mut self.rules[rule.index()];
                if let Some(k) = record.inclusions.iter().position(|r| *r == inclusion) {
                    record.inclusions.remove(k);
                    record.removed.push(inclusion);
                    removed += 1;
                }
            }
        }

        let record = &mut self.rules[rule.index()];
        if removed > 0 {
            tracing::debug!(%rule, removed, remaining = record.inclusions.len(), "pruned inclusions");
        }
        if removed > 0 && record.inclusions.is_empty() {
            record.broken = true;
            tracing::warn!(%rule, trigger = record.trigger, "rule lost its last inclusion condition");
            return Err(KnowledgeError::StructurallyBroken {
                rule: rule.get(),
                trigger: record.trigger,
            });
        }
        Ok(removed)
    }

    /// Merge `rule` into an older active duplicate, if pruning produced one.
    ///
    /// Two rules are duplicates when they share trigger, action, effect delta,
    /// active inclusion set and auxiliary condition keys. The newer record is
    /// marked [`RuleStatus::Combined`] and its counts fold into the older one.
    pub fn combine_duplicates(&mut self, rule: RuleId) -> KnowledgeResult<Option<RuleId>> {
        let record = self
            .rule(rule)
            .ok_or(KnowledgeError::RuleNotFound { rule: rule.get() })?;
        if !record.is_active() {
            return Ok(None);
        }
        let Some(action) = record.primary_action() else {
            return Ok(None);
        };
        let inclusions: BTreeSet<Inclusion> = record.inclusions.iter().copied().collect();
        let twin = self
            .by_trigger_action
            .get(&(record.trigger, action))
            .into_iter()
            .flatten()
            .copied()
            .filter(|other| *other != rule)
            .filter_map(|other| self.rule(other))
            .find(|other| {
                other.is_active()
                    && other.effect.delta == record.effect.delta
                    && other.inclusions.iter().copied().collect::<BTreeSet<_>>() == inclusions
                    && aux_keys_equal(&other.aux, &record.aux)
            })
            .map(|other| other.id);
        let Some(twin) = twin else {
            return Ok(None);
        };

        let (keep, drop) = if twin < rule { (twin, rule) } else { (rule, twin) };
        let dropped = self.rules[drop.index()].clone();
        let kept = &mut self.rules[keep.index()];
        for (action, counts) in &dropped.actions {
            let entry = kept.actions.entry(*action).or_default();
            entry.hits += counts.hits;
            entry.total += counts.total;
        }
        kept.seen += dropped.seen;
        kept.last_step = kept.last_step.max(dropped.last_step);
        kept.mutual.extend(dropped.mutual.iter().filter(|m| **m != keep));
        kept.positions.clear();
        self.rules[drop.index()].status = RuleStatus::Combined { into: keep };
        tracing::debug!(%keep, %drop, "combined duplicate rules");
        Ok(Some(keep))
    }

    /// Mark `rule` as merged into `into`.
    pub fn mark_combined(&mut self, rule: RuleId, into: RuleId) -> KnowledgeResult<()> {
        if self.rule(into).is_none() {
            return Err(KnowledgeError::RuleNotFound { rule: into.get() });
        }
        let record = self
            .rules
            .get_mut(rule.index())
            .ok_or(KnowledgeError::RuleNotFound { rule: rule.get() })?;
        record.status = RuleStatus::Combined { into };
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Indexes
    // -----------------------------------------------------------------------

    fn index_rule(&mut self, record: &RuleRecord) {
        self.by_trigger
            .entry(record.trigger)
            .or_default()
            .push(record.id);
        for action in record.actions.keys() {
            self.by_trigger_action
                .entry((record.trigger, *action))
                .or_default()
                .push(record.id);
        }
        for (index, condition) in &record.aux {
            if condition.deltas.keys().any(|d| *d != 0) {
                self.by_aux_effect
                    .entry(*index)
                    .or_default()
                    .insert(record.id);
            }
        }
    }

    /// Rebuild every derived index from the arenas.
    pub(crate) fn reindex(&mut self) {
        self.by_trigger.clear();
        self.by_trigger_action.clear();
        self.by_aux_effect.clear();
        self.action_ids = self
            .actions
            .iter()
            .enumerate()
            .map(|(i, a)| (a.clone(), ActionId::from_index(i)))
            .collect();
        let rules = std::mem::take(&mut self.rules);
        for record in &rules {
            self.index_rule(record);
        }
        self.rules = rules;
    }
}

/// Keep an absolute-position restriction only while observations stay inside it.
fn narrow_positions(positions: &mut BTreeMap<Pos, Counts>, pos: Pos) {
    match positions.get_mut(&pos) {
        Some(counts) => counts.hit(),
        None => positions.clear(),
    }
}
