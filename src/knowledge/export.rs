//! Export types for serializing learned knowledge.
//!
//! These flatten rules and exceptions into label-resolved records that
//! serialize cleanly to JSON (no position-keyed maps).

use serde::{Deserialize, Serialize};

use super::rule::{AuxCondition, Counts, Inclusion, RuleStatus};
use super::{ExceptionRecord, KnowledgeStore, RuleRecord};
use crate::observation::Symbol;

/// Exported inclusion condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusionExport {
    pub dx: i64,
    pub dy: i64,
    pub expected: Symbol,
    pub delta: i64,
}

/// Exported auxiliary condition on one index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuxExport {
    pub index: usize,
    /// Accepted pre-values; empty means any.
    pub pre: Vec<i64>,
    pub best_delta: Option<i64>,
}

/// Exported rule with resolved action labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleExport {
    pub id: u32,
    pub trigger: Symbol,
    pub group: usize,
    /// `label(output)` of every action the rule was seen under, with its ratio.
    pub actions: Vec<(String, f64)>,
    pub delta: i64,
    pub post: Symbol,
    pub inclusions: Vec<InclusionExport>,
    pub removed: usize,
    /// Restricted positions as `(x,y)`; empty means anywhere.
    pub positions: Vec<String>,
    pub aux: Vec<AuxExport>,
    pub mutual: Vec<u32>,
    pub exceptions: Vec<ExceptionExport>,
    pub seen: u32,
    /// `active`, `broken` or `combined:<id>`.
    pub status: String,
}

/// Exported exception, nested under its parent rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionExport {
    pub id: u32,
    pub ratio: f64,
    pub inclusions: Vec<InclusionExport>,
    pub aux: Vec<AuxExport>,
}

fn inclusions(list: &[Inclusion]) -> Vec<InclusionExport> {
    list.iter()
        .map(|inc| InclusionExport {
            dx: inc.offset.dx,
            dy: inc.offset.dy,
            expected: inc.expected,
            delta: inc.delta,
        })
        .collect()
}

fn aux<'a>(conditions: impl IntoIterator<Item = (&'a usize, &'a AuxCondition)>) -> Vec<AuxExport> {
    conditions
        .into_iter()
        .map(|(index, condition)| AuxExport {
            index: *index,
            pre: condition.pre.keys().copied().collect(),
            best_delta: condition.best_delta(),
        })
        .collect()
}

impl KnowledgeStore {
    /// Export rules, optionally only those triggered by `trigger`.
    pub fn export_rules(&self, trigger: Option<Symbol>) -> Vec<RuleExport> {
        self.rules()
            .filter(|rule| trigger.is_none_or(|t| rule.trigger == t))
            .map(|rule| self.export_rule(rule))
            .collect()
    }

    fn export_rule(&self, rule: &RuleRecord) -> RuleExport {
        let status = match rule.status {
            _ if rule.broken => "broken".to_string(),
            RuleStatus::Active => "active".to_string(),
            RuleStatus::Combined { into } => format!("combined:{}", into.get()),
        };
        RuleExport {
            id: rule.id.get(),
            trigger: rule.trigger,
            group: rule.group,
            actions: rule
                .actions
                .iter()
                .map(|(id, counts)| {
                    let label = self.action(*id).map_or_else(|| id.to_string(), ToString::to_string);
                    (label, counts.ratio())
                })
                .collect(),
            delta: rule.effect.delta,
            post: rule.effect.post,
            inclusions: inclusions(&rule.inclusions),
            removed: rule.removed.len(),
            positions: rule.positions.keys().map(ToString::to_string).collect(),
            aux: aux(&rule.aux),
            mutual: rule.mutual.iter().map(|m| m.get()).collect(),
            exceptions: rule
                .exceptions
                .iter()
                .filter_map(|id| self.exception(*id))
                .map(export_exception)
                .collect(),
            seen: rule.seen,
            status,
        }
    }
}

fn export_exception(exception: &ExceptionRecord) -> ExceptionExport {
    let total = exception
        .actions
        .values()
        .fold(Counts::default(), |acc, c| Counts {
            hits: acc.hits + c.hits,
            total: acc.total + c.total,
        });
    ExceptionExport {
        id: exception.id.get(),
        ratio: total.ratio(),
        inclusions: inclusions(&exception.inclusions),
        aux: aux(&exception.aux),
    }
}
