// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # airis
//!
//! An online rule-learning agent. It watches a grid of symbols plus a vector
//! of auxiliary values, induces causal rules from every observed transition,
//! predicts the outcome of candidate actions with those rules, and plans
//! toward configured goals with a best-first search over predicted futures.
//!
//! ## Architecture
//!
//! - **Knowledge store** (`knowledge`): arena of rules and exceptions with trigger and aux indexes
//! - **Observation model** (`observation`, `state`): grids, value indexes, working states
//! - **Predictor** (`predict`): applies matching rules to a state under an action
//! - **Rule learner** (`learn`): compares predictions with reality and updates knowledge
//! - **Comparator** (`compare`): distance from a state to a goal
//! - **Planner** (`plan`): confident/uncertain frontier search with fallbacks
//! - **Agent** (`agent`): the `observe_before` / `observe_after` step protocol
//! - **Vault** (`store`): knowledge snapshots in redb
//!
//! ## Library usage
//!
//! ```no_run
//! use airis::agent::Agent;
//! use airis::config::AgentConfig;
//! use airis::observation::Observation;
//!
//! let mut agent = Agent::new(AgentConfig::default()).unwrap();
//! let before = Observation::from_rows(vec![vec![1, 0, 0]], vec![0]).unwrap();
//! let decision = agent.observe_before(&before).unwrap();
//! // ... act in the environment ...
//! let after = Observation::from_rows(vec![vec![0, 1, 0]], vec![0]).unwrap();
//! agent.observe_after(&after, decision.action).unwrap();
//! ```

pub mod agent;
pub mod compare;
pub mod config;
pub mod error;
pub mod knowledge;
pub mod learn;
pub mod observation;
pub mod plan;
pub mod predict;
pub mod sandbox;
pub mod state;
pub mod store;
