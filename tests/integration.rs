//! End-to-end tests of the airis step protocol.
//!
//! These drive the agent through `observe_before` / `observe_after` the way
//! an environment would, checking the scenarios that tie the Predictor,
//! Rule Learner and Planner together.

use airis::agent::Agent;
use airis::config::{ActionSpec, AgentConfig};
use airis::error::{AgentError, AirisError, KnowledgeError};
use airis::observation::Observation;
use airis::plan::{PlanKind, PlannerConfig};
use airis::sandbox::{self, GridWorld};

fn line(row: Vec<i64>) -> Observation {
    Observation::from_rows(vec![row], vec![0]).unwrap()
}

fn line_agent() -> Agent {
    Agent::new(AgentConfig {
        actions: vec![ActionSpec::new("left"), ActionSpec::new("right")],
        ..AgentConfig::default()
    })
    .unwrap()
}

#[test]
fn empty_store_first_step_explores() {
    let world = GridWorld::new(6, 5, 2, 9);
    let mut agent = Agent::new(GridWorld::config()).unwrap();
    let decision = agent.observe_before(&world.observation()).unwrap();

    assert_eq!(decision.kind, PlanKind::Explore);
    assert!(decision.no_rule_found);
    assert_eq!(decision.label, "up");
    assert!(agent.store().is_empty());
}

#[test]
fn repeated_transition_collapses_into_one_rule_per_cell() {
    let mut agent = line_agent();
    let right = agent.action_id("right", 1).unwrap();

    for _ in 0..2 {
        agent.predict_action(&line(vec![1, 0, 0]), "right", 1).unwrap();
        agent.observe_after(&line(vec![0, 1, 0]), right).unwrap();
    }

    let stats = agent.store().stats();
    assert_eq!(stats.rules, 2);
    assert!(agent.store().rules().all(|rule| rule.seen == 2));
}

#[test]
fn repeated_mismatch_reuses_exception() {
    let mut agent = line_agent();
    let right = agent.action_id("right", 1).unwrap();
    agent.predict_action(&line(vec![0, 1, 0]), "right", 1).unwrap();
    agent.observe_after(&line(vec![0, 0, 1]), right).unwrap();

    // A wall blocks the same move.
    let blocked = line(vec![0, 1, 2]);
    agent.predict_action(&blocked, "right", 1).unwrap();
    let first = agent.observe_after(&blocked, right).unwrap();
    assert!(first.mismatch);
    assert_eq!(first.exceptions.len(), 1);

    let prediction = agent.predict_action(&blocked, "right", 1).unwrap();
    assert_eq!(prediction.state.grid, blocked.grid);
    let second = agent.observe_after(&blocked, right).unwrap();
    assert!(!second.mismatch);
    assert_eq!(second.exceptions, first.exceptions);
    assert_eq!(agent.store().stats().exceptions, 1);
}

#[test]
fn same_seed_same_episode() {
    let run = || {
        let mut world = GridWorld::new(7, 6, 2, 21);
        let mut agent = Agent::new(GridWorld::config()).unwrap();
        let summary = sandbox::run(&mut agent, &mut world, 60).unwrap();
        (summary, agent.store().export_rules(None))
    };
    let (a, rules_a) = run();
    let (b, rules_b) = run();
    assert_eq!(a, b);
    assert_eq!(rules_a, rules_b);
}

#[test]
fn tiny_planning_budget_still_terminates() {
    let config = AgentConfig {
        planner: PlannerConfig {
            plan_depth: 1,
            budget_increment: 1,
            ..PlannerConfig::default()
        },
        ..GridWorld::config()
    };
    let mut world = GridWorld::new(6, 5, 2, 4);
    let mut agent = Agent::new(config).unwrap();
    let summary = sandbox::run(&mut agent, &mut world, 40).unwrap();
    assert_eq!(summary.steps, 40);
    assert!(agent.store().planning_budget().is_some_and(|b| b > 1));
}

#[test]
fn agent_learns_to_walk_the_sandbox() {
    let mut world = GridWorld::new(8, 6, 2, 5);
    let mut agent = Agent::new(GridWorld::config()).unwrap();
    let summary = sandbox::run(&mut agent, &mut world, 150).unwrap();

    // Learned moves make later steps predictable.
    assert!(summary.mismatches < summary.steps);
    assert!(summary.rules > 0);
    assert!(agent.store().knows_value(sandbox::PLAYER));
}

#[test]
fn long_episodes_finish_on_every_seed() {
    for seed in 0..40 {
        let mut world = GridWorld::new(8, 6, 2, seed);
        let mut agent = Agent::new(GridWorld::config()).unwrap();
        let summary = sandbox::run(&mut agent, &mut world, 300)
            .unwrap_or_else(|err| panic!("seed {seed}: {err}"));
        assert_eq!(summary.steps, 300, "seed {seed}");
        assert_eq!(agent.time_step(), 300, "seed {seed}");
        // A break only ever blocks saving.
        assert_eq!(agent.store().to_bytes().is_ok(), summary.broken == 0, "seed {seed}");
    }
}

#[test]
fn stuck_move_breaks_rules_without_aborting() {
    let mut agent = line_agent();
    let right = agent.action_id("right", 1).unwrap();
    agent.predict_action(&line(vec![1, 0, 0]), "right", 1).unwrap();
    agent.observe_after(&line(vec![0, 1, 0]), right).unwrap();

    agent.predict_action(&line(vec![1, 0, 0]), "right", 1).unwrap();
    let report = agent.observe_after(&line(vec![1, 0, 0]), right).unwrap();
    assert!(report.mismatch);
    assert_eq!(report.broken.len(), 2);
    assert_eq!(agent.time_step(), 2);
    assert!(matches!(
        agent.store().to_bytes(),
        Err(AirisError::Knowledge(KnowledgeError::Corrupted { count: 2 }))
    ));
}

#[test]
fn observations_must_keep_their_shape() {
    let mut agent = line_agent();
    agent.observe_before(&line(vec![1, 0, 0])).unwrap();
    let err = agent
        .observe_after(&Observation::from_rows(vec![vec![0, 1, 0]], vec![0, 0]).unwrap(), agent.actions()[0])
        .unwrap_err();
    assert!(matches!(
        err,
        AirisError::Agent(AgentError::AuxLength { expected: 1, actual: 2 })
    ));
}
