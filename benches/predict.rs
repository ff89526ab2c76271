//! Benchmarks for prediction and planning over a trained store.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use airis::agent::Agent;
use airis::plan::{History, Planner};
use airis::predict::predict;
use airis::sandbox::{self, GridWorld};
use airis::state::{StateArena, WorkingState};

/// An agent that has walked the sandbox for a while, and the world it left.
fn trained() -> (Agent, GridWorld) {
    let mut world = GridWorld::new(10, 8, 3, 7);
    let mut agent = Agent::new(GridWorld::config()).unwrap();
    sandbox::run(&mut agent, &mut world, 300).unwrap();
    (agent, world)
}

fn bench_predict(c: &mut Criterion) {
    let (agent, world) = trained();
    let root = WorkingState::root(&world.observation(), Vec::new());
    let action = agent.actions()[3];

    c.bench_function("predict_full_scan_10x8", |bench| {
        bench.iter(|| black_box(predict(agent.store(), &root, action)))
    });
}

fn bench_plan(c: &mut Criterion) {
    let (agent, world) = trained();
    let root = WorkingState::root(&world.observation(), Vec::new());

    c.bench_function("plan_10x8", |bench| {
        bench.iter(|| {
            let planner = Planner {
                store: agent.store(),
                config: &agent.config().planner,
                goals: &agent.config().goals,
                actions: agent.actions(),
            };
            let mut arena = StateArena::new();
            let mut history = History::default();
            let mut budget = 200;
            black_box(planner.plan(root.clone(), &mut arena, &mut history, &mut budget))
        })
    });
}

criterion_group!(benches, bench_predict, bench_plan);
criterion_main!(benches);
