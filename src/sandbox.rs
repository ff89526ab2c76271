//! A small deterministic grid world to drive the agent against.
//!
//! The player walks a walled room collecting batteries. Each battery
//! collected raises auxiliary value 0 by one and a new battery appears on the
//! first floor cell in scan order. Only the layout comes from a seeded
//! [`StdRng`]; once built, the world is a pure function of its grid.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use serde::Serialize;

use crate::agent::Agent;
use crate::compare::Goal;
use crate::config::{ActionSpec, AgentConfig};
use crate::error::AirisResult;
use crate::knowledge::Direction;
use crate::observation::{Grid, Observation, Offset, Pos, Scalar, Symbol};
use crate::plan::PlanKind;

pub const FLOOR: Symbol = 0;
pub const PLAYER: Symbol = 1;
pub const WALL: Symbol = 2;
pub const BATTERY: Symbol = 3;

/// Outcome of one sandbox move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Move {
    Walked,
    Blocked,
    Charged,
}

#[derive(Debug, Clone)]
pub struct GridWorld {
    grid: Grid,
    player: Pos,
    charge: Scalar,
    rng: StdRng,
}

impl GridWorld {
    /// A `width` x `height` room (walls included) with `batteries` batteries
    /// and a few interior walls. Dimensions below 3 are raised to 3.
    pub fn new(width: usize, height: usize, batteries: usize, seed: u64) -> Self {
        let (width, height) = (width.max(3), height.max(3));
        let rng = StdRng::seed_from_u64(seed);
        let mut grid = Grid::filled(width, height, FLOOR);
        for pos in grid.positions().collect::<Vec<_>>() {
            if pos.x == 0 || pos.y == 0 || pos.x == width - 1 || pos.y == height - 1 {
                grid.set(pos, WALL);
            }
        }

        let mut world = Self {
            grid,
            player: Pos::new(1, 1),
            charge: 0,
            rng,
        };
        world.grid.set(world.player, PLAYER);
        let interior = (width - 2) * (height - 2);
        for _ in 0..interior / 8 {
            world.place(WALL);
        }
        for _ in 0..batteries {
            world.place(BATTERY);
        }
        world
    }

    /// The agent configuration this world expects: four moves, charge goal.
    pub fn config() -> AgentConfig {
        AgentConfig {
            name: "sandbox".into(),
            actions: ["up", "down", "left", "right"].into_iter().map(ActionSpec::new).collect(),
            goals: vec![Goal::Aux {
                index: 0,
                direction: Direction::Increase,
            }],
            ..AgentConfig::default()
        }
    }

    pub fn observation(&self) -> Observation {
        Observation::new(self.grid.clone(), vec![self.charge])
    }

    pub fn player(&self) -> Pos {
        self.player
    }

    pub fn charge(&self) -> Scalar {
        self.charge
    }

    /// Apply a move by label. Unknown labels and walls leave the world as is.
    pub fn step(&mut self, label: &str) -> Move {
        let offset = match label {
            "up" => Offset::new(0, -1),
            "down" => Offset::new(0, 1),
            "left" => Offset::new(-1, 0),
            "right" => Offset::new(1, 0),
            _ => return Move::Blocked,
        };
        let Some(target) = self.grid.resolve(self.player, offset) else {
            return Move::Blocked;
        };
        let outcome = match self.grid.get(target) {
            Some(FLOOR) => Move::Walked,
            Some(BATTERY) => Move::Charged,
            _ => return Move::Blocked,
        };
        self.grid.set(self.player, FLOOR);
        self.grid.set(target, PLAYER);
        self.player = target;
        if outcome == Move::Charged {
            self.charge += 1;
            self.respawn();
        }
        outcome
    }

    /// Put a battery on the first floor cell in scan order.
    fn respawn(&mut self) -> Option<Pos> {
        let (pos, _) = self.grid.cells().find(|(_, v)| *v == FLOOR)?;
        self.grid.set(pos, BATTERY);
        Some(pos)
    }

    /// Put `value` on a random floor cell, if any is left.
    fn place(&mut self, value: Symbol) -> Option<Pos> {
        let floor: Vec<Pos> = self
            .grid
            .cells()
            .filter(|(_, v)| *v == FLOOR)
            .map(|(pos, _)| pos)
            .collect();
        if floor.is_empty() {
            return None;
        }
        let pos = floor[self.rng.gen_range(0..floor.len())];
        self.grid.set(pos, value);
        Some(pos)
    }
}

// ---------------------------------------------------------------------------
// Episodes
// ---------------------------------------------------------------------------

/// Tally of one agent run in a [`GridWorld`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EpisodeSummary {
    pub steps: usize,
    pub charge: Scalar,
    pub blocked: usize,
    pub mismatches: usize,
    pub goal_steps: usize,
    pub explore_steps: usize,
    pub rules: usize,
    pub exceptions: usize,
    /// Rules pruned to nothing; a store with any cannot be saved.
    pub broken: usize,
}

impl std::fmt::Display for EpisodeSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} steps, charge {}, {} blocked, {} mispredicted, {} toward goal, {} exploring; {} rules, {} exceptions",
            self.steps,
            self.charge,
            self.blocked,
            self.mismatches,
            self.goal_steps,
            self.explore_steps,
            self.rules,
            self.exceptions
        )?;
        if self.broken > 0 {
            write!(f, "; {} broken", self.broken)?;
        }
        Ok(())
    }
}

/// Drive `agent` through `steps` decide/act/learn cycles.
pub fn run(agent: &mut Agent, world: &mut GridWorld, steps: usize) -> AirisResult<EpisodeSummary> {
    let mut summary = EpisodeSummary::default();
    for _ in 0..steps {
        let decision = agent.observe_before(&world.observation())?;
        let moved = world.step(&decision.label);
        let report = agent.observe_after(&world.observation(), decision.action)?;

        summary.steps += 1;
        summary.blocked += usize::from(moved == Move::Blocked);
        summary.mismatches += usize::from(report.mismatch);
        match decision.kind {
            PlanKind::Goal => summary.goal_steps += 1,
            PlanKind::Explore | PlanKind::Novel => summary.explore_steps += 1,
            PlanKind::BestEffort => {}
        }
        tracing::debug!(step = summary.steps, %decision, ?moved, "sandbox step");
    }
    let stats = agent.store().stats();
    summary.charge = world.charge();
    summary.rules = stats.active_rules;
    summary.exceptions = stats.exceptions;
    summary.broken = stats.broken;
    tracing::info!(%summary, "episode finished");
    Ok(summary)
}
