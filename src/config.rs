//! Agent configuration: the action space, goals, planner limits and where
//! knowledge is kept. Persisted as TOML.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::compare::Goal;
use crate::error::ConfigError;
use crate::plan::PlannerConfig;

/// Half-open output range `[min, max)` walked in `step` increments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRange {
    pub min: i64,
    pub max: i64,
    pub step: i64,
}

impl Default for OutputRange {
    fn default() -> Self {
        Self {
            min: 1,
            max: 2,
            step: 1,
        }
    }
}

impl OutputRange {
    pub fn is_empty(&self) -> bool {
        self.step <= 0 || self.min >= self.max
    }

    pub fn values(&self) -> impl Iterator<Item = i64> + '_ {
        let step = usize::try_from(self.step).unwrap_or(0);
        let range = if step == 0 { self.max..self.max } else { self.min..self.max };
        range.step_by(step.max(1))
    }
}

/// One symbolic action and the outputs it can be issued with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub name: String,
    #[serde(default)]
    pub output: OutputRange,
}

impl ActionSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            output: OutputRange::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_name")]
    pub name: String,
    /// Directory holding the knowledge database. `None` keeps knowledge in memory.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default = "default_actions")]
    pub actions: Vec<ActionSpec>,
    #[serde(default)]
    pub goals: Vec<Goal>,
    #[serde(default)]
    pub planner: PlannerConfig,
}

fn default_name() -> String {
    "airis".into()
}

fn default_actions() -> Vec<ActionSpec> {
    ["up", "down", "left", "right"]
        .into_iter()
        .map(ActionSpec::new)
        .collect()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            data_dir: None,
            actions: default_actions(),
            goals: Vec::new(),
            planner: PlannerConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Every `(label, output)` pair of the action space, in declaration order.
    pub fn action_space(&self) -> Vec<(String, i64)> {
        self.actions
            .iter()
            .flat_map(|spec| spec.output.values().map(|v| (spec.name.clone(), v)))
            .collect()
    }

    /// Reject configurations the agent cannot act on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.actions.is_empty() {
            return Err(ConfigError::EmptyActionSpace);
        }
        if let Some(bad) = self.actions.iter().find(|a| a.output.is_empty()) {
            return Err(ConfigError::InvalidOutputRange {
                action: bad.name.clone(),
                min: bad.output.min,
                max: bad.output.max,
                step: bad.output.step,
            });
        }
        Ok(())
    }

    /// Load from a TOML file and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save to a TOML file, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        std::fs::write(path, content).map_err(|e| ConfigError::Write {
            path: path.display().to_string(),
            source: e,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::Direction;
    use crate::observation::Offset;

    #[test]
    fn default_config_is_valid() {
        let config = AgentConfig::default();
        config.validate().unwrap();
        assert_eq!(config.action_space().len(), 4);
        assert_eq!(config.action_space()[0], ("up".to_string(), 1));
    }

    #[test]
    fn output_range_is_half_open() {
        let range = OutputRange {
            min: -2,
            max: 3,
            step: 2,
        };
        assert_eq!(range.values().collect::<Vec<_>>(), vec![-2, 0, 2]);
        assert_eq!(OutputRange::default().values().collect::<Vec<_>>(), vec![1]);
        assert!(OutputRange { min: 1, max: 1, step: 1 }.is_empty());
        assert!(OutputRange { min: 0, max: 4, step: 0 }.is_empty());
    }

    #[test]
    fn empty_action_space_is_rejected() {
        let config = AgentConfig {
            actions: Vec::new(),
            ..AgentConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::EmptyActionSpace)));
    }

    #[test]
    fn bad_output_range_is_rejected() {
        let mut config = AgentConfig::default();
        config.actions[1].output = OutputRange { min: 3, max: 1, step: 1 };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidOutputRange { ref action, .. }) if action == "down"
        ));
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("agent.toml");
        let config = AgentConfig {
            goals: vec![
                Goal::Aux {
                    index: 0,
                    direction: Direction::Increase,
                },
                Goal::Reach {
                    subject: 1,
                    offset: Offset::new(0, -1),
                    target: 4,
                },
            ],
            data_dir: Some(dir.path().join("data")),
            ..AgentConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(AgentConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn sparse_toml_fills_defaults() {
        let config: AgentConfig = toml::from_str(
            r#"
            [[actions]]
            name = "push"
            output = { min = 0, max = 10, step = 5 }

            [[goals]]
            kind = "aux"
            index = 1
            direction = "decrease"
            "#,
        )
        .unwrap();
        assert_eq!(config.name, "airis");
        assert_eq!(config.action_space(), vec![("push".into(), 0), ("push".into(), 5)]);
        assert_eq!(config.planner, PlannerConfig::default());
        assert_eq!(
            config.goals,
            vec![Goal::Aux {
                index: 1,
                direction: Direction::Decrease
            }]
        );
    }

    #[test]
    fn unreadable_and_malformed_files_are_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("missing.toml");
        assert!(matches!(AgentConfig::load(&missing), Err(ConfigError::Read { .. })));

        let broken = dir.path().join("broken.toml");
        std::fs::write(&broken, "actions = [").unwrap();
        assert!(matches!(AgentConfig::load(&broken), Err(ConfigError::Parse { .. })));
    }
}
