//! airis CLI: online rule-learning agent.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};

use airis::agent::Agent;
use airis::config::AgentConfig;
use airis::sandbox::{self, GridWorld};
use airis::store::KnowledgeVault;

#[derive(Parser)]
#[command(name = "airis", version, about = "Online rule-learning agent")]
struct Cli {
    /// Agent configuration file (TOML).
    #[arg(long, global = true, default_value = "airis.toml")]
    config: PathBuf,

    /// Data directory for the knowledge vault. Overrides the config.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config and an empty knowledge vault.
    Init {
        /// Start from the sandbox action space and goal.
        #[arg(long)]
        sandbox: bool,

        /// Overwrite an existing config file.
        #[arg(long)]
        force: bool,
    },

    /// Show knowledge statistics.
    Info,

    /// Export learned rules as JSON.
    Rules {
        /// Only rules triggered by this cell value.
        #[arg(long)]
        value: Option<i64>,
    },

    /// Run the agent in the built-in grid world and keep what it learns.
    Sandbox {
        /// Number of decide/act/learn steps.
        #[arg(long, default_value = "200")]
        steps: usize,

        /// World layout seed.
        #[arg(long, default_value = "0")]
        seed: u64,

        #[arg(long, default_value = "8")]
        width: usize,

        #[arg(long, default_value = "6")]
        height: usize,

        #[arg(long, default_value = "2")]
        batteries: usize,

        /// Start from an empty store and do not save.
        #[arg(long)]
        fresh: bool,
    },
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set (e.g., in tests)

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { sandbox, force } => {
            if cli.config.exists() && !force {
                miette::bail!(
                    "{} already exists; pass --force to overwrite it",
                    cli.config.display()
                );
            }
            let mut config = if sandbox {
                GridWorld::config()
            } else {
                AgentConfig::default()
            };
            let data_dir = cli
                .data_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from(".airis"));
            config.data_dir = Some(data_dir.clone());
            config.save(&cli.config)?;

            let vault = KnowledgeVault::open(&data_dir, &config.name)?;
            let store = vault.load()?;
            vault.save(&store)?;
            println!("Initialized airis config at {}", cli.config.display());
            println!("Knowledge vault: {}", vault.path().display());
        }

        Commands::Info => {
            let config = load_config(&cli.config, AgentConfig::default)?;
            let vault = open_vault(&config, cli.data_dir.as_deref())?;
            let store = vault.load()?;
            println!("{}", store.stats());
            println!("  steps:      {}", vault.time_step()?);
            println!("  vault:      {}", vault.path().display());
            println!("  actions:    {}", config.action_space().len());
            for goal in &config.goals {
                println!("  goal:       {goal}");
            }
        }

        Commands::Rules { value } => {
            let config = load_config(&cli.config, AgentConfig::default)?;
            let vault = open_vault(&config, cli.data_dir.as_deref())?;
            let store = vault.load()?;
            let exports = store.export_rules(value);
            let json = serde_json::to_string_pretty(&exports).into_diagnostic()?;
            println!("{json}");
        }

        Commands::Sandbox {
            steps,
            seed,
            width,
            height,
            batteries,
            fresh,
        } => {
            let config = load_config(&cli.config, GridWorld::config)?;
            let vault = if fresh {
                None
            } else {
                Some(open_vault(&config, cli.data_dir.as_deref())?)
            };
            let store = match &vault {
                Some(vault) => vault.load()?,
                None => Default::default(),
            };
            let prior_steps = match &vault {
                Some(vault) => vault.time_step()?,
                None => 0,
            };

            let mut world = GridWorld::new(width, height, batteries, seed);
            let mut agent = Agent::with_store(config, store)?;
            let summary = sandbox::run(&mut agent, &mut world, steps)?;
            println!("{summary}");

            if let Some(vault) = vault {
                let covered = prior_steps + agent.time_step();
                vault.save(agent.store())?;
                vault.set_time_step(covered)?;
                println!("Saved to {}", vault.path().display());
            }
        }
    }

    Ok(())
}

/// Load the config at `path`, or fall back when the file does not exist.
fn load_config(path: &Path, fallback: fn() -> AgentConfig) -> Result<AgentConfig> {
    if path.exists() {
        Ok(AgentConfig::load(path)?)
    } else {
        tracing::info!(path = %path.display(), "no config file; using defaults");
        Ok(fallback())
    }
}

fn open_vault(config: &AgentConfig, data_dir: Option<&Path>) -> Result<KnowledgeVault> {
    let dir = data_dir
        .map(Path::to_path_buf)
        .or_else(|| config.data_dir.clone())
        .unwrap_or_else(|| PathBuf::from(".airis"));
    Ok(KnowledgeVault::open(&dir, &config.name)?)
}
