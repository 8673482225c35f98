use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use syncrl_api::builders::curiosity::CuriosityTrainerBuilder;
use syncrl_api::builders::trainer::SyncTrainerBuilder;
use syncrl_api::config::SyncRlConfig;
use syncrl_api::hooks::LoggingHooks;
use syncrl_api::logging::init_tracing;
use syncrl_core::Algorithm;
use syncrl_examples::grid_world::GridWorld;
use syncrl_examples::shutdown::cancel_on_shutdown;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Agent {
    A2c,
    Curiosity,
}

/// Trains an agent on a grid world.
#[derive(Debug, Parser)]
#[command(name = "syncrl-train", version)]
struct Args {
    /// TOML configuration. `SYNCRL_` environment variables override it.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long, value_enum, default_value = "a2c")]
    agent: Agent,

    /// Side length of the grid.
    #[arg(long, default_value_t = 5)]
    size: usize,

    #[arg(long, default_value_t = 100)]
    max_episode_steps: usize,

    /// Stop once a validation reaches this mean score.
    #[arg(long)]
    target_score: Option<f32>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = SyncRlConfig::load(args.config.as_deref())?;
    init_tracing(&config.logging.level)?;
    tracing::info!(?args, "starting");

    let make_env = |_: usize| -> Result<GridWorld> {
        Ok(GridWorld::new(args.size, args.max_episode_steps, 0.01))
    };
    let mut hooks = LoggingHooks::new();
    if let Some(target) = args.target_score {
        hooks = hooks.with_target_score(target);
    }
    match args.agent {
        Agent::A2c => {
            let mut trainer = SyncTrainerBuilder::from_config(&config).build(make_env, hooks)?;
            cancel_on_shutdown(trainer.cancel_token())?;
            let result = trainer.train();
            trainer.close()?;
            result
        }
        Agent::Curiosity => {
            let mut trainer =
                CuriosityTrainerBuilder::from_config(&config).build(make_env, hooks)?;
            cancel_on_shutdown(trainer.cancel_token())?;
            let result = trainer.train();
            trainer.close()?;
            result
        }
    }
}
