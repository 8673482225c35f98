use crate::builders::a2c::A2CBuilder;
use crate::builders::env::{EnvPool, EnvPoolType, build_envs};
use crate::config::{SyncRlConfig, ValidationConfig};
use anyhow::Result;
use candle_core::Device;
use derive_more::{Deref, DerefMut};
use syncrl_agents::LinearActorCritic;
use syncrl_core::env::{Env, VecEnv};
use syncrl_core::error::SyncRlError;
use syncrl_core::runner::RolloutRunner;
use syncrl_core::sync_trainer::{SyncTrainer, TrainerHooks, TrainerSettings};
use syncrl_core::validation::ValidationScheduler;

pub type A2CTrainer<E, H> = SyncTrainer<EnvPool<E>, E, LinearActorCritic, H>;

/// Assembles an A2C [`SyncTrainer`]: the training batch, the model, the validation pool and
/// the hooks. Every setting is checked before any environment is created.
#[derive(Debug, Clone, Deref, DerefMut)]
pub struct SyncTrainerBuilder {
    #[deref]
    #[deref_mut]
    pub settings: TrainerSettings,
    pub num_envs: usize,
    pub env_pool_type: EnvPoolType,
    /// `None` disables validation.
    pub validation: Option<ValidationConfig>,
    pub model: A2CBuilder,
    pub device: Device,
}

impl Default for SyncTrainerBuilder {
    fn default() -> Self {
        Self::from_config(&SyncRlConfig::default())
    }
}

impl SyncTrainerBuilder {
    pub fn from_config(config: &SyncRlConfig) -> Self {
        Self {
            settings: config.trainer.clone(),
            num_envs: config.env.num_envs,
            env_pool_type: EnvPoolType::from_threaded(config.env.threaded),
            validation: Some(config.validation.clone()),
            model: A2CBuilder::from(&config.model),
            device: Device::Cpu,
        }
    }

    pub fn without_validation(mut self) -> Self {
        self.validation = None;
        self
    }

    pub fn check(&self) -> Result<(), SyncRlError> {
        check_settings(&self.settings, self.num_envs, self.validation.as_ref())
    }

    /// `make_env(i)` creates the i-th environment; training environments come first, validation
    /// environments continue the numbering.
    pub fn build<E, F, H>(&self, make_env: F, hooks: H) -> Result<A2CTrainer<E, H>>
    where
        E: Env + Send + 'static,
        F: Fn(usize) -> Result<E>,
        H: TrainerHooks<LinearActorCritic>,
    {
        self.check()?;
        let envs = build_envs(self.num_envs, &make_env)?;
        let pool = self.env_pool_type.build(envs)?;
        let model = self.model.build(&pool.env_description(), &self.device)?;
        let runner = RolloutRunner::new(pool, self.settings.nsteps, self.settings.seed)?;
        let trainer = SyncTrainer::new(runner, model, hooks, self.settings.clone())?;
        let Some(validation) = &self.validation else {
            return Ok(trainer);
        };
        let scheduler = build_validation(validation, self.num_envs, &make_env)?;
        Ok(trainer.with_validation(scheduler))
    }
}

pub(crate) fn check_settings(
    settings: &TrainerSettings,
    num_envs: usize,
    validation: Option<&ValidationConfig>,
) -> Result<(), SyncRlError> {
    if num_envs == 0 {
        return Err(SyncRlError::config("num_envs must be positive"));
    }
    if settings.nsteps == 0 {
        return Err(SyncRlError::config("nsteps must be positive"));
    }
    settings.estimator()?;
    if let Some(validation) = validation {
        if validation.num_envs == 0 {
            return Err(SyncRlError::config("validation needs at least one environment"));
        }
        if validation.num_episodes < validation.num_envs {
            return Err(SyncRlError::config(format!(
                "{} validation episodes cannot be spread over {} environments",
                validation.num_episodes, validation.num_envs
            )));
        }
    }
    Ok(())
}

pub(crate) fn build_validation<E, F>(
    config: &ValidationConfig,
    offset: usize,
    make_env: &F,
) -> Result<ValidationScheduler<E>>
where
    E: Env + Send,
    F: Fn(usize) -> Result<E>,
{
    let envs = build_envs(config.num_envs, &|idx| make_env(offset + idx))?;
    Ok(ValidationScheduler::new(envs, config.num_episodes)?.with_max_steps(config.max_steps))
}
