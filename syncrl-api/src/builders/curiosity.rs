use crate::builders::env::{EnvPool, EnvPoolType, build_envs};
use crate::builders::trainer::{build_validation, check_settings};
use crate::config::{SyncRlConfig, ValidationConfig};
use anyhow::Result;
use candle_core::Device;
use derive_more::{Deref, DerefMut};
use syncrl_agents::{CuriositySettings, CuriosityTrainer, RndActorCritic, RndConfig};
use syncrl_core::env::{Env, EnvironmentDescription, Space, VecEnv};
use syncrl_core::error::SyncRlError;
use syncrl_core::runner::RolloutRunner;
use syncrl_core::sync_trainer::TrainerHooks;

pub type RndTrainer<E, H> = CuriosityTrainer<EnvPool<E>, E, RndActorCritic, H>;

/// Predictor input size and pixel control grid implied by an observation space.
///
/// Channel last frame stacks `(H, W, C)` feed only their newest frame to the novelty networks
/// and get a `(H / cell, W / cell)` pixel control grid.
pub fn observation_layout(
    env_description: &EnvironmentDescription,
    pixel_cell: usize,
) -> Result<(usize, Option<(usize, usize)>), SyncRlError> {
    match &env_description.observation_space {
        Space::Continous { dims, .. } if dims.len() == 3 => {
            let (height, width) = (dims[0], dims[1]);
            if pixel_cell == 0 || height % pixel_cell != 0 || width % pixel_cell != 0 {
                return Err(SyncRlError::config(format!(
                    "frames of {height}x{width} cannot be split into cells of {pixel_cell}"
                )));
            }
            Ok((height * width, Some((height / pixel_cell, width / pixel_cell))))
        }
        space => Ok((space.size(), None)),
    }
}

#[derive(Debug, Clone, Deref, DerefMut)]
pub struct CuriosityTrainerBuilder {
    #[deref]
    #[deref_mut]
    pub settings: CuriositySettings,
    pub num_envs: usize,
    pub env_pool_type: EnvPoolType,
    pub validation: Option<ValidationConfig>,
    /// `pixel_grid` is derived from the observation space at build time.
    pub model: RndConfig,
    pub device: Device,
}

impl Default for CuriosityTrainerBuilder {
    fn default() -> Self {
        Self::from_config(&SyncRlConfig::default())
    }
}

impl CuriosityTrainerBuilder {
    pub fn from_config(config: &SyncRlConfig) -> Self {
        let curiosity = &config.curiosity;
        let settings = CuriositySettings {
            trainer: config.trainer.clone(),
            extr_gamma: curiosity.extr_gamma,
            intr_gamma: curiosity.intr_gamma,
            extr_coeff: curiosity.extr_coeff,
            intr_coeff: curiosity.intr_coeff,
            warmup_steps: curiosity.warmup_steps,
            pixel_cell: curiosity.pixel_cell,
            pixel_gamma: curiosity.pixel_gamma,
            norm_pixel: curiosity.norm_pixel,
        };
        let model = RndConfig {
            hidden_layers: config.model.hidden_layers.clone(),
            feature_layers: curiosity.feature_layers.clone(),
            learning_rate: config.model.learning_rate,
            max_grad_norm: config.model.max_grad_norm,
            value_coeff: config.model.value_coeff,
            entropy_coeff: config.model.entropy_coeff,
            reward_coeff: curiosity.reward_coeff,
            pixel_coeff: curiosity.pixel_coeff,
            ..Default::default()
        };
        Self {
            settings,
            num_envs: config.env.num_envs,
            env_pool_type: EnvPoolType::from_threaded(config.env.threaded),
            validation: Some(config.validation.clone()),
            model,
            device: Device::Cpu,
        }
    }

    pub fn without_validation(mut self) -> Self {
        self.validation = None;
        self
    }

    pub fn check(&self) -> Result<(), SyncRlError> {
        check_settings(&self.settings.trainer, self.num_envs, self.validation.as_ref())?;
        for (name, gamma) in [
            ("extr_gamma", self.settings.extr_gamma),
            ("intr_gamma", self.settings.intr_gamma),
            ("pixel_gamma", self.settings.pixel_gamma),
        ] {
            if !(0. ..=1.).contains(&gamma) {
                return Err(SyncRlError::config(format!("{name} must lie in [0, 1], got {gamma}")));
            }
        }
        Ok(())
    }

    pub fn build<E, F, H>(&self, make_env: F, hooks: H) -> Result<RndTrainer<E, H>>
    where
        E: Env + Send + 'static,
        F: Fn(usize) -> Result<E>,
        H: TrainerHooks<RndActorCritic>,
    {
        self.check()?;
        let envs = build_envs(self.num_envs, &make_env)?;
        let pool = self.env_pool_type.build(envs)?;
        let env_description = pool.env_description();
        let (predictor_input_size, pixel_grid) =
            observation_layout(&env_description, self.settings.pixel_cell)?;
        let config = RndConfig {
            pixel_grid,
            ..self.model.clone()
        };
        let model =
            RndActorCritic::new(&env_description, predictor_input_size, config, &self.device)?;
        let trainer_settings = &self.settings.trainer;
        let runner = RolloutRunner::new(pool, trainer_settings.nsteps, trainer_settings.seed)?;
        let trainer = CuriosityTrainer::new(runner, model, hooks, self.settings.clone())?;
        let Some(validation) = &self.validation else {
            return Ok(trainer);
        };
        let scheduler = build_validation(validation, self.num_envs, &make_env)?;
        Ok(trainer.with_validation(scheduler))
    }
}

#[cfg(test)]
mod test {
    use super::{CuriosityTrainerBuilder, observation_layout};
    use syncrl_core::env::{EnvironmentDescription, Space};

    #[test]
    fn frames_feed_their_newest_channel_to_the_predictor() -> anyhow::Result<()> {
        let frames = EnvironmentDescription::new(
            Space::continous_from_dims(vec![8, 12, 4]),
            Space::Discrete(3),
        );
        assert_eq!(observation_layout(&frames, 4)?, (96, Some((2, 3))));
        assert!(observation_layout(&frames, 5).is_err());

        let vector =
            EnvironmentDescription::new(Space::continous_from_dims(vec![6]), Space::Discrete(3));
        assert_eq!(observation_layout(&vector, 4)?, (6, None));
        Ok(())
    }

    #[test]
    fn invalid_intrinsic_gamma_is_rejected() {
        let mut builder = CuriosityTrainerBuilder::default();
        builder.intr_gamma = 1.2;
        assert!(builder.check().is_err());
    }
}
