//! Curiosity driven training: a novelty bonus on top of the extrinsic reward, plus auxiliary
//! pixel control and reward prediction tasks.

mod reward_sampling;
mod rnd;

pub use reward_sampling::{REWARD_CLASSES, one_hot_reward, reward_class, sample_reward_step};
pub use rnd::{RndActorCritic, RndConfig};

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use rand::{SeedableRng, rngs::StdRng};
use serde::Deserialize;
use std::time::Instant;
use syncrl_core::env::{Env, VecEnv};
use syncrl_core::error::SyncRlError;
use syncrl_core::model::{ActorCritic, TrainingBatch};
use syncrl_core::returns::{ReturnAlgorithm, ReturnEstimator, ReturnInputs, RewardClip, no_dones};
use syncrl_core::runner::RolloutRunner;
use syncrl_core::sync_trainer::{
    Cadence, TrainerHooks, TrainerSettings, UpdateReport, validation_report, validation_rng,
};
use syncrl_core::trajectory::{Trajectory, fold_batch};
use syncrl_core::utils::{
    PixelRange, RewardScaler, RunningMeanStd, pixel_control_target, pixel_rewards,
};
use syncrl_core::validation::{CancelToken, ValidationScheduler};
use syncrl_core::{Algorithm, break_on_hook_res};

/// Everything a curiosity model needs for one optimisation step.
#[derive(Debug, Clone)]
pub struct CuriosityBatch<'a> {
    /// Policy and value targets. `intrinsic_returns` is always set.
    pub policy: TrainingBatch,
    /// Folded predictor inputs of the next states, (T*N, ...).
    pub next_states: Tensor,
    pub obs_stats: &'a RunningMeanStd,
    /// (T*N, rows, cols) pixel control targets when the observations are frames.
    pub pixel_targets: Option<Tensor>,
    /// A single state, (1, ...), and its one hot reward sign class, (1, 3).
    pub reward_state: Tensor,
    pub reward_target: Tensor,
}

/// A model with an extrinsic (head 0) and an intrinsic (head 1) value head.
pub trait CuriosityModel: ActorCritic {
    /// Novelty of every next state, given the running statistics of predictor inputs.
    fn intrinsic_reward(
        &self,
        next_states: &Tensor,
        obs_stats: &RunningMeanStd,
    ) -> Result<Vec<f32>>;

    /// Auxiliary action values per pixel cell, (B, rows, cols, A). `None` when the model has no
    /// pixel control head.
    fn pixel_control(&self, states: &Tensor) -> Result<Option<Tensor>>;

    fn backprop_curiosity(&mut self, batch: &CuriosityBatch) -> Result<f32>;
}

/// The newest frame of channel last frame stacks, (B, H, W, 1). Other observations pass through.
pub fn predictor_input(states: &Tensor) -> Result<Tensor> {
    match states.dims() {
        [.., channels] if states.rank() == 4 => Ok(states.narrow(3, channels - 1, 1)?),
        _ => Ok(states.clone()),
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CuriositySettings {
    #[serde(flatten)]
    pub trainer: TrainerSettings,
    pub extr_gamma: f32,
    pub intr_gamma: f32,
    pub extr_coeff: f32,
    pub intr_coeff: f32,
    /// Random steps used to seed the observation statistics before training.
    pub warmup_steps: usize,
    pub pixel_cell: usize,
    pub pixel_gamma: f32,
    /// Scale frames into [0, 1] with the observed pixel range before computing pixel rewards.
    pub norm_pixel: bool,
}

impl Default for CuriositySettings {
    fn default() -> Self {
        Self {
            trainer: TrainerSettings {
                return_type: ReturnAlgorithm::Gae,
                ..Default::default()
            },
            extr_gamma: 0.999,
            intr_gamma: 0.99,
            extr_coeff: 1.,
            intr_coeff: 0.5,
            warmup_steps: 20 * 50 * 25,
            pixel_cell: 4,
            pixel_gamma: 0.99,
            norm_pixel: true,
        }
    }
}

/// Synchronous trainer for curiosity models. Both reward streams use GAE; the intrinsic stream
/// ignores episode boundaries.
pub struct CuriosityTrainer<V, E, M, H>
where
    V: VecEnv,
    E: Env + Send,
    M: CuriosityModel + Sync,
    H: TrainerHooks<M>,
{
    runner: RolloutRunner<V>,
    validation: Option<ValidationScheduler<E>>,
    model: M,
    hooks: H,
    settings: CuriositySettings,
    extr_estimator: ReturnEstimator,
    intr_estimator: ReturnEstimator,
    cadence: Cadence,
    obs_stats: Option<RunningMeanStd>,
    intr_scaler: RewardScaler,
    pixel_range: Option<PixelRange>,
    cancel: CancelToken,
    rng: StdRng,
    validation_rng: StdRng,
}

impl<V, E, M, H> CuriosityTrainer<V, E, M, H>
where
    V: VecEnv,
    E: Env + Send,
    M: CuriosityModel + Sync,
    H: TrainerHooks<M>,
{
    pub fn new(
        runner: RolloutRunner<V>,
        model: M,
        hooks: H,
        mut settings: CuriositySettings,
    ) -> Result<Self> {
        settings.trainer.nsteps = runner.num_steps();
        let lambda = settings.trainer.lambda;
        let gae =
            |gamma| ReturnEstimator::new(ReturnAlgorithm::Gae, gamma, lambda, RewardClip::None);
        let extr_estimator = gae(settings.extr_gamma)?;
        let intr_estimator = gae(settings.intr_gamma)?;
        if settings.pixel_cell == 0 {
            return Err(SyncRlError::config("pixel cell size must be positive").into());
        }
        let cadence = Cadence::new(&settings.trainer, runner.num_envs() * runner.num_steps())?;
        Ok(Self {
            rng: StdRng::seed_from_u64(settings.trainer.seed),
            validation_rng: validation_rng(settings.trainer.seed),
            intr_scaler: RewardScaler::new(settings.intr_gamma as f64, &Device::Cpu)?,
            pixel_range: settings.norm_pixel.then(PixelRange::default),
            runner,
            validation: None,
            model,
            hooks,
            settings,
            extr_estimator,
            intr_estimator,
            cadence,
            obs_stats: None,
            cancel: CancelToken::new(),
        })
    }

    pub fn with_validation(mut self, scheduler: ValidationScheduler<E>) -> Self {
        self.validation = Some(scheduler.with_cancel_token(self.cancel.clone()));
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn obs_stats(&self) -> Option<&RunningMeanStd> {
        self.obs_stats.as_ref()
    }

    pub fn close(&mut self) -> Result<()> {
        self.runner.close()?;
        if let Some(validation) = &mut self.validation {
            validation.close()?;
        }
        Ok(())
    }

    /// Steps the batch with random actions, updating the observation statistics once per
    /// rollout length, then resets it.
    pub fn warmup(&mut self) -> Result<()> {
        let Self {
            runner,
            obs_stats,
            pixel_range,
            settings,
            ..
        } = self;
        let chunk = runner.num_steps();
        let steps = settings.warmup_steps;
        let seed = settings.trainer.seed;
        let mut pending = Vec::with_capacity(chunk);
        let mut rng = StdRng::seed_from_u64(seed ^ 0x5eed);
        runner.warmup(steps, &mut rng, |next_states| {
            pending.push(next_states.clone());
            if pending.len() == chunk {
                observe(obs_stats, pixel_range, &pending)?;
                pending.clear();
            }
            Ok(())
        })?;
        observe(obs_stats, pixel_range, &pending)?;
        if obs_stats.is_none() {
            observe(obs_stats, pixel_range, std::slice::from_ref(runner.states()))?;
        }
        runner.reset(seed)?;
        tracing::info!(steps, "observation statistics warmed up");
        Ok(())
    }

    fn collect(&mut self) -> Result<Trajectory> {
        let Self {
            runner,
            model,
            obs_stats,
            rng,
            ..
        } = self;
        let Some(stats) = obs_stats.as_ref() else {
            return Err(SyncRlError::config("observation statistics are not initialised").into());
        };
        runner.run_with_intrinsic(&*model, rng, |next_states| {
            model.intrinsic_reward(&predictor_input(next_states)?, stats)
        })
    }

    fn pixel_targets(&mut self, trajectory: &Trajectory) -> Result<Option<Tensor>> {
        if trajectory.last_states.rank() != 4 {
            return Ok(None);
        }
        let Some(q_aux) = self.model.pixel_control(&trajectory.last_states)? else {
            return Ok(None);
        };
        let states = trajectory.stacked_states()?;
        if let Some(range) = &mut self.pixel_range {
            range.update(&states)?;
        }
        let rewards = pixel_rewards(&states, self.settings.pixel_cell, self.pixel_range.as_ref())?;
        let last_values = q_aux.max(3)?;
        let targets = pixel_control_target(
            &rewards,
            &last_values,
            &trajectory.dones,
            self.settings.pixel_gamma,
        )?;
        Ok(Some(targets.flatten_to(1)?))
    }

    fn reward_sample(&mut self, trajectory: &Trajectory) -> Result<(Tensor, Tensor)> {
        let Some((t, env)) = sample_reward_step(&trajectory.rewards, &mut self.rng) else {
            return Err(SyncRlError::config("cannot sample a reward from an empty rollout").into());
        };
        let state = trajectory.states[t].get(env)?.unsqueeze(0)?;
        let one_hot = one_hot_reward(trajectory.rewards[t][env]);
        let target = Tensor::from_slice(&one_hot, (1, REWARD_CLASSES), state.device())?;
        Ok((state, target))
    }

    pub fn learn(&mut self, trajectory: &Trajectory) -> Result<f32> {
        let last = self.model.forward(&trajectory.last_states)?;
        let (last_extr, last_intr) = (last.value_head(0)?, last.value_head(1)?);
        let pixel_targets = self.pixel_targets(trajectory)?;
        let (reward_state, reward_target) = self.reward_sample(trajectory)?;

        let next_states = trajectory.folded_next_states()?;
        observe(
            &mut self.obs_stats,
            &mut None,
            std::slice::from_ref(&next_states),
        )?;

        let Some(intrinsic) = &trajectory.intrinsic_rewards else {
            return Err(SyncRlError::config("rollout has no intrinsic rewards").into());
        };
        let intrinsic = self.intr_scaler.scale(intrinsic)?;

        let (extr_values, intr_values) = (trajectory.values(0)?, trajectory.values(1)?);
        let (extr_returns, extr_adv) = self.extr_estimator.returns_and_advantages(ReturnInputs {
            rewards: &trajectory.rewards,
            values: extr_values,
            last_values: &last_extr,
            dones: &trajectory.dones,
        })?;
        let continuing = no_dones(trajectory.num_steps(), trajectory.num_envs());
        let (intr_returns, intr_adv) = self.intr_estimator.returns_and_advantages(ReturnInputs {
            rewards: &intrinsic,
            values: intr_values,
            last_values: &last_intr,
            dones: &continuing,
        })?;
        let (extr_coeff, intr_coeff) = (self.settings.extr_coeff, self.settings.intr_coeff);
        let advantages: Vec<f32> = fold_batch(&extr_adv)
            .into_iter()
            .zip(fold_batch(&intr_adv))
            .map(|(e, i)| extr_coeff * e + intr_coeff * i)
            .collect();

        let Some(obs_stats) = &self.obs_stats else {
            return Err(SyncRlError::config("observation statistics are not initialised").into());
        };
        let batch = CuriosityBatch {
            policy: TrainingBatch {
                states: trajectory.folded_states()?,
                actions: trajectory.folded_actions(),
                returns: fold_batch(&extr_returns),
                advantages,
                intrinsic_returns: Some(fold_batch(&intr_returns)),
            },
            next_states: predictor_input(&next_states)?.to_dtype(DType::F32)?,
            obs_stats,
            pixel_targets,
            reward_state,
            reward_target,
        };
        self.model.backprop_curiosity(&batch)
    }
}

/// Folds a list of state batches into the observation statistics and the pixel range.
fn observe(
    obs_stats: &mut Option<RunningMeanStd>,
    pixel_range: &mut Option<PixelRange>,
    states: &[Tensor],
) -> Result<()> {
    if states.is_empty() {
        return Ok(());
    }
    let folded = Tensor::cat(states, 0)?;
    if let Some(range) = pixel_range {
        range.update(&folded)?;
    }
    let inputs = predictor_input(&folded)?;
    if obs_stats.is_none() {
        *obs_stats = Some(RunningMeanStd::new(&inputs.dims()[1..], &Device::Cpu)?);
    }
    if let Some(stats) = obs_stats {
        stats.update(&inputs)?;
    }
    Ok(())
}

impl<V, E, M, H> Algorithm for CuriosityTrainer<V, E, M, H>
where
    V: VecEnv,
    E: Env + Send,
    M: CuriosityModel + Sync,
    H: TrainerHooks<M>,
{
    fn train(&mut self) -> Result<()> {
        if self.hooks.init_hook(&mut self.model) {
            return Ok(());
        }
        self.warmup()?;
        let batch_size = self.runner.num_envs() * self.runner.num_steps();
        let cadence = self.cadence;
        let mut checkpoint = 0;
        let mut start = Instant::now();
        for update in 1..=cadence.num_updates {
            if self.cancel.is_cancelled() {
                tracing::info!(update, "training cancelled");
                break;
            }
            let trajectory = self.collect()?;
            break_on_hook_res!(self.hooks.post_rollout_hook(&trajectory));

            let loss = self.learn(&trajectory)?;
            let report = UpdateReport {
                update,
                total_steps: update * batch_size,
                loss,
                episodes: trajectory.finished_episodes(),
                rollout_reward: trajectory.total_reward(),
            };
            break_on_hook_res!(self.hooks.post_training_hook(&mut self.model, &report));

            if Cadence::is_due(cadence.validate_every, update) {
                if let Some(scheduler) = &mut self.validation {
                    let render = Cadence::is_due(cadence.render_every, update);
                    let summary = scheduler.run(&self.model, render, &mut self.validation_rng)?;
                    let report =
                        validation_report(update, loss, batch_size, cadence, start, summary);
                    start = Instant::now();
                    break_on_hook_res!(self.hooks.validation_hook(&report));
                }
            }
            if Cadence::is_due(cadence.save_every, update) {
                checkpoint += 1;
                self.hooks.checkpoint_hook(&self.model, checkpoint)?;
            }
        }
        self.hooks.shutdown_hook()
    }
}

#[cfg(test)]
mod test {
    use super::predictor_input;
    use anyhow::Result;
    use candle_core::{DType, Device, Tensor};

    #[test]
    fn frame_stacks_keep_only_the_newest_frame() -> Result<()> {
        let frames = Tensor::arange(0f32, 24., &Device::Cpu)?.reshape((1, 2, 3, 4))?;
        let newest = predictor_input(&frames)?;
        assert_eq!(newest.dims(), &[1, 2, 3, 1]);
        assert_eq!(newest.flatten_all()?.to_vec1::<f32>()?, vec![3., 7., 11., 15., 19., 23.]);
        let flat = Tensor::zeros((5, 7), DType::F32, &Device::Cpu)?;
        assert_eq!(predictor_input(&flat)?.dims(), &[5, 7]);
        Ok(())
    }
}
