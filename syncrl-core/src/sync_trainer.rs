//! The synchronous training loop: rollout, returns, one optimisation step, periodic side jobs.

use crate::Algorithm;
use crate::env::{Env, VecEnv};
use crate::error::SyncRlError;
use crate::model::{ActorCritic, TrainingBatch};
use crate::returns::{ReturnAlgorithm, ReturnEstimator, ReturnInputs, RewardClip};
use crate::runner::RolloutRunner;
use crate::trajectory::{Trajectory, fold_batch};
use crate::utils::RewardScaler;
use crate::validation::{CancelToken, ValidationScheduler, ValidationSummary};
use anyhow::Result;
use candle_core::Device;
use rand::{SeedableRng, rngs::StdRng};
use serde::Deserialize;
use std::time::{Duration, Instant};

/// Leaves the enclosing training loop when a hook asks to stop.
#[macro_export]
macro_rules! break_on_hook_res {
    ($hook_res:expr) => {
        if $hook_res {
            break;
        }
    };
}

/// Training settings. Every frequency is counted in environment steps summed over the batch
/// and 0 disables the job, except `render_freq` which counts validations.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrainerSettings {
    pub total_steps: usize,
    pub nsteps: usize,
    pub gamma: f32,
    pub lambda: f32,
    pub return_type: ReturnAlgorithm,
    pub reward_clip: RewardClip,
    pub validate_freq: usize,
    pub save_freq: usize,
    pub render_freq: usize,
    pub update_target_freq: usize,
    /// Divide extrinsic rewards by the running std of their discounted sum.
    pub normalize_rewards: bool,
    pub normalize_advantages: bool,
    pub seed: u64,
}

impl Default for TrainerSettings {
    fn default() -> Self {
        Self {
            total_steps: 10_000,
            nsteps: 5,
            gamma: 0.99,
            lambda: 0.95,
            return_type: ReturnAlgorithm::NStep,
            reward_clip: RewardClip::None,
            validate_freq: 1_000_000,
            save_freq: 0,
            render_freq: 0,
            update_target_freq: 0,
            normalize_rewards: false,
            normalize_advantages: false,
            seed: 0,
        }
    }
}

impl TrainerSettings {
    pub fn estimator(&self) -> Result<ReturnEstimator, SyncRlError> {
        ReturnEstimator::new(self.return_type, self.gamma, self.lambda, self.reward_clip)
    }
}

/// Random stream of the validation workers. Kept apart from the training stream so that
/// validating never changes the actions sampled during training.
pub fn validation_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed ^ 0x7661_6c69_6461_7465)
}

/// Frequencies converted from environment steps into updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    pub num_updates: usize,
    pub validate_every: usize,
    pub save_every: usize,
    /// In updates. Rendering happens on every `render_freq`-th validation.
    pub render_every: usize,
    pub update_target_every: usize,
}

impl Cadence {
    pub fn new(settings: &TrainerSettings, batch_size: usize) -> Result<Self, SyncRlError> {
        if batch_size == 0 {
            return Err(SyncRlError::config("the training batch is empty"));
        }
        // a non zero frequency below one batch still fires on every update
        let every = |freq: usize| if freq == 0 { 0 } else { (freq / batch_size).max(1) };
        let validate_every = every(settings.validate_freq);
        Ok(Self {
            num_updates: settings.total_steps / batch_size,
            validate_every,
            save_every: every(settings.save_freq),
            render_every: validate_every * settings.render_freq,
            update_target_every: every(settings.update_target_freq),
        })
    }

    pub fn is_due(every: usize, update: usize) -> bool {
        every > 0 && update % every == 0
    }
}

/// Scalars reported after every optimisation step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpdateReport {
    pub update: usize,
    pub total_steps: usize,
    pub loss: f32,
    pub episodes: usize,
    pub rollout_reward: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReport {
    pub update: usize,
    pub total_steps: usize,
    pub loss: f32,
    pub score: Option<f32>,
    /// Wall time since the previous validation.
    pub elapsed: Duration,
    /// Training frames per second over `elapsed`.
    pub fps: f32,
    pub summary: ValidationSummary,
}

/// Extension points of the training loop. Hooks returning `true` stop training.
pub trait TrainerHooks<M> {
    fn init_hook(&mut self, _model: &mut M) -> bool {
        false
    }

    fn post_rollout_hook(&mut self, trajectory: &Trajectory) -> bool;

    fn post_training_hook(&mut self, model: &mut M, report: &UpdateReport) -> bool;

    fn validation_hook(&mut self, report: &ValidationReport) -> bool;

    /// Persisting the model is up to the hook; `checkpoint` counts from 1.
    fn checkpoint_hook(&mut self, model: &M, checkpoint: usize) -> Result<()>;

    /// Refreshes a target network for value based learners.
    fn update_target_hook(&mut self, _model: &mut M) -> Result<()> {
        Ok(())
    }

    fn shutdown_hook(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Hooks that only log.
#[derive(Debug, Default)]
pub struct DefaultTrainerHooks {
    rollout_idx: usize,
}

impl<M> TrainerHooks<M> for DefaultTrainerHooks {
    fn post_rollout_hook(&mut self, trajectory: &Trajectory) -> bool {
        let episodes = trajectory.finished_episodes();
        tracing::debug!(
            rollout = self.rollout_idx,
            episodes,
            total_reward = trajectory.total_reward(),
            "rollout finished"
        );
        self.rollout_idx += 1;
        false
    }

    fn post_training_hook(&mut self, _model: &mut M, report: &UpdateReport) -> bool {
        tracing::trace!(update = report.update, loss = report.loss, "update finished");
        false
    }

    fn validation_hook(&mut self, _report: &ValidationReport) -> bool {
        false
    }

    fn checkpoint_hook(&mut self, _model: &M, checkpoint: usize) -> Result<()> {
        tracing::info!(checkpoint, "checkpoint requested, no persistence configured");
        Ok(())
    }
}

/// Synchronous multi environment trainer for a single value head actor critic.
pub struct SyncTrainer<V, E, M, H>
where
    V: VecEnv,
    E: Env + Send,
    M: ActorCritic + Sync,
    H: TrainerHooks<M>,
{
    runner: RolloutRunner<V>,
    validation: Option<ValidationScheduler<E>>,
    model: M,
    hooks: H,
    settings: TrainerSettings,
    estimator: ReturnEstimator,
    cadence: Cadence,
    reward_scaler: Option<RewardScaler>,
    cancel: CancelToken,
    rng: StdRng,
    validation_rng: StdRng,
}

impl<V, E, M, H> SyncTrainer<V, E, M, H>
where
    V: VecEnv,
    E: Env + Send,
    M: ActorCritic + Sync,
    H: TrainerHooks<M>,
{
    /// Fails on invalid settings. The runner's rollout length wins over `settings.nsteps`.
    pub fn new(
        runner: RolloutRunner<V>,
        model: M,
        hooks: H,
        mut settings: TrainerSettings,
    ) -> Result<Self> {
        settings.nsteps = runner.num_steps();
        let estimator = settings.estimator()?;
        let cadence = Cadence::new(&settings, runner.num_envs() * runner.num_steps())?;
        if cadence.num_updates == 0 {
            tracing::warn!(
                total_steps = settings.total_steps,
                "total steps is smaller than one batch, training will not run"
            );
        }
        let reward_scaler = if settings.normalize_rewards {
            Some(RewardScaler::new(settings.gamma as f64, &Device::Cpu)?)
        } else {
            None
        };
        Ok(Self {
            rng: StdRng::seed_from_u64(settings.seed),
            validation_rng: validation_rng(settings.seed),
            runner,
            validation: None,
            model,
            hooks,
            settings,
            estimator,
            cadence,
            reward_scaler,
            cancel: CancelToken::new(),
        })
    }

    /// Validation shares the trainer's cancel token.
    pub fn with_validation(mut self, scheduler: ValidationScheduler<E>) -> Self {
        self.validation = Some(scheduler.with_cancel_token(self.cancel.clone()));
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn cadence(&self) -> Cadence {
        self.cadence
    }

    pub fn settings(&self) -> &TrainerSettings {
        &self.settings
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn into_parts(self) -> (M, H) {
        (self.model, self.hooks)
    }

    /// Closes the training and validation environments.
    pub fn close(&mut self) -> Result<()> {
        self.runner.close()?;
        if let Some(validation) = &mut self.validation {
            validation.close()?;
        }
        Ok(())
    }

    fn batch_size(&self) -> usize {
        self.runner.num_envs() * self.runner.num_steps()
    }

    /// Turns a trajectory into a training batch and runs one optimisation step.
    pub fn learn(&mut self, trajectory: &Trajectory) -> Result<f32> {
        let last_values = self.model.forward(&trajectory.last_states)?.value_head(0)?;
        let rewards = match &mut self.reward_scaler {
            Some(scaler) => scaler.scale(&trajectory.rewards)?,
            None => trajectory.rewards.clone(),
        };
        let inputs = ReturnInputs {
            rewards: &rewards,
            values: trajectory.values(0)?,
            last_values: &last_values,
            dones: &trajectory.dones,
        };
        let (returns, mut advantages) = self.estimator.returns_and_advantages(inputs)?;
        if self.settings.normalize_advantages {
            advantages.normalize();
        }
        let batch = TrainingBatch {
            states: trajectory.folded_states()?,
            actions: trajectory.folded_actions(),
            returns: fold_batch(&returns),
            advantages: fold_batch(&advantages),
            intrinsic_returns: None,
        };
        self.model.backprop(&batch)
    }

    fn validate(&mut self, update: usize, loss: f32, render: bool, start: Instant) -> Result<bool> {
        let Some(scheduler) = &mut self.validation else {
            return Ok(false);
        };
        let summary = scheduler.run(&self.model, render, &mut self.validation_rng)?;
        let batch_size = self.runner.num_envs() * self.runner.num_steps();
        let report = validation_report(update, loss, batch_size, self.cadence, start, summary);
        Ok(self.hooks.validation_hook(&report))
    }
}

/// Builds the report of one validation pass and logs it.
pub fn validation_report(
    update: usize,
    loss: f32,
    batch_size: usize,
    cadence: Cadence,
    start: Instant,
    summary: ValidationSummary,
) -> ValidationReport {
    let elapsed = start.elapsed();
    let frames = cadence.validate_every * batch_size;
    let fps = frames as f32 / elapsed.as_secs_f32().max(f32::EPSILON);
    let report = ValidationReport {
        update,
        total_steps: update * batch_size,
        loss,
        score: summary.mean_score,
        elapsed,
        fps,
        summary,
    };
    tracing::info!(
        update,
        score = report.score,
        total_steps = report.total_steps,
        loss,
        frames,
        elapsed = ?report.elapsed,
        fps,
        "validation"
    );
    report
}

impl<V, E, M, H> Algorithm for SyncTrainer<V, E, M, H>
where
    V: VecEnv,
    E: Env + Send,
    M: ActorCritic + Sync,
    H: TrainerHooks<M>,
{
    fn train(&mut self) -> Result<()> {
        if self.hooks.init_hook(&mut self.model) {
            return Ok(());
        }
        let batch_size = self.batch_size();
        let cadence = self.cadence;
        let mut checkpoint = 0;
        let mut start = Instant::now();
        for update in 1..=cadence.num_updates {
            if self.cancel.is_cancelled() {
                tracing::info!(update, "training cancelled");
                break;
            }
            let trajectory = self.runner.run(&self.model, &mut self.rng)?;
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
                let render = Cadence::is_due(cadence.render_every, update);
                let stop = self.validate(update, loss, render, start)?;
                start = Instant::now();
                break_on_hook_res!(stop);
            }
            if Cadence::is_due(cadence.save_every, update) {
                checkpoint += 1;
                self.hooks.checkpoint_hook(&self.model, checkpoint)?;
            }
            if Cadence::is_due(cadence.update_target_every, update) {
                self.hooks.update_target_hook(&mut self.model)?;
            }
        }
        self.hooks.shutdown_hook()
    }
}
