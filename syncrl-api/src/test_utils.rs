//! Small deterministic environments, a scripted model and recording hooks for tests.

use anyhow::Result;
use candle_core::{Device, Tensor};
use std::sync::{Arc, Mutex, PoisonError};
use syncrl_core::env::{Env, EnvironmentDescription, SnapShot, Space};
use syncrl_core::model::{ActorCritic, PolicyOutput, TrainingBatch};
use syncrl_core::sync_trainer::{TrainerHooks, UpdateReport, ValidationReport};
use syncrl_core::trajectory::Trajectory;

/// A one dimensional corridor. Action 1 moves right, action 0 moves left. Reaching the right end
/// pays 1 and terminates; episodes are truncated after `max_steps`.
#[derive(Debug, Clone)]
pub struct Corridor {
    pub length: usize,
    pub max_steps: usize,
    position: usize,
    steps: usize,
    renders: Arc<Mutex<usize>>,
}

impl Corridor {
    pub fn new(length: usize, max_steps: usize) -> Self {
        Self {
            length: length.max(2),
            max_steps,
            position: 0,
            steps: 0,
            renders: Arc::default(),
        }
    }

    /// Shared render counter, cloned along with the env.
    pub fn renders(&self) -> Arc<Mutex<usize>> {
        self.renders.clone()
    }

    fn observation(&self) -> Result<Tensor> {
        let mut one_hot = vec![0f32; self.length];
        one_hot[self.position] = 1.;
        Ok(Tensor::from_vec(one_hot, self.length, &Device::Cpu)?)
    }
}

impl Env for Corridor {
    fn reset(&mut self, _seed: u64) -> Result<Tensor> {
        self.position = 0;
        self.steps = 0;
        self.observation()
    }

    fn step(&mut self, action: u32) -> Result<SnapShot> {
        self.steps += 1;
        self.position = match action {
            0 => self.position.saturating_sub(1),
            _ => (self.position + 1).min(self.length - 1),
        };
        let terminated = self.position == self.length - 1;
        Ok(SnapShot {
            state: self.observation()?,
            reward: if terminated { 1. } else { 0. },
            terminated,
            truncated: !terminated && self.steps >= self.max_steps,
        })
    }

    fn render(&mut self) -> Result<()> {
        *self.renders.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        Ok(())
    }

    fn env_description(&self) -> EnvironmentDescription {
        EnvironmentDescription::new(
            Space::continous_from_dims(vec![self.length]),
            Space::Discrete(2),
        )
    }
}

/// Channel last frame stacks `(size, size, 2)` with a single lit pixel that the four actions move
/// around. The previous frame sits in channel 0. Reward 1 whenever the pixel touches the top row.
#[derive(Debug, Clone)]
pub struct Frames {
    pub size: usize,
    pub max_steps: usize,
    row: usize,
    col: usize,
    previous: (usize, usize),
    steps: usize,
}

impl Frames {
    pub fn new(size: usize, max_steps: usize) -> Self {
        Self {
            size: size.max(2),
            max_steps,
            row: 0,
            col: 0,
            previous: (0, 0),
            steps: 0,
        }
    }

    fn observation(&self) -> Result<Tensor> {
        let mut pixels = vec![0f32; self.size * self.size * 2];
        let (prev_row, prev_col) = self.previous;
        pixels[(prev_row * self.size + prev_col) * 2] = 255.;
        pixels[(self.row * self.size + self.col) * 2 + 1] = 255.;
        Ok(Tensor::from_vec(pixels, (self.size, self.size, 2), &Device::Cpu)?)
    }
}

impl Env for Frames {
    fn reset(&mut self, seed: u64) -> Result<Tensor> {
        self.row = self.size - 1;
        self.col = seed as usize % self.size;
        self.previous = (self.row, self.col);
        self.steps = 0;
        self.observation()
    }

    fn step(&mut self, action: u32) -> Result<SnapShot> {
        self.steps += 1;
        self.previous = (self.row, self.col);
        match action {
            0 => self.row = self.row.saturating_sub(1),
            1 => self.row = (self.row + 1).min(self.size - 1),
            2 => self.col = self.col.saturating_sub(1),
            _ => self.col = (self.col + 1).min(self.size - 1),
        }
        Ok(SnapShot {
            state: self.observation()?,
            reward: if self.row == 0 { 1. } else { 0. },
            terminated: false,
            truncated: self.steps >= self.max_steps,
        })
    }

    fn env_description(&self) -> EnvironmentDescription {
        EnvironmentDescription::new(
            Space::continous_from_dims(vec![self.size, self.size, 2]),
            Space::Discrete(4),
        )
    }
}

/// Fixed action probabilities and a constant value for every state. Records every batch it is
/// trained on.
#[derive(Debug, Clone)]
pub struct ScriptedModel {
    pub probs: Vec<f32>,
    pub value: f32,
    pub batches: Vec<TrainingBatch>,
}

impl ScriptedModel {
    pub fn new(probs: Vec<f32>, value: f32) -> Self {
        Self {
            probs,
            value,
            batches: vec![],
        }
    }
}

impl ActorCritic for ScriptedModel {
    fn forward(&self, states: &Tensor) -> Result<PolicyOutput> {
        let batch = states.dim(0)?;
        let probs = Tensor::from_slice(&self.probs, self.probs.len(), &Device::Cpu)?
            .unsqueeze(0)?
            .repeat((batch, 1))?;
        Ok(PolicyOutput {
            probs,
            values: vec![Tensor::full(self.value, batch, &Device::Cpu)?],
        })
    }

    fn backprop(&mut self, batch: &TrainingBatch) -> Result<f32> {
        self.batches.push(batch.clone());
        Ok(0.)
    }
}

/// Number of times every hook fired.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookCounts {
    pub init: usize,
    pub rollouts: usize,
    pub updates: usize,
    pub validations: usize,
    pub checkpoints: Vec<usize>,
    pub target_updates: usize,
    pub shutdowns: usize,
}

/// Counts hook calls and stops after `stop_after` updates when set.
#[derive(Debug, Default)]
pub struct RecordingHooks {
    pub counts: HookCounts,
    pub stop_after: Option<usize>,
    pub scores: Vec<Option<f32>>,
}

impl<M> TrainerHooks<M> for RecordingHooks {
    fn init_hook(&mut self, _model: &mut M) -> bool {
        self.counts.init += 1;
        false
    }

    fn post_rollout_hook(&mut self, _trajectory: &Trajectory) -> bool {
        self.counts.rollouts += 1;
        false
    }

    fn post_training_hook(&mut self, _model: &mut M, report: &UpdateReport) -> bool {
        self.counts.updates += 1;
        self.stop_after.is_some_and(|stop| report.update >= stop)
    }

    fn validation_hook(&mut self, report: &ValidationReport) -> bool {
        self.counts.validations += 1;
        self.scores.push(report.score);
        false
    }

    fn checkpoint_hook(&mut self, _model: &M, checkpoint: usize) -> Result<()> {
        self.counts.checkpoints.push(checkpoint);
        Ok(())
    }

    fn update_target_hook(&mut self, _model: &mut M) -> Result<()> {
        self.counts.target_updates += 1;
        Ok(())
    }

    fn shutdown_hook(&mut self) -> Result<()> {
        self.counts.shutdowns += 1;
        Ok(())
    }
}
