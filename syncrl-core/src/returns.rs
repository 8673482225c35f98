//! Bootstrapped return and advantage estimation over a fixed (T, N) window.
//!
//! All estimators share the same conventions:
//! - inputs are indexed `[t][env]`,
//! - `last_values[env]` is the value estimate of the state following the window,
//! - a done flag at step `t` cuts every contribution flowing back from steps after `t`,
//! - each environment column is processed in a single reverse pass.

use crate::error::{SyncRlError, ensure_shape};
use derive_more::Deref;
use serde::Deserialize;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReturnAlgorithm {
    NStep,
    Lambda,
    Gae,
}

impl FromStr for ReturnAlgorithm {
    type Err = SyncRlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nstep" => Ok(Self::NStep),
            "lambda" => Ok(Self::Lambda),
            "gae" => Ok(Self::Gae),
            other => Err(SyncRlError::config(format!(
                "return type {other} is not valid, expected one of nstep, lambda, gae"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RewardClip {
    #[default]
    None,
    /// Clip every reward into [-1, 1] before the recurrence.
    Unit,
}

impl RewardClip {
    fn apply(&self, reward: f32) -> f32 {
        match self {
            Self::None => reward,
            Self::Unit => reward.clamp(-1., 1.),
        }
    }
}

#[derive(Deref, Debug, Clone, PartialEq)]
pub struct Returns(pub Vec<Vec<f32>>);

#[derive(Deref, Debug, Clone, PartialEq)]
pub struct Advantages(pub Vec<Vec<f32>>);

impl Advantages {
    /// Normalizes the whole window to zero mean and unit variance.
    pub fn normalize(&mut self) {
        let count = self.0.iter().map(|row| row.len()).sum::<usize>();
        if count == 0 {
            return;
        }
        let mean = self.0.iter().flatten().sum::<f32>() / count as f32;
        let variance =
            self.0.iter().flatten().map(|x| (*x - mean).powi(2)).sum::<f32>() / count as f32;
        let std = variance.sqrt() + 1e-8;
        for x in self.0.iter_mut().flatten() {
            *x = (*x - mean) / std;
        }
    }
}

/// The borrowed inputs of one estimation.
#[derive(Debug, Clone, Copy)]
pub struct ReturnInputs<'a> {
    pub rewards: &'a [Vec<f32>],
    pub values: &'a [Vec<f32>],
    pub last_values: &'a [f32],
    pub dones: &'a [Vec<bool>],
}

impl ReturnInputs<'_> {
    fn validate(&self) -> Result<(usize, usize), SyncRlError> {
        let num_steps = self.rewards.len();
        let num_envs = self.last_values.len();
        let shape = (num_steps, num_envs);
        ensure_shape("rewards", self.rewards, shape)?;
        ensure_shape("values", self.values, shape)?;
        ensure_shape("dones", self.dones, shape)?;
        Ok(shape)
    }
}

/// Return estimator. The algorithm is fixed at construction for the whole training run.
#[derive(Debug, Clone, Copy)]
pub struct ReturnEstimator {
    pub algorithm: ReturnAlgorithm,
    pub gamma: f32,
    pub lambda: f32,
    pub clip: RewardClip,
}

impl ReturnEstimator {
    pub fn new(
        algorithm: ReturnAlgorithm,
        gamma: f32,
        lambda: f32,
        clip: RewardClip,
    ) -> Result<Self, SyncRlError> {
        if !(0. ..=1.).contains(&gamma) {
            return Err(SyncRlError::config(format!("gamma {gamma} is outside [0, 1]")));
        }
        if !(0. ..=1.).contains(&lambda) {
            return Err(SyncRlError::config(format!("lambda {lambda} is outside [0, 1]")));
        }
        Ok(Self {
            algorithm,
            gamma,
            lambda,
            clip,
        })
    }

    /// Value regression targets for the configured algorithm. GAE targets are the advantages
    /// with the value baseline added back.
    pub fn returns(&self, inputs: ReturnInputs) -> Result<Returns, SyncRlError> {
        match self.algorithm {
            ReturnAlgorithm::NStep => self.nstep(inputs),
            ReturnAlgorithm::Lambda => self.lambda_return(inputs),
            ReturnAlgorithm::Gae => {
                let Advantages(mut advantages) = self.gae(inputs)?;
                for (row, values) in advantages.iter_mut().zip(inputs.values) {
                    for (adv, value) in row.iter_mut().zip(values) {
                        *adv += value;
                    }
                }
                Ok(Returns(advantages))
            }
        }
    }

    /// Policy gradient weights for the configured algorithm.
    pub fn advantages(&self, inputs: ReturnInputs) -> Result<Advantages, SyncRlError> {
        match self.algorithm {
            ReturnAlgorithm::Gae => self.gae(inputs),
            ReturnAlgorithm::NStep | ReturnAlgorithm::Lambda => {
                let returns = self.returns(inputs)?;
                Ok(advantages_from_returns(&returns, inputs.values))
            }
        }
    }

    /// Value targets and policy gradient weights from a single estimation.
    pub fn returns_and_advantages(
        &self,
        inputs: ReturnInputs,
    ) -> Result<(Returns, Advantages), SyncRlError> {
        let returns = self.returns(inputs)?;
        let advantages = advantages_from_returns(&returns, inputs.values);
        Ok((returns, advantages))
    }

    /// n-step bootstrapped return: `R[t] = r[t] + γ R[t+1] (1 - done[t])` with the last value
    /// standing in for `R[T]`.
    pub fn nstep(&self, inputs: ReturnInputs) -> Result<Returns, SyncRlError> {
        let (num_steps, num_envs) = inputs.validate()?;
        let mut returns = vec![vec![0f32; num_envs]; num_steps];
        for env in 0..num_envs {
            // seeded with the bootstrap value itself, the done mask of each step then cuts it.
            // this keeps R[T-1] - V[T-1] equal to the last GAE delta, so GAE with λ = 1 is
            // exactly this return minus the values.
            let mut next_return = inputs.last_values[env];
            for t in (0..num_steps).rev() {
                let reward = self.clip.apply(inputs.rewards[t][env]);
                next_return = reward + self.gamma * next_return * not_done(inputs.dones[t][env]);
                returns[t][env] = next_return;
            }
        }
        Ok(Returns(returns))
    }

    /// λ-return: blends the multi-step bootstrap with the one-step value baseline.
    /// `λ = 1` gives the n-step return, `λ = 0` the one-step TD target.
    pub fn lambda_return(&self, inputs: ReturnInputs) -> Result<Returns, SyncRlError> {
        let (num_steps, num_envs) = inputs.validate()?;
        let (gamma, lambda) = (self.gamma, self.lambda);
        let mut returns = vec![vec![0f32; num_envs]; num_steps];
        for env in 0..num_envs {
            let mut next_return = inputs.last_values[env];
            let mut next_value = inputs.last_values[env];
            for t in (0..num_steps).rev() {
                let reward = self.clip.apply(inputs.rewards[t][env]);
                let bootstrap = lambda * next_return + (1. - lambda) * next_value;
                next_return = reward + gamma * bootstrap * not_done(inputs.dones[t][env]);
                next_value = inputs.values[t][env];
                returns[t][env] = next_return;
            }
        }
        Ok(Returns(returns))
    }

    /// Generalised Advantage Estimation:
    /// `δ[t] = r[t] + γ V[t+1] (1 - done[t]) - V[t]`, `A[t] = δ[t] + γλ A[t+1] (1 - done[t])`.
    pub fn gae(&self, inputs: ReturnInputs) -> Result<Advantages, SyncRlError> {
        let (num_steps, num_envs) = inputs.validate()?;
        let (gamma, lambda) = (self.gamma, self.lambda);
        let mut advantages = vec![vec![0f32; num_envs]; num_steps];
        for env in 0..num_envs {
            let mut next_value = inputs.last_values[env];
            let mut next_advantage = 0f32;
            for t in (0..num_steps).rev() {
                let mask = not_done(inputs.dones[t][env]);
                let reward = self.clip.apply(inputs.rewards[t][env]);
                let value = inputs.values[t][env];
                let delta = reward + gamma * next_value * mask - value;
                next_advantage = delta + gamma * lambda * next_advantage * mask;
                next_value = value;
                advantages[t][env] = next_advantage;
            }
        }
        Ok(Advantages(advantages))
    }
}

pub fn advantages_from_returns(returns: &Returns, values: &[Vec<f32>]) -> Advantages {
    Advantages(
        returns
            .iter()
            .zip(values)
            .map(|(row, values)| row.iter().zip(values).map(|(r, v)| r - v).collect())
            .collect(),
    )
}

/// A `[t][env]` matrix of `false`, for reward streams that ignore episode boundaries.
pub fn no_dones(num_steps: usize, num_envs: usize) -> Vec<Vec<bool>> {
    vec![vec![false; num_envs]; num_steps]
}

#[inline(always)]
fn not_done(done: bool) -> f32 {
    if done { 0. } else { 1. }
}
