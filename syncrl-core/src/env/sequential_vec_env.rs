use super::{
    BatchStep, Env, EnvironmentDescription, VecEnv, collect_batch, step_with_autoreset,
};
use crate::error::SyncRlError;
use anyhow::Result;
use candle_core::Tensor;

/// Steps its environments one after another on the calling thread.
pub struct SequentialVecEnv<E: Env> {
    envs: Vec<E>,
    // per env seed used for the next automatic reset
    reset_seeds: Vec<u64>,
}

impl<E: Env> SequentialVecEnv<E> {
    pub fn new(envs: Vec<E>) -> Result<Self> {
        if envs.is_empty() {
            return Err(SyncRlError::config("an environment batch needs at least one env").into());
        }
        let reset_seeds = (0..envs.len() as u64).collect();
        Ok(Self { envs, reset_seeds })
    }

    pub fn envs(&self) -> &[E] {
        &self.envs
    }
}

impl<E: Env> VecEnv for SequentialVecEnv<E> {
    fn num_envs(&self) -> usize {
        self.envs.len()
    }

    fn reset(&mut self, seed: u64) -> Result<Tensor> {
        let num_envs = self.envs.len() as u64;
        let mut states = Vec::with_capacity(self.envs.len());
        for (idx, env) in self.envs.iter_mut().enumerate() {
            let env_seed = seed.wrapping_add(idx as u64);
            states.push(env.reset(env_seed)?);
            self.reset_seeds[idx] = env_seed.wrapping_add(num_envs);
        }
        Ok(Tensor::stack(&states, 0)?)
    }

    fn step(&mut self, actions: &[u32]) -> Result<BatchStep> {
        if actions.len() != self.envs.len() {
            return Err(SyncRlError::Environment(format!(
                "expected {} actions, got {}",
                self.envs.len(),
                actions.len()
            ))
            .into());
        }
        let num_envs = self.envs.len() as u64;
        let mut transitions = Vec::with_capacity(self.envs.len());
        for (idx, (env, action)) in self.envs.iter_mut().zip(actions).enumerate() {
            let transition = step_with_autoreset(env, *action, self.reset_seeds[idx])?;
            if transition.done {
                self.reset_seeds[idx] = self.reset_seeds[idx].wrapping_add(num_envs);
            }
            transitions.push(transition);
        }
        collect_batch(transitions)
    }

    fn close(&mut self) -> Result<()> {
        for env in self.envs.iter_mut() {
            env.close()?;
        }
        Ok(())
    }

    fn env_description(&self) -> EnvironmentDescription {
        self.envs[0].env_description()
    }
}
