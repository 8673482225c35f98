use anyhow::Result;
use candle_core::Tensor;
use syncrl_core::env::{
    BatchStep, Env, EnvironmentDescription, SequentialVecEnv, ThreadVecEnv, VecEnv,
};
use syncrl_core::error::SyncRlError;

/// How the training environments are stepped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EnvPoolType {
    #[default]
    Sequential,
    Threaded,
}

impl EnvPoolType {
    pub fn from_threaded(threaded: bool) -> Self {
        if threaded { Self::Threaded } else { Self::Sequential }
    }

    pub fn build<E: Env + Send + 'static>(&self, envs: Vec<E>) -> Result<EnvPool<E>> {
        match self {
            Self::Sequential => Ok(EnvPool::Sequential(SequentialVecEnv::new(envs)?)),
            Self::Threaded => Ok(EnvPool::Threaded(ThreadVecEnv::new(envs)?)),
        }
    }
}

/// Either flavour of environment batch behind one type.
pub enum EnvPool<E: Env> {
    Sequential(SequentialVecEnv<E>),
    Threaded(ThreadVecEnv),
}

impl<E: Env> VecEnv for EnvPool<E> {
    fn num_envs(&self) -> usize {
        match self {
            Self::Sequential(envs) => envs.num_envs(),
            Self::Threaded(envs) => envs.num_envs(),
        }
    }

    fn reset(&mut self, seed: u64) -> Result<Tensor> {
        match self {
            Self::Sequential(envs) => envs.reset(seed),
            Self::Threaded(envs) => envs.reset(seed),
        }
    }

    fn step(&mut self, actions: &[u32]) -> Result<BatchStep> {
        match self {
            Self::Sequential(envs) => envs.step(actions),
            Self::Threaded(envs) => envs.step(actions),
        }
    }

    fn close(&mut self) -> Result<()> {
        match self {
            Self::Sequential(envs) => envs.close(),
            Self::Threaded(envs) => envs.close(),
        }
    }

    fn env_description(&self) -> EnvironmentDescription {
        match self {
            Self::Sequential(envs) => envs.env_description(),
            Self::Threaded(envs) => envs.env_description(),
        }
    }
}

/// Calls `make_env` once per index.
pub fn build_envs<E, F>(count: usize, make_env: &F) -> Result<Vec<E>>
where
    F: Fn(usize) -> Result<E>,
{
    if count == 0 {
        return Err(SyncRlError::config("at least one environment is required").into());
    }
    (0..count).map(make_env).collect()
}
