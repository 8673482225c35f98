pub mod sequential_vec_env;
pub mod thread_vec_env;

use anyhow::Result;
use candle_core::Tensor;

pub use sequential_vec_env::SequentialVecEnv;
pub use thread_vec_env::ThreadVecEnv;

#[derive(Debug, Clone)]
pub enum Space {
    Discrete(usize),
    Continous {
        min: Option<f32>,
        max: Option<f32>,
        dims: Vec<usize>,
    },
}

impl Space {
    pub fn continous_from_dims(dims: Vec<usize>) -> Self {
        Self::Continous {
            min: None,
            max: None,
            dims,
        }
    }

    pub fn size(&self) -> usize {
        match &self {
            Self::Discrete(size) => *size,
            Self::Continous { dims, .. } => dims.iter().product(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnvironmentDescription {
    pub observation_space: Space,
    pub action_space: Space,
}

impl EnvironmentDescription {
    pub fn new(observation_space: Space, action_space: Space) -> Self {
        Self {
            observation_space,
            action_space,
        }
    }

    pub fn action_size(&self) -> usize {
        self.action_space.size()
    }

    pub fn observation_size(&self) -> usize {
        self.observation_space.size()
    }
}

/// What a single environment hands back after one step.
pub struct SnapShot {
    pub state: Tensor,
    pub reward: f32,
    pub terminated: bool,
    pub truncated: bool,
}

impl SnapShot {
    pub fn done(&self) -> bool {
        self.terminated || self.truncated
    }
}

/// Auxiliary per-step information recorded alongside each transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepInfo {
    pub terminated: bool,
    pub truncated: bool,
}

/// A single environment. Used directly by the validation workers and wrapped into a
/// [`VecEnv`] for training.
pub trait Env {
    fn reset(&mut self, seed: u64) -> Result<Tensor>;

    fn step(&mut self, action: u32) -> Result<SnapShot>;

    fn render(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn env_description(&self) -> EnvironmentDescription;
}

impl<E: Env + ?Sized> Env for Box<E> {
    fn reset(&mut self, seed: u64) -> Result<Tensor> {
        (**self).reset(seed)
    }

    fn step(&mut self, action: u32) -> Result<SnapShot> {
        (**self).step(action)
    }

    fn render(&mut self) -> Result<()> {
        (**self).render()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }

    fn env_description(&self) -> EnvironmentDescription {
        (**self).env_description()
    }
}

/// The result of stepping every environment of a batch once.
#[derive(Debug, Clone)]
pub struct BatchStep {
    /// Stacked states of shape (N, ...). Environments whose episode ended during the step have
    /// already been reset, so their entry is the first state of the next episode.
    pub next_states: Tensor,
    pub rewards: Vec<f32>,
    pub dones: Vec<bool>,
    pub infos: Vec<StepInfo>,
}

/// A batch of N environments stepped in lockstep.
pub trait VecEnv {
    fn num_envs(&self) -> usize;

    /// Resets every environment. Environment `i` is seeded with `seed + i`.
    fn reset(&mut self, seed: u64) -> Result<Tensor>;

    /// Steps all environments with one action each and blocks until every environment has
    /// answered.
    fn step(&mut self, actions: &[u32]) -> Result<BatchStep>;

    fn close(&mut self) -> Result<()>;

    fn env_description(&self) -> EnvironmentDescription;
}

pub(crate) struct Transition {
    pub next_state: Tensor,
    pub reward: f32,
    pub done: bool,
    pub info: StepInfo,
}

/// Steps `env` and resets it in place when the episode ends.
pub(crate) fn step_with_autoreset<E: Env + ?Sized>(
    env: &mut E,
    action: u32,
    reset_seed: u64,
) -> Result<Transition> {
    let snapshot = env.step(action)?;
    let done = snapshot.done();
    let SnapShot {
        state,
        reward,
        terminated,
        truncated,
    } = snapshot;
    let next_state = if done { env.reset(reset_seed)? } else { state };
    Ok(Transition {
        next_state,
        reward,
        done,
        info: StepInfo {
            terminated,
            truncated,
        },
    })
}

pub(crate) fn collect_batch(transitions: Vec<Transition>) -> Result<BatchStep> {
    let mut states = Vec::with_capacity(transitions.len());
    let mut rewards = Vec::with_capacity(transitions.len());
    let mut dones = Vec::with_capacity(transitions.len());
    let mut infos = Vec::with_capacity(transitions.len());
    for Transition {
        next_state,
        reward,
        done,
        info,
    } in transitions
    {
        states.push(next_state);
        rewards.push(reward);
        dones.push(done);
        infos.push(info);
    }
    Ok(BatchStep {
        next_states: Tensor::stack(&states, 0)?,
        rewards,
        dones,
        infos,
    })
}
