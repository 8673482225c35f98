use crate::env::StepInfo;
use crate::error::{SyncRlError, ensure_shape};
use anyhow::Result;
use candle_core::Tensor;

/// One synchronized step over the whole environment batch.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub states: Tensor,
    pub next_states: Tensor,
    pub actions: Vec<u32>,
    pub rewards: Vec<f32>,
    pub intrinsic_rewards: Option<Vec<f32>>,
    /// One row per value head, each of length N.
    pub values: Vec<Vec<f32>>,
    pub dones: Vec<bool>,
    pub infos: Vec<StepInfo>,
}

/// T synchronized steps over N environments. Every per-step field is indexed `[t][env]`.
#[derive(Debug, Clone)]
pub struct Trajectory {
    pub states: Vec<Tensor>,
    pub next_states: Vec<Tensor>,
    pub actions: Vec<Vec<u32>>,
    pub rewards: Vec<Vec<f32>>,
    pub intrinsic_rewards: Option<Vec<Vec<f32>>>,
    /// Indexed `[head][t][env]`.
    pub values: Vec<Vec<Vec<f32>>>,
    pub dones: Vec<Vec<bool>>,
    pub infos: Vec<Vec<StepInfo>>,
    /// States following the last step, used to bootstrap the returns.
    pub last_states: Tensor,
}

impl Trajectory {
    /// Transposes a list of step records into a trajectory.
    pub fn from_steps(steps: Vec<StepRecord>, last_states: Tensor) -> Result<Self> {
        let Some(first) = steps.first() else {
            return Err(SyncRlError::config("a trajectory needs at least one step").into());
        };
        let num_heads = first.values.len();
        let with_intrinsic = first.intrinsic_rewards.is_some();
        let num_steps = steps.len();
        let mut trajectory = Self {
            states: Vec::with_capacity(num_steps),
            next_states: Vec::with_capacity(num_steps),
            actions: Vec::with_capacity(num_steps),
            rewards: Vec::with_capacity(num_steps),
            intrinsic_rewards: with_intrinsic.then(|| Vec::with_capacity(num_steps)),
            values: vec![Vec::with_capacity(num_steps); num_heads],
            dones: Vec::with_capacity(num_steps),
            infos: Vec::with_capacity(num_steps),
            last_states,
        };
        for step in steps {
            let StepRecord {
                states,
                next_states,
                actions,
                rewards,
                intrinsic_rewards,
                values,
                dones,
                infos,
            } = step;
            if values.len() != num_heads {
                anyhow::bail!(
                    "value head count changed during the rollout: {} vs {num_heads}",
                    values.len()
                );
            }
            match (&mut trajectory.intrinsic_rewards, intrinsic_rewards) {
                (Some(all), Some(step_rewards)) => all.push(step_rewards),
                (None, None) => {}
                _ => anyhow::bail!("intrinsic rewards must be present on every step or on none"),
            }
            for (head, row) in values.into_iter().enumerate() {
                trajectory.values[head].push(row);
            }
            trajectory.states.push(states);
            trajectory.next_states.push(next_states);
            trajectory.actions.push(actions);
            trajectory.rewards.push(rewards);
            trajectory.dones.push(dones);
            trajectory.infos.push(infos);
        }
        trajectory.validate()?;
        Ok(trajectory)
    }

    pub fn num_steps(&self) -> usize {
        self.rewards.len()
    }

    pub fn num_envs(&self) -> usize {
        self.rewards.first().map(|r| r.len()).unwrap_or(0)
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.num_steps(), self.num_envs())
    }

    /// Checks that every per-step array shares the same (T, N) leading dimensions.
    pub fn validate(&self) -> Result<(), SyncRlError> {
        let shape = self.shape();
        ensure_shape("actions", &self.actions, shape)?;
        ensure_shape("rewards", &self.rewards, shape)?;
        ensure_shape("dones", &self.dones, shape)?;
        ensure_shape("infos", &self.infos, shape)?;
        if let Some(intrinsic) = &self.intrinsic_rewards {
            ensure_shape("intrinsic rewards", intrinsic, shape)?;
        }
        for head in &self.values {
            ensure_shape("values", head, shape)?;
        }
        for (context, states) in [("states", &self.states), ("next states", &self.next_states)] {
            if states.len() != shape.0 {
                return Err(SyncRlError::ShapeMismatch {
                    context,
                    expected: shape,
                    actual: (states.len(), shape.1),
                });
            }
            for state in states {
                let envs = state.dims().first().copied().unwrap_or(0);
                if envs != shape.1 {
                    return Err(SyncRlError::ShapeMismatch {
                        context,
                        expected: shape,
                        actual: (states.len(), envs),
                    });
                }
            }
        }
        Ok(())
    }

    /// The `[t][env]` value matrix of one value head.
    pub fn values(&self, head: usize) -> Result<&[Vec<f32>]> {
        self.values
            .get(head)
            .map(|v| v.as_slice())
            .ok_or_else(|| anyhow::anyhow!("trajectory has no value head {head}"))
    }

    /// Number of episodes that ended during the rollout.
    pub fn finished_episodes(&self) -> usize {
        self.dones.iter().flatten().filter(|d| **d).count()
    }

    pub fn total_reward(&self) -> f32 {
        self.rewards.iter().flatten().sum()
    }

    /// States folded into a single (T*N, ...) batch, time major.
    pub fn folded_states(&self) -> Result<Tensor> {
        Ok(Tensor::cat(&self.states, 0)?)
    }

    pub fn folded_next_states(&self) -> Result<Tensor> {
        Ok(Tensor::cat(&self.next_states, 0)?)
    }

    /// All states stacked into a (T, N, ...) tensor.
    pub fn stacked_states(&self) -> Result<Tensor> {
        Ok(Tensor::stack(&self.states, 0)?)
    }

    pub fn folded_actions(&self) -> Vec<u32> {
        fold_batch(&self.actions)
    }
}

/// Folds a `[t][env]` matrix into a time major vector.
pub fn fold_batch<T: Copy>(rows: &[Vec<T>]) -> Vec<T> {
    rows.iter().flat_map(|row| row.iter().copied()).collect()
}
