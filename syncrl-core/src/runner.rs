use crate::distributions::{random_actions, sample_actions};
use crate::env::VecEnv;
use crate::error::SyncRlError;
use crate::model::ActorCritic;
use crate::trajectory::{StepRecord, Trajectory};
use anyhow::Result;
use candle_core::Tensor;
use rand::Rng;

/// Collects fixed length trajectories from a batch of environments stepped in lockstep.
///
/// The runner owns the environment batch and the states the next step starts from. Episodes
/// carry over from one rollout to the next.
pub struct RolloutRunner<V: VecEnv> {
    env: V,
    num_steps: usize,
    states: Tensor,
}

impl<V: VecEnv> RolloutRunner<V> {
    pub fn new(mut env: V, num_steps: usize, seed: u64) -> Result<Self> {
        if num_steps == 0 {
            return Err(SyncRlError::config("a rollout needs at least one step").into());
        }
        let states = env.reset(seed)?;
        Ok(Self {
            env,
            num_steps,
            states,
        })
    }

    pub fn num_steps(&self) -> usize {
        self.num_steps
    }

    pub fn num_envs(&self) -> usize {
        self.env.num_envs()
    }

    pub fn env(&self) -> &V {
        &self.env
    }

    /// The states the next rollout starts from.
    pub fn states(&self) -> &Tensor {
        &self.states
    }

    pub fn reset(&mut self, seed: u64) -> Result<()> {
        self.states = self.env.reset(seed)?;
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        self.env.close()
    }

    pub fn run<M, R>(&mut self, model: &M, rng: &mut R) -> Result<Trajectory>
    where
        M: ActorCritic + ?Sized,
        R: Rng,
    {
        self.collect(model, rng, |_| Ok(None))
    }

    /// Like [`Self::run`], additionally recording the intrinsic reward `intrinsic` assigns to
    /// every batch of next states.
    pub fn run_with_intrinsic<M, R, F>(
        &mut self,
        model: &M,
        rng: &mut R,
        mut intrinsic: F,
    ) -> Result<Trajectory>
    where
        M: ActorCritic + ?Sized,
        R: Rng,
        F: FnMut(&Tensor) -> Result<Vec<f32>>,
    {
        self.collect(model, rng, |next_states| intrinsic(next_states).map(Some))
    }

    fn collect<M, R, F>(&mut self, model: &M, rng: &mut R, mut intrinsic: F) -> Result<Trajectory>
    where
        M: ActorCritic + ?Sized,
        R: Rng,
        F: FnMut(&Tensor) -> Result<Option<Vec<f32>>>,
    {
        let mut steps = Vec::with_capacity(self.num_steps);
        for _ in 0..self.num_steps {
            let output = model.forward(&self.states)?;
            let actions = sample_actions(&output.probs, rng)?;
            let values = (0..output.values.len())
                .map(|head| output.value_head(head))
                .collect::<Result<Vec<_>>>()?;
            let batch = self.env.step(&actions)?;
            let intrinsic_rewards = intrinsic(&batch.next_states)?;
            let states = std::mem::replace(&mut self.states, batch.next_states.clone());
            steps.push(StepRecord {
                states,
                next_states: batch.next_states,
                actions,
                rewards: batch.rewards,
                intrinsic_rewards,
                values,
                dones: batch.dones,
                infos: batch.infos,
            });
        }
        let trajectory = Trajectory::from_steps(steps, self.states.clone())?;
        tracing::trace!(
            steps = trajectory.num_steps(),
            envs = trajectory.num_envs(),
            episodes = trajectory.finished_episodes(),
            "rollout collected"
        );
        Ok(trajectory)
    }

    /// Steps the batch `steps` times with uniformly random actions and hands every batch of next
    /// states to `observe`. Used to seed observation statistics before training.
    pub fn warmup<R, F>(&mut self, steps: usize, rng: &mut R, mut observe: F) -> Result<()>
    where
        R: Rng,
        F: FnMut(&Tensor) -> Result<()>,
    {
        let num_envs = self.env.num_envs();
        let action_size = self.env.env_description().action_size();
        if action_size == 0 {
            return Err(SyncRlError::config("the action space is empty").into());
        }
        for _ in 0..steps {
            let actions = random_actions(num_envs, action_size, rng);
            let batch = self.env.step(&actions)?;
            observe(&batch.next_states)?;
            self.states = batch.next_states;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::RolloutRunner;
    use crate::env::{Env, EnvironmentDescription, SequentialVecEnv, SnapShot, Space};
    use crate::model::{ActorCritic, PolicyOutput, TrainingBatch};
    use anyhow::Result;
    use candle_core::{Device, Tensor};
    use rand::{SeedableRng, rngs::StdRng};

    // reward equals the action, episode ends after three steps
    struct Steps3 {
        t: u32,
    }

    impl Env for Steps3 {
        fn reset(&mut self, _seed: u64) -> Result<Tensor> {
            self.t = 0;
            Ok(Tensor::new(&[0f32], &Device::Cpu)?)
        }

        fn step(&mut self, action: u32) -> Result<SnapShot> {
            self.t += 1;
            Ok(SnapShot {
                state: Tensor::new(&[self.t as f32], &Device::Cpu)?,
                reward: action as f32,
                terminated: self.t == 3,
                truncated: false,
            })
        }

        fn env_description(&self) -> EnvironmentDescription {
            EnvironmentDescription::new(Space::continous_from_dims(vec![1]), Space::Discrete(2))
        }
    }

    // always picks action 1, value equals the observation
    struct AlwaysOne;

    impl ActorCritic for AlwaysOne {
        fn forward(&self, states: &Tensor) -> Result<PolicyOutput> {
            let batch = states.dim(0)?;
            let probs = Tensor::new(&[0f32, 1.], &Device::Cpu)?
                .unsqueeze(0)?
                .repeat((batch, 1))?;
            Ok(PolicyOutput {
                probs,
                values: vec![states.flatten_all()?],
            })
        }

        fn backprop(&mut self, _batch: &TrainingBatch) -> Result<f32> {
            Ok(0.)
        }
    }

    fn runner(
        num_envs: usize,
        num_steps: usize,
    ) -> Result<RolloutRunner<SequentialVecEnv<Steps3>>> {
        let envs = (0..num_envs).map(|_| Steps3 { t: 0 }).collect();
        RolloutRunner::new(SequentialVecEnv::new(envs)?, num_steps, 0)
    }

    #[test]
    fn rollout_has_the_requested_shape_and_continues_episodes() -> Result<()> {
        let mut runner = runner(2, 2)?;
        let mut rng = StdRng::seed_from_u64(0);
        let first = runner.run(&AlwaysOne, &mut rng)?;
        assert_eq!(first.shape(), (2, 2));
        assert_eq!(first.actions, vec![vec![1, 1]; 2]);
        assert_eq!(first.values(0)?, &[vec![0., 0.], vec![1., 1.]]);
        let second = runner.run(&AlwaysOne, &mut rng)?;
        // the third step of every episode is the first step of the second rollout
        assert_eq!(second.dones[0], vec![true, true]);
        assert_eq!(second.values(0)?[0], vec![2., 2.]);
        assert_eq!(second.last_states.flatten_all()?.to_vec1::<f32>()?, vec![1., 1.]);
        Ok(())
    }

    #[test]
    fn intrinsic_rewards_are_recorded_per_step() -> Result<()> {
        let mut runner = runner(3, 4)?;
        let mut rng = StdRng::seed_from_u64(0);
        let trajectory = runner.run_with_intrinsic(&AlwaysOne, &mut rng, |next| {
            Ok(next.flatten_all()?.to_vec1::<f32>()?)
        })?;
        let intrinsic = trajectory.intrinsic_rewards.as_ref().map(|r| r.len());
        assert_eq!(intrinsic, Some(4));
        Ok(())
    }

    #[test]
    fn warmup_observes_every_step() -> Result<()> {
        let mut runner = runner(2, 1)?;
        let mut rng = StdRng::seed_from_u64(0);
        let mut seen = 0;
        runner.warmup(5, &mut rng, |next| {
            seen += next.dim(0)?;
            Ok(())
        })?;
        assert_eq!(seen, 10);
        Ok(())
    }

    #[test]
    fn zero_steps_is_a_config_error() -> Result<()> {
        assert!(runner(1, 0).is_err());
        Ok(())
    }
}
