use anyhow::Result;
use candle_core::{Device, Tensor};
use syncrl_core::Algorithm;
use syncrl_core::env::{Env, EnvironmentDescription, SequentialVecEnv, SnapShot, Space};
use syncrl_core::model::{ActorCritic, PolicyOutput, TrainingBatch};
use syncrl_core::returns::ReturnAlgorithm;
use syncrl_core::runner::RolloutRunner;
use syncrl_core::sync_trainer::{
    DefaultTrainerHooks, SyncTrainer, TrainerHooks, TrainerSettings, UpdateReport,
    ValidationReport,
};
use syncrl_core::trajectory::Trajectory;
use syncrl_core::validation::ValidationScheduler;

// pays a fixed reward every step and ends after `length` steps, never when `length` is 0
struct Constant {
    reward: f32,
    length: usize,
    t: usize,
}

impl Constant {
    fn new(reward: f32, length: usize) -> Self {
        Self { reward, length, t: 0 }
    }
}

impl Env for Constant {
    fn reset(&mut self, _seed: u64) -> Result<Tensor> {
        self.t = 0;
        Ok(Tensor::new(&[0f32, 1.], &Device::Cpu)?)
    }

    fn step(&mut self, _action: u32) -> Result<SnapShot> {
        self.t += 1;
        Ok(SnapShot {
            state: Tensor::new(&[self.t as f32, 1.], &Device::Cpu)?,
            reward: self.reward,
            terminated: self.length > 0 && self.t == self.length,
            truncated: false,
        })
    }

    fn env_description(&self) -> EnvironmentDescription {
        EnvironmentDescription::new(Space::continous_from_dims(vec![2]), Space::Discrete(2))
    }
}

// uniform policy, zero values, remembers every training batch
#[derive(Default)]
struct Recorder {
    batches: Vec<TrainingBatch>,
}

impl ActorCritic for Recorder {
    fn forward(&self, states: &Tensor) -> Result<PolicyOutput> {
        let batch = states.dim(0)?;
        Ok(PolicyOutput {
            probs: Tensor::full(0.5f32, (batch, 2), &Device::Cpu)?,
            values: vec![Tensor::zeros(batch, candle_core::DType::F32, &Device::Cpu)?],
        })
    }

    fn backprop(&mut self, batch: &TrainingBatch) -> Result<f32> {
        self.batches.push(batch.clone());
        Ok(batch.returns.iter().sum())
    }
}

#[derive(Default)]
struct Counts {
    updates: Vec<UpdateReport>,
    validations: Vec<ValidationReport>,
    checkpoints: Vec<usize>,
    rollouts: usize,
}

impl TrainerHooks<Recorder> for Counts {
    fn post_rollout_hook(&mut self, trajectory: &Trajectory) -> bool {
        assert_eq!(trajectory.shape(), (2, 2));
        self.rollouts += 1;
        false
    }

    fn post_training_hook(&mut self, _model: &mut Recorder, report: &UpdateReport) -> bool {
        self.updates.push(*report);
        false
    }

    fn validation_hook(&mut self, report: &ValidationReport) -> bool {
        self.validations.push(report.clone());
        false
    }

    fn checkpoint_hook(&mut self, _model: &Recorder, checkpoint: usize) -> Result<()> {
        self.checkpoints.push(checkpoint);
        Ok(())
    }
}

fn runner(reward: f32, length: usize) -> Result<RolloutRunner<SequentialVecEnv<Constant>>> {
    let envs = SequentialVecEnv::new(vec![
        Constant::new(reward, length),
        Constant::new(reward, length),
    ])?;
    RolloutRunner::new(envs, 2, 0)
}

#[test]
fn nstep_targets_reach_the_model_time_major() -> Result<()> {
    let settings = TrainerSettings {
        total_steps: 8,
        gamma: 0.5,
        validate_freq: 0,
        ..Default::default()
    };
    let mut trainer = SyncTrainer::<_, Constant, _, _>::new(
        runner(1., 0)?,
        Recorder::default(),
        DefaultTrainerHooks::default(),
        settings,
    )?;
    trainer.train()?;
    let (model, _) = trainer.into_parts();
    assert_eq!(model.batches.len(), 2);
    for batch in &model.batches {
        assert_eq!(batch.returns, vec![1.5, 1.5, 1., 1.]);
        // zero values make the advantages equal the returns
        assert_eq!(batch.advantages, batch.returns);
        assert_eq!(batch.states.dims(), &[4, 2]);
        assert!(batch.intrinsic_returns.is_none());
    }
    Ok(())
}

#[test]
fn episode_ends_cut_the_bootstrap() -> Result<()> {
    let settings = TrainerSettings {
        total_steps: 4,
        gamma: 0.5,
        return_type: ReturnAlgorithm::Gae,
        lambda: 1.,
        validate_freq: 0,
        ..Default::default()
    };
    let mut trainer = SyncTrainer::<_, Constant, _, _>::new(
        runner(2., 1)?,
        Recorder::default(),
        DefaultTrainerHooks::default(),
        settings,
    )?;
    trainer.train()?;
    let (model, _) = trainer.into_parts();
    // every step ends an episode, so every return is the bare reward
    assert_eq!(model.batches[0].returns, vec![2.; 4]);
    Ok(())
}

#[test]
fn side_jobs_follow_the_cadence() -> Result<()> {
    let settings = TrainerSettings {
        total_steps: 40,
        validate_freq: 12,
        save_freq: 20,
        ..Default::default()
    };
    let scheduler = ValidationScheduler::new(vec![Constant::new(1., 3), Constant::new(1., 3)], 3)?;
    let mut trainer =
        SyncTrainer::new(runner(1., 3)?, Recorder::default(), Counts::default(), settings)?
            .with_validation(scheduler);
    trainer.train()?;
    let hooks = trainer.hooks();
    assert_eq!(hooks.rollouts, 10);
    assert_eq!(hooks.updates.len(), 10);
    assert_eq!(hooks.updates[9].total_steps, 40);
    // 12 / 4 = every third update
    let validated: Vec<usize> = hooks.validations.iter().map(|r| r.update).collect();
    assert_eq!(validated, vec![3, 6, 9]);
    for report in &hooks.validations {
        assert_eq!(report.summary.episodes, 3);
        assert_eq!(report.score, Some(3.));
        assert_eq!(report.summary.scores[&0].len(), 2);
        assert_eq!(report.summary.scores[&1].len(), 1);
    }
    assert_eq!(hooks.checkpoints, vec![1, 2]);
    Ok(())
}

#[test]
fn validation_leaves_training_actions_unchanged() -> Result<()> {
    let settings = TrainerSettings {
        total_steps: 40,
        validate_freq: 8,
        seed: 42,
        ..Default::default()
    };
    let mut plain = SyncTrainer::<_, Constant, _, _>::new(
        runner(1., 3)?,
        Recorder::default(),
        DefaultTrainerHooks::default(),
        settings.clone(),
    )?;
    plain.train()?;

    let scheduler = ValidationScheduler::new(vec![Constant::new(1., 3), Constant::new(1., 3)], 4)?;
    let mut validated = SyncTrainer::new(
        runner(1., 3)?,
        Recorder::default(),
        Counts::default(),
        settings,
    )?
    .with_validation(scheduler);
    validated.train()?;
    assert_eq!(validated.hooks().validations.len(), 5);

    let (plain, _) = plain.into_parts();
    let (validated, _) = validated.into_parts();
    let actions = |model: &Recorder| -> Vec<Vec<u32>> {
        model.batches.iter().map(|batch| batch.actions.clone()).collect()
    };
    assert_eq!(actions(&plain).len(), 10);
    assert_eq!(actions(&plain), actions(&validated));
    Ok(())
}
