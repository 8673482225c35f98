use anyhow::Result;
use candle_core::{Device, Tensor};
use syncrl_agents::{CuriositySettings, CuriosityTrainer, RndActorCritic, RndConfig};
use syncrl_core::Algorithm;
use syncrl_core::env::{Env, EnvironmentDescription, SequentialVecEnv, SnapShot, Space, VecEnv};
use syncrl_core::runner::RolloutRunner;
use syncrl_core::sync_trainer::{TrainerHooks, UpdateReport, ValidationReport};
use syncrl_core::trajectory::Trajectory;

// position on a ring of `size` cells, one hot encoded; reward 1 on cell 0
struct Ring {
    size: usize,
    position: usize,
}

impl Ring {
    fn observation(&self) -> Result<Tensor> {
        let mut one_hot = vec![0f32; self.size];
        one_hot[self.position] = 1.;
        Ok(Tensor::from_vec(one_hot, self.size, &Device::Cpu)?)
    }
}

impl Env for Ring {
    fn reset(&mut self, seed: u64) -> Result<Tensor> {
        self.position = seed as usize % self.size;
        self.observation()
    }

    fn step(&mut self, action: u32) -> Result<SnapShot> {
        self.position = match action {
            0 => (self.position + self.size - 1) % self.size,
            _ => (self.position + 1) % self.size,
        };
        Ok(SnapShot {
            state: self.observation()?,
            reward: if self.position == 0 { 1. } else { 0. },
            terminated: false,
            truncated: false,
        })
    }

    fn env_description(&self) -> EnvironmentDescription {
        EnvironmentDescription::new(Space::continous_from_dims(vec![self.size]), Space::Discrete(2))
    }
}

#[derive(Default)]
struct Inspect {
    intrinsic: Vec<Vec<Vec<f32>>>,
    losses: Vec<f32>,
}

impl<M> TrainerHooks<M> for Inspect {
    fn post_rollout_hook(&mut self, trajectory: &Trajectory) -> bool {
        assert_eq!(trajectory.values.len(), 2);
        if let Some(intrinsic) = &trajectory.intrinsic_rewards {
            self.intrinsic.push(intrinsic.clone());
        }
        false
    }

    fn post_training_hook(&mut self, _model: &mut M, report: &UpdateReport) -> bool {
        self.losses.push(report.loss);
        false
    }

    fn validation_hook(&mut self, _report: &ValidationReport) -> bool {
        false
    }

    fn checkpoint_hook(&mut self, _model: &M, _checkpoint: usize) -> Result<()> {
        Ok(())
    }
}

#[test]
fn rollouts_carry_non_negative_novelty() -> Result<()> {
    let envs: Vec<Ring> = (0..4).map(|_| Ring { size: 6, position: 0 }).collect();
    let envs = SequentialVecEnv::new(envs)?;
    let env_description = envs.env_description();
    let config = RndConfig {
        hidden_layers: vec![16],
        feature_layers: vec![16, 8],
        ..Default::default()
    };
    let model = RndActorCritic::new(&env_description, 6, config, &Device::Cpu)?;
    let mut settings = CuriositySettings::default();
    settings.trainer.total_steps = 4 * 8 * 6;
    settings.trainer.validate_freq = 0;
    settings.warmup_steps = 16;
    let runner = RolloutRunner::new(envs, 8, 0)?;
    let mut trainer =
        CuriosityTrainer::<_, Ring, _, _>::new(runner, model, Inspect::default(), settings)?;
    trainer.train()?;

    let hooks = trainer.hooks();
    assert_eq!(hooks.intrinsic.len(), 6);
    assert_eq!(hooks.losses.len(), 6);
    assert!(hooks.losses.iter().all(|loss| loss.is_finite()));
    for rollout in &hooks.intrinsic {
        assert_eq!(rollout.len(), 8);
        assert!(rollout.iter().flatten().all(|r| *r >= 0. && r.is_finite()));
    }
    let stats = trainer.obs_stats().ok_or_else(|| anyhow::anyhow!("no statistics"))?;
    // 16 warmup steps plus 6 rollouts of 8 steps over 4 envs
    assert_eq!(stats.count.round() as usize, 4 * 16 + 4 * 8 * 6);
    Ok(())
}
