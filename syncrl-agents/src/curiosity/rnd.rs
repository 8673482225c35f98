use super::{CuriosityBatch, CuriosityModel, REWARD_CLASSES};
use crate::a2c::{PolicyTerms, policy_terms, value_loss};
use crate::nn::{Mlp, build_mlp};
use crate::optimizer::OptimizerWithMaxGrad;
use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::ops::{log_softmax, softmax};
use candle_nn::{Linear, Module, VarBuilder, VarMap, linear};
use syncrl_core::env::EnvironmentDescription;
use syncrl_core::error::SyncRlError;
use syncrl_core::model::{ActorCritic, PolicyOutput, TrainingBatch};
use syncrl_core::utils::RunningMeanStd;

/// Clip range of normalised predictor inputs.
const OBS_CLIP: f64 = 5.;

#[derive(Debug, Clone, PartialEq)]
pub struct RndConfig {
    pub hidden_layers: Vec<usize>,
    /// Layers of the random target network and of the predictor chasing it.
    pub feature_layers: Vec<usize>,
    /// Rows and columns of the pixel control grid. `None` disables the pixel control head.
    pub pixel_grid: Option<(usize, usize)>,
    pub reward_hidden: usize,
    pub learning_rate: f64,
    pub max_grad_norm: Option<f32>,
    pub value_coeff: f32,
    pub entropy_coeff: f32,
    pub reward_coeff: f32,
    pub pixel_coeff: f32,
}

impl Default for RndConfig {
    fn default() -> Self {
        Self {
            hidden_layers: vec![64, 64],
            feature_layers: vec![64, 64],
            pixel_grid: None,
            reward_hidden: 128,
            learning_rate: 1e-3,
            max_grad_norm: Some(0.5),
            value_coeff: 0.5,
            entropy_coeff: 0.001,
            reward_coeff: 1.,
            pixel_coeff: 0.,
        }
    }
}

#[derive(Debug, Clone)]
struct PixelHead {
    layer: Linear,
    rows: usize,
    cols: usize,
    action_size: usize,
}

impl PixelHead {
    /// Dueling estimate `relu(V + A - mean(A))` of shape (B, rows, cols, actions).
    fn forward(&self, dense: &Tensor) -> Result<Tensor> {
        let batch = dense.dim(0)?;
        let out = self
            .layer
            .forward(dense)?
            .reshape((batch, self.rows, self.cols, self.action_size + 1))?;
        let value = out.narrow(3, 0, 1)?;
        let advantage = out.narrow(3, 1, self.action_size)?;
        let centered = advantage.broadcast_sub(&advantage.mean_keepdim(3)?)?;
        Ok(centered.broadcast_add(&value)?.relu()?)
    }
}

/// Actor critic with extrinsic and intrinsic value heads, a random network distillation
/// novelty signal, a reward sign classifier and an optional pixel control head.
#[derive(Debug)]
pub struct RndActorCritic {
    encoder: Mlp,
    policy_head: Linear,
    extr_value_head: Linear,
    intr_value_head: Linear,
    reward_model: Mlp,
    pixel_head: Option<PixelHead>,
    target: Mlp,
    predictor: Mlp,
    optimizer: OptimizerWithMaxGrad,
    config: RndConfig,
    action_size: usize,
    device: Device,
}

impl RndActorCritic {
    /// `predictor_input_size` is the flattened size of the observations the novelty networks
    /// see, which can be smaller than a full frame stack.
    pub fn new(
        env_description: &EnvironmentDescription,
        predictor_input_size: usize,
        config: RndConfig,
        device: &Device,
    ) -> Result<Self> {
        let input_size = env_description.observation_size();
        let action_size = env_description.action_size();
        let Some(dense_size) = config.hidden_layers.last().copied() else {
            return Err(SyncRlError::config("the encoder needs at least one hidden layer").into());
        };
        if config.feature_layers.is_empty() {
            return Err(SyncRlError::config("the novelty networks need at least one layer").into());
        }
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let encoder = build_mlp(input_size, &config.hidden_layers, &vb, "encoder", true)?;
        let policy_head = linear(dense_size, action_size, vb.pp("policy"))?;
        let extr_value_head = linear(dense_size, 1, vb.pp("extr_value"))?;
        let intr_value_head = linear(dense_size, 1, vb.pp("intr_value"))?;
        let reward_model = build_mlp(
            dense_size,
            &[config.reward_hidden, REWARD_CLASSES],
            &vb,
            "reward",
            false,
        )?;
        let pixel_head = config
            .pixel_grid
            .map(|(rows, cols)| -> Result<PixelHead> {
                let layer = linear(dense_size, rows * cols * (action_size + 1), vb.pp("pixel"))?;
                Ok(PixelHead {
                    layer,
                    rows,
                    cols,
                    action_size,
                })
            })
            .transpose()?;
        let predictor =
            build_mlp(predictor_input_size, &config.feature_layers, &vb, "predictor", false)?;
        // the target network is never optimised
        let target_varmap = VarMap::new();
        let target_vb = VarBuilder::from_varmap(&target_varmap, DType::F32, device);
        let target = build_mlp(
            predictor_input_size,
            &config.feature_layers,
            &target_vb,
            "target",
            false,
        )?;
        let optimizer =
            OptimizerWithMaxGrad::new(varmap, config.learning_rate, config.max_grad_norm)?;
        Ok(Self {
            encoder,
            policy_head,
            extr_value_head,
            intr_value_head,
            reward_model,
            pixel_head,
            target,
            predictor,
            optimizer,
            config,
            action_size,
            device: device.clone(),
        })
    }

    fn encode(&self, states: &Tensor) -> Result<Tensor> {
        let xs = states
            .to_device(&self.device)?
            .to_dtype(DType::F32)?
            .flatten_from(1)?;
        Ok(self.encoder.forward(&xs)?)
    }

    /// Per sample squared error between predictor and target features, shape (B,).
    fn novelty(&self, next_states: &Tensor, obs_stats: &RunningMeanStd) -> Result<Tensor> {
        let normalized = obs_stats
            .normalize(&next_states.to_device(&self.device)?.to_dtype(DType::F32)?, OBS_CLIP)?
            .flatten_from(1)?;
        let target = self.target.forward(&normalized)?.detach();
        let predicted = self.predictor.forward(&normalized)?;
        Ok(predicted.sub(&target)?.sqr()?.mean(1)?)
    }

    fn policy_loss(&self, dense: &Tensor, batch: &TrainingBatch) -> Result<Tensor> {
        let PolicyTerms {
            policy_loss,
            entropy,
        } = policy_terms(&self.policy_head.forward(dense)?, &batch.actions, &batch.advantages)?;
        let extr_values = self.extr_value_head.forward(dense)?.squeeze(1)?;
        let mut values_loss = value_loss(&extr_values, &batch.returns)?;
        if let Some(intrinsic_returns) = &batch.intrinsic_returns {
            let intr_values = self.intr_value_head.forward(dense)?.squeeze(1)?;
            values_loss = (values_loss + value_loss(&intr_values, intrinsic_returns)?)?;
        }
        let value_term = (values_loss * self.config.value_coeff as f64)?;
        let entropy_term = (entropy * self.config.entropy_coeff as f64)?;
        Ok(((policy_loss + value_term)? - entropy_term)?)
    }
}

impl ActorCritic for RndActorCritic {
    fn forward(&self, states: &Tensor) -> Result<PolicyOutput> {
        let dense = self.encode(states)?;
        let probs = softmax(&self.policy_head.forward(&dense)?, 1)?.detach();
        let extr = self.extr_value_head.forward(&dense)?.squeeze(1)?.detach();
        let intr = self.intr_value_head.forward(&dense)?.squeeze(1)?.detach();
        Ok(PolicyOutput {
            probs,
            values: vec![extr, intr],
        })
    }

    fn backprop(&mut self, batch: &TrainingBatch) -> Result<f32> {
        let dense = self.encode(&batch.states)?;
        let loss = self.policy_loss(&dense, batch)?;
        self.optimizer.backward_step(&loss)?;
        Ok(loss.to_scalar::<f32>()?)
    }
}

impl CuriosityModel for RndActorCritic {
    fn intrinsic_reward(
        &self,
        next_states: &Tensor,
        obs_stats: &RunningMeanStd,
    ) -> Result<Vec<f32>> {
        Ok(self.novelty(next_states, obs_stats)?.detach().to_vec1()?)
    }

    fn pixel_control(&self, states: &Tensor) -> Result<Option<Tensor>> {
        let Some(head) = &self.pixel_head else {
            return Ok(None);
        };
        Ok(Some(head.forward(&self.encode(states)?)?.detach()))
    }

    fn backprop_curiosity(&mut self, batch: &CuriosityBatch) -> Result<f32> {
        let dense = self.encode(&batch.policy.states)?;
        let mut loss = self.policy_loss(&dense, &batch.policy)?;

        let feature_loss = self.novelty(&batch.next_states, batch.obs_stats)?.mean_all()?;
        loss = (loss + feature_loss)?;

        let reward_logits = self.reward_model.forward(&self.encode(&batch.reward_state)?)?;
        let reward_target = batch.reward_target.to_device(&self.device)?;
        let reward_loss = log_softmax(&reward_logits, 1)?
            .mul(&reward_target)?
            .sum(1)?
            .neg()?
            .mean_all()?;
        loss = (loss + (reward_loss * self.config.reward_coeff as f64)?)?;

        if let (Some(head), Some(targets)) = (&self.pixel_head, &batch.pixel_targets) {
            let q_aux = head.forward(&dense)?;
            let actions = Tensor::from_slice(
                &batch.policy.actions,
                batch.policy.actions.len(),
                &self.device,
            )?;
            let one_hot = candle_nn::encoding::one_hot(actions, self.action_size, 1f32, 0f32)?
                .unsqueeze(1)?
                .unsqueeze(1)?;
            let q_taken = q_aux.broadcast_mul(&one_hot)?.sum(3)?;
            let targets = targets.to_device(&self.device)?;
            let pixel_loss = (targets.sub(&q_taken)?.sqr()?.mean_all()? * 0.5)?;
            loss = (loss + (pixel_loss * self.config.pixel_coeff as f64)?)?;
        }

        self.optimizer.backward_step(&loss)?;
        Ok(loss.to_scalar::<f32>()?)
    }
}
