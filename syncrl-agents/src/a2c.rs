use crate::nn::{Mlp, build_mlp};
use crate::optimizer::OptimizerWithMaxGrad;
use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::ops::{log_softmax, softmax};
use candle_nn::{Module, VarBuilder, VarMap};
use syncrl_core::env::EnvironmentDescription;
use syncrl_core::error::SyncRlError;
use syncrl_core::model::{ActorCritic, PolicyOutput, TrainingBatch};

/// Weights of the loss terms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct A2CCoefficients {
    pub value_coeff: f32,
    pub entropy_coeff: f32,
}

impl Default for A2CCoefficients {
    fn default() -> Self {
        Self {
            value_coeff: 0.5,
            entropy_coeff: 0.01,
        }
    }
}

/// Policy gradient and entropy terms of a batch of logits.
pub(crate) struct PolicyTerms {
    pub policy_loss: Tensor,
    pub entropy: Tensor,
}

pub(crate) fn policy_terms(
    logits: &Tensor,
    actions: &[u32],
    advantages: &[f32],
) -> Result<PolicyTerms> {
    let device = logits.device();
    let log_probs = log_softmax(logits, 1)?;
    let probs = softmax(logits, 1)?;
    let actions = Tensor::from_slice(actions, (actions.len(), 1), device)?;
    let advantages = Tensor::from_slice(advantages, advantages.len(), device)?;
    let action_log_probs = log_probs.gather(&actions, 1)?.squeeze(1)?;
    let policy_loss = advantages.mul(&action_log_probs)?.neg()?.mean_all()?;
    let entropy = probs.mul(&log_probs)?.sum(1)?.neg()?.mean_all()?;
    Ok(PolicyTerms {
        policy_loss,
        entropy,
    })
}

/// `0.5 * mean((targets - predictions)^2)`.
pub(crate) fn value_loss(predictions: &Tensor, targets: &[f32]) -> Result<Tensor> {
    let targets = Tensor::from_slice(targets, targets.len(), predictions.device())?;
    Ok((targets.sub(predictions)?.sqr()?.mean_all()? * 0.5)?)
}

/// Actor critic with separate policy and value networks updated by a single optimizer.
#[derive(Debug)]
pub struct LinearActorCritic {
    policy_net: Mlp,
    value_net: Mlp,
    optimizer: OptimizerWithMaxGrad,
    coefficients: A2CCoefficients,
    device: Device,
}

impl LinearActorCritic {
    pub fn new(
        env_description: &EnvironmentDescription,
        hidden_layers: &[usize],
        learning_rate: f64,
        max_grad_norm: Option<f32>,
        coefficients: A2CCoefficients,
        device: &Device,
    ) -> Result<Self> {
        let input_size = env_description.observation_size();
        let action_size = env_description.action_size();
        if input_size == 0 || action_size == 0 {
            let message = "observation and action spaces must be non empty";
            return Err(SyncRlError::config(message).into());
        }
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let policy_layers = [hidden_layers, &[action_size]].concat();
        let value_layers = [hidden_layers, &[1]].concat();
        let policy_net = build_mlp(input_size, &policy_layers, &vb, "policy", false)?;
        let value_net = build_mlp(input_size, &value_layers, &vb, "value", false)?;
        let optimizer = OptimizerWithMaxGrad::new(varmap, learning_rate, max_grad_norm)?;
        Ok(Self {
            policy_net,
            value_net,
            optimizer,
            coefficients,
            device: device.clone(),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn flatten(&self, states: &Tensor) -> Result<Tensor> {
        Ok(states
            .to_device(&self.device)?
            .to_dtype(DType::F32)?
            .flatten_from(1)?)
    }
}

impl ActorCritic for LinearActorCritic {
    fn forward(&self, states: &Tensor) -> Result<PolicyOutput> {
        let xs = self.flatten(states)?;
        let probs = softmax(&self.policy_net.forward(&xs)?, 1)?.detach();
        let values = self.value_net.forward(&xs)?.squeeze(1)?.detach();
        Ok(PolicyOutput {
            probs,
            values: vec![values],
        })
    }

    fn backprop(&mut self, batch: &TrainingBatch) -> Result<f32> {
        if batch.intrinsic_returns.is_some() {
            return Err(SyncRlError::Model("this model has no intrinsic value head".into()).into());
        }
        let xs = self.flatten(&batch.states)?;
        let PolicyTerms {
            policy_loss,
            entropy,
        } = policy_terms(&self.policy_net.forward(&xs)?, &batch.actions, &batch.advantages)?;
        let values = self.value_net.forward(&xs)?.squeeze(1)?;
        let value_loss = value_loss(&values, &batch.returns)?;
        let A2CCoefficients {
            value_coeff,
            entropy_coeff,
        } = self.coefficients;
        let loss = ((policy_loss + (value_loss * value_coeff as f64)?)?
            - (entropy * entropy_coeff as f64)?)?;
        self.optimizer.backward_step(&loss)?;
        Ok(loss.to_scalar::<f32>()?)
    }
}

#[cfg(test)]
mod test {
    use super::{A2CCoefficients, LinearActorCritic, policy_terms};
    use anyhow::Result;
    use candle_core::{Device, Tensor};
    use syncrl_core::env::{EnvironmentDescription, Space};
    use syncrl_core::model::{ActorCritic, TrainingBatch};

    fn model() -> Result<LinearActorCritic> {
        let description =
            EnvironmentDescription::new(Space::continous_from_dims(vec![3]), Space::Discrete(2));
        LinearActorCritic::new(
            &description,
            &[16],
            1e-2,
            Some(0.5),
            A2CCoefficients::default(),
            &Device::Cpu,
        )
    }

    #[test]
    fn forward_returns_row_stochastic_probabilities() -> Result<()> {
        let model = model()?;
        let out = model.forward(&Tensor::ones((4, 3), candle_core::DType::F32, &Device::Cpu)?)?;
        assert_eq!(out.probs.dims(), &[4, 2]);
        for row in out.probs.to_vec2::<f32>()? {
            assert!((row.iter().sum::<f32>() - 1.).abs() < 1e-5);
        }
        assert_eq!(out.value_head(0)?.len(), 4);
        Ok(())
    }

    #[test]
    fn uniform_policy_has_maximal_entropy() -> Result<()> {
        let logits = Tensor::zeros((2, 4), candle_core::DType::F32, &Device::Cpu)?;
        let terms = policy_terms(&logits, &[0, 3], &[1., 1.])?;
        let entropy = terms.entropy.to_scalar::<f32>()?;
        assert!((entropy - 4f32.ln()).abs() < 1e-5);
        let policy_loss = terms.policy_loss.to_scalar::<f32>()?;
        assert!((policy_loss - 4f32.ln()).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn value_regression_reduces_the_loss() -> Result<()> {
        let mut model = model()?;
        let states = Tensor::new(&[[1f32, 0., 0.], [0., 1., 0.]], &Device::Cpu)?;
        let batch = TrainingBatch {
            states,
            actions: vec![0, 1],
            returns: vec![2., -2.],
            advantages: vec![0., 0.],
            intrinsic_returns: None,
        };
        let first = model.backprop(&batch)?;
        let mut last = first;
        for _ in 0..100 {
            last = model.backprop(&batch)?;
        }
        assert!(last < first);
        Ok(())
    }

    #[test]
    fn intrinsic_targets_are_rejected() -> Result<()> {
        let mut model = model()?;
        let batch = TrainingBatch {
            states: Tensor::ones((1, 3), candle_core::DType::F32, &Device::Cpu)?,
            actions: vec![0],
            returns: vec![0.],
            advantages: vec![0.],
            intrinsic_returns: Some(vec![0.]),
        };
        assert!(model.backprop(&batch).is_err());
        Ok(())
    }
}
