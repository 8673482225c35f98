use crate::config::ModelConfig;
use anyhow::Result;
use candle_core::Device;
use syncrl_agents::{A2CCoefficients, LinearActorCritic};
use syncrl_core::env::EnvironmentDescription;

#[derive(Debug, Clone)]
pub struct A2CBuilder {
    pub hidden_layers: Vec<usize>,
    pub learning_rate: f64,
    pub max_grad_norm: Option<f32>,
    pub coefficients: A2CCoefficients,
}

impl Default for A2CBuilder {
    fn default() -> Self {
        Self::from(&ModelConfig::default())
    }
}

impl From<&ModelConfig> for A2CBuilder {
    fn from(config: &ModelConfig) -> Self {
        Self {
            hidden_layers: config.hidden_layers.clone(),
            learning_rate: config.learning_rate,
            max_grad_norm: config.max_grad_norm,
            coefficients: A2CCoefficients {
                value_coeff: config.value_coeff,
                entropy_coeff: config.entropy_coeff,
            },
        }
    }
}

impl A2CBuilder {
    pub fn build(
        &self,
        env_description: &EnvironmentDescription,
        device: &Device,
    ) -> Result<LinearActorCritic> {
        LinearActorCritic::new(
            env_description,
            &self.hidden_layers,
            self.learning_rate,
            self.max_grad_norm,
            self.coefficients,
            device,
        )
    }
}
