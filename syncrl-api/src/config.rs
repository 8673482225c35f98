use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::Path;
use syncrl_agents::{CuriositySettings, RndConfig};
use syncrl_core::sync_trainer::TrainerSettings;
use syncrl_core::validation::DEFAULT_MAX_STEPS;

/// Top level configuration of a training run.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SyncRlConfig {
    pub trainer: TrainerSettings,
    pub env: EnvConfig,
    pub validation: ValidationConfig,
    pub model: ModelConfig,
    pub curiosity: CuriosityConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    pub num_envs: usize,
    /// Step every environment on its own thread.
    pub threaded: bool,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            num_envs: 16,
            threaded: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub num_envs: usize,
    pub num_episodes: usize,
    pub max_steps: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            num_envs: 1,
            num_episodes: 50,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub hidden_layers: Vec<usize>,
    pub learning_rate: f64,
    pub max_grad_norm: Option<f32>,
    pub value_coeff: f32,
    pub entropy_coeff: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            hidden_layers: vec![64, 64],
            learning_rate: 3e-4,
            max_grad_norm: Some(0.5),
            value_coeff: 0.5,
            entropy_coeff: 0.01,
        }
    }
}

/// Settings only the curiosity trainer reads.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CuriosityConfig {
    pub extr_gamma: f32,
    pub intr_gamma: f32,
    pub extr_coeff: f32,
    pub intr_coeff: f32,
    pub warmup_steps: usize,
    pub pixel_cell: usize,
    pub pixel_gamma: f32,
    pub norm_pixel: bool,
    pub feature_layers: Vec<usize>,
    pub reward_coeff: f32,
    pub pixel_coeff: f32,
}

impl Default for CuriosityConfig {
    fn default() -> Self {
        let settings = CuriositySettings::default();
        let rnd = RndConfig::default();
        Self {
            extr_gamma: settings.extr_gamma,
            intr_gamma: settings.intr_gamma,
            extr_coeff: settings.extr_coeff,
            intr_coeff: settings.intr_coeff,
            warmup_steps: settings.warmup_steps,
            pixel_cell: settings.pixel_cell,
            pixel_gamma: settings.pixel_gamma,
            norm_pixel: settings.norm_pixel,
            feature_layers: rnd.feature_layers,
            reward_coeff: rnd.reward_coeff,
            pixel_coeff: rnd.pixel_coeff,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl SyncRlConfig {
    /// Defaults, overridden by the TOML file at `path` when given, overridden by `SYNCRL_`
    /// environment variables (`SYNCRL_TRAINER__GAMMA=0.9`).
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }
        builder
            .add_source(
                Environment::with_prefix("SYNCRL")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod test {
    use super::SyncRlConfig;
    use syncrl_core::returns::ReturnAlgorithm;

    #[test]
    fn partial_files_keep_the_defaults() -> anyhow::Result<()> {
        let config = SyncRlConfig::from_toml_str(
            r#"
            [trainer]
            return_type = "gae"
            gamma = 0.9
            nsteps = 8

            [env]
            num_envs = 4
            "#,
        )?;
        assert_eq!(config.trainer.return_type, ReturnAlgorithm::Gae);
        assert_eq!(config.trainer.gamma, 0.9);
        assert_eq!(config.trainer.nsteps, 8);
        assert_eq!(config.trainer.lambda, 0.95);
        assert_eq!(config.env.num_envs, 4);
        assert_eq!(config.validation.num_episodes, 50);
        assert_eq!(config.model.hidden_layers, vec![64, 64]);
        Ok(())
    }

    #[test]
    fn unknown_return_type_fails_to_load() {
        let config = SyncRlConfig::from_toml_str("[trainer]\nreturn_type = \"td\"\n");
        assert!(config.is_err());
    }
}
