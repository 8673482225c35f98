use anyhow::Result;
use syncrl_api::builders::curiosity::CuriosityTrainerBuilder;
use syncrl_api::config::SyncRlConfig;
use syncrl_api::test_utils::{Frames, RecordingHooks};
use syncrl_core::Algorithm;

fn config() -> Result<SyncRlConfig> {
    Ok(SyncRlConfig::from_toml_str(
        r#"
        [trainer]
        total_steps = 96
        nsteps = 4
        validate_freq = 48
        seed = 11

        [env]
        num_envs = 3

        [validation]
        num_envs = 2
        num_episodes = 2
        max_steps = 10

        [model]
        hidden_layers = [32]

        [curiosity]
        warmup_steps = 8
        pixel_cell = 4
        feature_layers = [16]
        pixel_coeff = 0.05
        "#,
    )?)
}

#[test]
fn curiosity_trainer_runs_on_frames() -> Result<()> {
    let builder = CuriosityTrainerBuilder::from_config(&config()?);
    let mut trainer = builder.build(|_| Ok(Frames::new(8, 20)), RecordingHooks::default())?;
    trainer.train()?;
    trainer.close()?;

    let stats = trainer.obs_stats().ok_or_else(|| anyhow::anyhow!("no statistics"))?;
    // the novelty networks only see the newest frame
    assert_eq!(stats.mean.dims(), &[8, 8, 1]);
    let counts = &trainer.hooks().counts;
    // 96 / (3 * 4) updates, validation every 4
    assert_eq!(counts.updates, 8);
    assert_eq!(counts.validations, 2);
    assert!(trainer.hooks().scores.iter().all(Option::is_some));
    Ok(())
}

#[test]
fn statistics_are_seeded_without_warmup() -> Result<()> {
    let mut config = config()?;
    config.curiosity.warmup_steps = 0;
    let builder = CuriosityTrainerBuilder::from_config(&config).without_validation();
    let mut trainer = builder.build(|_| Ok(Frames::new(8, 20)), RecordingHooks::default())?;
    trainer.train()?;
    assert!(trainer.obs_stats().is_some());
    assert_eq!(trainer.hooks().counts.updates, 8);
    Ok(())
}

#[test]
fn frames_must_split_into_whole_cells() -> Result<()> {
    let mut config = config()?;
    config.curiosity.pixel_cell = 3;
    let builder = CuriosityTrainerBuilder::from_config(&config);
    let built = builder.build(|_| Ok(Frames::new(8, 20)), RecordingHooks::default());
    assert!(built.is_err());
    Ok(())
}
