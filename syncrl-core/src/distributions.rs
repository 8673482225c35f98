use anyhow::Result;
use candle_core::{Error, Tensor};
use rand::distr::Distribution as RandDistribution;
use rand::distr::weighted::WeightedIndex;
use rand::{Rng, SeedableRng, rngs::StdRng};

/// Draws one action from a single categorical distribution.
pub fn sample_categorical<R: Rng>(probs: &[f32], rng: &mut R) -> Result<u32> {
    let distribution = WeightedIndex::new(probs).map_err(Error::wrap)?;
    Ok(distribution.sample(rng) as u32)
}

/// Samples one action per row of `probs` (shape (B, A)).
///
/// Every row gets its own random stream split off `rng`, so the action drawn for one environment
/// never depends on how many draws another environment consumed.
pub fn sample_actions<R: Rng>(probs: &Tensor, rng: &mut R) -> Result<Vec<u32>> {
    let rows: Vec<Vec<f32>> = probs.to_vec2()?;
    rows.iter()
        .map(|row| {
            let mut env_rng = StdRng::seed_from_u64(rng.random());
            sample_categorical(row, &mut env_rng)
        })
        .collect()
}

/// Uniformly random actions, used while warming up observation statistics.
pub fn random_actions<R: Rng>(num_envs: usize, action_size: usize, rng: &mut R) -> Vec<u32> {
    (0..num_envs)
        .map(|_| rng.random_range(0..action_size) as u32)
        .collect()
}
