use super::RunningMeanStd;
use candle_core::{Device, Result, Tensor};

/// Exponentially discounted running sum of a reward stream, one accumulator per environment.
#[derive(Debug, Clone)]
pub struct ForwardFilter {
    acc: Option<Tensor>,
    decay: f64,
}

impl ForwardFilter {
    pub fn new(decay: f64) -> Self {
        Self { acc: None, decay }
    }

    /// `acc = acc * decay + value`. The first update stores `value` as is.
    pub fn update(&mut self, value: &Tensor) -> Result<Tensor> {
        let acc = match &self.acc {
            None => value.clone(),
            Some(acc) => ((acc * self.decay)? + value)?,
        };
        self.acc = Some(acc.clone());
        Ok(acc)
    }

    pub fn reset(&mut self) {
        self.acc = None;
    }
}

/// Scales a reward stream by the running std of its discounted sum.
#[derive(Debug, Clone)]
pub struct RewardScaler {
    filter: ForwardFilter,
    stats: RunningMeanStd,
    device: Device,
}

impl RewardScaler {
    pub fn new(gamma: f64, device: &Device) -> Result<Self> {
        Ok(Self {
            filter: ForwardFilter::new(gamma),
            stats: RunningMeanStd::new((), device)?,
            device: device.clone(),
        })
    }

    /// Feeds a `[t][env]` reward window through the filter, updates the statistics of the
    /// filtered sums and returns the rewards divided by their running std.
    pub fn scale(&mut self, rewards: &[Vec<f32>]) -> Result<Vec<Vec<f32>>> {
        let num_steps = rewards.len();
        let num_envs = rewards.first().map(|r| r.len()).unwrap_or(0);
        if num_steps == 0 || num_envs == 0 {
            return Ok(rewards.to_vec());
        }
        let flat: Vec<f32> = rewards.iter().flatten().copied().collect();
        let rewards = Tensor::from_vec(flat, (num_steps, num_envs), &self.device)?;
        let mut filtered = Vec::with_capacity(num_steps);
        for t in 0..num_steps {
            filtered.push(self.filter.update(&rewards.get(t)?)?);
        }
        self.stats.update(&Tensor::cat(&filtered, 0)?)?;
        self.stats.scale(&rewards)?.to_vec2()
    }

    pub fn stats(&self) -> &RunningMeanStd {
        &self.stats
    }
}

#[cfg(test)]
mod test {
    use super::{ForwardFilter, RewardScaler};
    use candle_core::{Device, Result, Tensor};

    #[test]
    fn accumulates_with_decay() -> Result<()> {
        let mut filter = ForwardFilter::new(0.5);
        let outputs = [5f32, 3., 2.]
            .iter()
            .map(|r| filter.update(&Tensor::new(&[*r], &Device::Cpu)?)?.to_vec1::<f32>())
            .collect::<Result<Vec<_>>>()?;
        assert_eq!(outputs, vec![vec![5.], vec![5.5], vec![4.75]]);
        Ok(())
    }

    #[test]
    fn reset_forgets_the_accumulator() -> Result<()> {
        let mut filter = ForwardFilter::new(0.99);
        filter.update(&Tensor::new(&[1f32, 2.], &Device::Cpu)?)?;
        filter.reset();
        let out = filter.update(&Tensor::new(&[3f32, 4.], &Device::Cpu)?)?;
        assert_eq!(out.to_vec1::<f32>()?, vec![3., 4.]);
        Ok(())
    }

    #[test]
    fn scaled_rewards_keep_their_shape_and_sign() -> Result<()> {
        let mut scaler = RewardScaler::new(0.99, &Device::Cpu)?;
        let rewards = vec![vec![1f32, -2.], vec![0., 4.], vec![3., 0.]];
        let scaled = scaler.scale(&rewards)?;
        assert_eq!(scaled.len(), 3);
        for (row, scaled_row) in rewards.iter().zip(&scaled) {
            for (r, s) in row.iter().zip(scaled_row) {
                assert!(r * s >= 0. && (*r == 0.) == (*s == 0.));
            }
        }
        assert!(scaler.stats().count > 6.);
        Ok(())
    }
}
