use anyhow::Result;
use candle_core::{Device, Tensor};
use syncrl_core::env::{Env, EnvironmentDescription, SnapShot, Space};

/// A `size x size` grid. The agent starts in a corner picked from the reset seed and is paid 1
/// for reaching the goal in the opposite corner. Every other step costs `step_cost`.
#[derive(Debug, Clone)]
pub struct GridWorld {
    size: usize,
    max_steps: usize,
    step_cost: f32,
    row: usize,
    col: usize,
    steps: usize,
}

impl GridWorld {
    pub fn new(size: usize, max_steps: usize, step_cost: f32) -> Self {
        Self {
            size: size.max(2),
            max_steps,
            step_cost,
            row: 0,
            col: 0,
            steps: 0,
        }
    }

    fn goal(&self) -> (usize, usize) {
        (self.size - 1, self.size - 1)
    }

    fn observation(&self) -> Result<Tensor> {
        let mut cells = vec![0f32; self.size * self.size];
        cells[self.row * self.size + self.col] = 1.;
        Ok(Tensor::from_vec(cells, self.size * self.size, &Device::Cpu)?)
    }
}

impl Env for GridWorld {
    fn reset(&mut self, seed: u64) -> Result<Tensor> {
        // the goal corner is never a start
        (self.row, self.col) = match seed % 3 {
            0 => (0, 0),
            1 => (0, self.size - 1),
            _ => (self.size - 1, 0),
        };
        self.steps = 0;
        self.observation()
    }

    fn step(&mut self, action: u32) -> Result<SnapShot> {
        self.steps += 1;
        let last = self.size - 1;
        match action {
            0 => self.row = self.row.saturating_sub(1),
            1 => self.row = (self.row + 1).min(last),
            2 => self.col = self.col.saturating_sub(1),
            _ => self.col = (self.col + 1).min(last),
        }
        let terminated = (self.row, self.col) == self.goal();
        Ok(SnapShot {
            state: self.observation()?,
            reward: if terminated { 1. } else { -self.step_cost },
            terminated,
            truncated: !terminated && self.steps >= self.max_steps,
        })
    }

    fn render(&mut self) -> Result<()> {
        let grid: String = (0..self.size)
            .map(|row| {
                (0..self.size)
                    .map(|col| match (row, col) {
                        cell if cell == (self.row, self.col) => 'A',
                        cell if cell == self.goal() => 'G',
                        _ => '.',
                    })
                    .collect::<String>()
            })
            .collect::<Vec<_>>()
            .join("\n");
        tracing::info!(step = self.steps, "\n{grid}");
        Ok(())
    }

    fn env_description(&self) -> EnvironmentDescription {
        EnvironmentDescription::new(
            Space::continous_from_dims(vec![self.size * self.size]),
            Space::Discrete(4),
        )
    }
}

#[cfg(test)]
mod test {
    use super::GridWorld;
    use anyhow::Result;
    use syncrl_core::env::Env;

    #[test]
    fn walking_to_the_far_corner_terminates() -> Result<()> {
        let mut env = GridWorld::new(3, 50, 0.01);
        env.reset(0)?;
        for action in [1, 1, 3] {
            assert!(!env.step(action)?.terminated);
        }
        let last = env.step(3)?;
        assert!(last.terminated);
        assert_eq!(last.reward, 1.);
        Ok(())
    }

    #[test]
    fn long_episodes_are_truncated() -> Result<()> {
        let mut env = GridWorld::new(3, 2, 0.);
        env.reset(0)?;
        assert!(!env.step(0)?.truncated);
        assert!(env.step(0)?.truncated);
        Ok(())
    }
}
