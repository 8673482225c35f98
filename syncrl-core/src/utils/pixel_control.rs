//! Auxiliary pixel-control rewards and their bootstrapped targets.
//!
//! Observations are channel-last frame stacks; the newest frame is the last channel.

use crate::error::SyncRlError;
use anyhow::Result;
use candle_core::{DType, Tensor};

/// Smallest and largest pixel value observed so far, used to scale frames into [0, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PixelRange {
    pub min: f32,
    pub max: f32,
}

impl PixelRange {
    pub fn update(&mut self, states: &Tensor) -> Result<()> {
        let flat = states.flatten_all()?.to_dtype(DType::F32)?;
        let min = flat.min(0)?.to_scalar::<f32>()?;
        let max = flat.max(0)?.to_scalar::<f32>()?;
        self.min = self.min.min(min);
        self.max = self.max.max(max);
        Ok(())
    }

    /// Scales `x` into [0, 1]. Left untouched until a non-empty range has been seen.
    pub fn normalize(&self, x: &Tensor) -> Result<Tensor> {
        if self.max <= self.min {
            return Ok(x.clone());
        }
        let scale = 1. / (self.max - self.min) as f64;
        Ok(((x - self.min as f64)? * scale)?)
    }
}

/// Mean absolute change of the newest frame over `cell x cell` blocks between consecutive
/// observations.
///
/// `states` has shape (T, N, H, W, C) and the result (T, N, H / cell, W / cell). Step 0 compares
/// the newest frame against the previous frame of the same stack.
pub fn pixel_rewards(states: &Tensor, cell: usize, range: Option<&PixelRange>) -> Result<Tensor> {
    let (steps, envs, height, width, channels) = states.dims5()?;
    if cell == 0 || height % cell != 0 || width % cell != 0 {
        return Err(SyncRlError::config(format!(
            "a {height}x{width} frame cannot be split into {cell}x{cell} cells"
        ))
        .into());
    }
    let states = states.to_dtype(DType::F32)?;
    let mut frames = states.narrow(4, channels - 1, 1)?.squeeze(4)?;
    let mut previous = states
        .get(0)?
        .narrow(3, channels.saturating_sub(2), 1)?
        .squeeze(3)?
        .unsqueeze(0)?;
    if let Some(range) = range {
        frames = range.normalize(&frames)?;
        previous = range.normalize(&previous)?;
    }
    let shifted = if steps > 1 {
        Tensor::cat(&[previous, frames.narrow(0, 0, steps - 1)?], 0)?
    } else {
        previous
    };
    let (rows, cols) = (height / cell, width / cell);
    Ok((frames - shifted)?
        .abs()?
        .reshape((steps, envs, rows, cell, cols, cell))?
        .mean(5)?
        .mean(3)?)
}

/// Discounted pixel-control target per cell: `R[t] = p[t] + γ R[t+1] (1 - done[t])` with
/// `last_values` (N, H', W') standing in for `R[T]`.
pub fn pixel_control_target(
    pixel_rewards: &Tensor,
    last_values: &Tensor,
    dones: &[Vec<bool>],
    gamma: f32,
) -> Result<Tensor> {
    let (steps, envs, _, _) = pixel_rewards.dims4()?;
    if dones.len() != steps || dones.iter().any(|row| row.len() != envs) {
        return Err(SyncRlError::ShapeMismatch {
            context: "pixel control dones",
            expected: (steps, envs),
            actual: (dones.len(), dones.first().map(|r| r.len()).unwrap_or(0)),
        }
        .into());
    }
    let device = pixel_rewards.device();
    let mut next = last_values.to_dtype(DType::F32)?;
    let mut targets = Vec::with_capacity(steps);
    for t in (0..steps).rev() {
        let mask: Vec<f32> = dones[t]
            .iter()
            .map(|done| if *done { 0. } else { gamma })
            .collect();
        let mask = Tensor::from_vec(mask, (envs, 1, 1), device)?;
        next = (pixel_rewards.get(t)?.to_dtype(DType::F32)? + next.broadcast_mul(&mask)?)?;
        targets.push(next.clone());
    }
    targets.reverse();
    Ok(Tensor::stack(&targets, 0)?)
}
