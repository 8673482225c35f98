use candle_core::shape::Dim;
use candle_core::{DType, Device, Result, Shape, Tensor};

/// Running mean and variance over a stream of batches, merged with the parallel variance
/// formula. Statistics are kept in f64 whatever the dtype of the incoming batches.
#[derive(Debug, Clone)]
pub struct RunningMeanStd {
    pub mean: Tensor,
    pub var: Tensor,
    pub count: f64,
    device: Device,
}

pub(crate) fn biased_var<D: Dim>(t: &Tensor, dim: D) -> Result<Tensor> {
    let dim = dim.to_index(t.shape(), "var")?;
    let mean = t.mean_keepdim(dim)?;
    let squares = t.broadcast_sub(&mean)?.sqr()?;
    (squares.sum_keepdim(dim)? / t.dim(dim)? as f64)?.squeeze(dim)
}

impl RunningMeanStd {
    /// Count starts at a small epsilon so the first merge never divides by zero.
    pub const EPSILON: f64 = 1e-4;

    pub fn new<S: Into<Shape>>(shape: S, device: &Device) -> Result<Self> {
        let shape = shape.into();
        Ok(Self {
            mean: Tensor::zeros(shape.clone(), DType::F64, device)?,
            var: Tensor::ones(shape, DType::F64, device)?,
            count: Self::EPSILON,
            device: device.clone(),
        })
    }

    /// Merges a batch whose first dimension indexes samples and returns the updated
    /// `(mean, std)`.
    pub fn update(&mut self, batch: &Tensor) -> Result<(Tensor, Tensor)> {
        if batch.dim(0)? > 0 {
            let batch = batch.to_dtype(DType::F64)?;
            let batch_mean = batch.mean(0)?;
            let batch_var = biased_var(&batch, 0)?;
            let batch_count = batch.dim(0)? as f64;
            self.update_from_moments(&batch_mean, &batch_var, batch_count)?;
        }
        Ok((self.mean.clone(), self.std()?))
    }

    pub fn update_from_moments(
        &mut self,
        batch_mean: &Tensor,
        batch_var: &Tensor,
        batch_count: f64,
    ) -> Result<()> {
        if batch_count == 0. {
            return Ok(());
        }
        let batch_mean = batch_mean.to_dtype(DType::F64)?;
        let batch_var = batch_var.to_dtype(DType::F64)?;
        let delta = (&batch_mean - &self.mean)?;
        let total_count = self.count + batch_count;
        let new_mean = (&self.mean + (&delta * (batch_count / total_count))?)?;
        let m_a = (&self.var * self.count)?;
        let m_b = (&batch_var * batch_count)?;
        let m_2 = ((m_a + m_b)? + (delta.sqr()? * (self.count * batch_count / total_count))?)?;
        self.var = (m_2 / total_count)?;
        self.mean = new_mean;
        self.count = total_count;
        Ok(())
    }

    pub fn std(&self) -> Result<Tensor> {
        self.var.sqrt()
    }

    /// `(x - mean) / std` clipped into `[-clip, clip]`, returned in the dtype of `x`.
    pub fn normalize(&self, x: &Tensor, clip: f64) -> Result<Tensor> {
        let dtype = x.dtype();
        let std = (self.var.sqrt()? + 1e-8)?;
        x.to_dtype(DType::F64)?
            .broadcast_sub(&self.mean)?
            .broadcast_div(&std)?
            .clamp(-clip, clip)?
            .to_dtype(dtype)
    }

    /// Divides `x` by the running std without centering it.
    pub fn scale(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let std = (self.var.sqrt()? + 1e-8)?;
        x.to_dtype(DType::F64)?.broadcast_div(&std)?.to_dtype(dtype)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}
