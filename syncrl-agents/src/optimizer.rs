use candle_core::backprop::GradStore;
use candle_core::{Result, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use std::fmt::Debug;

/// Rescales the gradients of every variable in `varmap` so that their global norm is at most
/// `max_norm`.
fn clip_grad(loss: &Tensor, varmap: &VarMap, max_norm: f32) -> Result<GradStore> {
    let mut grad_store = loss.backward()?;
    let all_vars = varmap.all_vars();
    let mut total_norm_squared = 0f32;
    for var in all_vars.iter() {
        if let Some(grad) = grad_store.get(var) {
            total_norm_squared += grad.sqr()?.sum_all()?.to_scalar::<f32>()?;
        }
    }
    let total_norm = total_norm_squared.sqrt();
    if total_norm > max_norm {
        let clip_coef = (max_norm / (total_norm + 1e-6)) as f64;
        for var in all_vars.iter() {
            if let Some(grad) = grad_store.get(var) {
                let clipped = (grad * clip_coef)?;
                grad_store.insert(var, clipped);
            }
        }
    }
    Ok(grad_store)
}

pub struct OptimizerWithMaxGrad {
    pub optimizer: AdamW,
    pub max_grad_norm: Option<f32>,
    pub varmap: VarMap,
}

impl Debug for OptimizerWithMaxGrad {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimizerWithMaxGrad")
            .field("learning_rate", &self.optimizer.learning_rate())
            .field("max_grad_norm", &self.max_grad_norm)
            .finish()
    }
}

impl OptimizerWithMaxGrad {
    pub fn new(varmap: VarMap, learning_rate: f64, max_grad_norm: Option<f32>) -> Result<Self> {
        let params = ParamsAdamW {
            lr: learning_rate,
            weight_decay: 0.01,
            ..Default::default()
        };
        Ok(Self {
            optimizer: AdamW::new(varmap.all_vars(), params)?,
            max_grad_norm,
            varmap,
        })
    }

    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        let grads = match self.max_grad_norm {
            Some(max_norm) => clip_grad(loss, &self.varmap, max_norm)?,
            None => loss.backward()?,
        };
        self.optimizer.step(&grads)
    }
}
