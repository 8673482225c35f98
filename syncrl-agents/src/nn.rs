use candle_core::{Result, Tensor};
use candle_nn::{Linear, Module, VarBuilder, linear};

/// Stack of linear layers with relu activations in between.
///
/// Only holds `Linear` layers, so unlike `candle_nn::Sequential` it is `Send + Sync` and can be
/// shared with the validation workers.
#[derive(Debug, Clone)]
pub struct Mlp {
    layers: Vec<Linear>,
    // relu after the last layer as well
    activate_output: bool,
}

impl Mlp {
    pub fn new(layers: Vec<Linear>, activate_output: bool) -> Self {
        Self {
            layers,
            activate_output,
        }
    }

    pub fn output_dim(&self) -> Option<usize> {
        self.layers.last().and_then(|l| l.weight().dim(0).ok())
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = xs.clone();
        let num_layers = self.layers.len();
        for (idx, layer) in self.layers.iter().enumerate() {
            xs = layer.forward(&xs)?;
            if idx + 1 < num_layers || self.activate_output {
                xs = xs.relu()?;
            }
        }
        Ok(xs)
    }
}

pub fn build_mlp(
    input_dim: usize,
    layers: &[usize],
    vb: &VarBuilder,
    prefix: &str,
    activate_output: bool,
) -> Result<Mlp> {
    let mut last_dim = input_dim;
    let mut built = Vec::with_capacity(layers.len());
    for (layer_idx, layer_size) in layers.iter().enumerate() {
        built.push(linear(last_dim, *layer_size, vb.pp(format!("{prefix}{layer_idx}")))?);
        last_dim = *layer_size;
    }
    Ok(Mlp::new(built, activate_output))
}

#[cfg(test)]
mod test {
    use super::build_mlp;
    use candle_core::{DType, Device, Result, Tensor};
    use candle_nn::{Module, VarBuilder, VarMap};

    #[test]
    fn output_has_the_last_layer_width() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let mlp = build_mlp(4, &[8, 3], &vb, "mlp", false)?;
        let out = mlp.forward(&Tensor::ones((5, 4), DType::F32, &Device::Cpu)?)?;
        assert_eq!(out.dims(), &[5, 3]);
        assert_eq!(mlp.output_dim(), Some(3));
        assert_eq!(varmap.all_vars().len(), 4);
        Ok(())
    }
}
