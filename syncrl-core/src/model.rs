use anyhow::Result;
use candle_core::Tensor;

/// Output of a forward pass over a batch of B states.
#[derive(Debug, Clone)]
pub struct PolicyOutput {
    /// Action probabilities of shape (B, A). Each row is one environment's distribution.
    pub probs: Tensor,
    /// One (B,) tensor per value head. The first head is the extrinsic value.
    pub values: Vec<Tensor>,
}

impl PolicyOutput {
    pub fn value_head(&self, head: usize) -> Result<Vec<f32>> {
        let Some(values) = self.values.get(head) else {
            anyhow::bail!(
                "model returned {} value heads, head {head} requested",
                self.values.len()
            );
        };
        Ok(values.flatten_all()?.to_vec1()?)
    }
}

/// A rollout folded into a single (T*N) batch, time major.
#[derive(Debug, Clone)]
pub struct TrainingBatch {
    pub states: Tensor,
    pub actions: Vec<u32>,
    /// Regression targets for the extrinsic value head.
    pub returns: Vec<f32>,
    /// Policy gradient weights.
    pub advantages: Vec<f32>,
    /// Regression targets for an intrinsic value head, when the model has one.
    pub intrinsic_returns: Option<Vec<f32>>,
}

impl TrainingBatch {
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// The predictive model driven by the trainers. It has to accept batches of N states during
/// rollouts and single states during validation.
pub trait ActorCritic {
    fn forward(&self, states: &Tensor) -> Result<PolicyOutput>;

    /// Runs one optimisation step and returns the scalar loss.
    fn backprop(&mut self, batch: &TrainingBatch) -> Result<f32>;
}

impl<M: ActorCritic + ?Sized> ActorCritic for Box<M> {
    fn forward(&self, states: &Tensor) -> Result<PolicyOutput> {
        (**self).forward(states)
    }

    fn backprop(&mut self, batch: &TrainingBatch) -> Result<f32> {
        (**self).backprop(batch)
    }
}
