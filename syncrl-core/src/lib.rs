pub mod distributions;
pub mod env;
pub mod error;
pub mod model;
pub mod returns;
pub mod runner;
pub mod sync_trainer;
pub mod trajectory;
pub mod utils;
pub mod validation;

use anyhow::Result;

/// A learning algorithm. `SyncTrainer` and the curiosity trainer in `syncrl-agents` implement
/// this trait.
pub trait Algorithm {
    fn train(&mut self) -> Result<()>;
}
