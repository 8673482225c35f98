pub mod a2c;
pub mod curiosity;
pub mod nn;
pub mod optimizer;

pub use a2c::{A2CCoefficients, LinearActorCritic};
pub use curiosity::{
    CuriosityModel, CuriositySettings, CuriosityTrainer, RndActorCritic, RndConfig,
};
