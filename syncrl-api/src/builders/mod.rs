pub mod a2c;
pub mod curiosity;
pub mod env;
pub mod trainer;
