mod logging;

pub use logging::{LoggingHooks, ScoreHistory};
