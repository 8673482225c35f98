use thiserror::Error;

/// Errors raised by the rollout and return pipeline.
///
/// Configuration errors are raised while building a trainer, never in the middle of a run.
/// Shape errors are programming errors and are not meant to be recovered from.
#[derive(Error, Debug)]
pub enum SyncRlError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("Environment batch failure: {0}")]
    Environment(String),

    #[error("Model failure: {0}")]
    Model(String),

    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

impl SyncRlError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// Checks that `rows` is a (T, N) matrix.
pub fn ensure_shape<T>(
    context: &'static str,
    rows: &[Vec<T>],
    expected: (usize, usize),
) -> Result<(), SyncRlError> {
    let steps = rows.len();
    let envs = rows.first().map(|r| r.len()).unwrap_or(expected.1);
    if steps != expected.0 || rows.iter().any(|r| r.len() != expected.1) {
        return Err(SyncRlError::ShapeMismatch {
            context,
            expected,
            actual: (steps, envs),
        });
    }
    Ok(())
}
