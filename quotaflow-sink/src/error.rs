// quotaflow-sink: error types

use thiserror::Error;

pub type SinkResult<T> = Result<T, SinkError>;

#[derive(Debug, Error, Clone)]
pub enum SinkError {
    #[error("network error: {0}")]
    NetworkError(String),

    #[error("sink returned an error status: {0}")]
    ResponseError(String),

    #[error("batch exceeds the maximum size of {max}: got {got}")]
    BatchTooLarge { max: usize, got: usize },

    #[error("retry exhausted: {0}")]
    RetryExhausted(String),
}

pub fn is_retryable(err: &SinkError) -> bool {
    matches!(err, SinkError::NetworkError(_) | SinkError::ResponseError(_))
}
