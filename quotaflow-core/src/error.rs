// quotaflow-core: error types

use thiserror::Error;

pub type LimiterResult<T> = Result<T, LimiterError>;

#[derive(Debug, Error, Clone)]
pub enum LimiterError {
    #[error("durable store error: {0}")]
    Durable(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("fatal error: {0}")]
    Fatal(String),

    #[error("shard actor is no longer running")]
    ShardGone,
}
