//! Sharded per-customer usage limiter: entitlement store, actor shard,
//! router, and alarm glue.

pub mod alarm;
pub mod config;
pub mod domain;
pub mod error;
pub mod health;
pub mod hydrate;
pub mod registry;
pub mod router;
pub mod shard;
pub mod store;

pub use config::LimiterConfig;
pub use error::{LimiterError, LimiterResult};
pub use router::Router;
