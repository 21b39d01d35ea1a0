//! Error types.
//!
//! Background loops log these and keep going; only the query/mutation surface
//! turns them into caller-visible results.

use thiserror::Error;

use crate::graph::PolicyKeyError;

pub type MeshResult<T> = Result<T, MeshError>;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("Channel error: {0}")]
    Channel(#[from] redis::RedisError),

    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cluster API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Metrics query failed: {0}")]
    Metrics(String),

    #[error("Invalid policy key: {0}")]
    InvalidPolicyKey(#[from] PolicyKeyError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl From<deadpool_redis::PoolError> for MeshError {
    fn from(e: deadpool_redis::PoolError) -> Self {
        MeshError::Pool(e.to_string())
    }
}

impl From<reqwest::Error> for MeshError {
    fn from(e: reqwest::Error) -> Self {
        MeshError::Metrics(e.to_string())
    }
}
