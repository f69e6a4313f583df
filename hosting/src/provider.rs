use crate::types::{DeployReceipt, DeploymentState, HealthReport};
use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HostingError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid publish profile: {message}")]
    InvalidPublishProfile { message: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Archive not found: {path}")]
    ArchiveNotFound { path: String },

    #[error("Authentication failed (HTTP {status})")]
    Authentication { status: u16 },

    #[error("Deployment rejected (HTTP {status}): {body}")]
    DeploymentRejected { status: u16, body: String },

    #[error("Deployment {deployment_id} failed: {message}")]
    DeploymentFailed {
        deployment_id: String,
        message: String,
    },

    #[error("Deployment did not complete after {attempts} status checks")]
    DeploymentTimeout { attempts: u32 },

    #[error("Unknown error: {message}")]
    Unknown { message: String },
}

pub type HostingResult<T> = Result<T, HostingError>;

#[async_trait]
pub trait HostingProvider: Send + Sync {
    /// Upload a zip package and wait until the platform has applied it
    async fn deploy_package(&self, archive: &Path) -> HostingResult<DeployReceipt>;

    async fn deployment_status(&self, deployment_id: &str) -> HostingResult<DeploymentState>;

    async fn health_check(&self) -> HostingResult<HealthReport>;

    fn provider_name(&self) -> &'static str;
}
