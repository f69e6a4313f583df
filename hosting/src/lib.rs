pub mod app_service;
pub mod config;
pub mod provider;
pub mod publish_profile;
pub mod types;

pub use app_service::AppServiceProvider;
pub use config::AppServiceConfig;
pub use provider::{HostingError, HostingProvider, HostingResult};
pub use publish_profile::PublishProfile;
pub use types::{DeployReceipt, DeploymentState, HealthReport};

pub mod prelude {
    pub use crate::app_service::*;
    pub use crate::config::*;
    pub use crate::provider::*;
    pub use crate::publish_profile::*;
    pub use crate::types::*;
}
