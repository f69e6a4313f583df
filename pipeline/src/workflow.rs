//! Pipeline definition.
//!
//! A definition is read from a TOML file (every field optional) and then
//! adjusted from the environment, mirroring the `env:` block of a CI workflow.

use crate::trigger::TriggerConfig;
use hosting::AppServiceConfig;
use packager::{PackageSettings, StartupCommand};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub const ENV_APP_NAME: &str = "AZURE_WEBAPP_NAME";
pub const ENV_PYTHON_VERSION: &str = "PYTHON_VERSION";
pub const DEFAULT_PUBLISH_PROFILE_ENV: &str = "AZURE_WEBAPP_PUBLISH_PROFILE";

/// Longest allowed run, in minutes (six hours)
pub const MAX_TIMEOUT_MINUTES: u64 = 360;

#[derive(Error, Debug)]
pub enum DefinitionError {
    #[error("Failed to read pipeline definition {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse pipeline definition: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to render pipeline definition: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("Invalid pipeline definition: {message}")]
    Invalid { message: String },
}

pub type DefinitionResult<T> = Result<T, DefinitionError>;

/// How the deploy and health-check steps talk to the platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploySettings {
    /// Environment variable holding the publish profile XML
    pub publish_profile_env: String,
    pub request_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub max_poll_attempts: u32,
    pub is_async: bool,
    pub health_check: bool,
    pub health_path: String,
    /// Deployment endpoint override (defaults to the publish profile's)
    pub scm_url: Option<String>,
    /// Public site override (defaults to the publish profile's)
    pub site_url: Option<String>,
}

impl Default for DeploySettings {
    fn default() -> Self {
        let platform = AppServiceConfig::default();
        Self {
            publish_profile_env: DEFAULT_PUBLISH_PROFILE_ENV.to_string(),
            request_timeout_secs: platform.timeout.as_secs(),
            poll_interval_secs: platform.poll_interval.as_secs(),
            max_poll_attempts: platform.max_poll_attempts,
            is_async: platform.is_async,
            health_check: true,
            health_path: platform.health_path,
            scm_url: None,
            site_url: None,
        }
    }
}

impl DeploySettings {
    pub fn app_service_config(&self) -> AppServiceConfig {
        let mut config = AppServiceConfig::new()
            .with_timeout(Duration::from_secs(self.request_timeout_secs))
            .with_poll_interval(Duration::from_secs(self.poll_interval_secs))
            .with_max_poll_attempts(self.max_poll_attempts)
            .with_async(self.is_async)
            .with_health_path(self.health_path.clone());

        if let Some(url) = &self.scm_url {
            config = config.with_scm_url(url.clone());
        }
        if let Some(url) = &self.site_url {
            config = config.with_site_url(url.clone());
        }
        config
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.publish_profile_env.trim().is_empty() {
            return Err("publish_profile_env cannot be empty".to_string());
        }
        self.app_service_config().validate()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineDefinition {
    pub name: String,
    /// Target application; when unset the publish profile decides
    pub app_name: Option<String>,
    pub python_version: String,
    /// Whole-run limit; exceeding it aborts the run
    pub timeout_minutes: u64,
    pub triggers: TriggerConfig,
    pub package: PackageSettings,
    pub startup: StartupCommand,
    pub deploy: DeploySettings,
}

impl Default for PipelineDefinition {
    fn default() -> Self {
        Self {
            name: "Build and deploy Python app".to_string(),
            app_name: None,
            python_version: "3.11".to_string(),
            timeout_minutes: 30,
            triggers: TriggerConfig::default(),
            package: PackageSettings::default(),
            startup: StartupCommand::default(),
            deploy: DeploySettings::default(),
        }
    }
}

impl PipelineDefinition {
    pub fn from_toml(contents: &str) -> DefinitionResult<Self> {
        let definition: Self = toml::from_str(contents)?;
        Ok(definition)
    }

    pub fn to_toml(&self) -> DefinitionResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Read and validate a definition file
    pub fn load(path: &Path) -> DefinitionResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| DefinitionError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let definition = Self::from_toml(&contents)?;
        definition
            .validate()
            .map_err(|message| DefinitionError::Invalid { message })?;

        info!("Loaded pipeline definition from {}", path.display());
        Ok(definition)
    }

    pub fn load_or_default(path: Option<&Path>) -> DefinitionResult<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                debug!("No pipeline definition given, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Apply `AZURE_WEBAPP_NAME` and `PYTHON_VERSION` from `lookup`
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(app_name) = lookup(ENV_APP_NAME).filter(|v| !v.trim().is_empty()) {
            debug!("{} overrides app name with {}", ENV_APP_NAME, app_name);
            self.app_name = Some(app_name);
        }
        if let Some(version) = lookup(ENV_PYTHON_VERSION).filter(|v| !v.trim().is_empty()) {
            debug!("{} overrides Python version with {}", ENV_PYTHON_VERSION, version);
            self.python_version = version;
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes.saturating_mul(60))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Pipeline name cannot be empty".to_string());
        }

        if let Some(app_name) = &self.app_name {
            if app_name.trim().is_empty() {
                return Err("App name cannot be empty".to_string());
            }
        }

        if self.python_version.trim().is_empty() {
            return Err("Python version cannot be empty".to_string());
        }

        if self.timeout_minutes == 0 {
            return Err("Timeout must be greater than 0".to_string());
        }
        if self.timeout_minutes > MAX_TIMEOUT_MINUTES {
            return Err(format!(
                "Timeout cannot exceed {} minutes",
                MAX_TIMEOUT_MINUTES
            ));
        }

        self.triggers.validate()?;
        self.package.validate()?;
        self.startup.validate()?;
        self.deploy.validate()
    }
}
