use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppServiceConfig {
    /// Replaces the deployment endpoint taken from the publish profile
    pub scm_url_override: Option<String>,
    /// Replaces the public site URL taken from the publish profile
    pub site_url_override: Option<String>,
    /// Per-request timeout, the upload included
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
    /// Ask the platform to apply the package in the background and poll for the result
    pub is_async: bool,
    pub health_path: String,
}

impl Default for AppServiceConfig {
    fn default() -> Self {
        Self {
            scm_url_override: None,
            site_url_override: None,
            timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(2),
            max_poll_attempts: 150,
            is_async: true,
            health_path: "/".to_string(),
        }
    }
}

impl AppServiceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scm_url(mut self, url: impl Into<String>) -> Self {
        self.scm_url_override = Some(url.into());
        self
    }

    pub fn with_site_url(mut self, url: impl Into<String>) -> Self {
        self.site_url_override = Some(url.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_max_poll_attempts(mut self, attempts: u32) -> Self {
        self.max_poll_attempts = attempts;
        self
    }

    pub fn with_async(mut self, is_async: bool) -> Self {
        self.is_async = is_async;
        self
    }

    pub fn with_health_path(mut self, path: impl Into<String>) -> Self {
        self.health_path = path.into();
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        for url in [&self.scm_url_override, &self.site_url_override]
            .into_iter()
            .flatten()
        {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(format!("URL '{}' must start with http:// or https://", url));
            }
        }

        if self.timeout.is_zero() {
            return Err("Timeout must be greater than 0".to_string());
        }

        if self.is_async {
            if self.poll_interval.is_zero() {
                return Err("Poll interval must be greater than 0".to_string());
            }
            if self.max_poll_attempts == 0 {
                return Err("Max poll attempts must be greater than 0".to_string());
            }
        }

        if !self.health_path.starts_with('/') {
            return Err("Health path must start with /".to_string());
        }

        Ok(())
    }
}
