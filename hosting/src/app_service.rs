use crate::config::AppServiceConfig;
use crate::provider::{HostingError, HostingProvider, HostingResult};
use crate::publish_profile::PublishProfile;
use crate::types::{DeployReceipt, DeploymentState, HealthReport, KuduDeployment};
use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, LOCATION};
use reqwest::{StatusCode, Url};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Zip-deploy client for App Service applications, authenticated with a publish profile
pub struct AppServiceProvider {
    http_client: reqwest::Client,
    scm_url: String,
    site_url: String,
    profile: PublishProfile,
    config: AppServiceConfig,
}

impl AppServiceProvider {
    pub fn new(config: AppServiceConfig, profile: PublishProfile) -> HostingResult<Self> {
        config
            .validate()
            .map_err(|message| HostingError::InvalidConfig { message })?;
        profile.validate()?;

        let scm_url = config
            .scm_url_override
            .clone()
            .unwrap_or_else(|| profile.scm_base_url())
            .trim_end_matches('/')
            .to_string();

        let site_url = config
            .site_url_override
            .clone()
            .or_else(|| profile.site_url())
            .unwrap_or_else(|| format!("https://{}.azurewebsites.net", profile.app_name()))
            .trim_end_matches('/')
            .to_string();

        Url::parse(&scm_url).map_err(|e| HostingError::InvalidConfig {
            message: format!("Invalid deployment endpoint '{}': {}", scm_url, e),
        })?;

        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| HostingError::Unknown {
                message: format!("Failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            http_client,
            scm_url,
            site_url,
            profile,
            config,
        })
    }

    /// Parse the publish profile secret and build a provider from it
    pub fn from_profile_xml(config: AppServiceConfig, xml: &str) -> HostingResult<Self> {
        Self::new(config, PublishProfile::parse(xml)?)
    }

    pub fn scm_url(&self) -> &str {
        &self.scm_url
    }

    pub fn site_url(&self) -> &str {
        &self.site_url
    }

    pub fn profile(&self) -> &PublishProfile {
        &self.profile
    }

    fn zipdeploy_url(&self) -> String {
        if self.config.is_async {
            format!("{}/api/zipdeploy?isAsync=true", self.scm_url)
        } else {
            format!("{}/api/zipdeploy", self.scm_url)
        }
    }

    /// `{scm}/<segments...>`, each segment percent-encoded
    fn endpoint(&self, segments: &[&str]) -> HostingResult<Url> {
        let mut url = Url::parse(&self.scm_url).map_err(|e| HostingError::InvalidConfig {
            message: format!("Invalid deployment endpoint '{}': {}", self.scm_url, e),
        })?;
        url.path_segments_mut()
            .map_err(|_| HostingError::InvalidConfig {
                message: format!("Deployment endpoint '{}' cannot take a path", self.scm_url),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Status URL announced by an accepted upload, if it points back at the deployment endpoint
    fn announced_status_url(&self, location: Option<&str>) -> Option<Url> {
        let base = Url::parse(&self.scm_url).ok()?;
        let url = base.join(location?).ok()?;

        if url.host_str() != base.host_str()
            || url.port_or_known_default() != base.port_or_known_default()
        {
            warn!("Ignoring status location on another host: {}", url);
            return None;
        }
        Some(url)
    }

    /// Id of the deployment the platform reported as latest before the upload
    async fn previous_deployment(&self, latest: &Url) -> HostingResult<Option<String>> {
        match self.fetch_deployment(latest.as_str()).await {
            Ok(record) => Ok(record.and_then(|r| r.id)),
            Err(e @ HostingError::Authentication { .. }) => Err(e),
            Err(e) => {
                debug!("No previous deployment on record: {}", e);
                Ok(None)
            }
        }
    }

    fn check_auth(status: StatusCode) -> HostingResult<()> {
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(HostingError::Authentication {
                status: status.as_u16(),
            });
        }
        Ok(())
    }

    /// `None` when the platform has no record to report yet
    async fn fetch_deployment(&self, url: &str) -> HostingResult<Option<KuduDeployment>> {
        let response = self
            .http_client
            .get(url)
            .basic_auth(&self.profile.user_name, Some(&self.profile.user_pwd))
            .send()
            .await?;

        let status = response.status();
        Self::check_auth(status)?;

        if !status.is_success() {
            warn!("Deployment status request returned {}", status);
            return Ok(None);
        }

        let body = response.text().await?;
        Ok(Some(serde_json::from_str(&body)?))
    }

    /// Poll `status_url` until the deployment settles.
    ///
    /// A record whose id is `stale_id` belongs to an earlier deployment and
    /// counts as "not registered yet".
    async fn wait_for_completion(
        &self,
        status_url: &Url,
        stale_id: Option<&str>,
        archive_bytes: u64,
    ) -> HostingResult<DeployReceipt> {
        let attempts = self.config.max_poll_attempts;

        for attempt in 1..=attempts {
            let record = self
                .fetch_deployment(status_url.as_str())
                .await?
                .filter(|record| stale_id.is_none() || record.id.as_deref() != stale_id);

            if let Some(record) = record {
                let state = record.state();
                debug!(
                    "Deployment {} is {} (check {}/{})",
                    record.id.as_deref().unwrap_or("latest"),
                    state,
                    attempt,
                    attempts
                );

                match state {
                    DeploymentState::Success => {
                        info!("Deployment completed after {} status checks", attempt);
                        return Ok(DeployReceipt {
                            deployment_id: record.id,
                            state,
                            site_url: self.site_url.clone(),
                            archive_bytes,
                            polls: attempt,
                            log_url: record.log_url,
                        });
                    }
                    DeploymentState::Failed => {
                        return Err(HostingError::DeploymentFailed {
                            message: record.describe(),
                            deployment_id: record.id.unwrap_or_else(|| "latest".to_string()),
                        });
                    }
                    _ => {}
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }

        Err(HostingError::DeploymentTimeout { attempts })
    }
}

#[async_trait]
impl HostingProvider for AppServiceProvider {
    async fn deploy_package(&self, archive: &Path) -> HostingResult<DeployReceipt> {
        let bytes = match tokio::fs::read(archive).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(HostingError::ArchiveNotFound {
                    path: archive.display().to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        let archive_bytes = bytes.len() as u64;

        let latest = self.endpoint(&["api", "deployments", "latest"])?;
        let previous = if self.config.is_async {
            self.previous_deployment(&latest).await?
        } else {
            None
        };

        info!(
            "Uploading {} ({} bytes) to {}",
            archive.display(),
            archive_bytes,
            self.scm_url
        );

        let response = self
            .http_client
            .post(self.zipdeploy_url())
            .basic_auth(&self.profile.user_name, Some(&self.profile.user_pwd))
            .header(CONTENT_TYPE, "application/zip")
            .body(bytes)
            .send()
            .await?;

        let status = response.status();
        Self::check_auth(status)?;
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HostingError::DeploymentRejected {
                status: status.as_u16(),
                body,
            });
        }

        if !self.config.is_async {
            info!("Deployment applied synchronously");
            return Ok(DeployReceipt {
                deployment_id: None,
                state: DeploymentState::Success,
                site_url: self.site_url.clone(),
                archive_bytes,
                polls: 0,
                log_url: None,
            });
        }

        match self.announced_status_url(location.as_deref()) {
            Some(status_url) => {
                debug!("Upload accepted with {}, polling {}", status, status_url);
                self.wait_for_completion(&status_url, None, archive_bytes).await
            }
            None => {
                debug!(
                    "Upload accepted with {}, polling latest (previously {})",
                    status,
                    previous.as_deref().unwrap_or("none")
                );
                self.wait_for_completion(&latest, previous.as_deref(), archive_bytes).await
            }
        }
    }

    async fn deployment_status(&self, deployment_id: &str) -> HostingResult<DeploymentState> {
        let url = self.endpoint(&["api", "deployments", deployment_id])?;

        match self.fetch_deployment(url.as_str()).await? {
            Some(record) => Ok(record.state()),
            None => Err(HostingError::Unknown {
                message: format!("Deployment {} not found", deployment_id),
            }),
        }
    }

    async fn health_check(&self) -> HostingResult<HealthReport> {
        let url = format!("{}{}", self.site_url, self.config.health_path);
        debug!("Checking {}", url);

        let start = Instant::now();
        let response = self.http_client.get(&url).send().await?;
        let status = response.status();

        let report = HealthReport {
            url,
            status: status.as_u16(),
            healthy: status.is_success(),
            latency_ms: start.elapsed().as_millis() as u64,
        };

        if report.healthy {
            info!("Health check passed: {} in {}ms", report.url, report.latency_ms);
        } else {
            warn!("Health check returned {} for {}", report.status, report.url);
        }

        Ok(report)
    }

    fn provider_name(&self) -> &'static str {
        "app-service"
    }
}
