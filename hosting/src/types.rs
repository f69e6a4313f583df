use serde::{Deserialize, Serialize};

/// Deployment progress as reported by the platform's deployment engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentState {
    Pending,
    Building,
    Deploying,
    Failed,
    Success,
}

impl DeploymentState {
    /// Kudu numeric status codes: 0 pending, 1 building, 2 deploying, 3 failed, 4 success
    pub fn from_kudu_status(status: i64) -> Self {
        match status {
            1 => DeploymentState::Building,
            2 => DeploymentState::Deploying,
            3 => DeploymentState::Failed,
            4 => DeploymentState::Success,
            _ => DeploymentState::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DeploymentState::Failed | DeploymentState::Success)
    }
}

impl std::fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeploymentState::Pending => write!(f, "pending"),
            DeploymentState::Building => write!(f, "building"),
            DeploymentState::Deploying => write!(f, "deploying"),
            DeploymentState::Failed => write!(f, "failed"),
            DeploymentState::Success => write!(f, "success"),
        }
    }
}

/// Deployment record returned by `/api/deployments/*`
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct KuduDeployment {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: i64,
    #[serde(default)]
    pub status_text: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub complete: bool,
    #[serde(default)]
    pub log_url: Option<String>,
}

impl KuduDeployment {
    pub fn state(&self) -> DeploymentState {
        DeploymentState::from_kudu_status(self.status)
    }

    pub fn describe(&self) -> String {
        self.status_text
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.message.as_deref())
            .unwrap_or("no details reported")
            .to_string()
    }
}

/// Outcome of a completed deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployReceipt {
    pub deployment_id: Option<String>,
    pub state: DeploymentState,
    pub site_url: String,
    pub archive_bytes: u64,
    /// Status polls performed after upload
    pub polls: u32,
    pub log_url: Option<String>,
}

/// Result of probing the deployed site
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub url: String,
    pub status: u16,
    pub healthy: bool,
    pub latency_ms: u64,
}
