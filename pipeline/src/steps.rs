//! Pipeline steps.
//!
//! Each step is a small unit with one responsibility; the runner executes
//! them in order against a shared [`RunContext`].

use crate::trigger::{branch_from_ref, TriggerEvent};
use crate::workflow::PipelineDefinition;
use async_trait::async_trait;
use hosting::{
    AppServiceProvider, DeployReceipt, HealthReport, HostingError, HostingProvider, PublishProfile,
};
use packager::{
    create_archive_until, create_virtualenv, locate_interpreter, ArchiveSummary, Interpreter,
    PackagerError, ProcessRunner, VirtualEnv,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum StepError {
    #[error("Packaging failed: {0}")]
    Packaging(#[from] PackagerError),

    #[error("Deployment failed: {0}")]
    Hosting(#[from] HostingError),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("Secret {name} is not set")]
    MissingSecret { name: String },

    #[error("Publish profile targets '{profile_app}' but the pipeline targets '{expected}'")]
    AppMismatch {
        expected: String,
        profile_app: String,
    },

    #[error("Precondition failed: {message}")]
    Precondition { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StepResult<T> = Result<T, StepError>;

/// How a step ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded { summary: String },
    /// Completed, but something deserves attention; does not fail the run
    Warned { message: String },
    Skipped { reason: String },
    Failed { error: String },
}

impl StepOutcome {
    pub fn succeeded(summary: impl Into<String>) -> Self {
        StepOutcome::Succeeded {
            summary: summary.into(),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        StepOutcome::Skipped {
            reason: reason.into(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, StepOutcome::Failed { .. })
    }
}

/// Source revision found at checkout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub branch: Option<String>,
    pub commit: String,
}

/// Read the checked-out revision, `None` when `dir` is not inside a repository
pub fn read_revision(dir: &Path) -> StepResult<Option<Revision>> {
    let repo = match git2::Repository::discover(dir) {
        Ok(repo) => repo,
        Err(e) if e.code() == git2::ErrorCode::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let head = match repo.head() {
        Ok(head) => head,
        Err(e) if e.code() == git2::ErrorCode::UnbornBranch => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let commit = head.peel_to_commit()?.id().to_string();
    let branch = if head.is_branch() {
        head.shorthand().map(str::to_string)
    } else {
        None
    };

    Ok(Some(Revision { branch, commit }))
}

/// Named secrets available to a run
#[derive(Default, Clone)]
pub struct SecretStore {
    values: HashMap<String, String>,
}

impl std::fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.values.keys().collect();
        names.sort();
        f.debug_struct("SecretStore").field("names", &names).finish()
    }
}

impl SecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    /// Capture the given variables from the process environment
    pub fn from_env(names: &[&str]) -> Self {
        let values = names
            .iter()
            .filter_map(|name| std::env::var(name).ok().map(|v| (name.to_string(), v)))
            .collect();
        Self { values }
    }

    /// Blank values count as missing
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }
}

/// Shared state of one run
pub struct RunContext {
    pub source_dir: PathBuf,
    pub definition: PipelineDefinition,
    pub event: TriggerEvent,
    pub dry_run: bool,
    pub runner: Arc<dyn ProcessRunner>,
    pub secrets: SecretStore,
    pub revision: Option<Revision>,
    pub interpreter: Option<Interpreter>,
    pub venv: Option<VirtualEnv>,
    pub startup_path: Option<PathBuf>,
    pub archive: Option<ArchiveSummary>,
    pub provider: Option<Arc<dyn HostingProvider>>,
    pub receipt: Option<DeployReceipt>,
    pub health: Option<HealthReport>,
}

impl RunContext {
    pub fn new(
        source_dir: impl Into<PathBuf>,
        definition: PipelineDefinition,
        runner: Arc<dyn ProcessRunner>,
        secrets: SecretStore,
    ) -> Self {
        Self {
            source_dir: source_dir.into(),
            definition,
            event: TriggerEvent::WorkflowDispatch,
            dry_run: false,
            runner,
            secrets,
            revision: None,
            interpreter: None,
            venv: None,
            startup_path: None,
            archive: None,
            provider: None,
            receipt: None,
            health: None,
        }
    }

    pub fn with_event(mut self, event: TriggerEvent) -> Self {
        self.event = event;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self, ctx: &mut RunContext) -> StepResult<StepOutcome>;
}

/// The deployment pipeline, in execution order
pub fn default_steps() -> Vec<Box<dyn Step>> {
    vec![
        Box::new(CheckoutStep),
        Box::new(SetupInterpreterStep),
        Box::new(InstallDependenciesStep),
        Box::new(WriteStartupFileStep),
        Box::new(PackageStep),
        Box::new(DeployStep),
        Box::new(HealthCheckStep),
    ]
}

pub struct CheckoutStep;

#[async_trait]
impl Step for CheckoutStep {
    fn name(&self) -> &'static str {
        "checkout"
    }

    async fn run(&self, ctx: &mut RunContext) -> StepResult<StepOutcome> {
        if !ctx.source_dir.is_dir() {
            return Err(StepError::Precondition {
                message: format!("{} is not a directory", ctx.source_dir.display()),
            });
        }

        let Some(revision) = read_revision(&ctx.source_dir)? else {
            warn!(
                "{} is not a git checkout, shipping the working tree as is",
                ctx.source_dir.display()
            );
            return Ok(StepOutcome::succeeded("working tree (no git metadata)"));
        };

        if let TriggerEvent::Push { git_ref } = &ctx.event {
            let pushed = branch_from_ref(git_ref);
            if pushed.is_some() && pushed != revision.branch.as_deref() {
                warn!(
                    "Event is for {} but the checkout is on {}",
                    git_ref,
                    revision.branch.as_deref().unwrap_or("a detached HEAD")
                );
            }
        }

        let summary = format!(
            "{} at {}",
            revision.branch.as_deref().unwrap_or("detached HEAD"),
            revision.commit
        );
        ctx.revision = Some(revision);
        Ok(StepOutcome::succeeded(summary))
    }
}

pub struct SetupInterpreterStep;

#[async_trait]
impl Step for SetupInterpreterStep {
    fn name(&self) -> &'static str {
        "setup-interpreter"
    }

    async fn run(&self, ctx: &mut RunContext) -> StepResult<StepOutcome> {
        let interpreter =
            locate_interpreter(ctx.runner.as_ref(), &ctx.definition.python_version).await?;
        let summary = format!("{} (Python {})", interpreter.program, interpreter.version);
        ctx.interpreter = Some(interpreter);
        Ok(StepOutcome::succeeded(summary))
    }
}

pub struct InstallDependenciesStep;

#[async_trait]
impl Step for InstallDependenciesStep {
    fn name(&self) -> &'static str {
        "install-dependencies"
    }

    async fn run(&self, ctx: &mut RunContext) -> StepResult<StepOutcome> {
        let interpreter = ctx.interpreter.clone().ok_or_else(|| StepError::Precondition {
            message: "no interpreter selected".to_string(),
        })?;
        let settings = &ctx.definition.package;

        let venv = create_virtualenv(
            ctx.runner.as_ref(),
            &interpreter,
            &ctx.source_dir,
            &settings.venv_dir,
        )
        .await?;
        let installed = venv
            .install_requirements(
                ctx.runner.as_ref(),
                &ctx.source_dir,
                &settings.requirements_file,
            )
            .await?;

        let summary = if installed {
            format!("installed {} into {}", settings.requirements_file, settings.venv_dir)
        } else {
            format!("created {} (no {})", settings.venv_dir, settings.requirements_file)
        };
        ctx.venv = Some(venv);
        Ok(StepOutcome::succeeded(summary))
    }
}

pub struct WriteStartupFileStep;

#[async_trait]
impl Step for WriteStartupFileStep {
    fn name(&self) -> &'static str {
        "write-startup-file"
    }

    async fn run(&self, ctx: &mut RunContext) -> StepResult<StepOutcome> {
        let startup = &ctx.definition.startup;
        let path = startup.write_to(&ctx.source_dir, &ctx.definition.package.startup_file)?;
        let summary = startup.render();
        ctx.startup_path = Some(path);
        Ok(StepOutcome::succeeded(summary))
    }
}

pub struct PackageStep;

/// Raises its flag when dropped, including when the owning future is cancelled
struct StopOnDrop(Arc<AtomicBool>);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

#[async_trait]
impl Step for PackageStep {
    fn name(&self) -> &'static str {
        "package"
    }

    async fn run(&self, ctx: &mut RunContext) -> StepResult<StepOutcome> {
        let spec = ctx.definition.package.archive_spec(&ctx.source_dir);
        let stop = Arc::new(AtomicBool::new(false));
        let _guard = StopOnDrop(stop.clone());

        let summary = tokio::task::spawn_blocking(move || {
            create_archive_until(&spec, || stop.load(Ordering::Relaxed))
        })
        .await
            .map_err(|e| StepError::Precondition {
                message: format!("archive task did not complete: {}", e),
            })??;

        let message = format!(
            "{} files, {} bytes -> {}",
            summary.file_count,
            summary.total_bytes,
            summary.path.display()
        );
        ctx.archive = Some(summary);
        Ok(StepOutcome::succeeded(message))
    }
}

/// Build a platform client from the publish profile secret.
///
/// Everything that has to hold before a single byte leaves the machine is
/// checked here: the secret is present, parses, and names the expected app.
pub fn connect_provider(
    definition: &PipelineDefinition,
    secrets: &SecretStore,
) -> StepResult<AppServiceProvider> {
    let secret_name = &definition.deploy.publish_profile_env;
    let xml = secrets
        .get(secret_name)
        .ok_or_else(|| StepError::MissingSecret {
            name: secret_name.clone(),
        })?;

    let profile = PublishProfile::parse(xml)?;

    if let Some(expected) = &definition.app_name {
        let profile_app = profile.app_name();
        if !profile_app.eq_ignore_ascii_case(expected) {
            return Err(StepError::AppMismatch {
                expected: expected.clone(),
                profile_app,
            });
        }
    }

    Ok(AppServiceProvider::new(
        definition.deploy.app_service_config(),
        profile,
    )?)
}

pub struct DeployStep;

#[async_trait]
impl Step for DeployStep {
    fn name(&self) -> &'static str {
        "deploy"
    }

    async fn run(&self, ctx: &mut RunContext) -> StepResult<StepOutcome> {
        if ctx.dry_run {
            return Ok(StepOutcome::skipped("dry run"));
        }

        let archive = ctx
            .archive
            .as_ref()
            .map(|a| a.path.clone())
            .ok_or_else(|| StepError::Precondition {
                message: "no archive was produced".to_string(),
            })?;

        let provider = connect_provider(&ctx.definition, &ctx.secrets)?;
        info!(
            "Deploying {} to {}",
            archive.display(),
            provider.profile().app_name()
        );

        let provider: Arc<dyn HostingProvider> = Arc::new(provider);
        let receipt = provider.deploy_package(&archive).await?;

        let summary = format!(
            "{} deployed to {}",
            receipt.deployment_id.as_deref().unwrap_or("package"),
            receipt.site_url
        );
        ctx.provider = Some(provider);
        ctx.receipt = Some(receipt);
        Ok(StepOutcome::succeeded(summary))
    }
}

pub struct HealthCheckStep;

#[async_trait]
impl Step for HealthCheckStep {
    fn name(&self) -> &'static str {
        "health-check"
    }

    async fn run(&self, ctx: &mut RunContext) -> StepResult<StepOutcome> {
        if !ctx.definition.deploy.health_check {
            return Ok(StepOutcome::skipped("disabled"));
        }
        let Some(provider) = ctx.provider.clone() else {
            return Ok(StepOutcome::skipped("nothing was deployed"));
        };

        match provider.health_check().await {
            Ok(report) if report.healthy => {
                let summary = format!("{} answered {}", report.url, report.status);
                ctx.health = Some(report);
                Ok(StepOutcome::succeeded(summary))
            }
            Ok(report) => {
                let message = format!("{} answered {}", report.url, report.status);
                ctx.health = Some(report);
                Ok(StepOutcome::Warned { message })
            }
            Err(e) => {
                debug!("Health check error: {:?}", e);
                Ok(StepOutcome::Warned {
                    message: format!("health check failed: {}", e),
                })
            }
        }
    }
}
