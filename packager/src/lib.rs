//! Packaging utilities for webship
//!
//! This crate turns a checkout of a Python web application into the artifact
//! that gets shipped to the hosting platform: it prepares a virtual
//! environment, writes the startup-command file and zips the tree.

pub mod archive;
pub mod process;
pub mod startup;
pub mod venv;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

pub use archive::{
    create_archive, create_archive_until, list_archive, ArchiveSpec, ArchiveSummary,
};
pub use process::{run_checked, ProcessOutput, ProcessRunner, ProcessSpec, SystemProcessRunner};
pub use startup::StartupCommand;
pub use venv::{create_virtualenv, locate_interpreter, version_matches, Interpreter, VirtualEnv};

/// Errors related to packaging
#[derive(Error, Debug)]
pub enum PackagerError {
    #[error("Command `{command}` failed with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("Interpreter not found: {reason}")]
    InterpreterNotFound { reason: String },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Packaging was cancelled")]
    Cancelled,
    #[error("Source directory not found: {path}")]
    SourceNotFound { path: String },
    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("Invalid exclude pattern: {0}")]
    Pattern(#[from] glob::PatternError),
    #[error("Directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type PackagerResult<T> = Result<T, PackagerError>;

/// Layout of the package inside the source tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageSettings {
    /// Virtual environment directory, relative to the source root
    pub venv_dir: String,
    /// Requirements manifest, relative to the source root
    pub requirements_file: String,
    /// Startup-command file written into the source root
    pub startup_file: String,
    /// Archive file name, written into the source root
    pub archive_name: String,
    /// Additional glob patterns (relative, `/`-separated) left out of the archive
    pub exclude_globs: Vec<String>,
}

impl Default for PackageSettings {
    fn default() -> Self {
        Self {
            venv_dir: "venv".to_string(),
            requirements_file: "requirements.txt".to_string(),
            startup_file: "startup.txt".to_string(),
            archive_name: "release.zip".to_string(),
            exclude_globs: vec![],
        }
    }
}

impl PackageSettings {
    pub fn validate(&self) -> Result<(), String> {
        for (field, value) in [
            ("venv_dir", &self.venv_dir),
            ("requirements_file", &self.requirements_file),
            ("startup_file", &self.startup_file),
            ("archive_name", &self.archive_name),
        ] {
            if value.trim().is_empty() {
                return Err(format!("{} cannot be empty", field));
            }
        }

        if self.venv_dir.contains('/') || self.venv_dir.contains('\\') {
            return Err("venv_dir must be a top-level directory name".to_string());
        }

        if !self.archive_name.ends_with(".zip") {
            return Err("archive_name must end with .zip".to_string());
        }

        for pattern in &self.exclude_globs {
            glob::Pattern::new(pattern)
                .map_err(|e| format!("Invalid exclude pattern '{}': {}", pattern, e))?;
        }

        Ok(())
    }

    /// Archive specification for a given source root
    pub fn archive_spec(&self, source_dir: &Path) -> ArchiveSpec {
        ArchiveSpec::new(source_dir, source_dir.join(&self.archive_name))
            .with_exclude_dirs(vec![self.venv_dir.clone()])
            .with_exclude_globs(self.exclude_globs.clone())
    }
}

/// Everything produced by [`build_package`]
#[derive(Debug, Clone)]
pub struct PackageOutput {
    pub interpreter: Interpreter,
    pub venv: VirtualEnv,
    pub requirements_installed: bool,
    pub startup_path: PathBuf,
    pub archive: ArchiveSummary,
}

/// Prepare the virtual environment, write the startup file and zip the tree
pub async fn build_package(
    runner: &dyn ProcessRunner,
    source_dir: &Path,
    python_version: &str,
    settings: &PackageSettings,
    startup: &StartupCommand,
) -> PackagerResult<PackageOutput> {
    settings.validate().map_err(PackagerError::InvalidConfig)?;

    if !source_dir.is_dir() {
        return Err(PackagerError::SourceNotFound {
            path: source_dir.display().to_string(),
        });
    }

    let interpreter = locate_interpreter(runner, python_version).await?;
    let venv = create_virtualenv(runner, &interpreter, source_dir, &settings.venv_dir).await?;
    let requirements_installed = venv
        .install_requirements(runner, source_dir, &settings.requirements_file)
        .await?;

    let startup_path = startup.write_to(source_dir, &settings.startup_file)?;
    let archive = create_archive(&settings.archive_spec(source_dir))?;

    info!(
        "Packaged {} files ({} bytes) into {}",
        archive.file_count,
        archive.total_bytes,
        archive.path.display()
    );

    Ok(PackageOutput {
        interpreter,
        venv,
        requirements_installed,
        startup_path,
        archive,
    })
}
