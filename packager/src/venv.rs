//! Interpreter discovery and virtual environment setup.

use crate::process::{run_checked, ProcessRunner, ProcessSpec};
use crate::{PackagerError, PackagerResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A Python interpreter found on the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interpreter {
    /// Program name or path used to invoke it
    pub program: String,
    /// Full version as reported by `--version`
    pub version: String,
}

/// Candidate program names for a requested version, most specific first
pub fn interpreter_candidates(version: &str) -> Vec<String> {
    vec![
        format!("python{}", version),
        "python3".to_string(),
        "python".to_string(),
    ]
}

/// `3.11` matches `3.11.4` but not `3.1.2` or `3.12.0`
pub fn version_matches(reported: &str, requested: &str) -> bool {
    let reported: Vec<&str> = reported.split('.').collect();
    let requested: Vec<&str> = requested.split('.').filter(|p| !p.is_empty()).collect();

    !requested.is_empty()
        && requested.len() <= reported.len()
        && requested.iter().zip(&reported).all(|(want, have)| want == have)
}

fn parse_version_output(output: &str) -> Option<String> {
    output
        .trim()
        .strip_prefix("Python ")
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Find the first interpreter on the host that reports the requested version
pub async fn locate_interpreter(
    runner: &dyn ProcessRunner,
    version: &str,
) -> PackagerResult<Interpreter> {
    let candidates = interpreter_candidates(version);

    for candidate in &candidates {
        let spec = ProcessSpec::new(candidate.as_str()).arg("--version");
        let output = match runner.run(&spec).await {
            Ok(output) if output.is_success() => output,
            Ok(output) => {
                debug!("{} --version exited with {:?}", candidate, output.status);
                continue;
            }
            Err(e) => {
                debug!("{} unavailable: {}", candidate, e);
                continue;
            }
        };

        // Older interpreters print the version on stderr
        let reported =
            parse_version_output(&output.stdout).or_else(|| parse_version_output(&output.stderr));

        match reported {
            Some(reported) if version_matches(&reported, version) => {
                info!("Using {} (Python {})", candidate, reported);
                return Ok(Interpreter {
                    program: candidate.clone(),
                    version: reported,
                });
            }
            Some(reported) => debug!("Skipping {}: reports Python {}", candidate, reported),
            None => debug!("Skipping {}: unrecognised version output", candidate),
        }
    }

    Err(PackagerError::InterpreterNotFound {
        reason: format!(
            "no interpreter reporting Python {} among {}",
            version,
            candidates.join(", ")
        ),
    })
}

/// A virtual environment rooted inside the source tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualEnv {
    pub root: PathBuf,
}

impl VirtualEnv {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn bin_dir(&self) -> PathBuf {
        if cfg!(windows) {
            self.root.join("Scripts")
        } else {
            self.root.join("bin")
        }
    }

    pub fn python(&self) -> PathBuf {
        self.bin_dir().join("python")
    }

    /// Install the requirements manifest into the environment.
    ///
    /// Returns `false` without running anything when the manifest is absent.
    pub async fn install_requirements(
        &self,
        runner: &dyn ProcessRunner,
        source_dir: &Path,
        requirements_file: &str,
    ) -> PackagerResult<bool> {
        let requirements = source_dir.join(requirements_file);
        if !requirements.is_file() {
            info!(
                "No {} found, skipping dependency installation",
                requirements_file
            );
            return Ok(false);
        }

        let python = self.python().display().to_string();

        run_checked(
            runner,
            &ProcessSpec::new(python.as_str())
                .args(["-m", "pip", "install", "--upgrade", "pip"])
                .current_dir(source_dir),
        )
        .await?;

        run_checked(
            runner,
            &ProcessSpec::new(python.as_str())
                .args(["-m", "pip", "install", "-r", requirements_file])
                .current_dir(source_dir),
        )
        .await?;

        info!("Installed dependencies from {}", requirements_file);
        Ok(true)
    }
}

/// Create `<source_dir>/<venv_dir>` with the given interpreter
pub async fn create_virtualenv(
    runner: &dyn ProcessRunner,
    interpreter: &Interpreter,
    source_dir: &Path,
    venv_dir: &str,
) -> PackagerResult<VirtualEnv> {
    run_checked(
        runner,
        &ProcessSpec::new(interpreter.program.as_str())
            .args(["-m", "venv", venv_dir])
            .current_dir(source_dir),
    )
    .await?;

    info!("Created virtual environment at {}", venv_dir);
    Ok(VirtualEnv::new(source_dir.join(venv_dir)))
}
