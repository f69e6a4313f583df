//! Startup-command file generation.
//!
//! The hosting platform reads this file after a deployment to learn how to
//! launch the application: a gunicorn process manager running uvicorn workers.

use crate::{PackagerError, PackagerResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Process-manager invocation written into the startup file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartupCommand {
    pub process_manager: String,
    pub workers: u32,
    pub worker_class: String,
    pub timeout_secs: u64,
    pub graceful_timeout_secs: u64,
    /// `host:port` the workers listen on
    pub bind: String,
    /// `module:attribute` of the ASGI application
    pub entry_point: String,
}

impl Default for StartupCommand {
    fn default() -> Self {
        Self {
            process_manager: "gunicorn".to_string(),
            workers: 4,
            worker_class: "uvicorn.workers.UvicornWorker".to_string(),
            timeout_secs: 600,
            graceful_timeout_secs: 600,
            bind: "0.0.0.0:8000".to_string(),
            entry_point: "main:app".to_string(),
        }
    }
}

impl StartupCommand {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bind(mut self, bind: impl Into<String>) -> Self {
        self.bind = bind.into();
        self
    }

    pub fn with_workers(mut self, workers: u32) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_entry_point(mut self, entry_point: impl Into<String>) -> Self {
        self.entry_point = entry_point.into();
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.process_manager.trim().is_empty() {
            return Err("Process manager cannot be empty".to_string());
        }

        if self.worker_class.trim().is_empty() {
            return Err("Worker class cannot be empty".to_string());
        }

        if self.workers == 0 {
            return Err("Workers must be greater than 0".to_string());
        }

        if self.timeout_secs == 0 || self.graceful_timeout_secs == 0 {
            return Err("Timeouts must be greater than 0".to_string());
        }

        match self.bind.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => match port.parse::<u16>() {
                Ok(p) if p > 0 => {}
                _ => return Err(format!("Invalid port in bind address '{}'", self.bind)),
            },
            _ => return Err(format!("Bind address '{}' must be host:port", self.bind)),
        }

        match self.entry_point.split_once(':') {
            Some((module, attr)) if !module.is_empty() && !attr.is_empty() => Ok(()),
            _ => Err(format!(
                "Entry point '{}' must be module:attribute",
                self.entry_point
            )),
        }
    }

    /// The single command line the platform executes
    pub fn render(&self) -> String {
        format!(
            "{} --workers {} --worker-class {} --timeout {} --graceful-timeout {} --bind {} {}",
            self.process_manager,
            self.workers,
            self.worker_class,
            self.timeout_secs,
            self.graceful_timeout_secs,
            self.bind,
            self.entry_point
        )
    }

    /// Write the rendered command to `dir/file_name`, replacing any previous file
    pub fn write_to(&self, dir: &Path, file_name: &str) -> PackagerResult<PathBuf> {
        self.validate().map_err(PackagerError::InvalidConfig)?;

        let path = dir.join(file_name);
        std::fs::write(&path, format!("{}\n", self.render()))?;

        info!("Wrote startup command to {}", path.display());
        Ok(path)
    }
}
