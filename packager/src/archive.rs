//! Zip packaging of the source tree.
//!
//! The archive mirrors `zip -r release.zip ./* -x 'venv/*'`: top-level hidden
//! entries are left out the way a shell `./*` glob leaves them out, the
//! virtual environment is never shipped, and the archive never contains itself.

use crate::{PackagerError, PackagerResult};
use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// What to put into an archive and where to write it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSpec {
    pub source_dir: PathBuf,
    pub output_path: PathBuf,
    /// Top-level directory names left out entirely
    pub exclude_dirs: Vec<String>,
    /// Glob patterns matched against `/`-separated paths relative to the source root
    pub exclude_globs: Vec<String>,
    pub include_hidden_top_level: bool,
}

impl ArchiveSpec {
    pub fn new(source_dir: impl Into<PathBuf>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
            output_path: output_path.into(),
            exclude_dirs: vec!["venv".to_string()],
            exclude_globs: vec![],
            include_hidden_top_level: false,
        }
    }

    pub fn with_exclude_dirs(mut self, dirs: Vec<String>) -> Self {
        self.exclude_dirs = dirs;
        self
    }

    pub fn with_exclude_globs(mut self, globs: Vec<String>) -> Self {
        self.exclude_globs = globs;
        self
    }

    pub fn with_hidden_top_level(mut self, include: bool) -> Self {
        self.include_hidden_top_level = include;
        self
    }
}

/// Result of writing an archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveSummary {
    pub path: PathBuf,
    pub file_count: usize,
    pub total_bytes: u64,
    /// File entry names in archive order
    pub entries: Vec<String>,
}

struct EntryFilter<'a> {
    spec: &'a ArchiveSpec,
    source: &'a Path,
    output: &'a Path,
    patterns: Vec<Pattern>,
}

impl EntryFilter<'_> {
    fn excluded(&self, entry: &DirEntry) -> bool {
        if entry.depth() == 0 {
            return false;
        }

        if entry.path() == self.output {
            return true;
        }

        let name = entry.file_name().to_string_lossy();
        if entry.depth() == 1 {
            if !self.spec.include_hidden_top_level && name.starts_with('.') {
                return true;
            }
            if self.spec.exclude_dirs.iter().any(|dir| *dir == name) {
                return true;
            }
        }

        let relative = relative_name(self.source, entry.path());
        self.patterns.iter().any(|p| p.matches(&relative))
    }
}

fn relative_name(source: &Path, path: &Path) -> String {
    path.strip_prefix(source)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(unix)]
fn permissions_of(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permissions_of(metadata: &fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

fn entry_options(mode: u32) -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(mode)
}

/// Write the archive described by `spec`
pub fn create_archive(spec: &ArchiveSpec) -> PackagerResult<ArchiveSummary> {
    create_archive_until(spec, || false)
}

/// Like [`create_archive`], but checks `stop` before each entry.
///
/// Once `stop` returns true the partial archive is removed and
/// [`PackagerError::Cancelled`] is returned.
pub fn create_archive_until<F>(spec: &ArchiveSpec, stop: F) -> PackagerResult<ArchiveSummary>
where
    F: Fn() -> bool,
{
    if !spec.source_dir.is_dir() {
        return Err(PackagerError::SourceNotFound {
            path: spec.source_dir.display().to_string(),
        });
    }

    let patterns = spec
        .exclude_globs
        .iter()
        .map(|g| Pattern::new(g))
        .collect::<Result<Vec<_>, _>>()?;

    if let Some(parent) = spec.output_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    // Created up front so that the walk can recognise (and skip) it
    let file = File::create(&spec.output_path)?;
    let output = fs::canonicalize(&spec.output_path)?;
    let source = fs::canonicalize(&spec.source_dir)?;

    let filter = EntryFilter {
        spec,
        source: &source,
        output: &output,
        patterns,
    };

    let mut writer = ZipWriter::new(file);

    let mut entries = Vec::new();
    let mut total_bytes = 0u64;

    let walker = WalkDir::new(&source)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !filter.excluded(e));

    for entry in walker {
        if stop() {
            drop(writer);
            if let Err(e) = fs::remove_file(&spec.output_path) {
                warn!("Could not remove partial archive: {}", e);
            }
            return Err(PackagerError::Cancelled);
        }

        let entry = entry?;
        let name = relative_name(&source, entry.path());
        // Follows symlinks so linked files are shipped by content
        let metadata = fs::metadata(entry.path())?;
        let options = entry_options(permissions_of(&metadata));

        if metadata.is_dir() {
            if entry.path_is_symlink() {
                warn!("Skipping symlinked directory {}", name);
                continue;
            }
            writer.add_directory(format!("{}/", name), options)?;
            continue;
        }

        writer.start_file(name.as_str(), options)?;
        let mut source_file = File::open(entry.path())?;
        total_bytes += io::copy(&mut source_file, &mut writer)?;
        debug!("Added {}", name);
        entries.push(name);
    }

    writer.finish()?;

    info!(
        "Archived {} files from {} into {}",
        entries.len(),
        spec.source_dir.display(),
        spec.output_path.display()
    );

    Ok(ArchiveSummary {
        path: spec.output_path.clone(),
        file_count: entries.len(),
        total_bytes,
        entries,
    })
}

/// Entry names of an existing archive, directories included, in archive order
pub fn list_archive(path: &Path) -> PackagerResult<Vec<String>> {
    let mut archive = ZipArchive::new(File::open(path)?)?;
    let mut names = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        names.push(archive.by_index(index)?.name().to_string());
    }
    Ok(names)
}
