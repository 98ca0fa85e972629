//! File tracker
//!
//! Snapshots the user's working directory before a task runs, diffs it
//! afterwards, and delivers the new or modified files. Scratch output is
//! filtered out by a fixed exclusion set and the `temp` subdirectory is
//! emptied after every diff.

use std::collections::HashMap;
use std::fs::File;
use std::io::copy;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::adapter::Outbox;
use crate::error::{Error, Result};

/// Directory names never tracked
const EXCLUDED_DIRS: &[&str] = &[
    "temp",
    "tmp",
    "working",
    "cache",
    "drafts",
    "__pycache__",
    ".git",
    "node_modules",
    ".venv",
    ".cache",
];

/// File extensions never tracked
const EXCLUDED_EXTENSIONS: &[&str] = &["tmp", "log", "pyc", "pyo", "swp", "swo"];

/// Stem suffixes marking work-in-progress files (`report_draft.md` etc.)
const EXCLUDED_STEM_SUFFIXES: &[&str] = &["_draft", "_temp", "_tmp", "_wip", "_intermediate"];

/// Snapshot entry: modification time and size
type Fingerprint = (SystemTime, u64);

/// Per-task snapshot/diff scope over a working directory
pub struct FileTrackerScope {
    root: PathBuf,
    baseline: HashMap<PathBuf, Fingerprint>,
}

impl FileTrackerScope {
    /// Snapshot every regular file under `root`
    pub fn start(root: impl AsRef<Path>) -> Result<Self> {
        let root = root
            .as_ref()
            .canonicalize()
            .map_err(|_| Error::PathEscape(root.as_ref().to_path_buf()))?;
        let baseline = scan(&root);
        debug!(root = %root.display(), files = baseline.len(), "file tracker started");
        Ok(Self { root, baseline })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Rescan and report every path that is new or whose (mtime, size)
    /// changed since `start`, newest first. Idempotent while the directory
    /// is idle.
    pub fn diff(&self) -> Vec<PathBuf> {
        let current = scan(&self.root);
        let mut changed: Vec<(PathBuf, SystemTime)> = Vec::new();

        for (path, fingerprint) in &current {
            if !path.starts_with(&self.root) {
                warn!(path = %path.display(), "dropping path outside scope root");
                continue;
            }
            match self.baseline.get(path) {
                None => changed.push((path.clone(), fingerprint.0)),
                Some(baseline) if baseline != fingerprint => {
                    changed.push((path.clone(), fingerprint.0))
                }
                Some(_) => {}
            }
        }

        changed.sort_by(|a, b| b.1.cmp(&a.1));
        let paths: Vec<PathBuf> = changed.into_iter().map(|(p, _)| p).collect();
        info!(root = %self.root.display(), count = paths.len(), "file tracker diff");
        paths
    }

    /// Empty the `temp` subdirectory under the scope root
    pub fn cleanup_temp(&self) {
        let temp = self.root.join("temp");
        if !temp.is_dir() {
            return;
        }
        let entries = match std::fs::read_dir(&temp) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("failed to read temp dir: {}", e);
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            if let Err(e) = result {
                warn!(path = %path.display(), "temp cleanup failed: {}", e);
            }
        }
        debug!(root = %self.root.display(), "temp directory cleaned");
    }
}

fn scan(root: &Path) -> HashMap<PathBuf, Fingerprint> {
    let mut files = HashMap::new();
    let walker = WalkDir::new(root).follow_links(false).into_iter();

    for entry in walker.filter_entry(|e| !is_excluded_dir(e)) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!("scan error: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if is_excluded_file(entry.path()) {
            continue;
        }
        if let Ok(meta) = entry.metadata() {
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            files.insert(entry.path().to_path_buf(), (mtime, meta.len()));
        }
    }
    files
}

fn is_excluded_dir(entry: &walkdir::DirEntry) -> bool {
    if !entry.file_type().is_dir() {
        return false;
    }
    // Never filter out the walk root itself
    if entry.depth() == 0 {
        return false;
    }
    entry
        .file_name()
        .to_str()
        .map(|name| EXCLUDED_DIRS.contains(&name))
        .unwrap_or(false)
}

fn is_excluded_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return true;
    };
    if name.starts_with('.') || name.starts_with('~') {
        return true;
    }
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        if EXCLUDED_EXTENSIONS.contains(&ext.to_lowercase().as_str()) {
            return true;
        }
        // Pattern exclusions only apply to files with an extension
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            let stem = stem.to_lowercase();
            if EXCLUDED_STEM_SUFFIXES.iter().any(|s| stem.ends_with(s)) {
                return true;
            }
            if stem.contains("_step") {
                return true;
            }
        }
    }
    false
}

/// Deliver tracked files through the user's outbox: up to
/// `inline_threshold` files individually, more as one zip archive that is
/// deleted after sending. Returns the relative paths reported to the user.
pub async fn deliver_tracked_files(
    outbox: &Outbox,
    user_id: i64,
    root: &Path,
    files: &[PathBuf],
    inline_threshold: usize,
) -> Result<Vec<String>> {
    let existing: Vec<&PathBuf> = files.iter().filter(|f| f.exists()).collect();
    if existing.is_empty() {
        return Ok(Vec::new());
    }

    let relative: Vec<String> = existing
        .iter()
        .map(|f| {
            f.strip_prefix(root)
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| f.display().to_string())
        })
        .collect();

    if existing.len() <= inline_threshold {
        for (file, rel) in existing.iter().zip(&relative) {
            outbox
                .send_file(user_id, (*file).clone(), Some(rel.clone()))
                .await;
        }
    } else {
        let archive = build_archive(root, &existing)?;
        let caption = format!("{} files produced by this task", existing.len());
        outbox
            .send_transient_file(user_id, archive, Some(caption))
            .await;
    }

    Ok(relative)
}

fn build_archive(root: &Path, files: &[&PathBuf]) -> Result<PathBuf> {
    let archive_path = std::env::temp_dir().join(format!(
        "task_files_{}.zip",
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    ));

    let file = File::create(&archive_path)?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for path in files {
        let name = path
            .strip_prefix(root)
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| {
                path.file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default()
            });
        writer
            .start_file(name, options)
            .map_err(|e| Error::Persistence(format!("archive entry failed: {}", e)))?;
        let mut src = File::open(path)?;
        copy(&mut src, &mut writer)?;
    }

    writer
        .finish()
        .map_err(|e| Error::Persistence(format!("archive finish failed: {}", e)))?;
    info!(archive = %archive_path.display(), count = files.len(), "built delivery archive");
    Ok(archive_path)
}
