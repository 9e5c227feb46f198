//! Archive for files replaced or removed by sync.
//!
//! Before a remote revision overwrites or deletes a local file, the old
//! content is moved to `<root>/.lvlt/archive/<path>.<unix-ms>`. What happens
//! next depends on the [`ArchiveMode`]:
//!
//! - `trash`: versions older than the trash TTL are purged on full rescans
//! - `timestamp`: only the newest N versions of each path are kept
//! - `none`: nothing is kept, the old file is deleted

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::index::{resolve_path, SYSTEM_DIR};

pub const DEFAULT_TRASH_TTL_DAYS: u32 = 30;
pub const DEFAULT_TIMESTAMP_COUNT: u32 = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveMode {
    None,
    #[default]
    Trash,
    Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchivePolicy {
    pub mode: ArchiveMode,
    pub trash_ttl: Duration,
    /// Versions kept per path in timestamp mode; 0 keeps all.
    pub timestamp_count: usize,
}

impl Default for ArchivePolicy {
    fn default() -> Self {
        Self {
            mode: ArchiveMode::Trash,
            trash_ttl: Duration::from_secs(u64::from(DEFAULT_TRASH_TTL_DAYS) * 24 * 60 * 60),
            timestamp_count: DEFAULT_TIMESTAMP_COUNT as usize,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Archive {
    root: PathBuf,
    archive_dir: PathBuf,
    policy: ArchivePolicy,
}

impl Archive {
    pub fn new(root: &Path, policy: ArchivePolicy) -> Self {
        Self {
            root: root.to_path_buf(),
            archive_dir: root.join(SYSTEM_DIR).join("archive"),
            policy,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.archive_dir
    }

    pub fn policy(&self) -> &ArchivePolicy {
        &self.policy
    }

    /// Move the current file at `rel_path` out of the way. Without an archive
    /// the file is removed instead. Missing files are not an error.
    pub fn archive_file(&self, rel_path: &str, at: DateTime<Utc>) -> Result<Option<PathBuf>> {
        let source = resolve_path(&self.root, rel_path)?;
        if !source.is_file() {
            return Ok(None);
        }

        if self.policy.mode == ArchiveMode::None {
            fs::remove_file(&source)?;
            return Ok(None);
        }

        let dest = resolve_path(&self.archive_dir, &format!("{}.{}", rel_path, at.timestamp_millis()))?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&source, &dest)?;
        debug!("Archived {} to {}", rel_path, dest.display());

        if self.policy.mode == ArchiveMode::Timestamp && self.policy.timestamp_count > 0 {
            let versions = self.versions_of(rel_path)?;
            let excess = versions.len().saturating_sub(self.policy.timestamp_count);
            for old in &versions[..excess] {
                if let Err(e) = fs::remove_file(old) {
                    warn!("Failed to drop old version {}: {}", old.display(), e);
                }
            }
        }
        Ok(Some(dest))
    }

    /// All archived versions, oldest first.
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        if self.archive_dir.exists() {
            collect_files(&self.archive_dir, &mut found)?;
        }
        found.sort_by_key(|p| archived_at(p).unwrap_or(0));
        Ok(found)
    }

    /// Archived versions of one path, oldest first.
    pub fn versions_of(&self, rel_path: &str) -> Result<Vec<PathBuf>> {
        let original = resolve_path(&self.archive_dir, rel_path)?;
        let (Some(dir), Some(name)) = (original.parent(), original.file_name().and_then(|n| n.to_str())) else {
            return Ok(Vec::new());
        };
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let prefix = format!("{}.", name);
        let mut versions: Vec<(i64, PathBuf)> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let stamp = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(&prefix))
                .and_then(|rest| rest.parse::<i64>().ok());
            if let (Some(stamp), true) = (stamp, path.is_file()) {
                versions.push((stamp, path));
            }
        }
        versions.sort();
        Ok(versions.into_iter().map(|(_, path)| path).collect())
    }

    /// Delete trash entries older than the TTL. Other modes keep what they hold.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        if self.policy.mode != ArchiveMode::Trash {
            return Ok(0);
        }
        let cutoff = now.timestamp_millis() - self.policy.trash_ttl.as_millis() as i64;
        let mut removed = 0;
        for path in self.list()? {
            match archived_at(&path) {
                Some(ts) if ts < cutoff => {
                    if let Err(e) = fs::remove_file(&path) {
                        warn!("Failed to purge {}: {}", path.display(), e);
                    } else {
                        removed += 1;
                    }
                }
                _ => {}
            }
        }
        if removed > 0 {
            info!("Purged {} expired archive entries", removed);
        }
        Ok(removed)
    }
}

fn archived_at(path: &Path) -> Option<i64> {
    path.extension()?.to_str()?.parse().ok()
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}
