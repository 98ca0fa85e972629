//! Storage quota gate
//!
//! Any write that enlarges a user's working directory consults the gate
//! first. Denial is a soft failure reported to the caller.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use super::paths::UserPaths;
use crate::error::Result;

/// Outcome of a quota check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaDecision {
    Ok,
    Denied { reason: String },
}

impl QuotaDecision {
    pub fn is_ok(&self) -> bool {
        matches!(self, QuotaDecision::Ok)
    }
}

/// Per-user storage usage report
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StorageReport {
    pub used_bytes: u64,
    pub quota_bytes: u64,
}

/// Admits or denies writes based on per-user storage limits
#[async_trait]
pub trait QuotaGate: Send + Sync {
    async fn check(&self, user_id: i64, additional_bytes: u64) -> Result<QuotaDecision>;

    async fn report(&self, user_id: i64) -> Result<StorageReport>;
}

/// Quota gate backed by sizing the user directory on disk
pub struct DiskQuotaGate {
    paths: UserPaths,
    default_quota_bytes: u64,
    overrides: RwLock<HashMap<i64, u64>>,
}

impl DiskQuotaGate {
    pub fn new(paths: UserPaths, default_quota_bytes: u64) -> Self {
        Self {
            paths,
            default_quota_bytes,
            overrides: RwLock::new(HashMap::new()),
        }
    }

    /// Set a per-user quota override (from the user registry)
    pub fn set_quota(&self, user_id: i64, quota_bytes: u64) {
        self.overrides.write().unwrap().insert(user_id, quota_bytes);
    }

    fn quota_for(&self, user_id: i64) -> u64 {
        self.overrides
            .read()
            .unwrap()
            .get(&user_id)
            .copied()
            .unwrap_or(self.default_quota_bytes)
    }

    fn directory_size(path: &Path) -> u64 {
        if !path.exists() {
            return 0;
        }
        WalkDir::new(path)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| entry.metadata().ok())
            .map(|meta| meta.len())
            .sum()
    }
}

#[async_trait]
impl QuotaGate for DiskQuotaGate {
    async fn check(&self, user_id: i64, additional_bytes: u64) -> Result<QuotaDecision> {
        let quota = self.quota_for(user_id);
        let user_dir = self.paths.user_dir(user_id);
        let used = tokio::task::spawn_blocking(move || Self::directory_size(&user_dir))
            .await
            .unwrap_or(0);

        if used + additional_bytes <= quota {
            Ok(QuotaDecision::Ok)
        } else {
            Ok(QuotaDecision::Denied {
                reason: format!(
                    "write of {} bytes exceeds quota ({} of {} bytes used)",
                    additional_bytes, used, quota
                ),
            })
        }
    }

    async fn report(&self, user_id: i64) -> Result<StorageReport> {
        let user_dir = self.paths.user_dir(user_id);
        let used = tokio::task::spawn_blocking(move || Self::directory_size(&user_dir))
            .await
            .unwrap_or(0);
        Ok(StorageReport {
            used_bytes: used,
            quota_bytes: self.quota_for(user_id),
        })
    }
}
