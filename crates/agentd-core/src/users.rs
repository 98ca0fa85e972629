//! User registry
//!
//! Users are created on first authenticated contact and never destroyed.
//! The registry is the single writer of `users.json`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{Error, Result};
use crate::store::{load_json, save_json, PathLocks, UserPaths};

/// A registered user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub display_name: String,
    pub quota_bytes: u64,
    pub enabled: bool,
    /// IANA timezone identifier for wall-clock schedule evaluation
    #[serde(default = "default_timezone")]
    pub timezone: String,
    pub created_at: DateTime<Utc>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// Registry of all users, persisted in `users.json`
pub struct UserRegistry {
    paths: UserPaths,
    locks: Arc<PathLocks>,
    default_quota_bytes: u64,
    cache: RwLock<HashMap<i64, User>>,
}

impl UserRegistry {
    pub fn new(paths: UserPaths, locks: Arc<PathLocks>, default_quota_bytes: u64) -> Result<Self> {
        let users: HashMap<i64, User> = load_json(paths.users_file())?.unwrap_or_default();
        Ok(Self {
            paths,
            locks,
            default_quota_bytes,
            cache: RwLock::new(users),
        })
    }

    /// Look up a user; returns `None` for unknown ids
    pub async fn get(&self, user_id: i64) -> Option<User> {
        self.cache.read().await.get(&user_id).cloned()
    }

    /// Look up a user, failing if unknown or disabled
    pub async fn get_enabled(&self, user_id: i64) -> Result<User> {
        let user = self
            .get(user_id)
            .await
            .ok_or_else(|| Error::Validation(format!("unknown user {}", user_id)))?;
        if !user.enabled {
            return Err(Error::UserDisabled(user_id));
        }
        Ok(user)
    }

    /// Get an existing user or register a new one, initializing their
    /// working directory
    pub async fn get_or_create(&self, user_id: i64, display_name: &str) -> Result<User> {
        if let Some(user) = self.get(user_id).await {
            return Ok(user);
        }

        let user = User {
            id: user_id,
            display_name: display_name.to_string(),
            quota_bytes: self.default_quota_bytes,
            enabled: true,
            timezone: default_timezone(),
            created_at: Utc::now(),
        };

        self.paths.ensure_user_layout(user_id)?;
        {
            let mut cache = self.cache.write().await;
            cache.insert(user_id, user.clone());
            self.persist(&cache).await?;
        }
        info!(user_id, display_name, "registered new user");
        Ok(user)
    }

    pub async fn set_enabled(&self, user_id: i64, enabled: bool) -> Result<()> {
        self.update(user_id, |user| user.enabled = enabled).await
    }

    pub async fn set_timezone(&self, user_id: i64, timezone: &str) -> Result<()> {
        let timezone = timezone.to_string();
        self.update(user_id, move |user| user.timezone = timezone).await
    }

    pub async fn set_quota(&self, user_id: i64, quota_bytes: u64) -> Result<()> {
        self.update(user_id, move |user| user.quota_bytes = quota_bytes)
            .await
    }

    pub async fn all(&self) -> Vec<User> {
        let mut users: Vec<User> = self.cache.read().await.values().cloned().collect();
        users.sort_by_key(|u| u.id);
        users
    }

    async fn update(&self, user_id: i64, mutate: impl FnOnce(&mut User)) -> Result<()> {
        let mut cache = self.cache.write().await;
        let user = cache
            .get_mut(&user_id)
            .ok_or_else(|| Error::Validation(format!("unknown user {}", user_id)))?;
        mutate(user);
        self.persist(&cache).await
    }

    async fn persist(&self, users: &HashMap<i64, User>) -> Result<()> {
        let path = self.paths.users_file();
        let _guard = self.locks.lock(&path).await;
        save_json(&path, users)
    }
}
