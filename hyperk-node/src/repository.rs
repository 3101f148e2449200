//! Instance and user records.
//!
//! Records live in memory and are optionally snapshotted to a JSON file on
//! every mutation, so they survive a daemon restart:
//! - Snapshot is written to a temporary file and renamed into place
//! - A missing file on startup is an empty store

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};

/// Maximum length of an instance display name.
pub const MAX_NAME_LEN: usize = 64;

/// A user allowed to own instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub realname: String,
    #[serde(default)]
    pub is_admin: bool,
}

/// A tracked instance. `id` is the hypervisor domain UUID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: Uuid,
    pub name: String,
    pub user_id: i64,
}

/// Persistence boundary used by the lifecycle controller.
#[async_trait]
pub trait InstanceRepository: Send + Sync {
    async fn get_instance_by_id(&self, id: Uuid) -> Result<Instance>;

    async fn get_user_by_id(&self, id: i64) -> Result<User>;

    async fn get_user_by_username(&self, username: &str) -> Result<User>;

    /// Insert a user. Usernames are unique.
    async fn create_user(&self, user: User) -> Result<User>;

    /// Insert an instance owned by an existing user.
    async fn create_instance(&self, id: Uuid, name: &str, owner: i64) -> Result<Instance>;

    async fn update_instance_name(&self, id: Uuid, name: &str) -> Result<Instance>;

    async fn list_instances_for_user(&self, user_id: i64) -> Result<Vec<Instance>>;

    async fn list_all_instances(&self) -> Result<Vec<Instance>>;
}

/// Check a display name against the record constraints.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(OrchestratorError::InvalidRequest("Name can't be empty".to_string()));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(OrchestratorError::InvalidRequest(
            format!("Name can't be longer than {} characters", MAX_NAME_LEN)
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Snapshot {
    users: BTreeMap<i64, User>,
    instances: BTreeMap<Uuid, Instance>,
}

/// In-memory repository with optional JSON persistence.
pub struct MemoryRepository {
    state: RwLock<Snapshot>,
    persistence_path: Option<PathBuf>,
}

impl MemoryRepository {
    /// Create an empty, memory-only repository.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(Snapshot::default()),
            persistence_path: None,
        }
    }

    /// Open a repository backed by `path`, loading it if it exists.
    pub fn with_persistence(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let snapshot = Self::load_from_disk(&path)?;

        Ok(Self {
            state: RwLock::new(snapshot),
            persistence_path: Some(path),
        })
    }

    fn load_from_disk(path: &Path) -> anyhow::Result<Snapshot> {
        if !path.exists() {
            debug!(path = %path.display(), "No state file yet, starting empty");
            return Ok(Snapshot::default());
        }

        let json = std::fs::read_to_string(path)?;
        let snapshot: Snapshot = serde_json::from_str(&json)
            .map_err(|e| anyhow::anyhow!("Corrupt state file {}: {}", path.display(), e))?;

        info!(
            path = %path.display(),
            users = snapshot.users.len(),
            instances = snapshot.instances.len(),
            "Records loaded from disk"
        );
        Ok(snapshot)
    }

    /// Write the snapshot (if persistence is enabled).
    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let path = match &self.persistence_path {
            Some(p) => p,
            None => return Ok(()),
        };

        let json = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| OrchestratorError::Internal(format!("Failed to encode records: {}", e)))?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await
                .map_err(|e| OrchestratorError::Internal(format!("Failed to create state dir: {}", e)))?;
        }

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await
            .map_err(|e| OrchestratorError::Internal(format!("Failed to write state file: {}", e)))?;
        tokio::fs::rename(&tmp, path).await
            .map_err(|e| OrchestratorError::Internal(format!("Failed to replace state file: {}", e)))?;

        debug!(path = %path.display(), "Records saved to disk");
        Ok(())
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstanceRepository for MemoryRepository {
    async fn get_instance_by_id(&self, id: Uuid) -> Result<Instance> {
        self.state.read().await
            .instances.get(&id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("instance {}", id)))
    }

    async fn get_user_by_id(&self, id: i64) -> Result<User> {
        self.state.read().await
            .users.get(&id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("user {}", id)))
    }

    async fn get_user_by_username(&self, username: &str) -> Result<User> {
        self.state.read().await
            .users.values()
            .find(|u| u.username == username)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("user {}", username)))
    }

    async fn create_user(&self, user: User) -> Result<User> {
        let mut state = self.state.write().await;

        if state.users.contains_key(&user.id) {
            return Err(OrchestratorError::InvalidRequest(format!("user id {} already exists", user.id)));
        }
        if state.users.values().any(|u| u.username == user.username) {
            return Err(OrchestratorError::InvalidRequest(
                format!("username {} already exists", user.username)
            ));
        }

        let mut next = state.clone();
        next.users.insert(user.id, user.clone());
        self.save(&next).await?;
        *state = next;
        Ok(user)
    }

    async fn create_instance(&self, id: Uuid, name: &str, owner: i64) -> Result<Instance> {
        validate_name(name)?;
        let mut state = self.state.write().await;

        if !state.users.contains_key(&owner) {
            return Err(OrchestratorError::NotFound(format!("user {}", owner)));
        }
        if state.instances.contains_key(&id) {
            return Err(OrchestratorError::Internal(format!("instance {} already exists", id)));
        }

        let instance = Instance { id, name: name.to_string(), user_id: owner };
        let mut next = state.clone();
        next.instances.insert(id, instance.clone());
        self.save(&next).await?;
        *state = next;
        Ok(instance)
    }

    async fn update_instance_name(&self, id: Uuid, name: &str) -> Result<Instance> {
        validate_name(name)?;
        let mut state = self.state.write().await;

        let mut next = state.clone();
        let instance = next.instances.get_mut(&id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("instance {}", id)))?;
        instance.name = name.to_string();
        let updated = instance.clone();

        self.save(&next).await?;
        *state = next;
        Ok(updated)
    }

    async fn list_instances_for_user(&self, user_id: i64) -> Result<Vec<Instance>> {
        Ok(self.state.read().await
            .instances.values()
            .filter(|i| i.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn list_all_instances(&self) -> Result<Vec<Instance>> {
        Ok(self.state.read().await.instances.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> User {
        User { id: 1, username: "alice".into(), realname: "Alice".into(), is_admin: false }
    }

    #[tokio::test]
    async fn test_instance_crud() {
        let repo = MemoryRepository::new();
        repo.create_user(alice()).await.unwrap();

        let id = Uuid::new_v4();
        let created = repo.create_instance(id, "web", 1).await.unwrap();
        assert_eq!(repo.get_instance_by_id(id).await.unwrap(), created);

        let renamed = repo.update_instance_name(id, "web-2").await.unwrap();
        assert_eq!(renamed.name, "web-2");
        assert_eq!(repo.list_instances_for_user(1).await.unwrap(), vec![renamed]);
        assert!(repo.list_instances_for_user(2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_not_found() {
        let repo = MemoryRepository::new();
        assert!(matches!(
            repo.get_instance_by_id(Uuid::new_v4()).await,
            Err(OrchestratorError::NotFound(_))
        ));
        assert!(matches!(
            repo.update_instance_name(Uuid::new_v4(), "x").await,
            Err(OrchestratorError::NotFound(_))
        ));
        assert!(matches!(
            repo.create_instance(Uuid::new_v4(), "x", 42).await,
            Err(OrchestratorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_constraints() {
        let repo = MemoryRepository::new();
        repo.create_user(alice()).await.unwrap();

        let dup = User { id: 2, ..alice() };
        assert!(repo.create_user(dup).await.is_err());

        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert!(matches!(
            repo.create_instance(Uuid::new_v4(), &long, 1).await,
            Err(OrchestratorError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("records.json");
        let id = Uuid::new_v4();

        {
            let repo = MemoryRepository::with_persistence(&path).unwrap();
            repo.create_user(alice()).await.unwrap();
            repo.create_instance(id, "db", 1).await.unwrap();
        }

        let reopened = MemoryRepository::with_persistence(&path).unwrap();
        assert_eq!(reopened.get_instance_by_id(id).await.unwrap().name, "db");
        assert_eq!(reopened.get_user_by_username("alice").await.unwrap().id, 1);
    }

    #[tokio::test]
    async fn test_failed_save_leaves_records_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");
        let repo = MemoryRepository::with_persistence(&path).unwrap();
        repo.create_user(alice()).await.unwrap();
        let id = Uuid::new_v4();
        repo.create_instance(id, "web", 1).await.unwrap();

        // A directory in place of the state file makes the rename fail
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        let other = Uuid::new_v4();
        assert!(repo.create_instance(other, "db", 1).await.is_err());
        assert!(matches!(
            repo.get_instance_by_id(other).await,
            Err(OrchestratorError::NotFound(_))
        ));

        assert!(repo.update_instance_name(id, "renamed").await.is_err());
        assert_eq!(repo.get_instance_by_id(id).await.unwrap().name, "web");

        let bob = User { id: 2, username: "bob".into(), realname: String::new(), is_admin: false };
        assert!(repo.create_user(bob).await.is_err());
        assert!(repo.get_user_by_id(2).await.is_err());
        assert_eq!(repo.list_all_instances().await.unwrap().len(), 1);
    }

    #[test]
    fn test_corrupt_state_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(MemoryRepository::with_persistence(&path).is_err());
    }
}
