//! Local file system storage adapter
//!
//! Lays state out as JSON files under a base directory:
//! `{base}/{network}/network.json`, `{base}/{network}/groups/{group}.json`,
//! `{base}/{network}/content/{group}/{contact}.json`. Writes are
//! serialized through one async lock so a same-key read-merge-write
//! cannot interleave with another writer.

use std::path::PathBuf;

use serde_json::Value;
use tokio::fs as tokio_fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{StorageAdapter, StorageConfig, StorageError};
use crate::model::{GroupState, NetworkState};

/// A storage adapter backed by the local file system.
pub struct LocalStorage {
    base_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl LocalStorage {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            base_dir: config.base_dir,
            write_lock: Mutex::new(()),
        }
    }

    fn network_path(&self, network_id: &str) -> PathBuf {
        self.base_dir.join(network_id).join("network.json")
    }

    fn group_path(&self, network_id: &str, group_id: &str) -> PathBuf {
        self.base_dir
            .join(network_id)
            .join("groups")
            .join(format!("{}.json", group_id))
    }

    fn content_path(&self, network_id: &str, group_id: &str, contact_id: &str) -> PathBuf {
        self.base_dir
            .join(network_id)
            .join("content")
            .join(group_id)
            .join(format!("{}.json", contact_id))
    }

    async fn write_json(&self, path: PathBuf, data: Vec<u8>) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        if let Some(parent) = path.parent() {
            tokio_fs::create_dir_all(parent).await?;
        }
        let mut file = tokio_fs::File::create(&path).await?;
        file.write_all(&data).await?;
        Ok(())
    }

    async fn read_json(&self, path: PathBuf) -> Result<Option<Vec<u8>>, StorageError> {
        match tokio_fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait::async_trait]
impl StorageAdapter for LocalStorage {
    async fn initialize(&self) -> Result<(), StorageError> {
        tokio_fs::create_dir_all(&self.base_dir).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        // Nothing held open between calls.
        Ok(())
    }

    async fn save_network_state(
        &self,
        network_id: &str,
        state: &NetworkState,
    ) -> Result<(), StorageError> {
        let data = serde_json::to_vec_pretty(state)?;
        self.write_json(self.network_path(network_id), data).await
    }

    async fn load_network_state(
        &self,
        network_id: &str,
    ) -> Result<Option<NetworkState>, StorageError> {
        match self.read_json(self.network_path(network_id)).await? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    async fn save_group_state(
        &self,
        network_id: &str,
        group_id: &str,
        state: &GroupState,
    ) -> Result<(), StorageError> {
        let data = serde_json::to_vec_pretty(state)?;
        self.write_json(self.group_path(network_id, group_id), data)
            .await
    }

    async fn load_group_state(
        &self,
        network_id: &str,
        group_id: &str,
    ) -> Result<Option<GroupState>, StorageError> {
        match self.read_json(self.group_path(network_id, group_id)).await? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    async fn save_contact_content(
        &self,
        network_id: &str,
        group_id: &str,
        contact_id: &str,
        content: &Value,
    ) -> Result<(), StorageError> {
        let data = serde_json::to_vec(content)?;
        self.write_json(self.content_path(network_id, group_id, contact_id), data)
            .await
    }

    async fn load_contact_content(
        &self,
        network_id: &str,
        group_id: &str,
        contact_id: &str,
    ) -> Result<Option<Value>, StorageError> {
        match self
            .read_json(self.content_path(network_id, group_id, contact_id))
            .await?
        {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }
}
