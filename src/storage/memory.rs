//! In-memory reference storage adapter
//!
//! The whole store sits behind one async `RwLock`, which makes every
//! same-key save/load pair atomic. Useful for tests and as the
//! reference behavior other adapters are checked against.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::RwLock;

use super::{StorageAdapter, StorageError};
use crate::model::{GroupState, NetworkState};

#[derive(Default)]
struct Tables {
    networks: HashMap<String, NetworkState>,
    groups: HashMap<(String, String), GroupState>,
    contents: HashMap<(String, String, String), Value>,
    closed: bool,
}

/// A storage adapter that keeps everything in process memory.
#[derive(Default)]
pub struct MemoryStorage {
    tables: RwLock<Tables>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl StorageAdapter for MemoryStorage {
    async fn initialize(&self) -> Result<(), StorageError> {
        let mut tables = self.tables.write().await;
        tables.closed = false;
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        let mut tables = self.tables.write().await;
        tables.closed = true;
        Ok(())
    }

    async fn save_network_state(
        &self,
        network_id: &str,
        state: &NetworkState,
    ) -> Result<(), StorageError> {
        let mut tables = self.tables.write().await;
        if tables.closed {
            return Err(StorageError::Closed);
        }
        tables.networks.insert(network_id.to_string(), state.clone());
        Ok(())
    }

    async fn load_network_state(
        &self,
        network_id: &str,
    ) -> Result<Option<NetworkState>, StorageError> {
        let tables = self.tables.read().await;
        if tables.closed {
            return Err(StorageError::Closed);
        }
        Ok(tables.networks.get(network_id).cloned())
    }

    async fn save_group_state(
        &self,
        network_id: &str,
        group_id: &str,
        state: &GroupState,
    ) -> Result<(), StorageError> {
        let mut tables = self.tables.write().await;
        if tables.closed {
            return Err(StorageError::Closed);
        }
        tables
            .groups
            .insert((network_id.to_string(), group_id.to_string()), state.clone());
        Ok(())
    }

    async fn load_group_state(
        &self,
        network_id: &str,
        group_id: &str,
    ) -> Result<Option<GroupState>, StorageError> {
        let tables = self.tables.read().await;
        if tables.closed {
            return Err(StorageError::Closed);
        }
        Ok(tables
            .groups
            .get(&(network_id.to_string(), group_id.to_string()))
            .cloned())
    }

    async fn save_contact_content(
        &self,
        network_id: &str,
        group_id: &str,
        contact_id: &str,
        content: &Value,
    ) -> Result<(), StorageError> {
        let mut tables = self.tables.write().await;
        if tables.closed {
            return Err(StorageError::Closed);
        }
        tables.contents.insert(
            (
                network_id.to_string(),
                group_id.to_string(),
                contact_id.to_string(),
            ),
            content.clone(),
        );
        Ok(())
    }

    async fn load_contact_content(
        &self,
        network_id: &str,
        group_id: &str,
        contact_id: &str,
    ) -> Result<Option<Value>, StorageError> {
        let tables = self.tables.read().await;
        if tables.closed {
            return Err(StorageError::Closed);
        }
        Ok(tables
            .contents
            .get(&(
                network_id.to_string(),
                group_id.to_string(),
                contact_id.to_string(),
            ))
            .cloned())
    }
}
