//! Storage contract for network persistence
//!
//! Backends are interchangeable behind [`StorageAdapter`]; the runtime
//! and gossip layer depend only on this trait. Adapters must tolerate
//! concurrent calls for different contact ids, and same-key calls must
//! not interleave a read-merge-write into a lost update.

pub mod local;
pub mod memory;

use std::path::PathBuf;

use serde_json::Value;
use thiserror::Error;

pub use local::LocalStorage;
pub use memory::MemoryStorage;

use crate::model::{GroupState, NetworkState};

/// Error types for storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage adapter is closed")]
    Closed,
}

/// Trait for durable group/contact/wire persistence.
///
/// Topology is saved as network- and group-level snapshots; contact
/// content is saved per contact so that content writes never rewrite
/// the whole network.
#[async_trait::async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Prepare the backend for use (create directories, open handles).
    async fn initialize(&self) -> Result<(), StorageError>;

    /// Release backend resources. Calls after `close` fail with
    /// [`StorageError::Closed`].
    async fn close(&self) -> Result<(), StorageError>;

    async fn save_network_state(
        &self,
        network_id: &str,
        state: &NetworkState,
    ) -> Result<(), StorageError>;

    async fn load_network_state(
        &self,
        network_id: &str,
    ) -> Result<Option<NetworkState>, StorageError>;

    async fn save_group_state(
        &self,
        network_id: &str,
        group_id: &str,
        state: &GroupState,
    ) -> Result<(), StorageError>;

    async fn load_group_state(
        &self,
        network_id: &str,
        group_id: &str,
    ) -> Result<Option<GroupState>, StorageError>;

    async fn save_contact_content(
        &self,
        network_id: &str,
        group_id: &str,
        contact_id: &str,
        content: &Value,
    ) -> Result<(), StorageError>;

    async fn load_contact_content(
        &self,
        network_id: &str,
        group_id: &str,
        contact_id: &str,
    ) -> Result<Option<Value>, StorageError>;
}

/// Configuration for storage adapters
#[derive(Clone, Debug)]
pub struct StorageConfig {
    /// Base directory for file-backed adapters
    pub base_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./latticenet_data"),
        }
    }
}
