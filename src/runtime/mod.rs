//! Storage-backed runtime
//!
//! The authoritative state machine for one node. All mutations funnel
//! through here: content writes go through the lattice merge law, every
//! change persists via the storage contract, and subscribers see change
//! batches in the order the runtime applied them.
//!
//! The network state sits behind one async `RwLock`; mutations hold the
//! write guard across the read-merge-write and its persistence, so a
//! local write and an incoming gossip write for the same contact race
//! through the merge function rather than clobbering each other.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::merge::{content_hash, merge, BlendMode};
use crate::model::{
    Change, Contact, ContactId, ContactSpec, Group, GroupId, GroupState, NetworkState, Wire,
    WireId, WireType,
};
use crate::storage::{StorageAdapter, StorageError};

/// Error types for runtime operations
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Group not found: {0}")]
    GroupNotFound(GroupId),

    #[error("Contact not found: {0}")]
    ContactNotFound(ContactId),

    #[error("Group {0} has no parent and is not the root")]
    OrphanGroup(GroupId),

    #[error("Group {0} still holds contacts, wires or subgroups")]
    GroupNotEmpty(GroupId),

    #[error("The root group cannot be removed")]
    CannotRemoveRoot,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Configuration for a runtime instance
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Identifier this node's state is stored under
    pub network_id: String,
    /// Id of the root group created on first start
    pub root_group_id: GroupId,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            network_id: "default".to_string(),
            root_group_id: "root".to_string(),
        }
    }
}

/// One contact's sync-relevant state, handed to the gossip layer for
/// hash summaries and content pushes.
#[derive(Clone, Debug)]
pub struct SyncRecord {
    pub contact_id: ContactId,
    pub group_id: GroupId,
    pub blend_mode: BlendMode,
    pub hash: String,
    pub content: Value,
}

/// Callback receiving ordered change batches.
pub type ChangeHandler = Box<dyn Fn(&[Change]) + Send + Sync>;

type SharedHandler = Arc<dyn Fn(&[Change]) + Send + Sync>;

struct Subscriber {
    /// `None` subscribes to the whole runtime.
    scope: Option<GroupId>,
    handler: SharedHandler,
}

/// The authoritative in-process state machine for one node.
pub struct Runtime {
    network_id: String,
    storage: Arc<dyn StorageAdapter>,
    state: RwLock<NetworkState>,
    subscribers: StdMutex<HashMap<Uuid, Subscriber>>,
}

impl Runtime {
    /// Open a runtime over a storage adapter, restoring persisted state
    /// when present and seeding a fresh network (root group only)
    /// otherwise.
    pub async fn new(
        config: RuntimeConfig,
        storage: Arc<dyn StorageAdapter>,
    ) -> Result<Self, RuntimeError> {
        storage.initialize().await?;

        let state = match storage.load_network_state(&config.network_id).await? {
            Some(mut state) => {
                // Topology snapshots can trail per-contact content
                // writes; overlay the per-contact records on load.
                let keys: Vec<(ContactId, GroupId)> = state
                    .contacts
                    .values()
                    .map(|c| (c.id.clone(), c.group_id.clone()))
                    .collect();
                for (contact_id, group_id) in keys {
                    if let Some(content) = storage
                        .load_contact_content(&config.network_id, &group_id, &contact_id)
                        .await?
                    {
                        if let Some(contact) = state.contacts.get_mut(&contact_id) {
                            contact.content = Some(content);
                        }
                    }
                }
                state
            }
            None => {
                let state = NetworkState::new(config.root_group_id.clone());
                storage.save_network_state(&config.network_id, &state).await?;
                state
            }
        };

        Ok(Self {
            network_id: config.network_id,
            storage,
            state: RwLock::new(state),
            subscribers: StdMutex::new(HashMap::new()),
        })
    }

    pub fn network_id(&self) -> &str {
        &self.network_id
    }

    /// Insert a group if absent. Re-registering an identical group is a
    /// no-op with no change record; differing content overwrites and
    /// emits `group-updated`.
    pub async fn register_group(&self, group: Group) -> Result<(), RuntimeError> {
        let mut state = self.state.write().await;

        if let Some(existing) = state.groups.get(&group.id) {
            if *existing == group {
                return Ok(());
            }
            state.groups.insert(group.id.clone(), group.clone());
            self.persist_structure(&state, &group.id).await?;
            self.notify(&[Change::GroupUpdated { group }]);
            return Ok(());
        }

        match &group.parent_id {
            Some(parent_id) => {
                if !state.groups.contains_key(parent_id) {
                    return Err(RuntimeError::GroupNotFound(parent_id.clone()));
                }
                let parent_id = parent_id.clone();
                if let Some(parent) = state.groups.get_mut(&parent_id) {
                    if !parent.subgroup_ids.contains(&group.id) {
                        parent.subgroup_ids.push(group.id.clone());
                    }
                }
            }
            None => {
                if group.id != state.root_group_id {
                    return Err(RuntimeError::OrphanGroup(group.id.clone()));
                }
            }
        }

        state.groups.insert(group.id.clone(), group.clone());
        self.persist_structure(&state, &group.id).await?;
        self.notify(&[Change::GroupAdded { group }]);
        Ok(())
    }

    /// Remove an empty group. Idempotent no-op when absent; groups
    /// still holding contacts, wires or subgroups must be detached
    /// first.
    pub async fn remove_group(&self, group_id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.write().await;

        let Some(group) = state.groups.get(group_id) else {
            return Ok(());
        };
        if group_id == state.root_group_id {
            return Err(RuntimeError::CannotRemoveRoot);
        }
        if !group.contact_ids.is_empty()
            || !group.wire_ids.is_empty()
            || !group.subgroup_ids.is_empty()
        {
            return Err(RuntimeError::GroupNotEmpty(group_id.to_string()));
        }

        let parent_id = group.parent_id.clone();
        state.groups.remove(group_id);
        if let Some(parent_id) = parent_id {
            if let Some(parent) = state.groups.get_mut(&parent_id) {
                parent.subgroup_ids.retain(|id| id != group_id);
            }
        }

        self.storage
            .save_network_state(&self.network_id, &state)
            .await?;
        self.notify(&[Change::GroupRemoved {
            group_id: group_id.to_string(),
        }]);
        Ok(())
    }

    /// Add a contact to a group, assigning an id when the spec carries
    /// none. Re-adding an existing contact id is a no-op, which keeps
    /// gossip replay idempotent.
    pub async fn add_contact(
        &self,
        group_id: &str,
        spec: ContactSpec,
    ) -> Result<ContactId, RuntimeError> {
        let mut state = self.state.write().await;

        if !state.groups.contains_key(group_id) {
            return Err(RuntimeError::GroupNotFound(group_id.to_string()));
        }

        let contact_id = spec
            .id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if state.contacts.contains_key(&contact_id) {
            return Ok(contact_id);
        }

        let contact = Contact {
            id: contact_id.clone(),
            group_id: group_id.to_string(),
            content: spec.content,
            blend_mode: spec.blend_mode,
            is_boundary: spec.is_boundary,
            boundary_direction: spec.boundary_direction,
            attributes: spec.attributes,
        };

        state.contacts.insert(contact_id.clone(), contact.clone());
        if let Some(group) = state.groups.get_mut(group_id) {
            group.contact_ids.push(contact_id.clone());
            if contact.is_boundary {
                group.boundary_contact_ids.push(contact_id.clone());
            }
        }

        if let Some(content) = &contact.content {
            self.storage
                .save_contact_content(&self.network_id, group_id, &contact_id, content)
                .await?;
        }
        self.persist_structure(&state, group_id).await?;
        self.notify(&[Change::ContactAdded { contact }]);
        Ok(contact_id)
    }

    /// Remove a contact and its incident wires. Idempotent: removing an
    /// absent contact is a no-op with no error and no change record.
    pub async fn remove_contact(&self, contact_id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.write().await;

        let Some(contact) = state.contacts.get(contact_id).cloned() else {
            return Ok(());
        };

        let mut changes = Vec::new();
        let incident: Vec<WireId> = state
            .wires
            .values()
            .filter(|w| w.from_id == contact_id || w.to_id == contact_id)
            .map(|w| w.id.clone())
            .collect();
        for wire_id in incident {
            if let Some(wire) = state.wires.remove(&wire_id) {
                if let Some(group) = state.groups.get_mut(&wire.group_id) {
                    group.wire_ids.retain(|id| id != &wire_id);
                }
                changes.push(Change::WireRemoved {
                    wire_id,
                    group_id: wire.group_id,
                });
            }
        }

        state.contacts.remove(contact_id);
        if let Some(group) = state.groups.get_mut(&contact.group_id) {
            group.contact_ids.retain(|id| id != contact_id);
            group.boundary_contact_ids.retain(|id| id != contact_id);
        }
        changes.push(Change::ContactRemoved {
            contact_id: contact_id.to_string(),
            group_id: contact.group_id.clone(),
        });

        self.persist_structure(&state, &contact.group_id).await?;
        self.notify(&changes);
        Ok(())
    }

    /// Create a wire between two existing contacts. The wire is owned
    /// by the `from` endpoint's group.
    pub async fn connect(
        &self,
        from_id: &str,
        to_id: &str,
        wire_type: WireType,
    ) -> Result<WireId, RuntimeError> {
        let mut state = self.state.write().await;

        let Some(from) = state.contacts.get(from_id) else {
            return Err(RuntimeError::ContactNotFound(from_id.to_string()));
        };
        if !state.contacts.contains_key(to_id) {
            return Err(RuntimeError::ContactNotFound(to_id.to_string()));
        }

        let wire = Wire {
            id: Uuid::new_v4().to_string(),
            group_id: from.group_id.clone(),
            from_id: from_id.to_string(),
            to_id: to_id.to_string(),
            wire_type,
            attributes: HashMap::new(),
        };
        let wire_id = wire.id.clone();
        let group_id = wire.group_id.clone();

        state.wires.insert(wire_id.clone(), wire.clone());
        if let Some(group) = state.groups.get_mut(&group_id) {
            group.wire_ids.push(wire_id.clone());
        }

        self.persist_structure(&state, &group_id).await?;
        self.notify(&[Change::WireAdded { wire }]);
        Ok(wire_id)
    }

    /// Remove a wire. Idempotent no-op when absent.
    pub async fn disconnect(&self, wire_id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.write().await;

        let Some(wire) = state.wires.remove(wire_id) else {
            return Ok(());
        };
        if let Some(group) = state.groups.get_mut(&wire.group_id) {
            group.wire_ids.retain(|id| id != wire_id);
        }

        self.persist_structure(&state, &wire.group_id).await?;
        self.notify(&[Change::WireRemoved {
            wire_id: wire_id.to_string(),
            group_id: wire.group_id,
        }]);
        Ok(())
    }

    /// Apply new content to a contact through its blend mode. This is
    /// the only path by which content changes; the persisted result is
    /// always `merge(blend_mode, before, incoming)`.
    pub async fn schedule_update(
        &self,
        contact_id: &str,
        new_content: Value,
    ) -> Result<Value, RuntimeError> {
        let mut state = self.state.write().await;
        self.merge_content(&mut state, contact_id, new_content, &mut Vec::new())
            .await
    }

    /// Ingest contact content received from a peer. Creates the contact
    /// (and a placeholder group when its group is unknown locally)
    /// before running the normal merge path, so a replayed remote write
    /// is indistinguishable from a local one.
    pub async fn apply_remote_content(
        &self,
        contact_id: &str,
        group_id: &str,
        blend_mode: BlendMode,
        content: Value,
    ) -> Result<Value, RuntimeError> {
        let mut state = self.state.write().await;
        let mut changes = Vec::new();

        if !state.contacts.contains_key(contact_id) {
            if !state.groups.contains_key(group_id) {
                let root_id = state.root_group_id.clone();
                let group = Group::new(group_id, group_id, Some(root_id.clone()));
                if let Some(root) = state.groups.get_mut(&root_id) {
                    root.subgroup_ids.push(group_id.to_string());
                }
                state.groups.insert(group_id.to_string(), group.clone());
                changes.push(Change::GroupAdded { group });
            }

            let contact = Contact {
                id: contact_id.to_string(),
                group_id: group_id.to_string(),
                content: None,
                blend_mode,
                is_boundary: false,
                boundary_direction: None,
                attributes: HashMap::new(),
            };
            state
                .contacts
                .insert(contact_id.to_string(), contact.clone());
            if let Some(group) = state.groups.get_mut(group_id) {
                group.contact_ids.push(contact_id.to_string());
            }
            changes.push(Change::ContactAdded { contact });
            self.persist_structure(&state, group_id).await?;
        }

        self.merge_content(&mut state, contact_id, content, &mut changes)
            .await
    }

    /// Shared merge path for local updates and gossip ingestion. Runs
    /// under the caller's write guard, emitting `prior` changes plus
    /// the resulting `contact-updated` as one ordered batch.
    async fn merge_content(
        &self,
        state: &mut NetworkState,
        contact_id: &str,
        new_content: Value,
        prior: &mut Vec<Change>,
    ) -> Result<Value, RuntimeError> {
        let Some(contact) = state.contacts.get_mut(contact_id) else {
            return Err(RuntimeError::ContactNotFound(contact_id.to_string()));
        };

        let merged = match &contact.content {
            Some(current) => merge(contact.blend_mode, current, &new_content),
            // First write: content was undefined, nothing to merge with.
            None => new_content,
        };
        contact.content = Some(merged.clone());
        let group_id = contact.group_id.clone();

        self.storage
            .save_contact_content(&self.network_id, &group_id, contact_id, &merged)
            .await?;

        prior.push(Change::ContactUpdated {
            contact_id: contact_id.to_string(),
            group_id,
            content: merged.clone(),
        });
        self.notify(prior);
        Ok(merged)
    }

    /// Consistent snapshot of one group: definition plus live contacts
    /// and wires.
    pub async fn get_state(&self, group_id: &str) -> Result<GroupState, RuntimeError> {
        let state = self.state.read().await;
        Self::snapshot_group(&state, group_id)
            .ok_or_else(|| RuntimeError::GroupNotFound(group_id.to_string()))
    }

    pub async fn get_contact(&self, contact_id: &str) -> Option<Contact> {
        self.state.read().await.contacts.get(contact_id).cloned()
    }

    pub async fn get_wire(&self, wire_id: &str) -> Option<Wire> {
        self.state.read().await.wires.get(wire_id).cloned()
    }

    pub async fn contact_ids(&self) -> Vec<ContactId> {
        self.state.read().await.contacts.keys().cloned().collect()
    }

    /// Local content hash for a contact, `None` when the contact is
    /// unknown or has never been written.
    pub async fn content_hash_of(&self, contact_id: &str) -> Option<String> {
        let state = self.state.read().await;
        state
            .contacts
            .get(contact_id)
            .and_then(|c| c.content.as_ref())
            .map(content_hash)
    }

    /// Snapshot of every written contact for gossip exchange.
    pub async fn sync_records(&self) -> Vec<SyncRecord> {
        let state = self.state.read().await;
        state
            .contacts
            .values()
            .filter_map(|contact| {
                contact.content.as_ref().map(|content| SyncRecord {
                    contact_id: contact.id.clone(),
                    group_id: contact.group_id.clone(),
                    blend_mode: contact.blend_mode,
                    hash: content_hash(content),
                    content: content.clone(),
                })
            })
            .collect()
    }

    /// Subscribe to change batches for the whole runtime.
    pub fn subscribe(&self, handler: ChangeHandler) -> Uuid {
        self.insert_subscriber(None, handler)
    }

    /// Subscribe to change batches scoped to one group.
    pub fn subscribe_group(&self, group_id: &str, handler: ChangeHandler) -> Uuid {
        self.insert_subscriber(Some(group_id.to_string()), handler)
    }

    /// Remove a subscription. Safe to call any number of times.
    pub fn unsubscribe(&self, subscription_id: Uuid) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.remove(&subscription_id);
        }
    }

    fn insert_subscriber(&self, scope: Option<GroupId>, handler: ChangeHandler) -> Uuid {
        let id = Uuid::new_v4();
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.insert(
                id,
                Subscriber {
                    scope,
                    handler: Arc::from(handler),
                },
            );
        }
        id
    }

    /// Deliver a change batch to subscribers. Called while the state
    /// write guard is held, so batches arrive in apply order. Handlers
    /// run outside the subscriber table lock; a handler may subscribe
    /// or unsubscribe from inside the callback.
    fn notify(&self, changes: &[Change]) {
        if changes.is_empty() {
            return;
        }
        let subscribers: Vec<(Option<GroupId>, SharedHandler)> = {
            let Ok(subs) = self.subscribers.lock() else {
                return;
            };
            subs.values()
                .map(|s| (s.scope.clone(), s.handler.clone()))
                .collect()
        };
        for (scope, handler) in subscribers {
            match scope {
                None => handler(changes),
                Some(group_id) => {
                    let scoped: Vec<Change> = changes
                        .iter()
                        .filter(|c| *c.group_id() == group_id)
                        .cloned()
                        .collect();
                    if !scoped.is_empty() {
                        handler(&scoped);
                    }
                }
            }
        }
    }

    async fn persist_structure(
        &self,
        state: &NetworkState,
        group_id: &str,
    ) -> Result<(), StorageError> {
        self.storage
            .save_network_state(&self.network_id, state)
            .await?;
        if let Some(snapshot) = Self::snapshot_group(state, group_id) {
            self.storage
                .save_group_state(&self.network_id, group_id, &snapshot)
                .await?;
        }
        Ok(())
    }

    fn snapshot_group(state: &NetworkState, group_id: &str) -> Option<GroupState> {
        let group = state.groups.get(group_id)?.clone();
        let contacts = group
            .contact_ids
            .iter()
            .filter_map(|id| state.contacts.get(id).cloned())
            .collect();
        let wires = group
            .wire_ids
            .iter()
            .filter_map(|id| state.wires.get(id).cloned())
            .collect();
        Some(GroupState {
            group,
            contacts,
            wires,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    async fn make_runtime() -> Runtime {
        Runtime::new(RuntimeConfig::default(), Arc::new(MemoryStorage::new()))
            .await
            .unwrap()
    }

    fn change_counter(runtime: &Runtime) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        runtime.subscribe(Box::new(move |changes| {
            count_clone.fetch_add(changes.len(), Ordering::SeqCst);
        }));
        count
    }

    #[tokio::test]
    async fn test_duplicate_group_registration_is_silent() {
        let runtime = make_runtime().await;
        let count = change_counter(&runtime);

        let group = Group::new("g1", "worker", Some("root".to_string()));
        runtime.register_group(group.clone()).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Identical re-registration: no duplicate, no change record.
        runtime.register_group(group).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Differing content overwrites and emits group-updated.
        let mut renamed = Group::new("g1", "renamed", Some("root".to_string()));
        renamed.subgroup_ids = runtime.get_state("g1").await.unwrap().group.subgroup_ids;
        runtime.register_group(renamed).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(runtime.get_state("g1").await.unwrap().group.name, "renamed");
    }

    #[tokio::test]
    async fn test_register_group_requires_existing_parent() {
        let runtime = make_runtime().await;
        let group = Group::new("g1", "orphan", Some("nope".to_string()));
        let err = runtime.register_group(group).await.unwrap_err();
        assert!(matches!(err, RuntimeError::GroupNotFound(id) if id == "nope"));

        let no_parent = Group::new("g2", "floating", None);
        let err = runtime.register_group(no_parent).await.unwrap_err();
        assert!(matches!(err, RuntimeError::OrphanGroup(_)));
    }

    #[tokio::test]
    async fn test_add_contact_unknown_group_fails() {
        let runtime = make_runtime().await;
        let err = runtime
            .add_contact("missing", ContactSpec::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::GroupNotFound(_)));
    }

    #[tokio::test]
    async fn test_remove_absent_contact_is_noop() {
        let runtime = make_runtime().await;
        let count = change_counter(&runtime);

        runtime.remove_contact("never-existed").await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_schedule_update_goes_through_merge() {
        let runtime = make_runtime().await;
        let id = runtime
            .add_contact(
                "root",
                ContactSpec::with_id("hits").blend_mode(BlendMode::Counter),
            )
            .await
            .unwrap();

        runtime.schedule_update(&id, json!(5)).await.unwrap();
        let merged = runtime.schedule_update(&id, json!(3)).await.unwrap();
        // Counter is max-of-cumulative, not overwrite.
        assert_eq!(merged, json!(5));
        assert_eq!(
            runtime.get_contact(&id).await.unwrap().content,
            Some(json!(5))
        );
    }

    #[tokio::test]
    async fn test_schedule_update_unknown_contact_fails() {
        let runtime = make_runtime().await;
        let err = runtime
            .schedule_update("missing", json!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ContactNotFound(_)));
    }

    #[tokio::test]
    async fn test_connect_requires_both_endpoints() {
        let runtime = make_runtime().await;
        let a = runtime
            .add_contact("root", ContactSpec::with_id("a"))
            .await
            .unwrap();

        let err = runtime
            .connect(&a, "missing", WireType::Directed)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ContactNotFound(_)));
    }

    #[tokio::test]
    async fn test_remove_contact_detaches_incident_wires() {
        let runtime = make_runtime().await;
        let a = runtime
            .add_contact("root", ContactSpec::with_id("a"))
            .await
            .unwrap();
        let b = runtime
            .add_contact("root", ContactSpec::with_id("b"))
            .await
            .unwrap();
        let wire_id = runtime
            .connect(&a, &b, WireType::Bidirectional)
            .await
            .unwrap();

        runtime.remove_contact(&a).await.unwrap();
        assert!(runtime.get_wire(&wire_id).await.is_none());
        assert!(runtime.get_contact(&a).await.is_none());
        assert!(runtime.get_contact(&b).await.is_some());

        // Disconnecting the already-removed wire stays a no-op.
        runtime.disconnect(&wire_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_group_rules() {
        let runtime = make_runtime().await;
        runtime
            .register_group(Group::new("g1", "worker", Some("root".to_string())))
            .await
            .unwrap();
        runtime
            .add_contact("g1", ContactSpec::with_id("c1"))
            .await
            .unwrap();

        assert!(matches!(
            runtime.remove_group("root").await.unwrap_err(),
            RuntimeError::CannotRemoveRoot
        ));
        assert!(matches!(
            runtime.remove_group("g1").await.unwrap_err(),
            RuntimeError::GroupNotEmpty(_)
        ));

        runtime.remove_contact("c1").await.unwrap();
        runtime.remove_group("g1").await.unwrap();
        assert!(runtime.get_state("g1").await.is_err());
        // Removing again is a no-op.
        runtime.remove_group("g1").await.unwrap();
    }

    #[tokio::test]
    async fn test_group_scoped_subscription_and_unsubscribe() {
        let runtime = make_runtime().await;
        runtime
            .register_group(Group::new("g1", "worker", Some("root".to_string())))
            .await
            .unwrap();

        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let sub = runtime.subscribe_group(
            "g1",
            Box::new(move |changes| {
                let mut log = seen_clone.lock().unwrap();
                for change in changes {
                    log.push(change.group_id().clone());
                }
            }),
        );

        runtime
            .add_contact("root", ContactSpec::with_id("outside"))
            .await
            .unwrap();
        runtime
            .add_contact("g1", ContactSpec::with_id("inside"))
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["g1".to_string()]);

        runtime.unsubscribe(sub);
        runtime.unsubscribe(sub);
        runtime
            .add_contact("g1", ContactSpec::with_id("after"))
            .await
            .unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_handler_can_unsubscribe_itself() {
        let runtime = Arc::new(make_runtime().await);
        let count = Arc::new(AtomicUsize::new(0));
        let subscription: Arc<Mutex<Option<Uuid>>> = Arc::new(Mutex::new(None));

        let count_clone = count.clone();
        let subscription_clone = subscription.clone();
        let runtime_clone = runtime.clone();
        let id = runtime.subscribe(Box::new(move |changes| {
            count_clone.fetch_add(changes.len(), Ordering::SeqCst);
            if let Some(sub) = subscription_clone.lock().unwrap().take() {
                runtime_clone.unsubscribe(sub);
            }
        }));
        *subscription.lock().unwrap() = Some(id);

        // First change fires the handler, which removes itself.
        runtime
            .add_contact("root", ContactSpec::with_id("first"))
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        runtime
            .add_contact("root", ContactSpec::with_id("second"))
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_apply_remote_content_creates_missing_contact() {
        let runtime = make_runtime().await;
        let merged = runtime
            .apply_remote_content("far-away", "remote-group", BlendMode::MaxNumber, json!(9))
            .await
            .unwrap();
        assert_eq!(merged, json!(9));

        let contact = runtime.get_contact("far-away").await.unwrap();
        assert_eq!(contact.group_id, "remote-group");
        assert_eq!(contact.blend_mode, BlendMode::MaxNumber);
        // The placeholder group hangs off the root.
        let group = runtime.get_state("remote-group").await.unwrap().group;
        assert_eq!(group.parent_id, Some("root".to_string()));

        // A second delivery of the same content converges in place.
        runtime
            .apply_remote_content("far-away", "remote-group", BlendMode::MaxNumber, json!(9))
            .await
            .unwrap();
        assert_eq!(
            runtime.get_contact("far-away").await.unwrap().content,
            Some(json!(9))
        );
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let storage = Arc::new(MemoryStorage::new());
        {
            let runtime = Runtime::new(RuntimeConfig::default(), storage.clone())
                .await
                .unwrap();
            runtime
                .add_contact(
                    "root",
                    ContactSpec::with_id("persisted").blend_mode(BlendMode::MaxNumber),
                )
                .await
                .unwrap();
            runtime
                .schedule_update("persisted", json!(7))
                .await
                .unwrap();
        }

        let reopened = Runtime::new(RuntimeConfig::default(), storage).await.unwrap();
        let contact = reopened.get_contact("persisted").await.unwrap();
        assert_eq!(contact.content, Some(json!(7)));
        assert_eq!(contact.blend_mode, BlendMode::MaxNumber);
    }
}
