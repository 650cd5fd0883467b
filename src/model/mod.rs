//! Data model for the propagation network
//!
//! Groups, contacts and wires are stored arena-style: flat tables keyed
//! by string id, with cross-references held as plain id values. Nothing
//! in the model owns anything else, which keeps group/subgroup and
//! contact/wire references acyclic at the ownership level.

mod change;

pub use change::Change;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::merge::BlendMode;

pub type GroupId = String;
pub type ContactId = String;
pub type WireId = String;

/// Direction of a boundary contact relative to its group.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BoundaryDirection {
    Input,
    Output,
}

/// A namespace holding contacts, wires and nested subgroups.
///
/// Boundary contacts mark the group's external interface; attribute
/// boundary contacts are identified by an `@`-prefixed contact id.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    /// `None` only for the root group.
    pub parent_id: Option<GroupId>,
    #[serde(default)]
    pub contact_ids: Vec<ContactId>,
    #[serde(default)]
    pub wire_ids: Vec<WireId>,
    #[serde(default)]
    pub subgroup_ids: Vec<GroupId>,
    #[serde(default)]
    pub boundary_contact_ids: Vec<ContactId>,
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
}

impl Group {
    pub fn new(id: impl Into<GroupId>, name: impl Into<String>, parent_id: Option<GroupId>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            parent_id,
            contact_ids: Vec::new(),
            wire_ids: Vec::new(),
            subgroup_ids: Vec::new(),
            boundary_contact_ids: Vec::new(),
            attributes: HashMap::new(),
        }
    }
}

/// A mergeable cell of content.
///
/// `content` stays `None` until the first write; the blend mode is
/// fixed at creation and decides how later writes combine with it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Contact {
    pub id: ContactId,
    pub group_id: GroupId,
    #[serde(default)]
    pub content: Option<Value>,
    #[serde(default)]
    pub blend_mode: BlendMode,
    #[serde(default)]
    pub is_boundary: bool,
    #[serde(default)]
    pub boundary_direction: Option<BoundaryDirection>,
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
}

/// Creation parameters for a contact; fields left unset get defaults
/// (generated id, no content, accept-last blending).
#[derive(Clone, Debug, Default)]
pub struct ContactSpec {
    pub id: Option<ContactId>,
    pub content: Option<Value>,
    pub blend_mode: BlendMode,
    pub is_boundary: bool,
    pub boundary_direction: Option<BoundaryDirection>,
    pub attributes: HashMap<String, Value>,
}

impl ContactSpec {
    pub fn with_id(id: impl Into<ContactId>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn blend_mode(mut self, mode: BlendMode) -> Self {
        self.blend_mode = mode;
        self
    }
}

/// Kind of edge between two contacts.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum WireType {
    Directed,
    Bidirectional,
}

/// An edge between two contacts, owned by the group of its `from`
/// endpoint. Endpoints may live in different groups; inter-group wires
/// cross scope boundaries via boundary contacts.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Wire {
    pub id: WireId,
    pub group_id: GroupId,
    pub from_id: ContactId,
    pub to_id: ContactId,
    pub wire_type: WireType,
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
}

/// Full state of one node's network: flat id-keyed tables plus the
/// root group id. Invariant: the group graph is a tree rooted at
/// `root_group_id`; every non-root group's `parent_id` names an
/// existing group.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NetworkState {
    pub root_group_id: GroupId,
    pub groups: HashMap<GroupId, Group>,
    pub contacts: HashMap<ContactId, Contact>,
    pub wires: HashMap<WireId, Wire>,
}

impl NetworkState {
    /// A fresh network containing only the root group.
    pub fn new(root_group_id: impl Into<GroupId>) -> Self {
        let root_group_id = root_group_id.into();
        let mut groups = HashMap::new();
        groups.insert(
            root_group_id.clone(),
            Group::new(root_group_id.clone(), "root", None),
        );
        Self {
            root_group_id,
            groups,
            contacts: HashMap::new(),
            wires: HashMap::new(),
        }
    }
}

/// Consistent snapshot of one group: its definition plus live contacts
/// and wires, as returned by the runtime's `get_state`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GroupState {
    pub group: Group,
    pub contacts: Vec<Contact>,
    pub wires: Vec<Wire>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_network_has_root() {
        let state = NetworkState::new("root");
        let root = state.groups.get("root").unwrap();
        assert_eq!(root.parent_id, None);
        assert!(state.contacts.is_empty());
    }

    #[test]
    fn test_blend_mode_wire_names() {
        let json = serde_json::to_string(&BlendMode::AcceptLast).unwrap();
        assert_eq!(json, "\"accept-last\"");
        let json = serde_json::to_string(&WireType::Bidirectional).unwrap();
        assert_eq!(json, "\"bidirectional\"");
    }
}
