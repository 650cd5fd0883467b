//! Change records emitted by the runtime
//!
//! Each variant carries the minimal payload needed to replay the
//! mutation on another runtime; cross-node synchronization is expressed
//! as sequences of these records or full-state snapshots.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Contact, ContactId, Group, GroupId, Wire, WireId};

/// An immutable, tagged mutation event.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Change {
    ContactAdded {
        contact: Contact,
    },
    ContactUpdated {
        contact_id: ContactId,
        group_id: GroupId,
        content: Value,
    },
    ContactRemoved {
        contact_id: ContactId,
        group_id: GroupId,
    },
    WireAdded {
        wire: Wire,
    },
    WireRemoved {
        wire_id: WireId,
        group_id: GroupId,
    },
    GroupAdded {
        group: Group,
    },
    GroupUpdated {
        group: Group,
    },
    GroupRemoved {
        group_id: GroupId,
    },
}

impl Change {
    /// The group this change is scoped to, used to route change batches
    /// to group-scoped subscribers.
    pub fn group_id(&self) -> &GroupId {
        match self {
            Change::ContactAdded { contact } => &contact.group_id,
            Change::ContactUpdated { group_id, .. } => group_id,
            Change::ContactRemoved { group_id, .. } => group_id,
            Change::WireAdded { wire } => &wire.group_id,
            Change::WireRemoved { group_id, .. } => group_id,
            Change::GroupAdded { group } => &group.id,
            Change::GroupUpdated { group } => &group.id,
            Change::GroupRemoved { group_id } => group_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_tag_names() {
        let change = Change::ContactRemoved {
            contact_id: "c1".into(),
            group_id: "root".into(),
        };
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["type"], "contact-removed");
        assert_eq!(json["contact_id"], "c1");
    }
}
