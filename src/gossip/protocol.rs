//! Gossip wire protocol message types
//!
//! Messages travel as newline-delimited JSON over a peer TCP
//! connection. Every message is independently retriable: nothing
//! depends on session state surviving a reconnect beyond the `hello`
//! that re-keys the connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::merge::BlendMode;

/// One contact's digest inside a hash summary.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HashEntry {
    pub contact_id: String,
    pub hash: String,
}

/// Messages exchanged between gossip peers.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum GossipMessage {
    /// Handshake, sent first on every connection. `listen_addr` is the
    /// address other nodes can dial, which also keys the connection
    /// table on the receiving side.
    Hello {
        node_id: String,
        listen_addr: String,
    },

    /// Digest of every locally written contact. The receiver answers
    /// with `content` pushes for contacts where its hash differs or
    /// the summary has no entry.
    HashSummary { entries: Vec<HashEntry> },

    /// One contact's content. Carries the group and blend mode so a
    /// node that has never seen the contact can create it before
    /// merging.
    Content {
        contact_id: String,
        group_id: String,
        blend_mode: BlendMode,
        content: Value,
    },

    /// Advertisement of every peer address this node knows, including
    /// its own.
    PeerList { peers: Vec<String> },
}
