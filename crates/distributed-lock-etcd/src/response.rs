//! Decoded responses of the etcd v2 keys API.

use serde::Deserialize;

/// What happened to a key.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    Get,
    Set,
    Create,
    Update,
    Delete,
    Expire,
    CompareAndSwap,
    CompareAndDelete,
    #[serde(other)]
    Unknown,
}

impl Action {
    /// True when the event leaves the key absent.
    pub fn frees_key(&self) -> bool {
        matches!(self, Action::Delete | Action::Expire | Action::CompareAndDelete)
    }
}

/// A key as stored by the service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub created_index: u64,
    #[serde(default)]
    pub modified_index: u64,
    /// Remaining time to live in seconds.
    #[serde(default)]
    pub ttl: Option<i64>,
}

/// One answer of the service, or one watch event.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub action: Action,
    pub node: Node,
    #[serde(default)]
    pub prev_node: Option<Node>,
    /// Cluster index at the time of the answer.
    ///
    /// Carried in the `X-Etcd-Index` header rather than the body.
    #[serde(skip)]
    pub index: u64,
}
