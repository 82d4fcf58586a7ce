//! Container lifecycle tasks and their wire forms.
//!
//! A [`Task`] is one command for one agent host. Tasks that share a
//! [`GroupKey`] are shipped together as a [`GroupedTask`]; the agent answers
//! with a [`TaskReply`] holding one result per task, at the same index, keyed
//! by the group's [`GroupId`].
//!
//! Master → agent:
//!
//! ```json
//! {"name": "web", "ownerId": 7, "kind": 1, "id": "<uuid>", "commands": [ ... ]}
//! ```
//!
//! Agent → master:
//!
//! ```json
//! {"<uuid>": ["cid-1", "cid-2"]}
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::ids::GroupId;

/// What a task asks the agent to do. Encoded as an integer on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum TaskKind {
    /// Start a new container; the agent replies with its container id.
    AddContainer = 1,
    /// Stop and remove an existing container.
    RemoveContainer = 2,
    /// Replace an existing container with a new version; the agent replies
    /// with the replacement's container id.
    UpdateContainer = 3,
}

impl TaskKind {
    /// Short lowercase label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AddContainer => "add_container",
            Self::RemoveContainer => "remove_container",
            Self::UpdateContainer => "update_container",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where and how a new container should run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Placement {
    /// Application version to deploy.
    pub version: String,
    /// IP of the host the container runs on.
    pub host: String,
    /// Port binding on that host.
    pub bind: u16,
    /// Whether the container runs the application's daemon command.
    pub daemon: bool,
}

/// One container lifecycle command addressed to one agent host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Application name.
    pub name: String,
    /// Owning user id.
    pub owner_id: i64,
    /// Command kind.
    pub kind: TaskKind,
    /// Application version (add/update).
    #[serde(default)]
    pub version: String,
    /// Target host IP (add/update).
    #[serde(default)]
    pub host: String,
    /// Port binding (add/update).
    #[serde(default)]
    pub bind: u16,
    /// Daemon flag (add/update).
    #[serde(default)]
    pub daemon: bool,
    /// Existing container id (remove/update).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

impl Task {
    /// Start a container for `name` as described by `placement`.
    pub fn add_container(name: impl Into<String>, owner_id: i64, placement: Placement) -> Self {
        Self {
            name: name.into(),
            owner_id,
            kind: TaskKind::AddContainer,
            version: placement.version,
            host: placement.host,
            bind: placement.bind,
            daemon: placement.daemon,
            container: None,
        }
    }

    /// Remove the container `container`.
    pub fn remove_container(
        name: impl Into<String>,
        owner_id: i64,
        container: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            owner_id,
            kind: TaskKind::RemoveContainer,
            version: String::new(),
            host: String::new(),
            bind: 0,
            daemon: false,
            container: Some(container.into()),
        }
    }

    /// Replace `container` with one described by `placement`.
    pub fn update_container(
        name: impl Into<String>,
        owner_id: i64,
        container: impl Into<String>,
        placement: Placement,
    ) -> Self {
        Self {
            name: name.into(),
            owner_id,
            kind: TaskKind::UpdateContainer,
            version: placement.version,
            host: placement.host,
            bind: placement.bind,
            daemon: placement.daemon,
            container: Some(container.into()),
        }
    }

    /// The key this task is batched under.
    pub fn key(&self) -> GroupKey {
        GroupKey {
            name: self.name.clone(),
            owner_id: self.owner_id,
            kind: self.kind,
        }
    }
}

/// Batching key: tasks with equal keys always travel in the same group.
///
/// The agent can only answer positionally per group, so a group must never
/// mix applications, owners, or kinds.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey {
    /// Application name.
    pub name: String,
    /// Owning user id.
    pub owner_id: i64,
    /// Command kind.
    pub kind: TaskKind,
}

/// A flushed group: the wire message sent to an agent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupedTask {
    /// Application name shared by every command.
    pub name: String,
    /// Owner id shared by every command.
    pub owner_id: i64,
    /// Kind shared by every command.
    pub kind: TaskKind,
    /// Correlation id, echoed back in the reply.
    pub id: GroupId,
    /// Commands in submission order.
    pub commands: Vec<Task>,
}

impl GroupedTask {
    /// Seal `commands` into a group under a freshly generated id.
    pub fn seal(key: GroupKey, commands: Vec<Task>) -> Self {
        Self {
            name: key.name,
            owner_id: key.owner_id,
            kind: key.kind,
            id: GroupId::new(),
            commands,
        }
    }

    /// The grouping key of this group.
    pub fn key(&self) -> GroupKey {
        GroupKey {
            name: self.name.clone(),
            owner_id: self.owner_id,
            kind: self.kind,
        }
    }

    /// Number of commands in the group.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether the group carries no commands.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Agent reply envelope: group id → results, one per command, same order.
///
/// Results are opaque JSON values; for add/update commands the agent sends
/// the new container id as a string.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskReply(HashMap<GroupId, Vec<Value>>);

impl TaskReply {
    /// An empty envelope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) the results for one group.
    pub fn insert(&mut self, id: GroupId, results: Vec<Value>) {
        let _ = self.0.insert(id, results);
    }

    /// Builder-style [`insert`](Self::insert).
    #[must_use]
    pub fn with(mut self, id: GroupId, results: Vec<Value>) -> Self {
        self.insert(id, results);
        self
    }

    /// Number of groups answered.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the envelope answers no group.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Results for one group, if present.
    pub fn get(&self, id: &str) -> Option<&[Value]> {
        self.0.get(id).map(Vec::as_slice)
    }
}

impl IntoIterator for TaskReply {
    type Item = (GroupId, Vec<Value>);
    type IntoIter = std::collections::hash_map::IntoIter<GroupId, Vec<Value>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl FromIterator<(GroupId, Vec<Value>)> for TaskReply {
    fn from_iter<I: IntoIterator<Item = (GroupId, Vec<Value>)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
