//! Row types.

use serde::{Deserialize, Serialize};

/// A deployable application version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    /// Row id; also the id reported to the proxy regeneration batch.
    pub id: i64,
    /// Application name.
    pub name: String,
    /// Version label.
    pub version: String,
    /// RFC 3339 creation time.
    pub created_at: String,
}

/// A managed host, identified by the IP its agent connects from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    /// Row id.
    pub id: i64,
    /// Agent IP address.
    pub ip: String,
    /// Optional display name.
    pub name: String,
}

/// A running container of an application on a host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    /// Row id.
    pub id: i64,
    /// Owning application version.
    pub app_id: i64,
    /// Application name, denormalized for proxy rendering.
    pub app_name: String,
    /// Host the container runs on.
    pub host_id: i64,
    /// Port bound on the host.
    pub bind: u16,
    /// Container id reported by the agent.
    pub cid: String,
    /// Whether this is the application's daemon container.
    pub daemon: bool,
    /// RFC 3339 creation time.
    pub created_at: String,
}

impl Application {
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            version: row.get(2)?,
            created_at: row.get(3)?,
        })
    }
}

impl Host {
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            ip: row.get(1)?,
            name: row.get(2)?,
        })
    }
}

impl Container {
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            app_id: row.get(1)?,
            app_name: row.get(2)?,
            host_id: row.get(3)?,
            bind: row.get(4)?,
            cid: row.get(5)?,
            daemon: row.get(6)?,
            created_at: row.get(7)?,
        })
    }
}
