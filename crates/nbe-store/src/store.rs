//! The orchestration store seam and its `SQLite` implementation.

use chrono::Utc;
use rusqlite::{OptionalExtension, params};
use tracing::{debug, instrument};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Application, Container, Host};

/// Orchestration state the dispatcher reads and mutates.
///
/// Calls are synchronous and short; async callers may invoke them directly.
pub trait OrchestrationStore: Send + Sync {
    /// Look up an application version by `(name, version)`.
    fn application_by_name_and_version(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<Application>>;

    /// Look up an application version by id.
    fn application_by_id(&self, id: i64) -> Result<Option<Application>>;

    /// Get or create the application version `(name, version)`.
    fn register_application(&self, name: &str, version: &str) -> Result<Application>;

    /// Look up a host by agent IP.
    fn host_by_ip(&self, ip: &str) -> Result<Option<Host>>;

    /// Get or create the host for `ip`. An existing host keeps its name.
    fn ensure_host(&self, ip: &str, name: &str) -> Result<Host>;

    /// Look up a container by the agent-assigned container id.
    fn container_by_cid(&self, cid: &str) -> Result<Option<Container>>;

    /// Record a new container of `app` on `host`.
    fn new_container(
        &self,
        app: &Application,
        host: &Host,
        bind: u16,
        cid: &str,
        daemon: bool,
    ) -> Result<Container>;

    /// Delete a container record.
    fn delete_container(&self, container: &Container) -> Result<()>;

    /// Every container of the application version `app_id`, oldest first.
    fn containers_for_application(&self, app_id: i64) -> Result<Vec<Container>>;
}

const APPLICATION_COLUMNS: &str = "id, name, version, created_at";
const HOST_COLUMNS: &str = "id, ip, name";
const CONTAINER_COLUMNS: &str = "id, app_id, app_name, host_id, bind, cid, daemon, created_at";

/// [`OrchestrationStore`] over a shared [`Database`].
#[derive(Clone)]
pub struct SqliteStore {
    db: Database,
}

impl SqliteStore {
    /// Wrap a database.
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl OrchestrationStore for SqliteStore {
    #[instrument(skip(self))]
    fn application_by_name_and_version(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<Application>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {APPLICATION_COLUMNS} FROM applications WHERE name = ?1 AND version = ?2"
                    ),
                    params![name, version],
                    Application::from_row,
                )
                .optional()?)
        })
    }

    #[instrument(skip(self))]
    fn application_by_id(&self, id: i64) -> Result<Option<Application>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {APPLICATION_COLUMNS} FROM applications WHERE id = ?1"),
                    [id],
                    Application::from_row,
                )
                .optional()?)
        })
    }

    #[instrument(skip(self))]
    fn register_application(&self, name: &str, version: &str) -> Result<Application> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let _ = conn.execute(
                "INSERT OR IGNORE INTO applications (name, version, created_at) VALUES (?1, ?2, ?3)",
                params![name, version, now],
            )?;
            conn.query_row(
                &format!(
                    "SELECT {APPLICATION_COLUMNS} FROM applications WHERE name = ?1 AND version = ?2"
                ),
                params![name, version],
                Application::from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("application {name}:{version}")))
        })
    }

    #[instrument(skip(self))]
    fn host_by_ip(&self, ip: &str) -> Result<Option<Host>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {HOST_COLUMNS} FROM hosts WHERE ip = ?1"),
                    [ip],
                    Host::from_row,
                )
                .optional()?)
        })
    }

    #[instrument(skip(self))]
    fn ensure_host(&self, ip: &str, name: &str) -> Result<Host> {
        self.db.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO hosts (ip, name) VALUES (?1, ?2)",
                params![ip, name],
            )?;
            if inserted > 0 {
                debug!(ip, "host registered");
            }
            conn.query_row(
                &format!("SELECT {HOST_COLUMNS} FROM hosts WHERE ip = ?1"),
                [ip],
                Host::from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("host {ip}")))
        })
    }

    #[instrument(skip(self))]
    fn container_by_cid(&self, cid: &str) -> Result<Option<Container>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {CONTAINER_COLUMNS} FROM containers WHERE cid = ?1"),
                    [cid],
                    Container::from_row,
                )
                .optional()?)
        })
    }

    #[instrument(skip(self, app, host), fields(app_id = app.id, host_id = host.id))]
    fn new_container(
        &self,
        app: &Application,
        host: &Host,
        bind: u16,
        cid: &str,
        daemon: bool,
    ) -> Result<Container> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let _ = conn.execute(
                "INSERT INTO containers (app_id, app_name, host_id, bind, cid, daemon, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![app.id, app.name, host.id, bind, cid, daemon, now],
            )?;
            Ok(Container {
                id: conn.last_insert_rowid(),
                app_id: app.id,
                app_name: app.name.clone(),
                host_id: host.id,
                bind,
                cid: cid.to_string(),
                daemon,
                created_at: now,
            })
        })
    }

    #[instrument(skip(self, container), fields(cid = %container.cid))]
    fn delete_container(&self, container: &Container) -> Result<()> {
        self.db.with_conn(|conn| {
            let deleted = conn.execute("DELETE FROM containers WHERE id = ?1", [container.id])?;
            if deleted == 0 {
                return Err(StoreError::NotFound(format!("container {}", container.cid)));
            }
            Ok(())
        })
    }

    #[instrument(skip(self))]
    fn containers_for_application(&self, app_id: i64) -> Result<Vec<Container>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CONTAINER_COLUMNS} FROM containers WHERE app_id = ?1 ORDER BY id"
            ))?;
            let rows = stmt
                .query_map([app_id], Container::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn store() -> SqliteStore {
        SqliteStore::new(Database::in_memory().unwrap())
    }

    #[test]
    fn register_application_is_idempotent() {
        let store = store();
        let a = store.register_application("web", "v1").unwrap();
        let b = store.register_application("web", "v1").unwrap();
        assert_eq!(a.id, b.id);
        let c = store.register_application("web", "v2").unwrap();
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn application_lookups() {
        let store = store();
        let app = store.register_application("web", "v1").unwrap();
        assert_eq!(
            store.application_by_name_and_version("web", "v1").unwrap(),
            Some(app.clone())
        );
        assert_eq!(store.application_by_id(app.id).unwrap(), Some(app));
        assert!(store.application_by_name_and_version("web", "v9").unwrap().is_none());
        assert!(store.application_by_id(999).unwrap().is_none());
    }

    #[test]
    fn ensure_host_keeps_first_record() {
        let store = store();
        let first = store.ensure_host("10.0.0.1", "alpha").unwrap();
        let second = store.ensure_host("10.0.0.1", "").unwrap();
        assert_eq!(first, second);
        assert_eq!(second.name, "alpha");
        assert_eq!(store.host_by_ip("10.0.0.1").unwrap(), Some(first));
        assert!(store.host_by_ip("10.0.0.2").unwrap().is_none());
    }

    #[test]
    fn container_lifecycle() {
        let store = store();
        let app = store.register_application("web", "v1").unwrap();
        let host = store.ensure_host("10.0.0.1", "").unwrap();

        let c = store.new_container(&app, &host, 8000, "cid-1", true).unwrap();
        assert_eq!(c.app_name, "web");
        assert_eq!(c.bind, 8000);
        assert!(c.daemon);
        assert_eq!(store.container_by_cid("cid-1").unwrap(), Some(c.clone()));

        store.delete_container(&c).unwrap();
        assert!(store.container_by_cid("cid-1").unwrap().is_none());
        assert_matches!(store.delete_container(&c), Err(StoreError::NotFound(_)));
    }

    #[test]
    fn duplicate_cid_is_conflict() {
        let store = store();
        let app = store.register_application("web", "v1").unwrap();
        let host = store.ensure_host("10.0.0.1", "").unwrap();
        let _ = store.new_container(&app, &host, 8000, "dup", false).unwrap();
        assert_matches!(
            store.new_container(&app, &host, 8001, "dup", false),
            Err(StoreError::Conflict(_))
        );
    }

    #[test]
    fn containers_listed_in_insert_order() {
        let store = store();
        let app = store.register_application("web", "v1").unwrap();
        let other = store.register_application("api", "v1").unwrap();
        let host = store.ensure_host("10.0.0.1", "").unwrap();
        for (i, cid) in ["c1", "c2", "c3"].iter().enumerate() {
            let _ = store
                .new_container(&app, &host, 8000 + i as u16, cid, false)
                .unwrap();
        }
        let _ = store.new_container(&other, &host, 9000, "x", false).unwrap();

        let cids: Vec<String> = store
            .containers_for_application(app.id)
            .unwrap()
            .into_iter()
            .map(|c| c.cid)
            .collect();
        assert_eq!(cids, vec!["c1", "c2", "c3"]);
    }
}
