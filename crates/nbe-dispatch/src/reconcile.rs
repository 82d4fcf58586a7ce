//! Applying correlated agent replies to orchestration state.

use std::sync::Arc;

use async_trait::async_trait;
use nbe_core::{Task, TaskKind};
use nbe_store::{Application, OrchestrationStore};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::assets::{StaticAssets, StaticLayout};

/// Consumer of correlated `(task, result)` pairs.
#[async_trait]
pub trait ReplySink: Send + Sync {
    /// Apply one group's results, `results[i]` answering `tasks[i]`.
    ///
    /// Returns the id of the application the group completed work for, if
    /// any step resolved one.
    async fn reconcile(&self, tasks: &[Task], results: &[Value]) -> Option<i64>;
}

/// [`ReplySink`] that maintains container records and publishes static
/// assets.
pub struct ContainerReconciler {
    store: Arc<dyn OrchestrationStore>,
    assets: Arc<dyn StaticAssets>,
    layout: StaticLayout,
}

impl ContainerReconciler {
    /// Build a reconciler.
    pub fn new(
        store: Arc<dyn OrchestrationStore>,
        assets: Arc<dyn StaticAssets>,
        layout: StaticLayout,
    ) -> Self {
        Self {
            store,
            assets,
            layout,
        }
    }

    fn add_container(&self, task: &Task, result: &Value) -> Option<Application> {
        let Some(cid) = result.as_str() else {
            warn!(name = %task.name, ?result, "container id is not a string, skipping");
            return None;
        };
        let app = match self
            .store
            .application_by_name_and_version(&task.name, &task.version)
        {
            Ok(Some(app)) => app,
            Ok(None) => {
                warn!(name = %task.name, version = %task.version, "application gone, skipping");
                return None;
            }
            Err(e) => {
                warn!(name = %task.name, error = %e, "application lookup failed");
                return None;
            }
        };
        let host = match self.store.host_by_ip(&task.host) {
            Ok(Some(host)) => host,
            Ok(None) => {
                warn!(host = %task.host, "host gone, skipping");
                return None;
            }
            Err(e) => {
                warn!(host = %task.host, error = %e, "host lookup failed");
                return None;
            }
        };
        match self
            .store
            .new_container(&app, &host, task.bind, cid, task.daemon)
        {
            Ok(container) => {
                debug!(cid, app_id = app.id, host = %host.ip, id = container.id, "container recorded");
                Some(app)
            }
            Err(e) => {
                warn!(cid, error = %e, "failed to record container");
                None
            }
        }
    }

    fn remove_container(&self, task: &Task) -> Option<Application> {
        let cid = task.container.as_deref()?;
        let container = match self.store.container_by_cid(cid) {
            Ok(Some(container)) => container,
            Ok(None) => {
                warn!(cid, "container already gone, skipping");
                return None;
            }
            Err(e) => {
                warn!(cid, error = %e, "container lookup failed");
                return None;
            }
        };
        let app = self.store.application_by_id(container.app_id).ok().flatten();
        if let Err(e) = self.store.delete_container(&container) {
            warn!(cid, error = %e, "failed to delete container");
            return None;
        }
        debug!(cid, "container deleted");
        app
    }

    async fn publish_assets(&self, app: &Application) {
        let dst = self.layout.destination(&app.name, &app.version);
        let src = self.layout.source(&app.name, &app.version);
        match self.assets.copy_tree(&dst, &src).await {
            Ok(files) => info!(app = %app.name, version = %app.version, files, "static assets published"),
            Err(e) => warn!(app = %app.name, version = %app.version, error = %e, "static asset copy failed"),
        }
    }
}

#[async_trait]
impl ReplySink for ContainerReconciler {
    async fn reconcile(&self, tasks: &[Task], results: &[Value]) -> Option<i64> {
        let mut resolved: Option<Application> = None;

        for (task, result) in tasks.iter().zip(results) {
            let app = match task.kind {
                TaskKind::AddContainer => self.add_container(task, result),
                TaskKind::RemoveContainer => self.remove_container(task),
                TaskKind::UpdateContainer => {
                    let removed = task
                        .container
                        .as_ref()
                        .and_then(|_| self.remove_container(task));
                    // a completed delete still changes routing
                    self.add_container(task, result).or(removed)
                }
            };
            if app.is_some() {
                resolved = app;
            }
        }

        let app = resolved?;
        self.publish_assets(&app).await;
        Some(app.id)
    }
}
