//! Reverse proxy regeneration after applications change.

use std::collections::BTreeSet;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

/// Why a regeneration failed.
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    /// No program configured.
    #[error("regeneration command is empty")]
    EmptyCommand,
    /// The program could not be started.
    #[error("failed to run {program}: {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The program exited unsuccessfully.
    #[error("{program} exited with {code:?}: {stderr}")]
    Failed {
        /// Program that failed.
        program: String,
        /// Exit code, if it exited normally.
        code: Option<i32>,
        /// Captured standard error, trimmed.
        stderr: String,
    },
}

/// Rebuilds routing for a batch of changed applications.
#[async_trait]
pub trait RegenerationTrigger: Send + Sync {
    /// Regenerate for the given application ids. Called once per batch.
    async fn regenerate(&self, app_ids: &BTreeSet<i64>) -> Result<(), TriggerError>;
}

/// Runs a fixed command, e.g. `nginx -s reload`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandTrigger {
    program: String,
    args: Vec<String>,
}

impl CommandTrigger {
    /// Use `command[0]` as the program and the rest as its arguments.
    pub fn new(command: &[String]) -> Result<Self, TriggerError> {
        let (program, args) = command.split_first().ok_or(TriggerError::EmptyCommand)?;
        if program.is_empty() {
            return Err(TriggerError::EmptyCommand);
        }
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl RegenerationTrigger for CommandTrigger {
    async fn regenerate(&self, app_ids: &BTreeSet<i64>) -> Result<(), TriggerError> {
        debug!(program = %self.program, ?app_ids, "regenerating proxy");
        let output = Command::new(&self.program)
            .args(&self.args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| TriggerError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(TriggerError::Failed {
                program: self.program.clone(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        info!(program = %self.program, apps = app_ids.len(), "proxy regenerated");
        Ok(())
    }
}
