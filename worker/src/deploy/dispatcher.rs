//! Deployment dispatcher
//!
//! Runs an application's tasks one at a time in ascending priority order and
//! stops at the first failure. Tasks that already succeeded are left as they
//! are; there is no rollback.

use std::sync::Arc;

use tracing::{error, info};

use crate::deploy::remote::RemoteExecutor;
use crate::deploy::webhook::HttpExecutor;
use crate::errors::TaskError;
use crate::models::application::{Application, Task, TaskPayload};

/// Routes tasks to their executors
pub struct Deployer {
    remote: Arc<dyn RemoteExecutor>,
    http: Arc<dyn HttpExecutor>,
}

impl Deployer {
    pub fn new(remote: Arc<dyn RemoteExecutor>, http: Arc<dyn HttpExecutor>) -> Self {
        Self { remote, http }
    }

    /// Deploy the application, returning the first task failure unchanged
    pub async fn deploy(&self, app: &Application) -> Result<(), TaskError> {
        let tasks = app.ordered_tasks();
        info!(
            "Deploying application {} ({}) with {} tasks",
            app.id,
            app.name,
            tasks.len()
        );

        for (index, task) in tasks.into_iter().enumerate() {
            info!(
                "Executing {} task {} (priority {})",
                task.kind(),
                index + 1,
                task.priority
            );

            if let Err(e) = self.execute(task).await {
                error!(
                    "Task with priority {} failed, stopping deployment: {}",
                    task.priority, e
                );
                return Err(e);
            }
        }

        Ok(())
    }

    async fn execute(&self, task: &Task) -> Result<(), TaskError> {
        match &task.payload {
            TaskPayload::RemoteCommand(ssh) => self.remote.execute(ssh).await,
            TaskPayload::Http(http) => self.http.execute(http).await,
        }
    }
}
