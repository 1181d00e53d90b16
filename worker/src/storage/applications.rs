//! Application persistence

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::errors::WorkerError;
use crate::filesys::file::File;
use crate::models::application::Application;

/// Loads and saves applications for the consumer
#[async_trait]
pub trait ApplicationStore: Send + Sync {
    /// The application with its tasks, or `None` if it does not exist
    async fn load_application_with_tasks(&self, id: u64) -> Result<Option<Application>, WorkerError>;

    /// Insert or replace the application with the same ID
    async fn save_application(&self, app: &Application) -> Result<(), WorkerError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ApplicationsFile {
    #[serde(default)]
    applications: Vec<Application>,
}

/// Application store kept in a single JSON document
pub struct JsonFileStore {
    file: File,
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: File::new(path),
            lock: Mutex::new(()),
        }
    }

    async fn read(&self) -> Result<ApplicationsFile, WorkerError> {
        if !self.file.exists().await {
            return Ok(ApplicationsFile::default());
        }
        self.file.read_json().await.map_err(|e| {
            WorkerError::StorageError(format!(
                "Failed to read {}: {}",
                self.file.path().display(),
                e
            ))
        })
    }

    /// All stored applications
    pub async fn list_applications(&self) -> Result<Vec<Application>, WorkerError> {
        let _guard = self.lock.lock().await;
        Ok(self.read().await?.applications)
    }
}

#[async_trait]
impl ApplicationStore for JsonFileStore {
    async fn load_application_with_tasks(&self, id: u64) -> Result<Option<Application>, WorkerError> {
        let _guard = self.lock.lock().await;
        let contents = self.read().await?;
        Ok(contents.applications.into_iter().find(|app| app.id == id))
    }

    async fn save_application(&self, app: &Application) -> Result<(), WorkerError> {
        let _guard = self.lock.lock().await;
        let mut contents = self.read().await?;

        match contents.applications.iter_mut().find(|a| a.id == app.id) {
            Some(existing) => *existing = app.clone(),
            None => contents.applications.push(app.clone()),
        }

        self.file.write_json(&contents).await?;
        debug!("Saved application {}", app.id);
        Ok(())
    }
}
