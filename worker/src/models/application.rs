//! Application and task models

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::{generate_token, sha256_hash};

/// A registered application and its deployment tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    /// Unique application ID
    pub id: u64,

    /// Display name
    pub name: String,

    /// Free-form description
    #[serde(default)]
    pub description: String,

    /// SHA-256 hash of the deploy secret
    #[serde(default)]
    pub secret: String,

    /// Latest successfully deployed version
    #[serde(default)]
    pub latest_version: String,

    /// Latest successfully deployed commit
    #[serde(default)]
    pub latest_commit: String,

    /// Time of the last successful deployment
    #[serde(default)]
    pub last_deployed_at: Option<DateTime<Utc>>,

    /// Deployment tasks, unique priorities
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl Application {
    /// Create an application, normalizing the priorities of the given tasks.
    ///
    /// Returns the application together with the raw deploy secret, which is
    /// only ever stored hashed.
    pub fn new(id: u64, name: impl Into<String>, tasks: Vec<Task>) -> (Self, String) {
        let mut app = Self {
            id,
            name: name.into(),
            description: String::new(),
            secret: String::new(),
            latest_version: String::new(),
            latest_commit: String::new(),
            last_deployed_at: None,
            tasks: normalize_priorities(tasks),
        };
        let raw_secret = app.rotate_secret();
        (app, raw_secret)
    }

    /// Tasks in execution order (ascending priority, stable)
    pub fn ordered_tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.iter().collect();
        tasks.sort_by_key(|task| task.priority);
        tasks
    }

    /// Generate a new deploy secret and store its hash
    pub fn rotate_secret(&mut self) -> String {
        let raw = generate_token();
        self.secret = sha256_hash(raw.as_bytes());
        raw
    }

    /// Check a raw deploy secret against the stored hash
    pub fn verify_secret(&self, raw: &str) -> bool {
        !self.secret.is_empty() && self.secret == sha256_hash(raw.as_bytes())
    }

    /// Record a successful deployment
    pub fn mark_deployed(
        &mut self,
        commit: Option<&str>,
        version: Option<&str>,
        deployed_at: DateTime<Utc>,
    ) {
        if let Some(commit) = commit {
            self.latest_commit = commit.to_string();
        }
        if let Some(version) = version {
            self.latest_version = version.to_string();
        }
        self.last_deployed_at = Some(deployed_at);
    }
}

/// A single deployment step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Ordering key, unique within an application
    pub priority: u32,

    #[serde(flatten)]
    pub payload: TaskPayload,
}

impl Task {
    pub fn new(priority: u32, payload: TaskPayload) -> Self {
        Self { priority, payload }
    }

    /// Short label for logs
    pub fn kind(&self) -> &'static str {
        match self.payload {
            TaskPayload::RemoteCommand(_) => "ssh",
            TaskPayload::Http(_) => "http",
        }
    }
}

/// Task variant, exactly one per task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TaskPayload {
    #[serde(rename = "ssh")]
    RemoteCommand(RemoteCommandTask),

    #[serde(rename = "http")]
    Http(HttpTask),
}

/// Run a command on a remote host over SSH
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteCommandTask {
    pub username: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub command: String,

    /// Pinned host key fingerprint, `SHA256:<base64>`
    pub fingerprint: String,
}

fn default_ssh_port() -> u16 {
    22
}

/// Send an HTTP request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpTask {
    pub method: String,
    pub url: String,

    /// Header values are expected to be JSON strings; anything else fails the task
    #[serde(default)]
    pub headers: HashMap<String, serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// Resolve priority collisions and sort tasks into execution order.
///
/// Tasks are stably sorted by their requested priority, then each one is given
/// `max(requested, previous + 1)`. Equal priorities are therefore promoted in
/// submission order, and a promotion can cascade into the next priority.
pub fn normalize_priorities(mut tasks: Vec<Task>) -> Vec<Task> {
    tasks.sort_by_key(|task| task.priority);

    let mut previous: Option<u32> = None;
    for task in tasks.iter_mut() {
        if let Some(prev) = previous {
            task.priority = task.priority.max(prev.saturating_add(1));
        }
        previous = Some(task.priority);
    }

    tasks
}
