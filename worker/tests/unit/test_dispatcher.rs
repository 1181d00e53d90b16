//! Dispatcher tests with recording executors

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use deployd::deploy::dispatcher::Deployer;
use deployd::deploy::remote::RemoteExecutor;
use deployd::deploy::webhook::HttpExecutor;
use deployd::errors::{FailureKind, TaskError};
use deployd::models::application::{
    Application, HttpTask, RemoteCommandTask, Task, TaskPayload,
};

/// Records every call and fails the ones whose label is listed
#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<String>>,
    failures: HashMap<String, FailureKind>,
}

impl Recorder {
    fn failing(failures: &[(&str, FailureKind)]) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failures: failures
                .iter()
                .map(|(label, kind)| (label.to_string(), *kind))
                .collect(),
        }
    }

    fn call(&self, label: &str) -> Result<(), TaskError> {
        self.calls.lock().unwrap().push(label.to_string());
        match self.failures.get(label) {
            Some(FailureKind::Recoverable) => Err(TaskError::recoverable(label)),
            Some(FailureKind::Unrecoverable) => Err(TaskError::unrecoverable(label)),
            None => Ok(()),
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteExecutor for Recorder {
    async fn execute(&self, task: &RemoteCommandTask) -> Result<(), TaskError> {
        self.call(&task.command)
    }
}

#[async_trait]
impl HttpExecutor for Recorder {
    async fn execute(&self, task: &HttpTask) -> Result<(), TaskError> {
        self.call(&task.url)
    }
}

fn ssh(priority: u32, command: &str) -> Task {
    Task::new(
        priority,
        TaskPayload::RemoteCommand(RemoteCommandTask {
            username: "deploy".to_string(),
            host: "app-1.internal".to_string(),
            port: 22,
            command: command.to_string(),
            fingerprint: "SHA256:47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU".to_string(),
        }),
    )
}

fn http(priority: u32, url: &str) -> Task {
    Task::new(
        priority,
        TaskPayload::Http(HttpTask {
            method: "POST".to_string(),
            url: url.to_string(),
            headers: HashMap::new(),
            body: None,
        }),
    )
}

fn app_with(tasks: Vec<Task>) -> Application {
    let (mut app, _) = Application::new(1, "api", Vec::new());
    // Bypass normalization to control the stored order
    app.tasks = tasks;
    app
}

#[tokio::test]
async fn test_runs_all_tasks_in_priority_order() {
    let remote = Arc::new(Recorder::default());
    let hooks = Arc::new(Recorder::default());
    let deployer = Deployer::new(remote.clone(), hooks.clone());

    let app = app_with(vec![
        http(2, "notify"),
        ssh(0, "git pull"),
        ssh(1, "systemctl restart api"),
    ]);
    deployer.deploy(&app).await.unwrap();

    assert_eq!(remote.calls(), vec!["git pull", "systemctl restart api"]);
    assert_eq!(hooks.calls(), vec!["notify"]);
}

#[tokio::test]
async fn test_stops_at_first_failure() {
    let remote = Arc::new(Recorder::failing(&[("migrate", FailureKind::Recoverable)]));
    let hooks = Arc::new(Recorder::default());
    let deployer = Deployer::new(remote.clone(), hooks.clone());

    // P0 succeeds, P1 fails, P2 must never run
    let app = app_with(vec![ssh(0, "pull"), ssh(1, "migrate"), http(2, "notify")]);
    let err = deployer.deploy(&app).await.unwrap_err();

    assert_eq!(err.kind, FailureKind::Recoverable);
    assert_eq!(err.message, "migrate");
    assert_eq!(remote.calls(), vec!["pull", "migrate"]);
    assert!(hooks.calls().is_empty());
}

#[tokio::test]
async fn test_failure_kind_is_passed_through() {
    let remote = Arc::new(Recorder::default());
    let hooks = Arc::new(Recorder::failing(&[("https://bad", FailureKind::Unrecoverable)]));
    let deployer = Deployer::new(remote.clone(), hooks.clone());

    let app = app_with(vec![http(0, "https://bad"), ssh(1, "restart")]);
    let err = deployer.deploy(&app).await.unwrap_err();

    assert_eq!(err.kind, FailureKind::Unrecoverable);
    assert!(remote.calls().is_empty());
}

#[tokio::test]
async fn test_application_without_tasks_succeeds() {
    let remote = Arc::new(Recorder::default());
    let hooks = Arc::new(Recorder::default());
    let deployer = Deployer::new(remote.clone(), hooks.clone());

    deployer.deploy(&app_with(Vec::new())).await.unwrap();
    assert!(remote.calls().is_empty());
    assert!(hooks.calls().is_empty());
}

#[tokio::test]
async fn test_each_task_runs_once() {
    let remote = Arc::new(Recorder::default());
    let hooks = Arc::new(Recorder::default());
    let deployer = Deployer::new(remote.clone(), hooks.clone());

    let app = app_with((0..10).map(|p| ssh(p, &format!("step-{}", p))).collect());
    deployer.deploy(&app).await.unwrap();

    let calls = remote.calls();
    assert_eq!(calls.len(), 10);
    assert_eq!(calls.iter().collect::<HashSet<_>>().len(), 10);
}
