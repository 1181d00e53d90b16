//! Queue consumer tests with in-memory queue and store

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use deployd::deploy::dispatcher::Deployer;
use deployd::deploy::remote::RemoteExecutor;
use deployd::deploy::webhook::{self, HttpExecutor, WebhookExecutor};
use deployd::errors::{TaskError, WorkerError};
use deployd::models::application::{Application, HttpTask, RemoteCommandTask, Task, TaskPayload};
use deployd::models::job::DeployJob;
use deployd::queue::{Acker, Delivery, Messenger, Subscription, APP_DEPLOY_QUEUE};
use deployd::storage::applications::ApplicationStore;
use deployd::workers::consumer::{self, Consumer, DropReason, JobOutcome, Options, RetryStatus};

// ================================= FAKES ===================================== //

#[derive(Default)]
struct MemoryStore {
    apps: Mutex<HashMap<u64, Application>>,
    fail_loads: bool,
}

impl MemoryStore {
    fn with(apps: Vec<Application>) -> Self {
        Self {
            apps: Mutex::new(apps.into_iter().map(|a| (a.id, a)).collect()),
            fail_loads: false,
        }
    }

    fn get(&self, id: u64) -> Application {
        self.apps.lock().unwrap().get(&id).cloned().unwrap()
    }
}

#[async_trait]
impl ApplicationStore for MemoryStore {
    async fn load_application_with_tasks(&self, id: u64) -> Result<Option<Application>, WorkerError> {
        if self.fail_loads {
            return Err(WorkerError::StorageError("database unavailable".to_string()));
        }
        Ok(self.apps.lock().unwrap().get(&id).cloned())
    }

    async fn save_application(&self, app: &Application) -> Result<(), WorkerError> {
        self.apps.lock().unwrap().insert(app.id, app.clone());
        Ok(())
    }
}

/// Broker-side events in the order they happened
type EventLog = Arc<Mutex<Vec<&'static str>>>;

struct RecordingMessenger {
    published: Mutex<Vec<(String, DeployJob)>>,
    events: EventLog,
    offline: AtomicBool,
}

impl RecordingMessenger {
    fn new(events: EventLog) -> Self {
        Self {
            published: Mutex::new(Vec::new()),
            events,
            offline: AtomicBool::new(false),
        }
    }

    fn published(&self) -> Vec<(String, DeployJob)> {
        self.published.lock().unwrap().clone()
    }

    fn go_offline(&self) {
        self.offline.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Messenger for RecordingMessenger {
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<(), WorkerError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(WorkerError::MqttError("connection closed".to_string()));
        }
        let job = DeployJob::decode(&payload)?;
        self.published.lock().unwrap().push((queue.to_string(), job));
        self.events.lock().unwrap().push("publish");
        Ok(())
    }
}

struct CountingAcker {
    acks: Arc<AtomicUsize>,
    events: EventLog,
}

#[async_trait]
impl Acker for CountingAcker {
    async fn ack(self: Box<Self>) -> Result<(), WorkerError> {
        self.acks.fetch_add(1, Ordering::SeqCst);
        self.events.lock().unwrap().push("ack");
        Ok(())
    }
}

/// Executor returning a fixed result for every task
struct Scripted(Option<TaskError>);

impl Scripted {
    fn result(&self) -> Result<(), TaskError> {
        match &self.0 {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteExecutor for Scripted {
    async fn execute(&self, _task: &RemoteCommandTask) -> Result<(), TaskError> {
        self.result()
    }
}

#[async_trait]
impl HttpExecutor for Scripted {
    async fn execute(&self, _task: &HttpTask) -> Result<(), TaskError> {
        self.result()
    }
}

struct ChannelSubscription {
    rx: mpsc::UnboundedReceiver<Delivery>,
}

#[async_trait]
impl Subscription for ChannelSubscription {
    async fn next_delivery(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

// ================================ HELPERS ==================================== //

struct Harness {
    consumer: Consumer,
    store: Arc<MemoryStore>,
    messenger: Arc<RecordingMessenger>,
    acks: Arc<AtomicUsize>,
    events: EventLog,
}

impl Harness {
    fn new(store: MemoryStore, http: Arc<dyn HttpExecutor>, options: Options) -> Self {
        let store = Arc::new(store);
        let events = EventLog::default();
        let messenger = Arc::new(RecordingMessenger::new(events.clone()));
        let deployer = Arc::new(Deployer::new(Arc::new(Scripted(None)), http));
        let consumer = Consumer::new(options, store.clone(), deployer, messenger.clone());
        Self {
            consumer,
            store,
            messenger,
            acks: Arc::new(AtomicUsize::new(0)),
            events,
        }
    }

    fn with_result(result: Option<TaskError>) -> Self {
        Self::new(
            MemoryStore::with(vec![application(1)]),
            Arc::new(Scripted(result)),
            fast_options(),
        )
    }

    fn delivery(&self, payload: Vec<u8>) -> Delivery {
        Delivery::new(
            payload,
            Box::new(CountingAcker {
                acks: self.acks.clone(),
                events: self.events.clone(),
            }),
        )
    }

    async fn handle(&self, job: &DeployJob) -> JobOutcome {
        self.consumer
            .handle(self.delivery(job.encode().unwrap()))
            .await
    }

    fn acks(&self) -> usize {
        self.acks.load(Ordering::SeqCst)
    }

    fn events(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().clone()
    }
}

fn fast_options() -> Options {
    Options {
        retry_backoff: Duration::from_millis(10),
        ..Default::default()
    }
}

fn application(id: u64) -> Application {
    let task = Task::new(
        0,
        TaskPayload::Http(HttpTask {
            method: "GET".to_string(),
            url: "http://127.0.0.1:1/deploy".to_string(),
            headers: HashMap::new(),
            body: None,
        }),
    );
    let (mut app, _) = Application::new(id, "api", vec![task]);
    app.latest_version = "1.0.0".to_string();
    app.latest_commit = "aaaaaaa".to_string();
    app
}

fn job(id: u64, attempt: u64) -> DeployJob {
    DeployJob {
        id,
        attempt,
        commit: Some("bbbbbbb".to_string()),
        version: Some("1.1.0".to_string()),
    }
}

// ================================= TESTS ===================================== //

#[tokio::test]
async fn test_success_records_deployment() {
    let harness = Harness::with_result(None);

    let outcome = harness.handle(&job(1, 0)).await;

    assert_eq!(outcome, JobOutcome::Succeeded);
    assert_eq!(harness.acks(), 1);
    let app = harness.store.get(1);
    assert_eq!(app.latest_version, "1.1.0");
    assert_eq!(app.latest_commit, "bbbbbbb");
    assert!(app.last_deployed_at.is_some());

    harness.consumer.drain_retries().await;
    assert!(harness.messenger.published().is_empty());
}

#[tokio::test]
async fn test_success_without_version_keeps_previous() {
    let harness = Harness::with_result(None);

    let outcome = harness.handle(&DeployJob::new(1)).await;

    assert_eq!(outcome, JobOutcome::Succeeded);
    let app = harness.store.get(1);
    assert_eq!(app.latest_version, "1.0.0");
    assert_eq!(app.latest_commit, "aaaaaaa");
    assert!(app.last_deployed_at.is_some());
}

#[tokio::test]
async fn test_recoverable_failure_republishes_next_attempt() {
    let harness = Harness::with_result(Some(TaskError::recoverable("connection refused")));

    let outcome = harness.handle(&job(1, 0)).await;

    assert_eq!(outcome, JobOutcome::RetryScheduled(job(1, 1)));

    let settled = harness.consumer.drain_retries().await;
    assert_eq!(settled, vec![RetryStatus::Republished(job(1, 1))]);
    assert_eq!(
        harness.messenger.published(),
        vec![(APP_DEPLOY_QUEUE.to_string(), job(1, 1))]
    );
    assert_eq!(harness.acks(), 1);
    assert_eq!(harness.store.get(1).latest_version, "1.0.0");
}

#[tokio::test(start_paused = true)]
async fn test_retry_publishes_before_acknowledging() {
    let harness = Harness::new(
        MemoryStore::with(vec![application(1)]),
        Arc::new(Scripted(Some(TaskError::recoverable("502")))),
        Options::default(),
    );

    harness.handle(&job(1, 0)).await;

    // Nothing reaches the broker during the backoff
    assert!(harness.events().is_empty());

    tokio::time::advance(consumer::RETRY_BACKOFF).await;
    harness.consumer.drain_retries().await;

    assert_eq!(harness.events(), vec!["publish", "ack"]);
}

#[tokio::test]
async fn test_failed_republish_leaves_message_unacknowledged() {
    let harness = Harness::with_result(Some(TaskError::recoverable("connection reset")));
    harness.messenger.go_offline();

    let outcome = harness.handle(&job(1, 2)).await;
    assert_eq!(outcome, JobOutcome::RetryScheduled(job(1, 3)));

    let settled = harness.consumer.drain_retries().await;

    assert_eq!(settled, vec![RetryStatus::Lost(job(1, 3))]);
    assert_eq!(harness.acks(), 0);
    assert!(harness.events().is_empty());
    assert!(harness.messenger.published().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_retry_does_not_block_the_consumer() {
    let harness = Harness::new(
        MemoryStore::with(vec![application(1), application(2)]),
        Arc::new(Scripted(Some(TaskError::recoverable("503")))),
        Options::default(),
    );

    harness.handle(&job(1, 0)).await;
    harness.handle(&job(2, 3)).await;

    // Both handled before the backoff elapsed
    assert_eq!(harness.acks(), 0);
    assert_eq!(harness.consumer.pending_retries(), 2);
    assert!(harness.messenger.published().is_empty());

    tokio::time::advance(consumer::RETRY_BACKOFF).await;
    harness.consumer.drain_retries().await;

    let mut attempts: Vec<(u64, u64)> = harness
        .messenger
        .published()
        .into_iter()
        .map(|(_, job)| (job.id, job.attempt))
        .collect();
    attempts.sort();
    assert_eq!(attempts, vec![(1, 1), (2, 4)]);
    assert_eq!(harness.acks(), 2);
    assert_eq!(harness.consumer.pending_retries(), 0);
}

#[tokio::test]
async fn test_max_attempts_drops_job() {
    let harness = Harness::with_result(Some(TaskError::recoverable("timeout")));

    // Attempts 0..=4 are retried
    let outcome = harness.handle(&job(1, 4)).await;
    assert_eq!(outcome, JobOutcome::RetryScheduled(job(1, 5)));

    let outcome = harness.handle(&job(1, 5)).await;
    assert_eq!(outcome, JobOutcome::Dropped(DropReason::MaxAttemptsReached));

    harness.consumer.drain_retries().await;
    assert_eq!(harness.messenger.published().len(), 1);
    assert_eq!(harness.acks(), 2);
}

#[tokio::test]
async fn test_unrecoverable_failure_is_dropped() {
    let harness = Harness::with_result(Some(TaskError::unrecoverable("fingerprint mismatch")));

    let outcome = harness.handle(&job(1, 0)).await;

    assert_eq!(outcome, JobOutcome::Dropped(DropReason::Unrecoverable));
    assert_eq!(harness.acks(), 1);
    harness.consumer.drain_retries().await;
    assert!(harness.messenger.published().is_empty());
    assert_eq!(harness.store.get(1).latest_version, "1.0.0");
}

#[tokio::test]
async fn test_malformed_message_is_acked_and_dropped() {
    let harness = Harness::with_result(None);

    let payloads: [&[u8]; 3] = [b"not json", br#"{"attempt": 1}"#, br#"{"id": -4}"#];
    for payload in payloads {
        let outcome = harness.consumer.handle(harness.delivery(payload.to_vec())).await;
        assert_eq!(outcome, JobOutcome::Dropped(DropReason::Malformed));
    }

    assert_eq!(harness.acks(), 3);
    assert!(harness.messenger.published().is_empty());
}

#[tokio::test]
async fn test_unknown_application_is_dropped() {
    let harness = Harness::with_result(None);

    let outcome = harness.handle(&job(42, 0)).await;

    assert_eq!(outcome, JobOutcome::Dropped(DropReason::ApplicationUnavailable));
    assert_eq!(harness.acks(), 1);
}

#[tokio::test]
async fn test_store_failure_is_dropped() {
    let store = MemoryStore {
        fail_loads: true,
        ..Default::default()
    };
    let harness = Harness::new(store, Arc::new(Scripted(None)), fast_options());

    let outcome = harness.handle(&job(1, 0)).await;

    assert_eq!(outcome, JobOutcome::Dropped(DropReason::ApplicationUnavailable));
    assert_eq!(harness.acks(), 1);
}

#[tokio::test]
async fn test_unreachable_webhook_end_to_end() {
    let http = WebhookExecutor::new(&webhook::Options {
        timeout: Duration::from_secs(5),
    })
    .unwrap();
    let harness = Harness::new(
        MemoryStore::with(vec![application(1)]),
        Arc::new(http),
        fast_options(),
    );

    let outcome = harness
        .handle(&DeployJob {
            id: 1,
            attempt: 0,
            commit: None,
            version: None,
        })
        .await;

    assert_eq!(outcome, JobOutcome::RetryScheduled(DeployJob::new(1).next_attempt()));

    harness.consumer.drain_retries().await;
    assert_eq!(harness.acks(), 1);
    let published = harness.messenger.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].1.id, 1);
    assert_eq!(published[0].1.attempt, 1);
    assert_eq!(harness.store.get(1).latest_version, "1.0.0");
}

#[tokio::test]
async fn test_run_processes_until_shutdown() {
    let harness = Harness::with_result(None);
    let (tx, rx) = mpsc::unbounded_channel();
    let mut subscription = ChannelSubscription { rx };

    tx.send(harness.delivery(job(1, 0).encode().unwrap())).unwrap();
    tx.send(harness.delivery(b"garbage".to_vec())).unwrap();

    let acks = harness.acks.clone();
    let run = consumer::run(
        &harness.consumer,
        &mut subscription,
        Box::pin(async move {
            // Shut down once both messages are acknowledged
            while acks.load(Ordering::SeqCst) < 2 {
                tokio::task::yield_now().await;
            }
        }),
    );

    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("consumer did not stop");

    assert_eq!(harness.acks(), 2);
    assert_eq!(harness.store.get(1).latest_version, "1.1.0");
}

#[tokio::test]
async fn test_run_stops_when_subscription_closes() {
    let harness = Harness::with_result(None);
    let (tx, rx) = mpsc::unbounded_channel();
    let mut subscription = ChannelSubscription { rx };

    tx.send(harness.delivery(job(1, 0).encode().unwrap())).unwrap();
    drop(tx);

    tokio::time::timeout(
        Duration::from_secs(5),
        consumer::run(
            &harness.consumer,
            &mut subscription,
            Box::pin(std::future::pending::<()>()),
        ),
    )
    .await
    .expect("consumer did not stop");

    assert_eq!(harness.acks(), 1);
}
