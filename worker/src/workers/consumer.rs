//! Queue consumer for deployment jobs
//!
//! Each delivery goes through `Received -> Running -> {Succeeded,
//! RetryScheduled, Dropped}` and is acknowledged at most once. Finished and
//! dropped jobs are acknowledged right away. Recoverable failures are
//! republished with `attempt + 1` after a fixed backoff, and the original
//! delivery is acknowledged only once the republish went through. The retry
//! owns the delivery and runs on its own timer task so the receive loop moves
//! on to the next message immediately. A retry that cannot be published leaves
//! the message unacknowledged so the broker redelivers it.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};

use crate::deploy::dispatcher::Deployer;
use crate::deploy::fsm::{JobEvent, JobFsm, JobState};
use crate::errors::FailureKind;
use crate::models::job::DeployJob;
use crate::queue::{Delivery, Messenger, Subscription, APP_DEPLOY_QUEUE};
use crate::storage::applications::ApplicationStore;

/// Attempts after which a recoverable failure is no longer retried
pub const MAX_ATTEMPTS: u64 = 5;

/// Delay before a postponed job is republished
pub const RETRY_BACKOFF: Duration = Duration::from_secs(3);

/// Consumer options
#[derive(Debug, Clone)]
pub struct Options {
    /// Queue consumed and republished to
    pub queue: String,

    pub max_attempts: u64,

    pub retry_backoff: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            queue: APP_DEPLOY_QUEUE.to_string(),
            max_attempts: MAX_ATTEMPTS,
            retry_backoff: RETRY_BACKOFF,
        }
    }
}

/// Why a job was abandoned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Payload could not be decoded
    Malformed,

    /// Application does not exist or could not be loaded
    ApplicationUnavailable,

    /// A task failed in a way retrying cannot fix
    Unrecoverable,

    /// Recoverable failure on the last allowed attempt
    MaxAttemptsReached,

    /// The follow-up message could not be built
    RetryFailed,
}

/// Final result of handling one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    RetryScheduled(DeployJob),
    Dropped(DropReason),
}

/// How a scheduled retry ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryStatus {
    /// Follow-up published and the original delivery acknowledged
    Republished(DeployJob),

    /// Follow-up not published; the original delivery stays unacknowledged
    Lost(DeployJob),
}

/// What to do with a delivery once it has been processed
enum Settlement {
    Ack,
    Republish(Vec<u8>),
}

/// Turns job messages into deployments
pub struct Consumer {
    options: Options,
    store: Arc<dyn ApplicationStore>,
    deployer: Arc<Deployer>,
    messenger: Arc<dyn Messenger>,
    retries: Mutex<JoinSet<RetryStatus>>,
}

impl Consumer {
    pub fn new(
        options: Options,
        store: Arc<dyn ApplicationStore>,
        deployer: Arc<Deployer>,
        messenger: Arc<dyn Messenger>,
    ) -> Self {
        Self {
            options,
            store,
            deployer,
            messenger,
            retries: Mutex::new(JoinSet::new()),
        }
    }

    /// Process a delivery and settle it
    ///
    /// Postponed jobs are acknowledged by their retry task after the follow-up
    /// message is published; every other outcome is acknowledged here.
    pub async fn handle(&self, delivery: Delivery) -> JobOutcome {
        let span = tracing::info_span!(
            "job",
            delivery = %uuid::Uuid::new_v4(),
            app_id = tracing::field::Empty,
            attempt = tracing::field::Empty,
        );

        async move {
            info!("Received a message");
            debug!("Message body: {}", String::from_utf8_lossy(delivery.payload()));

            let (outcome, settlement) = self.process(delivery.payload()).await;

            match (settlement, &outcome) {
                (Settlement::Republish(payload), JobOutcome::RetryScheduled(next)) => {
                    self.schedule_retry(next.clone(), payload, delivery);
                }
                _ => {
                    debug!("Acknowledging message");
                    if let Err(e) = delivery.ack().await {
                        error!("Couldn't acknowledge message: {}", e);
                    }
                }
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn process(&self, payload: &[u8]) -> (JobOutcome, Settlement) {
        let mut fsm = JobFsm::new();

        let job = match DeployJob::decode(payload) {
            Ok(job) => job,
            Err(e) => {
                error!("Couldn't decode message body: {}", e);
                return (self.drop_job(&mut fsm, DropReason::Malformed, e.to_string()), Settlement::Ack);
            }
        };

        let span = tracing::Span::current();
        span.record("app_id", job.id);
        span.record("attempt", job.attempt);

        info!("Loading application {} from store", job.id);
        let mut app = match self.store.load_application_with_tasks(job.id).await {
            Ok(Some(app)) => app,
            Ok(None) => {
                error!("Application {} not found", job.id);
                let outcome = self.drop_job(
                    &mut fsm,
                    DropReason::ApplicationUnavailable,
                    "application not found".to_string(),
                );
                return (outcome, Settlement::Ack);
            }
            Err(e) => {
                error!("Failed to load application {}: {}", job.id, e);
                let outcome =
                    self.drop_job(&mut fsm, DropReason::ApplicationUnavailable, e.to_string());
                return (outcome, Settlement::Ack);
            }
        };

        self.transition(&mut fsm, JobEvent::Start);
        info!(
            "Running deployment tasks, attempt {} out of {}",
            job.attempt, self.options.max_attempts
        );

        let err = match self.deployer.deploy(&app).await {
            Ok(()) => {
                info!("Deployment was successful");
                app.mark_deployed(job.commit.as_deref(), job.version.as_deref(), Utc::now());
                if let Err(e) = self.store.save_application(&app).await {
                    error!("Failed to update application {}: {}", app.id, e);
                }
                self.transition(&mut fsm, JobEvent::Succeed);
                return (JobOutcome::Succeeded, Settlement::Ack);
            }
            Err(e) => e,
        };

        match err.kind {
            FailureKind::Unrecoverable => {
                error!("Deployment failed with unrecoverable error, cancelling job: {}", err);
                let outcome = self.drop_job(&mut fsm, DropReason::Unrecoverable, err.message);
                (outcome, Settlement::Ack)
            }
            FailureKind::Recoverable if job.attempt >= self.options.max_attempts => {
                warn!("Reached maximum attempts, cancelling job: {}", err);
                let outcome = self.drop_job(&mut fsm, DropReason::MaxAttemptsReached, err.message);
                (outcome, Settlement::Ack)
            }
            FailureKind::Recoverable => {
                info!("Deployment is recoverable, postponing job: {}", err);
                let next = job.next_attempt();
                match next.encode() {
                    Ok(payload) => {
                        self.transition(&mut fsm, JobEvent::Postpone);
                        (JobOutcome::RetryScheduled(next), Settlement::Republish(payload))
                    }
                    Err(e) => {
                        error!("Couldn't build retry message: {}", e);
                        let outcome = self.drop_job(&mut fsm, DropReason::RetryFailed, e.to_string());
                        (outcome, Settlement::Ack)
                    }
                }
            }
        }
    }

    fn transition(&self, fsm: &mut JobFsm, event: JobEvent) {
        if let Err(e) = fsm.process(event) {
            error!("Job state error: {}", e);
        }
    }

    fn drop_job(&self, fsm: &mut JobFsm, reason: DropReason, detail: String) -> JobOutcome {
        self.transition(fsm, JobEvent::Drop(detail));
        if fsm.state() == JobState::Dropped {
            warn!("Job dropped ({:?}): {}", reason, fsm.reason().unwrap_or_default());
        }
        JobOutcome::Dropped(reason)
    }

    /// Publish the follow-up message once the backoff has elapsed, then
    /// acknowledge the original delivery
    fn schedule_retry(&self, job: DeployJob, payload: Vec<u8>, delivery: Delivery) {
        let messenger = self.messenger.clone();
        let queue = self.options.queue.clone();
        let delay = self.options.retry_backoff;

        debug!("Republishing job in {:?}", delay);
        let mut retries = self.retries.lock().unwrap_or_else(|e| e.into_inner());
        while retries.try_join_next().is_some() {}

        retries.spawn(
            async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = messenger.publish(&queue, payload).await {
                    error!(
                        "Retry lost for attempt {}, leaving message unacknowledged for redelivery: {}",
                        job.attempt, e
                    );
                    return RetryStatus::Lost(job);
                }
                debug!("Republished job for attempt {}", job.attempt);

                if let Err(e) = delivery.ack().await {
                    error!("Couldn't acknowledge message: {}", e);
                }
                RetryStatus::Republished(job)
            }
            .in_current_span(),
        );
    }

    /// Number of retries still waiting to be published
    pub fn pending_retries(&self) -> usize {
        let mut retries = self.retries.lock().unwrap_or_else(|e| e.into_inner());
        while retries.try_join_next().is_some() {}
        retries.len()
    }

    /// Wait for every scheduled retry to settle
    pub async fn drain_retries(&self) -> Vec<RetryStatus> {
        let mut retries = {
            let mut guard = self.retries.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };

        if !retries.is_empty() {
            info!("Waiting for {} scheduled retries", retries.len());
        }
        let mut settled = Vec::with_capacity(retries.len());
        while let Some(result) = retries.join_next().await {
            match result {
                Ok(status) => settled.push(status),
                Err(e) => error!("Retry task failed: {}", e),
            }
        }
        settled
    }
}

/// Run the consumer worker until shutdown or until the subscription closes
pub async fn run<Q>(
    consumer: &Consumer,
    subscription: &mut Q,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    Q: Subscription + ?Sized,
{
    info!("Consumer worker starting, waiting for messages...");

    loop {
        let delivery = tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Consumer worker shutting down...");
                return;
            }
            delivery = subscription.next_delivery() => delivery,
        };

        match delivery {
            Some(delivery) => {
                let outcome = consumer.handle(delivery).await;
                debug!("Job finished: {:?}", outcome);
            }
            None => {
                warn!("Subscription closed, consumer worker stopping");
                return;
            }
        }
    }
}
