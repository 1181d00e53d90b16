//! Application state management

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::app::options::AppOptions;
use crate::deploy::dispatcher::Deployer;
use crate::deploy::remote::SshExecutor;
use crate::deploy::trust::TrustStore;
use crate::deploy::webhook::WebhookExecutor;
use crate::errors::WorkerError;
use crate::mqtt::client::{self, MqttMessenger, MqttSubscription};
use crate::storage::applications::JsonFileStore;
use crate::workers::consumer::{Consumer, RetryStatus};

/// Main application state
pub struct AppState {
    /// Applications and their tasks
    pub store: Arc<JsonFileStore>,

    /// Pinned SSH host keys
    pub trust_store: Arc<TrustStore>,

    /// Broker publisher, shared with the consumer for retries
    pub messenger: Arc<MqttMessenger>,

    /// Deployment job consumer
    pub consumer: Arc<Consumer>,
}

impl AppState {
    /// Initialize application state and open the broker connection.
    ///
    /// Returns the subscription for the consumer worker and the handle of the
    /// broker event loop, which stops on disconnect or on `event_loop_stop`.
    pub async fn init(
        options: &AppOptions,
        event_loop_stop: Pin<Box<dyn Future<Output = ()> + Send>>,
    ) -> Result<(Self, MqttSubscription, JoinHandle<()>), WorkerError> {
        info!("Initializing application state...");

        let layout = &options.layout;
        layout.setup().await?;

        let store = Arc::new(JsonFileStore::new(layout.applications_file().path()));

        let trust_store = Arc::new(TrustStore::new(layout.known_hosts_file().path()));
        trust_store.ensure_exists().await?;

        let ssh = Arc::new(SshExecutor::new(
            options.ssh_credentials.clone(),
            trust_store.clone(),
            options.ssh.clone(),
        ));
        let webhook = Arc::new(WebhookExecutor::new(&options.http)?);
        let deployer = Arc::new(Deployer::new(ssh, webhook));

        let connection = client::connect(
            &options.mqtt,
            Some(options.consumer.queue.as_str()),
            event_loop_stop,
        )?;
        let messenger = Arc::new(connection.messenger);

        let consumer = Arc::new(Consumer::new(
            options.consumer.clone(),
            store.clone(),
            deployer,
            messenger.clone(),
        ));

        let state = Self {
            store,
            trust_store,
            messenger,
            consumer,
        };

        Ok((state, connection.subscription, connection.event_loop))
    }

    /// Publish pending retries and close the broker connection
    pub async fn shutdown(&self) -> Result<(), WorkerError> {
        info!("Shutting down application state...");
        let lost = self
            .consumer
            .drain_retries()
            .await
            .into_iter()
            .filter(|status| matches!(status, RetryStatus::Lost(_)))
            .count();
        if lost > 0 {
            warn!("{} retries could not be published and will be redelivered", lost);
        }
        self.messenger.disconnect().await
    }
}
