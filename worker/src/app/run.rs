//! Main application run loop

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::app::state::AppState;
use crate::errors::WorkerError;
use crate::mqtt::client::MqttSubscription;
use crate::workers::consumer;

/// Grace period for the broker to flush outgoing packets after disconnecting
const EVENT_LOOP_FLUSH_DELAY: Duration = Duration::from_secs(5);

/// Run the deployment worker until `shutdown_signal` resolves
pub async fn run(
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), WorkerError> {
    info!("Initializing deployment worker...");

    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    if let Err(e) = init(&options, shutdown_tx.clone(), &mut shutdown_manager).await {
        error!("Failed to start worker: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    tokio::select! {
        _ = shutdown_signal => {
            info!("Shutdown signal received, shutting down...");
        }
        _ = shutdown_manager.consumer_stopped() => {
            warn!("Consumer worker stopped on its own, shutting down...");
        }
    }

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), WorkerError> {
    let (event_loop_stop_tx, event_loop_stop_rx) = oneshot::channel::<()>();
    let (app_state, subscription, event_loop) = AppState::init(
        options,
        Box::pin(async move {
            let _ = event_loop_stop_rx.await;
        }),
    )
    .await?;

    let app_state = Arc::new(app_state);
    shutdown_manager.with_app_state(app_state.clone())?;
    shutdown_manager.with_event_loop(event_loop, event_loop_stop_tx)?;

    init_consumer_worker(app_state, subscription, shutdown_manager, shutdown_tx.subscribe())
}

fn init_consumer_worker(
    app_state: Arc<AppState>,
    mut subscription: MqttSubscription,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), WorkerError> {
    info!("Initializing consumer worker...");

    let worker = app_state.consumer.clone();
    let consumer_handle = tokio::spawn(async move {
        consumer::run(
            worker.as_ref(),
            &mut subscription,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_consumer_worker_handle(consumer_handle)
}

// ================================= SHUTDOWN ===================================== //

struct EventLoopParams {
    handle: JoinHandle<()>,
    stop_tx: oneshot::Sender<()>,
}

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    app_state: Option<Arc<AppState>>,
    event_loop: Option<EventLoopParams>,
    consumer_worker_handle: Option<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            app_state: None,
            event_loop: None,
            consumer_worker_handle: None,
        }
    }

    pub fn with_app_state(&mut self, state: Arc<AppState>) -> Result<(), WorkerError> {
        if self.app_state.is_some() {
            return Err(WorkerError::ShutdownError("app_state already set".to_string()));
        }
        self.app_state = Some(state);
        Ok(())
    }

    pub fn with_event_loop(
        &mut self,
        handle: JoinHandle<()>,
        stop_tx: oneshot::Sender<()>,
    ) -> Result<(), WorkerError> {
        if self.event_loop.is_some() {
            return Err(WorkerError::ShutdownError("event_loop already set".to_string()));
        }
        self.event_loop = Some(EventLoopParams { handle, stop_tx });
        Ok(())
    }

    pub fn with_consumer_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), WorkerError> {
        if self.consumer_worker_handle.is_some() {
            return Err(WorkerError::ShutdownError("consumer_handle already set".to_string()));
        }
        self.consumer_worker_handle = Some(handle);
        Ok(())
    }

    /// Resolves once the consumer worker has exited
    async fn consumer_stopped(&mut self) {
        match self.consumer_worker_handle.as_mut() {
            Some(handle) => {
                let _ = handle.await;
                self.consumer_worker_handle = None;
            }
            None => std::future::pending().await,
        }
    }

    pub async fn shutdown(&mut self) -> Result<(), WorkerError> {
        let _ = self.shutdown_tx.send(());

        let max_delay = self.lifecycle_options.max_shutdown_delay;
        match tokio::time::timeout(max_delay, self.shutdown_impl()).await {
            Ok(result) => result,
            Err(_) => {
                error!("Shutdown timed out after {:?}, forcing shutdown...", max_delay);
                if let Some(event_loop) = self.event_loop.take() {
                    event_loop.handle.abort();
                }
                Err(WorkerError::ShutdownError(format!(
                    "shutdown timed out after {:?}",
                    max_delay
                )))
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), WorkerError> {
        info!("Shutting down deployment worker...");

        // 1. Consumer worker
        if let Some(handle) = self.consumer_worker_handle.take() {
            handle.await.map_err(|e| WorkerError::ShutdownError(e.to_string()))?;
        }

        // 2. App state: pending retries, then broker disconnect
        let mut result = Ok(());
        if let Some(app_state) = self.app_state.take() {
            result = app_state.shutdown().await;
            if let Err(ref e) = result {
                error!("Failed to shut down application state: {}", e);
            }
        }

        // 3. Broker event loop
        if let Some(event_loop) = self.event_loop.take() {
            let mut handle = event_loop.handle;
            if tokio::time::timeout(EVENT_LOOP_FLUSH_DELAY, &mut handle)
                .await
                .is_err()
            {
                warn!("MQTT event loop still running, stopping it");
                let _ = event_loop.stop_tx.send(());
                handle.await.map_err(|e| WorkerError::ShutdownError(e.to_string()))?;
            }
        }

        info!("Shutdown complete");
        result
    }
}
