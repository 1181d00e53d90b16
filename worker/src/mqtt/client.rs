//! MQTT implementation of the job queue
//!
//! The broker event loop runs in its own task so keep-alives and outgoing
//! publishes keep flowing while a job is executing. Incoming publishes are
//! forwarded to a [`MqttSubscription`] and acknowledged manually once the
//! consumer is done with them.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish, QoS};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::errors::WorkerError;
use crate::mqtt::topics::Topics;
use crate::queue::{Acker, Delivery, Messenger, Subscription};
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// MQTT broker address
#[derive(Debug, Clone)]
pub struct MqttAddress {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    /// Optional path to a PEM-encoded CA certificate for broker verification.
    /// When `None` and `use_tls` is `true`, the system certificate store is used.
    pub ca_cert_path: Option<String>,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    /// Stable client ID, so the broker keeps queued messages across restarts
    pub client_id: String,
}

impl Default for MqttAddress {
    fn default() -> Self {
        Self {
            host: "".to_string(),
            port: 8883,
            use_tls: true,
            ca_cert_path: None,
            username: None,
            password: None,
            client_id: "deployd-worker".to_string(),
        }
    }
}

/// Connection options
#[derive(Debug, Clone)]
pub struct Options {
    pub broker_address: MqttAddress,

    /// Shared subscription group, for several workers on one queue
    pub share_group: Option<String>,

    /// Delay between reconnect attempts
    pub reconnect_cooldown: CooldownOptions,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            broker_address: MqttAddress::default(),
            share_group: None,
            reconnect_cooldown: CooldownOptions::default(),
        }
    }
}

fn mqtt_options(address: &MqttAddress) -> Result<MqttOptions, WorkerError> {
    if address.host.is_empty() {
        return Err(WorkerError::MqttError("MQTT host is not configured".to_string()));
    }

    let mut options = MqttOptions::new(&address.client_id, &address.host, address.port);
    options.set_keep_alive(Duration::from_secs(30));
    options.set_clean_session(false);
    options.set_manual_acks(true);

    if let Some(ref username) = address.username {
        let password = address
            .password
            .as_ref()
            .map(|p| p.expose_secret().to_string())
            .unwrap_or_default();
        options.set_credentials(username, password);
    }

    if address.use_tls {
        use rumqttc::{TlsConfiguration, Transport};
        use rustls::ClientConfig;

        let mut root_cert_store = rustls::RootCertStore::empty();

        if let Some(ref ca_path) = address.ca_cert_path {
            let ca_pem = std::fs::read(ca_path)
                .map_err(|e| WorkerError::MqttError(format!("Failed to read CA cert {ca_path}: {e}")))?;
            let mut cursor = std::io::Cursor::new(ca_pem);
            for cert in rustls_pemfile::certs(&mut cursor).flatten() {
                let _ = root_cert_store.add(cert);
            }
        } else {
            for cert in rustls_native_certs::load_native_certs().unwrap_or_default() {
                let _ = root_cert_store.add(cert);
            }
        }

        let client_config = ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        options.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(
            Arc::new(client_config),
        )));
    }

    Ok(options)
}

/// Publishing side of the connection
#[derive(Clone)]
pub struct MqttMessenger {
    client: AsyncClient,
}

impl MqttMessenger {
    /// Disconnect from broker
    pub async fn disconnect(&self) -> Result<(), WorkerError> {
        self.client
            .disconnect()
            .await
            .map_err(|e| WorkerError::MqttError(e.to_string()))?;
        info!("MQTT disconnected");
        Ok(())
    }
}

#[async_trait]
impl Messenger for MqttMessenger {
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<(), WorkerError> {
        let topic = Topics::queue(queue);
        self.client
            .publish(&topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| WorkerError::MqttError(e.to_string()))?;

        debug!("Published message to: {}", topic);
        Ok(())
    }
}

/// Consuming side of the connection
pub struct MqttSubscription {
    deliveries: mpsc::UnboundedReceiver<Delivery>,
}

#[async_trait]
impl Subscription for MqttSubscription {
    async fn next_delivery(&mut self) -> Option<Delivery> {
        self.deliveries.recv().await
    }
}

struct MqttAcker {
    client: AsyncClient,
    publish: Publish,
}

#[async_trait]
impl Acker for MqttAcker {
    async fn ack(self: Box<Self>) -> Result<(), WorkerError> {
        self.client
            .ack(&self.publish)
            .await
            .map_err(|e| WorkerError::MqttError(e.to_string()))
    }
}

/// An open broker connection
pub struct MqttConnection {
    pub messenger: MqttMessenger,
    pub subscription: MqttSubscription,
    /// Number of publishes the broker has confirmed with a PUBACK
    pub confirmed: watch::Receiver<u64>,
    pub event_loop: JoinHandle<()>,
}

/// Connect to the broker, consuming `queue` when given.
///
/// Without a queue the connection is publish-only and the subscription never
/// yields.
pub fn connect(
    options: &Options,
    queue: Option<&str>,
    shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) -> Result<MqttConnection, WorkerError> {
    let mqtt_options = mqtt_options(&options.broker_address)?;
    let (client, eventloop) = AsyncClient::new(mqtt_options, 10);
    let (tx, rx) = mpsc::unbounded_channel();
    let (confirmed_tx, confirmed) = watch::channel(0);

    let filter = queue.map(|q| Topics::queue_filter(q, options.share_group.as_deref()));

    info!(
        "Connecting to MQTT broker: {}:{}",
        options.broker_address.host, options.broker_address.port
    );
    let event_loop = tokio::spawn(run_event_loop(
        eventloop,
        client.clone(),
        filter,
        tx,
        confirmed_tx,
        options.reconnect_cooldown.clone(),
        shutdown_signal,
    ));

    Ok(MqttConnection {
        messenger: MqttMessenger { client },
        subscription: MqttSubscription { deliveries: rx },
        confirmed,
        event_loop,
    })
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    filter: Option<String>,
    deliveries: mpsc::UnboundedSender<Delivery>,
    confirmed: watch::Sender<u64>,
    cooldown: CooldownOptions,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) {
    let mut failures: u32 = 0;

    loop {
        let event = tokio::select! {
            _ = &mut shutdown_signal => {
                info!("MQTT event loop shutting down...");
                return;
            }
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!(
                    "Received message for queue: {}",
                    Topics::parse_queue(&publish.topic).unwrap_or_else(|| publish.topic.to_string())
                );
                let delivery = Delivery::new(
                    publish.payload.to_vec(),
                    Box::new(MqttAcker {
                        client: client.clone(),
                        publish,
                    }),
                );
                if deliveries.send(delivery).is_err() {
                    warn!("No consumer for message, leaving it unacknowledged");
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                failures = 0;
                info!("MQTT connected (session present: {})", connack.session_present);
                if let Some(ref filter) = filter {
                    if !connack.session_present {
                        match client.try_subscribe(filter.as_str(), QoS::AtLeastOnce) {
                            Ok(_) => info!("Subscribed to: {}", filter),
                            Err(e) => error!("Failed to subscribe to {}: {}", filter, e),
                        }
                    }
                }
            }
            Ok(Event::Incoming(Packet::SubAck(_))) => {
                debug!("Subscription acknowledged");
            }
            Ok(Event::Incoming(Packet::PubAck(puback))) => {
                debug!("Publish {} confirmed by broker", puback.pkid);
                confirmed.send_modify(|count| *count += 1);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                info!("MQTT disconnect requested, stopping event loop");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                let delay = calc_exp_backoff(&cooldown, failures);
                failures = failures.saturating_add(1);
                warn!("MQTT connection error: {}, reconnecting in {:?}", e, delay);
                tokio::select! {
                    _ = &mut shutdown_signal => {
                        info!("MQTT event loop shutting down...");
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
