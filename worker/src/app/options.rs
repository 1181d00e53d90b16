//! Application configuration options

use std::time::Duration;

use secrecy::SecretString;

use crate::deploy::remote::{self, SshCredentials};
use crate::deploy::webhook;
use crate::mqtt::client;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::workers::consumer;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage layout paths
    pub layout: StorageLayout,

    /// Broker connection
    pub mqtt: client::Options,

    /// Key material for remote commands
    pub ssh_credentials: SshCredentials,

    /// SSH executor options
    pub ssh: remote::Options,

    /// HTTP executor options
    pub http: webhook::Options,

    /// Consumer worker options
    pub consumer: consumer::Options,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self::from_settings(StorageLayout::default(), &Settings::default())
    }
}

impl AppOptions {
    /// Build options from the settings file contents
    pub fn from_settings(layout: StorageLayout, settings: &Settings) -> Self {
        let broker = &settings.mqtt_broker;
        Self {
            lifecycle: LifecycleOptions::default(),
            layout,
            mqtt: client::Options {
                broker_address: client::MqttAddress {
                    host: broker.host.clone(),
                    port: broker.port,
                    use_tls: broker.tls,
                    ca_cert_path: broker.ca_cert_path.clone(),
                    username: broker.username.clone(),
                    password: broker.password.clone().map(SecretString::from),
                    client_id: broker.client_id.clone(),
                },
                share_group: broker.share_group.clone(),
                ..Default::default()
            },
            ssh_credentials: SshCredentials {
                private_key_path: settings.ssh.private_key_path.clone(),
                passphrase: settings.ssh.passphrase.clone().map(SecretString::from),
            },
            ssh: remote::Options {
                connect_timeout: Duration::from_secs(settings.ssh.connect_timeout_secs),
            },
            http: webhook::Options {
                timeout: Duration::from_secs(settings.http.timeout_secs),
            },
            consumer: consumer::Options {
                max_attempts: settings.consumer.max_attempts,
                retry_backoff: Duration::from_secs(settings.consumer.retry_backoff_secs),
                ..Default::default()
            },
        }
    }
}

/// Lifecycle options for the worker
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}
