//! Settings file management

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::logs::LogLevel;

/// Environment variable overriding the SSH key passphrase
pub const SSH_PASSPHRASE_ENV: &str = "DEPLOYD_SSH_PASSPHRASE";

/// Environment variable overriding the MQTT password
pub const MQTT_PASSWORD_ENV: &str = "DEPLOYD_MQTT_PASSWORD";

/// Worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit logs as JSON
    #[serde(default)]
    pub log_json: bool,

    /// Also write logs to daily files under the logs directory
    #[serde(default)]
    pub log_to_file: bool,

    /// MQTT broker configuration
    #[serde(default)]
    pub mqtt_broker: MqttBrokerSettings,

    /// SSH configuration
    #[serde(default)]
    pub ssh: SshSettings,

    /// HTTP task configuration
    #[serde(default)]
    pub http: HttpSettings,

    /// Queue consumer configuration
    #[serde(default)]
    pub consumer: ConsumerSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_to_file: false,
            mqtt_broker: MqttBrokerSettings::default(),
            ssh: SshSettings::default(),
            http: HttpSettings::default(),
            consumer: ConsumerSettings::default(),
        }
    }
}

impl Settings {
    /// Apply secrets given through the environment
    pub fn apply_env_overrides(&mut self) {
        if let Ok(passphrase) = std::env::var(SSH_PASSPHRASE_ENV) {
            self.ssh.passphrase = Some(passphrase);
        }
        if let Ok(password) = std::env::var(MQTT_PASSWORD_ENV) {
            self.mqtt_broker.password = Some(password);
        }
    }
}

fn default_true() -> bool {
    true
}

/// MQTT broker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttBrokerSettings {
    /// Broker host
    #[serde(default = "default_mqtt_host")]
    pub host: String,

    /// Broker port
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Use TLS
    #[serde(default = "default_true")]
    pub tls: bool,

    /// Optional path to a PEM-encoded CA certificate for broker TLS verification.
    /// When absent, the system certificate store is used.
    #[serde(default)]
    pub ca_cert_path: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    /// Client ID; keep it stable so queued messages survive restarts
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Shared subscription group for running several workers
    #[serde(default)]
    pub share_group: Option<String>,
}

fn default_mqtt_host() -> String {
    "".to_string()
}

fn default_mqtt_port() -> u16 {
    8883
}

fn default_client_id() -> String {
    "deployd-worker".to_string()
}

impl Default for MqttBrokerSettings {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            tls: true,
            ca_cert_path: None,
            username: None,
            password: None,
            client_id: default_client_id(),
            share_group: None,
        }
    }
}

/// SSH settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSettings {
    /// Private key used to authenticate the worker
    #[serde(default = "default_private_key_path")]
    pub private_key_path: PathBuf,

    #[serde(default, skip_serializing)]
    pub passphrase: Option<String>,

    /// Dial and handshake timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_private_key_path() -> PathBuf {
    PathBuf::from("/etc/deployd/id_ed25519")
}

fn default_connect_timeout() -> u64 {
    20
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            private_key_path: default_private_key_path(),
            passphrase: None,
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

/// HTTP task settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSettings {
    /// Whole-request timeout in seconds
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

fn default_http_timeout() -> u64 {
    30
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_http_timeout(),
        }
    }
}

/// Queue consumer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerSettings {
    /// Attempts after which a recoverable failure is dropped
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u64,

    /// Delay before a postponed job is republished, in seconds
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,
}

fn default_max_attempts() -> u64 {
    5
}

fn default_retry_backoff() -> u64 {
    3
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_backoff_secs: default_retry_backoff(),
        }
    }
}
