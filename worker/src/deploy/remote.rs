//! Remote command executor (SSH)

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::{ChannelMsg, Disconnect};
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::deploy::trust::{HostKey, TrustDecision, TrustStore};
use crate::errors::{TaskError, WorkerError};
use crate::models::application::RemoteCommandTask;

/// Executes remote command tasks
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute(&self, task: &RemoteCommandTask) -> Result<(), TaskError>;
}

/// Key material the worker authenticates with
#[derive(Debug, Clone)]
pub struct SshCredentials {
    pub private_key_path: PathBuf,
    pub passphrase: Option<SecretString>,
}

/// SSH executor options
#[derive(Debug, Clone)]
pub struct Options {
    /// Dial and handshake timeout
    pub connect_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(20),
        }
    }
}

impl HostKey {
    fn from_public_key(key: &PublicKey) -> Self {
        HostKey::new(key.name(), key.public_key_bytes())
    }
}

#[derive(Debug, Error)]
enum SessionError {
    #[error(transparent)]
    Ssh(#[from] russh::Error),

    #[error("{0}")]
    Untrusted(TaskError),
}

/// Handshake handler enforcing the trust store and the task's pinned fingerprint
struct TrustingHandler {
    trust_store: Arc<TrustStore>,
    host: String,
    port: u16,
    pinned: String,
}

#[async_trait]
impl client::Handler for TrustingHandler {
    type Error = SessionError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let presented = HostKey::from_public_key(server_public_key);
        match self
            .trust_store
            .verify(&self.host, self.port, &presented, &self.pinned)
            .await
        {
            Ok(TrustDecision::Known) | Ok(TrustDecision::Learned) => Ok(true),
            Err(e) => Err(SessionError::Untrusted(e)),
        }
    }
}

/// SSH implementation of [`RemoteExecutor`]
pub struct SshExecutor {
    credentials: SshCredentials,
    trust_store: Arc<TrustStore>,
    options: Options,
}

impl SshExecutor {
    pub fn new(credentials: SshCredentials, trust_store: Arc<TrustStore>, options: Options) -> Self {
        Self {
            credentials,
            trust_store,
            options,
        }
    }

    fn load_key(&self) -> Result<russh_keys::key::KeyPair, TaskError> {
        let passphrase = self
            .credentials
            .passphrase
            .as_ref()
            .map(|p| p.expose_secret().to_string())
            .filter(|p| !p.is_empty());

        russh_keys::load_secret_key(&self.credentials.private_key_path, passphrase.as_deref())
            .map_err(|e| TaskError::unrecoverable(format!("Couldn't load SSH private key: {}", e)))
    }

    async fn run(&self, task: &RemoteCommandTask) -> Result<Vec<u8>, TaskError> {
        let key_pair = self.load_key()?;

        let handler = TrustingHandler {
            trust_store: self.trust_store.clone(),
            host: task.host.clone(),
            port: task.port,
            pinned: task.fingerprint.clone(),
        };
        let config = Arc::new(client::Config::default());
        let connect = client::connect(config, (task.host.as_str(), task.port), handler);

        let mut session = match tokio::time::timeout(self.options.connect_timeout, connect).await {
            Ok(Ok(session)) => session,
            Ok(Err(SessionError::Untrusted(e))) => return Err(e),
            Ok(Err(SessionError::Ssh(e))) => {
                return Err(TaskError::unrecoverable(format!(
                    "Couldn't connect to SSH host {}:{}: {}",
                    task.host, task.port, e
                )));
            }
            Err(_) => {
                return Err(TaskError::unrecoverable(format!(
                    "Timed out connecting to SSH host {}:{} after {:?}",
                    task.host, task.port, self.options.connect_timeout
                )));
            }
        };

        let authenticated = session
            .authenticate_publickey(task.username.as_str(), Arc::new(key_pair))
            .await
            .map_err(|e| TaskError::unrecoverable(format!("SSH authentication failed: {}", e)))?;
        if !authenticated {
            return Err(TaskError::unrecoverable(format!(
                "SSH authentication rejected for user {}",
                task.username
            )));
        }

        let result = exec_command(&session, &task.command).await;

        if let Err(e) = session
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            debug!("SSH disconnect failed: {}", e);
        }

        result
    }
}

async fn exec_command(
    session: &client::Handle<TrustingHandler>,
    command: &str,
) -> Result<Vec<u8>, TaskError> {
    let mut channel = session
        .channel_open_session()
        .await
        .map_err(|e| TaskError::unrecoverable(format!("Couldn't open SSH session: {}", e)))?;

    channel
        .exec(true, command)
        .await
        .map_err(|e| TaskError::unrecoverable(format!("Couldn't start command: {}", e)))?;

    let mut output = Vec::new();
    let mut exit_status = None;

    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { ref data } => output.extend_from_slice(data),
            ChannelMsg::ExtendedData { ref data, .. } => output.extend_from_slice(data),
            ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
            _ => {}
        }
    }

    match exit_status {
        Some(0) => Ok(output),
        Some(code) => {
            debug!("Command output: {}", String::from_utf8_lossy(&output));
            Err(TaskError::unrecoverable(format!(
                "Command exited with status {}",
                code
            )))
        }
        None => Err(TaskError::unrecoverable(
            "Command ended without an exit status",
        )),
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn execute(&self, task: &RemoteCommandTask) -> Result<(), TaskError> {
        info!(
            "Running command on {}@{}:{}",
            task.username, task.host, task.port
        );

        match self.run(task).await {
            Ok(output) => {
                debug!("Command output: {}", String::from_utf8_lossy(&output));
                Ok(())
            }
            Err(e) => {
                error!("Command failed: {}", e);
                Err(e)
            }
        }
    }
}

/// Handshake handler that only records the presented key
struct FingerprintHandler {
    presented: Arc<Mutex<Option<HostKey>>>,
}

#[async_trait]
impl client::Handler for FingerprintHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let mut presented = self.presented.lock().unwrap_or_else(|e| e.into_inner());
        *presented = Some(HostKey::from_public_key(server_public_key));
        Ok(true)
    }
}

/// Connect to a host and return its key fingerprint without trusting it
pub async fn fetch_fingerprint(
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<String, WorkerError> {
    let presented = Arc::new(Mutex::new(None));
    let handler = FingerprintHandler {
        presented: presented.clone(),
    };

    let config = Arc::new(client::Config::default());
    let session = tokio::time::timeout(connect_timeout, client::connect(config, (host, port), handler))
        .await
        .map_err(|_| WorkerError::SshError(format!("Timed out connecting to {}:{}", host, port)))?
        .map_err(|e| WorkerError::SshError(e.to_string()))?;

    let _ = session
        .disconnect(Disconnect::ByApplication, "", "English")
        .await;

    let key = presented
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take()
        .ok_or_else(|| WorkerError::SshError("Server did not present a host key".to_string()))?;

    Ok(key.fingerprint())
}
