//! Host identity verification backed by a known_hosts trust store
//!
//! The store is an OpenSSH style `known_hosts` file. Entries are only ever
//! appended (trust on first use); a host whose key changed is rejected and
//! never re-pinned automatically.

use std::path::PathBuf;

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::errors::{TaskError, WorkerError};
use crate::filesys::file::File;

const FINGERPRINT_PREFIX: &str = "SHA256:";

/// A host public key as presented during the SSH handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKey {
    /// Key algorithm, e.g. `ssh-ed25519`
    pub algorithm: String,

    /// Public key in SSH wire format
    pub blob: Vec<u8>,
}

impl HostKey {
    pub fn new(algorithm: impl Into<String>, blob: Vec<u8>) -> Self {
        Self {
            algorithm: algorithm.into(),
            blob,
        }
    }

    /// Parse the base64 key column of a known_hosts line
    pub fn from_base64(algorithm: &str, encoded: &str) -> Option<Self> {
        STANDARD
            .decode(encoded)
            .ok()
            .map(|blob| Self::new(algorithm, blob))
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.blob)
    }

    /// OpenSSH style fingerprint, `SHA256:<unpadded base64>`
    pub fn fingerprint(&self) -> String {
        format!("{}{}", FINGERPRINT_PREFIX, STANDARD_NO_PAD.encode(self.digest()))
    }

    fn digest(&self) -> Vec<u8> {
        Sha256::digest(&self.blob).to_vec()
    }

    /// Compare against a pinned fingerprint, rejecting malformed pins
    pub fn matches_fingerprint(&self, pinned: &str) -> Result<bool, String> {
        let digest = parse_fingerprint(pinned)?;
        Ok(digest == self.digest())
    }
}

/// Decode a `SHA256:<base64>` fingerprint into its raw digest
pub fn parse_fingerprint(fingerprint: &str) -> Result<Vec<u8>, String> {
    let encoded = fingerprint
        .strip_prefix(FINGERPRINT_PREFIX)
        .ok_or_else(|| format!("fingerprint must start with {}", FINGERPRINT_PREFIX))?;

    let digest = STANDARD_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .map_err(|e| format!("fingerprint is not valid base64: {}", e))?;

    if digest.len() != 32 {
        return Err(format!(
            "fingerprint digest must be 32 bytes, got {}",
            digest.len()
        ));
    }
    Ok(digest)
}

/// Host column of a known_hosts entry for the given address
pub fn host_pattern(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

/// Outcome of a successful trust check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustDecision {
    /// Host was already trusted with this key
    Known,

    /// Host was unknown, its key matched the pin and has been recorded
    Learned,
}

/// Decide whether a presented key can be trusted.
///
/// `known` holds every key recorded for the host. A known host is accepted
/// only with one of its recorded keys and the pin is not consulted; an
/// unknown host is accepted only when the pin matches.
pub fn evaluate(
    known: &[HostKey],
    presented: &HostKey,
    pinned: &str,
) -> Result<TrustDecision, TaskError> {
    if !known.is_empty() {
        if known.contains(presented) {
            return Ok(TrustDecision::Known);
        }
        return Err(TaskError::unrecoverable(format!(
            "host key changed, presented {} key {} does not match the trust store",
            presented.algorithm,
            presented.fingerprint()
        )));
    }

    match presented.matches_fingerprint(pinned) {
        Ok(true) => Ok(TrustDecision::Learned),
        Ok(false) => Err(TaskError::unrecoverable(format!(
            "ssh fingerprint mismatch, expected {} got {}",
            pinned,
            presented.fingerprint()
        ))),
        Err(e) => Err(TaskError::unrecoverable(format!(
            "invalid pinned fingerprint: {}",
            e
        ))),
    }
}

/// Persistent store of trusted host keys
pub struct TrustStore {
    file: File,
    write_lock: Mutex<()>,
}

impl TrustStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: File::new(path),
            write_lock: Mutex::new(()),
        }
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    /// Create the store file (mode 0600) if it does not exist yet
    pub async fn ensure_exists(&self) -> Result<(), WorkerError> {
        if !self.file.exists().await {
            self.file.write_string("").await?;
            self.file.set_permissions_600().await?;
        }
        Ok(())
    }

    /// Every key recorded for the host
    pub async fn lookup(&self, host: &str, port: u16) -> Result<Vec<HostKey>, WorkerError> {
        if !self.file.exists().await {
            return Ok(Vec::new());
        }

        let pattern = host_pattern(host, port);
        let contents = self.file.read_string().await?;
        let keys = contents
            .lines()
            .filter_map(parse_line)
            .filter(|(hosts, _)| hosts.iter().any(|h| *h == pattern))
            .map(|(_, key)| key)
            .collect();
        Ok(keys)
    }

    /// Append a host key line
    pub async fn append(&self, host: &str, port: u16, key: &HostKey) -> Result<(), WorkerError> {
        let line = format!(
            "{} {} {}",
            host_pattern(host, port),
            key.algorithm,
            key.to_base64()
        );
        self.file.append_line(&line).await
    }

    /// Verify a presented host key, recording it on first use
    pub async fn verify(
        &self,
        host: &str,
        port: u16,
        presented: &HostKey,
        pinned: &str,
    ) -> Result<TrustDecision, TaskError> {
        // Held across lookup and append so concurrent first contacts record the host once
        let _guard = self.write_lock.lock().await;

        let known = self.lookup(host, port).await.map_err(|e| {
            TaskError::unrecoverable(format!("Couldn't read trust store: {}", e))
        })?;

        let decision = match evaluate(&known, presented, pinned) {
            Ok(decision) => decision,
            Err(e) => {
                warn!("Refusing host {}: {}", host_pattern(host, port), e.message);
                return Err(e);
            }
        };

        match decision {
            TrustDecision::Known => {
                debug!("Host {} found in trust store", host_pattern(host, port));
            }
            TrustDecision::Learned => {
                self.append(host, port, presented).await.map_err(|e| {
                    TaskError::unrecoverable(format!("Couldn't update trust store: {}", e))
                })?;
                info!(
                    "Added host {} ({}) to trust store",
                    host_pattern(host, port),
                    presented.fingerprint()
                );
            }
        }

        Ok(decision)
    }
}

/// Parse one known_hosts line into its host patterns and key.
///
/// Comments, marker lines (`@revoked`, `@cert-authority`) and hashed host
/// entries are skipped.
fn parse_line(line: &str) -> Option<(Vec<&str>, HostKey)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with('@') {
        return None;
    }

    let mut fields = line.split_whitespace();
    let hosts = fields.next()?;
    let algorithm = fields.next()?;
    let encoded = fields.next()?;

    if hosts.starts_with('|') {
        return None;
    }

    let key = HostKey::from_base64(algorithm, encoded)?;
    Some((hosts.split(',').collect(), key))
}
