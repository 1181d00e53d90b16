//! Deployment job message

use serde::{Deserialize, Serialize};

/// A queued request to deploy an application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployJob {
    /// Application ID
    pub id: u64,

    /// Number of attempts already made for this deployment
    #[serde(default)]
    pub attempt: u64,

    /// Commit being deployed
    #[serde(default)]
    pub commit: Option<String>,

    /// Version being deployed
    #[serde(default)]
    pub version: Option<String>,
}

impl DeployJob {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            attempt: 0,
            commit: None,
            version: None,
        }
    }

    /// The message to publish when this attempt is postponed
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
