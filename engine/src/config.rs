//! Node configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{TssError, TssResult};
use crate::types::CeremonyKind;

/// Join-party (quorum formation) timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinPartyConfig {
    /// How long the leader collects requests.
    pub timeout: Duration,
    pub retry_interval: Duration,
    pub max_attempts: u32,
}

impl Default for JoinPartyConfig {
    fn default() -> Self {
        JoinPartyConfig {
            timeout: Duration::from_secs(10),
            retry_interval: Duration::from_millis(500),
            max_attempts: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TssConfig {
    pub keygen_timeout: Duration,
    pub keysign_timeout: Duration,
    pub join_party: JoinPartyConfig,
    /// Number of ceremony outcomes kept for status reporting.
    pub status_history: usize,
}

impl Default for TssConfig {
    fn default() -> Self {
        TssConfig {
            keygen_timeout: Duration::from_secs(60),
            keysign_timeout: Duration::from_secs(60),
            join_party: JoinPartyConfig::default(),
            status_history: 256,
        }
    }
}

impl TssConfig {
    /// Load a JSON config file. Missing fields fall back to defaults.
    pub fn from_file(path: impl AsRef<Path>) -> TssResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| TssError::InvalidRequest(format!("cannot read config: {e}")))?;
        let config: TssConfig = serde_json::from_str(&raw)
            .map_err(|e| TssError::Serialization(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> TssResult<()> {
        if self.keygen_timeout.is_zero() || self.keysign_timeout.is_zero() {
            return Err(TssError::InvalidRequest("ceremony timeouts must be non-zero".into()));
        }
        let jp = &self.join_party;
        if jp.timeout.is_zero() || jp.retry_interval.is_zero() || jp.max_attempts == 0 {
            return Err(TssError::InvalidRequest("join party timing must be non-zero".into()));
        }
        // Requesters must still be listening when the leader gives up.
        if jp.retry_interval * jp.max_attempts <= jp.timeout {
            return Err(TssError::InvalidRequest(format!(
                "join party retry budget {:?} does not outlast leader window {:?}",
                jp.retry_interval * jp.max_attempts,
                jp.timeout
            )));
        }
        Ok(())
    }

    pub fn ceremony_timeout(&self, kind: CeremonyKind) -> Duration {
        match kind {
            CeremonyKind::Keygen => self.keygen_timeout,
            CeremonyKind::Keysign => self.keysign_timeout,
        }
    }
}
