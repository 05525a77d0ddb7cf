//! zkama-common
//!
//! Shared domain types for the zkama anonymous AMA platform: the session
//! status machine mirrored from the AMA contract, status-transition commands,
//! and the deterministic access-code hashing used by the join gate.

use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use thiserror::Error;

/// Off-chain session identifier, allocated by the relational cache and reused
/// verbatim as the on-chain group id.
pub type SessionId = i64;

/// Off-chain question identifier, allocated by the relational cache and reused
/// verbatim as the nullifier seed component for the on-chain call.
pub type QuestionId = i64;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid session status: {0}")]
    InvalidStatus(u8),

    #[error("invalid status command: {0}")]
    InvalidCommand(String),
}

/// Session lifecycle states, using the contract's integer encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SessionStatus {
    NotStarted = 1,
    Paused = 2,
    Active = 3,
    Ended = 4,
}

impl SessionStatus {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Human-readable name, as shown in listings.
    pub fn name(self) -> &'static str {
        match self {
            Self::NotStarted => "Not Started",
            Self::Paused => "Paused",
            Self::Active => "Active",
            Self::Ended => "Ended",
        }
    }

    /// Whether participants may join the session's group.
    ///
    /// Joining is open while the session is running, paused included; the
    /// access-code gate is checked separately.
    pub fn joinable(self) -> bool {
        matches!(self, Self::Active | Self::Paused)
    }
}

impl TryFrom<u8> for SessionStatus {
    type Error = DomainError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::NotStarted),
            2 => Ok(Self::Paused),
            3 => Ok(Self::Active),
            4 => Ok(Self::Ended),
            other => Err(DomainError::InvalidStatus(other)),
        }
    }
}

/// Owner-issued status transition commands, mirroring the contract calls
/// `startAmaSession` / `pauseAmaSession` / `resumeAmaSession` /
/// `endAmaSession`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusCommand {
    Start,
    Pause,
    Resume,
    End,
}

impl StatusCommand {
    /// The cache status a successful on-chain transition lands in.
    pub fn target_status(self) -> SessionStatus {
        match self {
            Self::Start | Self::Resume => SessionStatus::Active,
            Self::Pause => SessionStatus::Paused,
            Self::End => SessionStatus::Ended,
        }
    }

    pub fn parse(value: &str) -> Result<Self, DomainError> {
        match value {
            "start" => Ok(Self::Start),
            "pause" => Ok(Self::Pause),
            "resume" => Ok(Self::Resume),
            "end" => Ok(Self::End),
            other => Err(DomainError::InvalidCommand(other.to_string())),
        }
    }
}

/// Keccak-256 hash of an access code, `0x`-prefixed lowercase hex.
///
/// Matches the hash stored at session creation, so the join gate can compare
/// in SQL. An empty code means "no gate" and hashes to `None`.
pub fn access_code_hash(code: &str) -> Option<String> {
    if code.is_empty() {
        return None;
    }
    let digest = Keccak256::digest(code.as_bytes());
    Some(format!("0x{}", hex::encode(digest)))
}

/// Current unix time in seconds.
pub fn unix_time_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
