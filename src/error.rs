//! Error taxonomy shared by the ingestion, storage and replay paths.

use serde::Serialize;

use crate::calendar::PartitionKey;

/// Why an ingestion was refused. Surfaced synchronously to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Client error; retrying the same payload will not help.
    Malformed,
    /// `ts` is not after the last accepted `ts` for the game.
    OutOfOrder,
    /// The record belongs to a partition that has already rolled over.
    PartitionClosed,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Malformed => "malformed",
            RejectReason::OutOfOrder => "out_of_order",
            RejectReason::PartitionClosed => "partition_closed",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a single `ingest` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted,
    /// Already-seen `(gid, ts)`; treated as success with no side effects.
    Duplicate,
    Rejected(RejectReason),
}

impl IngestOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, IngestOutcome::Accepted)
    }
}

/// Cold store failures.
#[derive(Debug)]
pub enum StoreError {
    PartitionClosed(PartitionKey),
    DuplicateKey { gid: String, ts: i64 },
    /// I/O or SQLite failure that may succeed on retry.
    Transient(anyhow::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PartitionClosed(key) => write!(f, "partition {} is closed", key),
            Self::DuplicateKey { gid, ts } => write!(f, "duplicate key ({}, {})", gid, ts),
            Self::Transient(e) => write!(f, "transient store failure: {:#}", e),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Transient(err.into())
    }
}

/// Replay state machine errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayError {
    AlreadyRunning,
    InvalidTransition {
        from: &'static str,
        action: &'static str,
    },
    InvalidSpeed,
    /// No replay session exists for the game.
    UnknownGame(String),
}

impl ReplayError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyRunning => "already_running",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::InvalidSpeed => "invalid_speed",
            Self::UnknownGame(_) => "unknown_game",
        }
    }
}

impl std::fmt::Display for ReplayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyRunning => write!(f, "replay already running"),
            Self::InvalidTransition { from, action } => {
                write!(f, "cannot {} a replay that is {}", action, from)
            }
            Self::InvalidSpeed => write!(f, "speed_multiplier must be a positive number"),
            Self::UnknownGame(gid) => write!(f, "no replay session for game {}", gid),
        }
    }
}

impl std::error::Error for ReplayError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reject_reason_wire_names() {
        assert_eq!(RejectReason::Malformed.to_string(), "malformed");
        assert_eq!(
            serde_json::to_value(RejectReason::OutOfOrder).unwrap(),
            serde_json::json!("out_of_order")
        );
        assert_eq!(RejectReason::PartitionClosed.as_str(), "partition_closed");
    }

    #[test]
    fn test_replay_error_messages() {
        let err = ReplayError::InvalidTransition {
            from: "paused",
            action: "start",
        };
        assert_eq!(err.to_string(), "cannot start a replay that is paused");
        assert_eq!(err.code(), "invalid_transition");
        assert_eq!(ReplayError::AlreadyRunning.code(), "already_running");
    }
}
