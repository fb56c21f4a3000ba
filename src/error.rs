//! Error types shared across the engine.

use crate::events::InterruptReason;
use std::path::PathBuf;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, OnAirError>;

/// Errors surfaced by the orchestration engine.
///
/// Only `Cancelled`, `SchedulingInvariantViolated` and the configuration
/// variants ever reach the timeline's caller. Resource and asset failures are
/// recovered where they happen and only logged.
#[derive(Debug, thiserror::Error)]
pub enum OnAirError {
    /// No free audio player handle, or no eligible caller.
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// Missing, corrupt or zero-length audio asset.
    #[error("invalid audio asset '{}': {source}", path.display())]
    AssetInvalid {
        path: PathBuf,
        #[source]
        source: AssetError,
    },

    /// The unit was cancelled before it finished.
    #[error("unit '{unit_id}' interrupted ({reason})")]
    Cancelled {
        unit_id: String,
        reason: InterruptReason,
    },

    /// A break schedule or timing table broke its ordering contract.
    #[error("scheduling invariant violated: {0}")]
    SchedulingInvariantViolated(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OnAirError {
    /// True for the cooperative cancellation signal.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, OnAirError::Cancelled { .. })
    }
}

/// Why an audio asset could not be used.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssetError {
    #[error("file not found")]
    Missing,

    #[error("file has zero length")]
    ZeroLength,

    #[error("cannot decode: {0}")]
    Corrupt(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_is_recognised() {
        let err = OnAirError::Cancelled {
            unit_id: "line_1".into(),
            reason: InterruptReason::BreakStarting,
        };
        assert!(err.is_cancelled());
        assert!(err.to_string().contains("line_1"));
        assert!(!OnAirError::Config("bad".into()).is_cancelled());
    }

    #[test]
    fn asset_invalid_names_the_path() {
        let err = OnAirError::AssetInvalid {
            path: PathBuf::from("ads/local_1.mp3"),
            source: AssetError::ZeroLength,
        };
        let msg = err.to_string();
        assert!(msg.contains("ads/local_1.mp3"));
        assert!(msg.contains("zero length"));
    }
}
