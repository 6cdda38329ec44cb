//! Error taxonomy shared by every KMS component
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use crate::domain::ElasticKeyState;
use thiserror::Error;

/// Errors surfaced by the barrier, the key-generation pool and the
/// elastic-key state machine.
///
/// The set is closed: lower layers map their own failures into one of these
/// kinds and callers never see engine- or library-specific error types.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KmsError {
    #[error("Barrier is sealed")]
    Sealed,

    #[error("Insufficient unseal shares: {provided} provided, {required} required")]
    InsufficientShares { required: usize, provided: usize },

    #[error("Invalid unseal shares: {0}")]
    InvalidShares(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    #[error("Key generation pool saturated")]
    Saturated,

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid state transition from {current} to {attempted}")]
    InvalidState {
        current: ElasticKeyState,
        attempted: ElasticKeyState,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl KmsError {
    /// Short machine-readable kind, used as a metric label
    pub fn kind(&self) -> &'static str {
        match self {
            KmsError::Sealed => "sealed",
            KmsError::InsufficientShares { .. } => "insufficient_shares",
            KmsError::InvalidShares(_) => "invalid_shares",
            KmsError::NotFound(_) => "not_found",
            KmsError::Conflict(_) => "conflict",
            KmsError::InvalidReference(_) => "invalid_reference",
            KmsError::Saturated => "saturated",
            KmsError::Timeout(_) => "timeout",
            KmsError::InvalidState { .. } => "invalid_state",
            KmsError::Internal(_) => "internal",
        }
    }

    /// Whether a caller may reasonably retry the same request later.
    ///
    /// Nothing in the core retries on its own; this only informs callers.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KmsError::Saturated | KmsError::Timeout(_) | KmsError::Conflict(_)
        )
    }
}

impl From<serde_json::Error> for KmsError {
    fn from(e: serde_json::Error) -> Self {
        KmsError::Internal(format!("Serialization error: {}", e))
    }
}

/// Result type for KMS operations
pub type KmsResult<T> = Result<T, KmsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_state_message_names_both_states() {
        let err = KmsError::InvalidState {
            current: ElasticKeyState::Disabled,
            attempted: ElasticKeyState::Rotating,
        };
        let msg = err.to_string();
        assert!(msg.contains("disabled"));
        assert!(msg.contains("rotating"));
        assert_eq!(err.kind(), "invalid_state");
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(KmsError::Saturated.is_retryable());
        assert!(KmsError::Timeout("db".into()).is_retryable());
        assert!(KmsError::Conflict("race".into()).is_retryable());
        assert!(!KmsError::Sealed.is_retryable());
        assert!(!KmsError::Internal("boom".into()).is_retryable());
    }
}
