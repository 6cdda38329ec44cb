//! Key-generation pool errors
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


use kms_types::KmsError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Pool saturated: queue is full")]
    Saturated,

    #[error("Timed out waiting for queue space")]
    Timeout,

    #[error("Generation request cancelled")]
    Cancelled,

    #[error("Pool is shut down")]
    ShutDown,

    #[error("Key generation failed: {0}")]
    Generation(String),

    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

impl From<PoolError> for KmsError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::Saturated => KmsError::Saturated,
            PoolError::Timeout => KmsError::Timeout("key generation queue".to_string()),
            PoolError::Cancelled => KmsError::Timeout("key generation cancelled".to_string()),
            PoolError::ShutDown => KmsError::Internal("key generation pool shut down".to_string()),
            PoolError::Generation(m) => KmsError::Internal(format!("key generation failed: {}", m)),
            PoolError::InvalidConfig(m) => KmsError::Internal(m),
        }
    }
}
