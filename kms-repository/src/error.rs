//! Repository error types
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
use sqlx::error::ErrorKind;
use thiserror::Error;

/// Engine-neutral persistence failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Conflicting write: {0}")]
    Conflict(String),

    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    #[error("Database timeout: {0}")]
    Timeout(String),

    #[error("Database error: {0}")]
    Internal(String),
}

/// Result type for repository operations
pub type RepoResult<T> = Result<T, RepositoryError>;

/// Classify a driver error code that sqlx does not give an [`ErrorKind`] for.
///
/// PostgreSQL reports SQLSTATE strings, SQLite numeric (extended) result codes.
fn classify_code(code: &str, message: String) -> RepositoryError {
    match code {
        // serialization_failure, deadlock_detected, lock_not_available
        "40001" | "40P01" | "55P03" => return RepositoryError::Conflict(message),
        // query_canceled, raised by statement_timeout
        "57014" => return RepositoryError::Timeout(message),
        _ => {}
    }
    match code.parse::<i32>().map(|c| c & 0xff) {
        // SQLITE_BUSY, SQLITE_LOCKED
        Ok(5) | Ok(6) => RepositoryError::Conflict(message),
        // SQLITE_INTERRUPT
        Ok(9) => RepositoryError::Timeout(message),
        _ => RepositoryError::Internal(message),
    }
}

impl From<sqlx::Error> for RepositoryError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => RepositoryError::NotFound("no rows returned".to_string()),
            sqlx::Error::PoolTimedOut => {
                RepositoryError::Timeout("connection checkout".to_string())
            }
            sqlx::Error::Database(db) => {
                let message = db.message().to_string();
                match db.kind() {
                    ErrorKind::UniqueViolation => RepositoryError::Conflict(message),
                    ErrorKind::ForeignKeyViolation => RepositoryError::InvalidReference(message),
                    _ => match db.code() {
                        Some(code) => classify_code(&code, message),
                        None => RepositoryError::Internal(message),
                    },
                }
            }
            other => RepositoryError::Internal(other.to_string()),
        }
    }
}

impl From<RepositoryError> for KmsError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::NotFound(m) => KmsError::NotFound(m),
            RepositoryError::Conflict(m) => KmsError::Conflict(m),
            RepositoryError::InvalidReference(m) => KmsError::InvalidReference(m),
            RepositoryError::Timeout(m) => KmsError::Timeout(m),
            RepositoryError::Internal(m) => KmsError::Internal(m),
        }
    }
}
