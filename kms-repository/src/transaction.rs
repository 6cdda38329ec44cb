//! Transaction handle shared by all entity operations
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


use crate::engine::EngineKind;
use crate::error::{RepoResult, RepositoryError};
use sqlx::any::AnyRow;
use sqlx::{Any, AnyConnection, AnyPool, Row, Transaction};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

/// An open transaction. Entity operations are methods on this type and
/// only take effect once the surrounding [`crate::Repository::transaction`]
/// commits. Dropping it unfinished rolls back.
pub struct RepositoryTransaction {
    tx: Transaction<'static, Any>,
}

impl RepositoryTransaction {
    pub(crate) async fn begin(
        pool: &AnyPool,
        engine: EngineKind,
        statement_timeout: Duration,
    ) -> RepoResult<Self> {
        let mut tx = pool.begin().await?;
        if engine == EngineKind::Postgres {
            sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
                .execute(&mut *tx)
                .await?;
            sqlx::query(&format!(
                "SET LOCAL statement_timeout = {}",
                statement_timeout.as_millis()
            ))
            .execute(&mut *tx)
            .await?;
        }
        Ok(Self { tx })
    }

    pub(crate) async fn commit(self) -> RepoResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    pub(crate) async fn rollback(self) {
        if let Err(e) = self.tx.rollback().await {
            warn!(error = %e, "Rollback failed");
        }
    }

    /// Connection to run statements on
    pub(crate) fn conn(&mut self) -> &mut AnyConnection {
        &mut self.tx
    }
}

/// Versions and counters are `BIGINT` columns
pub(crate) fn db_int(value: u64) -> RepoResult<i64> {
    i64::try_from(value)
        .map_err(|_| RepositoryError::Internal(format!("{} does not fit a BIGINT column", value)))
}

pub(crate) fn db_flag(value: bool) -> i64 {
    i64::from(value)
}

pub(crate) fn get_u64(row: &AnyRow, column: &str) -> RepoResult<u64> {
    let value: i64 = row.try_get(column)?;
    u64::try_from(value)
        .map_err(|_| RepositoryError::Internal(format!("column {} is negative", column)))
}

pub(crate) fn get_flag(row: &AnyRow, column: &str) -> RepoResult<bool> {
    Ok(row.try_get::<i64, _>(column)? != 0)
}

pub(crate) fn get_uuid(row: &AnyRow, column: &str) -> RepoResult<Uuid> {
    let raw: String = row.try_get(column)?;
    Uuid::parse_str(&raw)
        .map_err(|e| RepositoryError::Internal(format!("column {} holds bad uuid: {}", column, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_int_range() {
        assert_eq!(db_int(7).unwrap(), 7);
        assert!(db_int(u64::MAX).is_err());
        assert_eq!(db_flag(true), 1);
        assert_eq!(db_flag(false), 0);
    }
}
