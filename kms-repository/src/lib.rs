//! KMS Repository
//!
//! Transactional persistence for unseal metadata, barrier key tiers, elastic
//! keys and their material. Two interchangeable engines sit behind the same
//! API: PostgreSQL and SQLite, both driven through `sqlx`.
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


mod barrier_keys;
mod elastic_keys;
mod engine;
pub mod error;
mod material_keys;
pub mod models;
mod schema;
pub mod transaction;
mod unseal_slots;

pub use engine::{EngineKind, SQLITE_MEMORY_URL};
pub use error::{RepoResult, RepositoryError};
pub use futures::future::BoxFuture;
pub use models::{BarrierKeyRecord, ElasticKey, ElasticKeyFilter, MaterialKey, UnsealSlot};
pub use transaction::RepositoryTransaction;

use kms_config::DatabaseConfig;
use sqlx::AnyPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Current time as epoch milliseconds, the timestamp format of every table
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

struct RepositoryInner {
    pool: AnyPool,
    engine: EngineKind,
    transaction_timeout: Duration,
}

/// Shared handle to the persistence layer; cheap to clone
#[derive(Clone)]
pub struct Repository {
    inner: Arc<RepositoryInner>,
}

impl Repository {
    /// Connect to the engine selected by the URL scheme and run migrations
    pub async fn connect(config: &DatabaseConfig) -> RepoResult<Self> {
        let (pool, engine) = engine::connect(config).await?;
        Ok(Self {
            inner: Arc::new(RepositoryInner {
                pool,
                engine,
                transaction_timeout: config.transaction_timeout(),
            }),
        })
    }

    /// Private in-memory SQLite database with default timeouts
    pub async fn in_memory() -> RepoResult<Self> {
        Self::connect(&DatabaseConfig::in_memory()).await
    }

    pub fn engine(&self) -> EngineKind {
        self.inner.engine
    }

    /// Run `f` inside one transaction.
    ///
    /// Commits when `f` returns `Ok`, rolls back on `Err`. If `f` does not
    /// finish within the configured transaction timeout it is dropped, the
    /// transaction is rolled back and `Timeout` is returned.
    ///
    /// ```ignore
    /// let key = repo
    ///     .transaction(move |tx| Box::pin(async move { tx.get_elastic_key(id).await }))
    ///     .await?;
    /// ```
    pub async fn transaction<T, F>(&self, f: F) -> RepoResult<T>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut RepositoryTransaction) -> BoxFuture<'t, RepoResult<T>> + Send,
    {
        let mut tx = RepositoryTransaction::begin(
            &self.inner.pool,
            self.inner.engine,
            self.inner.transaction_timeout,
        )
        .await?;

        let outcome = tokio::time::timeout(self.inner.transaction_timeout, f(&mut tx)).await;
        match outcome {
            Ok(Ok(value)) => {
                tx.commit().await?;
                Ok(value)
            }
            Ok(Err(e)) => {
                debug!(error = %e, "Rolling back transaction");
                tx.rollback().await;
                Err(e)
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.inner.transaction_timeout.as_millis() as u64,
                    "Transaction deadline exceeded, rolling back"
                );
                tx.rollback().await;
                Err(RepositoryError::Timeout("transaction deadline exceeded".to_string()))
            }
        }
    }
}
