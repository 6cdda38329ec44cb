//! Connection pools for the two engines
//!
//! Both engines go through sqlx's `Any` driver so every statement is written
//! once, with `$n` placeholders, and runs unchanged on either.
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


use crate::error::{RepoResult, RepositoryError};
use crate::schema::{schema, BlobType};
use kms_config::DatabaseConfig;
use sqlx::any::{install_default_drivers, AnyPoolOptions};
use sqlx::AnyPool;
use tracing::info;

/// URL selecting a private in-memory database
pub const SQLITE_MEMORY_URL: &str = "sqlite::memory:";

/// Which relational engine backs a repository
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Postgres,
    Sqlite,
}

impl EngineKind {
    pub fn from_url(url: &str) -> RepoResult<Self> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Ok(EngineKind::Postgres)
        } else if url.starts_with("sqlite:") {
            Ok(EngineKind::Sqlite)
        } else {
            Err(RepositoryError::Internal(
                "database.url must start with postgres:// or sqlite:".to_string(),
            ))
        }
    }

    fn blob_type(self) -> BlobType {
        match self {
            EngineKind::Postgres => BlobType::Bytea,
            EngineKind::Sqlite => BlobType::Blob,
        }
    }
}

/// File databases are created on first open
fn sqlite_url(url: &str) -> String {
    if url == SQLITE_MEMORY_URL || url.contains("mode=") {
        url.to_string()
    } else if url.contains('?') {
        format!("{}&mode=rwc", url)
    } else {
        format!("{}?mode=rwc", url)
    }
}

/// Open the pool for `config.url` and run migrations.
///
/// SQLite gets a single long-lived connection: writers serialize on pool
/// checkout instead of failing with `SQLITE_BUSY`, and an in-memory
/// database lives as long as that connection.
pub(crate) async fn connect(config: &DatabaseConfig) -> RepoResult<(AnyPool, EngineKind)> {
    let engine = EngineKind::from_url(&config.url)?;
    install_default_drivers();

    let options = AnyPoolOptions::new().acquire_timeout(config.acquire_timeout());
    let pool = match engine {
        EngineKind::Postgres => {
            info!(max_connections = config.max_connections, "Connecting to PostgreSQL");
            options
                .max_connections(config.max_connections as u32)
                .connect(&config.url)
                .await?
        }
        EngineKind::Sqlite => {
            info!(in_memory = config.url == SQLITE_MEMORY_URL, "Opening SQLite database");
            options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect(&sqlite_url(&config.url))
                .await?
        }
    };

    // Run migrations
    for statement in schema(engine.blob_type()) {
        sqlx::query(&statement).execute(&pool).await?;
    }

    info!(engine = ?engine, "Repository connected and initialized");
    Ok((pool, engine))
}
