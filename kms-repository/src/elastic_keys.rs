//! Elastic key persistence
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
use crate::models::{ElasticKey, ElasticKeyFilter};
use crate::now_millis;
use crate::transaction::{db_flag, db_int, get_flag, get_uuid, RepositoryTransaction};
use kms_types::{ElasticKeyState, KeyAlgorithm};
use sqlx::any::AnyRow;
use sqlx::Row;
use uuid::Uuid;

const COLUMNS: &str = "id, name, description, partition_id, algorithm, state, \
                       versioning_allowed, created_at, updated_at";

fn elastic_key_from_row(row: &AnyRow) -> RepoResult<ElasticKey> {
    let algorithm: String = row.try_get("algorithm")?;
    let state: String = row.try_get("state")?;
    Ok(ElasticKey {
        id: get_uuid(row, "id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        partition: row.try_get("partition_id")?,
        algorithm: KeyAlgorithm::parse(&algorithm)
            .ok_or_else(|| RepositoryError::Internal(format!("unknown algorithm '{}'", algorithm)))?,
        state: ElasticKeyState::parse(&state)
            .ok_or_else(|| RepositoryError::Internal(format!("unknown state '{}'", state)))?,
        versioning_allowed: get_flag(row, "versioning_allowed")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Escape `LIKE` wildcards so a name filter matches literally
fn like_pattern(needle: &str) -> String {
    let mut escaped = String::with_capacity(needle.len() + 2);
    escaped.push('%');
    for c in needle.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

/// `WHERE` clause and its text parameters, numbered from `$1`
fn filter_clause(filter: &ElasticKeyFilter) -> (String, Vec<String>) {
    let mut clauses: Vec<String> = Vec::new();
    let mut values: Vec<String> = Vec::new();

    if let Some(partition) = &filter.partition {
        values.push(partition.clone());
        clauses.push(format!("partition_id = ${}", values.len()));
    }
    if let Some(state) = filter.state {
        values.push(state.as_str().to_string());
        clauses.push(format!("state = ${}", values.len()));
    }
    if let Some(algorithm) = filter.algorithm {
        values.push(algorithm.as_str().to_string());
        clauses.push(format!("algorithm = ${}", values.len()));
    }
    if let Some(needle) = &filter.name_contains {
        values.push(like_pattern(needle));
        clauses.push(format!(r"name LIKE ${} ESCAPE '\'", values.len()));
    }

    if clauses.is_empty() {
        (String::new(), values)
    } else {
        (format!("WHERE {}", clauses.join(" AND ")), values)
    }
}

impl RepositoryTransaction {
    pub async fn add_elastic_key(&mut self, key: &ElasticKey) -> RepoResult<()> {
        let sql = format!(
            "INSERT INTO elastic_keys ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            COLUMNS
        );
        sqlx::query(&sql)
            .bind(key.id.to_string())
            .bind(key.name.as_str())
            .bind(key.description.as_str())
            .bind(key.partition.as_str())
            .bind(key.algorithm.as_str())
            .bind(key.state.as_str())
            .bind(db_flag(key.versioning_allowed))
            .bind(key.created_at)
            .bind(key.updated_at)
            .execute(self.conn())
            .await?;
        Ok(())
    }

    pub async fn get_elastic_key(&mut self, id: Uuid) -> RepoResult<ElasticKey> {
        let sql = format!("SELECT {} FROM elastic_keys WHERE id = $1", COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(self.conn())
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("elastic key {}", id)))?;
        elastic_key_from_row(&row)
    }

    pub async fn list_elastic_keys(&mut self, filter: &ElasticKeyFilter) -> RepoResult<Vec<ElasticKey>> {
        let (where_clause, values) = filter_clause(filter);
        let sql = format!(
            "SELECT {} FROM elastic_keys {} ORDER BY created_at, id LIMIT ${} OFFSET ${}",
            COLUMNS,
            where_clause,
            values.len() + 1,
            values.len() + 2
        );

        let mut query = sqlx::query(&sql);
        for value in values {
            query = query.bind(value);
        }
        let rows = query
            .bind(filter.limit.map_or(Ok(i64::MAX), db_int)?)
            .bind(db_int(filter.offset)?)
            .fetch_all(self.conn())
            .await?;
        rows.iter().map(elastic_key_from_row).collect()
    }

    pub async fn update_elastic_key_metadata(
        &mut self,
        id: Uuid,
        name: &str,
        description: &str,
    ) -> RepoResult<ElasticKey> {
        let changed = sqlx::query(
            "UPDATE elastic_keys SET name = $2, description = $3, updated_at = $4 WHERE id = $1",
        )
        .bind(id.to_string())
        .bind(name)
        .bind(description)
        .bind(now_millis())
        .execute(self.conn())
        .await?
        .rows_affected();
        if changed == 0 {
            return Err(RepositoryError::NotFound(format!("elastic key {}", id)));
        }
        self.get_elastic_key(id).await
    }

    /// Compare-and-swap on the lifecycle state.
    ///
    /// `NotFound` if the key does not exist, `Conflict` if it is no longer in
    /// `from`. Legality of the transition is checked by the caller.
    pub async fn transition_elastic_key_state(
        &mut self,
        id: Uuid,
        from: ElasticKeyState,
        to: ElasticKeyState,
    ) -> RepoResult<()> {
        let changed = sqlx::query(
            "UPDATE elastic_keys SET state = $3, updated_at = $4 WHERE id = $1 AND state = $2",
        )
        .bind(id.to_string())
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(now_millis())
        .execute(self.conn())
        .await?
        .rows_affected();

        if changed == 0 {
            let current = self.get_elastic_key(id).await?;
            return Err(RepositoryError::Conflict(format!(
                "elastic key {} is {}, expected {}",
                id, current.state, from
            )));
        }
        Ok(())
    }
}
