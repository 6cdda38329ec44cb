//! Root, intermediate and content key versions plus active pointers
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
use crate::models::BarrierKeyRecord;
use crate::transaction::{db_int, get_u64, get_uuid, RepositoryTransaction};
use kms_types::Tier;
use sqlx::any::AnyRow;
use sqlx::Row;

fn key_from_row(tier: Tier, row: &AnyRow) -> RepoResult<BarrierKeyRecord> {
    Ok(BarrierKeyRecord {
        id: get_uuid(row, "id")?,
        tier,
        partition: row.try_get("partition_id")?,
        version: get_u64(row, "version")?,
        parent_version: get_u64(row, "parent_version")?,
        ciphertext: row.try_get("ciphertext")?,
        created_at: row.try_get("created_at")?,
    })
}

impl RepositoryTransaction {
    /// Insert a new version; a duplicate version is a `Conflict`, a missing
    /// parent version an `InvalidReference`
    pub async fn add_barrier_key(&mut self, key: &BarrierKeyRecord) -> RepoResult<()> {
        let sql = format!(
            "INSERT INTO {} (id, partition_id, version, parent_version, ciphertext, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
            key.tier.table()
        );
        sqlx::query(&sql)
            .bind(key.id.to_string())
            .bind(key.partition.as_str())
            .bind(db_int(key.version)?)
            .bind(db_int(key.parent_version)?)
            .bind(key.ciphertext.as_slice())
            .bind(key.created_at)
            .execute(self.conn())
            .await?;
        Ok(())
    }

    pub async fn get_barrier_key(
        &mut self,
        tier: Tier,
        partition: &str,
        version: u64,
    ) -> RepoResult<BarrierKeyRecord> {
        let sql = format!(
            "SELECT id, partition_id, version, parent_version, ciphertext, created_at \
             FROM {} WHERE partition_id = $1 AND version = $2",
            tier.table()
        );
        let row = sqlx::query(&sql)
            .bind(partition)
            .bind(db_int(version)?)
            .fetch_optional(self.conn())
            .await?
            .ok_or_else(|| {
                RepositoryError::NotFound(format!(
                    "{} key version {} in partition '{}'",
                    tier, version, partition
                ))
            })?;
        key_from_row(tier, &row)
    }

    pub async fn list_barrier_keys(
        &mut self,
        tier: Tier,
        partition: &str,
    ) -> RepoResult<Vec<BarrierKeyRecord>> {
        let sql = format!(
            "SELECT id, partition_id, version, parent_version, ciphertext, created_at \
             FROM {} WHERE partition_id = $1 ORDER BY version",
            tier.table()
        );
        let rows = sqlx::query(&sql)
            .bind(partition)
            .fetch_all(self.conn())
            .await?;
        rows.iter().map(|row| key_from_row(tier, row)).collect()
    }

    pub async fn get_active_version(&mut self, tier: Tier, partition: &str) -> RepoResult<Option<u64>> {
        let row = sqlx::query("SELECT version FROM active_keys WHERE tier = $1 AND partition_id = $2")
            .bind(tier.as_str())
            .bind(partition)
            .fetch_optional(self.conn())
            .await?;
        row.map(|r| get_u64(&r, "version")).transpose()
    }

    /// Create the pointer for a partition's first version; `Conflict` if one exists
    pub async fn init_active_version(
        &mut self,
        tier: Tier,
        partition: &str,
        version: u64,
    ) -> RepoResult<()> {
        sqlx::query("INSERT INTO active_keys (tier, partition_id, version) VALUES ($1, $2, $3)")
            .bind(tier.as_str())
            .bind(partition)
            .bind(db_int(version)?)
            .execute(self.conn())
            .await?;
        Ok(())
    }

    /// Compare-and-swap the active pointer
    pub async fn swap_active_version(
        &mut self,
        tier: Tier,
        partition: &str,
        expected: u64,
        new_version: u64,
    ) -> RepoResult<()> {
        let changed = sqlx::query(
            "UPDATE active_keys SET version = $4 \
             WHERE tier = $1 AND partition_id = $2 AND version = $3",
        )
        .bind(tier.as_str())
        .bind(partition)
        .bind(db_int(expected)?)
        .bind(db_int(new_version)?)
        .execute(self.conn())
        .await?
        .rows_affected();

        if changed == 0 {
            return Err(RepositoryError::Conflict(format!(
                "active {} version of partition '{}' is no longer {}",
                tier, partition, expected
            )));
        }
        Ok(())
    }
}
