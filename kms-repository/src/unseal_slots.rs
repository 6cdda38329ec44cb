//! Unseal slot persistence
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


use crate::error::RepoResult;
use crate::models::UnsealSlot;
use crate::transaction::{get_u64, RepositoryTransaction};
use sqlx::any::AnyRow;
use sqlx::Row;

fn slot_from_row(row: &AnyRow) -> RepoResult<UnsealSlot> {
    Ok(UnsealSlot {
        combination: row.try_get("combination")?,
        kdf: row.try_get("kdf")?,
        salt: row.try_get("salt")?,
        iterations: u32::try_from(get_u64(row, "iterations")?).unwrap_or(u32::MAX),
        wrapped_unseal_key: row.try_get("wrapped_unseal_key")?,
        created_at: row.try_get("created_at")?,
    })
}

impl RepositoryTransaction {
    pub async fn add_unseal_slot(&mut self, slot: &UnsealSlot) -> RepoResult<()> {
        sqlx::query(
            r#"
            INSERT INTO unseal_slots (combination, kdf, salt, iterations, wrapped_unseal_key, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(slot.combination.as_str())
        .bind(slot.kdf.as_str())
        .bind(slot.salt.as_slice())
        .bind(i64::from(slot.iterations))
        .bind(slot.wrapped_unseal_key.as_slice())
        .bind(slot.created_at)
        .execute(self.conn())
        .await?;
        Ok(())
    }

    pub async fn list_unseal_slots(&mut self) -> RepoResult<Vec<UnsealSlot>> {
        let rows = sqlx::query(
            r#"
            SELECT combination, kdf, salt, iterations, wrapped_unseal_key, created_at
            FROM unseal_slots
            ORDER BY combination
            "#,
        )
        .fetch_all(self.conn())
        .await?;
        rows.iter().map(slot_from_row).collect()
    }
}
