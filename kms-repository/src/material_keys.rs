//! Material key versions of elastic keys
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
use crate::models::MaterialKey;
use crate::transaction::{db_flag, db_int, get_flag, get_u64, get_uuid, RepositoryTransaction};
use sqlx::any::AnyRow;
use sqlx::Row;
use uuid::Uuid;

const COLUMNS: &str =
    "elastic_key_id, version, is_primary, revoked, public_material, sealed_private, created_at";

fn material_from_row(row: &AnyRow) -> RepoResult<MaterialKey> {
    Ok(MaterialKey {
        elastic_key_id: get_uuid(row, "elastic_key_id")?,
        version: get_u64(row, "version")?,
        is_primary: get_flag(row, "is_primary")?,
        revoked: get_flag(row, "revoked")?,
        public_material: row.try_get("public_material")?,
        sealed_private: row.try_get("sealed_private")?,
        created_at: row.try_get("created_at")?,
    })
}

fn not_found(id: Uuid, version: u64) -> RepositoryError {
    RepositoryError::NotFound(format!("material version {} of elastic key {}", version, id))
}

impl RepositoryTransaction {
    /// Insert a material version. A second primary for the same key is a
    /// `Conflict`; clear the old primary first.
    pub async fn add_material_key(&mut self, material: &MaterialKey) -> RepoResult<()> {
        let sql = format!(
            "INSERT INTO material_keys ({}) VALUES ($1, $2, $3, $4, $5, $6, $7)",
            COLUMNS
        );
        sqlx::query(&sql)
            .bind(material.elastic_key_id.to_string())
            .bind(db_int(material.version)?)
            .bind(db_flag(material.is_primary))
            .bind(db_flag(material.revoked))
            .bind(material.public_material.clone())
            .bind(material.sealed_private.as_slice())
            .bind(material.created_at)
            .execute(self.conn())
            .await?;
        Ok(())
    }

    pub async fn get_material_key(&mut self, id: Uuid, version: u64) -> RepoResult<MaterialKey> {
        let sql = format!(
            "SELECT {} FROM material_keys WHERE elastic_key_id = $1 AND version = $2",
            COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .bind(db_int(version)?)
            .fetch_optional(self.conn())
            .await?
            .ok_or_else(|| not_found(id, version))?;
        material_from_row(&row)
    }

    pub async fn get_primary_material_key(&mut self, id: Uuid) -> RepoResult<MaterialKey> {
        let sql = format!(
            "SELECT {} FROM material_keys WHERE elastic_key_id = $1 AND is_primary = 1",
            COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(self.conn())
            .await?
            .ok_or_else(|| {
                RepositoryError::NotFound(format!("primary material of elastic key {}", id))
            })?;
        material_from_row(&row)
    }

    pub async fn list_material_keys(&mut self, id: Uuid) -> RepoResult<Vec<MaterialKey>> {
        let sql = format!(
            "SELECT {} FROM material_keys WHERE elastic_key_id = $1 ORDER BY version",
            COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_all(self.conn())
            .await?;
        rows.iter().map(material_from_row).collect()
    }

    /// Highest version recorded for a key, `0` when there is none
    pub async fn latest_material_version(&mut self, id: Uuid) -> RepoResult<u64> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(version), 0) AS latest FROM material_keys WHERE elastic_key_id = $1",
        )
        .bind(id.to_string())
        .fetch_one(self.conn())
        .await?;
        get_u64(&row, "latest")
    }

    /// Demote the current primary, returning how many rows changed
    pub async fn clear_primary_material_key(&mut self, id: Uuid) -> RepoResult<u64> {
        let result = sqlx::query(
            "UPDATE material_keys SET is_primary = 0 \
             WHERE elastic_key_id = $1 AND is_primary = 1",
        )
        .bind(id.to_string())
        .execute(self.conn())
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn revoke_material_key(&mut self, id: Uuid, version: u64) -> RepoResult<()> {
        let changed = sqlx::query(
            "UPDATE material_keys SET revoked = 1 WHERE elastic_key_id = $1 AND version = $2",
        )
        .bind(id.to_string())
        .bind(db_int(version)?)
        .execute(self.conn())
        .await?
        .rows_affected();
        if changed == 0 {
            return Err(not_found(id, version));
        }
        Ok(())
    }
}
