//! Schema migrations, shared by both engines
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


/// Column type used for ciphertext and key material
#[derive(Debug, Clone, Copy)]
pub(crate) enum BlobType {
    Bytea,
    Blob,
}

impl BlobType {
    fn as_sql(&self) -> &'static str {
        match self {
            BlobType::Bytea => "BYTEA",
            BlobType::Blob => "BLOB",
        }
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS unseal_slots (
    combination TEXT PRIMARY KEY,
    kdf TEXT NOT NULL,
    salt {blob} NOT NULL,
    iterations BIGINT NOT NULL,
    wrapped_unseal_key {blob} NOT NULL,
    created_at BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS root_keys (
    id TEXT NOT NULL UNIQUE,
    partition_id TEXT NOT NULL,
    version BIGINT NOT NULL UNIQUE,
    parent_version BIGINT NOT NULL,
    ciphertext {blob} NOT NULL,
    created_at BIGINT NOT NULL,
    PRIMARY KEY (partition_id, version)
);

CREATE TABLE IF NOT EXISTS intermediate_keys (
    id TEXT NOT NULL UNIQUE,
    partition_id TEXT NOT NULL,
    version BIGINT NOT NULL,
    parent_version BIGINT NOT NULL REFERENCES root_keys (version),
    ciphertext {blob} NOT NULL,
    created_at BIGINT NOT NULL,
    PRIMARY KEY (partition_id, version)
);

CREATE TABLE IF NOT EXISTS content_keys (
    id TEXT NOT NULL UNIQUE,
    partition_id TEXT NOT NULL,
    version BIGINT NOT NULL,
    parent_version BIGINT NOT NULL,
    ciphertext {blob} NOT NULL,
    created_at BIGINT NOT NULL,
    PRIMARY KEY (partition_id, version),
    FOREIGN KEY (partition_id, parent_version)
        REFERENCES intermediate_keys (partition_id, version)
);

CREATE TABLE IF NOT EXISTS active_keys (
    tier TEXT NOT NULL,
    partition_id TEXT NOT NULL,
    version BIGINT NOT NULL,
    PRIMARY KEY (tier, partition_id)
);

CREATE TABLE IF NOT EXISTS elastic_keys (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    partition_id TEXT NOT NULL,
    algorithm TEXT NOT NULL,
    state TEXT NOT NULL,
    versioning_allowed BIGINT NOT NULL,
    created_at BIGINT NOT NULL,
    updated_at BIGINT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_elastic_keys_partition ON elastic_keys (partition_id);

CREATE TABLE IF NOT EXISTS material_keys (
    elastic_key_id TEXT NOT NULL REFERENCES elastic_keys (id),
    version BIGINT NOT NULL,
    is_primary BIGINT NOT NULL,
    revoked BIGINT NOT NULL DEFAULT 0,
    public_material {blob},
    sealed_private {blob} NOT NULL,
    created_at BIGINT NOT NULL,
    PRIMARY KEY (elastic_key_id, version)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_material_keys_primary
    ON material_keys (elastic_key_id) WHERE is_primary = 1;
"#;

/// Schema statements for an engine, in order; every one is idempotent.
///
/// Flags are `BIGINT` 0/1 on both engines so rows decode the same way.
pub(crate) fn schema(blob: BlobType) -> Vec<String> {
    SCHEMA
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.replace("{blob}", blob.as_sql()))
        .collect()
}
