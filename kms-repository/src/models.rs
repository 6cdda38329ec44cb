//! Persisted records
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


use kms_types::{ElasticKeyState, KeyAlgorithm, PartitionId, Tier};
use uuid::Uuid;

/// Derivation metadata for one M-sized combination of unseal shares
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsealSlot {
    /// Sorted 1-based share indices, e.g. `"1,3,5"`
    pub combination: String,
    pub kdf: String,
    pub salt: Vec<u8>,
    pub iterations: u32,
    pub wrapped_unseal_key: Vec<u8>,
    pub created_at: i64,
}

/// One wrapped version of a root, intermediate or content key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarrierKeyRecord {
    pub id: Uuid,
    pub tier: Tier,
    pub partition: PartitionId,
    pub version: u64,
    /// Version of the wrapping key one tier up; `0` for root keys
    pub parent_version: u64,
    pub ciphertext: Vec<u8>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElasticKey {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub partition: PartitionId,
    pub algorithm: KeyAlgorithm,
    pub state: ElasticKeyState,
    pub versioning_allowed: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One version of an elastic key's material
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterialKey {
    pub elastic_key_id: Uuid,
    pub version: u64,
    pub is_primary: bool,
    pub revoked: bool,
    pub public_material: Option<Vec<u8>>,
    /// Barrier blob of the private or secret material
    pub sealed_private: Vec<u8>,
    pub created_at: i64,
}

/// Filter for listing elastic keys; unset fields match everything
#[derive(Debug, Clone, Default)]
pub struct ElasticKeyFilter {
    pub partition: Option<PartitionId>,
    pub state: Option<ElasticKeyState>,
    pub algorithm: Option<KeyAlgorithm>,
    pub name_contains: Option<String>,
    pub offset: u64,
    pub limit: Option<u64>,
}

impl ElasticKeyFilter {
    pub fn partition(partition: impl Into<PartitionId>) -> Self {
        Self {
            partition: Some(partition.into()),
            ..Self::default()
        }
    }
}
