//! Root, intermediate and content key tiers
//!
//! Each tier stores versions wrapped under a version of its parent tier and
//! an active pointer per partition. Parents are reached through
//! [`ParentKeys`], ending at the unseal-derived key held by [`UnsealedKey`].
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


use crate::wrap::{random_key, Key256, KeyWrapper, WrapContext};
use async_trait::async_trait;
use kms_repository::{now_millis, BarrierKeyRecord, Repository, RepositoryError};
use kms_types::{KmsError, KmsResult, PartitionId, Tier, GLOBAL_PARTITION};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// Compile-time description of a tier
pub trait TierKind: Send + Sync + 'static {
    const TIER: Tier;
    /// Whether versions are kept per partition
    const PARTITIONED: bool;
    /// Whether the first version is created on first use
    const LAZY: bool;
}

pub struct RootTier;
pub struct IntermediateTier;
pub struct ContentTier;

impl TierKind for RootTier {
    const TIER: Tier = Tier::Root;
    const PARTITIONED: bool = false;
    const LAZY: bool = false;
}

impl TierKind for IntermediateTier {
    const TIER: Tier = Tier::Intermediate;
    const PARTITIONED: bool = true;
    const LAZY: bool = true;
}

impl TierKind for ContentTier {
    const TIER: Tier = Tier::Content;
    const PARTITIONED: bool = true;
    const LAZY: bool = true;
}

pub type RootKeysService = TierService<RootTier>;
pub type IntermediateKeysService = TierService<IntermediateTier>;
pub type ContentKeysService = TierService<ContentTier>;

/// Source of wrapping keys for the tier below
#[async_trait]
pub trait ParentKeys: Send + Sync {
    /// Active version and its plaintext key
    async fn active(&self, partition: &str) -> KmsResult<(u64, Key256)>;

    async fn by_version(&self, partition: &str, version: u64) -> KmsResult<Key256>;
}

/// Holder of the unseal-derived key, the parent of the root tier.
///
/// It has a single implicit version `0` and answers `Sealed` while empty.
#[derive(Default)]
pub struct UnsealedKey {
    key: RwLock<Option<Key256>>,
}

impl UnsealedKey {
    pub const VERSION: u64 = 0;

    pub fn new() -> Self {
        Self::default()
    }

    pub async fn install(&self, key: Key256) {
        *self.key.write().await = Some(key);
    }

    pub async fn clear(&self) {
        self.key.write().await.take();
    }

    pub async fn is_unsealed(&self) -> bool {
        self.key.read().await.is_some()
    }

    async fn current(&self) -> KmsResult<Key256> {
        self.key.read().await.clone().ok_or(KmsError::Sealed)
    }
}

#[async_trait]
impl ParentKeys for UnsealedKey {
    async fn active(&self, _partition: &str) -> KmsResult<(u64, Key256)> {
        Ok((Self::VERSION, self.current().await?))
    }

    async fn by_version(&self, _partition: &str, version: u64) -> KmsResult<Key256> {
        if version != Self::VERSION {
            return Err(KmsError::NotFound(format!("unseal key version {}", version)));
        }
        self.current().await
    }
}

/// Versioned keys of one tier
pub struct TierService<T: TierKind> {
    repo: Repository,
    parent: Arc<dyn ParentKeys>,
    wrapper: Arc<dyn KeyWrapper>,
    cache: RwLock<HashMap<(PartitionId, u64), Key256>>,
    _tier: PhantomData<T>,
}

impl<T: TierKind> TierService<T> {
    pub fn new(repo: Repository, parent: Arc<dyn ParentKeys>, wrapper: Arc<dyn KeyWrapper>) -> Self {
        Self {
            repo,
            parent,
            wrapper,
            cache: RwLock::new(HashMap::new()),
            _tier: PhantomData,
        }
    }

    pub fn tier(&self) -> Tier {
        T::TIER
    }

    /// Storage partition; unpartitioned tiers collapse every caller partition
    fn partition_of(partition: &str) -> &str {
        if T::PARTITIONED {
            partition
        } else {
            GLOBAL_PARTITION
        }
    }

    fn context<'a>(partition: &'a str, version: u64, parent_version: u64) -> WrapContext<'a> {
        WrapContext {
            label: T::TIER.as_str(),
            partition,
            version,
            parent_version,
        }
    }

    /// Generate a key for `version` and wrap it under the parent's active
    /// version. Nothing is persisted.
    pub async fn prepare_version(
        &self,
        partition: &str,
        version: u64,
    ) -> KmsResult<(Key256, BarrierKeyRecord)> {
        let partition = Self::partition_of(partition);
        let (parent_version, parent_key) = self.parent.active(partition).await?;

        let key = random_key();
        let ciphertext = self.wrapper.wrap(
            &parent_key,
            &key,
            &Self::context(partition, version, parent_version),
        )?;

        let record = BarrierKeyRecord {
            id: Uuid::new_v4(),
            tier: T::TIER,
            partition: partition.to_string(),
            version,
            parent_version,
            ciphertext,
            created_at: now_millis(),
        };
        Ok((key, record))
    }

    /// Keep an unwrapped key for later lookups
    pub async fn remember(&self, partition: &str, version: u64, key: Key256) {
        let partition = Self::partition_of(partition).to_string();
        self.cache.write().await.insert((partition, version), key);
    }

    /// Drop every cached plaintext key
    pub async fn clear(&self) {
        let mut cache = self.cache.write().await;
        let dropped = cache.len();
        cache.clear();
        debug!(tier = %T::TIER, dropped, "Cleared cached keys");
    }

    pub async fn active_version(&self, partition: &str) -> KmsResult<Option<u64>> {
        let tier = T::TIER;
        let partition = Self::partition_of(partition).to_string();
        let version = self
            .repo
            .transaction(move |tx| {
                Box::pin(async move { tx.get_active_version(tier, &partition).await })
            })
            .await?;
        Ok(version)
    }

    /// Create version 1 and its active pointer
    pub async fn create(&self, partition: &str) -> KmsResult<u64> {
        let (key, record) = self.prepare_version(partition, 1).await?;
        let partition = record.partition.clone();

        self.repo
            .transaction(move |tx| {
                Box::pin(async move {
                    if tx.get_active_version(record.tier, &record.partition).await?.is_some() {
                        return Err(RepositoryError::Conflict(format!(
                            "{} key of partition '{}' already exists",
                            record.tier, record.partition
                        )));
                    }
                    tx.add_barrier_key(&record).await?;
                    tx.init_active_version(record.tier, &record.partition, record.version)
                        .await
                })
            })
            .await?;

        info!(tier = %T::TIER, partition = %partition, version = 1, "Created first key version");
        self.remember(&partition, 1, key).await;
        Ok(1)
    }

    /// Insert `expected + 1` and move the pointer from `expected` to it in
    /// one transaction. Concurrent callers with the same `expected` get
    /// `Conflict` except for one. `expected == 0` means no version yet.
    pub async fn rotate_from(&self, partition: &str, expected: u64) -> KmsResult<u64> {
        if expected == 0 {
            return self.create(partition).await;
        }
        let next = expected + 1;
        let (key, record) = self.prepare_version(partition, next).await?;
        let partition = record.partition.clone();

        self.repo
            .transaction(move |tx| {
                Box::pin(async move {
                    tx.add_barrier_key(&record).await?;
                    tx.swap_active_version(record.tier, &record.partition, expected, record.version)
                        .await
                })
            })
            .await?;

        info!(
            tier = %T::TIER,
            partition = %partition,
            from = expected,
            to = next,
            "Rotated key"
        );
        self.remember(&partition, next, key).await;
        Ok(next)
    }

    /// Active version and its plaintext, creating version 1 on demand for
    /// lazy tiers
    pub async fn get_active(&self, partition: &str) -> KmsResult<(u64, Key256)> {
        let partition = Self::partition_of(partition);
        let version = match self.active_version(partition).await? {
            Some(version) => version,
            None if T::LAZY => match self.create(partition).await {
                Ok(version) => version,
                // Someone else created it first
                Err(KmsError::Conflict(_)) => self
                    .active_version(partition)
                    .await?
                    .ok_or_else(|| KmsError::Internal(format!("{} pointer vanished", T::TIER)))?,
                Err(e) => return Err(e),
            },
            None => return Err(KmsError::NotFound(format!("no active {} key", T::TIER))),
        };

        let key = self.get_by_version(partition, version).await?;
        Ok((version, key))
    }

    /// Plaintext of a specific version, unwrapping through the parents
    pub async fn get_by_version(&self, partition: &str, version: u64) -> KmsResult<Key256> {
        let partition = Self::partition_of(partition).to_string();
        if let Some(key) = self.cache.read().await.get(&(partition.clone(), version)) {
            return Ok(key.clone());
        }

        let tier = T::TIER;
        let lookup = partition.clone();
        let record = self
            .repo
            .transaction(move |tx| {
                Box::pin(async move { tx.get_barrier_key(tier, &lookup, version).await })
            })
            .await?;

        let parent_key = self.parent.by_version(&partition, record.parent_version).await?;
        let key = self
            .wrapper
            .unwrap(
                &parent_key,
                &record.ciphertext,
                &Self::context(&partition, version, record.parent_version),
            )
            .map_err(|_| {
                KmsError::Internal(format!(
                    "{} key version {} of partition '{}' failed to unwrap",
                    tier, version, partition
                ))
            })?;

        self.remember(&partition, version, key.clone()).await;
        Ok(key)
    }
}

#[async_trait]
impl<T: TierKind> ParentKeys for TierService<T> {
    async fn active(&self, partition: &str) -> KmsResult<(u64, Key256)> {
        self.get_active(partition).await
    }

    async fn by_version(&self, partition: &str, version: u64) -> KmsResult<Key256> {
        self.get_by_version(partition, version).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wrap::Aes256GcmWrapper;

    struct Chain {
        unseal: Arc<UnsealedKey>,
        root: Arc<RootKeysService>,
        intermediate: Arc<IntermediateKeysService>,
        content: Arc<ContentKeysService>,
    }

    async fn chain() -> Chain {
        let repo = Repository::in_memory().await.unwrap();
        let wrapper: Arc<dyn KeyWrapper> = Arc::new(Aes256GcmWrapper);
        let unseal = Arc::new(UnsealedKey::new());
        unseal.install(random_key()).await;

        let root = Arc::new(RootKeysService::new(repo.clone(), unseal.clone(), wrapper.clone()));
        let intermediate = Arc::new(IntermediateKeysService::new(
            repo.clone(),
            root.clone(),
            wrapper.clone(),
        ));
        let content = Arc::new(ContentKeysService::new(repo, intermediate.clone(), wrapper));
        root.create(GLOBAL_PARTITION).await.unwrap();

        Chain {
            unseal,
            root,
            intermediate,
            content,
        }
    }

    #[tokio::test]
    async fn test_lazy_creation_and_idempotent_get_active() {
        let c = chain().await;
        assert_eq!(c.content.active_version("tenant").await.unwrap(), None);

        let (v1, k1) = c.content.get_active("tenant").await.unwrap();
        let (v2, k2) = c.content.get_active("tenant").await.unwrap();
        assert_eq!((v1, v2), (1, 1));
        assert_eq!(*k1, *k2);
        assert_eq!(c.intermediate.active_version("tenant").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_root_is_not_lazy_and_unpartitioned() {
        let repo = Repository::in_memory().await.unwrap();
        let unseal = Arc::new(UnsealedKey::new());
        unseal.install(random_key()).await;
        let root = RootKeysService::new(repo, unseal, Arc::new(Aes256GcmWrapper));
        assert!(matches!(root.get_active("any").await, Err(KmsError::NotFound(_))));

        root.create("ignored").await.unwrap();
        assert_eq!(root.active_version(GLOBAL_PARTITION).await.unwrap(), Some(1));
        assert_eq!(root.active_version("other").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_old_versions_survive_rotation_and_cache_clear() {
        let c = chain().await;
        let (_, k1) = c.content.get_active("tenant").await.unwrap();

        assert_eq!(c.root.rotate_from(GLOBAL_PARTITION, 1).await.unwrap(), 2);
        assert_eq!(c.intermediate.rotate_from("tenant", 1).await.unwrap(), 2);
        assert_eq!(c.content.rotate_from("tenant", 1).await.unwrap(), 2);

        c.content.clear().await;
        c.intermediate.clear().await;
        c.root.clear().await;

        let again = c.content.get_by_version("tenant", 1).await.unwrap();
        assert_eq!(*again, *k1);
        let (v, k2) = c.content.get_active("tenant").await.unwrap();
        assert_eq!(v, 2);
        assert_ne!(*k2, *k1);
    }

    #[tokio::test]
    async fn test_stale_rotation_conflicts() {
        let c = chain().await;
        c.intermediate.get_active("tenant").await.unwrap();
        assert_eq!(c.intermediate.rotate_from("tenant", 1).await.unwrap(), 2);
        assert!(matches!(
            c.intermediate.rotate_from("tenant", 1).await,
            Err(KmsError::Conflict(_))
        ));
        assert_eq!(c.intermediate.active_version("tenant").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_zero_expected_creates_once() {
        let c = chain().await;
        assert_eq!(c.content.rotate_from("tenant", 0).await.unwrap(), 1);
        assert!(matches!(
            c.content.rotate_from("tenant", 0).await,
            Err(KmsError::Conflict(_))
        ));
        assert!(matches!(
            c.root.rotate_from(GLOBAL_PARTITION, 0).await,
            Err(KmsError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_sealed_parent_blocks_uncached_unwrap() {
        let c = chain().await;
        c.content.get_active("tenant").await.unwrap();

        c.unseal.clear().await;
        c.content.clear().await;
        c.intermediate.clear().await;
        c.root.clear().await;

        assert!(matches!(c.content.get_active("tenant").await, Err(KmsError::Sealed)));
    }
}
