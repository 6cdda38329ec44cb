//! Barrier orchestrator
//!
//! Owns the unseal state and the three tier services, and turns content keys
//! into sealed blobs for callers.
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


use crate::blob;
use crate::tiers::{
    ContentKeysService, IntermediateKeysService, RootKeysService, UnsealedKey,
};
use crate::unseal::{UnsealService, UnsealShare};
use crate::wrap::{aead_decrypt, aead_encrypt, Aes256GcmWrapper, Key256, KeyWrapper};
use kms_config::UnsealConfig;
use kms_repository::{Repository, UnsealSlot};
use kms_types::telemetry::{
    BARRIER_DECRYPT, BARRIER_ENCRYPT, BARRIER_ROTATE, BARRIER_SEALED_REJECTIONS, BARRIER_UNSEAL,
};
use kms_types::{KmsError, KmsResult, Telemetry, Tier, GLOBAL_PARTITION};
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

/// Handle to the key hierarchy. Starts sealed.
pub struct Barrier {
    repo: Repository,
    unseal: UnsealService,
    unsealed: Arc<UnsealedKey>,
    root: Arc<RootKeysService>,
    intermediate: Arc<IntermediateKeysService>,
    content: Arc<ContentKeysService>,
    /// `true` while sealed; writers are seal and unseal
    sealed: RwLock<bool>,
    telemetry: Arc<dyn Telemetry>,
}

impl Barrier {
    pub fn new(repo: Repository, config: UnsealConfig, telemetry: Arc<dyn Telemetry>) -> Self {
        Self::with_wrapper(repo, config, Arc::new(Aes256GcmWrapper), telemetry)
    }

    pub fn with_wrapper(
        repo: Repository,
        config: UnsealConfig,
        wrapper: Arc<dyn KeyWrapper>,
        telemetry: Arc<dyn Telemetry>,
    ) -> Self {
        let unsealed = Arc::new(UnsealedKey::new());
        let root = Arc::new(RootKeysService::new(
            repo.clone(),
            unsealed.clone(),
            wrapper.clone(),
        ));
        let intermediate = Arc::new(IntermediateKeysService::new(
            repo.clone(),
            root.clone(),
            wrapper.clone(),
        ));
        let content = Arc::new(ContentKeysService::new(
            repo.clone(),
            intermediate.clone(),
            wrapper,
        ));

        Self {
            unseal: UnsealService::new(repo.clone(), config),
            repo,
            unsealed,
            root,
            intermediate,
            content,
            sealed: RwLock::new(true),
            telemetry,
        }
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    pub async fn is_sealed(&self) -> bool {
        *self.sealed.read().await
    }

    /// Whether unseal slots and a root key have been persisted
    pub async fn is_initialized(&self) -> KmsResult<bool> {
        self.unseal.is_initialized().await
    }

    /// Unseal with operator shares.
    ///
    /// A barrier without derivation metadata is initialized when exactly N
    /// shares are supplied. Any failure leaves the barrier sealed with every
    /// cached key dropped, including a barrier that was unsealed before.
    pub async fn unseal(&self, shares: &[UnsealShare]) -> KmsResult<()> {
        let mut sealed = self.sealed.write().await;

        let result = self.unseal_locked(shares).await;
        match &result {
            Ok(()) => {
                *sealed = false;
                self.telemetry.counter(BARRIER_UNSEAL, 1, &[("outcome", "ok")]);
                info!(shares = shares.len(), "Barrier unsealed");
            }
            Err(e) => {
                self.wipe().await;
                *sealed = true;
                self.telemetry.counter(BARRIER_UNSEAL, 1, &[("outcome", e.kind())]);
                warn!(shares = shares.len(), error = %e, "Unseal attempt failed");
            }
        }
        result
    }

    async fn unseal_locked(&self, shares: &[UnsealShare]) -> KmsResult<()> {
        if !self.unseal.is_initialized().await? {
            return self.initialize(shares).await;
        }

        let key = self.unseal.unseal(shares).await?;
        self.unsealed.install(key).await;

        // The root key must open under the recovered key
        self.root.clear().await;
        if let Err(e) = self.root.get_active(GLOBAL_PARTITION).await {
            error!(error = %e, "Root key did not open under the unseal-derived key");
            self.unsealed.clear().await;
            return Err(e);
        }
        Ok(())
    }

    async fn initialize(&self, shares: &[UnsealShare]) -> KmsResult<()> {
        let required = self.unseal.config().shares;
        self.unseal.validate_shares(shares)?;
        if shares.len() != required {
            return Err(KmsError::InvalidShares(format!(
                "barrier is not initialized; all {} shares are required",
                required
            )));
        }

        let (unseal_key, slots) = self.unseal.build_slots(shares).await?;
        self.unsealed.install(unseal_key).await;

        let persisted = self.persist_initial_root(slots).await;
        if let Err(e) = persisted {
            self.unsealed.clear().await;
            return Err(e);
        }

        info!(
            threshold = self.unseal.config().threshold,
            shares = required,
            "Barrier initialized"
        );
        Ok(())
    }

    async fn persist_initial_root(&self, slots: Vec<UnsealSlot>) -> KmsResult<()> {
        let (root_key, record) = self.root.prepare_version(GLOBAL_PARTITION, 1).await?;

        self.repo
            .transaction(move |tx| {
                Box::pin(async move {
                    for slot in &slots {
                        tx.add_unseal_slot(slot).await?;
                    }
                    tx.add_barrier_key(&record).await?;
                    tx.init_active_version(record.tier, &record.partition, record.version)
                        .await
                })
            })
            .await?;

        self.root.remember(GLOBAL_PARTITION, 1, root_key).await;
        Ok(())
    }

    /// Drop every plaintext key held in memory
    pub async fn seal(&self) {
        let mut sealed = self.sealed.write().await;
        self.wipe().await;

        if !*sealed {
            info!("Barrier sealed");
        }
        *sealed = true;
    }

    /// Top of the chain first, so nothing below can be unwrapped again
    async fn wipe(&self) {
        self.unsealed.clear().await;
        self.root.clear().await;
        self.intermediate.clear().await;
        self.content.clear().await;
    }

    pub async fn shutdown(&self) {
        debug!("Shutting down barrier");
        self.seal().await;
    }

    async fn open(&self, operation: &'static str) -> KmsResult<RwLockReadGuard<'_, bool>> {
        let sealed = self.sealed.read().await;
        if *sealed {
            self.telemetry
                .counter(BARRIER_SEALED_REJECTIONS, 1, &[("operation", operation)]);
            return Err(KmsError::Sealed);
        }
        Ok(sealed)
    }

    /// Encrypt under the partition's active content key
    pub async fn encrypt(&self, partition: &str, plaintext: &[u8]) -> KmsResult<Vec<u8>> {
        let _open = self.open("encrypt").await?;

        let (version, key) = self.content.get_active(partition).await?;
        let header = blob::encode_header(version);
        let body = aead_encrypt(&key, plaintext, &blob::associated_data(&header, partition))?;

        let mut sealed = Vec::with_capacity(header.len() + body.len());
        sealed.extend_from_slice(&header);
        sealed.extend_from_slice(&body);

        self.telemetry.counter(BARRIER_ENCRYPT, 1, &[]);
        debug!(partition, content_version = version, len = plaintext.len(), "Encrypted");
        Ok(sealed)
    }

    /// Decrypt a blob produced by [`Barrier::encrypt`] for the same partition
    pub async fn decrypt(&self, partition: &str, sealed: &[u8]) -> KmsResult<Zeroizing<Vec<u8>>> {
        let _open = self.open("decrypt").await?;

        let (version, header, body) = blob::parse(sealed)?;
        let key: Key256 = self.content.get_by_version(partition, version).await?;
        let plaintext = aead_decrypt(&key, body, &blob::associated_data(header, partition))?;

        self.telemetry.counter(BARRIER_DECRYPT, 1, &[]);
        debug!(partition, content_version = version, "Decrypted");
        Ok(plaintext)
    }

    /// Active version of a tier in `partition`, `None` before first use
    pub async fn active_version(&self, tier: Tier, partition: &str) -> KmsResult<Option<u64>> {
        let _open = self.open("active_version").await?;
        match tier {
            Tier::Root => self.root.active_version(GLOBAL_PARTITION).await,
            Tier::Intermediate => self.intermediate.active_version(partition).await,
            Tier::Content => self.content.active_version(partition).await,
        }
    }

    /// Rotate `tier` in `partition` from the version the caller last saw.
    ///
    /// Exactly one of several callers passing the same `expected` wins; the
    /// others get `Conflict` and may re-read [`Barrier::active_version`] and
    /// retry. `expected == 0` creates the first version of a lazy tier.
    pub async fn rotate(&self, tier: Tier, partition: &str, expected: u64) -> KmsResult<u64> {
        let _open = self.open("rotate").await?;
        let version = match tier {
            Tier::Root => self.root.rotate_from(GLOBAL_PARTITION, expected).await,
            Tier::Intermediate => self.intermediate.rotate_from(partition, expected).await,
            Tier::Content => self.content.rotate_from(partition, expected).await,
        };
        self.record_rotation(tier, version)
    }

    pub async fn rotate_root(&self, expected: u64) -> KmsResult<u64> {
        self.rotate(Tier::Root, GLOBAL_PARTITION, expected).await
    }

    pub async fn rotate_intermediate(&self, partition: &str, expected: u64) -> KmsResult<u64> {
        self.rotate(Tier::Intermediate, partition, expected).await
    }

    pub async fn rotate_content(&self, partition: &str, expected: u64) -> KmsResult<u64> {
        self.rotate(Tier::Content, partition, expected).await
    }

    fn record_rotation(&self, tier: Tier, version: KmsResult<u64>) -> KmsResult<u64> {
        let outcome = match &version {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        self.telemetry
            .counter(BARRIER_ROTATE, 1, &[("tier", tier.as_str()), ("outcome", outcome)]);
        version
    }

    /// `Sealed` unless the barrier is currently unsealed
    pub async fn check_unsealed(&self) -> KmsResult<()> {
        self.open("check").await.map(|_| ())
    }
}
