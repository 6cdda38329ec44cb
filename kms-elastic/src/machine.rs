//! Elastic-key lifecycle
//!
//! ```text
//! Requested -> Generating -> Active <-> Rotating
//!                  |           |
//!                  v           v
//!                Failed     Disabled
//! ```
//!
//! Every transition is a compare-and-swap in the repository, committed in the
//! same transaction as the material write that causes it.
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


use crate::material::{self, MacTag, Material, MaterialVersionInfo};
use kms_barrier::Barrier;
use kms_config::{KeygenDefaults, PoolSettings};
use kms_keygen::{CancellationToken, GenerationSpec, KeyGenPool, KeyMaterial, SubmitPolicy};
use kms_repository::{now_millis, ElasticKey, ElasticKeyFilter, MaterialKey, Repository};
use kms_types::telemetry::ELASTIC_TRANSITION;
use kms_types::{
    ElasticKeyState, KeyAlgorithm, KeyFamily, KmsError, KmsResult, PartitionId, Telemetry,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use ElasticKeyState::{Active, Disabled, Failed, Generating, Requested, Rotating};

/// Request to create an elastic key
#[derive(Debug, Clone)]
pub struct ElasticKeySpec {
    pub name: String,
    pub description: String,
    pub partition: PartitionId,
    pub algorithm: KeyAlgorithm,
    pub versioning_allowed: bool,
    /// Overrides the machine's default submission policy
    pub policy: Option<SubmitPolicy>,
    pub cancel: Option<CancellationToken>,
}

impl ElasticKeySpec {
    pub fn new(name: impl Into<String>, partition: impl Into<PartitionId>, algorithm: KeyAlgorithm) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            partition: partition.into(),
            algorithm,
            versioning_allowed: true,
            policy: None,
            cancel: None,
        }
    }

    /// Spec using the configured default algorithm of `family`
    pub fn for_family(
        name: impl Into<String>,
        partition: impl Into<PartitionId>,
        family: KeyFamily,
        defaults: &KeygenDefaults,
    ) -> KmsResult<Self> {
        let algorithm = defaults.algorithm_for(family).ok_or_else(|| {
            KmsError::Internal(format!("no default algorithm configured for {:?}", family))
        })?;
        Ok(Self::new(name, partition, algorithm))
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn without_versioning(mut self) -> Self {
        self.versioning_allowed = false;
        self
    }

    pub fn with_policy(mut self, policy: SubmitPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// How the machine talks to the generation pool
#[derive(Debug, Clone, Copy)]
pub struct MachineSettings {
    pub submit_policy: SubmitPolicy,
    pub generation_timeout: Duration,
}

impl MachineSettings {
    pub fn from_pool_settings(settings: &PoolSettings) -> Self {
        Self {
            submit_policy: SubmitPolicy::Block {
                timeout: settings.submit_timeout(),
            },
            generation_timeout: settings.generation_timeout(),
        }
    }
}

fn check_transition(current: ElasticKeyState, attempted: ElasticKeyState) -> KmsResult<()> {
    if current.can_transition_to(attempted) {
        Ok(())
    } else {
        Err(KmsError::InvalidState { current, attempted })
    }
}

/// Operations that need material require one of `allowed`; `attempted`
/// names the state the operation would need
fn require_state(
    key: &ElasticKey,
    allowed: &[ElasticKeyState],
    attempted: ElasticKeyState,
) -> KmsResult<()> {
    if allowed.contains(&key.state) {
        Ok(())
    } else {
        Err(KmsError::InvalidState {
            current: key.state,
            attempted,
        })
    }
}

fn require_family(key: &ElasticKey, family: KeyFamily, operation: &str) -> KmsResult<()> {
    if key.algorithm.family() == family {
        Ok(())
    } else {
        Err(KmsError::Conflict(format!(
            "elastic key {} uses {}, which does not support {}",
            key.id, key.algorithm, operation
        )))
    }
}

fn is_cancelled(cancel: &Option<CancellationToken>) -> bool {
    cancel.as_ref().is_some_and(|c| c.is_cancelled())
}

/// Outcome of [`ElasticKeyStateMachine::recover_interrupted`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// `Generating` keys moved to `Failed`
    pub failed: usize,
    /// `Rotating` keys moved back to `Active`
    pub reverted: usize,
}

/// Drives elastic keys through their lifecycle
pub struct ElasticKeyStateMachine {
    repo: Repository,
    barrier: Arc<Barrier>,
    pool: Arc<KeyGenPool>,
    settings: MachineSettings,
    telemetry: Arc<dyn Telemetry>,
}

impl ElasticKeyStateMachine {
    pub fn new(
        repo: Repository,
        barrier: Arc<Barrier>,
        pool: Arc<KeyGenPool>,
        settings: MachineSettings,
        telemetry: Arc<dyn Telemetry>,
    ) -> Self {
        Self {
            repo,
            barrier,
            pool,
            settings,
            telemetry,
        }
    }

    pub fn barrier(&self) -> &Arc<Barrier> {
        &self.barrier
    }

    pub fn pool(&self) -> &Arc<KeyGenPool> {
        &self.pool
    }

    async fn load(&self, id: Uuid) -> KmsResult<ElasticKey> {
        let key = self
            .repo
            .transaction(move |tx| Box::pin(async move { tx.get_elastic_key(id).await }))
            .await?;
        Ok(key)
    }

    fn record_transition(&self, id: Uuid, from: ElasticKeyState, to: ElasticKeyState) {
        self.telemetry.counter(
            ELASTIC_TRANSITION,
            1,
            &[("from", from.as_str()), ("to", to.as_str())],
        );
        info!(elastic_key_id = %id, from = %from, to = %to, "Elastic key state changed");
    }

    /// Standalone transition without an accompanying material write
    async fn transition(&self, id: Uuid, from: ElasticKeyState, to: ElasticKeyState) -> KmsResult<()> {
        check_transition(from, to)?;
        self.repo
            .transaction(move |tx| {
                Box::pin(async move { tx.transition_elastic_key_state(id, from, to).await })
            })
            .await?;
        self.record_transition(id, from, to);
        Ok(())
    }

    async fn generate(
        &self,
        key: &ElasticKey,
        policy: SubmitPolicy,
        cancel: Option<CancellationToken>,
    ) -> KmsResult<KeyMaterial> {
        let spec = GenerationSpec::new(key.algorithm, key.id.to_string());
        let ticket = self.pool.submit(spec, policy, cancel).await?;
        let material = ticket.wait_timeout(self.settings.generation_timeout).await?;
        debug!(elastic_key_id = %key.id, algorithm = %key.algorithm, "Material generated");
        Ok(material)
    }

    /// Create a key and its first material version.
    ///
    /// Returns the key in `Active`. Any failure after admission leaves it
    /// `Failed` and returns the cause.
    pub async fn create(&self, spec: ElasticKeySpec) -> KmsResult<ElasticKey> {
        self.barrier.check_unsealed().await?;

        let now = now_millis();
        let key = ElasticKey {
            id: Uuid::new_v4(),
            name: spec.name,
            description: spec.description,
            partition: spec.partition,
            algorithm: spec.algorithm,
            state: Requested,
            versioning_allowed: spec.versioning_allowed,
            created_at: now,
            updated_at: now,
        };
        let id = key.id;

        let row = key.clone();
        self.repo
            .transaction(move |tx| Box::pin(async move { tx.add_elastic_key(&row).await }))
            .await?;
        info!(
            elastic_key_id = %id,
            name = %key.name,
            partition = %key.partition,
            algorithm = %key.algorithm,
            "Elastic key requested"
        );

        self.transition(id, Requested, Generating).await?;

        let policy = spec.policy.unwrap_or(self.settings.submit_policy);
        if let Err(cause) = self.activate_first(&key, policy, spec.cancel).await {
            error!(elastic_key_id = %id, error = %cause, "Elastic key generation failed");
            if let Err(e) = self.transition(id, Generating, Failed).await {
                error!(elastic_key_id = %id, error = %e, "Could not mark elastic key failed");
            }
            return Err(cause);
        }

        self.load(id).await
    }

    async fn activate_first(
        &self,
        key: &ElasticKey,
        policy: SubmitPolicy,
        cancel: Option<CancellationToken>,
    ) -> KmsResult<()> {
        let material = self.generate(key, policy, cancel.clone()).await?;
        let sealed = self.barrier.encrypt(&key.partition, &material.private).await?;
        if is_cancelled(&cancel) {
            return Err(KmsError::Timeout("generation cancelled".to_string()));
        }

        let id = key.id;
        let row = MaterialKey {
            elastic_key_id: id,
            version: 1,
            is_primary: true,
            revoked: false,
            public_material: material.public.clone(),
            sealed_private: sealed,
            created_at: now_millis(),
        };
        self.repo
            .transaction(move |tx| {
                Box::pin(async move {
                    tx.add_material_key(&row).await?;
                    tx.transition_elastic_key_state(id, Generating, Active).await
                })
            })
            .await?;

        self.record_transition(id, Generating, Active);
        Ok(())
    }

    /// Add a new primary material version using the default policy
    pub async fn rotate(&self, id: Uuid) -> KmsResult<MaterialVersionInfo> {
        self.rotate_with(id, self.settings.submit_policy, None).await
    }

    /// Add a new primary material version. Earlier versions stay readable.
    ///
    /// A failed rotation returns the key to `Active` with the previous
    /// primary untouched.
    pub async fn rotate_with(
        &self,
        id: Uuid,
        policy: SubmitPolicy,
        cancel: Option<CancellationToken>,
    ) -> KmsResult<MaterialVersionInfo> {
        self.barrier.check_unsealed().await?;

        let key = self.load(id).await?;
        check_transition(key.state, Rotating)?;
        if !key.versioning_allowed {
            return Err(KmsError::Conflict(format!(
                "versioning not allowed for elastic key {}",
                id
            )));
        }

        self.transition(id, Active, Rotating).await?;

        match self.activate_next(&key, policy, cancel).await {
            Ok(info) => Ok(info),
            Err(cause) => {
                warn!(elastic_key_id = %id, error = %cause, "Rotation failed, reverting");
                if let Err(e) = self.transition(id, Rotating, Active).await {
                    error!(elastic_key_id = %id, error = %e, "Could not revert rotating elastic key");
                }
                Err(cause)
            }
        }
    }

    async fn activate_next(
        &self,
        key: &ElasticKey,
        policy: SubmitPolicy,
        cancel: Option<CancellationToken>,
    ) -> KmsResult<MaterialVersionInfo> {
        let material = self.generate(key, policy, cancel.clone()).await?;
        let sealed = self.barrier.encrypt(&key.partition, &material.private).await?;
        if is_cancelled(&cancel) {
            return Err(KmsError::Timeout("generation cancelled".to_string()));
        }

        let id = key.id;
        let public = material.public.clone();
        let row = self
            .repo
            .transaction(move |tx| {
                Box::pin(async move {
                    let version = tx.latest_material_version(id).await? + 1;
                    tx.clear_primary_material_key(id).await?;
                    let row = MaterialKey {
                        elastic_key_id: id,
                        version,
                        is_primary: true,
                        revoked: false,
                        public_material: public,
                        sealed_private: sealed,
                        created_at: now_millis(),
                    };
                    tx.add_material_key(&row).await?;
                    tx.transition_elastic_key_state(id, Rotating, Active).await?;
                    Ok(row)
                })
            })
            .await?;

        self.record_transition(id, Rotating, Active);
        info!(elastic_key_id = %id, version = row.version, "New primary material version");
        Ok(MaterialVersionInfo::from(&row))
    }

    /// Settle keys left mid-transition by a process that stopped.
    ///
    /// `Generating` keys never got their first material and become `Failed`;
    /// `Rotating` keys never got their new primary and return to `Active`.
    /// Meant to run at startup, before requests are accepted. Keys that
    /// another caller moves in the meantime are skipped.
    pub async fn recover_interrupted(&self) -> KmsResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for (from, to) in [(Generating, Failed), (Rotating, Active)] {
            let filter = ElasticKeyFilter {
                state: Some(from),
                ..ElasticKeyFilter::default()
            };
            for key in self.list(filter).await? {
                match self.transition(key.id, from, to).await {
                    Ok(()) if to == Failed => report.failed += 1,
                    Ok(()) => report.reverted += 1,
                    Err(KmsError::Conflict(_)) | Err(KmsError::NotFound(_)) => {
                        debug!(elastic_key_id = %key.id, "Elastic key moved during recovery")
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        if report.failed + report.reverted > 0 {
            warn!(
                failed = report.failed,
                reverted = report.reverted,
                "Recovered interrupted elastic keys"
            );
        }
        Ok(report)
    }

    /// Stop new operations; history stays available for decrypt and audit
    pub async fn disable(&self, id: Uuid) -> KmsResult<ElasticKey> {
        let key = self.load(id).await?;
        self.transition(id, key.state, Disabled).await?;
        self.load(id).await
    }

    pub async fn get(&self, id: Uuid) -> KmsResult<ElasticKey> {
        self.load(id).await
    }

    pub async fn list(&self, filter: ElasticKeyFilter) -> KmsResult<Vec<ElasticKey>> {
        let keys = self
            .repo
            .transaction(move |tx| Box::pin(async move { tx.list_elastic_keys(&filter).await }))
            .await?;
        Ok(keys)
    }

    pub async fn update_metadata(
        &self,
        id: Uuid,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> KmsResult<ElasticKey> {
        let key = self.load(id).await?;
        if key.state == Failed {
            return Err(KmsError::Conflict(format!("elastic key {} has failed", id)));
        }

        let name = name.into();
        let description = description.into();
        let updated = self
            .repo
            .transaction(move |tx| {
                Box::pin(async move { tx.update_elastic_key_metadata(id, &name, &description).await })
            })
            .await?;
        Ok(updated)
    }

    async fn unseal_material(&self, key: &ElasticKey, row: MaterialKey) -> KmsResult<Material> {
        let private = self.barrier.decrypt(&key.partition, &row.sealed_private).await?;
        Ok(Material {
            elastic_key_id: row.elastic_key_id,
            version: row.version,
            algorithm: key.algorithm,
            is_primary: row.is_primary,
            revoked: row.revoked,
            public: row.public_material,
            private,
            created_at: row.created_at,
        })
    }

    async fn primary_material(&self, key: &ElasticKey) -> KmsResult<Material> {
        require_state(key, &[Active, Rotating], Active)?;
        let id = key.id;
        let row = self
            .repo
            .transaction(move |tx| Box::pin(async move { tx.get_primary_material_key(id).await }))
            .await?;
        self.unseal_material(key, row).await
    }

    async fn material_version(&self, key: &ElasticKey, version: u64) -> KmsResult<Material> {
        require_state(key, &[Active, Rotating, Disabled], Active)?;
        let id = key.id;
        let row = self
            .repo
            .transaction(move |tx| {
                Box::pin(async move { tx.get_material_key(id, version).await })
            })
            .await?;
        self.unseal_material(key, row).await
    }

    /// Material used for new operations
    pub async fn get_primary_material(&self, id: Uuid) -> KmsResult<Material> {
        let key = self.load(id).await?;
        self.primary_material(&key).await
    }

    pub async fn get_material_version(&self, id: Uuid, version: u64) -> KmsResult<Material> {
        let key = self.load(id).await?;
        self.material_version(&key, version).await
    }

    /// Version metadata in ascending order, without secrets
    pub async fn list_material_versions(&self, id: Uuid) -> KmsResult<Vec<MaterialVersionInfo>> {
        self.load(id).await?;
        let rows = self
            .repo
            .transaction(move |tx| Box::pin(async move { tx.list_material_keys(id).await }))
            .await?;
        Ok(rows.iter().map(MaterialVersionInfo::from).collect())
    }

    /// Retire a non-primary version; it can no longer decrypt or verify
    pub async fn revoke_material_version(&self, id: Uuid, version: u64) -> KmsResult<()> {
        let key = self.load(id).await?;
        require_state(&key, &[Active, Disabled], Active)?;

        let row = self
            .repo
            .transaction(move |tx| {
                Box::pin(async move {
                    let row = tx.get_material_key(id, version).await?;
                    if !row.is_primary && !row.revoked {
                        tx.revoke_material_key(id, version).await?;
                    }
                    Ok(row)
                })
            })
            .await?;

        if row.is_primary {
            return Err(KmsError::Conflict(format!(
                "version {} is the primary material of elastic key {}",
                version, id
            )));
        }
        info!(elastic_key_id = %id, version, "Material version revoked");
        Ok(())
    }

    /// AES-GCM under the primary version
    pub async fn encrypt(&self, id: Uuid, plaintext: &[u8]) -> KmsResult<Vec<u8>> {
        let key = self.load(id).await?;
        require_family(&key, KeyFamily::Aes, "encryption")?;
        let material = self.primary_material(&key).await?;
        material::encrypt(key.algorithm, &material.private, id, material.version, plaintext)
    }

    /// Decrypt with the version recorded in the payload; allowed on disabled keys
    pub async fn decrypt(&self, id: Uuid, payload: &[u8]) -> KmsResult<Zeroizing<Vec<u8>>> {
        let key = self.load(id).await?;
        require_family(&key, KeyFamily::Aes, "decryption")?;
        let version = material::payload_version(payload)?;
        let material = self.material_version(&key, version).await?;
        if material.revoked {
            return Err(KmsError::Conflict(format!(
                "material version {} of elastic key {} is revoked",
                version, id
            )));
        }
        material::decrypt(key.algorithm, &material.private, id, payload)
    }

    /// HMAC under the primary version
    pub async fn sign(&self, id: Uuid, data: &[u8]) -> KmsResult<MacTag> {
        let key = self.load(id).await?;
        require_family(&key, KeyFamily::Hmac, "signing")?;
        let material = self.primary_material(&key).await?;
        let tag = material::sign(key.algorithm, &material.private, data)?;
        Ok(MacTag {
            version: material.version,
            tag,
        })
    }

    pub async fn verify(&self, id: Uuid, data: &[u8], tag: &MacTag) -> KmsResult<bool> {
        let key = self.load(id).await?;
        require_family(&key, KeyFamily::Hmac, "verification")?;
        let material = self.material_version(&key, tag.version).await?;
        if material.revoked {
            return Ok(false);
        }
        material::verify(key.algorithm, &material.private, data, &tag.tag)
    }
}
