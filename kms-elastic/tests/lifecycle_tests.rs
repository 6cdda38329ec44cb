//! Elastic-key lifecycle tests against an in-memory repository

use kms_barrier::{Barrier, UnsealShare};
use kms_config::KmsConfig;
use kms_elastic::{ElasticKeySpec, ElasticKeyStateMachine, MachineSettings, RecoveryReport};
use kms_keygen::{
    CancellationToken, DefaultGenerator, GenerationSpec, KeyGenPool, KeyMaterial,
    MaterialGenerator, PoolConfig, PoolError, PoolResult, SubmitPolicy,
};
use kms_repository::{now_millis, ElasticKey, ElasticKeyFilter, Repository};
use kms_types::telemetry::ELASTIC_TRANSITION;
use kms_types::{ElasticKeyState, KeyAlgorithm, KeyFamily, KmsError, RecordingTelemetry};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

fn shares() -> Vec<UnsealShare> {
    (1..=5u8).map(|i| UnsealShare::new(i, vec![i + 100; 40])).collect()
}

struct Harness {
    repo: Repository,
    machine: Arc<ElasticKeyStateMachine>,
    pool: Arc<KeyGenPool>,
    telemetry: Arc<RecordingTelemetry>,
}

async fn harness_with(generator: Arc<dyn MaterialGenerator>, workers: usize, queue_bound: usize) -> Harness {
    kms_logging::init_test_logging();
    let repo = Repository::in_memory().await.unwrap();
    let telemetry = RecordingTelemetry::new();

    let barrier = Arc::new(Barrier::new(
        repo.clone(),
        KmsConfig::default().unseal,
        telemetry.clone(),
    ));
    barrier.unseal(&shares()).await.unwrap();

    let pool = Arc::new(
        KeyGenPool::new(
            PoolConfig {
                name: "elastic-test".to_string(),
                workers,
                queue_bound,
                shutdown_timeout: Duration::from_secs(1),
            },
            generator,
            telemetry.clone(),
        )
        .unwrap(),
    );

    let settings = MachineSettings {
        submit_policy: SubmitPolicy::FailFast,
        generation_timeout: Duration::from_secs(30),
    };
    let machine = Arc::new(ElasticKeyStateMachine::new(
        repo.clone(),
        barrier,
        pool.clone(),
        settings,
        telemetry.clone(),
    ));

    Harness {
        repo,
        machine,
        pool,
        telemetry,
    }
}

async fn harness() -> Harness {
    harness_with(Arc::new(DefaultGenerator), 2, 4).await
}

async fn state_of(machine: &ElasticKeyStateMachine, name: &str) -> ElasticKeyState {
    let keys = machine
        .list(ElasticKeyFilter {
            name_contains: Some(name.to_string()),
            ..ElasticKeyFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(keys.len(), 1, "expected one key named {}", name);
    keys[0].state
}

struct FailingGenerator;

impl MaterialGenerator for FailingGenerator {
    fn generate(&self, _spec: &GenerationSpec) -> PoolResult<KeyMaterial> {
        Err(PoolError::Generation("entropy source unavailable".to_string()))
    }
}

/// Blocks every generation until `open` is called
#[derive(Default)]
struct GatedGenerator {
    open: Mutex<bool>,
    changed: Condvar,
}

impl GatedGenerator {
    fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.changed.notify_all();
    }
}

impl MaterialGenerator for GatedGenerator {
    fn generate(&self, spec: &GenerationSpec) -> PoolResult<KeyMaterial> {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.changed.wait(open).unwrap();
        }
        drop(open);
        DefaultGenerator.generate(spec)
    }
}

async fn wait_for(pool: &KeyGenPool, check: impl Fn(&kms_keygen::PoolStats) -> bool) {
    for _ in 0..500 {
        if check(&pool.stats()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("pool never reached the expected state: {:?}", pool.stats());
}

#[tokio::test]
async fn test_create_reaches_active_through_generating() {
    let h = harness().await;
    let key = h
        .machine
        .create(ElasticKeySpec::new("orders", "tenant-a", KeyAlgorithm::Aes256).with_description("order data"))
        .await
        .unwrap();

    assert_eq!(key.state, ElasticKeyState::Active);
    assert_eq!(key.description, "order data");
    assert_eq!(h.telemetry.counter_total(ELASTIC_TRANSITION), 2);

    let primary = h.machine.get_primary_material(key.id).await.unwrap();
    assert_eq!(primary.version, 1);
    assert!(primary.is_primary);
    assert_eq!(primary.private.len(), 32);
    assert!(primary.public.is_none());
}

#[tokio::test]
async fn test_ec_material_keeps_public_point() {
    let h = harness().await;
    let key = h
        .machine
        .create(ElasticKeySpec::new("signer", "tenant-a", KeyAlgorithm::EcP256))
        .await
        .unwrap();

    let versions = h.machine.list_material_versions(key.id).await.unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].public.as_ref().map(|p| p.len()), Some(65));
}

#[tokio::test]
async fn test_family_defaults_pick_configured_algorithm() {
    let h = harness().await;
    let mut defaults = KmsConfig::default().keygen;
    defaults.default_aes_bits = 128;

    let spec = ElasticKeySpec::for_family("cache", "tenant-a", KeyFamily::Aes, &defaults).unwrap();
    assert_eq!(spec.algorithm, KeyAlgorithm::Aes128);
    let key = h.machine.create(spec).await.unwrap();
    assert_eq!(h.machine.get_primary_material(key.id).await.unwrap().private.len(), 16);

    defaults.default_ec_curve = "P-521".to_string();
    assert!(ElasticKeySpec::for_family("x", "tenant-a", KeyFamily::Ec, &defaults).is_err());
}

#[tokio::test]
async fn test_generation_failure_marks_key_failed() {
    let h = harness_with(Arc::new(FailingGenerator), 1, 1).await;
    let result = h
        .machine
        .create(ElasticKeySpec::new("broken", "p", KeyAlgorithm::Aes128))
        .await;

    assert!(matches!(result, Err(KmsError::Internal(_))));
    assert_eq!(state_of(&h.machine, "broken").await, ElasticKeyState::Failed);
}

#[tokio::test]
async fn test_cancelled_request_marks_key_failed() {
    let h = harness().await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = h
        .machine
        .create(ElasticKeySpec::new("cancelled", "p", KeyAlgorithm::Aes128).with_cancel(cancel))
        .await;

    assert!(matches!(result, Err(KmsError::Timeout(_))));
    assert_eq!(state_of(&h.machine, "cancelled").await, ElasticKeyState::Failed);
}

#[tokio::test]
async fn test_saturated_pool_fails_excess_request_only() {
    let gate = Arc::new(GatedGenerator::default());
    let h = harness_with(gate.clone(), 1, 1).await;

    let machine = h.machine.clone();
    let first = tokio::spawn(async move {
        machine
            .create(ElasticKeySpec::new("first", "p", KeyAlgorithm::HmacSha256))
            .await
    });
    wait_for(&h.pool, |s| s.in_flight == 1).await;

    let machine = h.machine.clone();
    let second = tokio::spawn(async move {
        machine
            .create(ElasticKeySpec::new("second", "p", KeyAlgorithm::HmacSha256))
            .await
    });
    wait_for(&h.pool, |s| s.queued == 1).await;

    let third = h
        .machine
        .create(ElasticKeySpec::new("third", "p", KeyAlgorithm::HmacSha256))
        .await;
    assert_eq!(third.unwrap_err(), KmsError::Saturated);
    assert_eq!(state_of(&h.machine, "third").await, ElasticKeyState::Failed);

    gate.open();
    assert_eq!(first.await.unwrap().unwrap().state, ElasticKeyState::Active);
    assert_eq!(second.await.unwrap().unwrap().state, ElasticKeyState::Active);
}

#[tokio::test]
async fn test_sealed_barrier_creates_nothing() {
    let h = harness().await;
    h.machine.barrier().seal().await;

    let result = h
        .machine
        .create(ElasticKeySpec::new("sealed", "p", KeyAlgorithm::Aes256))
        .await;
    assert_eq!(result.unwrap_err(), KmsError::Sealed);
    assert!(h.machine.list(ElasticKeyFilter::default()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_rotation_keeps_old_versions_decryptable() {
    let h = harness().await;
    let key = h
        .machine
        .create(ElasticKeySpec::new("docs", "tenant", KeyAlgorithm::Aes256))
        .await
        .unwrap();

    let old = h.machine.encrypt(key.id, b"version one").await.unwrap();
    let rotated = h.machine.rotate(key.id).await.unwrap();
    assert_eq!(rotated.version, 2);
    assert!(rotated.is_primary);
    let new = h.machine.encrypt(key.id, b"version two").await.unwrap();

    assert_eq!(h.machine.decrypt(key.id, &old).await.unwrap().as_slice(), b"version one");
    assert_eq!(h.machine.decrypt(key.id, &new).await.unwrap().as_slice(), b"version two");
    assert_eq!(h.machine.get(key.id).await.unwrap().state, ElasticKeyState::Active);

    let versions = h.machine.list_material_versions(key.id).await.unwrap();
    assert_eq!(
        versions.iter().map(|v| (v.version, v.is_primary)).collect::<Vec<_>>(),
        vec![(1, false), (2, true)]
    );
    let first = h.machine.get_material_version(key.id, 1).await.unwrap();
    assert!(!first.is_primary);
}

#[tokio::test]
async fn test_versioning_disallowed_rejects_rotation() {
    let h = harness().await;
    let key = h
        .machine
        .create(ElasticKeySpec::new("fixed", "p", KeyAlgorithm::Aes128).without_versioning())
        .await
        .unwrap();

    assert!(matches!(h.machine.rotate(key.id).await, Err(KmsError::Conflict(_))));
    assert_eq!(h.machine.get(key.id).await.unwrap().state, ElasticKeyState::Active);
}

#[tokio::test]
async fn test_disabled_key_is_decrypt_only() {
    let h = harness().await;
    let key = h
        .machine
        .create(ElasticKeySpec::new("archive", "p", KeyAlgorithm::Aes192))
        .await
        .unwrap();
    let payload = h.machine.encrypt(key.id, b"keep me").await.unwrap();

    let disabled = h.machine.disable(key.id).await.unwrap();
    assert_eq!(disabled.state, ElasticKeyState::Disabled);

    assert_eq!(
        h.machine.encrypt(key.id, b"new").await.unwrap_err(),
        KmsError::InvalidState {
            current: ElasticKeyState::Disabled,
            attempted: ElasticKeyState::Active,
        }
    );
    assert_eq!(
        h.machine.rotate(key.id).await.unwrap_err(),
        KmsError::InvalidState {
            current: ElasticKeyState::Disabled,
            attempted: ElasticKeyState::Rotating,
        }
    );
    assert!(matches!(
        h.machine.disable(key.id).await,
        Err(KmsError::InvalidState { .. })
    ));
    assert!(matches!(
        h.machine.get_primary_material(key.id).await,
        Err(KmsError::InvalidState { .. })
    ));
    assert_eq!(h.machine.decrypt(key.id, &payload).await.unwrap().as_slice(), b"keep me");
    assert_eq!(h.machine.get_material_version(key.id, 1).await.unwrap().version, 1);
}

#[tokio::test]
async fn test_revoked_version_stops_verifying() {
    let h = harness().await;
    let key = h
        .machine
        .create(ElasticKeySpec::new("mac", "p", KeyAlgorithm::HmacSha512))
        .await
        .unwrap();

    let old_tag = h.machine.sign(key.id, b"message").await.unwrap();
    assert_eq!(old_tag.tag.len(), 64);
    h.machine.rotate(key.id).await.unwrap();
    let new_tag = h.machine.sign(key.id, b"message").await.unwrap();
    assert_eq!(new_tag.version, 2);

    assert!(h.machine.verify(key.id, b"message", &old_tag).await.unwrap());
    assert!(!h.machine.verify(key.id, b"tampered", &new_tag).await.unwrap());

    assert!(matches!(
        h.machine.revoke_material_version(key.id, 2).await,
        Err(KmsError::Conflict(_))
    ));
    h.machine.revoke_material_version(key.id, 1).await.unwrap();
    assert!(!h.machine.verify(key.id, b"message", &old_tag).await.unwrap());
    assert!(h.machine.verify(key.id, b"message", &new_tag).await.unwrap());
}

#[tokio::test]
async fn test_algorithm_mismatch_and_unknown_key() {
    let h = harness().await;
    let key = h
        .machine
        .create(ElasticKeySpec::new("aes", "p", KeyAlgorithm::Aes256))
        .await
        .unwrap();

    assert!(matches!(h.machine.sign(key.id, b"x").await, Err(KmsError::Conflict(_))));
    assert!(matches!(
        h.machine.get(uuid::Uuid::new_v4()).await,
        Err(KmsError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_metadata_and_listing() {
    let h = harness().await;
    let a = h
        .machine
        .create(ElasticKeySpec::new("billing", "tenant-a", KeyAlgorithm::Aes256))
        .await
        .unwrap();
    h.machine
        .create(ElasticKeySpec::new("billing-mac", "tenant-b", KeyAlgorithm::HmacSha256))
        .await
        .unwrap();

    let updated = h
        .machine
        .update_metadata(a.id, "billing-v2", "renamed")
        .await
        .unwrap();
    assert_eq!(updated.name, "billing-v2");
    assert!(updated.updated_at >= a.updated_at);

    let tenant_a = h
        .machine
        .list(ElasticKeyFilter::partition("tenant-a"))
        .await
        .unwrap();
    assert_eq!(tenant_a.len(), 1);
    assert_eq!(tenant_a[0].id, a.id);

    let macs = h
        .machine
        .list(ElasticKeyFilter {
            algorithm: Some(KeyAlgorithm::HmacSha256),
            ..ElasticKeyFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(macs.len(), 1);
    assert_eq!(macs[0].partition, "tenant-b");
}

#[tokio::test]
async fn test_recover_interrupted_settles_stuck_keys() {
    let h = harness().await;

    // A key whose generation never finished
    let now = now_millis();
    let stuck = ElasticKey {
        id: uuid::Uuid::new_v4(),
        name: "half-made".to_string(),
        description: String::new(),
        partition: "p".to_string(),
        algorithm: KeyAlgorithm::Aes256,
        state: ElasticKeyState::Generating,
        versioning_allowed: true,
        created_at: now,
        updated_at: now,
    };
    let stuck_id = stuck.id;
    h.repo
        .transaction(move |tx| Box::pin(async move { tx.add_elastic_key(&stuck).await }))
        .await
        .unwrap();

    // A key whose rotation never finished
    let rotating = h
        .machine
        .create(ElasticKeySpec::new("mid-rotation", "p", KeyAlgorithm::Aes256))
        .await
        .unwrap();
    let payload = h.machine.encrypt(rotating.id, b"before crash").await.unwrap();
    let rotating_id = rotating.id;
    h.repo
        .transaction(move |tx| {
            Box::pin(async move {
                tx.transition_elastic_key_state(
                    rotating_id,
                    ElasticKeyState::Active,
                    ElasticKeyState::Rotating,
                )
                .await
            })
        })
        .await
        .unwrap();

    let healthy = h
        .machine
        .create(ElasticKeySpec::new("healthy", "p", KeyAlgorithm::Aes128))
        .await
        .unwrap();

    let report = h.machine.recover_interrupted().await.unwrap();
    assert_eq!(report, RecoveryReport { failed: 1, reverted: 1 });

    assert_eq!(h.machine.get(stuck_id).await.unwrap().state, ElasticKeyState::Failed);
    assert_eq!(h.machine.get(rotating_id).await.unwrap().state, ElasticKeyState::Active);
    assert_eq!(h.machine.get(healthy.id).await.unwrap().state, ElasticKeyState::Active);

    // The reverted key kept its primary and rotates normally again
    assert_eq!(
        h.machine.decrypt(rotating_id, &payload).await.unwrap().as_slice(),
        b"before crash"
    );
    assert_eq!(h.machine.rotate(rotating_id).await.unwrap().version, 2);

    assert_eq!(h.machine.recover_interrupted().await.unwrap(), RecoveryReport::default());
}
