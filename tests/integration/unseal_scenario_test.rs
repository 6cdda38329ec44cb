//! End-to-end Scenario Tests
//!
//! Unseal a 3-of-5 barrier, generate an RSA-2048 elastic key, rotate it, and
//! read both material versions back. A second test restarts the whole stack
//! over a file-backed SQLite database.

use kms_barrier::{Barrier, UnsealShare};
use kms_config::{DatabaseConfig, KmsConfig};
use kms_elastic::{ElasticKeySpec, ElasticKeyStateMachine, MachineSettings};
use kms_keygen::{DefaultGenerator, KeyGenPool, PoolConfig};
use kms_repository::Repository;
use kms_types::telemetry::ELASTIC_TRANSITION;
use kms_types::{ElasticKeyState, KeyAlgorithm, RecordingTelemetry, Telemetry, Tier};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::traits::PublicKeyParts;
use std::sync::Arc;

fn operator_shares() -> Vec<UnsealShare> {
    (1..=5u8)
        .map(|i| UnsealShare::new(i, (0..32u8).map(|b| b ^ i.wrapping_mul(0x3B)).collect()))
        .collect()
}

fn pick(all: &[UnsealShare], indices: &[u8]) -> Vec<UnsealShare> {
    all.iter()
        .filter(|s| indices.contains(&s.index))
        .cloned()
        .collect()
}

struct Stack {
    barrier: Arc<Barrier>,
    pool: Arc<KeyGenPool>,
    machine: ElasticKeyStateMachine,
}

fn stack(repo: Repository, config: &KmsConfig, telemetry: Arc<dyn Telemetry>) -> Stack {
    let barrier = Arc::new(Barrier::new(
        repo.clone(),
        config.unseal.clone(),
        telemetry.clone(),
    ));
    let pool = Arc::new(
        KeyGenPool::new(
            PoolConfig::from_settings("scenario", &config.pool),
            Arc::new(DefaultGenerator),
            telemetry.clone(),
        )
        .expect("Failed to start key generation pool"),
    );
    let machine = ElasticKeyStateMachine::new(
        repo,
        barrier.clone(),
        pool.clone(),
        MachineSettings::from_pool_settings(&config.pool),
        telemetry,
    );
    Stack {
        barrier,
        pool,
        machine,
    }
}

#[tokio::test]
async fn test_three_of_five_rsa_2048_scenario() {
    kms_logging::init_test_logging();
    let config = KmsConfig::default();
    assert_eq!((config.unseal.threshold, config.unseal.shares), (3, 5));

    let repo = Repository::in_memory().await.expect("Failed to open repository");
    let telemetry = RecordingTelemetry::new();
    let s = stack(repo, &config, telemetry.clone());
    let all = operator_shares();

    // First unseal initializes the barrier, later ones need any three shares
    s.barrier.unseal(&all).await.expect("Failed to initialize barrier");
    s.barrier.seal().await;
    s.barrier
        .unseal(&pick(&all, &[1, 4, 5]))
        .await
        .expect("Failed to unseal with three shares");

    let key = s
        .machine
        .create(ElasticKeySpec::new("jwt-signing", "tenant-42", KeyAlgorithm::Rsa2048))
        .await
        .expect("Failed to create elastic key");
    assert_eq!(key.state, ElasticKeyState::Active);

    let rotated = s.machine.rotate(key.id).await.expect("Failed to rotate");
    assert_eq!(rotated.version, 2);
    assert!(rotated.is_primary);

    let primary = s.machine.get_primary_material(key.id).await.unwrap();
    assert_eq!(primary.version, 2);

    let first = s.machine.get_material_version(key.id, 1).await.unwrap();
    assert!(!first.is_primary);
    assert_ne!(first.private.as_slice(), primary.private.as_slice());

    // Both versions are real RSA-2048 keys with matching public halves
    for material in [&first, &primary] {
        let private = rsa::RsaPrivateKey::from_pkcs8_der(&material.private).unwrap();
        let public =
            rsa::RsaPublicKey::from_public_key_der(material.public.as_ref().unwrap()).unwrap();
        assert_eq!(private.size(), 256);
        assert_eq!(rsa::RsaPublicKey::from(&private), public);
    }

    let transitions: Vec<(String, String)> = telemetry
        .events()
        .into_iter()
        .filter(|e| e.name == ELASTIC_TRANSITION)
        .map(|e| (e.labels[0].1.clone(), e.labels[1].1.clone()))
        .collect();
    let expected = [
        ("requested", "generating"),
        ("generating", "active"),
        ("active", "rotating"),
        ("rotating", "active"),
    ];
    assert_eq!(
        transitions,
        expected
            .iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect::<Vec<_>>()
    );

    s.pool.shutdown().await;
    s.barrier.shutdown().await;
}

#[tokio::test]
async fn test_stack_restart_over_file_database() {
    kms_logging::init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut config = KmsConfig::default();
    config.database = DatabaseConfig {
        url: format!("sqlite://{}", dir.path().join("kms.db").display()),
        ..DatabaseConfig::in_memory()
    };
    let all = operator_shares();

    let (key_id, payload) = {
        let repo = Repository::connect(&config.database).await.unwrap();
        let s = stack(repo, &config, kms_types::TracingTelemetry::shared());
        s.barrier.unseal(&all).await.unwrap();

        let key = s
            .machine
            .create(ElasticKeySpec::new("backups", "tenant-7", KeyAlgorithm::Aes256))
            .await
            .unwrap();
        let payload = s.machine.encrypt(key.id, b"nightly snapshot").await.unwrap();
        s.barrier.rotate_root(1).await.unwrap();

        s.pool.shutdown().await;
        s.barrier.shutdown().await;
        (key.id, payload)
    };

    let repo = Repository::connect(&config.database).await.unwrap();
    let s = stack(repo, &config, kms_types::TracingTelemetry::shared());
    assert!(s.barrier.is_sealed().await);
    s.barrier.unseal(&pick(&all, &[2, 3, 4])).await.unwrap();

    assert_eq!(
        s.machine.decrypt(key_id, &payload).await.unwrap().as_slice(),
        b"nightly snapshot"
    );
    assert_eq!(s.barrier.active_version(Tier::Root, "").await.unwrap(), Some(2));
    s.pool.shutdown().await;
}
