//! Load Tests for the KMS core
//!
//! These tests simulate high load scenarios:
//! - Concurrent barrier encryption across partitions
//! - Burst submissions against a small generation pool
//!
//! Run with: cargo test --test load_test --release -- --ignored

use kms_barrier::{Barrier, UnsealShare};
use kms_config::KmsConfig;
use kms_keygen::{
    DefaultGenerator, GenerationSpec, KeyGenPool, PoolConfig, PoolError, SubmitPolicy,
};
use kms_repository::Repository;
use kms_types::{KeyAlgorithm, TracingTelemetry};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[tokio::test]
#[ignore] // Throughput check, run manually in release mode
async fn test_concurrent_encryption_throughput() {
    let repo = Repository::in_memory().await.unwrap();
    let barrier = Arc::new(Barrier::new(
        repo,
        KmsConfig::default().unseal,
        TracingTelemetry::shared(),
    ));
    let shares: Vec<UnsealShare> = (1..=5u8).map(|i| UnsealShare::new(i, vec![i; 32])).collect();
    barrier.unseal(&shares).await.unwrap();

    let operations = 2_000;
    let start = Instant::now();

    let mut handles = Vec::new();
    for i in 0..operations {
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            let partition = format!("tenant-{}", i % 8);
            let payload = format!("payload {}", i);
            let blob = barrier.encrypt(&partition, payload.as_bytes()).await?;
            let plain = barrier.decrypt(&partition, &blob).await?;
            assert_eq!(plain.as_slice(), payload.as_bytes());
            Ok::<_, kms_types::KmsError>(())
        }));
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let elapsed = start.elapsed();
    let per_second = operations as f64 / elapsed.as_secs_f64();
    println!("✅ {} encrypt/decrypt pairs in {:?}", operations, elapsed);
    println!("✅ Throughput: {:.2} pairs/second", per_second);

    assert!(per_second > 100.0, "Throughput too low: {:.2} pairs/second", per_second);
}

#[tokio::test]
#[ignore] // Timing dependent, run manually
async fn test_burst_against_small_pool() {
    let pool = KeyGenPool::new(
        PoolConfig {
            name: "burst".to_string(),
            workers: 2,
            queue_bound: 4,
            shutdown_timeout: Duration::from_secs(30),
        },
        Arc::new(DefaultGenerator),
        TracingTelemetry::shared(),
    )
    .unwrap();

    let burst = 64;
    let mut tickets = Vec::new();
    let mut saturated = 0;
    for i in 0..burst {
        let spec = GenerationSpec::new(KeyAlgorithm::Rsa2048, format!("burst-{}", i));
        match pool.submit(spec, SubmitPolicy::FailFast, None).await {
            Ok(ticket) => tickets.push(ticket),
            Err(PoolError::Saturated) => saturated += 1,
            Err(e) => panic!("unexpected submit error: {}", e),
        }
    }

    let admitted = tickets.len();
    for ticket in tickets {
        ticket.wait().await.expect("admitted request failed");
    }

    println!("✅ {} admitted, {} saturated", admitted, saturated);
    assert!(saturated > 0);
    assert_eq!(admitted + saturated, burst);
    assert_eq!(pool.stats().completed as usize, admitted);

    pool.shutdown().await;
}
