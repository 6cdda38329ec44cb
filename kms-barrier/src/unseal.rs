//! Unseal-Keys Service
//!
//! The unseal-derived key is random. It is stored once per M-sized combination
//! of share indices, wrapped under a key derived from exactly those shares, so
//! any M valid shares recover the same key and fewer recover nothing.
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


use crate::wrap::{aead_decrypt, aead_encrypt, key_from_slice, random_key, Key256};
use hkdf::Hkdf;
use kms_config::{UnsealConfig, UnsealKdf};
use kms_repository::{now_millis, Repository, UnsealSlot};
use kms_types::{KmsError, KmsResult};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::{debug, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

pub const MIN_SECRET_LEN: usize = 32;
pub const MAX_SECRET_LEN: usize = 512;
const SALT_LEN: usize = 32;

/// One operator-held unseal share. Never persisted.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct UnsealShare {
    /// 1-based position among the N shares
    pub index: u8,
    pub secret: Vec<u8>,
}

impl UnsealShare {
    pub fn new(index: u8, secret: Vec<u8>) -> Self {
        Self { index, secret }
    }
}

impl fmt::Debug for UnsealShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnsealShare")
            .field("index", &self.index)
            .field("secret", &"<redacted>")
            .finish()
    }
}

pub fn kdf_label(kdf: UnsealKdf) -> &'static str {
    match kdf {
        UnsealKdf::HkdfSha256 => "hkdf-sha256",
        UnsealKdf::Pbkdf2Sha256 => "pbkdf2-sha256",
    }
}

fn parse_kdf(label: &str) -> KmsResult<UnsealKdf> {
    match label {
        "hkdf-sha256" => Ok(UnsealKdf::HkdfSha256),
        "pbkdf2-sha256" => Ok(UnsealKdf::Pbkdf2Sha256),
        other => Err(KmsError::Internal(format!("unknown unseal kdf '{}'", other))),
    }
}

/// All `size`-element subsets of `0..items`, in lexicographic order
pub(crate) fn combinations(items: usize, size: usize) -> Vec<Vec<usize>> {
    let mut out = Vec::new();
    if size == 0 || size > items {
        return out;
    }
    let mut current: Vec<usize> = (0..size).collect();
    loop {
        out.push(current.clone());
        // Rightmost position that can still advance
        let Some(pos) = (0..size).rev().find(|&i| current[i] < items - size + i) else {
            return out;
        };
        current[pos] += 1;
        for i in pos + 1..size {
            current[i] = current[i - 1] + 1;
        }
    }
}

fn combination_label(shares: &[&UnsealShare]) -> String {
    shares
        .iter()
        .map(|s| s.index.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn slot_aad(label: &str) -> Vec<u8> {
    format!("kms:unseal:{}", label).into_bytes()
}

fn derive_combination_key(
    kdf: UnsealKdf,
    iterations: u32,
    salt: &[u8],
    shares: &[&UnsealShare],
    label: &str,
) -> KmsResult<Key256> {
    // index || length || secret for each share, in index order
    let mut ikm = Zeroizing::new(Vec::new());
    for share in shares {
        ikm.push(share.index);
        ikm.extend_from_slice(&(share.secret.len() as u16).to_be_bytes());
        ikm.extend_from_slice(&share.secret);
    }

    let mut okm = Zeroizing::new([0u8; 32]);
    match kdf {
        UnsealKdf::HkdfSha256 => {
            let info = format!("kms-unseal-combination:{}", label);
            Hkdf::<Sha256>::new(Some(salt), &ikm)
                .expand(info.as_bytes(), &mut okm[..])
                .map_err(|e| KmsError::Internal(format!("HKDF expand failed: {}", e)))?;
        }
        UnsealKdf::Pbkdf2Sha256 => {
            pbkdf2::pbkdf2_hmac::<Sha256>(&ikm, salt, iterations, &mut okm[..]);
        }
    }
    Ok(okm)
}

/// Derive the unseal key from every M-subset of `shares` and require that
/// they all agree
fn recover(shares: &[UnsealShare], slots: &[UnsealSlot], threshold: usize) -> KmsResult<Key256> {
    let by_label: HashMap<&str, &UnsealSlot> =
        slots.iter().map(|s| (s.combination.as_str(), s)).collect();

    let mut recovered: Option<Key256> = None;
    for combo in combinations(shares.len(), threshold) {
        let subset: Vec<&UnsealShare> = combo.iter().map(|&i| &shares[i]).collect();
        let label = combination_label(&subset);
        let slot = by_label.get(label.as_str()).ok_or_else(|| {
            KmsError::InvalidShares(format!("no derivation metadata for shares {}", label))
        })?;

        let combination_key = derive_combination_key(
            parse_kdf(&slot.kdf)?,
            slot.iterations,
            &slot.salt,
            &subset,
            &label,
        )?;
        let plain = aead_decrypt(&combination_key, &slot.wrapped_unseal_key, &slot_aad(&label))
            .map_err(|_| {
                KmsError::InvalidShares(format!("shares {} do not match derivation metadata", label))
            })?;
        let key = key_from_slice(&plain)?;

        match &recovered {
            None => recovered = Some(key),
            Some(previous) if **previous == *key => {}
            Some(_) => {
                return Err(KmsError::InvalidShares(
                    "share combinations derive different keys".to_string(),
                ))
            }
        }
    }

    recovered.ok_or_else(|| KmsError::InvalidShares("no share combination to check".to_string()))
}

/// Derives and validates the unseal-derived key from operator shares
#[derive(Clone)]
pub struct UnsealService {
    repo: Repository,
    config: UnsealConfig,
}

impl UnsealService {
    pub fn new(repo: Repository, config: UnsealConfig) -> Self {
        Self { repo, config }
    }

    pub fn config(&self) -> &UnsealConfig {
        &self.config
    }

    /// N fresh random shares for bootstrapping a new barrier
    pub fn generate_shares(&self) -> Vec<UnsealShare> {
        (1..=self.config.shares)
            .map(|index| {
                let mut secret = vec![0u8; MIN_SECRET_LEN];
                OsRng.fill_bytes(&mut secret);
                UnsealShare::new(index as u8, secret)
            })
            .collect()
    }

    pub async fn is_initialized(&self) -> KmsResult<bool> {
        let slots = self
            .repo
            .transaction(|tx| Box::pin(async move { tx.list_unseal_slots().await }))
            .await?;
        Ok(!slots.is_empty())
    }

    /// Check count, index range, uniqueness and secret length; returns the
    /// shares sorted by index
    pub fn validate_shares(&self, shares: &[UnsealShare]) -> KmsResult<Vec<UnsealShare>> {
        if shares.len() < self.config.threshold {
            return Err(KmsError::InsufficientShares {
                required: self.config.threshold,
                provided: shares.len(),
            });
        }

        let mut seen = HashSet::new();
        for share in shares {
            let index = share.index as usize;
            if index == 0 || index > self.config.shares {
                return Err(KmsError::InvalidShares(format!(
                    "share index {} outside 1..={}",
                    share.index, self.config.shares
                )));
            }
            if !seen.insert(share.index) {
                return Err(KmsError::InvalidShares(format!(
                    "share index {} supplied twice",
                    share.index
                )));
            }
            if share.secret.len() < MIN_SECRET_LEN || share.secret.len() > MAX_SECRET_LEN {
                return Err(KmsError::InvalidShares(format!(
                    "share {} secret must be {}..={} bytes",
                    share.index, MIN_SECRET_LEN, MAX_SECRET_LEN
                )));
            }
        }

        let mut sorted = shares.to_vec();
        sorted.sort_by_key(|s| s.index);
        Ok(sorted)
    }

    /// Generate the unseal-derived key and its derivation metadata; nothing
    /// is persisted
    pub async fn build_slots(&self, shares: &[UnsealShare]) -> KmsResult<(Key256, Vec<UnsealSlot>)> {
        let shares = self.validate_shares(shares)?;
        if shares.len() != self.config.shares {
            return Err(KmsError::InvalidShares(format!(
                "initialization requires all {} shares, got {}",
                self.config.shares,
                shares.len()
            )));
        }

        let kdf = self.config.kdf;
        let iterations = match kdf {
            UnsealKdf::HkdfSha256 => 0,
            UnsealKdf::Pbkdf2Sha256 => self.config.pbkdf2_iterations,
        };
        let threshold = self.config.threshold;

        tokio::task::spawn_blocking(move || {
            let unseal_key = random_key();
            let created_at = now_millis();
            let mut slots = Vec::new();

            for combo in combinations(shares.len(), threshold) {
                let subset: Vec<&UnsealShare> = combo.iter().map(|&i| &shares[i]).collect();
                let label = combination_label(&subset);

                let mut salt = vec![0u8; SALT_LEN];
                OsRng.fill_bytes(&mut salt);
                let combination_key = derive_combination_key(kdf, iterations, &salt, &subset, &label)?;
                let wrapped = aead_encrypt(&combination_key, &unseal_key[..], &slot_aad(&label))?;

                slots.push(UnsealSlot {
                    combination: label,
                    kdf: kdf_label(kdf).to_string(),
                    salt,
                    iterations,
                    wrapped_unseal_key: wrapped,
                    created_at,
                });
            }
            Ok((unseal_key, slots))
        })
        .await
        .map_err(|e| KmsError::Internal(format!("unseal derivation task failed: {}", e)))?
    }

    /// Persist fresh derivation metadata for all N shares
    pub async fn initialize(&self, shares: &[UnsealShare]) -> KmsResult<Key256> {
        let (key, slots) = self.build_slots(shares).await?;
        let count = slots.len();
        self.repo
            .transaction(move |tx| {
                Box::pin(async move {
                    for slot in &slots {
                        tx.add_unseal_slot(slot).await?;
                    }
                    Ok(())
                })
            })
            .await?;

        info!(
            threshold = self.config.threshold,
            shares = self.config.shares,
            slots = count,
            "Unseal metadata initialized"
        );
        Ok(key)
    }

    /// Recover the unseal-derived key from at least M shares
    pub async fn unseal(&self, shares: &[UnsealShare]) -> KmsResult<Key256> {
        let shares = self.validate_shares(shares)?;
        let slots = self
            .repo
            .transaction(|tx| Box::pin(async move { tx.list_unseal_slots().await }))
            .await?;
        if slots.is_empty() {
            return Err(KmsError::NotFound("unseal metadata not initialized".to_string()));
        }

        let threshold = self.config.threshold;
        let provided = shares.len();
        let result = tokio::task::spawn_blocking(move || recover(&shares, &slots, threshold))
            .await
            .map_err(|e| KmsError::Internal(format!("unseal derivation task failed: {}", e)))?;

        match &result {
            Ok(_) => debug!(provided, "Unseal shares validated"),
            Err(e) => warn!(provided, error = %e, "Unseal shares rejected"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kms_config::KmsConfig;

    fn share(index: u8, fill: u8) -> UnsealShare {
        UnsealShare::new(index, vec![fill; 32])
    }

    fn shares(n: u8) -> Vec<UnsealShare> {
        (1..=n).map(|i| share(i, i.wrapping_mul(17))).collect()
    }

    async fn service(kdf: UnsealKdf) -> UnsealService {
        let mut config = KmsConfig::default().unseal;
        config.kdf = kdf;
        config.pbkdf2_iterations = 1_000;
        UnsealService::new(Repository::in_memory().await.unwrap(), config)
    }

    #[test]
    fn test_combinations() {
        assert_eq!(combinations(5, 3).len(), 10);
        assert_eq!(combinations(4, 4), vec![vec![0, 1, 2, 3]]);
        assert_eq!(combinations(3, 1), vec![vec![0], vec![1], vec![2]]);
        assert!(combinations(2, 3).is_empty());
        assert_eq!(combinations(4, 2)[..3], [vec![0, 1], vec![0, 2], vec![0, 3]]);
    }

    #[test]
    fn test_share_debug_redacts_secret() {
        assert!(!format!("{:?}", share(1, 0xAA)).contains("170"));
    }

    #[tokio::test]
    async fn test_validation() {
        let svc = service(UnsealKdf::HkdfSha256).await;

        assert!(matches!(
            svc.validate_shares(&shares(2)),
            Err(KmsError::InsufficientShares { required: 3, provided: 2 })
        ));

        let mut dup = shares(3);
        dup[2].index = 1;
        assert!(matches!(svc.validate_shares(&dup), Err(KmsError::InvalidShares(_))));

        let mut out_of_range = shares(3);
        out_of_range[0].index = 6;
        assert!(matches!(svc.validate_shares(&out_of_range), Err(KmsError::InvalidShares(_))));

        let mut short = shares(3);
        short[1].secret = vec![1; 31];
        assert!(matches!(svc.validate_shares(&short), Err(KmsError::InvalidShares(_))));

        let mut unsorted = shares(3);
        unsorted.reverse();
        let sorted = svc.validate_shares(&unsorted).unwrap();
        assert_eq!(sorted.iter().map(|s| s.index).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_slots_per_combination() {
        let svc = service(UnsealKdf::HkdfSha256).await;
        let (_, slots) = svc.build_slots(&shares(5)).await.unwrap();
        assert_eq!(slots.len(), 10);
        assert_eq!(slots[0].combination, "1,2,3");
        assert_eq!(slots[9].combination, "3,4,5");

        // Fewer than N at initialization
        assert!(matches!(
            svc.build_slots(&shares(4)).await,
            Err(KmsError::InvalidShares(_))
        ));
    }

    #[tokio::test]
    async fn test_any_threshold_subset_recovers_same_key() {
        for kdf in [UnsealKdf::HkdfSha256, UnsealKdf::Pbkdf2Sha256] {
            let svc = service(kdf).await;
            let all = shares(5);
            let key = svc.initialize(&all).await.unwrap();

            for combo in combinations(5, 3) {
                let subset: Vec<UnsealShare> = combo.iter().map(|&i| all[i].clone()).collect();
                let recovered = svc.unseal(&subset).await.unwrap();
                assert_eq!(*recovered, *key);
            }
            let recovered = svc.unseal(&all).await.unwrap();
            assert_eq!(*recovered, *key);
        }
    }

    #[tokio::test]
    async fn test_wrong_secret_rejected() {
        let svc = service(UnsealKdf::HkdfSha256).await;
        let all = shares(5);
        svc.initialize(&all).await.unwrap();

        let mut forged = vec![all[0].clone(), all[1].clone(), all[2].clone()];
        forged[1].secret[0] ^= 0xFF;
        assert!(matches!(svc.unseal(&forged).await, Err(KmsError::InvalidShares(_))));

        // One bad share among four poisons the check
        let mut mixed = vec![all[0].clone(), all[1].clone(), all[2].clone(), all[3].clone()];
        mixed[3].secret[5] ^= 0x01;
        assert!(matches!(svc.unseal(&mixed).await, Err(KmsError::InvalidShares(_))));
    }

    #[tokio::test]
    async fn test_unseal_before_initialize() {
        let svc = service(UnsealKdf::HkdfSha256).await;
        assert!(!svc.is_initialized().await.unwrap());
        assert!(matches!(svc.unseal(&shares(3)).await, Err(KmsError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_generated_shares() {
        let svc = service(UnsealKdf::HkdfSha256).await;
        let generated = svc.generate_shares();
        assert_eq!(generated.len(), 5);
        assert_eq!(generated[4].index, 5);
        assert!(svc.validate_shares(&generated).is_ok());
        assert_ne!(generated[0].secret, generated[1].secret);
    }
}
