//! Key wrapping primitives
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


use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm,
};
use kms_types::{KmsError, KmsResult};
use rand::RngCore;
use zeroize::Zeroizing;

/// 256-bit symmetric key, wiped on drop
pub type Key256 = Zeroizing<[u8; 32]>;

pub const NONCE_LEN: usize = 12;

/// Fresh random 256-bit key
pub fn random_key() -> Key256 {
    let mut key = Zeroizing::new([0u8; 32]);
    OsRng.fill_bytes(&mut key[..]);
    key
}

pub(crate) fn key_from_slice(bytes: &[u8]) -> KmsResult<Key256> {
    if bytes.len() != 32 {
        return Err(KmsError::Internal(format!(
            "unwrapped key has {} bytes, expected 32",
            bytes.len()
        )));
    }
    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(bytes);
    Ok(key)
}

/// AES-256-GCM with a random nonce; output is `nonce || ciphertext`
pub fn aead_encrypt(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> KmsResult<Vec<u8>> {
    let cipher = Aes256Gcm::new(&(*key).into());
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|e| KmsError::Internal(format!("Encryption failed: {}", e)))?;

    // Prepend nonce to ciphertext
    let mut result = nonce.to_vec();
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Inverse of [`aead_encrypt`]; any tampering or wrong key fails
pub fn aead_decrypt(key: &[u8; 32], sealed: &[u8], aad: &[u8]) -> KmsResult<Zeroizing<Vec<u8>>> {
    if sealed.len() < NONCE_LEN {
        return Err(KmsError::Internal("Encrypted data too short".to_string()));
    }

    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    let nonce: [u8; NONCE_LEN] = nonce_bytes
        .try_into()
        .map_err(|_| KmsError::Internal("Malformed nonce".to_string()))?;
    let cipher = Aes256Gcm::new(&(*key).into());

    let plaintext = cipher
        .decrypt(&nonce.into(), Payload { msg: ciphertext, aad })
        .map_err(|_| KmsError::Internal("Decryption failed: authentication tag mismatch".to_string()))?;

    Ok(Zeroizing::new(plaintext))
}

/// Associated data binding a wrapped key to its place in the hierarchy
#[derive(Debug, Clone, Copy)]
pub struct WrapContext<'a> {
    pub label: &'a str,
    pub partition: &'a str,
    pub version: u64,
    pub parent_version: u64,
}

impl WrapContext<'_> {
    pub fn aad(&self) -> Vec<u8> {
        format!(
            "kms:{}:{}:{}:{}",
            self.label, self.partition, self.version, self.parent_version
        )
        .into_bytes()
    }
}

/// Wraps a child key under its parent key
pub trait KeyWrapper: Send + Sync {
    fn wrap(&self, kek: &[u8; 32], key: &[u8; 32], ctx: &WrapContext<'_>) -> KmsResult<Vec<u8>>;

    fn unwrap(&self, kek: &[u8; 32], wrapped: &[u8], ctx: &WrapContext<'_>) -> KmsResult<Key256>;
}

/// Default wrapper: AES-256-GCM, context as associated data
#[derive(Debug, Default, Clone, Copy)]
pub struct Aes256GcmWrapper;

impl KeyWrapper for Aes256GcmWrapper {
    fn wrap(&self, kek: &[u8; 32], key: &[u8; 32], ctx: &WrapContext<'_>) -> KmsResult<Vec<u8>> {
        aead_encrypt(kek, key, &ctx.aad())
    }

    fn unwrap(&self, kek: &[u8; 32], wrapped: &[u8], ctx: &WrapContext<'_>) -> KmsResult<Key256> {
        let plain = aead_decrypt(kek, wrapped, &ctx.aad())?;
        key_from_slice(&plain)
    }
}
