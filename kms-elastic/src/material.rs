//! Material versions and the operations performed with them
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


use aes_gcm::aead::consts::U12;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, Nonce, OsRng, Payload};
use aes_gcm::aes::Aes192;
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm};
use hmac::{Hmac, Mac};
use kms_repository::MaterialKey;
use kms_types::{KeyAlgorithm, KmsError, KmsResult};
use sha2::{Sha256, Sha384, Sha512};
use std::fmt;
use uuid::Uuid;
use zeroize::Zeroizing;

type Aes192Gcm = AesGcm<Aes192, U12>;

const PAYLOAD_MAGIC: &[u8; 4] = b"KMSE";
const PAYLOAD_HEADER_LEN: usize = 12;
const NONCE_LEN: usize = 12;

/// Unsealed material of one version
pub struct Material {
    pub elastic_key_id: Uuid,
    pub version: u64,
    pub algorithm: KeyAlgorithm,
    pub is_primary: bool,
    pub revoked: bool,
    pub public: Option<Vec<u8>>,
    /// PKCS#8 DER for asymmetric algorithms, the raw secret otherwise
    pub private: Zeroizing<Vec<u8>>,
    pub created_at: i64,
}

impl fmt::Debug for Material {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Material")
            .field("elastic_key_id", &self.elastic_key_id)
            .field("version", &self.version)
            .field("algorithm", &self.algorithm)
            .field("is_primary", &self.is_primary)
            .field("revoked", &self.revoked)
            .field("private", &"<redacted>")
            .finish()
    }
}

/// Version metadata without any secret
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterialVersionInfo {
    pub elastic_key_id: Uuid,
    pub version: u64,
    pub is_primary: bool,
    pub revoked: bool,
    pub public: Option<Vec<u8>>,
    pub created_at: i64,
}

impl From<&MaterialKey> for MaterialVersionInfo {
    fn from(row: &MaterialKey) -> Self {
        Self {
            elastic_key_id: row.elastic_key_id,
            version: row.version,
            is_primary: row.is_primary,
            revoked: row.revoked,
            public: row.public_material.clone(),
            created_at: row.created_at,
        }
    }
}

/// HMAC tag together with the material version that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacTag {
    pub version: u64,
    pub tag: Vec<u8>,
}

fn unsupported(algorithm: KeyAlgorithm, operation: &str) -> KmsError {
    KmsError::Conflict(format!("{} keys do not support {}", algorithm, operation))
}

fn crypto_err(e: impl fmt::Display) -> KmsError {
    KmsError::Internal(format!("Material operation failed: {}", e))
}

fn header(version: u64) -> [u8; PAYLOAD_HEADER_LEN] {
    let mut header = [0u8; PAYLOAD_HEADER_LEN];
    header[..4].copy_from_slice(PAYLOAD_MAGIC);
    header[4..].copy_from_slice(&version.to_be_bytes());
    header
}

fn payload_aad(header: &[u8], key_id: Uuid) -> Vec<u8> {
    let mut aad = header.to_vec();
    aad.extend_from_slice(key_id.as_bytes());
    aad
}

/// Material version recorded in an encrypted payload
pub(crate) fn payload_version(payload: &[u8]) -> KmsResult<u64> {
    if payload.len() < PAYLOAD_HEADER_LEN + NONCE_LEN || &payload[..4] != PAYLOAD_MAGIC {
        return Err(KmsError::Internal("not an elastic key payload".to_string()));
    }
    let mut version = [0u8; 8];
    version.copy_from_slice(&payload[4..PAYLOAD_HEADER_LEN]);
    Ok(u64::from_be_bytes(version))
}

fn encrypt_with<C: Aead + AeadCore + KeyInit>(key: &[u8], plaintext: &[u8], aad: &[u8]) -> KmsResult<Vec<u8>> {
    let cipher = C::new_from_slice(key).map_err(crypto_err)?;
    let nonce = C::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(crypto_err)?;

    let mut out = nonce.to_vec();
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn decrypt_with<C>(key: &[u8], body: &[u8], aad: &[u8]) -> KmsResult<Vec<u8>>
where
    C: Aead + AeadCore<NonceSize = U12> + KeyInit,
{
    let cipher = C::new_from_slice(key).map_err(crypto_err)?;
    let (nonce, ciphertext) = body.split_at(NONCE_LEN);
    let nonce: [u8; NONCE_LEN] = nonce
        .try_into()
        .map_err(|_| KmsError::Internal("Malformed nonce".to_string()))?;
    cipher
        .decrypt(&Nonce::<C>::from(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| KmsError::Internal("Decryption failed: authentication tag mismatch".to_string()))
}

/// `KMSE | version (u64 BE) | nonce | ciphertext`, bound to the elastic key id
pub(crate) fn encrypt(
    algorithm: KeyAlgorithm,
    key: &[u8],
    key_id: Uuid,
    version: u64,
    plaintext: &[u8],
) -> KmsResult<Vec<u8>> {
    let header = header(version);
    let aad = payload_aad(&header, key_id);
    let body = match algorithm {
        KeyAlgorithm::Aes128 => encrypt_with::<Aes128Gcm>(key, plaintext, &aad)?,
        KeyAlgorithm::Aes192 => encrypt_with::<Aes192Gcm>(key, plaintext, &aad)?,
        KeyAlgorithm::Aes256 => encrypt_with::<Aes256Gcm>(key, plaintext, &aad)?,
        other => return Err(unsupported(other, "encryption")),
    };

    let mut payload = header.to_vec();
    payload.extend_from_slice(&body);
    Ok(payload)
}

pub(crate) fn decrypt(
    algorithm: KeyAlgorithm,
    key: &[u8],
    key_id: Uuid,
    payload: &[u8],
) -> KmsResult<Zeroizing<Vec<u8>>> {
    payload_version(payload)?;
    let (header, body) = payload.split_at(PAYLOAD_HEADER_LEN);
    let aad = payload_aad(header, key_id);

    let plaintext = match algorithm {
        KeyAlgorithm::Aes128 => decrypt_with::<Aes128Gcm>(key, body, &aad)?,
        KeyAlgorithm::Aes192 => decrypt_with::<Aes192Gcm>(key, body, &aad)?,
        KeyAlgorithm::Aes256 => decrypt_with::<Aes256Gcm>(key, body, &aad)?,
        other => return Err(unsupported(other, "decryption")),
    };
    Ok(Zeroizing::new(plaintext))
}

fn mac_with<M: Mac + KeyInit>(key: &[u8], data: &[u8]) -> KmsResult<M> {
    let mut mac = <M as Mac>::new_from_slice(key).map_err(crypto_err)?;
    mac.update(data);
    Ok(mac)
}

pub(crate) fn sign(algorithm: KeyAlgorithm, key: &[u8], data: &[u8]) -> KmsResult<Vec<u8>> {
    let tag = match algorithm {
        KeyAlgorithm::HmacSha256 => mac_with::<Hmac<Sha256>>(key, data)?.finalize().into_bytes().to_vec(),
        KeyAlgorithm::HmacSha384 => mac_with::<Hmac<Sha384>>(key, data)?.finalize().into_bytes().to_vec(),
        KeyAlgorithm::HmacSha512 => mac_with::<Hmac<Sha512>>(key, data)?.finalize().into_bytes().to_vec(),
        other => return Err(unsupported(other, "signing")),
    };
    Ok(tag)
}

/// Constant-time tag comparison
pub(crate) fn verify(algorithm: KeyAlgorithm, key: &[u8], data: &[u8], tag: &[u8]) -> KmsResult<bool> {
    let valid = match algorithm {
        KeyAlgorithm::HmacSha256 => mac_with::<Hmac<Sha256>>(key, data)?.verify_slice(tag).is_ok(),
        KeyAlgorithm::HmacSha384 => mac_with::<Hmac<Sha384>>(key, data)?.verify_slice(tag).is_ok(),
        KeyAlgorithm::HmacSha512 => mac_with::<Hmac<Sha512>>(key, data)?.verify_slice(tag).is_ok(),
        other => return Err(unsupported(other, "verification")),
    };
    Ok(valid)
}
