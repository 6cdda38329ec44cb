//! Key material and the generators that produce it
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


use crate::error::{PoolError, PoolResult};
use kms_types::KeyAlgorithm;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use zeroize::Zeroizing;

/// What to generate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationSpec {
    pub algorithm: KeyAlgorithm,
    /// Free-form label carried into logs (usually the elastic key id)
    pub label: String,
}

impl GenerationSpec {
    pub fn new(algorithm: KeyAlgorithm, label: impl Into<String>) -> Self {
        Self {
            algorithm,
            label: label.into(),
        }
    }
}

/// Generated key material.
///
/// `private` holds the PKCS#8 DER private key for asymmetric algorithms or the
/// raw secret for AES/HMAC, and is wiped on drop. `public` is the SPKI DER
/// (RSA) or SEC1 uncompressed point (EC).
pub struct KeyMaterial {
    pub algorithm: KeyAlgorithm,
    pub private: Zeroizing<Vec<u8>>,
    pub public: Option<Vec<u8>>,
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("algorithm", &self.algorithm)
            .field("private", &"<redacted>")
            .field("public_len", &self.public.as_ref().map(|p| p.len()))
            .finish()
    }
}

/// CPU-bound material generation, run on the blocking thread pool
pub trait MaterialGenerator: Send + Sync + 'static {
    fn generate(&self, spec: &GenerationSpec) -> PoolResult<KeyMaterial>;
}

/// Generator backed by `rsa`, `p256`, `p384` and the OS RNG
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultGenerator;

fn crypto_err(e: impl fmt::Display) -> PoolError {
    PoolError::Generation(e.to_string())
}

impl DefaultGenerator {
    fn rsa(bits: usize) -> PoolResult<(Vec<u8>, Vec<u8>)> {
        use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey};

        let private = rsa::RsaPrivateKey::new(&mut OsRng, bits).map_err(crypto_err)?;
        let public = rsa::RsaPublicKey::from(&private);
        let der = private.to_pkcs8_der().map_err(crypto_err)?;
        let spki = public.to_public_key_der().map_err(crypto_err)?;
        Ok((der.as_bytes().to_vec(), spki.as_bytes().to_vec()))
    }

    fn p256() -> PoolResult<(Vec<u8>, Vec<u8>)> {
        use p256::elliptic_curve::sec1::ToEncodedPoint;
        use p256::pkcs8::EncodePrivateKey;

        let secret = p256::SecretKey::random(&mut OsRng);
        let der = secret.to_pkcs8_der().map_err(crypto_err)?;
        let point = secret.public_key().to_encoded_point(false);
        Ok((der.as_bytes().to_vec(), point.as_bytes().to_vec()))
    }

    fn p384() -> PoolResult<(Vec<u8>, Vec<u8>)> {
        use p384::elliptic_curve::sec1::ToEncodedPoint;
        use p384::pkcs8::EncodePrivateKey;

        let secret = p384::SecretKey::random(&mut OsRng);
        let der = secret.to_pkcs8_der().map_err(crypto_err)?;
        let point = secret.public_key().to_encoded_point(false);
        Ok((der.as_bytes().to_vec(), point.as_bytes().to_vec()))
    }

    fn secret(len: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; len];
        OsRng.fill_bytes(&mut bytes);
        bytes
    }
}

impl MaterialGenerator for DefaultGenerator {
    fn generate(&self, spec: &GenerationSpec) -> PoolResult<KeyMaterial> {
        let algorithm = spec.algorithm;
        let (private, public) = match algorithm {
            KeyAlgorithm::Rsa2048 => Self::rsa(2048).map(|(k, p)| (k, Some(p)))?,
            KeyAlgorithm::Rsa3072 => Self::rsa(3072).map(|(k, p)| (k, Some(p)))?,
            KeyAlgorithm::Rsa4096 => Self::rsa(4096).map(|(k, p)| (k, Some(p)))?,
            KeyAlgorithm::EcP256 => Self::p256().map(|(k, p)| (k, Some(p)))?,
            KeyAlgorithm::EcP384 => Self::p384().map(|(k, p)| (k, Some(p)))?,
            _ => {
                let len = algorithm.secret_len().ok_or_else(|| {
                    PoolError::Generation(format!("no secret length for {}", algorithm))
                })?;
                (Self::secret(len), None)
            }
        };

        debug_assert_eq!(public.is_some(), algorithm.family().is_asymmetric());

        Ok(KeyMaterial {
            algorithm,
            private: Zeroizing::new(private),
            public,
        })
    }
}
