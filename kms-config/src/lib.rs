//! Configuration management for the KMS core
//!
//! Values come from `KMS_`-prefixed environment variables (nested sections
//! separated by `__`), optionally seeded from a `.env` file.
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


use config::{builder::DefaultState, Config, ConfigBuilder, ConfigError, Environment};
use kms_types::{KeyAlgorithm, KeyFamily};
use serde::Deserialize;
use std::time::Duration;

/// Upper bound on the number of unseal shares
pub const MAX_UNSEAL_SHARES: usize = 16;

/// Key derivation used to turn share combinations into wrapping keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnsealKdf {
    HkdfSha256,
    Pbkdf2Sha256,
}

/// Unseal mode (M of N)
#[derive(Debug, Clone, Deserialize)]
pub struct UnsealConfig {
    pub threshold: usize,
    pub shares: usize,
    pub kdf: UnsealKdf,
    pub pbkdf2_iterations: u32,
}

/// Key-generation pool configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PoolSettings {
    pub workers: usize,
    pub queue_bound: usize,
    pub submit_timeout_ms: u64,
    /// Deadline for a submitted request to produce material
    pub generation_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
}

impl PoolSettings {
    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_millis(self.generation_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Database connection parameters
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// `postgres://…` or `sqlite:<path>` / `sqlite::memory:`
    pub url: String,
    pub max_connections: usize,
    pub acquire_timeout_ms: u64,
    pub transaction_timeout_ms: u64,
}

impl DatabaseConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    /// In-memory SQLite settings, used by tests and local tooling
    pub fn in_memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            acquire_timeout_ms: 5_000,
            transaction_timeout_ms: 10_000,
        }
    }
}

/// Per-family generation defaults
#[derive(Debug, Clone, Deserialize)]
pub struct KeygenDefaults {
    pub default_rsa_bits: u32,
    pub default_ec_curve: String,
    pub default_aes_bits: u32,
}

impl KeygenDefaults {
    /// Default algorithm for a family, `None` when the configured value is unsupported
    pub fn algorithm_for(&self, family: KeyFamily) -> Option<KeyAlgorithm> {
        match family {
            KeyFamily::Rsa => match self.default_rsa_bits {
                2048 => Some(KeyAlgorithm::Rsa2048),
                3072 => Some(KeyAlgorithm::Rsa3072),
                4096 => Some(KeyAlgorithm::Rsa4096),
                _ => None,
            },
            KeyFamily::Ec => match self.default_ec_curve.to_ascii_uppercase().as_str() {
                "P-256" | "P256" => Some(KeyAlgorithm::EcP256),
                "P-384" | "P384" => Some(KeyAlgorithm::EcP384),
                _ => None,
            },
            KeyFamily::Aes => match self.default_aes_bits {
                128 => Some(KeyAlgorithm::Aes128),
                192 => Some(KeyAlgorithm::Aes192),
                256 => Some(KeyAlgorithm::Aes256),
                _ => None,
            },
            KeyFamily::Hmac => Some(KeyAlgorithm::HmacSha256),
        }
    }
}

/// Complete configuration of the KMS core
#[derive(Debug, Clone, Deserialize)]
pub struct KmsConfig {
    pub unseal: UnsealConfig,
    pub pool: PoolSettings,
    pub database: DatabaseConfig,
    pub keygen: KeygenDefaults,
    pub log_level: Option<String>,
}

impl Default for KmsConfig {
    fn default() -> Self {
        Self {
            unseal: UnsealConfig {
                threshold: 3,
                shares: 5,
                kdf: UnsealKdf::HkdfSha256,
                pbkdf2_iterations: 600_000,
            },
            pool: PoolSettings {
                workers: 4,
                queue_bound: 16,
                submit_timeout_ms: 5_000,
                generation_timeout_ms: 60_000,
                shutdown_timeout_ms: 10_000,
            },
            database: DatabaseConfig {
                url: "sqlite::memory:".to_string(),
                max_connections: 8,
                acquire_timeout_ms: 5_000,
                transaction_timeout_ms: 10_000,
            },
            keygen: KeygenDefaults {
                default_rsa_bits: 2048,
                default_ec_curve: "P-256".to_string(),
                default_aes_bits: 256,
            },
            log_level: Some("info".to_string()),
        }
    }
}

impl KmsConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let builder = Self::defaults()?.add_source(
            Environment::with_prefix("KMS")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );
        Self::build(builder)
    }

    /// Builder pre-populated with the built-in defaults
    pub fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        let d = Self::default();
        Config::builder()
            .set_default("unseal.threshold", d.unseal.threshold as u64)?
            .set_default("unseal.shares", d.unseal.shares as u64)?
            .set_default("unseal.kdf", "hkdf-sha256")?
            .set_default("unseal.pbkdf2_iterations", d.unseal.pbkdf2_iterations as u64)?
            .set_default("pool.workers", d.pool.workers as u64)?
            .set_default("pool.queue_bound", d.pool.queue_bound as u64)?
            .set_default("pool.submit_timeout_ms", d.pool.submit_timeout_ms)?
            .set_default("pool.generation_timeout_ms", d.pool.generation_timeout_ms)?
            .set_default("pool.shutdown_timeout_ms", d.pool.shutdown_timeout_ms)?
            .set_default("database.url", d.database.url)?
            .set_default("database.max_connections", d.database.max_connections as u64)?
            .set_default("database.acquire_timeout_ms", d.database.acquire_timeout_ms)?
            .set_default("database.transaction_timeout_ms", d.database.transaction_timeout_ms)?
            .set_default("keygen.default_rsa_bits", d.keygen.default_rsa_bits as u64)?
            .set_default("keygen.default_ec_curve", d.keygen.default_ec_curve)?
            .set_default("keygen.default_aes_bits", d.keygen.default_aes_bits as u64)?
            .set_default("log_level", "info")
    }

    /// Deserialize and validate whatever sources the builder carries
    pub fn build(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let u = &self.unseal;
        if u.threshold == 0 || u.threshold > u.shares || u.shares > MAX_UNSEAL_SHARES {
            return Err(ConfigError::Message(format!(
                "unseal mode {} of {} is invalid (1 <= M <= N <= {})",
                u.threshold, u.shares, MAX_UNSEAL_SHARES
            )));
        }
        if u.kdf == UnsealKdf::Pbkdf2Sha256 && u.pbkdf2_iterations == 0 {
            return Err(ConfigError::Message(
                "unseal.pbkdf2_iterations must be positive".to_string(),
            ));
        }
        if self.pool.workers == 0 {
            return Err(ConfigError::Message("pool.workers must be at least 1".to_string()));
        }
        if self.pool.submit_timeout_ms == 0
            || self.pool.generation_timeout_ms == 0
            || self.pool.shutdown_timeout_ms == 0
        {
            return Err(ConfigError::Message("pool timeouts must be positive".to_string()));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::Message(
                "database.max_connections must be at least 1".to_string(),
            ));
        }
        if self.database.acquire_timeout_ms == 0 || self.database.transaction_timeout_ms == 0 {
            return Err(ConfigError::Message("database timeouts must be positive".to_string()));
        }
        for family in [KeyFamily::Rsa, KeyFamily::Ec, KeyFamily::Aes] {
            if self.keygen.algorithm_for(family).is_none() {
                return Err(ConfigError::Message(format!(
                    "unsupported keygen default for {:?}",
                    family
                )));
            }
        }
        Ok(())
    }

    /// Get log level, defaulting to "info"
    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }
}
