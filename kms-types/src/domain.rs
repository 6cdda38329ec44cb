//! Domain vocabulary shared across the KMS crates
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


use serde::{Deserialize, Serialize};
use std::fmt;

/// Tenant/purpose namespace under which intermediate and content keys live
pub type PartitionId = String;

/// Partition used by tiers that are not partitioned (root keys)
pub const GLOBAL_PARTITION: &str = "";

/// Barrier key tiers that are persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Root,
    Intermediate,
    Content,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Root => "root",
            Tier::Intermediate => "intermediate",
            Tier::Content => "content",
        }
    }

    /// Table holding the wrapped versions of this tier
    pub fn table(&self) -> &'static str {
        match self {
            Tier::Root => "root_keys",
            Tier::Intermediate => "intermediate_keys",
            Tier::Content => "content_keys",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of an elastic key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElasticKeyState {
    Requested,
    Generating,
    Active,
    Rotating,
    Disabled,
    Failed,
}

impl ElasticKeyState {
    pub const ALL: [ElasticKeyState; 6] = [
        ElasticKeyState::Requested,
        ElasticKeyState::Generating,
        ElasticKeyState::Active,
        ElasticKeyState::Rotating,
        ElasticKeyState::Disabled,
        ElasticKeyState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ElasticKeyState::Requested => "requested",
            ElasticKeyState::Generating => "generating",
            ElasticKeyState::Active => "active",
            ElasticKeyState::Rotating => "rotating",
            ElasticKeyState::Disabled => "disabled",
            ElasticKeyState::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.as_str() == value)
    }

    /// Transition table of the elastic-key lifecycle.
    ///
    /// Every pair not listed here is illegal.
    pub fn can_transition_to(&self, next: ElasticKeyState) -> bool {
        use ElasticKeyState::*;
        match (self, next) {
            (Requested, Generating) => true,
            (Generating, Active) | (Generating, Failed) => true,
            (Active, Rotating) | (Active, Disabled) => true,
            (Rotating, Active) => true,
            (Requested, _) | (Generating, _) | (Active, _) | (Rotating, _) => false,
            (Disabled, _) | (Failed, _) => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ElasticKeyState::Disabled | ElasticKeyState::Failed)
    }
}

impl fmt::Display for ElasticKeyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Algorithm family of an elastic key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyFamily {
    Rsa,
    Ec,
    Aes,
    Hmac,
}

impl KeyFamily {
    pub fn is_asymmetric(&self) -> bool {
        matches!(self, KeyFamily::Rsa | KeyFamily::Ec)
    }
}

/// Concrete key-material algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    #[serde(rename = "RSA-2048")]
    Rsa2048,
    #[serde(rename = "RSA-3072")]
    Rsa3072,
    #[serde(rename = "RSA-4096")]
    Rsa4096,
    #[serde(rename = "EC-P256")]
    EcP256,
    #[serde(rename = "EC-P384")]
    EcP384,
    #[serde(rename = "AES-128")]
    Aes128,
    #[serde(rename = "AES-192")]
    Aes192,
    #[serde(rename = "AES-256")]
    Aes256,
    #[serde(rename = "HMAC-SHA256")]
    HmacSha256,
    #[serde(rename = "HMAC-SHA384")]
    HmacSha384,
    #[serde(rename = "HMAC-SHA512")]
    HmacSha512,
}

impl KeyAlgorithm {
    pub const ALL: [KeyAlgorithm; 11] = [
        KeyAlgorithm::Rsa2048,
        KeyAlgorithm::Rsa3072,
        KeyAlgorithm::Rsa4096,
        KeyAlgorithm::EcP256,
        KeyAlgorithm::EcP384,
        KeyAlgorithm::Aes128,
        KeyAlgorithm::Aes192,
        KeyAlgorithm::Aes256,
        KeyAlgorithm::HmacSha256,
        KeyAlgorithm::HmacSha384,
        KeyAlgorithm::HmacSha512,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyAlgorithm::Rsa2048 => "RSA-2048",
            KeyAlgorithm::Rsa3072 => "RSA-3072",
            KeyAlgorithm::Rsa4096 => "RSA-4096",
            KeyAlgorithm::EcP256 => "EC-P256",
            KeyAlgorithm::EcP384 => "EC-P384",
            KeyAlgorithm::Aes128 => "AES-128",
            KeyAlgorithm::Aes192 => "AES-192",
            KeyAlgorithm::Aes256 => "AES-256",
            KeyAlgorithm::HmacSha256 => "HMAC-SHA256",
            KeyAlgorithm::HmacSha384 => "HMAC-SHA384",
            KeyAlgorithm::HmacSha512 => "HMAC-SHA512",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|a| a.as_str().eq_ignore_ascii_case(value))
    }

    pub fn family(&self) -> KeyFamily {
        match self {
            KeyAlgorithm::Rsa2048 | KeyAlgorithm::Rsa3072 | KeyAlgorithm::Rsa4096 => KeyFamily::Rsa,
            KeyAlgorithm::EcP256 | KeyAlgorithm::EcP384 => KeyFamily::Ec,
            KeyAlgorithm::Aes128 | KeyAlgorithm::Aes192 | KeyAlgorithm::Aes256 => KeyFamily::Aes,
            KeyAlgorithm::HmacSha256 | KeyAlgorithm::HmacSha384 | KeyAlgorithm::HmacSha512 => {
                KeyFamily::Hmac
            }
        }
    }

    /// Length in bytes of the raw secret for symmetric algorithms
    pub fn secret_len(&self) -> Option<usize> {
        match self {
            KeyAlgorithm::Aes128 => Some(16),
            KeyAlgorithm::Aes192 => Some(24),
            KeyAlgorithm::Aes256 | KeyAlgorithm::HmacSha256 => Some(32),
            KeyAlgorithm::HmacSha384 => Some(48),
            KeyAlgorithm::HmacSha512 => Some(64),
            _ => None,
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use ElasticKeyState::*;
        let allowed = [
            (Requested, Generating),
            (Generating, Active),
            (Generating, Failed),
            (Active, Rotating),
            (Rotating, Active),
            (Active, Disabled),
        ];

        for from in ElasticKeyState::ALL {
            for to in ElasticKeyState::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_active_only_reachable_from_generating_or_rotating() {
        for from in ElasticKeyState::ALL {
            if from.can_transition_to(ElasticKeyState::Active) {
                assert!(matches!(
                    from,
                    ElasticKeyState::Generating | ElasticKeyState::Rotating
                ));
            }
        }
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for to in ElasticKeyState::ALL {
            assert!(!ElasticKeyState::Disabled.can_transition_to(to));
            assert!(!ElasticKeyState::Failed.can_transition_to(to));
        }
    }

    #[test]
    fn test_algorithm_names_parse_back() {
        for alg in KeyAlgorithm::ALL {
            assert_eq!(KeyAlgorithm::parse(alg.as_str()), Some(alg));
        }
        assert_eq!(KeyAlgorithm::parse("rsa-2048"), Some(KeyAlgorithm::Rsa2048));
        assert_eq!(KeyAlgorithm::parse("DES"), None);
    }

    #[test]
    fn test_state_names_parse_back() {
        for state in ElasticKeyState::ALL {
            assert_eq!(ElasticKeyState::parse(state.as_str()), Some(state));
        }
    }
}
