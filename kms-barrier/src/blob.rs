//! Sealed blob layout
//!
//! `b"KMSB" | format (1 byte) | content version (u64 BE) | nonce | ciphertext`
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


use kms_types::{KmsError, KmsResult};

pub const BLOB_MAGIC: &[u8; 4] = b"KMSB";
pub const BLOB_FORMAT: u8 = 1;
pub const HEADER_LEN: usize = 13;

pub fn encode_header(content_version: u64) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(BLOB_MAGIC);
    header[4] = BLOB_FORMAT;
    header[5..].copy_from_slice(&content_version.to_be_bytes());
    header
}

/// Split a blob into its content version, header and AEAD body
pub fn parse(blob: &[u8]) -> KmsResult<(u64, &[u8], &[u8])> {
    if blob.len() < HEADER_LEN {
        return Err(KmsError::Internal("sealed blob too short".to_string()));
    }
    let (header, body) = blob.split_at(HEADER_LEN);
    if &header[..4] != BLOB_MAGIC {
        return Err(KmsError::Internal("not a sealed blob".to_string()));
    }
    if header[4] != BLOB_FORMAT {
        return Err(KmsError::Internal(format!(
            "unsupported blob format {}",
            header[4]
        )));
    }

    let mut version = [0u8; 8];
    version.copy_from_slice(&header[5..]);
    Ok((u64::from_be_bytes(version), header, body))
}

/// Header and partition are authenticated together with the ciphertext
pub fn associated_data(header: &[u8], partition: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(header.len() + partition.len());
    aad.extend_from_slice(header);
    aad.extend_from_slice(partition.as_bytes());
    aad
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = encode_header(0x0102);
        assert_eq!(&header[..4], b"KMSB");
        assert_eq!(header[4], 1);
        assert_eq!(&header[5..], &[0, 0, 0, 0, 0, 0, 1, 2]);

        let mut blob = header.to_vec();
        blob.extend_from_slice(b"body");
        let (version, head, body) = parse(&blob).unwrap();
        assert_eq!(version, 0x0102);
        assert_eq!(head, &header[..]);
        assert_eq!(body, b"body");
    }

    #[test]
    fn test_rejects_foreign_bytes() {
        assert!(parse(b"KMSB").is_err());
        assert!(parse(b"XXXX\x01\0\0\0\0\0\0\0\x01").is_err());
        assert!(parse(b"KMSB\x02\0\0\0\0\0\0\0\x01").is_err());
    }
}
