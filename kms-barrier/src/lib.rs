//! KMS Barrier
//!
//! Unseal shares open a chain of keys: the unseal-derived key wraps root
//! keys, root keys wrap per-partition intermediate keys, and those wrap the
//! content keys that encrypt caller data.
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


pub mod barrier;
pub mod blob;
pub mod tiers;
pub mod unseal;
pub mod wrap;

pub use barrier::Barrier;
pub use tiers::{
    ContentKeysService, IntermediateKeysService, ParentKeys, RootKeysService, TierKind,
    TierService, UnsealedKey,
};
pub use unseal::{UnsealService, UnsealShare};
pub use wrap::{Aes256GcmWrapper, Key256, KeyWrapper, WrapContext};
