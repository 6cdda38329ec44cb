//! KMS Key Generation
//!
//! Material generators and the bounded pool that runs them.
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


pub mod error;
pub mod material;
pub mod pool;

pub use error::{PoolError, PoolResult};
pub use material::{DefaultGenerator, GenerationSpec, KeyMaterial, MaterialGenerator};
pub use pool::{KeyGenPool, PoolConfig, PoolStats, PoolTicket, SubmitPolicy};
pub use tokio_util::sync::CancellationToken;
