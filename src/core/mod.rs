// Copyright (c) 2026 Concordia
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Core protocol primitives: scalar types, the content-addressed cell model,
//! the persistent vector, consensus, peer state, and the VM boundary.

/// Scalar wire/identity types (`H256`, `Signature`, `PeerKey`).
pub mod types;
/// Variable-length continuation integer encoding.
pub mod vlc;
/// Content-addressed `Cell`/`Ref` data model.
pub mod cell;
/// Chunked, prefix-tailed persistent vector.
pub mod vector;
/// Belief merge, consensus advance, and signing.
pub mod consensus;
/// Peer state: `State`, `Block`, `Order`, `Belief`, `Peer`, staking.
pub mod state;
/// External VM execution boundary.
pub mod runtime;
/// Keystore: Ed25519 signing/verification.
pub mod security;
