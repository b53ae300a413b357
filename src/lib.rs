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

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! A decentralized consensus peer: content-addressed data model, persistent
//! vector, content-addressed store, Belief merge / consensus advance, and
//! the framed peer-to-peer protocol that carries it all between peers.

/// Core protocol primitives (types, cell model, vector, consensus, state,
/// the VM boundary, and the keystore).
pub mod core;
/// Content-addressed store: hash-keyed persistence, shallow/deep modes,
/// root-hash restart anchor.
pub mod store;
/// Observability (metrics, structured logging helpers).
pub mod monitoring;
/// Framed peer-to-peer transport and connection management.
pub mod networking;
/// Message framing, dispatch, interest tracking, handshake, worker loop.
pub mod server;
/// Typed peer configuration, TOML-loadable.
pub mod config;
