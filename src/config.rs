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

//! Typed peer configuration, TOML-loadable via `serde`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("io")]
    Io,
    /// The config file's TOML was malformed or missing a required field.
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// A single bootstrap peer: its key and the URL to dial it at.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BootstrapPeer {
    /// Base58-encoded Ed25519 public key.
    pub key: String,
    /// Address the peer can be reached at, e.g. `tcp://host:port`.
    pub url: String,
}

/// Everything needed to start a peer: key material, store location,
/// listen/advertise addressing, and startup/shutdown persistence behavior.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Directory holding `validator.key` and the keystore's audit log.
    pub key_dir: PathBuf,
    /// Directory the content-addressed store (`sled`) opens under.
    pub store_dir: PathBuf,
    /// Local TCP port to accept connections on.
    pub bind_port: u16,
    /// URL advertised to peers so they can dial back, if reachable.
    pub advertised_url: Option<String>,
    /// Restore `Peer`/`State` from the store's persisted root hash on start,
    /// rather than from a fresh genesis.
    #[serde(default)]
    pub restore_from_root: bool,
    /// Deep-store and `set_root` the final `Peer` on graceful shutdown.
    #[serde(default = "default_true")]
    pub persist_on_close: bool,
    /// Peers to dial at startup before `State.peers` has been populated from
    /// consensus.
    #[serde(default)]
    pub bootstrap: Vec<BootstrapPeer>,
    /// Client interest table capacity (oldest interest culled once exceeded).
    #[serde(default = "default_interest_capacity")]
    pub interest_capacity: usize,
}

fn default_true() -> bool {
    true
}

fn default_interest_capacity() -> usize {
    10_000
}

impl PeerConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|_| ConfigError::Io)?;
        let cfg: PeerConfig = toml::from_str(&text)?;
        Ok(cfg)
    }
}
