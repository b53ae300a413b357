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

//! Generate (or load) a peer's Ed25519 keypair under a data directory and
//! print its base58 address.

use anyhow::Result;
use concordia::core::security::keystore::Keystore;
use concordia::core::types::PeerKey;

fn main() -> Result<()> {
    let key_dir = std::env::args().nth(1).unwrap_or_else(|| "data/keys".to_string());
    std::fs::create_dir_all(&key_dir)?;

    let keystore = Keystore::open(&key_dir).map_err(|e| anyhow::anyhow!("keystore open failed: {e}"))?;
    let address = PeerKey(keystore.public_key().to_vec());
    println!("{}", address.to_base58());
    Ok(())
}
