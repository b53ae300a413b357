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
#![deny(missing_docs)]

//! Domain-separated signing bytes for the values peers exchange and sign:
//! orders, beliefs, and challenge-handshake tokens. Every signed value is
//! signed over `domain || fields`, never over the raw cell encoding alone,
//! so a signature produced for one purpose can never be replayed as if it
//! were for another.

use crate::core::types::{encode_canonical, PeerKey, H256};
use ring::digest;
use thiserror::Error;

/// Signing-payload construction error.
#[derive(Debug, Error)]
pub enum SigningError {
    /// Canonical encoding of an auxiliary field failed.
    #[error("codec")]
    Codec,
}

/// Bytes a peer signs over its own `Order`: domain || timestamp ||
/// order_hash || peer.
pub fn order_signing_bytes(order_hash: H256, peer: &PeerKey, timestamp: u64) -> Result<Vec<u8>, SigningError> {
    let peer_bytes = encode_canonical(&peer.0).map_err(|_| SigningError::Codec)?;
    let mut out = Vec::with_capacity(24 + 8 + 32 + peer_bytes.len());
    out.extend_from_slice(b"Concordia-Order-v1");
    out.extend_from_slice(&timestamp.to_be_bytes());
    out.extend_from_slice(order_hash.as_bytes());
    out.extend_from_slice(&peer_bytes);
    Ok(out)
}

/// Bytes a peer signs over its whole `Belief`: domain || timestamp ||
/// belief_hash.
pub fn belief_signing_bytes(belief_hash: H256, timestamp: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(25 + 8 + 32);
    out.extend_from_slice(b"Concordia-Belief-v1");
    out.extend_from_slice(&timestamp.to_be_bytes());
    out.extend_from_slice(belief_hash.as_bytes());
    out
}

/// Bytes a peer signs over a `Transaction`: domain || sequence ||
/// transaction_hash.
pub fn transaction_signing_bytes(transaction_hash: H256, sequence: i64) -> Vec<u8> {
    let mut out = Vec::with_capacity(29 + 8 + 32);
    out.extend_from_slice(b"Concordia-Transaction-v1");
    out.extend_from_slice(&sequence.to_be_bytes());
    out.extend_from_slice(transaction_hash.as_bytes());
    out
}

/// Bytes a peer signs during the challenge handshake: domain ||
/// sha256(token). The token itself (≥120 random bytes) is never signed
/// directly so that a signed challenge can never be mistaken for a signed
/// order or belief of the same byte length.
pub fn challenge_signing_bytes(token: &[u8]) -> Vec<u8> {
    let token_digest = digest::digest(&digest::SHA256, token);
    let mut out = Vec::with_capacity(23 + 32);
    out.extend_from_slice(b"Concordia-Challenge-v1");
    out.extend_from_slice(token_digest.as_ref());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_bytes_change_with_timestamp() {
        let peer = PeerKey(vec![1u8; 32]);
        let h = H256::from_bytes([3u8; 32]);
        let a = order_signing_bytes(h, &peer, 1).unwrap();
        let b = order_signing_bytes(h, &peer, 2).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn belief_bytes_deterministic() {
        let h = H256::from_bytes([9u8; 32]);
        assert_eq!(belief_signing_bytes(h, 42), belief_signing_bytes(h, 42));
    }

    #[test]
    fn transaction_bytes_change_with_sequence() {
        let h = H256::from_bytes([5u8; 32]);
        let a = transaction_signing_bytes(h, 1);
        let b = transaction_signing_bytes(h, 2);
        assert_ne!(a, b);
    }

    #[test]
    fn challenge_bytes_not_raw_token() {
        let token = vec![7u8; 120];
        let signed = challenge_signing_bytes(&token);
        assert_ne!(signed, token);
    }
}
