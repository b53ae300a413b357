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

//! Wire message kinds and the frame codec: one frame is `type-byte ||
//! message-id (cell) || payload (cell)`. `message_id` doubles as the
//! correlation id client interest tracking keys on, so `TRANSACT`/`QUERY`
//! carry no separate inner id field.

use crate::core::cell::{map_from_pairs, Cell, CellError, Cursor, Value};
use crate::core::state::model::{
    as_address, as_blob, as_map, as_string, field, kv, resolve_embedded, vref,
    SignedBelief, SignedTransaction, TransactionResult,
};
use crate::core::types::{PeerKey, Signature, H256};
use std::collections::BTreeMap;
use thiserror::Error;

/// Message codec errors.
#[derive(Debug, Error)]
pub enum MessageError {
    /// Malformed frame (bad tag, truncated, non-canonical cell).
    #[error(transparent)]
    Cell(#[from] CellError),
    /// Frame's leading type byte does not name a known message kind.
    #[error("unknown message kind")]
    UnknownKind,
}

/// Leading frame byte naming the message kind, distinct from any cell tag
/// embedded in the message id or payload that follows it.
pub mod kind {
    pub const BELIEF: u8 = 0;
    pub const CHALLENGE: u8 = 1;
    pub const COMMAND: u8 = 2;
    pub const DATA: u8 = 3;
    pub const MISSING_DATA: u8 = 4;
    pub const QUERY: u8 = 5;
    pub const RESPONSE: u8 = 6;
    pub const RESULT: u8 = 7;
    pub const TRANSACT: u8 = 8;
    pub const GOODBYE: u8 = 9;
    pub const STATUS: u8 = 10;
}

/// A challenge token together with a signature over
/// `challenge_signing_bytes(token)`, the shape both `CHALLENGE` and
/// `RESPONSE` carry.
#[derive(Clone, Debug, PartialEq)]
pub struct SignedToken {
    /// The random token being attested to.
    pub token: Vec<u8>,
    /// Signature over the token's domain-separated digest.
    pub signature: Signature,
}

impl SignedToken {
    fn to_value(&self) -> Value {
        map_from_pairs(vec![kv("token", Value::Blob(self.token.clone())), kv("signature", Value::Blob(self.signature.0.clone()))])
    }

    fn from_value(v: Value) -> Result<Self, MessageError> {
        let pairs = as_map(v).map_err(|_| CellError::InvalidData)?;
        let token = as_blob(field(&pairs, "token").map_err(|_| CellError::InvalidData)?).map_err(|_| CellError::InvalidData)?;
        let signature = Signature(as_blob(field(&pairs, "signature").map_err(|_| CellError::InvalidData)?).map_err(|_| CellError::InvalidData)?);
        Ok(SignedToken { token, signature })
    }
}

/// `QUERY` payload: evaluate `form` as `address` against the current state.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    /// Program text handed to the external VM.
    pub form: String,
    /// Acting address.
    pub address: PeerKey,
}

impl Query {
    fn to_value(&self) -> Value {
        map_from_pairs(vec![kv("form", Value::StringCell(self.form.clone())), kv("address", Value::Address(self.address.clone()))])
    }

    fn from_value(v: Value) -> Result<Self, MessageError> {
        let pairs = as_map(v).map_err(|_| CellError::InvalidData)?;
        let form = as_string(field(&pairs, "form").map_err(|_| CellError::InvalidData)?).map_err(|_| CellError::InvalidData)?;
        let address = as_address(field(&pairs, "address").map_err(|_| CellError::InvalidData)?).map_err(|_| CellError::InvalidData)?;
        Ok(Query { form, address })
    }
}

/// `STATUS` reply payload: `[beliefHash, stateHash, genesisStateHash,
/// {peerKey -> url}]`.
#[derive(Clone, Debug, PartialEq)]
pub struct StatusReply {
    /// Hash of the replying peer's current signed belief.
    pub belief_hash: H256,
    /// Hash of the replying peer's current state.
    pub state_hash: H256,
    /// Hash of the replying peer's genesis state.
    pub genesis_state_hash: H256,
    /// Every known peer's advertised URL, if any.
    pub peers: BTreeMap<PeerKey, String>,
}

impl StatusReply {
    fn to_value(&self) -> Value {
        let peers = map_from_pairs(
            self.peers
                .iter()
                .map(|(k, url)| (vref(Value::Address(k.clone())), vref(Value::StringCell(url.clone()))))
                .collect(),
        );
        map_from_pairs(vec![
            kv("belief_hash", Value::Blob(self.belief_hash.as_bytes().to_vec())),
            kv("state_hash", Value::Blob(self.state_hash.as_bytes().to_vec())),
            kv("genesis_state_hash", Value::Blob(self.genesis_state_hash.as_bytes().to_vec())),
            kv("peers", peers),
        ])
    }

    fn from_value(v: Value) -> Result<Self, MessageError> {
        let pairs = as_map(v).map_err(|_| CellError::InvalidData)?;
        let belief_hash = as_hash(field(&pairs, "belief_hash").map_err(|_| CellError::InvalidData)?)?;
        let state_hash = as_hash(field(&pairs, "state_hash").map_err(|_| CellError::InvalidData)?)?;
        let genesis_state_hash = as_hash(field(&pairs, "genesis_state_hash").map_err(|_| CellError::InvalidData)?)?;
        let peer_pairs = as_map(field(&pairs, "peers").map_err(|_| CellError::InvalidData)?).map_err(|_| CellError::InvalidData)?;
        let mut peers = BTreeMap::new();
        for (k, val) in peer_pairs {
            let addr = as_address(resolve_embedded(&k).map_err(|_| CellError::InvalidData)?).map_err(|_| CellError::InvalidData)?;
            let url = as_string(resolve_embedded(&val).map_err(|_| CellError::InvalidData)?).map_err(|_| CellError::InvalidData)?;
            peers.insert(addr, url);
        }
        Ok(StatusReply { belief_hash, state_hash, genesis_state_hash, peers })
    }
}

fn as_hash(v: Value) -> Result<H256, MessageError> {
    let bytes = as_blob(v).map_err(|_| CellError::InvalidData)?;
    if bytes.len() != 32 {
        return Err(MessageError::Cell(CellError::InvalidData));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(H256::from_bytes(out))
}

/// One parsed application message. `message_id` (the frame's own
/// correlation id) is carried alongside a `Message`, not inside it — see
/// `Frame`.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// A peer's signed belief.
    Belief(SignedBelief),
    /// Outbound half of the challenge handshake.
    Challenge(SignedToken),
    /// Left unimplemented per the source's own open question: parsed only
    /// as an opaque payload cell, never interpreted.
    Command(Value),
    /// A cell pushed to warm a remote's store, or to answer `MISSING_DATA`.
    Data(Value),
    /// A cell this peer does not yet have, keyed by hash.
    MissingData(H256),
    /// Evaluate a form against the current state.
    Query(Query),
    /// Inbound half of the challenge handshake.
    Response(SignedToken),
    /// A transaction's execution outcome, delivered to a waiting client.
    Result(TransactionResult),
    /// A client-submitted signed transaction.
    Transact(SignedTransaction),
    /// Close the connection.
    Goodbye,
    /// `None` is the request; `Some` is the reply this peer sends back.
    Status(Option<StatusReply>),
}

impl Message {
    fn kind_byte(&self) -> u8 {
        match self {
            Message::Belief(_) => kind::BELIEF,
            Message::Challenge(_) => kind::CHALLENGE,
            Message::Command(_) => kind::COMMAND,
            Message::Data(_) => kind::DATA,
            Message::MissingData(_) => kind::MISSING_DATA,
            Message::Query(_) => kind::QUERY,
            Message::Response(_) => kind::RESPONSE,
            Message::Result(_) => kind::RESULT,
            Message::Transact(_) => kind::TRANSACT,
            Message::Goodbye => kind::GOODBYE,
            Message::Status(_) => kind::STATUS,
        }
    }

    fn write_payload(&self, out: &mut Vec<u8>) {
        match self {
            Message::Belief(b) => b.write(out),
            Message::Challenge(t) | Message::Response(t) => t.to_value().write(out),
            Message::Command(v) | Message::Data(v) => v.write(out),
            Message::MissingData(h) => Value::Blob(h.as_bytes().to_vec()).write(out),
            Message::Query(q) => q.to_value().write(out),
            Message::Result(r) => r.write(out),
            Message::Transact(t) => t.write(out),
            Message::Goodbye => Value::Nil.write(out),
            Message::Status(None) => Value::Nil.write(out),
            Message::Status(Some(reply)) => reply.to_value().write(out),
        }
    }

    fn read_payload(kind_byte: u8, cur: &mut Cursor<'_>) -> Result<Self, MessageError> {
        let payload_tag = cur.take_u8()?;
        Ok(match kind_byte {
            kind::BELIEF => Message::Belief(SignedBelief::read(payload_tag, cur)?),
            kind::CHALLENGE => Message::Challenge(SignedToken::from_value(Value::read(payload_tag, cur)?)?),
            kind::COMMAND => Message::Command(Value::read(payload_tag, cur)?),
            kind::DATA => Message::Data(Value::read(payload_tag, cur)?),
            kind::MISSING_DATA => {
                let bytes = as_blob(Value::read(payload_tag, cur)?).map_err(|_| CellError::InvalidData)?;
                if bytes.len() != 32 {
                    return Err(MessageError::Cell(CellError::InvalidData));
                }
                let mut h = [0u8; 32];
                h.copy_from_slice(&bytes);
                Message::MissingData(H256::from_bytes(h))
            }
            kind::QUERY => Message::Query(Query::from_value(Value::read(payload_tag, cur)?)?),
            kind::RESPONSE => Message::Response(SignedToken::from_value(Value::read(payload_tag, cur)?)?),
            kind::RESULT => Message::Result(TransactionResult::read(payload_tag, cur)?),
            kind::TRANSACT => Message::Transact(SignedTransaction::read(payload_tag, cur)?),
            kind::GOODBYE => {
                let _ = Value::read(payload_tag, cur)?;
                Message::Goodbye
            }
            kind::STATUS => match Value::read(payload_tag, cur)? {
                Value::Nil => Message::Status(None),
                other => Message::Status(Some(StatusReply::from_value(other)?)),
            },
            _ => return Err(MessageError::UnknownKind),
        })
    }
}

/// A full frame: the wire unit a connection sends/receives, independent of
/// the length-delimited byte framing underneath it.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    /// Sender-chosen correlation id. Doubles as the client interest key for
    /// `TRANSACT`/`QUERY` and the id a matching `RESULT` carries back.
    pub message_id: u64,
    /// The parsed message.
    pub message: Message,
}

impl Frame {
    /// Build a frame.
    pub fn new(message_id: u64, message: Message) -> Self {
        Frame { message_id, message }
    }

    /// Encode to the raw frame body (type-byte || message-id cell ||
    /// payload cell). The caller length-prefixes this for the transport.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.push(self.message.kind_byte());
        Value::Long(self.message_id as i64).write(&mut out);
        self.message.write_payload(&mut out);
        out
    }

    /// Decode a frame body produced by `encode`.
    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let mut cur = Cursor::new(bytes);
        let kind_byte = cur.take_u8()?;
        let id_tag = cur.take_u8()?;
        let message_id = match Value::read(id_tag, &mut cur)? {
            Value::Long(n) => n.max(0) as u64,
            _ => return Err(MessageError::Cell(CellError::InvalidData)),
        };
        let message = Message::read_payload(kind_byte, &mut cur)?;
        if !cur.is_empty() {
            return Err(MessageError::Cell(CellError::BadFormat));
        }
        Ok(Frame { message_id, message })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::security::keystore::{FileEd25519Backend, Keystore};
    use crate::core::state::model::{Belief, Block, Order, SignedOrder, Transaction};

    fn keystore() -> (tempfile::TempDir, Keystore<FileEd25519Backend>) {
        let dir = tempfile::tempdir().unwrap();
        let ks = Keystore::open(dir.path().to_str().unwrap()).unwrap();
        (dir, ks)
    }

    #[test]
    fn goodbye_roundtrip() {
        let frame = Frame::new(7, Message::Goodbye);
        let back = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(frame, back);
    }

    #[test]
    fn missing_data_roundtrip() {
        let frame = Frame::new(1, Message::MissingData(H256::from_bytes([9u8; 32])));
        let back = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(frame, back);
    }

    #[test]
    fn status_request_and_reply_roundtrip() {
        let req = Frame::new(2, Message::Status(None));
        assert_eq!(Frame::decode(&req.encode()).unwrap(), req);

        let mut peers = BTreeMap::new();
        peers.insert(PeerKey(vec![1u8; 32]), "peer://x".to_string());
        let reply = Frame::new(
            2,
            Message::Status(Some(StatusReply {
                belief_hash: H256::from_bytes([1u8; 32]),
                state_hash: H256::from_bytes([2u8; 32]),
                genesis_state_hash: H256::from_bytes([3u8; 32]),
                peers,
            })),
        );
        assert_eq!(Frame::decode(&reply.encode()).unwrap(), reply);
    }

    #[test]
    fn challenge_and_response_roundtrip() {
        let token = SignedToken { token: vec![5u8; 120], signature: Signature(vec![1u8; 64]) };
        let frame = Frame::new(3, Message::Challenge(token.clone()));
        assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
        let frame = Frame::new(3, Message::Response(token));
        assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn transact_roundtrip() {
        let (_d, ks) = keystore();
        let addr = PeerKey(ks.public_key().to_vec());
        let tx = Transaction::Invoke { address: addr.clone(), sequence: -1, form: "(+ 1 2)".into() };
        let signed = SignedTransaction::sign(tx, &ks).unwrap();
        let frame = Frame::new(42, Message::Transact(signed));
        assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn belief_roundtrip() {
        let (_d, ks) = keystore();
        let addr = PeerKey(ks.public_key().to_vec());
        let order = Order::empty().propose(Block::new(1, addr.clone(), vec![]));
        let signed_order = SignedOrder::sign(order, &addr, 1, &ks).unwrap();
        let mut belief = Belief::empty();
        belief.orders.insert(addr, signed_order);
        let signed_belief = SignedBelief::sign(belief, 2, &ks).unwrap();
        let frame = Frame::new(1, Message::Belief(signed_belief));
        assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn command_is_parsed_but_opaque() {
        let frame = Frame::new(1, Message::Command(Value::Nil));
        let back = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(frame, back);
    }

    #[test]
    fn unknown_kind_byte_rejected() {
        let mut bytes = Frame::new(1, Message::Goodbye).encode();
        bytes[0] = 0xfe;
        assert!(Frame::decode(&bytes).is_err());
    }
}
