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

//! Peer state: `State`, `Block`, `Order`, `Belief`, `Peer`, and the
//! transaction shapes that flow between them.
//!
//! Every domain type here is a `Cell` by delegation: it converts to and
//! from a sorted `Value::Map` keyed by field-name keywords rather than
//! inventing its own wire tag, so the closed tag space in `core::cell`
//! never has to grow. A nested domain cell (an `Order` inside a
//! `SignedOrder`, a `PersistentVector<Block>` inside an `Order`) is
//! bridged to `Value`/`Ref<Value>` by round-tripping through its own
//! canonical encoding rather than by hand-walking its structure: since
//! every type here delegates `write`/`read` straight through a `Value`,
//! a type's own bytes are always valid `Value` bytes too.
//!
//! `write` has no store handle to resolve through, so every conversion in
//! this module assumes its in-memory children are already embedded or
//! resolved — true for every value this module itself constructs, and
//! for anything freshly decoded, since decoding never defers to the
//! store.

use crate::core::cell::{map_from_pairs, Cell, CellError, Cursor, Ref, Value};
use crate::core::consensus::signing::{belief_signing_bytes, order_signing_bytes};
use crate::core::security::keystore::{verify_pubkey_bytes, FileEd25519Backend, Keystore, KeystoreError};
use crate::core::types::{CanonicalMap, PeerKey, Signature};
use crate::core::vector::PersistentVector;
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors raised constructing or reading a domain record out of its cell
/// encoding.
#[derive(Debug, Error)]
pub enum ModelError {
    /// A required field was absent or had the wrong shape.
    #[error("invalid data")]
    InvalidData,
    /// Underlying cell decode failure.
    #[error(transparent)]
    Cell(#[from] CellError),
}

impl From<ModelError> for CellError {
    fn from(e: ModelError) -> Self {
        match e {
            ModelError::InvalidData => CellError::InvalidData,
            ModelError::Cell(c) => c,
        }
    }
}

pub(crate) fn kw(name: &str) -> Value {
    Value::Keyword(name.to_string())
}

pub(crate) fn vref(v: Value) -> Ref<Value> {
    Ref::from_value(v)
}

pub(crate) fn kv(name: &str, v: Value) -> (Ref<Value>, Ref<Value>) {
    (vref(kw(name)), vref(v))
}

pub(crate) fn as_map(v: Value) -> Result<Vec<(Ref<Value>, Ref<Value>)>, ModelError> {
    match v {
        Value::Map(pairs) => Ok(pairs),
        _ => Err(ModelError::InvalidData),
    }
}

pub(crate) fn field_ref(pairs: &[(Ref<Value>, Ref<Value>)], name: &str) -> Result<Ref<Value>, ModelError> {
    let target = kw(name).hash();
    pairs.iter().find(|(k, _)| k.hash() == target).map(|(_, v)| v.clone()).ok_or(ModelError::InvalidData)
}

pub(crate) fn resolve_embedded(r: &Ref<Value>) -> Result<Value, ModelError> {
    match r {
        Ref::Embedded(v) | Ref::Resolved(v, _) => Ok((**v).clone()),
        _ => Err(ModelError::InvalidData),
    }
}

pub(crate) fn field(pairs: &[(Ref<Value>, Ref<Value>)], name: &str) -> Result<Value, ModelError> {
    resolve_embedded(&field_ref(pairs, name)?)
}

pub(crate) fn as_long(v: Value) -> Result<i64, ModelError> {
    match v {
        Value::Long(n) => Ok(n),
        _ => Err(ModelError::InvalidData),
    }
}

pub(crate) fn as_u64(v: Value) -> Result<u64, ModelError> {
    Ok(as_long(v)?.max(0) as u64)
}

pub(crate) fn as_blob(v: Value) -> Result<Vec<u8>, ModelError> {
    match v {
        Value::Blob(b) => Ok(b),
        _ => Err(ModelError::InvalidData),
    }
}

pub(crate) fn as_u128_blob(v: Value) -> Result<u128, ModelError> {
    let bytes = as_blob(v)?;
    if bytes.len() != 16 {
        return Err(ModelError::InvalidData);
    }
    let mut buf = [0u8; 16];
    buf.copy_from_slice(&bytes);
    Ok(u128::from_be_bytes(buf))
}

pub(crate) fn as_address(v: Value) -> Result<PeerKey, ModelError> {
    match v {
        Value::Address(a) => Ok(a),
        _ => Err(ModelError::InvalidData),
    }
}

pub(crate) fn as_string(v: Value) -> Result<String, ModelError> {
    match v {
        Value::StringCell(s) => Ok(s),
        _ => Err(ModelError::InvalidData),
    }
}

/// Bridge a reference to any domain `Cell` into a `Ref<Value>`: an
/// in-memory child is re-read as a `Value` through its own canonical
/// encoding; a hash-only child keeps its hash.
fn ref_to_value_ref<T: Cell>(r: &Ref<T>) -> Ref<Value> {
    match r {
        Ref::Embedded(v) | Ref::Resolved(v, _) => {
            let bytes = v.encode();
            Ref::from_value(Value::decode(&bytes).expect("domain cell encodes as a valid Value"))
        }
        Ref::StoredShallow(h) | Ref::Unresolved(h) => Ref::Unresolved(*h),
    }
}

/// Inverse of `ref_to_value_ref`.
fn value_ref_to_ref<T: Cell>(r: &Ref<Value>) -> Result<Ref<T>, ModelError> {
    match r {
        Ref::Embedded(v) | Ref::Resolved(v, _) => {
            let bytes = v.encode();
            let t = T::decode(&bytes).map_err(|_| ModelError::InvalidData)?;
            Ok(Ref::from_value(t))
        }
        Ref::StoredShallow(h) | Ref::Unresolved(h) => Ok(Ref::Unresolved(*h)),
    }
}

/// Bridge a `PersistentVector<T>` into the `Value::Vector` shape: the two
/// share the `VECTOR_LEAF`/`VECTOR_TREE` tags, so a `PersistentVector<T>`'s
/// own bytes decode straight into a `PersistentVector<Value>`.
fn vector_to_value<T: Cell>(v: &PersistentVector<T>) -> Value {
    let bytes = v.encode();
    Value::decode(&bytes).expect("PersistentVector<T> encodes as a valid Value")
}

/// Inverse of `vector_to_value`.
fn value_to_vector<T: Cell>(v: Value) -> Result<PersistentVector<T>, ModelError> {
    let bytes = v.encode();
    PersistentVector::<T>::decode(&bytes).map_err(|_| ModelError::InvalidData)
}

fn map_to_value<K: Clone + Into<Value>, V>(m: &CanonicalMap<K, V>, to_value: fn(&V) -> Value) -> Value {
    map_from_pairs(m.iter().map(|(k, v)| (vref(k.clone().into()), vref(to_value(v)))).collect())
}

fn value_to_map<V>(v: Value, from_value: fn(Value) -> Result<V, ModelError>) -> Result<CanonicalMap<PeerKey, V>, ModelError> {
    let mut out = BTreeMap::new();
    for (k, val) in as_map(v)? {
        out.insert(as_address(resolve_embedded(&k)?)?, from_value(resolve_embedded(&val)?)?);
    }
    Ok(out)
}

/// Connects a domain type's `to_value`/`from_value` pair to the `Cell`
/// trait's `write`/`read`.
macro_rules! cell_via_value {
    ($t:ty) => {
        impl Cell for $t {
            fn write(&self, out: &mut Vec<u8>) {
                self.to_value().write(out)
            }
            fn read(tag: u8, cur: &mut Cursor<'_>) -> Result<Self, CellError> {
                let v = Value::read(tag, cur)?;
                Self::from_value(v).map_err(Into::into)
            }
        }
    };
}

impl From<PeerKey> for Value {
    fn from(k: PeerKey) -> Self {
        Value::Address(k)
    }
}

/// Per-peer network metadata kept within `State`.
#[derive(Clone, Debug, PartialEq)]
pub struct PeerStatus {
    /// Stake figure used in the weighted-majority consensus computation.
    pub stake: u128,
    /// Advertised connect URL, if any.
    pub url: Option<String>,
}

impl PeerStatus {
    fn to_value(&self) -> Value {
        let url = match &self.url {
            Some(u) => Value::StringCell(u.clone()),
            None => Value::Nil,
        };
        map_from_pairs(vec![
            kv("stake", Value::Blob(self.stake.to_be_bytes().to_vec())),
            kv("url", url),
        ])
    }

    fn from_value(v: Value) -> Result<Self, ModelError> {
        let pairs = as_map(v)?;
        let stake = as_u128_blob(field(&pairs, "stake")?)?;
        let url = match field(&pairs, "url")? {
            Value::Nil => None,
            other => Some(as_string(other)?),
        };
        Ok(PeerStatus { stake, url })
    }
}
cell_via_value!(PeerStatus);

/// Per-account ledger entry.
#[derive(Clone, Debug, PartialEq)]
pub struct AccountStatus {
    /// Balance in the smallest denomination.
    pub balance: u128,
    /// Replay-protection sequence number.
    pub sequence: i64,
}

impl AccountStatus {
    fn to_value(&self) -> Value {
        map_from_pairs(vec![
            kv("balance", Value::Blob(self.balance.to_be_bytes().to_vec())),
            kv("sequence", Value::Long(self.sequence)),
        ])
    }

    fn from_value(v: Value) -> Result<Self, ModelError> {
        let pairs = as_map(v)?;
        let balance = as_u128_blob(field(&pairs, "balance")?)?;
        let sequence = as_long(field(&pairs, "sequence")?)?;
        Ok(AccountStatus { balance, sequence })
    }
}
cell_via_value!(AccountStatus);

/// Immutable snapshot of every account, every known peer, and the global
/// clock.
#[derive(Clone, Debug, PartialEq)]
pub struct State {
    /// Account ledger, keyed by address.
    pub accounts: CanonicalMap<PeerKey, AccountStatus>,
    /// Peer network metadata, keyed by peer key.
    pub peers: CanonicalMap<PeerKey, PeerStatus>,
    /// Global timestamp, advanced by the updater on each tick.
    pub timestamp_ms: u64,
}

impl State {
    /// The empty state with no accounts or peers.
    pub fn genesis(timestamp_ms: u64) -> Self {
        State { accounts: BTreeMap::new(), peers: BTreeMap::new(), timestamp_ms }
    }

    fn to_value(&self) -> Value {
        map_from_pairs(vec![
            kv("accounts", map_to_value(&self.accounts, AccountStatus::to_value)),
            kv("peers", map_to_value(&self.peers, PeerStatus::to_value)),
            kv("timestamp_ms", Value::Long(self.timestamp_ms as i64)),
        ])
    }

    fn from_value(v: Value) -> Result<Self, ModelError> {
        let pairs = as_map(v)?;
        let accounts = value_to_map(field(&pairs, "accounts")?, AccountStatus::from_value)?;
        let peers = value_to_map(field(&pairs, "peers")?, PeerStatus::from_value)?;
        let timestamp_ms = as_u64(field(&pairs, "timestamp_ms")?)?;
        Ok(State { accounts, peers, timestamp_ms })
    }
}
cell_via_value!(State);

/// A transaction body. `Invoke` is the only kind the governing domain
/// names; the core accepts it as an opaque program form handed to the
/// external VM.
#[derive(Clone, Debug, PartialEq)]
pub enum Transaction {
    /// Evaluate `form` as `address`. `sequence == -1` means "use the
    /// account's current sequence".
    Invoke {
        /// Acting address.
        address: PeerKey,
        /// Replay-protection sequence, or -1 for "current".
        sequence: i64,
        /// Program text handed to the external VM.
        form: String,
    },
}

impl Transaction {
    fn to_value(&self) -> Value {
        match self {
            Transaction::Invoke { address, sequence, form } => map_from_pairs(vec![
                kv("kind", Value::Keyword("invoke".into())),
                kv("address", Value::Address(address.clone())),
                kv("sequence", Value::Long(*sequence)),
                kv("form", Value::StringCell(form.clone())),
            ]),
        }
    }

    fn from_value(v: Value) -> Result<Self, ModelError> {
        let pairs = as_map(v)?;
        match field(&pairs, "kind")? {
            Value::Keyword(k) if k == "invoke" => Ok(Transaction::Invoke {
                address: as_address(field(&pairs, "address")?)?,
                sequence: as_long(field(&pairs, "sequence")?)?,
                form: as_string(field(&pairs, "form")?)?,
            }),
            _ => Err(ModelError::InvalidData),
        }
    }
}
cell_via_value!(Transaction);

/// A transaction carrying its author's signature.
#[derive(Clone, Debug, PartialEq)]
pub struct SignedTransaction {
    /// The transaction body.
    pub transaction: Transaction,
    /// Signature over the transaction's canonical encoding.
    pub signature: Signature,
}

impl SignedTransaction {
    /// Sign `transaction` with `keystore`.
    pub fn sign(transaction: Transaction, keystore: &Keystore<FileEd25519Backend>) -> Result<Self, KeystoreError> {
        let bytes = transaction.encode();
        let signature = keystore.sign(&bytes)?;
        Ok(SignedTransaction { transaction, signature })
    }

    /// Verify the signature against `signer`'s public key.
    pub fn verify(&self, signer: &PeerKey) -> bool {
        let bytes = self.transaction.encode();
        let pk = match signer.as_public_key_bytes() {
            Some(p) => p,
            None => return false,
        };
        verify_pubkey_bytes(&pk, &bytes, &self.signature).is_ok()
    }

    fn to_value(&self) -> Value {
        map_from_pairs(vec![
            kv("transaction", self.transaction.to_value()),
            kv("signature", Value::Blob(self.signature.0.clone())),
        ])
    }

    fn from_value(v: Value) -> Result<Self, ModelError> {
        let pairs = as_map(v)?;
        let transaction = Transaction::from_value(field(&pairs, "transaction")?)?;
        let signature = Signature(as_blob(field(&pairs, "signature")?)?);
        Ok(SignedTransaction { transaction, signature })
    }
}
cell_via_value!(SignedTransaction);

/// The error taxonomy a `TransactionResult` may carry back to a client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResultErrorCode {
    /// Malformed encoding.
    BadFormat,
    /// Signature did not verify.
    BadSignature,
    /// Structurally parseable but violates an invariant.
    InvalidData,
    /// A referenced cell was not locally available.
    MissingData,
    /// A handshake or RPC did not complete in time.
    Timeout,
    /// Unexpected internal failure.
    Internal,
}

impl ResultErrorCode {
    fn as_str(&self) -> &'static str {
        match self {
            ResultErrorCode::BadFormat => "BAD_FORMAT",
            ResultErrorCode::BadSignature => "SIGNATURE",
            ResultErrorCode::InvalidData => "INVALID_DATA",
            ResultErrorCode::MissingData => "MISSING_DATA",
            ResultErrorCode::Timeout => "TIMEOUT",
            ResultErrorCode::Internal => "INTERNAL",
        }
    }

    fn from_str(s: &str) -> Result<Self, ModelError> {
        Ok(match s {
            "BAD_FORMAT" => ResultErrorCode::BadFormat,
            "SIGNATURE" => ResultErrorCode::BadSignature,
            "INVALID_DATA" => ResultErrorCode::InvalidData,
            "MISSING_DATA" => ResultErrorCode::MissingData,
            "TIMEOUT" => ResultErrorCode::Timeout,
            "INTERNAL" => ResultErrorCode::Internal,
            _ => return Err(ModelError::InvalidData),
        })
    }
}

/// The outcome of executing (or rejecting) one transaction, reported back
/// to the client that submitted it.
#[derive(Clone, Debug, PartialEq)]
pub struct TransactionResult {
    /// Successful execution value.
    pub value: Option<Value>,
    /// Error code, set iff `value` is `None`.
    pub error: Option<ResultErrorCode>,
}

impl TransactionResult {
    /// A successful result.
    pub fn ok(value: Value) -> Self {
        TransactionResult { value: Some(value), error: None }
    }

    /// A failed result.
    pub fn err(code: ResultErrorCode) -> Self {
        TransactionResult { value: None, error: Some(code) }
    }

    fn to_value(&self) -> Value {
        let (value, error) = match (&self.value, &self.error) {
            (Some(v), _) => (v.clone(), Value::Nil),
            (None, Some(e)) => (Value::Nil, Value::Keyword(e.as_str().to_string())),
            (None, None) => (Value::Nil, Value::Nil),
        };
        map_from_pairs(vec![kv("value", value), kv("error", error)])
    }

    fn from_value(v: Value) -> Result<Self, ModelError> {
        let pairs = as_map(v)?;
        match (field(&pairs, "value")?, field(&pairs, "error")?) {
            (Value::Nil, Value::Keyword(k)) => Ok(TransactionResult { value: None, error: Some(ResultErrorCode::from_str(&k)?) }),
            (Value::Nil, Value::Nil) => Ok(TransactionResult { value: None, error: None }),
            (v, _) => Ok(TransactionResult { value: Some(v), error: None }),
        }
    }
}
cell_via_value!(TransactionResult);

/// A timestamped, peer-authored batch of signed transactions.
#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    /// Proposal time.
    pub timestamp_ms: u64,
    /// Proposing peer's address.
    pub peer: PeerKey,
    /// The batch, in execution order.
    pub transactions: PersistentVector<SignedTransaction>,
}

impl Block {
    /// Construct a new block from a plain transaction sequence.
    pub fn new(timestamp_ms: u64, peer: PeerKey, transactions: Vec<SignedTransaction>) -> Self {
        Block { timestamp_ms, peer, transactions: PersistentVector::from_elements(transactions) }
    }

    fn to_value(&self) -> Value {
        map_from_pairs(vec![
            kv("timestamp_ms", Value::Long(self.timestamp_ms as i64)),
            kv("peer", Value::Address(self.peer.clone())),
            kv("transactions", vector_to_value(&self.transactions)),
        ])
    }

    fn from_value(v: Value) -> Result<Self, ModelError> {
        let pairs = as_map(v)?;
        let timestamp_ms = as_u64(field(&pairs, "timestamp_ms")?)?;
        let peer = as_address(field(&pairs, "peer")?)?;
        let transactions = value_to_vector(field(&pairs, "transactions")?)?;
        Ok(Block { timestamp_ms, peer, transactions })
    }
}
cell_via_value!(Block);

/// Errors advancing an `Order`'s state.
#[derive(Debug, Error)]
pub enum OrderError {
    /// `consensus_point`/`proposal_point` invariant would be violated.
    #[error("order invariant violated")]
    InvariantViolated,
}

/// One peer's ordered, partially-consensed block history.
#[derive(Clone, Debug, PartialEq)]
pub struct Order {
    /// Proposed blocks, in order.
    pub blocks: PersistentVector<Block>,
    /// Count of blocks proposed so far.
    pub proposal_point: u64,
    /// Count of blocks that have reached consensus; always `<= proposal_point`.
    pub consensus_point: u64,
}

impl Order {
    /// The empty order.
    pub fn empty() -> Self {
        Order { blocks: PersistentVector::empty(), proposal_point: 0, consensus_point: 0 }
    }

    /// Append a newly proposed block.
    pub fn propose(&self, block: Block) -> Self {
        Order {
            blocks: self.blocks.append(block),
            proposal_point: self.proposal_point + 1,
            consensus_point: self.consensus_point,
        }
    }

    /// Advance the consensus point. Rejects any point that is not
    /// monotonically forward and within `[consensus_point, proposal_point]`.
    pub fn advance_consensus(&self, new_point: u64) -> Result<Self, OrderError> {
        if new_point < self.consensus_point || new_point > self.proposal_point {
            return Err(OrderError::InvariantViolated);
        }
        Ok(Order { blocks: self.blocks.clone(), proposal_point: self.proposal_point, consensus_point: new_point })
    }

    fn to_value(&self) -> Value {
        map_from_pairs(vec![
            kv("blocks", vector_to_value(&self.blocks)),
            kv("proposal_point", Value::Long(self.proposal_point as i64)),
            kv("consensus_point", Value::Long(self.consensus_point as i64)),
        ])
    }

    fn from_value(v: Value) -> Result<Self, ModelError> {
        let pairs = as_map(v)?;
        let blocks: PersistentVector<Block> = value_to_vector(field(&pairs, "blocks")?)?;
        let proposal_point = as_u64(field(&pairs, "proposal_point")?)?;
        let consensus_point = as_u64(field(&pairs, "consensus_point")?)?;
        if consensus_point > proposal_point || proposal_point > blocks.len() {
            return Err(ModelError::InvalidData);
        }
        Ok(Order { blocks, proposal_point, consensus_point })
    }
}
cell_via_value!(Order);

/// An `Order` carrying its author's signature and the time it was signed.
#[derive(Clone, Debug, PartialEq)]
pub struct SignedOrder {
    /// The signed order.
    pub order: Ref<Order>,
    /// Signature over `order_signing_bytes(order.hash(), peer, timestamp_ms)`.
    pub signature: Signature,
    /// Signing time.
    pub timestamp_ms: u64,
}

impl SignedOrder {
    /// Sign `order` as `peer` at `timestamp_ms`.
    pub fn sign(order: Order, peer: &PeerKey, timestamp_ms: u64, keystore: &Keystore<FileEd25519Backend>) -> Result<Self, KeystoreError> {
        let order_ref = Ref::from_value(order);
        let bytes = order_signing_bytes(order_ref.hash(), peer, timestamp_ms).map_err(|_| KeystoreError::Crypto)?;
        let signature = keystore.sign(&bytes)?;
        Ok(SignedOrder { order: order_ref, signature, timestamp_ms })
    }

    /// Verify the signature against `peer`'s public key.
    pub fn verify(&self, peer: &PeerKey) -> bool {
        let bytes = match order_signing_bytes(self.order.hash(), peer, self.timestamp_ms) {
            Ok(b) => b,
            Err(_) => return false,
        };
        let pk = match peer.as_public_key_bytes() {
            Some(p) => p,
            None => return false,
        };
        verify_pubkey_bytes(&pk, &bytes, &self.signature).is_ok()
    }

    fn to_value(&self) -> Value {
        map_from_pairs(vec![
            (vref(kw("order")), ref_to_value_ref(&self.order)),
            kv("signature", Value::Blob(self.signature.0.clone())),
            kv("timestamp_ms", Value::Long(self.timestamp_ms as i64)),
        ])
    }

    fn from_value(v: Value) -> Result<Self, ModelError> {
        let pairs = as_map(v)?;
        let order = value_ref_to_ref(&field_ref(&pairs, "order")?)?;
        let signature = Signature(as_blob(field(&pairs, "signature")?)?);
        let timestamp_ms = as_u64(field(&pairs, "timestamp_ms")?)?;
        Ok(SignedOrder { order, signature, timestamp_ms })
    }
}
cell_via_value!(SignedOrder);

/// The set of every peer's retained order, as seen by one peer.
#[derive(Clone, Debug, PartialEq)]
pub struct Belief {
    /// Each peer's signed order, keyed by that peer's address.
    pub orders: CanonicalMap<PeerKey, SignedOrder>,
}

impl Belief {
    /// The empty belief.
    pub fn empty() -> Self {
        Belief { orders: BTreeMap::new() }
    }

    fn to_value(&self) -> Value {
        map_from_pairs(vec![kv("orders", map_to_value(&self.orders, SignedOrder::to_value))])
    }

    fn from_value(v: Value) -> Result<Self, ModelError> {
        let pairs = as_map(v)?;
        let orders = value_to_map(field(&pairs, "orders")?, SignedOrder::from_value)?;
        Ok(Belief { orders })
    }
}
cell_via_value!(Belief);

/// A `Belief` carrying its author's signature.
#[derive(Clone, Debug, PartialEq)]
pub struct SignedBelief {
    /// The signed belief.
    pub belief: Ref<Belief>,
    /// Signature over `belief_signing_bytes(belief.hash(), timestamp_ms)`.
    pub signature: Signature,
    /// Signing time.
    pub timestamp_ms: u64,
}

impl SignedBelief {
    /// Sign `belief` at `timestamp_ms`.
    pub fn sign(belief: Belief, timestamp_ms: u64, keystore: &Keystore<FileEd25519Backend>) -> Result<Self, KeystoreError> {
        let belief_ref = Ref::from_value(belief);
        let bytes = belief_signing_bytes(belief_ref.hash(), timestamp_ms);
        let signature = keystore.sign(&bytes)?;
        Ok(SignedBelief { belief: belief_ref, signature, timestamp_ms })
    }

    /// Verify the signature against `peer`'s public key.
    pub fn verify(&self, peer: &PeerKey) -> bool {
        let bytes = belief_signing_bytes(self.belief.hash(), self.timestamp_ms);
        let pk = match peer.as_public_key_bytes() {
            Some(p) => p,
            None => return false,
        };
        verify_pubkey_bytes(&pk, &bytes, &self.signature).is_ok()
    }

    fn to_value(&self) -> Value {
        map_from_pairs(vec![
            (vref(kw("belief")), ref_to_value_ref(&self.belief)),
            kv("signature", Value::Blob(self.signature.0.clone())),
            kv("timestamp_ms", Value::Long(self.timestamp_ms as i64)),
        ])
    }

    fn from_value(v: Value) -> Result<Self, ModelError> {
        let pairs = as_map(v)?;
        let belief = value_ref_to_ref(&field_ref(&pairs, "belief")?)?;
        let signature = Signature(as_blob(field(&pairs, "signature")?)?);
        let timestamp_ms = as_u64(field(&pairs, "timestamp_ms")?)?;
        Ok(SignedBelief { belief, signature, timestamp_ms })
    }
}
cell_via_value!(SignedBelief);

/// A running peer: its keystore, current state, and current belief.
///
/// Deliberately not `Clone`: a `Peer` is meant to live behind one owner
/// (an `Arc` swapped atomically by the updater thread), not copied
/// piecemeal.
pub struct Peer {
    /// This peer's signing keystore.
    pub keystore: Keystore<FileEd25519Backend>,
    /// Latest executed state.
    pub state: State,
    /// This peer's own belief (the merge of every peer's retained order it
    /// has seen).
    pub belief: Belief,
    /// `belief`, signed by this peer.
    pub signed_belief: SignedBelief,
}

impl Peer {
    /// This peer's address, derived from its keystore's public key.
    pub fn address(&self) -> PeerKey {
        PeerKey(self.keystore.public_key().to_vec())
    }
}

/// What gets deep-stored and anchored as the store's root hash on graceful
/// shutdown: everything of `Peer` except the keystore, which lives on disk
/// under its own path and is never part of the content-addressed store.
#[derive(Clone, Debug, PartialEq)]
pub struct Checkpoint {
    /// The peer's state at shutdown.
    pub state: Ref<State>,
    /// The peer's signed belief at shutdown.
    pub signed_belief: Ref<SignedBelief>,
}

impl Checkpoint {
    fn to_value(&self) -> Value {
        map_from_pairs(vec![
            (vref(kw("state")), ref_to_value_ref(&self.state)),
            (vref(kw("signed_belief")), ref_to_value_ref(&self.signed_belief)),
        ])
    }

    fn from_value(v: Value) -> Result<Self, ModelError> {
        let pairs = as_map(v)?;
        let state = value_ref_to_ref(&field_ref(&pairs, "state")?)?;
        let signed_belief = value_ref_to_ref(&field_ref(&pairs, "signed_belief")?)?;
        Ok(Checkpoint { state, signed_belief })
    }
}
cell_via_value!(Checkpoint);
