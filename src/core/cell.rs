// Copyright (c) 2026 Concordia
// Licensed under the Apache License, Version 2.0

//! Content-addressed cells: canonical binary encoding, identity hash, and
//! lazy child references.
//!
//! Every value exchanged or persisted by the peer is a `Value` cell. A cell's
//! canonical octet encoding is the only representation used for identity and
//! transport: encoding is a pure function of logical value, so equal values
//! encode identically and therefore hash identically. Decoding is strict —
//! any deviation from canonical form (non-minimal VLC, trailing bytes,
//! out-of-range tags) fails with `BadFormat`.

use crate::core::types::{PeerKey, Signature, H256};
use crate::core::vector::PersistentVector;
use crate::core::vlc;
use crate::store::{Context, MissingData, Mode, StoreError};
use ring::digest;
use std::sync::{Arc, OnceLock};
use thiserror::Error;

/// Below this encoded length a child is inlined into its parent's encoding
/// (`Ref::Embedded`) rather than becoming a standalone, independently
/// addressed cell.
pub const EMBEDDED_MAX_ENCODING_LEN: usize = 4096;

/// Decode/encode error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CellError {
    /// Malformed encoding: bad tag, truncated buffer, or non-canonical VLC.
    #[error("bad format")]
    BadFormat,
    /// Structurally parseable but violates a type invariant (e.g. leaf with
    /// more than 16 head elements, NaN double with a nonzero payload beyond
    /// the canonical quiet-NaN bit pattern).
    #[error("invalid data")]
    InvalidData,
}

/// Type tags: the first byte of every cell's canonical encoding.
pub mod tag {
    pub const NIL: u8 = 0x00;
    pub const BOOL_FALSE: u8 = 0x01;
    pub const BOOL_TRUE: u8 = 0x02;
    pub const LONG: u8 = 0x03;
    pub const DOUBLE: u8 = 0x04;
    pub const BLOB: u8 = 0x05;
    pub const STRING: u8 = 0x06;
    pub const SYMBOL: u8 = 0x07;
    pub const KEYWORD: u8 = 0x08;
    pub const ADDRESS: u8 = 0x09;
    pub const VECTOR_LEAF: u8 = 0x0a;
    pub const VECTOR_TREE: u8 = 0x0b;
    pub const MAP: u8 = 0x0c;
    pub const SET: u8 = 0x0d;
    pub const SIGNED_DATA: u8 = 0x0e;
    /// Wire tag for a standalone ref: this byte followed by a 32-byte hash.
    pub const REF: u8 = 0x0f;
}

/// A cursor over an input buffer used while decoding a cell.
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    /// Wrap a buffer for decoding, starting at offset 0.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes remaining.
    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    /// True iff no bytes remain.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// Read exactly `n` bytes, advancing the cursor.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], CellError> {
        if self.pos + n > self.buf.len() {
            return Err(CellError::BadFormat);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Read a single byte.
    pub fn take_u8(&mut self) -> Result<u8, CellError> {
        Ok(self.take(1)?[0])
    }

    /// Read a canonical VLC-encoded u64.
    pub fn take_vlc(&mut self) -> Result<u64, CellError> {
        let (v, n) = vlc::read_u64(self.remaining()).map_err(|_| CellError::BadFormat)?;
        self.pos += n;
        Ok(v)
    }
}

/// Any value in the content-addressed data model.
///
/// `write`/`read`/`hash` are the three operations every cell type defines in
/// spec terms; here they are implemented once over the closed `Value` enum
/// rather than per-type via a trait object, since the enum already enumerates
/// every cell shape the peer core needs.
pub trait Cell: Sized + Clone {
    /// Append this cell's canonical encoding to `out`.
    fn write(&self, out: &mut Vec<u8>);

    /// Parse a cell whose first byte was already consumed as `tag`.
    fn read(tag: u8, cur: &mut Cursor<'_>) -> Result<Self, CellError>;

    /// Full canonical encoding (tag byte included).
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write(&mut out);
        out
    }

    /// Decode a cell from its full canonical encoding. Rejects trailing
    /// bytes: decoding must consume the entire buffer.
    fn decode(buf: &[u8]) -> Result<Self, CellError> {
        let mut cur = Cursor::new(buf);
        let tag = cur.take_u8()?;
        let v = Self::read(tag, &mut cur)?;
        if !cur.is_empty() {
            return Err(CellError::BadFormat);
        }
        Ok(v)
    }

    /// Identity hash: `digest(encoding)`. Two cells with equal hashes are
    /// treated as equal without structural comparison.
    fn hash(&self) -> H256 {
        let bytes = self.encode();
        let d = digest::digest(&digest::SHA256, &bytes);
        let mut out = [0u8; 32];
        out.copy_from_slice(d.as_ref());
        H256::from_bytes(out)
    }
}

/// A handle to a cell, possibly lazy. `resolve` forces the value through a
/// `Context`'s store; an `Unresolved` ref whose hash is absent from the store
/// raises `MissingData`.
#[derive(Clone, Debug)]
pub enum Ref<T> {
    /// Value is small enough to inline in the parent's encoding; never a
    /// standalone store entry.
    Embedded(Box<T>),
    /// Value held in memory, with its hash computed lazily and cached.
    Resolved(Box<T>, Arc<OnceLock<H256>>),
    /// Hash known; value lives in the store; its own children may be
    /// unresolved.
    StoredShallow(H256),
    /// Hash only; value not held in memory.
    Unresolved(H256),
}

impl<T: Cell> Ref<T> {
    /// Wrap an in-memory value as embedded (caller has already decided it is
    /// below `EMBEDDED_MAX_ENCODING_LEN`) or resolved, per its encoded size.
    pub fn from_value(v: T) -> Self {
        let len = v.encode().len();
        if len <= EMBEDDED_MAX_ENCODING_LEN {
            Ref::Embedded(Box::new(v))
        } else {
            Ref::Resolved(Box::new(v), Arc::new(OnceLock::new()))
        }
    }

    /// Hash-only reference (value not held).
    pub fn from_hash(hash: H256) -> Self {
        Ref::Unresolved(hash)
    }

    /// Identity hash of the referenced value, computing and caching it for
    /// `Resolved` refs.
    pub fn hash(&self) -> H256 {
        match self {
            Ref::Embedded(v) => v.hash(),
            Ref::Resolved(v, cache) => *cache.get_or_init(|| v.hash()),
            Ref::StoredShallow(h) | Ref::Unresolved(h) => *h,
        }
    }

    /// True iff the value is already available without a store lookup.
    pub fn is_in_memory(&self) -> bool {
        matches!(self, Ref::Embedded(_) | Ref::Resolved(_, _))
    }

    /// Force resolution of the referenced value through `ctx`'s store.
    pub fn resolve(&self, ctx: &Context) -> Result<T, MissingData> {
        match self {
            Ref::Embedded(v) | Ref::Resolved(v, _) => Ok((**v).clone()),
            Ref::StoredShallow(h) | Ref::Unresolved(h) => {
                let bytes = ctx.store.lookup_bytes(h).ok_or(MissingData(*h))?;
                T::decode(&bytes).map_err(|_| MissingData(*h))
            }
        }
    }

    /// Write this ref's wire form: `Embedded`/`Resolved` inline the full
    /// value; `StoredShallow`/`Unresolved` write only the ref tag and hash.
    pub fn write_ref(&self, out: &mut Vec<u8>) {
        match self {
            Ref::Embedded(v) | Ref::Resolved(v, _) => v.write(out),
            Ref::StoredShallow(h) | Ref::Unresolved(h) => {
                out.push(tag::REF);
                out.extend_from_slice(h.as_bytes());
            }
        }
    }

    /// Read a ref: a standalone `REF` tag yields `Unresolved`; any other tag
    /// is parsed as an inlined (embedded) value.
    pub fn read_ref(tag_byte: u8, cur: &mut Cursor<'_>) -> Result<Self, CellError> {
        if tag_byte == tag::REF {
            let bytes = cur.take(32)?;
            let mut h = [0u8; 32];
            h.copy_from_slice(bytes);
            Ok(Ref::Unresolved(H256::from_bytes(h)))
        } else {
            let v = T::read(tag_byte, cur)?;
            Ok(Ref::from_value(v))
        }
    }
}

impl<T: Cell> PartialEq for Ref<T> {
    fn eq(&self, other: &Self) -> bool {
        self.hash() == other.hash()
    }
}
impl<T: Cell> Eq for Ref<T> {}
impl<T: Cell> PartialOrd for Ref<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<T: Cell> Ord for Ref<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.hash().cmp(&other.hash())
    }
}

fn write_len_prefixed(out: &mut Vec<u8>, bytes: &[u8]) {
    vlc::write_u64(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

fn read_len_prefixed<'a>(cur: &mut Cursor<'a>) -> Result<&'a [u8], CellError> {
    let len = cur.take_vlc()? as usize;
    cur.take(len)
}

/// Dynamic cell value: the union of every concrete cell shape the peer core
/// exchanges or persists.
#[derive(Clone, Debug)]
pub enum Value {
    /// The empty value.
    Nil,
    /// Boolean.
    Bool(bool),
    /// VLC zig-zag encoded signed integer.
    Long(i64),
    /// IEEE-754 double, written as 8 big-endian bytes.
    Double(f64),
    /// Opaque byte string.
    Blob(Vec<u8>),
    /// UTF-8 text.
    StringCell(String),
    /// Unqualified symbolic name.
    Symbol(String),
    /// Keyword (`:name`-style) symbolic name.
    Keyword(String),
    /// Account/peer address (32-byte public key identity).
    Address(PeerKey),
    /// Chunked persistent vector of element refs.
    Vector(PersistentVector<Value>),
    /// Sorted associative map, ordered by key hash for canonical encoding.
    Map(Vec<(Ref<Value>, Ref<Value>)>),
    /// Sorted set, ordered by element hash.
    Set(Vec<Ref<Value>>),
    /// Signature-wrapped cell (backs signed orders/beliefs/transactions).
    SignedData(Box<Ref<Value>>, Signature),
}

fn zigzag_encode(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}
fn zigzag_decode(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

impl Cell for Value {
    fn write(&self, out: &mut Vec<u8>) {
        match self {
            Value::Nil => out.push(tag::NIL),
            Value::Bool(false) => out.push(tag::BOOL_FALSE),
            Value::Bool(true) => out.push(tag::BOOL_TRUE),
            Value::Long(v) => {
                out.push(tag::LONG);
                vlc::write_u64(out, zigzag_encode(*v));
            }
            Value::Double(v) => {
                out.push(tag::DOUBLE);
                out.extend_from_slice(&v.to_bits().to_be_bytes());
            }
            Value::Blob(b) => {
                out.push(tag::BLOB);
                write_len_prefixed(out, b);
            }
            Value::StringCell(s) => {
                out.push(tag::STRING);
                write_len_prefixed(out, s.as_bytes());
            }
            Value::Symbol(s) => {
                out.push(tag::SYMBOL);
                write_len_prefixed(out, s.as_bytes());
            }
            Value::Keyword(s) => {
                out.push(tag::KEYWORD);
                write_len_prefixed(out, s.as_bytes());
            }
            Value::Address(a) => {
                out.push(tag::ADDRESS);
                write_len_prefixed(out, &a.0);
            }
            Value::Vector(v) => v.write(out),
            Value::Map(pairs) => {
                out.push(tag::MAP);
                vlc::write_u64(out, pairs.len() as u64);
                for (k, v) in pairs {
                    k.write_ref(out);
                    v.write_ref(out);
                }
            }
            Value::Set(items) => {
                out.push(tag::SET);
                vlc::write_u64(out, items.len() as u64);
                for it in items {
                    it.write_ref(out);
                }
            }
            Value::SignedData(inner, sig) => {
                out.push(tag::SIGNED_DATA);
                inner.write_ref(out);
                write_len_prefixed(out, &sig.0);
            }
        }
    }

    fn read(tag_byte: u8, cur: &mut Cursor<'_>) -> Result<Self, CellError> {
        match tag_byte {
            tag::NIL => Ok(Value::Nil),
            tag::BOOL_FALSE => Ok(Value::Bool(false)),
            tag::BOOL_TRUE => Ok(Value::Bool(true)),
            tag::LONG => {
                let z = cur.take_vlc()?;
                Ok(Value::Long(zigzag_decode(z)))
            }
            tag::DOUBLE => {
                let bytes = cur.take(8)?;
                let mut arr = [0u8; 8];
                arr.copy_from_slice(bytes);
                Ok(Value::Double(f64::from_bits(u64::from_be_bytes(arr))))
            }
            tag::BLOB => Ok(Value::Blob(read_len_prefixed(cur)?.to_vec())),
            tag::STRING => {
                let bytes = read_len_prefixed(cur)?;
                let s = std::str::from_utf8(bytes).map_err(|_| CellError::BadFormat)?;
                Ok(Value::StringCell(s.to_string()))
            }
            tag::SYMBOL => {
                let bytes = read_len_prefixed(cur)?;
                let s = std::str::from_utf8(bytes).map_err(|_| CellError::BadFormat)?;
                Ok(Value::Symbol(s.to_string()))
            }
            tag::KEYWORD => {
                let bytes = read_len_prefixed(cur)?;
                let s = std::str::from_utf8(bytes).map_err(|_| CellError::BadFormat)?;
                Ok(Value::Keyword(s.to_string()))
            }
            tag::ADDRESS => {
                let bytes = read_len_prefixed(cur)?;
                Ok(Value::Address(PeerKey(bytes.to_vec())))
            }
            tag::VECTOR_LEAF | tag::VECTOR_TREE => {
                Ok(Value::Vector(PersistentVector::read(tag_byte, cur)?))
            }
            tag::MAP => {
                let n = cur.take_vlc()? as usize;
                let mut pairs = Vec::with_capacity(n.min(1 << 20));
                for _ in 0..n {
                    let kt = cur.take_u8()?;
                    let k = Ref::read_ref(kt, cur)?;
                    let vt = cur.take_u8()?;
                    let v = Ref::read_ref(vt, cur)?;
                    pairs.push((k, v));
                }
                if !pairs.windows(2).all(|w| w[0].0.hash() < w[1].0.hash()) {
                    return Err(CellError::InvalidData);
                }
                Ok(Value::Map(pairs))
            }
            tag::SET => {
                let n = cur.take_vlc()? as usize;
                let mut items = Vec::with_capacity(n.min(1 << 20));
                for _ in 0..n {
                    let it = cur.take_u8()?;
                    items.push(Ref::read_ref(it, cur)?);
                }
                if !items.windows(2).all(|w| w[0].hash() < w[1].hash()) {
                    return Err(CellError::InvalidData);
                }
                Ok(Value::Set(items))
            }
            tag::SIGNED_DATA => {
                let it = cur.take_u8()?;
                let inner = Ref::read_ref(it, cur)?;
                let sig = read_len_prefixed(cur)?.to_vec();
                Ok(Value::SignedData(Box::new(inner), Signature(sig)))
            }
            _ => Err(CellError::BadFormat),
        }
    }
}

/// Build a sorted `Map` cell from unsorted pairs, matching the canonical
/// "sorted assoc cell" ordering by key hash.
pub fn map_from_pairs(mut pairs: Vec<(Ref<Value>, Ref<Value>)>) -> Value {
    pairs.sort_by_key(|(k, _)| k.hash());
    pairs.dedup_by_key(|(k, _)| k.hash());
    Value::Map(pairs)
}

/// Build a sorted `Set` cell from unsorted elements.
pub fn set_from_items(mut items: Vec<Ref<Value>>) -> Value {
    items.sort_by_key(|v| v.hash());
    items.dedup_by_key(|v| v.hash());
    Value::Set(items)
}

/// Store `value` under its own hash and, in `Mode::Deep`, recursively store
/// every non-embedded descendant reachable through its `Map`/`Set`/
/// `SignedData`/`Vector` children. Returns an in-memory `Ref` to `value`
/// (embedded or resolved, per its encoded size) regardless of mode.
///
/// Deep storage is idempotent: descending stops the moment a child hash is
/// already present, since that child's own descendants were necessarily
/// stored the first time it was inserted.
pub fn store_cell<T: Cell>(ctx: &Context, value: T, mode: Mode) -> Result<Ref<T>, StoreError> {
    let bytes = value.encode();
    let inserted = ctx.store.put_bytes(value.hash(), &bytes)?;
    if mode == Mode::Deep && inserted {
        deep_store_children(ctx, &value)?;
    }
    Ok(Ref::from_value(value))
}

/// Recursively store every non-embedded descendant of an already-persisted
/// ref, skipping subtrees whose root hash is already present in the store.
fn deep_store_ref<T: Cell>(ctx: &Context, r: &Ref<T>) -> Result<(), StoreError> {
    match r {
        Ref::Embedded(v) => deep_store_children(ctx, v),
        Ref::Resolved(v, _) => {
            let inserted = ctx.store.put_bytes(r.hash(), &v.encode())?;
            if inserted {
                deep_store_children(ctx, v)?;
            }
            Ok(())
        }
        Ref::StoredShallow(_) | Ref::Unresolved(_) => Ok(()),
    }
}

/// Reinterpret `value`'s own canonical encoding as a `Value` (valid, since
/// every `Cell` in this crate delegates its wire form to `Value`'s tag
/// space) and walk its container children.
fn deep_store_children<T: Cell>(ctx: &Context, value: &T) -> Result<(), StoreError> {
    let bytes = value.encode();
    let as_value = Value::decode(&bytes).expect("every cell's encoding is a valid Value");
    match as_value {
        Value::Map(pairs) => {
            for (k, v) in &pairs {
                deep_store_ref(ctx, k)?;
                deep_store_ref(ctx, v)?;
            }
            Ok(())
        }
        Value::Set(items) => {
            for it in &items {
                deep_store_ref(ctx, it)?;
            }
            Ok(())
        }
        Value::SignedData(inner, _) => deep_store_ref(ctx, &inner),
        Value::Vector(pv) => deep_store_vector_children(ctx, &pv),
        Value::Nil
        | Value::Bool(_)
        | Value::Long(_)
        | Value::Double(_)
        | Value::Blob(_)
        | Value::StringCell(_)
        | Value::Symbol(_)
        | Value::Keyword(_)
        | Value::Address(_) => Ok(()),
    }
}

/// A `Value::Vector`'s own children mix two `Ref` instantiations: `head`
/// elements are `Ref<Value>`, while `prefix`/`children` point at further
/// `PersistentVector<Value>` chunks, so each needs its own recursive walk.
fn deep_store_vector_children(ctx: &Context, pv: &PersistentVector<Value>) -> Result<(), StoreError> {
    match pv {
        PersistentVector::Leaf { head, prefix, .. } => {
            for el in head {
                deep_store_ref(ctx, el)?;
            }
            if let Some(p) = prefix {
                deep_store_ref(ctx, p.as_ref())?;
            }
            Ok(())
        }
        PersistentVector::Tree { children, .. } => {
            for c in children {
                deep_store_ref(ctx, c)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn nil_roundtrip() {
        let v = Value::Nil;
        let enc = v.encode();
        let back = Value::decode(&enc).unwrap();
        assert_eq!(back.hash(), v.hash());
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut enc = Value::Bool(true).encode();
        enc.push(0xff);
        assert_eq!(Value::decode(&enc), Err(CellError::BadFormat));
    }

    proptest! {
        #[test]
        fn long_roundtrip(n in any::<i64>()) {
            let v = Value::Long(n);
            let enc = v.encode();
            let back = Value::decode(&enc).unwrap();
            prop_assert_eq!(back.hash(), v.hash());
            if let Value::Long(got) = back { prop_assert_eq!(got, n); } else { panic!("wrong variant"); }
        }

        #[test]
        fn blob_roundtrip(b in prop::collection::vec(any::<u8>(), 0..256)) {
            let v = Value::Blob(b.clone());
            let enc = v.encode();
            let back = Value::decode(&enc).unwrap();
            prop_assert_eq!(back.hash(), v.hash());
            if let Value::Blob(got) = back { prop_assert_eq!(got, b); } else { panic!("wrong variant"); }
        }
    }

    fn test_ctx() -> (tempfile::TempDir, Context) {
        let dir = tempfile::tempdir().unwrap();
        let store = crate::store::SledStore::open(dir.path().to_str().unwrap()).unwrap();
        let ctx = Context::new(std::sync::Arc::new(store));
        (dir, ctx)
    }

    #[test]
    fn deep_store_persists_resolved_map_children() {
        let (_dir, ctx) = test_ctx();
        let big_blob = Value::Blob(vec![7u8; EMBEDDED_MAX_ENCODING_LEN + 32]);
        let child_ref = Ref::from_value(big_blob.clone());
        assert!(matches!(child_ref, Ref::Resolved(_, _)));
        let map = map_from_pairs(vec![(Ref::from_value(Value::Keyword("k".into())), child_ref.clone())]);

        let stored = store_cell(&ctx, map, Mode::Deep).unwrap();
        assert!(ctx.store.lookup_bytes(&child_ref.hash()).is_some());
        assert!(ctx.store.lookup_bytes(&stored.hash()).is_some());
    }

    #[test]
    fn shallow_store_leaves_children_unpersisted() {
        let (_dir, ctx) = test_ctx();
        let big_blob = Value::Blob(vec![9u8; EMBEDDED_MAX_ENCODING_LEN + 32]);
        let child_ref = Ref::from_value(big_blob);
        let map = map_from_pairs(vec![(Ref::from_value(Value::Keyword("k".into())), child_ref.clone())]);

        let stored = store_cell(&ctx, map, Mode::Shallow).unwrap();
        assert!(ctx.store.lookup_bytes(&stored.hash()).is_some());
        assert!(ctx.store.lookup_bytes(&child_ref.hash()).is_none());
    }

    #[test]
    fn deep_store_is_idempotent() {
        let (_dir, ctx) = test_ctx();
        let big_blob = Value::Blob(vec![3u8; EMBEDDED_MAX_ENCODING_LEN + 32]);
        let child_ref = Ref::from_value(big_blob);
        let map = map_from_pairs(vec![(Ref::from_value(Value::Keyword("k".into())), child_ref.clone())]);

        let first = store_cell(&ctx, map.clone(), Mode::Deep).unwrap();
        let second = store_cell(&ctx, map, Mode::Deep).unwrap();
        assert_eq!(first.hash(), second.hash());
        assert!(ctx.store.lookup_bytes(&child_ref.hash()).is_some());
    }
}
