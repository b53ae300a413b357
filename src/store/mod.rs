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

//! Content-addressed store: insert-by-hash, lookup-by-hash, shallow vs deep
//! persistence, root-hash anchoring for restart.
//!
//! Grounded on the teacher's `sled`-backed `PersistentState` wrapper and its
//! transactional commit pattern; generalized from a flat KV table to a
//! hash-addressed cell repository.

use crate::core::types::H256;
use sled::transaction::ConflictableTransactionError;
use std::cell::RefCell;
use std::sync::Arc;
use thiserror::Error;

/// A referenced cell is not locally available; recoverable via the pull
/// protocol (the server requests it over the wire by hash).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MissingData(pub H256);

impl std::fmt::Display for MissingData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "missing data: {}", self.0)
    }
}
impl std::error::Error for MissingData {}

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to open the backing database.
    #[error("db open")]
    DbOpen,
    /// Backing database I/O failure.
    #[error("db io")]
    DbIo,
    /// Root key was never set.
    #[error("no root set")]
    NoRoot,
}

/// Persistence mode for `Store::store`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Write only the top cell; child refs are left as-is (possibly
    /// `Unresolved`).
    Shallow,
    /// Recursively store every non-embedded descendant. Idempotent: a cell
    /// already present by hash is not rewritten.
    Deep,
}

/// The content-addressed repository boundary. Operates on raw encoded bytes
/// keyed by hash, type-erased with respect to the specific `Cell` impl being
/// stored, so that `core::cell` and `store` do not depend on each other's
/// concrete cell types.
pub trait Store: Send + Sync {
    /// Insert `bytes` (the canonical encoding of some cell) under `hash` if
    /// absent. Returns `true` if this call newly inserted the entry.
    fn put_bytes(&self, hash: H256, bytes: &[u8]) -> Result<bool, StoreError>;

    /// Look up the canonical encoding for `hash`, if present.
    fn lookup_bytes(&self, hash: &H256) -> Option<Vec<u8>>;

    /// Set the single restart anchor.
    fn set_root(&self, hash: H256) -> Result<(), StoreError>;

    /// Get the restart anchor, if one has been set.
    fn get_root(&self) -> Result<Option<H256>, StoreError>;

    /// Flush outstanding writes. Called by the shutdown hook before process
    /// exit.
    fn close(&self) -> Result<(), StoreError>;
}

const ROOT_KEY: &[u8] = b"__root__";

/// `sled`-backed `Store` implementation.
#[derive(Clone)]
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    /// Open (or create) a store rooted at `path`.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(|_| StoreError::DbOpen)?;
        Ok(Self { db })
    }
}

impl Store for SledStore {
    fn put_bytes(&self, hash: H256, bytes: &[u8]) -> Result<bool, StoreError> {
        let key = hash.as_bytes();
        let res: Result<bool, ConflictableTransactionError<StoreError>> = self
            .db
            .transaction(|t| {
                if t.get(key.as_slice())?.is_some() {
                    return Ok(false);
                }
                t.insert(key.as_slice(), bytes)?;
                Ok(true)
            })
            .map_err(|e| match e {
                sled::transaction::TransactionError::Abort(se) => {
                    ConflictableTransactionError::Abort(se)
                }
                sled::transaction::TransactionError::Storage(_) => {
                    ConflictableTransactionError::Abort(StoreError::DbIo)
                }
            });

        match res {
            Ok(inserted) => Ok(inserted),
            Err(ConflictableTransactionError::Abort(e)) => Err(e),
            Err(_) => Err(StoreError::DbIo),
        }
    }

    fn lookup_bytes(&self, hash: &H256) -> Option<Vec<u8>> {
        self.db.get(hash.as_bytes()).ok().flatten().map(|v| v.to_vec())
    }

    fn set_root(&self, hash: H256) -> Result<(), StoreError> {
        self.db
            .insert(ROOT_KEY, hash.as_bytes().as_slice())
            .map_err(|_| StoreError::DbIo)?;
        Ok(())
    }

    fn get_root(&self) -> Result<Option<H256>, StoreError> {
        let v = self.db.get(ROOT_KEY).map_err(|_| StoreError::DbIo)?;
        match v {
            None => Ok(None),
            Some(iv) => {
                if iv.len() != 32 {
                    return Err(StoreError::DbIo);
                }
                let mut out = [0u8; 32];
                out.copy_from_slice(&iv);
                Ok(Some(H256::from_bytes(out)))
            }
        }
    }

    fn close(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(|_| StoreError::DbIo)?;
        Ok(())
    }
}

/// Explicit carrier for the store a persist/resolve operation should target.
///
/// The original design binds the "current store" to a per-thread slot so
/// that deeply nested persist operations reach the right backend without an
/// explicit parameter; here it is re-architected as an explicit `Context`
/// threaded through every call that may persist or resolve. The thread-local
/// (below) remains only as a fallback default for call sites that have not
/// been converted to thread a `Context` through yet.
#[derive(Clone)]
pub struct Context {
    /// The store this context resolves/persists against.
    pub store: Arc<dyn Store>,
}

impl Context {
    /// Build a context around a store handle.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

thread_local! {
    static CURRENT_STORE: RefCell<Option<Arc<dyn Store>>> = const { RefCell::new(None) };
}

/// Set the ambient store for the current thread. Every worker sets this at
/// entry so that callbacks invoked on its behalf can fall back to it when no
/// explicit `Context` is available.
pub fn set_current_store(store: Arc<dyn Store>) {
    CURRENT_STORE.with(|c| *c.borrow_mut() = Some(store));
}

/// Build a `Context` from the current thread's ambient store, if one was
/// set via `set_current_store`.
pub fn current_context() -> Option<Context> {
    CURRENT_STORE.with(|c| c.borrow().clone().map(Context::new))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deep_store_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let st = SledStore::open(dir.path().to_str().unwrap()).unwrap();
        let h = H256::from_bytes([7u8; 32]);
        assert!(st.put_bytes(h, b"hello").unwrap());
        assert!(!st.put_bytes(h, b"hello").unwrap());
        assert_eq!(st.lookup_bytes(&h), Some(b"hello".to_vec()));
    }

    #[test]
    fn root_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let st = SledStore::open(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(st.get_root().unwrap(), None);
        let h = H256::from_bytes([9u8; 32]);
        st.set_root(h).unwrap();
        assert_eq!(st.get_root().unwrap(), Some(h));
    }
}
