// Copyright (c) 2026 Concordia
// Licensed under the Apache License, Version 2.0

//! Client interest tracking: which connection (and which of its in-flight
//! message ids) is waiting on a transaction's `RESULT`. Entries are removed
//! once delivered, once their connection closes, or once a bounded number
//! of newer interests have pushed them past the tracked horizon.

#![forbid(unsafe_code)]

use crate::core::types::H256;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Where to deliver a transaction's eventual `RESULT`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Interest {
    /// Connection to deliver the result on.
    pub connection_id: u64,
    /// Frame `message_id` the client submitted the transaction under;
    /// echoed back on the `RESULT` frame.
    pub message_id: u64,
}

/// Transaction-hash-keyed interest table with bounded retention.
pub struct Interests {
    inner: Mutex<Inner>,
    capacity: usize,
}

struct Inner {
    by_hash: HashMap<H256, Interest>,
    order: VecDeque<H256>,
}

impl Interests {
    /// A table retaining at most `capacity` outstanding interests, culling
    /// the oldest registration once exceeded.
    pub fn new(capacity: usize) -> Self {
        Interests {
            inner: Mutex::new(Inner { by_hash: HashMap::new(), order: VecDeque::new() }),
            capacity,
        }
    }

    /// Register interest in `tx_hash`'s eventual result.
    pub fn register(&self, tx_hash: H256, interest: Interest) {
        let mut inner = self.inner.lock().expect("interests mutex poisoned");
        if inner.by_hash.insert(tx_hash, interest).is_none() {
            inner.order.push_back(tx_hash);
        }
        while inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.by_hash.remove(&oldest);
            }
        }
    }

    /// Take and remove the interest for `tx_hash`, if any (delivery).
    pub fn take(&self, tx_hash: &H256) -> Option<Interest> {
        let mut inner = self.inner.lock().expect("interests mutex poisoned");
        let found = inner.by_hash.remove(tx_hash);
        if found.is_some() {
            if let Some(pos) = inner.order.iter().position(|h| h == tx_hash) {
                inner.order.remove(pos);
            }
        }
        found
    }

    /// Discard every interest registered against a now-closed connection.
    pub fn discard_connection(&self, connection_id: u64) {
        let mut inner = self.inner.lock().expect("interests mutex poisoned");
        let dead: Vec<H256> = inner
            .by_hash
            .iter()
            .filter(|(_, i)| i.connection_id == connection_id)
            .map(|(h, _)| *h)
            .collect();
        for h in dead {
            inner.by_hash.remove(&h);
            if let Some(pos) = inner.order.iter().position(|x| x == &h) {
                inner.order.remove(pos);
            }
        }
    }

    /// Count of interests currently outstanding.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("interests mutex poisoned").by_hash.len()
    }

    /// True iff no interests are outstanding.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(b: u8) -> H256 {
        H256::from_bytes([b; 32])
    }

    #[test]
    fn register_then_take_roundtrips() {
        let interests = Interests::new(10);
        interests.register(h(1), Interest { connection_id: 5, message_id: 9 });
        assert_eq!(interests.len(), 1);
        let got = interests.take(&h(1)).unwrap();
        assert_eq!(got, Interest { connection_id: 5, message_id: 9 });
        assert!(interests.is_empty());
    }

    #[test]
    fn take_is_idempotent_absent_entry() {
        let interests = Interests::new(10);
        assert!(interests.take(&h(1)).is_none());
    }

    #[test]
    fn discard_connection_removes_only_its_entries() {
        let interests = Interests::new(10);
        interests.register(h(1), Interest { connection_id: 1, message_id: 1 });
        interests.register(h(2), Interest { connection_id: 2, message_id: 1 });
        interests.discard_connection(1);
        assert!(interests.take(&h(1)).is_none());
        assert!(interests.take(&h(2)).is_some());
    }

    #[test]
    fn bounded_horizon_culls_oldest() {
        let interests = Interests::new(2);
        interests.register(h(1), Interest { connection_id: 1, message_id: 1 });
        interests.register(h(2), Interest { connection_id: 1, message_id: 2 });
        interests.register(h(3), Interest { connection_id: 1, message_id: 3 });
        assert_eq!(interests.len(), 2);
        assert!(interests.take(&h(1)).is_none());
        assert!(interests.take(&h(2)).is_some());
        assert!(interests.take(&h(3)).is_some());
    }
}
