// Copyright (c) 2026 Concordia
// Licensed under the Apache License, Version 2.0

//! The updater and connector background loops. Per-connection frame reads
//! (the "receiver" side) live in the transport layer, which calls
//! [`crate::server::dispatch::handle_frame`] directly as frames arrive and
//! shares the same [`Shared`] this loop does.
//!
//! The updater proposes a block from whatever transactions have queued up,
//! merges in freshly received remote beliefs, advances local consensus, and
//! delivers results to waiting clients. The connector reconciles live
//! connections against the peer set the local state knows about.

#![forbid(unsafe_code)]

use crate::core::cell::{store_cell, Cell};
use crate::core::consensus::merge::{merge, MergeError, NoopSlashing};
use crate::core::state::model::{Belief, Block, SignedBelief, SignedOrder};
use crate::core::types::PeerKey;
use crate::server::dispatch::{Outgoing, Shared};
use crate::server::message::{Frame, Message};
use crate::store::{Mode, StoreError};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Errors from one updater tick.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// The store could not be read or written.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Belief merge failed.
    #[error(transparent)]
    Merge(#[from] MergeError),
    /// Re-signing the advanced order or merged belief failed.
    #[error("signing failed")]
    Sign,
}

/// Every connection the transport layer currently holds open, as the worker
/// loop needs them: enumerate them (to reconcile against known peers) and
/// look one up by id (to deliver a client's transaction result).
pub trait ConnectionRegistry: Send + Sync {
    /// Every currently open connection.
    fn all(&self) -> Vec<Arc<dyn Outgoing>>;
    /// A specific connection, by id, if still open.
    fn get(&self, connection_id: u64) -> Option<Arc<dyn Outgoing>>;
    /// Ensure an outbound connection toward `peer` at `url` exists, dialing
    /// if not. A no-op if already connected or already dialing.
    fn ensure_connected(&self, peer: &PeerKey, url: &str);
}

/// Interval between updater ticks (propose + merge).
pub const UPDATE_INTERVAL: Duration = Duration::from_millis(200);

/// Interval between connector reconciliation passes.
pub const CONNECTOR_INTERVAL: Duration = Duration::from_secs(5);

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// Drive the updater and connector loops until `cancel` fires.
pub async fn run(shared: Arc<Shared>, connections: Arc<dyn ConnectionRegistry>, cancel: CancellationToken) {
    let updater = tokio::spawn(updater_loop(shared.clone(), connections.clone(), cancel.clone()));
    let connector = tokio::spawn(connector_loop(shared, connections, cancel));
    let _ = tokio::join!(updater, connector);
}

async fn updater_loop(shared: Arc<Shared>, connections: Arc<dyn ConnectionRegistry>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(UPDATE_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                if let Err(e) = tick(&shared, connections.as_ref()) {
                    warn!(error = %e, "updater tick failed");
                }
            }
        }
    }
}

async fn connector_loop(shared: Arc<Shared>, connections: Arc<dyn ConnectionRegistry>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(CONNECTOR_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => reconcile_connections(&shared, connections.as_ref()),
        }
    }
}

/// One updater tick: propose a block if transactions are queued, then run a
/// belief-merge pass. Never proposes a heartbeat block on an empty queue.
fn tick(shared: &Shared, connections: &dyn ConnectionRegistry) -> Result<(), RunError> {
    propose_block(shared)?;
    run_merge(shared, connections)
}

fn propose_block(shared: &Shared) -> Result<(), RunError> {
    let pending = {
        let mut queued = shared.new_transactions.lock().expect("new_transactions mutex poisoned");
        std::mem::take(&mut *queued)
    };
    if pending.is_empty() {
        return Ok(());
    }
    let count = pending.len() as u64;

    let mut peer = shared.peer.lock().expect("peer mutex poisoned");
    let local_key = peer.address();
    let block = Block::new(now_ms(), local_key.clone(), pending);
    store_cell(&shared.ctx, block.clone(), Mode::Deep)?;

    let current_order = peer
        .belief
        .orders
        .get(&local_key)
        .map(|so| so.order.resolve(&shared.ctx))
        .transpose()
        .map_err(MergeError::from)?
        .unwrap_or_else(crate::core::state::model::Order::empty);
    let proposed = current_order.propose(block);
    let signed_order =
        SignedOrder::sign(proposed, &local_key, now_ms(), &peer.keystore).map_err(|_| RunError::Sign)?;

    peer.belief.orders.insert(local_key, signed_order);
    let new_belief = peer.belief.clone();
    peer.signed_belief = SignedBelief::sign(new_belief, now_ms(), &peer.keystore).map_err(|_| RunError::Sign)?;

    shared.metrics.transactions_total.inc_by(count);
    shared.metrics.proposal_point.set(peer.belief.orders.get(&peer.address()).map(|so| so.timestamp_ms as i64).unwrap_or(0));
    Ok(())
}

/// Drain freshly admitted remote beliefs and fold them into the local
/// belief/state via [`merge`], delivering any newly settled transaction
/// results to their waiting client connections.
fn run_merge(shared: &Shared, connections: &dyn ConnectionRegistry) -> Result<(), RunError> {
    let remote: Vec<(PeerKey, SignedBelief)> = {
        let mut pending = shared.new_beliefs.lock().expect("new_beliefs mutex poisoned");
        pending.drain().collect()
    };

    let mut peer = shared.peer.lock().expect("peer mutex poisoned");
    let local_key = peer.address();
    let outcome =
        merge(&local_key, &peer.belief, &peer.state, &remote, shared.executor.as_ref(), &NoopSlashing, &shared.ctx)?;

    let mut orders = outcome.orders;
    let local_signed_order = SignedOrder::sign(outcome.local_order.clone(), &local_key, now_ms(), &peer.keystore)
        .map_err(|_| RunError::Sign)?;
    orders.insert(local_key.clone(), local_signed_order);

    let merged_belief = Belief { orders };
    peer.signed_belief =
        SignedBelief::sign(merged_belief.clone(), now_ms(), &peer.keystore).map_err(|_| RunError::Sign)?;
    peer.belief = merged_belief;
    peer.state = outcome.state;

    shared.metrics.merges_total.inc();
    shared.metrics.consensus_point.set(outcome.local_order.consensus_point as i64);
    shared.metrics.proposal_point.set(outcome.local_order.proposal_point as i64);
    shared.metrics.state_timestamp_ms.set(peer.state.timestamp_ms as i64);
    drop(peer);

    for (tx_hash, result) in outcome.results {
        if let Some(interest) = shared.interests.take(&tx_hash) {
            if let Some(conn) = connections.get(interest.connection_id) {
                conn.send(Frame::new(interest.message_id, Message::Result(result)));
            }
        }
    }
    shared.metrics.pending_interests.set(shared.interests.len() as i64);
    Ok(())
}

/// Dial every known peer with an advertised URL that isn't already
/// connected. Challenge issuance itself happens as part of establishing the
/// outbound connection, in the transport layer that implements
/// `ensure_connected`.
fn reconcile_connections(shared: &Shared, connections: &dyn ConnectionRegistry) {
    let peer = shared.peer.lock().expect("peer mutex poisoned");
    let local_key = peer.address();
    let known: Vec<(PeerKey, String)> =
        peer.state.peers.iter().filter(|(k, _)| **k != local_key).filter_map(|(k, v)| v.url.clone().map(|u| (k.clone(), u))).collect();
    drop(peer);

    let connected: std::collections::HashSet<PeerKey> = connections.all().iter().filter_map(|c| c.peer_key()).collect();
    for (peer_key, url) in known {
        if !connected.contains(&peer_key) {
            connections.ensure_connected(&peer_key, &url);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::security::keystore::{FileEd25519Backend, Keystore};
    use crate::core::state::model::{Peer, ResultErrorCode, State, Transaction};
    use crate::core::runtime::executor::NoopExecutor;
    use crate::monitoring::metrics::Metrics;
    use crate::server::interests::Interest;
    use crate::store::{Context, SledStore};
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    struct TestConn {
        id: u64,
        key: Option<PeerKey>,
        sent: StdMutex<Vec<Frame>>,
    }

    impl Outgoing for TestConn {
        fn connection_id(&self) -> u64 {
            self.id
        }
        fn peer_key(&self) -> Option<PeerKey> {
            self.key.clone()
        }
        fn send(&self, frame: Frame) {
            self.sent.lock().unwrap().push(frame);
        }
        fn close(&self) {}
    }

    struct TestRegistry {
        conns: StdMutex<HashMap<u64, Arc<dyn Outgoing>>>,
    }

    impl ConnectionRegistry for TestRegistry {
        fn all(&self) -> Vec<Arc<dyn Outgoing>> {
            self.conns.lock().unwrap().values().cloned().collect()
        }
        fn get(&self, connection_id: u64) -> Option<Arc<dyn Outgoing>> {
            self.conns.lock().unwrap().get(&connection_id).cloned()
        }
        fn ensure_connected(&self, _peer: &PeerKey, _url: &str) {}
    }

    fn fixture() -> (tempfile::TempDir, Shared) {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open(dir.path().join("store").to_str().unwrap()).unwrap();
        let ctx = Context::new(Arc::new(store));
        let keystore = Keystore::open(dir.path().join("ks").to_str().unwrap()).unwrap();
        let state = State::genesis(0);
        let belief = Belief::empty();
        let signed_belief = SignedBelief::sign(belief.clone(), 0, &keystore).unwrap();
        let peer = Peer { keystore, state, belief, signed_belief };
        let genesis_state_hash = State::genesis(0).hash();
        let shared =
            Shared::new(ctx, peer, genesis_state_hash, Arc::new(NoopExecutor::new()), Arc::new(Metrics::new().unwrap()), 1024);
        (dir, shared)
    }

    #[test]
    fn empty_queue_proposes_nothing() {
        let (_d, shared) = fixture();
        propose_block(&shared).unwrap();
        let peer = shared.peer.lock().unwrap();
        assert!(peer.belief.orders.is_empty());
    }

    #[test]
    fn queued_transaction_is_proposed_into_a_self_signed_order() {
        let (_d, shared) = fixture();
        let local_key = shared.peer.lock().unwrap().address();
        let tx = Transaction::Invoke { address: local_key.clone(), sequence: -1, form: "(+ 1 1)".into() };
        let signed = {
            let peer = shared.peer.lock().unwrap();
            crate::core::state::model::SignedTransaction::sign(tx, &peer.keystore).unwrap()
        };
        shared.new_transactions.lock().unwrap().push(signed);

        propose_block(&shared).unwrap();

        let peer = shared.peer.lock().unwrap();
        let order = peer.belief.orders.get(&local_key).unwrap();
        assert!(order.verify(&local_key));
        let resolved = order.order.resolve(&shared.ctx).unwrap();
        assert_eq!(resolved.proposal_point, 1);
    }

    #[test]
    fn own_proposal_reaches_consensus_and_delivers_result() {
        let (_d, shared) = fixture();
        let local_key = {
            let mut peer = shared.peer.lock().unwrap();
            let key = peer.address();
            peer.state.peers.insert(key.clone(), crate::core::state::model::PeerStatus { stake: 10, url: None });
            key
        };
        let tx = Transaction::Invoke { address: local_key.clone(), sequence: -1, form: "(+ 1 1)".into() };
        let signed = {
            let peer = shared.peer.lock().unwrap();
            crate::core::state::model::SignedTransaction::sign(tx, &peer.keystore).unwrap()
        };
        let tx_hash = signed.hash();
        shared.new_transactions.lock().unwrap().push(signed);
        shared.interests.register(tx_hash, Interest { connection_id: 1, message_id: 42 });

        let conn = Arc::new(TestConn { id: 1, key: Some(local_key.clone()), sent: StdMutex::new(Vec::new()) });
        let registry = TestRegistry { conns: StdMutex::new(HashMap::from([(1u64, conn.clone() as Arc<dyn Outgoing>)])) };

        tick(&shared, &registry).unwrap();

        let peer = shared.peer.lock().unwrap();
        assert_eq!(peer.belief.orders.get(&local_key).unwrap().order.resolve(&shared.ctx).unwrap().consensus_point, 1);
        let sent = conn.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        match &sent[0].message {
            Message::Result(r) => assert_eq!(r.error, None::<ResultErrorCode>),
            _ => panic!("expected a Result frame"),
        }
    }

    #[test]
    fn reconcile_dials_known_peers_without_a_live_connection() {
        let (_d, shared) = fixture();
        {
            let mut peer = shared.peer.lock().unwrap();
            let other = PeerKey(vec![9u8; 32]);
            peer.state.peers.insert(other, crate::core::state::model::PeerStatus { stake: 1, url: Some("peer://x".into()) });
        }
        let dialed = Arc::new(StdMutex::new(Vec::new()));
        struct Recording {
            dialed: Arc<StdMutex<Vec<PeerKey>>>,
        }
        impl ConnectionRegistry for Recording {
            fn all(&self) -> Vec<Arc<dyn Outgoing>> {
                Vec::new()
            }
            fn get(&self, _connection_id: u64) -> Option<Arc<dyn Outgoing>> {
                None
            }
            fn ensure_connected(&self, peer: &PeerKey, _url: &str) {
                self.dialed.lock().unwrap().push(peer.clone());
            }
        }
        let registry = Recording { dialed: dialed.clone() };
        reconcile_connections(&shared, &registry);
        assert_eq!(dialed.lock().unwrap().len(), 1);
    }
}
