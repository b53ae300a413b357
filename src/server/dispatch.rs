// Copyright (c) 2026 Concordia
// Licensed under the Apache License, Version 2.0

//! Message dispatch: the per-kind action table that admits inbound frames
//! into the peer's shared queues, answers queries/status directly, and
//! drives the challenge handshake. One `Shared` instance is owned by the
//! whole server; each connection calls `handle_frame` serially against it.

#![forbid(unsafe_code)]

use crate::core::cell::{store_cell, Cell, Value};
use crate::core::runtime::executor::Executor;
use crate::core::state::model::{Peer, ResultErrorCode, Transaction, TransactionResult};
use crate::core::types::{PeerKey, H256};
use crate::monitoring::metrics::Metrics;
use crate::server::handshake::{self, HandshakeState};
use crate::server::interests::{Interest, Interests};
use crate::server::message::{Frame, Message, Query, StatusReply};
use crate::store::{Context, Mode, MissingData};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Maximum frames parked awaiting a single missing hash before newer
/// arrivals for that hash are silently dropped.
const MAX_PARKED_PER_HASH: usize = 16;

/// Outbound half of a connection, as dispatch needs it. Implemented by the
/// transport layer; dispatch never touches sockets directly.
pub trait Outgoing: Send + Sync {
    /// Stable id for this connection, used to key interests and parked
    /// deliveries.
    fn connection_id(&self) -> u64;
    /// The connection's authenticated peer key, once the handshake (run in
    /// the direction this peer challenged) has completed. `None` before
    /// that, or for a connection this peer never challenged.
    fn peer_key(&self) -> Option<PeerKey>;
    /// Write a frame out.
    fn send(&self, frame: Frame);
    /// Close the connection.
    fn close(&self);
}

/// Dispatch errors. Distinct from protocol-level rejections (which are
/// reported back to the client as a `Result` frame, not an error here).
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The store could not be read or written.
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

/// A frame that named a hash this peer does not yet hold, waiting on the
/// corresponding `DATA` to arrive.
struct Parked {
    connection_id: u64,
    frame: Frame,
}

/// State shared by every connection's dispatch calls.
pub struct Shared {
    /// Content-addressed store context.
    pub ctx: Context,
    /// This peer's identity, state, and belief.
    pub peer: Mutex<Peer>,
    /// Hash of the all-zero genesis state this peer started from.
    pub genesis_state_hash: H256,
    /// Transactions admitted since the last block proposal.
    pub new_transactions: Mutex<Vec<crate::core::state::model::SignedTransaction>>,
    /// Freshly admitted remote beliefs, keyed by sender, since the last
    /// merge pass.
    pub new_beliefs: Mutex<HashMap<PeerKey, crate::core::state::model::SignedBelief>>,
    /// Frames parked on a missing hash, keyed by that hash.
    partial_messages: Mutex<HashMap<H256, Vec<Parked>>>,
    /// Client interest table (transaction hash -> waiting connection).
    pub interests: Interests,
    /// The VM boundary.
    pub executor: Arc<dyn Executor>,
    /// Metrics, updated as frames are admitted or rejected.
    pub metrics: Arc<Metrics>,
}

impl Shared {
    /// Build the state one running peer shares across every connection.
    pub fn new(
        ctx: Context,
        peer: Peer,
        genesis_state_hash: H256,
        executor: Arc<dyn Executor>,
        metrics: Arc<Metrics>,
        interest_capacity: usize,
    ) -> Self {
        Shared {
            ctx,
            peer: Mutex::new(peer),
            genesis_state_hash,
            new_transactions: Mutex::new(Vec::new()),
            new_beliefs: Mutex::new(HashMap::new()),
            partial_messages: Mutex::new(HashMap::new()),
            interests: Interests::new(interest_capacity),
            executor,
            metrics,
        }
    }

    /// Park `frame` (from `conn`) on `missing`, and return the
    /// `MISSING_DATA` frame the caller should send back.
    fn park(&self, missing: H256, connection_id: u64, frame: Frame) -> Frame {
        let mut parked = self.partial_messages.lock().expect("partial_messages mutex poisoned");
        let bucket = parked.entry(missing).or_default();
        if bucket.len() < MAX_PARKED_PER_HASH {
            bucket.push(Parked { connection_id, frame });
        }
        self.metrics.parked_messages.set(parked.values().map(|b| b.len() as i64).sum());
        Frame::new(0, Message::MissingData(missing))
    }

    /// Take every frame parked on `hash`, for re-dispatch by the caller.
    fn take_parked(&self, hash: &H256) -> Vec<Parked> {
        let mut parked = self.partial_messages.lock().expect("partial_messages mutex poisoned");
        let out = parked.remove(hash).unwrap_or_default();
        self.metrics.parked_messages.set(parked.values().map(|b| b.len() as i64).sum());
        out
    }
}

/// Process one inbound frame on behalf of `conn`. `handshake` is that
/// connection's own handshake state, advanced in place by `CHALLENGE`/
/// `RESPONSE` frames.
pub fn handle_frame(
    shared: &Shared,
    conn: &dyn Outgoing,
    handshake: &mut HandshakeState,
    frame: Frame,
    connections: &dyn Fn(u64) -> Option<Arc<dyn Outgoing>>,
) -> Result<(), DispatchError> {
    match &frame.message {
        Message::Status(None) => {
            conn.send(Frame::new(frame.message_id, Message::Status(Some(status_reply(shared)))));
            Ok(())
        }
        Message::Status(Some(_)) => Ok(()), // replies are client-side only
        Message::Challenge(token) => {
            if let Ok(response) = handshake::respond_to_challenge(&shared.peer.lock().expect("peer mutex poisoned").keystore, token) {
                conn.send(Frame::new(frame.message_id, Message::Response(response)));
            }
            Ok(())
        }
        Message::Response(token) => {
            if let Ok(next) = handshake::accept_response(handshake, token) {
                *handshake = next;
                shared.metrics.connected_peers.inc();
            }
            Ok(())
        }
        Message::Goodbye => {
            shared.interests.discard_connection(conn.connection_id());
            conn.close();
            Ok(())
        }
        Message::Result(_) => Ok(()), // inbound RESULT is a client-only concern
        Message::Command(_) => Ok(()), // semantics intentionally unspecified
        Message::MissingData(hash) => {
            if let Some(bytes) = shared.ctx.store.lookup_bytes(hash) {
                if let Ok(value) = Value::decode(&bytes) {
                    conn.send(Frame::new(0, Message::Data(value)));
                }
            }
            Ok(())
        }
        Message::Data(value) => {
            let hash = value.hash();
            store_cell(&shared.ctx, value.clone(), Mode::Shallow)?;
            // Parked frames are only ever `BELIEF` (see below): redeliver each
            // directly against `admit_belief` rather than re-entering
            // `handle_frame`, since that would re-check handshake trust
            // against the *current* connection's state, not the parked
            // frame's own originating connection.
            for parked in shared.take_parked(&hash) {
                let (Message::Belief(signed_belief), Some(origin)) = (&parked.frame.message, connections(parked.connection_id)) else {
                    continue;
                };
                let Some(sender) = origin.peer_key() else { continue };
                match admit_belief(shared, &sender, signed_belief) {
                    Ok(()) => {}
                    Err(MissingData(h)) => {
                        origin.send(shared.park(h, origin.connection_id(), parked.frame.clone()));
                    }
                }
            }
            Ok(())
        }
        Message::Belief(signed_belief) => {
            if !handshake_trusted(handshake) {
                return Ok(());
            }
            let Some(sender) = conn.peer_key() else { return Ok(()) };
            if !signed_belief.verify(&sender) {
                return Ok(());
            }
            match admit_belief(shared, &sender, signed_belief) {
                Ok(()) => Ok(()),
                Err(MissingData(h)) => {
                    conn.send(shared.park(h, conn.connection_id(), frame.clone()));
                    Ok(())
                }
            }
        }
        Message::Transact(signed_tx) => {
            if !handshake_trusted(handshake) {
                return Ok(());
            }
            let Transaction::Invoke { address, .. } = &signed_tx.transaction;
            if !signed_tx.verify(address) {
                conn.send(Frame::new(frame.message_id, Message::Result(TransactionResult::err(ResultErrorCode::BadSignature))));
                shared.metrics.invalid_msg_total.inc();
                return Ok(());
            }
            store_cell(&shared.ctx, signed_tx.clone(), Mode::Shallow)?;
            shared.interests.register(
                signed_tx.hash(),
                Interest { connection_id: conn.connection_id(), message_id: frame.message_id },
            );
            shared.new_transactions.lock().expect("new_transactions mutex poisoned").push(signed_tx.clone());
            shared.metrics.pending_interests.set(shared.interests.len() as i64);
            Ok(())
        }
        Message::Query(Query { form, address }) => {
            if !handshake_trusted(handshake) {
                return Ok(());
            }
            let state = shared.peer.lock().expect("peer mutex poisoned").state.clone();
            let (_new_state, result) = shared.executor.execute(form, address, &state);
            conn.send(Frame::new(frame.message_id, Message::Result(result)));
            Ok(())
        }
    }
}

fn handshake_trusted(state: &HandshakeState) -> bool {
    matches!(state, HandshakeState::Trusted)
}

/// Admit an already-signature-verified belief into `new_beliefs` if it is
/// newer than what is currently held for `sender`. Resolving the belief's
/// body may still raise `MissingData` (the signature covers only the
/// belief's hash, not its presence in the store).
fn admit_belief(
    shared: &Shared,
    sender: &PeerKey,
    signed_belief: &crate::core::state::model::SignedBelief,
) -> Result<(), MissingData> {
    signed_belief.belief.resolve(&shared.ctx)?;
    let mut new_beliefs = shared.new_beliefs.lock().expect("new_beliefs mutex poisoned");
    let is_newer = new_beliefs.get(sender).map(|b| b.timestamp_ms < signed_belief.timestamp_ms).unwrap_or(true);
    if is_newer {
        new_beliefs.insert(sender.clone(), signed_belief.clone());
    }
    Ok(())
}

fn status_reply(shared: &Shared) -> StatusReply {
    let peer = shared.peer.lock().expect("peer mutex poisoned");
    let peers = peer.state.peers.iter().filter_map(|(k, v)| v.url.clone().map(|u| (k.clone(), u))).collect();
    StatusReply {
        belief_hash: peer.signed_belief.hash(),
        state_hash: peer.state.hash(),
        genesis_state_hash: shared.genesis_state_hash,
        peers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::security::keystore::{FileEd25519Backend, Keystore};
    use crate::core::state::model::{Belief, SignedBelief, SignedTransaction};
    use crate::core::runtime::executor::NoopExecutor;
    use crate::core::state::model::State;
    use crate::store::SledStore;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex as StdMutex;

    struct TestConn {
        id: u64,
        key: Option<PeerKey>,
        sent: StdMutex<Vec<Frame>>,
        closed: std::sync::atomic::AtomicBool,
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
        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Builds a `Shared` whose peer keystore lives under `dir/ks`, and
    /// returns a second handle onto that same on-disk key (so tests can
    /// sign client-side messages "as" the peer without borrowing its
    /// keystore out of `Shared`).
    fn shared_fixture() -> (tempfile::TempDir, Shared, Keystore<FileEd25519Backend>) {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open(dir.path().join("store").to_str().unwrap()).unwrap();
        let ctx = Context::new(Arc::new(store));
        let ks_path = dir.path().join("ks");
        let keystore = Keystore::open(ks_path.to_str().unwrap()).unwrap();
        let test_keystore = Keystore::open(ks_path.to_str().unwrap()).unwrap();
        let state = State::genesis(0);
        let belief = Belief::empty();
        let signed_belief = SignedBelief::sign(belief.clone(), 0, &keystore).unwrap();
        let peer = Peer { keystore, state, belief, signed_belief };
        let genesis_state_hash = State::genesis(0).hash();
        let shared =
            Shared::new(ctx, peer, genesis_state_hash, Arc::new(NoopExecutor::new()), Arc::new(Metrics::new().unwrap()), 1024);
        (dir, shared, test_keystore)
    }

    static NEXT_ID: AtomicU64 = AtomicU64::new(1);

    fn conn(key: Option<PeerKey>) -> Arc<TestConn> {
        Arc::new(TestConn {
            id: NEXT_ID.fetch_add(1, Ordering::SeqCst),
            key,
            sent: StdMutex::new(Vec::new()),
            closed: std::sync::atomic::AtomicBool::new(false),
        })
    }

    #[test]
    fn status_request_gets_a_reply() {
        let (_d, shared, _ks) = shared_fixture();
        let c = conn(None);
        let mut hs = HandshakeState::Untrusted;
        let noop: &dyn Fn(u64) -> Option<Arc<dyn Outgoing>> = &|_| None;
        handle_frame(&shared, c.as_ref(), &mut hs, Frame::new(1, Message::Status(None)), noop).unwrap();
        let sent = c.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0].message, Message::Status(Some(_))));
    }

    #[test]
    fn untrusted_transact_is_ignored() {
        let (_d, shared, ks) = shared_fixture();
        let addr = PeerKey(ks.public_key().to_vec());
        let tx = Transaction::Invoke { address: addr.clone(), sequence: -1, form: "(+ 1 1)".into() };
        let signed = SignedTransaction::sign(tx, &ks).unwrap();
        let c = conn(Some(addr));
        let mut hs = HandshakeState::Untrusted;
        let noop: &dyn Fn(u64) -> Option<Arc<dyn Outgoing>> = &|_| None;
        handle_frame(&shared, c.as_ref(), &mut hs, Frame::new(5, Message::Transact(signed)), noop).unwrap();
        assert!(c.sent.lock().unwrap().is_empty());
        assert!(shared.new_transactions.lock().unwrap().is_empty());
    }

    #[test]
    fn trusted_transact_with_bad_signature_gets_signature_error() {
        let (_d, shared, ks) = shared_fixture();
        let addr = PeerKey(ks.public_key().to_vec());
        let other_dir = tempfile::tempdir().unwrap();
        let other_ks = Keystore::open(other_dir.path().to_str().unwrap()).unwrap();
        let tx = Transaction::Invoke { address: addr.clone(), sequence: -1, form: "(+ 1 1)".into() };
        // signed by a different key than `address` names, so verify() fails.
        let signed = SignedTransaction::sign(tx, &other_ks).unwrap();
        let c = conn(Some(addr));
        let mut hs = HandshakeState::Trusted;
        let noop: &dyn Fn(u64) -> Option<Arc<dyn Outgoing>> = &|_| None;
        handle_frame(&shared, c.as_ref(), &mut hs, Frame::new(5, Message::Transact(signed)), noop).unwrap();
        let sent = c.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        match &sent[0].message {
            Message::Result(r) => assert_eq!(r.error, Some(ResultErrorCode::BadSignature)),
            _ => panic!("expected Result"),
        }
    }

    #[test]
    fn trusted_valid_transact_is_admitted_and_tracked() {
        let (_d, shared, ks) = shared_fixture();
        let addr = PeerKey(ks.public_key().to_vec());
        let tx = Transaction::Invoke { address: addr.clone(), sequence: -1, form: "(+ 1 1)".into() };
        let signed = SignedTransaction::sign(tx, &ks).unwrap();
        let expected_hash = signed.hash();
        let c = conn(Some(addr));
        let mut hs = HandshakeState::Trusted;
        let noop: &dyn Fn(u64) -> Option<Arc<dyn Outgoing>> = &|_| None;
        handle_frame(&shared, c.as_ref(), &mut hs, Frame::new(9, Message::Transact(signed)), noop).unwrap();
        assert!(c.sent.lock().unwrap().is_empty());
        assert_eq!(shared.new_transactions.lock().unwrap().len(), 1);
        assert_eq!(shared.interests.take(&expected_hash).unwrap(), Interest { connection_id: c.connection_id(), message_id: 9 });
    }

    #[test]
    fn trusted_query_executes_and_replies() {
        let (_d, shared, ks) = shared_fixture();
        let addr = PeerKey(ks.public_key().to_vec());
        let c = conn(Some(addr.clone()));
        let mut hs = HandshakeState::Trusted;
        let noop: &dyn Fn(u64) -> Option<Arc<dyn Outgoing>> = &|_| None;
        let query = Query { form: "(+ 1 2)".into(), address: addr };
        handle_frame(&shared, c.as_ref(), &mut hs, Frame::new(3, Message::Query(query)), noop).unwrap();
        let sent = c.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0].message, Message::Result(_)));
    }

    #[test]
    fn goodbye_closes_and_discards_interests() {
        let (_d, shared, _ks) = shared_fixture();
        let c = conn(None);
        shared.interests.register(H256::from_bytes([1u8; 32]), Interest { connection_id: c.connection_id(), message_id: 1 });
        let mut hs = HandshakeState::Trusted;
        let noop: &dyn Fn(u64) -> Option<Arc<dyn Outgoing>> = &|_| None;
        handle_frame(&shared, c.as_ref(), &mut hs, Frame::new(1, Message::Goodbye), noop).unwrap();
        assert!(c.closed.load(Ordering::SeqCst));
        assert!(shared.interests.is_empty());
    }

    #[test]
    fn park_then_take_parked_round_trips() {
        // The belief's own body is embedded (an empty orders map), so it never
        // actually misses data on resolve; this exercises the park/take_parked
        // bookkeeping directly rather than the dispatch admission path.
        let (_d, shared, ks) = shared_fixture();
        let addr = PeerKey(ks.public_key().to_vec());
        let belief = Belief::empty();
        let missing_hash = H256::from_bytes([42u8; 32]);
        let signed_belief = SignedBelief::sign(belief, 0, &ks).unwrap();
        let c = conn(Some(addr));
        let frame = Frame::new(2, Message::Belief(signed_belief));

        let parked_reply = shared.park(missing_hash, c.connection_id(), frame);
        assert!(matches!(parked_reply.message, Message::MissingData(h) if h == missing_hash));

        let redelivered = shared.take_parked(&missing_hash);
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].connection_id, c.connection_id());
        assert!(shared.take_parked(&missing_hash).is_empty());
    }

    #[test]
    fn data_arrival_unparks_and_admits_a_waiting_belief() {
        let (_d, shared, ks) = shared_fixture();
        let addr = PeerKey(ks.public_key().to_vec());
        let belief = Belief::empty();
        let belief_ref = crate::core::cell::Ref::from_value(belief.clone());
        let signed_belief = SignedBelief::sign(belief.clone(), 7, &ks).unwrap();
        let c = conn(Some(addr.clone()));

        // Force a park by pretending the belief's body hash is missing, then
        // let a DATA frame for that exact body satisfy it.
        let parked_reply = shared.park(belief_ref.hash(), c.connection_id(), Frame::new(1, Message::Belief(signed_belief)));
        assert!(matches!(parked_reply.message, Message::MissingData(_)));

        let connections_map: StdMutex<HashMap<u64, Arc<dyn Outgoing>>> = StdMutex::new(HashMap::new());
        connections_map.lock().unwrap().insert(c.connection_id(), c.clone() as Arc<dyn Outgoing>);
        let lookup = |id: u64| connections_map.lock().unwrap().get(&id).cloned();

        let mut hs = HandshakeState::Trusted;
        let data_frame = Frame::new(0, Message::Data(crate::core::cell::Value::decode(&belief.encode()).unwrap()));
        handle_frame(&shared, c.as_ref(), &mut hs, data_frame, &lookup).unwrap();

        assert!(shared.new_beliefs.lock().unwrap().contains_key(&addr));
    }
}
