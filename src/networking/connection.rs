// Copyright (c) 2026 Concordia
// Licensed under the Apache License, Version 2.0

//! Framed TCP transport: the length-delimited byte stream frames travel
//! over, and the `ConnectionManager` that the acceptor, the dialer, and the
//! worker loop all share. Implements [`crate::server::dispatch::Outgoing`]
//! (per connection) and [`crate::server::run::ConnectionRegistry`] (for the
//! manager as a whole), keeping `dispatch`/`run` ignorant of sockets.

#![forbid(unsafe_code)]

use crate::core::types::PeerKey;
use crate::networking::peer_score::{Decision, PeerScore, ScoreParams};
use crate::server::dispatch::{handle_frame, Outgoing, Shared};
use crate::server::handshake::{self, HandshakeState};
use crate::server::message::{Frame, Message};
use crate::server::run::ConnectionRegistry;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// One open TCP connection's outbound half. `outbound` is `None` once
/// `close` has run; the connection's task notices on its next `recv` and
/// tears the socket down.
struct TcpConnection {
    id: u64,
    peer_key: Mutex<Option<PeerKey>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
}

impl Outgoing for TcpConnection {
    fn connection_id(&self) -> u64 {
        self.id
    }

    fn peer_key(&self) -> Option<PeerKey> {
        self.peer_key.lock().expect("peer_key mutex poisoned").clone()
    }

    fn send(&self, frame: Frame) {
        if let Some(tx) = self.outbound.lock().expect("outbound mutex poisoned").as_ref() {
            let _ = tx.send(frame);
        }
    }

    fn close(&self) {
        self.outbound.lock().expect("outbound mutex poisoned").take();
    }
}

/// Parse a `tcp://host:port` advertised URL into a dialable address.
fn parse_tcp_url(url: &str) -> Option<SocketAddr> {
    url.strip_prefix("tcp://").and_then(|rest| rest.parse().ok())
}

/// Every connection this peer currently holds open, plus in-flight outbound
/// dials, shared between the acceptor, the connector, and the worker loop.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    conns: Mutex<HashMap<u64, Arc<TcpConnection>>>,
    dialing: Mutex<HashSet<PeerKey>>,
    score: Mutex<PeerScore>,
    cancel: CancellationToken,
    self_weak: OnceLock<Weak<ConnectionManager>>,
}

impl ConnectionManager {
    /// Build a manager bound to one peer's dispatch state. `cancel` governs
    /// every connection this manager spawns, dialed or accepted.
    pub fn new(shared: Arc<Shared>, cancel: CancellationToken) -> Arc<Self> {
        let manager = Arc::new(ConnectionManager {
            shared,
            conns: Mutex::new(HashMap::new()),
            dialing: Mutex::new(HashSet::new()),
            score: Mutex::new(PeerScore::new(ScoreParams::default())),
            cancel,
            self_weak: OnceLock::new(),
        });
        let _ = manager.self_weak.set(Arc::downgrade(&manager));
        manager
    }

    /// Accept inbound connections on `bind_addr` until the manager's cancel
    /// token fires.
    pub async fn listen(self: &Arc<Self>, bind_addr: SocketAddr) -> std::io::Result<()> {
        let listener = TcpListener::bind(bind_addr).await?;
        info!(%bind_addr, "listening for peer connections");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            debug!(%peer_addr, "inbound connection");
                            self.clone().spawn_connection(stream, None);
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
            }
        }
    }

    fn get_outgoing(&self, connection_id: u64) -> Option<Arc<dyn Outgoing>> {
        self.conns.lock().expect("conns mutex poisoned").get(&connection_id).cloned().map(|c| c as Arc<dyn Outgoing>)
    }

    fn remove(&self, id: u64) {
        self.conns.lock().expect("conns mutex poisoned").remove(&id);
        self.shared.interests.discard_connection(id);
        self.shared.metrics.connected_peers.dec();
    }

    fn spawn_connection(self: Arc<Self>, stream: TcpStream, expected_peer: Option<PeerKey>) -> u64 {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::SeqCst);
        let cancel = self.cancel.clone();
        let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
        let conn = Arc::new(TcpConnection { id, peer_key: Mutex::new(expected_peer.clone()), outbound: Mutex::new(Some(tx)) });
        self.conns.lock().expect("conns mutex poisoned").insert(id, conn.clone());

        let manager = self.clone();
        tokio::spawn(async move {
            let mut hs = HandshakeState::Untrusted;
            let (mut sink, mut stream) = Framed::new(stream, LengthDelimitedCodec::new()).split();

            if let Some(expected) = expected_peer {
                let issued = {
                    let peer = manager.shared.peer.lock().expect("peer mutex poisoned");
                    handshake::issue_challenge(&peer.keystore, expected)
                };
                match issued {
                    Ok((token, state)) => {
                        hs = state;
                        if sink.send(Bytes::from(Frame::new(0, Message::Challenge(token)).encode())).await.is_err() {
                            manager.remove(id);
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to issue challenge");
                        manager.remove(id);
                        return;
                    }
                }
            }

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    outgoing = rx.recv() => {
                        match outgoing {
                            Some(frame) => {
                                if sink.send(Bytes::from(frame.encode())).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    incoming = stream.next() => {
                        match incoming {
                            Some(Ok(bytes)) => {
                                let frame = match Frame::decode(&bytes) {
                                    Ok(f) => f,
                                    Err(e) => {
                                        warn!(error = %e, "bad frame");
                                        manager.shared.metrics.invalid_msg_total.inc();
                                        if manager.note_bad(id) == Decision::Ban {
                                            manager.shared.metrics.banned_total.inc();
                                            break;
                                        }
                                        continue;
                                    }
                                };
                                let registry = manager.clone();
                                let lookup = move |cid: u64| registry.get_outgoing(cid);
                                if let Err(e) = handle_frame(&manager.shared, conn.as_ref(), &mut hs, frame, &lookup) {
                                    warn!(error = %e, "dispatch failed");
                                }
                            }
                            Some(Err(e)) => {
                                debug!(error = %e, "connection read error");
                                break;
                            }
                            None => break,
                        }
                    }
                }
            }
            manager.remove(id);
        });
        id
    }

    fn note_bad(&self, connection_id: u64) -> Decision {
        let mut score = self.score.lock().expect("peer score mutex poisoned");
        score.observe_bad(connection_id.to_le_bytes().to_vec(), std::time::Instant::now(), 1)
    }
}

impl ConnectionRegistry for ConnectionManager {
    fn all(&self) -> Vec<Arc<dyn Outgoing>> {
        self.conns.lock().expect("conns mutex poisoned").values().map(|c| c.clone() as Arc<dyn Outgoing>).collect()
    }

    fn get(&self, connection_id: u64) -> Option<Arc<dyn Outgoing>> {
        self.get_outgoing(connection_id)
    }

    fn ensure_connected(&self, peer: &PeerKey, url: &str) {
        let already_connected = self.conns.lock().expect("conns mutex poisoned").values().any(|c| c.peer_key().as_ref() == Some(peer));
        if already_connected {
            return;
        }
        {
            let mut dialing = self.dialing.lock().expect("dialing mutex poisoned");
            if !dialing.insert(peer.clone()) {
                return;
            }
        }
        let Some(addr) = parse_tcp_url(url) else {
            warn!(url, "unparseable peer url, skipping dial");
            self.dialing.lock().expect("dialing mutex poisoned").remove(peer);
            return;
        };
        // `ensure_connected` takes `&self` (its caller holds only `&dyn
        // ConnectionRegistry`), but the dial needs to outlive this call in a
        // spawned task; `self_weak` (set at construction, see `new`) is how
        // every instance recovers its own `Arc` without one being passed in.
        let Some(manager) = self.self_weak.get().and_then(Weak::upgrade) else { return };
        let peer = peer.clone();
        tokio::spawn(async move {
            let result = TcpStream::connect(addr).await;
            manager.dialing.lock().expect("dialing mutex poisoned").remove(&peer);
            match result {
                Ok(stream) => {
                    info!(%addr, peer = %peer, "dialed peer");
                    manager.spawn_connection(stream, Some(peer));
                }
                Err(e) => warn!(%addr, error = %e, "dial failed"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_url() {
        assert_eq!(parse_tcp_url("tcp://127.0.0.1:4001"), Some("127.0.0.1:4001".parse().unwrap()));
        assert_eq!(parse_tcp_url("not-a-url"), None);
    }
}
