#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Peer node entrypoint (systemd-friendly). Loads a `PeerConfig`, opens the
//! keystore and store, restores or genesis-initializes a `Peer`, and runs
//! the server loop until shut down.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use concordia::core::cell::{store_cell, Ref};
use concordia::core::security::keystore::Keystore;
use concordia::core::state::model::{Belief, Checkpoint, Peer, State};
use concordia::core::runtime::executor::NoopExecutor;
use concordia::core::types::PeerKey;
use concordia::monitoring::metrics::Metrics;
use concordia::networking::connection::ConnectionManager;
use concordia::server::dispatch::Shared;
use concordia::server::run::run;
use concordia::store::{Context, Mode, SledStore};
use concordia::config::PeerConfig;

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as u64
}

/// Restore `(State, Belief, SignedBelief)` from the store's persisted root,
/// or fall back to a fresh genesis peer if none is set (or restoration was
/// not requested).
fn load_or_genesis(
    ctx: &Context,
    keystore: &Keystore<concordia::core::security::keystore::FileEd25519Backend>,
    restore: bool,
) -> (State, Belief, concordia::core::state::model::SignedBelief) {
    if restore {
        match ctx.store.get_root() {
            Ok(Some(hash)) => {
                let checkpoint_ref: Ref<Checkpoint> = Ref::from_hash(hash);
                match checkpoint_ref.resolve(ctx) {
                    Ok(checkpoint) => match (checkpoint.state.resolve(ctx), checkpoint.signed_belief.resolve(ctx)) {
                        (Ok(state), Ok(signed_belief)) => match signed_belief.belief.resolve(ctx) {
                            Ok(belief) => {
                                info!("restored peer state from persisted root");
                                return (state, belief, signed_belief);
                            }
                            Err(e) => warn!(?e, "failed to resolve belief from root, falling back to genesis"),
                        },
                        (Err(e), _) | (_, Err(e)) => {
                            warn!(?e, "failed to resolve checkpoint from root, falling back to genesis")
                        }
                    },
                    Err(e) => warn!(?e, "failed to resolve checkpoint cell, falling back to genesis"),
                }
            }
            Ok(None) => info!("restore requested but no root set yet, starting from genesis"),
            Err(e) => warn!(?e, "failed to read store root, falling back to genesis"),
        }
    }

    let belief = Belief::empty();
    let signed_belief = concordia::core::state::model::SignedBelief::sign(belief.clone(), now_ms(), keystore)
        .expect("signing genesis belief");
    (State::genesis(now_ms()), belief, signed_belief)
}

/// Persist the current `Peer` (minus its keystore) as the store's restart
/// anchor.
fn persist_checkpoint(ctx: &Context, peer: &Peer) {
    let checkpoint = Checkpoint {
        state: Ref::from_value(peer.state.clone()),
        signed_belief: Ref::from_value(peer.signed_belief.clone()),
    };
    match store_cell(ctx, checkpoint, Mode::Deep) {
        Ok(checkpoint_ref) => match ctx.store.set_root(checkpoint_ref.hash()) {
            Ok(()) => info!("persisted checkpoint as restart root"),
            Err(e) => warn!(?e, "failed to set restart root"),
        },
        Err(e) => warn!(?e, "failed to deep-store checkpoint"),
    }
}

#[tokio::main]
async fn main() {
    let _ = tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .compact()
        .try_init();

    let config_path = std::env::args().nth(1).map(PathBuf::from).unwrap_or_else(|| PathBuf::from("peer.toml"));
    let config = match PeerConfig::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load config at {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    std::fs::create_dir_all(&config.key_dir).expect("creating key directory");
    std::fs::create_dir_all(&config.store_dir).expect("creating store directory");

    let keystore = Keystore::open(config.key_dir.to_str().expect("key_dir is valid utf-8"))
        .expect("opening keystore");
    let store = Arc::new(SledStore::open(config.store_dir.to_str().expect("store_dir is valid utf-8")).expect("opening store"));
    let ctx = Context::new(store);

    let (state, belief, signed_belief) = load_or_genesis(&ctx, &keystore, config.restore_from_root);
    let peer = Peer { keystore, state, belief, signed_belief };
    let address = peer.address();
    info!(peer = %address.to_base58(), "peer identity loaded");

    let genesis_state_hash = Ref::from_value(State::genesis(0)).hash();
    let metrics = Arc::new(Metrics::new().expect("metrics init failed"));
    let executor = Arc::new(NoopExecutor::new());
    let shared = Arc::new(Shared::new(ctx, peer, genesis_state_hash, executor, metrics, config.interest_capacity));

    let cancel = CancellationToken::new();
    let connections = ConnectionManager::new(shared.clone(), cancel.clone());

    for bootstrap_peer in &config.bootstrap {
        match PeerKey::from_base58(&bootstrap_peer.key) {
            Some(key) => connections.ensure_connected(&key, &bootstrap_peer.url),
            None => warn!(key = %bootstrap_peer.key, "unparseable bootstrap peer key, skipping"),
        }
    }

    let bind_addr = format!("0.0.0.0:{}", config.bind_port).parse().expect("bind address");
    let listen_connections = connections.clone();
    let listen_task = tokio::spawn(async move {
        if let Err(e) = listen_connections.listen(bind_addr).await {
            warn!(error = %e, "listener stopped");
        }
    });

    let shutdown_cancel = cancel.clone();
    let shutdown_task = tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        shutdown_cancel.cancel();
    });

    info!(bind_port = config.bind_port, peer = %address.to_base58(), "peer starting");
    run(shared.clone(), connections, cancel).await;

    let _ = listen_task.await;
    let _ = shutdown_task.await;

    if config.persist_on_close {
        let peer = shared.peer.lock().expect("peer mutex poisoned");
        persist_checkpoint(&shared.ctx, &peer);
    }
    if let Err(e) = shared.ctx.store.close() {
        warn!(?e, "failed to close store cleanly");
    }
}
