// Copyright (c) 2026 Concordia
// Licensed under the Apache License, Version 2.0

//! Peer state model and the staking ledger that backs `PeerStatus.stake`.

/// `State`, `Block`, `Order`, `Belief`, `Peer`, `PeerStatus`.
pub mod model;
/// Deterministic bonding/unbonding/slashing ledger.
pub mod staking;
