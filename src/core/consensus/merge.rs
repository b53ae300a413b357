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

//! Belief merge and consensus-point advance.
//!
//! Given the local peer's belief (its view of every known peer's retained
//! `Order`) and a batch of freshly received remote `SignedBelief`s: verify
//! signatures, retain the best `Order` per peer, compute the block prefix
//! a stake-weighted majority agrees on, advance the local peer's own
//! `consensusPoint` to that prefix (never backwards), and execute every
//! newly consensus-reached block sequentially against the current `State`.
//!
//! Re-signing the advanced local `Order` and the merged `Belief` is left to
//! the caller (the update loop owns the keystore); this module only
//! computes the new unsigned values, grounded on the vote-counting /
//! supermajority-threshold shape of the Tide finality gadget generalized
//! from 2/3-supermajority block commits to the simple stake-majority
//! consensus prefix this data model specifies.

use crate::core::cell::Cell;
use crate::core::runtime::executor::Executor;
use crate::core::state::model::{Belief, Order, SignedBelief, SignedOrder, State, Transaction, TransactionResult};
use crate::core::types::{CanonicalMap, PeerKey, H256};
use crate::core::vector::VectorError;
use crate::store::{Context, MissingData};
use std::collections::BTreeMap;
use thiserror::Error;

/// Belief-merge errors.
#[derive(Debug, Error)]
pub enum MergeError {
    /// A referenced cell was not locally available; the caller should park
    /// the originating message and request this hash over the wire.
    #[error("missing data: {0}")]
    MissingData(H256),
    /// A decoded `Order` violated its own length invariant.
    #[error("order invariant violated")]
    OrderInvariant,
}

impl From<MissingData> for MergeError {
    fn from(e: MissingData) -> Self {
        MergeError::MissingData(e.0)
    }
}

impl From<VectorError> for MergeError {
    fn from(e: VectorError) -> Self {
        match e {
            VectorError::Missing(MissingData(h)) => MergeError::MissingData(h),
            VectorError::OutOfBounds | VectorError::InvalidShape => MergeError::OrderInvariant,
        }
    }
}

impl From<crate::core::state::model::OrderError> for MergeError {
    fn from(_: crate::core::state::model::OrderError) -> Self {
        MergeError::OrderInvariant
    }
}

/// Policy hook invoked when a remote belief fails signature verification.
/// The source leaves the actual slashing policy unspecified; this is the
/// seam a caller wires a real policy into.
pub trait SlashingHook: Send + Sync {
    /// A belief purportedly from `sender` carried an invalid signature.
    fn on_invalid_belief(&self, sender: &PeerKey);
}

/// Slashing hook that does nothing, used where no policy is wired in.
pub struct NoopSlashing;

impl SlashingHook for NoopSlashing {
    fn on_invalid_belief(&self, _sender: &PeerKey) {}
}

/// Result of one merge pass.
pub struct MergeOutcome {
    /// Every other peer's retained `SignedOrder`, keyed by peer. Excludes
    /// the local peer's own order: its advanced, not-yet-re-signed form is
    /// `local_order` instead, since only the caller holds the keystore
    /// needed to re-sign it.
    pub orders: CanonicalMap<PeerKey, SignedOrder>,
    /// The local peer's own order, with `consensus_point` advanced (never
    /// decreased) to the newly computed consensus prefix.
    pub local_order: Order,
    /// State after executing every block between the old and new
    /// consensus point, in order.
    pub state: State,
    /// Per-transaction execution results, in execution order, keyed by
    /// that transaction's identity hash (what the server's interest map
    /// is keyed on).
    pub results: Vec<(H256, TransactionResult)>,
}

/// Tie-break key for retaining the best `Order` seen for a given peer:
/// greatest timestamp, then greatest proposal point, then greatest
/// consensus point, then greatest order hash.
fn retain_rank(signed: &SignedOrder, order: &Order) -> (u64, u64, u64, H256) {
    (signed.timestamp_ms, order.proposal_point, order.consensus_point, signed.order.hash())
}

/// Verify every remote belief and fold its orders, together with the
/// local belief's own orders, into one best-per-peer candidate set.
fn collect_candidates(
    local_belief: &Belief,
    remote: &[(PeerKey, SignedBelief)],
    slashing: &dyn SlashingHook,
    ctx: &Context,
) -> Result<BTreeMap<PeerKey, (SignedOrder, Order)>, MergeError> {
    let mut candidates: BTreeMap<PeerKey, (SignedOrder, Order)> = BTreeMap::new();

    for (peer_key, signed_order) in local_belief.orders.iter() {
        if !signed_order.verify(peer_key) {
            continue;
        }
        let order = signed_order.order.resolve(ctx)?;
        candidates.insert(peer_key.clone(), (signed_order.clone(), order));
    }

    for (sender, signed_belief) in remote {
        if !signed_belief.verify(sender) {
            slashing.on_invalid_belief(sender);
            continue;
        }
        let belief = signed_belief.belief.resolve(ctx)?;
        for (peer_key, signed_order) in belief.orders.iter() {
            if !signed_order.verify(peer_key) {
                continue;
            }
            let order = signed_order.order.resolve(ctx)?;
            let rank = retain_rank(signed_order, &order);
            let replace = match candidates.get(peer_key) {
                Some((existing_signed, existing_order)) => rank > retain_rank(existing_signed, existing_order),
                None => true,
            };
            if replace {
                candidates.insert(peer_key.clone(), (signed_order.clone(), order));
            }
        }
    }

    Ok(candidates)
}

/// Find the longest block prefix a strict stake-weighted majority of
/// `candidates` agrees on. Tries every distinct candidate order as the
/// reference sequence (a Byzantine minority's longer, disagreeing order
/// must not be allowed to silently win just because it was tried first)
/// and keeps the reference yielding the longest backed prefix.
fn stake_weighted_consensus_prefix(
    candidates: &BTreeMap<PeerKey, (SignedOrder, Order)>,
    stakes: &BTreeMap<PeerKey, u128>,
    ctx: &Context,
) -> Result<u64, MergeError> {
    let total_stake: u128 = stakes.values().copied().sum();
    if total_stake == 0 || candidates.is_empty() {
        return Ok(0);
    }

    let mut best = 0u64;
    for (_, reference_order) in candidates.values() {
        let reference = &reference_order.blocks;
        let mut supporting_at: BTreeMap<u64, u128> = BTreeMap::new();
        for (peer_key, (_, order)) in candidates.iter() {
            let stake = stakes.get(peer_key).copied().unwrap_or(0);
            if stake == 0 {
                continue;
            }
            let cpl = order.blocks.common_prefix_length(reference, ctx)?;
            *supporting_at.entry(cpl).or_insert(0) += stake;
        }
        // stake backing a prefix of length L also backs every shorter prefix.
        let mut cumulative = 0u128;
        let mut lengths: Vec<u64> = supporting_at.keys().copied().collect();
        lengths.sort_unstable_by(|a, b| b.cmp(a));
        for l in lengths {
            cumulative += supporting_at[&l];
            if cumulative * 2 > total_stake && l > best {
                best = l;
                break;
            }
        }
    }
    Ok(best)
}

/// Execute `order.blocks[old_point..new_point]` sequentially against
/// `state`, returning the resulting state, the advanced order, and every
/// per-transaction result in execution order.
fn execute_prefix(
    order: &Order,
    new_point: u64,
    state: &State,
    executor: &dyn Executor,
    ctx: &Context,
) -> Result<(Order, State, Vec<(H256, TransactionResult)>), MergeError> {
    let old_point = order.consensus_point;
    let mut state = state.clone();
    let mut results = Vec::new();
    for i in old_point..new_point {
        let block = order.blocks.get(i, ctx)?;
        for signed_tx in block.transactions.to_vec(ctx)? {
            let tx_hash = signed_tx.hash();
            let Transaction::Invoke { address, form, .. } = &signed_tx.transaction;
            let result = if signed_tx.verify(address) {
                let (new_state, r) = executor.execute(form, address, &state);
                state = new_state;
                r
            } else {
                TransactionResult::err(crate::core::state::model::ResultErrorCode::BadSignature)
            };
            results.push((tx_hash, result));
        }
    }
    let advanced = order.advance_consensus(new_point)?;
    Ok((advanced, state, results))
}

/// Run one belief-merge pass.
pub fn merge(
    local_peer_key: &PeerKey,
    local_belief: &Belief,
    local_state: &State,
    remote: &[(PeerKey, SignedBelief)],
    executor: &dyn Executor,
    slashing: &dyn SlashingHook,
    ctx: &Context,
) -> Result<MergeOutcome, MergeError> {
    let candidates = collect_candidates(local_belief, remote, slashing, ctx)?;

    let stakes: BTreeMap<PeerKey, u128> =
        candidates.keys().map(|k| (k.clone(), local_state.peers.get(k).map(|p| p.stake).unwrap_or(0))).collect();

    let prefix_len = stake_weighted_consensus_prefix(&candidates, &stakes, ctx)?;

    let local_order = candidates.get(local_peer_key).map(|(_, o)| o.clone()).unwrap_or_else(Order::empty);
    let new_point = prefix_len.min(local_order.proposal_point).max(local_order.consensus_point);

    let (local_order, state, results) = execute_prefix(&local_order, new_point, local_state, executor, ctx)?;

    let orders: CanonicalMap<PeerKey, SignedOrder> = candidates
        .into_iter()
        .filter(|(peer_key, _)| peer_key != local_peer_key)
        .map(|(peer_key, (signed, _))| (peer_key, signed))
        .collect();

    Ok(MergeOutcome { orders, local_order, state, results })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::runtime::executor::NoopExecutor;
    use crate::core::state::model::{Block, PeerStatus, SignedTransaction};
    use crate::core::security::keystore::{FileEd25519Backend, Keystore};
    use crate::store::{Context as StoreContext, SledStore};
    use std::sync::Arc;

    fn ctx() -> (tempfile::TempDir, StoreContext) {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open(dir.path().to_str().unwrap()).unwrap();
        (dir, StoreContext::new(Arc::new(store)))
    }

    fn keystore() -> (tempfile::TempDir, Keystore<FileEd25519Backend>) {
        let dir = tempfile::tempdir().unwrap();
        let ks = Keystore::open(dir.path().to_str().unwrap()).unwrap();
        (dir, ks)
    }

    fn state_with_stake(peers: &[(PeerKey, u128)]) -> State {
        let mut state = State::genesis(0);
        for (k, stake) in peers {
            state.peers.insert(k.clone(), PeerStatus { stake: *stake, url: None });
        }
        state
    }

    #[test]
    fn single_peer_own_proposal_reaches_consensus() {
        let (_d, ctx) = ctx();
        let (_dk, ks) = keystore();
        let addr = PeerKey(ks.public_key().to_vec());

        let tx = Transaction::Invoke { address: addr.clone(), sequence: -1, form: "(+ 1 2)".into() };
        let signed_tx = SignedTransaction::sign(tx, &ks).unwrap();
        let block = Block::new(1, addr.clone(), vec![signed_tx]);
        let order = Order::empty().propose(block);
        let signed_order = SignedOrder::sign(order, &addr, 1, &ks).unwrap();

        let mut belief = Belief::empty();
        belief.orders.insert(addr.clone(), signed_order);

        let state = state_with_stake(&[(addr.clone(), 100)]);
        let outcome = merge(&addr, &belief, &state, &[], &NoopExecutor::new(), &NoopSlashing, &ctx).unwrap();

        assert_eq!(outcome.local_order.consensus_point, 1);
        assert_eq!(outcome.results.len(), 1);
        assert!(outcome.orders.is_empty());
    }

    #[test]
    fn minority_order_does_not_advance_consensus() {
        let (_d, ctx) = ctx();
        let (_dk1, ks1) = keystore();
        let (_dk2, ks2) = keystore();
        let p1 = PeerKey(ks1.public_key().to_vec());
        let p2 = PeerKey(ks2.public_key().to_vec());

        let order1 = Order::empty().propose(Block::new(1, p1.clone(), vec![]));
        let signed1 = SignedOrder::sign(order1, &p1, 1, &ks1).unwrap();
        let order2 = Order::empty();
        let signed2 = SignedOrder::sign(order2, &p2, 1, &ks2).unwrap();

        let mut belief = Belief::empty();
        belief.orders.insert(p1.clone(), signed1);
        belief.orders.insert(p2.clone(), signed2);

        // p1 has only 10 stake, p2 (which disagrees, at length 0) has 90: no
        // majority backs p1's length-1 prefix.
        let state = state_with_stake(&[(p1.clone(), 10), (p2.clone(), 90)]);
        let outcome = merge(&p1, &belief, &state, &[], &NoopExecutor::new(), &NoopSlashing, &ctx).unwrap();
        assert_eq!(outcome.local_order.consensus_point, 0);
    }

    #[test]
    fn invalid_remote_belief_signature_is_dropped() {
        let (_d, ctx) = ctx();
        let (_dk, ks) = keystore();
        let (_dk2, wrong_ks) = keystore();
        let addr = PeerKey(ks.public_key().to_vec());
        let wrong_signer = PeerKey(wrong_ks.public_key().to_vec());

        let belief = Belief::empty();
        // Signed by `ks` but asserted to be from `wrong_signer`: verification must fail.
        let signed_belief = SignedBelief::sign(Belief::empty(), 1, &ks).unwrap();

        let state = state_with_stake(&[(addr.clone(), 1)]);
        let outcome = merge(
            &addr,
            &belief,
            &state,
            &[(wrong_signer, signed_belief)],
            &NoopExecutor::new(),
            &NoopSlashing,
            &ctx,
        )
        .unwrap();
        assert!(outcome.orders.is_empty());
    }
}
