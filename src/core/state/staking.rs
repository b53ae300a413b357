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

//! Deterministic bonding/unbonding/slashing ledger feeding `PeerStatus.stake`.
//!
//! Each peer bonds stake to itself (there is no separate delegator/validator
//! split in this system, only peers): bonding raises the figure consensus
//! merge weighs an `Order` by, unbonding is time-locked, and slashing is a
//! policy hook the belief-merge layer can call on a peer whose belief carried
//! an invalid signature. Kept a plain in-memory ledger rather than folded
//! into `State` itself, since unlike accounts and peers it is not part of
//! the content-addressed consensus state — the resulting stake figures are
//! written into `PeerStatus.stake` by whoever applies a ledger change.

use crate::core::types::PeerKey;
use std::collections::BTreeMap;
use thiserror::Error;

const SECONDS_PER_DAY: u64 = 86_400;
const MIN_UNBONDING_DAYS: u64 = 7;

/// Staking ledger errors.
#[derive(Debug, Error)]
pub enum StakingError {
    /// A zero bond/unbond amount was requested.
    #[error("invalid amount")]
    InvalidAmount,
    /// Tried to unbond more than is currently bonded.
    #[error("insufficient stake")]
    InsufficientStake,
}

/// A still-locked unbonding request.
#[derive(Clone, Debug)]
pub struct UnbondingEntry {
    /// Amount being released.
    pub amount: u128,
    /// Unix-seconds timestamp at which this entry matures.
    pub unlock_time: u64,
}

/// Deterministic self-bond ledger, keyed by peer.
#[derive(Clone, Debug, Default)]
pub struct StakingLedger {
    /// Currently bonded (active) stake per peer.
    pub bonded: BTreeMap<PeerKey, u128>,
    /// Pending unbonding entries per peer.
    pub unbonding: BTreeMap<PeerKey, Vec<UnbondingEntry>>,
    /// Cumulative amount slashed from each peer, for audit/reporting.
    pub slashed: BTreeMap<PeerKey, u128>,
}

impl StakingLedger {
    /// Bond `amount` to `peer`.
    pub fn bond(&mut self, peer: PeerKey, amount: u128) -> Result<(), StakingError> {
        if amount == 0 {
            return Err(StakingError::InvalidAmount);
        }
        let entry = self.bonded.entry(peer).or_insert(0);
        *entry = entry.saturating_add(amount);
        Ok(())
    }

    /// Start unbonding `amount` from `peer`, maturing `MIN_UNBONDING_DAYS`
    /// after `now_unix`.
    pub fn begin_unbond(&mut self, peer: PeerKey, amount: u128, now_unix: u64) -> Result<(), StakingError> {
        if amount == 0 {
            return Err(StakingError::InvalidAmount);
        }
        let current = self.bonded.get(&peer).copied().unwrap_or(0);
        if current < amount {
            return Err(StakingError::InsufficientStake);
        }
        self.bonded.insert(peer.clone(), current - amount);
        let unlock_time = now_unix.saturating_add(MIN_UNBONDING_DAYS.saturating_mul(SECONDS_PER_DAY));
        self.unbonding.entry(peer).or_default().push(UnbondingEntry { amount, unlock_time });
        Ok(())
    }

    /// Release every unbonding entry for `peer` that has matured by
    /// `now_unix`, returning the total released.
    pub fn finalize_unbond(&mut self, peer: &PeerKey, now_unix: u64) -> u128 {
        let Some(list) = self.unbonding.get_mut(peer) else {
            return 0;
        };
        let mut released = 0u128;
        list.retain(|e| {
            if now_unix >= e.unlock_time {
                released = released.saturating_add(e.amount);
                false
            } else {
                true
            }
        });
        released
    }

    /// Slash `peer`'s bonded stake by `fraction_bps` (basis points, capped
    /// at 10000), returning the amount removed.
    pub fn slash(&mut self, peer: &PeerKey, fraction_bps: u16) -> u128 {
        let frac = fraction_bps.min(10_000) as u128;
        let Some(current) = self.bonded.get(peer).copied() else {
            return 0;
        };
        let cut = current.saturating_mul(frac) / 10_000u128;
        self.bonded.insert(peer.clone(), current - cut);
        *self.slashed.entry(peer.clone()).or_insert(0) += cut;
        cut
    }

    /// Current bonded stake for `peer`.
    pub fn stake_of(&self, peer: &PeerKey) -> u128 {
        self.bonded.get(peer).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(b: u8) -> PeerKey {
        PeerKey(vec![b; 32])
    }

    #[test]
    fn bond_raises_stake() {
        let mut ledger = StakingLedger::default();
        ledger.bond(peer(1), 100).unwrap();
        ledger.bond(peer(1), 50).unwrap();
        assert_eq!(ledger.stake_of(&peer(1)), 150);
    }

    #[test]
    fn unbond_then_finalize_after_maturity() {
        let mut ledger = StakingLedger::default();
        ledger.bonded.insert(peer(1), 500);
        ledger.begin_unbond(peer(1), 200, 0).unwrap();
        assert_eq!(ledger.stake_of(&peer(1)), 300);
        assert_eq!(ledger.finalize_unbond(&peer(1), 0), 0);
        let matured = 8 * 86_400;
        assert_eq!(ledger.finalize_unbond(&peer(1), matured), 200);
        assert_eq!(ledger.finalize_unbond(&peer(1), matured), 0);
    }

    #[test]
    fn insufficient_stake_rejected() {
        let mut ledger = StakingLedger::default();
        ledger.bonded.insert(peer(1), 10);
        assert!(matches!(ledger.begin_unbond(peer(1), 20, 0), Err(StakingError::InsufficientStake)));
    }

    #[test]
    fn slash_moves_stake_to_slashed() {
        let mut ledger = StakingLedger::default();
        ledger.bonded.insert(peer(1), 1000);
        let cut = ledger.slash(&peer(1), 2_500);
        assert_eq!(cut, 250);
        assert_eq!(ledger.stake_of(&peer(1)), 750);
        assert_eq!(ledger.slashed.get(&peer(1)).copied().unwrap(), 250);
    }
}
