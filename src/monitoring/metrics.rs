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

//! Prometheus metrics for the peer's consensus and connection state.

use prometheus::{IntCounter, IntGauge, Registry};
use thiserror::Error;

/// Metrics errors.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Metric construction or registration failed.
    #[error("prometheus")]
    Prom,
}

/// Metrics container, one instance per running peer.
#[derive(Clone)]
pub struct Metrics {
    /// Registry every gauge/counter below is registered against.
    pub registry: Registry,

    /// Trusted connection count.
    pub connected_peers: IntGauge,
    /// Local order's consensus point (blocks executed so far).
    pub consensus_point: IntGauge,
    /// Local order's proposal point (blocks proposed so far).
    pub proposal_point: IntGauge,
    /// Current `State.timestamp_ms`.
    pub state_timestamp_ms: IntGauge,
    /// Transactions admitted into a proposed block, cumulative.
    pub transactions_total: IntCounter,
    /// Belief-merge passes run, cumulative.
    pub merges_total: IntCounter,
    /// Messages currently parked awaiting missing data.
    pub parked_messages: IntGauge,
    /// Client interests currently awaiting a transaction result.
    pub pending_interests: IntGauge,

    /// Dropped replay/duplicate messages.
    pub replay_dropped_total: IntCounter,
    /// Invalid decoded messages.
    pub invalid_msg_total: IntCounter,
    /// Rate-limited messages.
    pub rate_limited_total: IntCounter,
    /// Connections closed for misbehavior.
    pub banned_total: IntCounter,
}

macro_rules! gauge {
    ($registry:expr, $name:expr, $help:expr) => {{
        let g = IntGauge::new($name, $help).map_err(|_| MetricsError::Prom)?;
        $registry.register(Box::new(g.clone())).map_err(|_| MetricsError::Prom)?;
        g
    }};
}

macro_rules! counter {
    ($registry:expr, $name:expr, $help:expr) => {{
        let c = IntCounter::new($name, $help).map_err(|_| MetricsError::Prom)?;
        $registry.register(Box::new(c.clone())).map_err(|_| MetricsError::Prom)?;
        c
    }};
}

impl Metrics {
    /// Create and register every metric against a fresh registry.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let connected_peers = gauge!(registry, "concordia_connected_peers", "Trusted connection count");
        let consensus_point = gauge!(registry, "concordia_consensus_point", "Local order consensus point");
        let proposal_point = gauge!(registry, "concordia_proposal_point", "Local order proposal point");
        let state_timestamp_ms = gauge!(registry, "concordia_state_timestamp_ms", "Current state timestamp");
        let transactions_total = counter!(registry, "concordia_transactions_total", "Transactions admitted into a block");
        let merges_total = counter!(registry, "concordia_merges_total", "Belief-merge passes run");
        let parked_messages = gauge!(registry, "concordia_parked_messages", "Messages parked on missing data");
        let pending_interests = gauge!(registry, "concordia_pending_interests", "Client interests awaiting a result");

        let replay_dropped_total = counter!(registry, "concordia_replay_dropped_total", "Dropped replay/duplicate messages");
        let invalid_msg_total = counter!(registry, "concordia_invalid_msg_total", "Invalid decoded messages");
        let rate_limited_total = counter!(registry, "concordia_rate_limited_total", "Rate-limited messages");
        let banned_total = counter!(registry, "concordia_banned_total", "Connections closed for misbehavior");

        Ok(Self {
            registry,
            connected_peers,
            consensus_point,
            proposal_point,
            state_timestamp_ms,
            transactions_total,
            merges_total,
            parked_messages,
            pending_interests,
            replay_dropped_total,
            invalid_msg_total,
            rate_limited_total,
            banned_total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_registers_every_metric_once() {
        let m = Metrics::new().unwrap();
        assert!(!m.registry.gather().is_empty());
    }
}
