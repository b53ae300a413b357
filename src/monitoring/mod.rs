// Copyright (c) 2026 Concordia
// Licensed under the Apache License, Version 2.0

//! Observability: Prometheus metrics.

/// Consensus and connection gauges/counters.
pub mod metrics;
