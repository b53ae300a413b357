// Copyright (c) 2026 Concordia
// Licensed under the Apache License, Version 2.0

//! The peer server: wire message framing, dispatch, client interest
//! tracking, the challenge handshake, and the receiver/updater/connector
//! worker loop.

/// Wire message kinds and the frame codec.
pub mod message;
/// Message dispatch: the per-kind action table driving state admission.
pub mod dispatch;
/// Client interest tracking: transaction/query id to waiting connection.
pub mod interests;
/// Challenge/response connection trust handshake.
pub mod handshake;
/// The receiver/updater/connector worker loop tying the above together.
pub mod run;
