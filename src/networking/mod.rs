#![forbid(unsafe_code)]
#![allow(missing_docs)]

//! Networking: the framed TCP connection manager and peer scoring.

/// Framed TCP transport and connection manager.
pub mod connection;
pub mod peer_score;
