// Copyright (c) 2026 Concordia
// Licensed under the Apache License, Version 2.0

//! Challenge/response connection trust: `UNTRUSTED -> CHALLENGE_SENT ->
//! TRUSTED` (or permanently `UNTRUSTED`). The challenger signs a random
//! token under its own key, the responder signs the same token back under
//! its key, and the challenger accepts only a response whose token matches
//! what it sent and whose signer is the peer it expected.

#![forbid(unsafe_code)]

use crate::core::consensus::signing::challenge_signing_bytes;
use crate::core::security::keystore::{verify_pubkey_bytes, FileEd25519Backend, Keystore, KeystoreError};
use crate::core::types::PeerKey;
use crate::server::message::SignedToken;
use ring::rand::{SecureRandom, SystemRandom};

/// Tokens shorter than this are rejected as a forged/truncated challenge.
pub const MIN_TOKEN_LEN: usize = 120;

/// Per-connection handshake state, from the challenger's point of view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    /// No challenge outstanding; connection not yet trusted.
    Untrusted,
    /// Waiting on a `RESPONSE` echoing `token`, signed by `expected_peer`.
    ChallengeSent { token: Vec<u8>, expected_peer: PeerKey },
    /// Response verified; connection trusted.
    Trusted,
}

/// Handshake errors.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// Signing the outgoing token failed.
    #[error(transparent)]
    Keystore(#[from] KeystoreError),
    /// No challenge was outstanding when a `RESPONSE` arrived.
    #[error("no challenge outstanding")]
    NoChallengeOutstanding,
    /// The response's token does not match the outstanding challenge.
    #[error("token mismatch")]
    TokenMismatch,
    /// The response's signature did not verify against the expected peer.
    #[error("signature invalid")]
    InvalidSignature,
}

/// Generate a fresh random token and sign it, producing the `CHALLENGE`
/// payload and the state to track while awaiting a `RESPONSE`.
pub fn issue_challenge(
    keystore: &Keystore<FileEd25519Backend>,
    expected_peer: PeerKey,
) -> Result<(SignedToken, HandshakeState), HandshakeError> {
    let rng = SystemRandom::new();
    let mut token = vec![0u8; MIN_TOKEN_LEN];
    rng.fill(&mut token).map_err(|_| KeystoreError::Crypto)?;
    let signature = keystore.sign(&challenge_signing_bytes(&token))?;
    let state = HandshakeState::ChallengeSent { token: token.clone(), expected_peer };
    Ok((SignedToken { token, signature }, state))
}

/// Respond to an inbound `CHALLENGE`: sign the same token under our own
/// key, without regard to who sent it.
pub fn respond_to_challenge(
    keystore: &Keystore<FileEd25519Backend>,
    challenge: &SignedToken,
) -> Result<SignedToken, HandshakeError> {
    if challenge.token.len() < MIN_TOKEN_LEN {
        return Err(HandshakeError::TokenMismatch);
    }
    let signature = keystore.sign(&challenge_signing_bytes(&challenge.token))?;
    Ok(SignedToken { token: challenge.token.clone(), signature })
}

/// Process an inbound `RESPONSE` against the outstanding challenge state.
/// On success returns `HandshakeState::Trusted`; the caller installs it.
pub fn accept_response(state: &HandshakeState, response: &SignedToken) -> Result<HandshakeState, HandshakeError> {
    let (token, expected_peer) = match state {
        HandshakeState::ChallengeSent { token, expected_peer } => (token, expected_peer),
        _ => return Err(HandshakeError::NoChallengeOutstanding),
    };
    if &response.token != token {
        return Err(HandshakeError::TokenMismatch);
    }
    let pk = expected_peer.as_public_key_bytes().ok_or(HandshakeError::InvalidSignature)?;
    let bytes = challenge_signing_bytes(&response.token);
    verify_pubkey_bytes(&pk, &bytes, &response.signature).map_err(|_| HandshakeError::InvalidSignature)?;
    Ok(HandshakeState::Trusted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keystore() -> (tempfile::TempDir, Keystore<FileEd25519Backend>) {
        let dir = tempfile::tempdir().unwrap();
        let ks = Keystore::open(dir.path().to_str().unwrap()).unwrap();
        (dir, ks)
    }

    #[test]
    fn full_handshake_trusts_the_expected_peer() {
        let (_d1, challenger) = keystore();
        let (_d2, responder) = keystore();
        let responder_key = PeerKey(responder.public_key().to_vec());

        let (challenge, state) = issue_challenge(&challenger, responder_key).unwrap();
        let response = respond_to_challenge(&responder, &challenge).unwrap();
        let next = accept_response(&state, &response).unwrap();
        assert_eq!(next, HandshakeState::Trusted);
    }

    #[test]
    fn wrong_signer_is_rejected() {
        let (_d1, challenger) = keystore();
        let (_d2, responder) = keystore();
        let (_d3, impostor) = keystore();
        let responder_key = PeerKey(responder.public_key().to_vec());

        let (challenge, state) = issue_challenge(&challenger, responder_key).unwrap();
        // impostor signs the right token, but isn't the expected peer.
        let forged = respond_to_challenge(&impostor, &challenge).unwrap();
        assert!(accept_response(&state, &forged).is_err());
    }

    #[test]
    fn mismatched_token_is_rejected() {
        let (_d1, challenger) = keystore();
        let (_d2, responder) = keystore();
        let responder_key = PeerKey(responder.public_key().to_vec());

        let (_challenge, state) = issue_challenge(&challenger, responder_key).unwrap();
        let mut bogus = vec![0u8; MIN_TOKEN_LEN];
        bogus[0] = 1;
        let signature = responder.sign(&challenge_signing_bytes(&bogus)).unwrap();
        let forged_response = SignedToken { token: bogus, signature };
        assert!(accept_response(&state, &forged_response).is_err());
    }
}
