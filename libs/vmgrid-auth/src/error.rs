// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Error types for vmgrid-auth.

use thiserror::Error;

/// Why an agent request was rejected.
///
/// The reason is kept for internal logging and tests; the externally
/// visible error message is uniform so a probing caller cannot learn
/// which check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// One of the four required headers was absent or not valid UTF-8.
    MissingHeader,
    /// No host record carries this agent id (or it has no public key).
    UnknownAgent,
    /// The stored public key did not parse as an Ed25519 SPKI PEM.
    BadKey,
    /// The timestamp header was not a finite integer.
    BadTimestamp,
    /// The timestamp fell outside the allowed skew window.
    StaleTimestamp,
    /// The (agent, nonce) pair was already seen within the retention
    /// window.
    ReplayedNonce,
    /// The signature did not decode or did not verify.
    BadSignature,
}

/// Agent authentication failure.
///
/// `Display` is deliberately constant regardless of the reason.
#[derive(Debug, Error)]
#[error("agent authentication failed")]
pub struct AuthError {
    pub reason: RejectReason,
}

impl AuthError {
    pub fn new(reason: RejectReason) -> Self {
        Self { reason }
    }
}

/// Console session token failures.
#[derive(Debug, Error)]
pub enum TokenError {
    /// Token did not have the expected three-part shape or base64.
    #[error("malformed token")]
    Malformed,

    /// Key unwrap or payload decryption failed.
    #[error("token decryption failed")]
    Decrypt,

    /// The `exp` claim is in the past.
    #[error("token expired")]
    Expired,

    /// The `aud` claim did not match.
    #[error("wrong token audience")]
    WrongAudience,

    /// The `typ` claim did not match.
    #[error("wrong token type")]
    WrongType,

    /// A required claim was absent or empty.
    #[error("missing token claim: {0}")]
    MissingClaim(&'static str),

    /// Sealing failed (RSA encrypt or serialization).
    #[error("token sealing failed: {0}")]
    Seal(String),
}
