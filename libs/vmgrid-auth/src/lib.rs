// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Authentication primitives for the vmgrid manager.
//!
//! Two independent trust boundaries live here:
//!
//! - **Inbound agent requests** ([`verify`]): host agents call back into
//!   the manager (today: OS image downloads) and prove themselves with a
//!   detached Ed25519 signature over a canonical string, plus a timestamp
//!   window and a nonce replay cache.
//! - **Console session tokens** ([`console_token`]): short-lived sealed
//!   capabilities minted when an operator opens a VM console, carried by
//!   the browser to the WebSocket tunnel, and opened only with the
//!   manager's private key.
//!
//! Both take their time source through the [`Clock`] trait so tests can
//! drive expiry and retention windows deterministically.

pub mod console_token;
mod error;
pub mod verify;

pub use console_token::{ConsoleClaims, ConsoleTokenCodec, CONSOLE_AUDIENCE, CONSOLE_TOKEN_TYPE};
pub use error::{AuthError, RejectReason, TokenError};
pub use verify::{AgentKeyStore, AgentRequest, AgentVerifier, VerifierConfig, canonical_string};

use std::sync::Arc;

/// Injectable time source (unix seconds).
pub trait Clock: Send + Sync {
    fn now_unix(&self) -> i64;
}

/// Wall-clock [`Clock`] used outside of tests.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Convenience constructor for the common case.
pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}
