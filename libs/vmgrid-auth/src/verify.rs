// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Inbound agent request verification.
//!
//! Agents sign every request to the manager with their Ed25519 private
//! key. Four headers carry the proof:
//!
//! ```text
//! x-agent-id:  agent-1
//! x-timestamp: 1767225600          (unix seconds)
//! x-nonce:     4f1c...             (uuid, never reused)
//! x-signature: base64(ed25519 over the canonical string)
//! ```
//!
//! The canonical string is newline-joined with a trailing newline:
//!
//! ```text
//! METHOD\nPATH?QUERY\nTIMESTAMP\nNONCE\nRANGE\n
//! ```
//!
//! where RANGE is the `Range` header value or the empty string. The
//! timestamp window defends against replaying old captures; the nonce
//! cache defends against replays inside that window. Both caches are
//! process-local: the worst case after a restart is accepting a replay
//! that a fresh capture window would have allowed anyway.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::Engine;
use ed25519_dalek::pkcs8::DecodePublicKey;
use ed25519_dalek::{Signature, VerifyingKey};

use crate::error::{AuthError, RejectReason};
use crate::Clock;

/// Resolves an agent's public key PEM, typically from the Host record.
#[async_trait]
pub trait AgentKeyStore: Send + Sync {
    /// Returns the SPKI PEM for the agent, or `None` if the agent is
    /// unknown or has no key configured.
    async fn public_key_pem(&self, agent_id: &str) -> Option<String>;
}

/// Tunables for [`AgentVerifier`]. Defaults match production.
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// Maximum |now - timestamp| accepted, seconds.
    pub skew_secs: i64,
    /// How long a nonce is remembered per agent, seconds.
    pub nonce_retention_secs: i64,
    /// How long a resolved public key is cached, seconds.
    pub key_ttl_secs: i64,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            skew_secs: 60,
            nonce_retention_secs: 300,
            key_ttl_secs: 60,
        }
    }
}

/// The pieces of an inbound request that participate in verification.
#[derive(Debug, Clone)]
pub struct AgentRequest<'a> {
    pub method: &'a str,
    /// Path plus query string, exactly as signed (`/a/b?x=1`).
    pub path_and_query: &'a str,
    pub agent_id: &'a str,
    pub timestamp: &'a str,
    pub nonce: &'a str,
    /// Base64 signature header value.
    pub signature: &'a str,
    /// `Range` header value, empty string when absent.
    pub range: &'a str,
}

/// Build the exact byte sequence an agent signs.
pub fn canonical_string(
    method: &str,
    path_and_query: &str,
    timestamp: &str,
    nonce: &str,
    range: &str,
) -> String {
    format!("{method}\n{path_and_query}\n{timestamp}\n{nonce}\n{range}\n")
}

struct CachedKey {
    key: VerifyingKey,
    fetched_at: i64,
}

/// Verifies signed agent requests against keys from an injected store.
///
/// All mutable state (key cache, nonce sets) is owned by the verifier
/// instance rather than module globals, so each test gets a clean slate
/// and a deterministic clock.
pub struct AgentVerifier {
    keys: Arc<dyn AgentKeyStore>,
    clock: Arc<dyn Clock>,
    config: VerifierConfig,
    key_cache: Mutex<HashMap<String, CachedKey>>,
    /// agent id -> nonce -> first-seen unix seconds
    nonces: Mutex<HashMap<String, HashMap<String, i64>>>,
}

impl AgentVerifier {
    pub fn new(keys: Arc<dyn AgentKeyStore>, clock: Arc<dyn Clock>, config: VerifierConfig) -> Self {
        Self {
            keys,
            clock,
            config,
            key_cache: Mutex::new(HashMap::new()),
            nonces: Mutex::new(HashMap::new()),
        }
    }

    /// Verify one request. On success returns the agent id.
    ///
    /// Failures are logged with the concrete reason; the returned error
    /// renders uniformly.
    pub async fn verify(&self, req: &AgentRequest<'_>) -> Result<String, AuthError> {
        let result = self.verify_inner(req).await;
        if let Err(ref err) = result {
            tracing::warn!(
                agent_id = req.agent_id,
                path = req.path_and_query,
                reason = ?err.reason,
                "rejected agent request"
            );
        }
        result
    }

    async fn verify_inner(&self, req: &AgentRequest<'_>) -> Result<String, AuthError> {
        if req.agent_id.is_empty() || req.nonce.is_empty() {
            return Err(AuthError::new(RejectReason::MissingHeader));
        }

        // Timestamp freshness before anything stateful, so a stale
        // capture never pollutes the nonce cache.
        let ts: i64 = req
            .timestamp
            .parse()
            .map_err(|_| AuthError::new(RejectReason::BadTimestamp))?;
        let now = self.clock.now_unix();
        if (now - ts).abs() > self.config.skew_secs {
            return Err(AuthError::new(RejectReason::StaleTimestamp));
        }

        let key = self.resolve_key(req.agent_id, now).await?;

        self.check_and_record_nonce(req.agent_id, req.nonce, now)?;

        let sig_bytes = base64::engine::general_purpose::STANDARD
            .decode(req.signature)
            .map_err(|_| AuthError::new(RejectReason::BadSignature))?;
        let signature = Signature::from_slice(&sig_bytes)
            .map_err(|_| AuthError::new(RejectReason::BadSignature))?;

        let canonical = canonical_string(
            req.method,
            req.path_and_query,
            req.timestamp,
            req.nonce,
            req.range,
        );
        key.verify_strict(canonical.as_bytes(), &signature)
            .map_err(|_| AuthError::new(RejectReason::BadSignature))?;

        Ok(req.agent_id.to_string())
    }

    /// Resolve the agent's verifying key through the short-TTL cache.
    async fn resolve_key(&self, agent_id: &str, now: i64) -> Result<VerifyingKey, AuthError> {
        {
            let cache = self
                .key_cache
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(entry) = cache.get(agent_id) {
                if now - entry.fetched_at < self.config.key_ttl_secs {
                    return Ok(entry.key);
                }
            }
        }

        let pem = self
            .keys
            .public_key_pem(agent_id)
            .await
            .ok_or_else(|| AuthError::new(RejectReason::UnknownAgent))?;
        let key = VerifyingKey::from_public_key_pem(&pem)
            .map_err(|_| AuthError::new(RejectReason::BadKey))?;

        let mut cache = self
            .key_cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.insert(
            agent_id.to_string(),
            CachedKey {
                key,
                fetched_at: now,
            },
        );
        Ok(key)
    }

    /// Reject a reused nonce; otherwise record it. Expired entries are
    /// cleaned lazily on each call.
    fn check_and_record_nonce(
        &self,
        agent_id: &str,
        nonce: &str,
        now: i64,
    ) -> Result<(), AuthError> {
        let mut nonces = self
            .nonces
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let seen = nonces.entry(agent_id.to_string()).or_default();
        seen.retain(|_, first_seen| now - *first_seen < self.config.nonce_retention_secs);

        if seen.contains_key(nonce) {
            return Err(AuthError::new(RejectReason::ReplayedNonce));
        }
        seen.insert(nonce.to_string(), now);
        Ok(())
    }
}
