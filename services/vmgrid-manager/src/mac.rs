// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! MAC address derivation for new VMs.
//!
//! A host may pin a MAC prefix (one to three colon-separated hex octet
//! groups); without one, new MACs start with [`DEFAULT_FIRST_OCTET`]. An
//! invalid host prefix is an operator misconfiguration and must be caught
//! before any remote call is made.

use rand::Rng;
use thiserror::Error;

/// First octet used when the host defines no prefix policy. Locally
/// administered, unicast.
pub const DEFAULT_FIRST_OCTET: &str = "52";

const MAC_OCTETS: usize = 6;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MacPrefixError {
    #[error("mac prefix must be 1-3 colon-separated hex octet groups, got {0:?}")]
    BadShape(String),

    #[error("mac prefix group {0:?} is not a two-digit hex octet")]
    BadGroup(String),

    #[error("mac prefix first octet must not be {0:?}")]
    ForbiddenFirstOctet(String),
}

/// Validate a host's MAC prefix policy and return its octets.
pub fn validate_prefix(prefix: &str) -> Result<Vec<String>, MacPrefixError> {
    let groups: Vec<&str> = prefix.split(':').collect();
    if groups.is_empty() || groups.len() > 3 {
        return Err(MacPrefixError::BadShape(prefix.to_string()));
    }
    let mut octets = Vec::with_capacity(groups.len());
    for group in groups {
        if group.len() != 2 || !group.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(MacPrefixError::BadGroup(group.to_string()));
        }
        octets.push(group.to_ascii_lowercase());
    }
    // 00:... collides with conventional infrastructure OUIs and ff leads
    // the broadcast address.
    if octets[0] == "00" || octets[0] == "ff" {
        return Err(MacPrefixError::ForbiddenFirstOctet(octets[0].clone()));
    }
    Ok(octets)
}

/// Derive a full MAC from the host's optional prefix policy, filling the
/// remaining octets randomly.
pub fn generate(prefix: Option<&str>) -> Result<String, MacPrefixError> {
    let mut octets = match prefix {
        Some(p) => validate_prefix(p)?,
        None => vec![DEFAULT_FIRST_OCTET.to_string()],
    };
    let mut rng = rand::rng();
    while octets.len() < MAC_OCTETS {
        octets.push(format!("{:02x}", rng.random_range(0..=255u16)));
    }
    Ok(octets.join(":"))
}
