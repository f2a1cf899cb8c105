// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Capacity accounting for hosts.
//!
//! The ledger is the only component allowed to touch a host's available
//! vcpu/ram/disk fields, and it does so exclusively through the store's
//! atomic primitives. `InsufficientCapacity` is a normal outcome here,
//! reported to the caller as a rejected request rather than a fault.

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::model::ResourceSpec;
use crate::store::{ReserveOutcome, Store, StoreError};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("host not found")]
    HostNotFound,

    #[error("insufficient capacity")]
    InsufficientCapacity,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Proof of a successful reservation; handed back to [`CapacityLedger::release`]
/// exactly once when the VM holding it goes away.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub host_id: String,
    pub spec: ResourceSpec,
}

#[derive(Clone)]
pub struct CapacityLedger {
    store: Arc<dyn Store>,
}

impl CapacityLedger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Check-and-reserve in one atomic store update. Two concurrent
    /// reservations against the same nearly-full host cannot both pass.
    pub async fn try_reserve(
        &self,
        host_id: &str,
        spec: ResourceSpec,
    ) -> Result<Reservation, LedgerError> {
        match self.store.try_reserve(host_id, &spec).await? {
            ReserveOutcome::Reserved => {
                debug!(host_id, vcpus = spec.vcpus, ram = spec.ram, disk = spec.disk, "reserved");
                Ok(Reservation {
                    host_id: host_id.to_string(),
                    spec,
                })
            }
            ReserveOutcome::Insufficient => Err(LedgerError::InsufficientCapacity),
            ReserveOutcome::UnknownHost => Err(LedgerError::HostNotFound),
        }
    }

    /// Give a reservation back. Callers release at most once per VM
    /// lifecycle; the store clamps at the maxima regardless.
    pub async fn release(&self, reservation: &Reservation) -> Result<(), LedgerError> {
        debug!(host_id = %reservation.host_id, "released");
        self.store
            .release(&reservation.host_id, &reservation.spec)
            .await?;
        Ok(())
    }
}
