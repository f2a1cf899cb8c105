// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Storage boundary for host and VM records.
//!
//! The [`Store`] trait states the queries the rest of the manager needs;
//! [`MemStore`] is the in-process implementation. The two capacity
//! primitives (`try_reserve`, `release`) must be atomic check-and-update
//! operations: `MemStore` gets that from holding its one mutex across the
//! check and the write, a SQL store would use a conditional `UPDATE`.
//! Nothing outside the ledger is allowed to call them.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::{Host, ResourceSpec, VirtualMachine, VmStatus};

/// Storage failure. `MemStore` never produces one; a durable backend
/// would map connection and transaction failures here.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Outcome of an atomic capacity reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved,
    Insufficient,
    UnknownHost,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_host(&self, host: Host) -> Result<(), StoreError>;
    async fn host_by_id(&self, id: &str) -> Result<Option<Host>, StoreError>;
    async fn host_by_public_id(&self, public_id: i64) -> Result<Option<Host>, StoreError>;
    async fn list_hosts(&self) -> Result<Vec<Host>, StoreError>;
    /// Next unused operator-facing host id.
    async fn next_host_public_id(&self) -> Result<i64, StoreError>;

    /// Atomically decrement the host's available capacity if every
    /// requested quantity fits. Ledger use only.
    async fn try_reserve(
        &self,
        host_id: &str,
        spec: &ResourceSpec,
    ) -> Result<ReserveOutcome, StoreError>;

    /// Increment the host's available capacity, clamped to the maxima.
    /// Ledger use only.
    async fn release(&self, host_id: &str, spec: &ResourceSpec) -> Result<(), StoreError>;

    async fn insert_vm(&self, vm: VirtualMachine) -> Result<(), StoreError>;
    async fn vm_by_id(&self, id: &str) -> Result<Option<VirtualMachine>, StoreError>;
    async fn vm_by_public_id(&self, public_id: i64) -> Result<Option<VirtualMachine>, StoreError>;
    async fn list_vms(&self) -> Result<Vec<VirtualMachine>, StoreError>;
    async fn vms_on_host(&self, host_id: &str) -> Result<Vec<VirtualMachine>, StoreError>;
    async fn vms_in_status(&self, status: VmStatus) -> Result<Vec<VirtualMachine>, StoreError>;
    /// Returns whether a row was removed.
    async fn delete_vm(&self, id: &str) -> Result<bool, StoreError>;

    /// Move a VM into `Formatting`, stamping the start time and clearing
    /// any previous completion/error. Returns false if the row is gone.
    async fn mark_formatting(
        &self,
        id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Move a VM into `Operational`, optionally stamping format
    /// completion. Returns false if the row is gone.
    async fn mark_operational(
        &self,
        id: &str,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError>;

    /// Move a VM into `Failed` with the stored error message. Returns
    /// false if the row is gone.
    async fn mark_failed(&self, id: &str, message: &str) -> Result<bool, StoreError>;

    /// Move a VM into `Deleting` ahead of its row being removed.
    async fn mark_deleting(&self, id: &str) -> Result<bool, StoreError>;
}

#[derive(Default)]
struct Tables {
    hosts: HashMap<String, Host>,
    vms: HashMap<String, VirtualMachine>,
}

/// In-memory [`Store`]. One mutex over both tables gives the atomicity
/// the capacity primitives require.
#[derive(Default)]
pub struct MemStore {
    tables: Mutex<Tables>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Store for MemStore {
    async fn insert_host(&self, host: Host) -> Result<(), StoreError> {
        self.lock().hosts.insert(host.id.clone(), host);
        Ok(())
    }

    async fn host_by_id(&self, id: &str) -> Result<Option<Host>, StoreError> {
        Ok(self.lock().hosts.get(id).cloned())
    }

    async fn host_by_public_id(&self, public_id: i64) -> Result<Option<Host>, StoreError> {
        Ok(self
            .lock()
            .hosts
            .values()
            .find(|h| h.public_id == public_id)
            .cloned())
    }

    async fn list_hosts(&self) -> Result<Vec<Host>, StoreError> {
        let mut hosts: Vec<Host> = self.lock().hosts.values().cloned().collect();
        hosts.sort_by_key(|h| h.public_id);
        Ok(hosts)
    }

    async fn next_host_public_id(&self) -> Result<i64, StoreError> {
        Ok(self
            .lock()
            .hosts
            .values()
            .map(|h| h.public_id)
            .max()
            .unwrap_or(0)
            + 1)
    }

    async fn try_reserve(
        &self,
        host_id: &str,
        spec: &ResourceSpec,
    ) -> Result<ReserveOutcome, StoreError> {
        let mut tables = self.lock();
        let Some(host) = tables.hosts.get_mut(host_id) else {
            return Ok(ReserveOutcome::UnknownHost);
        };
        if host.vcpus_available < spec.vcpus
            || host.ram_available < spec.ram
            || host.disk_available < spec.disk
        {
            return Ok(ReserveOutcome::Insufficient);
        }
        host.vcpus_available -= spec.vcpus;
        host.ram_available -= spec.ram;
        host.disk_available -= spec.disk;
        Ok(ReserveOutcome::Reserved)
    }

    async fn release(&self, host_id: &str, spec: &ResourceSpec) -> Result<(), StoreError> {
        let mut tables = self.lock();
        if let Some(host) = tables.hosts.get_mut(host_id) {
            host.vcpus_available = (host.vcpus_available + spec.vcpus).min(host.vcpus_max);
            host.ram_available = (host.ram_available + spec.ram).min(host.ram_max);
            host.disk_available = (host.disk_available + spec.disk).min(host.disk_max);
        }
        Ok(())
    }

    async fn insert_vm(&self, vm: VirtualMachine) -> Result<(), StoreError> {
        self.lock().vms.insert(vm.id.clone(), vm);
        Ok(())
    }

    async fn vm_by_id(&self, id: &str) -> Result<Option<VirtualMachine>, StoreError> {
        Ok(self.lock().vms.get(id).cloned())
    }

    async fn vm_by_public_id(&self, public_id: i64) -> Result<Option<VirtualMachine>, StoreError> {
        Ok(self
            .lock()
            .vms
            .values()
            .find(|vm| vm.public_id == public_id)
            .cloned())
    }

    async fn list_vms(&self) -> Result<Vec<VirtualMachine>, StoreError> {
        let mut vms: Vec<VirtualMachine> = self.lock().vms.values().cloned().collect();
        vms.sort_by_key(|vm| vm.public_id);
        Ok(vms)
    }

    async fn vms_on_host(&self, host_id: &str) -> Result<Vec<VirtualMachine>, StoreError> {
        let mut vms: Vec<VirtualMachine> = self
            .lock()
            .vms
            .values()
            .filter(|vm| vm.host_id == host_id)
            .cloned()
            .collect();
        vms.sort_by_key(|vm| vm.public_id);
        Ok(vms)
    }

    async fn vms_in_status(&self, status: VmStatus) -> Result<Vec<VirtualMachine>, StoreError> {
        Ok(self
            .lock()
            .vms
            .values()
            .filter(|vm| vm.status == status)
            .cloned()
            .collect())
    }

    async fn delete_vm(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.lock().vms.remove(id).is_some())
    }

    async fn mark_formatting(
        &self,
        id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.lock();
        let Some(vm) = tables.vms.get_mut(id) else {
            return Ok(false);
        };
        vm.status = VmStatus::Formatting;
        vm.format_started_at = Some(started_at);
        vm.format_completed_at = None;
        vm.error_message = None;
        Ok(true)
    }

    async fn mark_operational(
        &self,
        id: &str,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.lock();
        let Some(vm) = tables.vms.get_mut(id) else {
            return Ok(false);
        };
        vm.status = VmStatus::Operational;
        if completed_at.is_some() {
            vm.format_completed_at = completed_at;
        }
        vm.error_message = None;
        Ok(true)
    }

    async fn mark_failed(&self, id: &str, message: &str) -> Result<bool, StoreError> {
        let mut tables = self.lock();
        let Some(vm) = tables.vms.get_mut(id) else {
            return Ok(false);
        };
        vm.status = VmStatus::Failed;
        vm.error_message = Some(message.to_string());
        Ok(true)
    }

    async fn mark_deleting(&self, id: &str) -> Result<bool, StoreError> {
        let mut tables = self.lock();
        let Some(vm) = tables.vms.get_mut(id) else {
            return Ok(false);
        };
        vm.status = VmStatus::Deleting;
        Ok(true)
    }
}
