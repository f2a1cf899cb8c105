// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Records the manager keeps about hosts and VMs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vmgrid_agent_api::NetworkRates;

/// Administrative state of a host.
///
/// Only `Active` hosts accept new VMs; the other two states park a host
/// without forgetting its inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostStatus {
    Active,
    Maintenance,
    Disabled,
}

/// A physical machine offering VM capacity through its agent.
///
/// The `*_available` fields are mutated only by the capacity ledger, via
/// the store's atomic reserve/release primitives. `0 <= available <= max`
/// holds for each resource at all times.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    /// Internal id; doubles as the agent id on signed inbound requests.
    pub id: String,
    /// Operator-facing numeric id.
    pub public_id: i64,
    pub name: String,
    /// Address the manager reaches the agent (and console relay) at.
    pub ip_local: String,
    pub agent_port: u16,

    pub vcpus_max: u32,
    /// MiB.
    pub ram_max: u64,
    /// GB.
    pub disk_max: u64,
    pub vcpus_available: u32,
    pub ram_available: u64,
    pub disk_available: u64,

    /// MAC prefix policy for VMs on this host, e.g. `"52:54:00"`.
    pub vms_mac_prefix: Option<String>,
    /// Default gateway handed to guests during formatting.
    pub vms_gateway: Option<String>,
    /// Ed25519 public key (SPKI PEM) this host's agent signs requests with.
    pub public_key: Option<String>,

    pub status: HostStatus,
}

/// The three quantities the ledger accounts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub vcpus: u32,
    /// MiB.
    pub ram: u64,
    /// GB.
    pub disk: u64,
}

/// Lifecycle state of a VM.
///
/// `Creating -> Operational` when no OS install was requested;
/// `Creating -> Formatting -> Operational` when one was, with
/// `Formatting -> Failed` on format/finalize failure or timeout.
/// `Operational` and `Failed` are terminal for provisioning; deletion
/// passes through `Deleting` and removes the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VmStatus {
    Creating,
    Formatting,
    Operational,
    Deleting,
    Failed,
}

/// A provisioned guest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualMachine {
    /// Internal row id; this is the id the agent knows the domain by.
    pub id: String,
    /// Operator-facing numeric id, unique across the grid.
    pub public_id: i64,
    pub name: String,
    pub host_id: String,

    pub vcpus: u32,
    /// MiB.
    pub ram: u64,
    /// GB.
    pub disk: u64,

    /// Guest address in CIDR form, e.g. `"10.0.0.5/24"`.
    pub ip_local: Option<String>,
    pub ip_public: Option<String>,
    pub mac: String,
    pub rates: NetworkRates,

    /// OS image requested at creation, if any.
    pub os_name: Option<String>,

    pub status: VmStatus,
    pub error_message: Option<String>,
    pub format_started_at: Option<DateTime<Utc>>,
    pub format_completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl VirtualMachine {
    /// The reservation this VM holds on its host.
    pub fn resources(&self) -> ResourceSpec {
        ResourceSpec {
            vcpus: self.vcpus,
            ram: self.ram,
            disk: self.disk,
        }
    }
}
