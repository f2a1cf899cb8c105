// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Wire types for the host-agent HTTP API.
//!
//! Every physical host runs an agent that actually creates, formats,
//! finalizes and deletes VMs. The manager talks to it over plain HTTP at
//! `http://{host.ip}:{host.agent_port}`. This crate holds the request and
//! response bodies plus the path helpers for that contract; the client
//! lives in `clients/vmgrid-agent-client`.
//!
//! ## Endpoints
//!
//! - `GET  /api/v1/health` - liveness probe
//! - `GET  /api/v1/info` - CPU/memory/disk summary
//! - `GET  /api/v1/vms` - list defined VMs
//! - `POST /api/v1/vms` - create a VM
//! - `GET  /api/v1/vms/{vm_id}/status` - current VM state
//! - `POST /api/v1/vms/{vm_id}/start|stop|restart` - power operations
//! - `POST /api/v1/vms/{vm_id}/format` - begin an OS install
//! - `POST /api/v1/vms/{vm_id}/finalize` - 200 done, 409 still running
//! - `DELETE /api/v1/vms/{vm_id}` - destroy a VM

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Path prefix shared by every agent endpoint.
pub const API_PREFIX: &str = "/api/v1";

/// Path for the health probe.
pub fn health_path() -> String {
    format!("{API_PREFIX}/health")
}

/// Path for the host info summary.
pub fn info_path() -> String {
    format!("{API_PREFIX}/info")
}

/// Path for listing or creating VMs.
pub fn vms_path() -> String {
    format!("{API_PREFIX}/vms")
}

/// Path for one VM (GET or DELETE).
pub fn vm_path(vm_id: &str) -> String {
    format!("{API_PREFIX}/vms/{vm_id}")
}

/// Path for a VM's status query.
pub fn vm_status_path(vm_id: &str) -> String {
    format!("{API_PREFIX}/vms/{vm_id}/status")
}

/// Path for a VM power operation (`start`, `stop`, `restart`).
pub fn vm_power_path(vm_id: &str, op: PowerOp) -> String {
    format!("{API_PREFIX}/vms/{vm_id}/{}", op.as_str())
}

/// Path for the format (OS install) operation.
pub fn vm_format_path(vm_id: &str) -> String {
    format!("{API_PREFIX}/vms/{vm_id}/format")
}

/// Path for the finalize poll.
pub fn vm_finalize_path(vm_id: &str) -> String {
    format!("{API_PREFIX}/vms/{vm_id}/finalize")
}

/// Power operations the agent supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerOp {
    Start,
    Stop,
    Restart,
}

impl PowerOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerOp::Start => "start",
            PowerOp::Stop => "stop",
            PowerOp::Restart => "restart",
        }
    }
}

/// Ingress/egress traffic shaping rates for a VM NIC, in Mbps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct NetworkRates {
    pub in_avg_mbps: u32,
    pub in_peak_mbps: u32,
    pub in_burst_mbps: u32,
    pub out_avg_mbps: u32,
    pub out_peak_mbps: u32,
    pub out_burst_mbps: u32,
}

/// Resource shape of the VM the agent should define.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct VmSpec {
    pub vcpus: u32,
    /// Memory in MiB.
    pub memory: u64,
    /// Disk size in GB.
    pub disk_size: u64,
    pub network: NetworkRates,
    /// Colon-separated MAC address assigned by the manager.
    pub mac: String,
}

/// Body of `POST /api/v1/vms`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CreateVmBody {
    /// The manager-side row id; the agent names the domain after it.
    pub vm_id: String,
    pub vm: VmSpec,
}

/// How the agent should install the OS image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum FormatMode {
    /// Cloud image + cloud-init seed.
    Cloud,
    /// Attach a live ISO.
    Iso,
}

/// Guest credentials for cloud-init provisioning.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HostProvision {
    pub hostname: String,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

/// Guest network layout handed to the agent for the install.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FormatNetwork {
    pub mac_address: String,
    pub ip_cidr: String,
    pub gateway: String,
    pub dns_servers: Vec<String>,
}

/// Where the agent fetches the OS image from.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct OsSource {
    pub os_name: String,
    /// URL the agent downloads the image from (the manager's
    /// agent-authenticated image route).
    pub os_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_checksum: Option<String>,
}

/// Body of `POST /api/v1/vms/{vm_id}/format`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FormatVmBody {
    pub mode: FormatMode,
    pub vm_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<HostProvision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<FormatNetwork>,
    pub os: OsSource,
}

/// Body of `POST /api/v1/vms/{vm_id}/finalize`. All fields optional; an
/// empty body is the common case.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct FinalizeVmBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed_iso_path: Option<String>,
    /// Defaults to true on the agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete_iso: Option<bool>,
}

/// Generic `{message}` reply the agent sends for mutating operations.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MessageReply {
    pub message: String,
}

/// Reply of `GET /api/v1/health`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HealthReply {
    pub status: String,
}

/// Reply of `GET /api/v1/vms/{vm_id}/status`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct VmStatusReply {
    pub status: String,
}

/// One entry of the VM listing.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct VmSummary {
    pub id: String,
    pub name: String,
    pub status: String,
}

/// Reply of `GET /api/v1/vms`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ListVmsReply {
    pub vms: Vec<VmSummary>,
}

/// CPU summary within the info reply.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CpuInfo {
    pub physical_cores: Option<u32>,
    pub logical_cpus: Option<u32>,
    pub total_percent: f64,
}

/// Memory summary within the info reply.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MemoryInfo {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub used_bytes: u64,
    pub percent_used: f64,
}

/// Root-filesystem disk summary within the info reply.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub percent_used: f64,
}

/// Reply of `GET /api/v1/info`.
///
/// The agent reports far more than this (per-NIC throughput, routes,
/// per-partition usage); unknown fields are ignored on deserialize so the
/// manager only depends on the summary it actually renders.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AgentInfoReply {
    pub cpu: CpuInfo,
    pub memory: MemoryInfo,
    pub disk_summary: DiskSummary,
}

/// Wrapper for the root disk usage in the info reply.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DiskSummary {
    pub root: DiskUsage,
}
