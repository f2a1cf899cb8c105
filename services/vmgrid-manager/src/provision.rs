// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! The provisioning orchestrator.
//!
//! Drives the full create -> (format) -> operational workflow for one VM,
//! coordinating the local ledger and store with remote agent calls. The
//! ordering rule throughout: never release capacity or delete the local
//! record before the corresponding remote side-effect is confirmed, so a
//! host's resources can never be handed to two VMs at once.
//!
//! Compensation per failing step:
//!
//! | failing step               | undo, in order                         |
//! |----------------------------|----------------------------------------|
//! | duplicate id check         | release reservation                    |
//! | MAC derivation             | release reservation                    |
//! | remote create              | delete local row, release reservation  |
//! | image resolve, remote fmt  | remote delete; if it succeeds, release |
//! |                            | and delete row; if it fails, delete    |
//! |                            | row but keep capacity reserved         |
//!
//! A failed remote create holds nothing on the host, so its reservation
//! is released. A failed format may leave a half-built guest behind, so
//! capacity is only released once the compensating remote delete
//! confirms the guest is gone; otherwise the capacity stays reserved
//! (orphaned-but-safe) rather than risk double-allocation.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;
use vmgrid_agent_api::{
    CreateVmBody, FormatNetwork, FormatVmBody, HostProvision, NetworkRates, OsSource, VmSpec,
};
use vmgrid_agent_client::AgentClient;

use crate::error::ProvisionError;
use crate::finalize::{FinalizePoller, JobKey};
use crate::images::ImageCatalog;
use crate::ledger::{CapacityLedger, Reservation};
use crate::mac;
use crate::model::{Host, HostStatus, ResourceSpec, VirtualMachine, VmStatus};
use crate::store::Store;

/// DNS servers handed to guests that get a static network layout.
const DEFAULT_DNS: [&str; 2] = ["1.1.1.1", "8.8.8.8"];

/// An operator's request to provision one VM.
#[derive(Debug, Clone)]
pub struct CreateVmRequest {
    pub public_id: i64,
    pub name: String,
    pub host_public_id: i64,
    pub vcpus: u32,
    /// MiB.
    pub ram: u64,
    /// GB.
    pub disk: u64,
    /// Guest address in CIDR form.
    pub ip_local: Option<String>,
    pub ip_public: Option<String>,
    pub rates: NetworkRates,
    /// OS image to install; `None` means the VM is handed over bare.
    pub os_name: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssh_public_key: Option<String>,
}

/// How a create request ended.
#[derive(Debug)]
pub enum CreateOutcome {
    /// No OS install was requested; the VM is ready now.
    Operational(VirtualMachine),
    /// Formatting was accepted by the agent and the finalize poller owns
    /// the VM until it reaches a terminal status.
    Formatting(VirtualMachine),
}

impl CreateOutcome {
    pub fn vm(&self) -> &VirtualMachine {
        match self {
            CreateOutcome::Operational(vm) | CreateOutcome::Formatting(vm) => vm,
        }
    }
}

pub struct Orchestrator {
    store: Arc<dyn Store>,
    ledger: CapacityLedger,
    images: Arc<dyn ImageCatalog>,
    poller: Arc<FinalizePoller>,
    http: reqwest::Client,
    /// Base URL agents use to reach this manager's image routes.
    public_base_url: String,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        ledger: CapacityLedger,
        images: Arc<dyn ImageCatalog>,
        poller: Arc<FinalizePoller>,
        http: reqwest::Client,
        public_base_url: impl Into<String>,
    ) -> Self {
        let mut public_base_url = public_base_url.into();
        while public_base_url.ends_with('/') {
            public_base_url.pop();
        }
        Self {
            store,
            ledger,
            images,
            poller,
            http,
            public_base_url,
        }
    }

    fn agent(&self, host: &Host) -> AgentClient {
        AgentClient::for_host(&host.ip_local, host.agent_port, self.http.clone())
    }

    pub async fn create_vm(&self, req: CreateVmRequest) -> Result<CreateOutcome, ProvisionError> {
        let host = self
            .store
            .host_by_public_id(req.host_public_id)
            .await?
            .ok_or(ProvisionError::HostNotFound)?;
        if host.status != HostStatus::Active {
            return Err(ProvisionError::HostNotActive);
        }

        let spec = ResourceSpec {
            vcpus: req.vcpus,
            ram: req.ram,
            disk: req.disk,
        };
        let reservation = self.ledger.try_reserve(&host.id, spec).await?;

        if self.fetch_by_public_id(req.public_id).await?.is_some() {
            self.undo_reservation(&reservation).await;
            return Err(ProvisionError::DuplicateId(req.public_id));
        }

        // MAC policy problems are operator misconfiguration and abort
        // before any remote call.
        let mac = match mac::generate(host.vms_mac_prefix.as_deref()) {
            Ok(mac) => mac,
            Err(e) => {
                self.undo_reservation(&reservation).await;
                return Err(ProvisionError::Configuration(e.to_string()));
            }
        };

        let vm = VirtualMachine {
            id: Uuid::new_v4().to_string(),
            public_id: req.public_id,
            name: req.name.clone(),
            host_id: host.id.clone(),
            vcpus: req.vcpus,
            ram: req.ram,
            disk: req.disk,
            ip_local: req.ip_local.clone(),
            ip_public: req.ip_public.clone(),
            mac: mac.clone(),
            rates: req.rates.clone(),
            os_name: req.os_name.clone(),
            status: VmStatus::Creating,
            error_message: None,
            format_started_at: None,
            format_completed_at: None,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.insert_vm(vm.clone()).await {
            self.undo_reservation(&reservation).await;
            return Err(e.into());
        }
        info!(vm_id = %vm.id, public_id = vm.public_id, host = %host.name, "creating VM");

        let client = self.agent(&host);
        if let Err(e) = client
            .create_vm(&CreateVmBody {
                vm_id: vm.id.clone(),
                vm: VmSpec {
                    vcpus: req.vcpus,
                    memory: req.ram,
                    disk_size: req.disk,
                    network: req.rates.clone(),
                    mac,
                },
            })
            .await
        {
            warn!(vm_id = %vm.id, error = %e, "agent create failed");
            self.compensate_create_failure(&vm.id, &reservation).await;
            return Err(ProvisionError::AgentCreate(e));
        }

        let Some(os_name) = req.os_name.clone() else {
            self.store.mark_operational(&vm.id, None).await?;
            info!(vm_id = %vm.id, "VM operational (no OS install)");
            let vm = self.refreshed(vm).await?;
            return Ok(CreateOutcome::Operational(vm));
        };

        let image = match self.images.resolve(&os_name).await {
            Ok(image) => image,
            Err(e) => {
                warn!(vm_id = %vm.id, os = %os_name, error = %e, "image resolution failed");
                self.compensate_format_failure(&client, &vm.id, &reservation)
                    .await;
                return Err(e.into());
            }
        };

        self.store.mark_formatting(&vm.id, Utc::now()).await?;
        let body = FormatVmBody {
            mode: image.mode,
            vm_id: vm.id.clone(),
            host: req.username.as_ref().map(|username| HostProvision {
                hostname: req.name.clone(),
                username: username.clone(),
                password: req.password.clone(),
                public_key: req.ssh_public_key.clone(),
            }),
            network: match (&req.ip_local, &host.vms_gateway) {
                (Some(ip_cidr), Some(gateway)) => Some(FormatNetwork {
                    mac_address: vm.mac.clone(),
                    ip_cidr: ip_cidr.clone(),
                    gateway: gateway.clone(),
                    dns_servers: DEFAULT_DNS.iter().map(|s| s.to_string()).collect(),
                }),
                _ => None,
            },
            os: OsSource {
                os_name: image.os_name.clone(),
                os_url: format!(
                    "{}/api/v1/agent/images/{}/download",
                    self.public_base_url, image.os_name
                ),
                os_checksum: Some(image.sha256.clone()),
            },
        };
        if let Err(e) = client.format_vm(&vm.id, &body).await {
            warn!(vm_id = %vm.id, error = %e, "agent format failed");
            self.compensate_format_failure(&client, &vm.id, &reservation)
                .await;
            return Err(ProvisionError::AgentFormat(e));
        }

        self.poller.register(client, vm.id.clone());
        info!(vm_id = %vm.id, os = %os_name, "formatting accepted, finalize poll registered");
        let vm = self.refreshed(vm).await?;
        Ok(CreateOutcome::Formatting(vm))
    }

    /// Remote-first deletion: the agent must confirm the guest is gone
    /// before anything local changes. A failed remote delete leaves the
    /// row and the reservation exactly as they were.
    pub async fn delete_vm(&self, public_id: i64) -> Result<(), ProvisionError> {
        let vm = self
            .fetch_by_public_id(public_id)
            .await?
            .ok_or(ProvisionError::NotFound)?;
        let host = self
            .store
            .host_by_id(&vm.host_id)
            .await?
            .ok_or_else(|| ProvisionError::Configuration("VM's host record is missing".into()))?;

        let client = self.agent(&host);
        client
            .delete_vm(&vm.id)
            .await
            .map_err(ProvisionError::AgentDelete)?;

        self.poller.cancel(&JobKey {
            agent_base_url: client.base_url().to_string(),
            vm_id: vm.id.clone(),
        });
        self.store.mark_deleting(&vm.id).await?;
        self.ledger
            .release(&Reservation {
                host_id: vm.host_id.clone(),
                spec: vm.resources(),
            })
            .await?;
        self.store.delete_vm(&vm.id).await?;
        info!(vm_id = %vm.id, public_id, "VM deleted");
        Ok(())
    }

    async fn fetch_by_public_id(
        &self,
        public_id: i64,
    ) -> Result<Option<VirtualMachine>, ProvisionError> {
        Ok(self.store.vm_by_public_id(public_id).await?)
    }

    async fn refreshed(&self, vm: VirtualMachine) -> Result<VirtualMachine, ProvisionError> {
        Ok(self.store.vm_by_id(&vm.id).await?.unwrap_or(vm))
    }

    async fn undo_reservation(&self, reservation: &Reservation) {
        if let Err(e) = self.ledger.release(reservation).await {
            warn!(host_id = %reservation.host_id, error = %e, "could not release reservation");
        }
    }

    /// The agent reported the create failed, so it holds nothing: drop
    /// the row and give the capacity back.
    async fn compensate_create_failure(&self, vm_id: &str, reservation: &Reservation) {
        if let Err(e) = self.store.delete_vm(vm_id).await {
            warn!(vm_id, error = %e, "could not remove row after create failure");
        }
        self.undo_reservation(reservation).await;
    }

    /// A format-path failure may leave a half-built guest on the host.
    /// Ask the agent to delete it; capacity is released only once that
    /// delete succeeds, otherwise it stays reserved for the guest the
    /// host may still hold.
    async fn compensate_format_failure(
        &self,
        client: &AgentClient,
        vm_id: &str,
        reservation: &Reservation,
    ) {
        match client.delete_vm(vm_id).await {
            Ok(()) => self.undo_reservation(reservation).await,
            Err(e) => {
                warn!(vm_id, error = %e, "compensating delete failed, capacity stays reserved");
            }
        }
        if let Err(e) = self.store.delete_vm(vm_id).await {
            warn!(vm_id, error = %e, "could not remove row after format failure");
        }
    }
}
