// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Finalize polling.
//!
//! Once a format call is accepted, the agent installs the OS on its own
//! time and the manager polls `POST .../finalize` until it answers 200
//! (done), keeps answering 409 (still running), or the deadline passes.
//! Each in-flight poll loop is one tokio task, registered under a
//! (agent base URL, vm id) key; registering a key that is already live is
//! a no-op, so a VM never has two competing loops.
//!
//! Jobs are process-local and not persisted. A restart abandons them; the
//! startup sweep fails any VM still in `Formatting` so nothing is left
//! pending forever.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use vmgrid_agent_client::{AgentClient, FinalizeOutcome};

use crate::model::VmStatus;
use crate::store::Store;

/// One poll loop's identity: which agent is being asked about which VM.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobKey {
    pub agent_base_url: String,
    pub vm_id: String,
}

/// Poll schedule. The defaults match production; tests shrink them to
/// milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct PollerConfig {
    /// Quiet period before the first poll - formatting needs warm-up time.
    pub initial_delay: Duration,
    /// Fixed interval between subsequent polls.
    pub interval: Duration,
    /// Absolute deadline measured from registration.
    pub deadline: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(15),
            interval: Duration::from_secs(5),
            deadline: Duration::from_secs(600),
        }
    }
}

pub struct FinalizePoller {
    store: Arc<dyn Store>,
    config: PollerConfig,
    jobs: Mutex<HashMap<JobKey, JoinHandle<()>>>,
}

impl FinalizePoller {
    pub fn new(store: Arc<dyn Store>, config: PollerConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            jobs: Mutex::new(HashMap::new()),
        })
    }

    fn lock_jobs(&self) -> std::sync::MutexGuard<'_, HashMap<JobKey, JoinHandle<()>>> {
        self.jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start polling `vm_id` on `client`'s agent. Returns false when a
    /// live job already exists for the key; the check and the insert
    /// happen under one lock so concurrent registrations cannot
    /// double-schedule.
    pub fn register(self: &Arc<Self>, client: AgentClient, vm_id: String) -> bool {
        let key = JobKey {
            agent_base_url: client.base_url().to_string(),
            vm_id: vm_id.clone(),
        };
        let mut jobs = self.lock_jobs();
        if let Some(handle) = jobs.get(&key) {
            if !handle.is_finished() {
                debug!(vm_id, "finalize job already registered");
                return false;
            }
        }
        info!(vm_id, agent = %key.agent_base_url, "registering finalize job");
        let poller = Arc::clone(self);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            poller.poll_loop(client, &task_key.vm_id).await;
            poller.lock_jobs().remove(&task_key);
        });
        jobs.insert(key, handle);
        true
    }

    /// Stop a job and forget it. Used when a deletion races a poll;
    /// aborting does not disturb the agent, only our schedule.
    pub fn cancel(&self, key: &JobKey) {
        if let Some(handle) = self.lock_jobs().remove(key) {
            debug!(vm_id = %key.vm_id, "cancelling finalize job");
            handle.abort();
        }
    }

    /// Number of live jobs (tests).
    pub fn job_count(&self) -> usize {
        let mut jobs = self.lock_jobs();
        jobs.retain(|_, handle| !handle.is_finished());
        jobs.len()
    }

    /// Fail any VM left in `Formatting` by a previous process: its job
    /// died with that process and will never complete the row.
    pub async fn startup_sweep(&self) {
        let orphans = match self.store.vms_in_status(VmStatus::Formatting).await {
            Ok(vms) => vms,
            Err(e) => {
                warn!(error = %e, "startup sweep could not list formatting VMs");
                return;
            }
        };
        for vm in orphans {
            warn!(vm_id = %vm.id, public_id = vm.public_id, "failing VM orphaned in FORMATTING");
            if let Err(e) = self
                .store
                .mark_failed(&vm.id, "formatting interrupted by manager restart")
                .await
            {
                warn!(vm_id = %vm.id, error = %e, "startup sweep update failed");
            }
        }
    }

    /// The poll loop for one VM. Sequential by construction: the next
    /// attempt is only scheduled after the previous result is known.
    /// Every row update tolerates the row having been deleted meanwhile.
    async fn poll_loop(&self, client: AgentClient, vm_id: &str) {
        let started = Instant::now();
        tokio::time::sleep(self.config.initial_delay).await;
        loop {
            if started.elapsed() >= self.config.deadline {
                warn!(vm_id, "finalize deadline elapsed");
                self.fail_vm(vm_id, "formatting timed out waiting for finalize")
                    .await;
                return;
            }
            match client.finalize_vm(vm_id).await {
                Ok(FinalizeOutcome::Done) => {
                    info!(vm_id, "finalize complete");
                    match self.store.mark_operational(vm_id, Some(Utc::now())).await {
                        Ok(true) => {}
                        Ok(false) => debug!(vm_id, "finalized VM no longer exists"),
                        Err(e) => warn!(vm_id, error = %e, "could not mark VM operational"),
                    }
                    return;
                }
                Ok(FinalizeOutcome::InProgress) => {
                    debug!(vm_id, "finalize still in progress");
                    tokio::time::sleep(self.config.interval).await;
                }
                Err(e) => {
                    warn!(vm_id, error = %e, "finalize poll failed");
                    self.fail_vm(vm_id, &format!("finalize failed: {e}")).await;
                    return;
                }
            }
        }
    }

    async fn fail_vm(&self, vm_id: &str, message: &str) {
        match self.store.mark_failed(vm_id, message).await {
            Ok(true) => {}
            Ok(false) => debug!(vm_id, "failed VM no longer exists"),
            Err(e) => warn!(vm_id, error = %e, "could not mark VM failed"),
        }
    }
}
