// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! HTTP client for one host agent.
//!
//! Wraps `reqwest` with the typed operations from `vmgrid-agent-api`. The
//! client deliberately does not retry anything: retry policy belongs to
//! callers, and today only the finalize poller retries (on its own fixed
//! schedule). A failed call surfaces as [`AgentError`] carrying the best
//! diagnostic available - the transport error, or the non-2xx status plus
//! whatever body text the agent returned - so the orchestration layer can
//! store it on the VM record verbatim.

use std::time::Duration;

use thiserror::Error;
use vmgrid_agent_api as api;
use vmgrid_agent_api::{
    AgentInfoReply, CreateVmBody, FinalizeVmBody, FormatVmBody, HealthReply, ListVmsReply,
    MessageReply, PowerOp, VmStatusReply, VmSummary,
};

/// Errors from a single agent call.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The request never completed (connect failure, timeout, bad DNS).
    #[error("agent unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    /// The agent answered with a status outside the expected range.
    #[error("agent returned {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },
}

impl AgentError {
    /// True when the failure was a client-side timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, AgentError::Transport(e) if e.is_timeout())
    }
}

/// Result of a finalize poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// 200: formatting is complete, the VM is usable.
    Done,
    /// 409: the install is still running, poll again later.
    InProgress,
}

/// Typed client for one agent at `http://{ip}:{agent_port}`.
#[derive(Clone)]
pub struct AgentClient {
    base_url: String,
    http: reqwest::Client,
}

impl AgentClient {
    /// Build a client for an agent base URL (no trailing slash).
    pub fn new(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into(),
            http,
        }
    }

    /// Build a client straight from a host's address and agent port.
    pub fn for_host(ip: &str, agent_port: u16, http: reqwest::Client) -> Self {
        Self::new(format!("http://{ip}:{agent_port}"), http)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// `GET /api/v1/health`
    pub async fn health(&self) -> Result<HealthReply, AgentError> {
        let resp = self.http.get(self.url(&api::health_path())).send().await?;
        Ok(expect_2xx(resp).await?.json().await?)
    }

    /// `GET /api/v1/info`
    pub async fn info(&self) -> Result<AgentInfoReply, AgentError> {
        let resp = self.http.get(self.url(&api::info_path())).send().await?;
        Ok(expect_2xx(resp).await?.json().await?)
    }

    /// `GET /api/v1/vms`
    pub async fn list_vms(&self) -> Result<ListVmsReply, AgentError> {
        let resp = self.http.get(self.url(&api::vms_path())).send().await?;
        Ok(expect_2xx(resp).await?.json().await?)
    }

    /// `POST /api/v1/vms`
    pub async fn create_vm(&self, body: &CreateVmBody) -> Result<MessageReply, AgentError> {
        let resp = self
            .http
            .post(self.url(&api::vms_path()))
            .json(body)
            .send()
            .await?;
        Ok(expect_2xx(resp).await?.json().await?)
    }

    /// `GET /api/v1/vms/{vm_id}`
    pub async fn get_vm(&self, vm_id: &str) -> Result<VmSummary, AgentError> {
        let resp = self.http.get(self.url(&api::vm_path(vm_id))).send().await?;
        Ok(expect_2xx(resp).await?.json().await?)
    }

    /// `GET /api/v1/vms/{vm_id}/status` with a caller-supplied timeout.
    ///
    /// Status is used for best-effort UI decoration, so callers pass a
    /// sub-second timeout here independent of the client's defaults - a
    /// slow agent must not block a listing.
    pub async fn status(&self, vm_id: &str, timeout: Duration) -> Result<VmStatusReply, AgentError> {
        let resp = self
            .http
            .get(self.url(&api::vm_status_path(vm_id)))
            .timeout(timeout)
            .send()
            .await?;
        Ok(expect_2xx(resp).await?.json().await?)
    }

    /// `POST /api/v1/vms/{vm_id}/{start|stop|restart}`
    pub async fn power(&self, vm_id: &str, op: PowerOp) -> Result<MessageReply, AgentError> {
        let resp = self
            .http
            .post(self.url(&api::vm_power_path(vm_id, op)))
            .send()
            .await?;
        Ok(expect_2xx(resp).await?.json().await?)
    }

    /// `POST /api/v1/vms/{vm_id}/format`
    pub async fn format_vm(
        &self,
        vm_id: &str,
        body: &FormatVmBody,
    ) -> Result<MessageReply, AgentError> {
        let resp = self
            .http
            .post(self.url(&api::vm_format_path(vm_id)))
            .json(body)
            .send()
            .await?;
        Ok(expect_2xx(resp).await?.json().await?)
    }

    /// `POST /api/v1/vms/{vm_id}/finalize` with the default body (agent
    /// defaults apply).
    ///
    /// 200 maps to [`FinalizeOutcome::Done`], 409 to
    /// [`FinalizeOutcome::InProgress`]; anything else is an error carrying
    /// the status and body text.
    pub async fn finalize_vm(&self, vm_id: &str) -> Result<FinalizeOutcome, AgentError> {
        let resp = self
            .http
            .post(self.url(&api::vm_finalize_path(vm_id)))
            .json(&FinalizeVmBody::default())
            .send()
            .await?;
        match resp.status().as_u16() {
            200 => Ok(FinalizeOutcome::Done),
            409 => Ok(FinalizeOutcome::InProgress),
            status => {
                let body = resp.text().await.unwrap_or_default();
                Err(AgentError::UnexpectedStatus { status, body })
            }
        }
    }

    /// `DELETE /api/v1/vms/{vm_id}`
    pub async fn delete_vm(&self, vm_id: &str) -> Result<(), AgentError> {
        let resp = self
            .http
            .delete(self.url(&api::vm_path(vm_id)))
            .send()
            .await?;
        expect_2xx(resp).await?;
        Ok(())
    }
}

/// Turn a non-2xx response into a typed error, preserving the body text.
async fn expect_2xx(resp: reqwest::Response) -> Result<reqwest::Response, AgentError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(AgentError::UnexpectedStatus {
        status: status.as_u16(),
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, http::StatusCode, routing::get, routing::post};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn finalize_maps_200_and_409() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let app = Router::new().route(
            "/api/v1/vms/{vm_id}/finalize",
            post(move |axum::Json(body): axum::Json<FinalizeVmBody>| {
                // The client sends the defaulted body, letting the agent
                // apply its own defaults.
                assert!(body.seed_iso_path.is_none());
                assert!(body.delete_iso.is_none());
                let n = calls2.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        StatusCode::CONFLICT
                    } else {
                        StatusCode::OK
                    }
                }
            }),
        );
        let base = serve(app).await;
        let client = AgentClient::new(base, reqwest::Client::new());

        assert_eq!(
            client.finalize_vm("vm-1").await.unwrap(),
            FinalizeOutcome::InProgress
        );
        assert_eq!(client.finalize_vm("vm-1").await.unwrap(), FinalizeOutcome::Done);
    }

    #[tokio::test]
    async fn finalize_other_status_carries_body() {
        let app = Router::new().route(
            "/api/v1/vms/{vm_id}/finalize",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "qemu exploded") }),
        );
        let base = serve(app).await;
        let client = AgentClient::new(base, reqwest::Client::new());

        let err = client.finalize_vm("vm-1").await.unwrap_err();
        match err {
            AgentError::UnexpectedStatus { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "qemu exploded");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn create_posts_typed_body() {
        use vmgrid_agent_api::{NetworkRates, VmSpec};

        let app = Router::new().route(
            "/api/v1/vms",
            post(|axum::Json(body): axum::Json<CreateVmBody>| async move {
                assert_eq!(body.vm_id, "row-1");
                assert_eq!(body.vm.vcpus, 2);
                assert_eq!(body.vm.mac, "52:54:00:aa:bb:cc");
                axum::Json(MessageReply {
                    message: "created".into(),
                })
            }),
        );
        let base = serve(app).await;
        let client = AgentClient::new(base, reqwest::Client::new());

        let reply = client
            .create_vm(&CreateVmBody {
                vm_id: "row-1".into(),
                vm: VmSpec {
                    vcpus: 2,
                    memory: 2048,
                    disk_size: 20,
                    network: NetworkRates {
                        in_avg_mbps: 100,
                        in_peak_mbps: 200,
                        in_burst_mbps: 300,
                        out_avg_mbps: 100,
                        out_peak_mbps: 200,
                        out_burst_mbps: 300,
                    },
                    mac: "52:54:00:aa:bb:cc".into(),
                },
            })
            .await
            .unwrap();
        assert_eq!(reply.message, "created");
    }

    #[tokio::test]
    async fn status_honors_short_timeout() {
        let app = Router::new().route(
            "/api/v1/vms/{vm_id}/status",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                axum::Json(VmStatusReply {
                    status: "running".into(),
                })
            }),
        );
        let base = serve(app).await;
        let client = AgentClient::new(base, reqwest::Client::new());

        let err = client
            .status("vm-1", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }
}
