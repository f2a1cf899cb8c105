// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! The operator HTTP surface plus the agent-authenticated image routes.
//!
//! Operator authentication (sessions, CSRF) lives in front of this
//! service; the routes here are the orchestration surface itself. The
//! `/api/v1/agent/...` routes are instead gated by the Ed25519 signature
//! check in `vmgrid-auth`, applied through the [`AgentAuth`] extractor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::info;
use uuid::Uuid;
use vmgrid_agent_api::NetworkRates;
use vmgrid_agent_client::AgentClient;
use vmgrid_auth::{AgentKeyStore, AgentRequest, AgentVerifier, ConsoleTokenCodec};

use crate::console;
use crate::error::ProvisionError;
use crate::images::ImageCatalog;
use crate::model::{Host, HostStatus, VirtualMachine};
use crate::provision::{CreateOutcome, CreateVmRequest, Orchestrator};
use crate::store::Store;

/// Timeout for best-effort agent status decoration on listings.
const STATUS_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub orchestrator: Arc<Orchestrator>,
    pub codec: Arc<ConsoleTokenCodec>,
    pub verifier: Arc<AgentVerifier>,
    pub images: Arc<dyn ImageCatalog>,
    pub http: reqwest::Client,
    pub console_port: u16,
    pub skip_agent_checks: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/hosts", post(register_host).get(list_hosts))
        .route("/api/v1/vms", post(create_vm).get(list_vms))
        .route("/api/v1/vms/{public_id}", get(get_vm).delete(delete_vm))
        .route("/api/v1/vms/{public_id}/console", post(mint_console_token))
        .route("/api/v1/ws/console", get(console_ws))
        .route("/api/v1/agent/images/{name}", get(image_meta))
        .route("/api/v1/agent/images/{name}/download", get(image_download))
        .with_state(state)
}

/// [`AgentKeyStore`] backed by the host table: the agent id is the host
/// id and the PEM comes off the host record.
pub struct StoreKeys(pub Arc<dyn Store>);

#[async_trait]
impl AgentKeyStore for StoreKeys {
    async fn public_key_pem(&self, agent_id: &str) -> Option<String> {
        self.0
            .host_by_id(agent_id)
            .await
            .ok()
            .flatten()
            .and_then(|host| host.public_key)
    }
}

/// Extractor gating agent-only routes. Verification failure renders the
/// uniform 401; the concrete reason is only logged.
pub struct AgentAuth(pub String);

impl FromRequestParts<AppState> for AgentAuth {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Response> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
        };
        let method = parts.method.as_str().to_string();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();
        let req = AgentRequest {
            method: &method,
            path_and_query: &path_and_query,
            agent_id: header("x-agent-id"),
            timestamp: header("x-timestamp"),
            nonce: header("x-nonce"),
            signature: header("x-signature"),
            range: header("range"),
        };
        match state.verifier.verify(&req).await {
            Ok(agent_id) => Ok(AgentAuth(agent_id)),
            Err(e) => Err((
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()),
        }
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
pub struct RegisterHostBody {
    pub name: String,
    pub ip_local: String,
    pub agent_port: u16,
    pub vcpus_max: u32,
    pub ram_max: u64,
    pub disk_max: u64,
    pub vms_mac_prefix: Option<String>,
    pub vms_gateway: Option<String>,
    pub public_key: Option<String>,
}

async fn register_host(
    State(state): State<AppState>,
    Json(body): Json<RegisterHostBody>,
) -> Result<Response, Response> {
    if !state.skip_agent_checks {
        let client = AgentClient::for_host(&body.ip_local, body.agent_port, state.http.clone());
        if let Err(e) = client.health().await {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": format!(
                        "agent unreachable at {}:{}: {e}",
                        body.ip_local, body.agent_port
                    )
                })),
            )
                .into_response());
        }
    }

    let public_id = state
        .store
        .next_host_public_id()
        .await
        .map_err(|e| ProvisionError::from(e).into_response())?;
    let host = Host {
        id: Uuid::new_v4().to_string(),
        public_id,
        name: body.name,
        ip_local: body.ip_local,
        agent_port: body.agent_port,
        vcpus_max: body.vcpus_max,
        ram_max: body.ram_max,
        disk_max: body.disk_max,
        vcpus_available: body.vcpus_max,
        ram_available: body.ram_max,
        disk_available: body.disk_max,
        vms_mac_prefix: body.vms_mac_prefix,
        vms_gateway: body.vms_gateway,
        public_key: body.public_key,
        status: HostStatus::Active,
    };
    state
        .store
        .insert_host(host.clone())
        .await
        .map_err(|e| ProvisionError::from(e).into_response())?;
    info!(host = %host.name, public_id = host.public_id, "host registered");
    Ok((StatusCode::CREATED, Json(host)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ListHostsQuery {
    #[serde(default)]
    pub include_status: bool,
}

#[derive(Debug, Serialize)]
struct VmView {
    #[serde(flatten)]
    vm: VirtualMachine,
    /// Live status from the agent, when asked for and reachable.
    #[serde(skip_serializing_if = "Option::is_none")]
    live_status: Option<String>,
}

#[derive(Debug, Serialize)]
struct HostView {
    #[serde(flatten)]
    host: Host,
    vms: Vec<VmView>,
}

async fn list_hosts(
    State(state): State<AppState>,
    Query(query): Query<ListHostsQuery>,
) -> Result<Json<Vec<HostView>>, ProvisionError> {
    let hosts = state.store.list_hosts().await?;
    let mut views = Vec::with_capacity(hosts.len());
    for host in hosts {
        let vms = state.store.vms_on_host(&host.id).await?;
        let client = AgentClient::for_host(&host.ip_local, host.agent_port, state.http.clone());
        let mut vm_views = Vec::with_capacity(vms.len());
        for vm in vms {
            // Best effort with a short timeout: a slow agent must not
            // block the listing.
            let live_status = if query.include_status {
                client
                    .status(&vm.id, STATUS_PROBE_TIMEOUT)
                    .await
                    .ok()
                    .map(|reply| reply.status)
            } else {
                None
            };
            vm_views.push(VmView { vm, live_status });
        }
        views.push(HostView {
            host,
            vms: vm_views,
        });
    }
    Ok(Json(views))
}

fn default_rates() -> NetworkRates {
    NetworkRates {
        in_avg_mbps: 100,
        in_peak_mbps: 100,
        in_burst_mbps: 100,
        out_avg_mbps: 100,
        out_peak_mbps: 100,
        out_burst_mbps: 100,
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateVmParams {
    pub public_id: i64,
    pub name: String,
    pub host_public_id: i64,
    pub vcpus: u32,
    pub ram: u64,
    pub disk: u64,
    pub ip_local: Option<String>,
    pub ip_public: Option<String>,
    #[serde(default = "default_rates")]
    pub rates: NetworkRates,
    pub os_name: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssh_public_key: Option<String>,
}

async fn create_vm(
    State(state): State<AppState>,
    Json(params): Json<CreateVmParams>,
) -> Result<Response, ProvisionError> {
    let outcome = state
        .orchestrator
        .create_vm(CreateVmRequest {
            public_id: params.public_id,
            name: params.name,
            host_public_id: params.host_public_id,
            vcpus: params.vcpus,
            ram: params.ram,
            disk: params.disk,
            ip_local: params.ip_local,
            ip_public: params.ip_public,
            rates: params.rates,
            os_name: params.os_name,
            username: params.username,
            password: params.password,
            ssh_public_key: params.ssh_public_key,
        })
        .await?;
    // Formatting continues asynchronously: 202 tells the caller to poll
    // rather than assume the VM is ready.
    let status = match &outcome {
        CreateOutcome::Operational(_) => StatusCode::CREATED,
        CreateOutcome::Formatting(_) => StatusCode::ACCEPTED,
    };
    Ok((status, Json(outcome.vm().clone())).into_response())
}

async fn list_vms(
    State(state): State<AppState>,
) -> Result<Json<Vec<VirtualMachine>>, ProvisionError> {
    Ok(Json(state.store.list_vms().await?))
}

async fn get_vm(
    State(state): State<AppState>,
    Path(public_id): Path<i64>,
) -> Result<Json<VirtualMachine>, ProvisionError> {
    state
        .store
        .vm_by_public_id(public_id)
        .await?
        .map(Json)
        .ok_or(ProvisionError::NotFound)
}

async fn delete_vm(
    State(state): State<AppState>,
    Path(public_id): Path<i64>,
) -> Result<StatusCode, ProvisionError> {
    state.orchestrator.delete_vm(public_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn mint_console_token(
    State(state): State<AppState>,
    Path(public_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Response, ProvisionError> {
    let vm = state
        .store
        .vm_by_public_id(public_id)
        .await?
        .ok_or(ProvisionError::NotFound)?;
    let host = state
        .store
        .host_by_id(&vm.host_id)
        .await?
        .ok_or_else(|| ProvisionError::Configuration("VM's host record is missing".into()))?;

    let sub = headers
        .get("x-operator")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("operator");
    let token = state
        .codec
        .seal(sub, vm.public_id, &host.ip_local, state.console_port)
        .map_err(|e| ProvisionError::Configuration(format!("could not seal console token: {e}")))?;
    info!(vm = vm.public_id, sub, "console token minted");
    Ok(Json(json!({ "token": token })).into_response())
}

async fn console_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = params.get("token").cloned();
    let codec = state.codec.clone();
    ws.on_upgrade(move |socket| console::serve_socket(socket, codec, token))
}

async fn image_meta(
    State(state): State<AppState>,
    Path(name): Path<String>,
    AgentAuth(agent_id): AgentAuth,
) -> Result<Response, ProvisionError> {
    let info = state.images.resolve(&name).await?;
    info!(agent_id, image = %info.os_name, "image metadata served");
    Ok(Json(json!({
        "os_name": info.os_name,
        "filename": info.filename,
        "type": info.mode,
        "sha256": info.sha256,
        "bytes": info.bytes,
    }))
    .into_response())
}

async fn image_download(
    State(state): State<AppState>,
    Path(name): Path<String>,
    AgentAuth(agent_id): AgentAuth,
    headers: HeaderMap,
) -> Result<Response, ProvisionError> {
    let info = state.images.resolve(&name).await?;

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|raw| parse_range(raw, info.bytes));
    let (start, end) = match range {
        None => (0, info.bytes.saturating_sub(1)),
        Some(Some(bounds)) => bounds,
        Some(None) => {
            return Ok((
                StatusCode::RANGE_NOT_SATISFIABLE,
                [(header::CONTENT_RANGE, format!("bytes */{}", info.bytes))],
            )
                .into_response());
        }
    };

    let mut file = tokio::fs::File::open(&info.path)
        .await
        .map_err(|e| ProvisionError::Configuration(format!("image unreadable: {e}")))?;
    file.seek(std::io::SeekFrom::Start(start))
        .await
        .map_err(|e| ProvisionError::Configuration(format!("image seek failed: {e}")))?;
    let len = if info.bytes == 0 { 0 } else { end - start + 1 };
    let body = Body::from_stream(ReaderStream::new(file.take(len)));

    info!(agent_id, image = %info.os_name, start, end, "image download");
    let mut response = Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, len)
        .header(header::ACCEPT_RANGES, "bytes")
        .header("x-checksum-sha256", &info.sha256);
    if range.is_some() {
        response = response.status(StatusCode::PARTIAL_CONTENT).header(
            header::CONTENT_RANGE,
            format!("bytes {start}-{end}/{}", info.bytes),
        );
    }
    response
        .body(body)
        .map_err(|e| ProvisionError::Configuration(format!("response build failed: {e}")))
}

/// Parse a single `bytes=start-end` range against a payload of `len`
/// bytes. Open-ended (`bytes=start-`) is accepted; anything else, or an
/// unsatisfiable range, yields `None`.
fn parse_range(raw: &str, len: u64) -> Option<(u64, u64)> {
    let spec = raw.strip_prefix("bytes=")?;
    // One range only; multipart responses are not supported.
    if spec.contains(',') {
        return None;
    }
    let (start_s, end_s) = spec.split_once('-')?;
    let start: u64 = start_s.parse().ok()?;
    let end: u64 = if end_s.is_empty() {
        len.checked_sub(1)?
    } else {
        end_s.parse().ok()?
    };
    if start > end || end >= len {
        return None;
    }
    Some((start, end))
}
