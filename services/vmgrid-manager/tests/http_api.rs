// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! HTTP surface tests: operator routes end to end against a stub agent,
//! and the signature-gated image routes with real Ed25519 signing.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::http::StatusCode as AxumStatus;
use axum::routing::{delete, post};
use base64::Engine;
use chrono::Utc;
use ed25519_dalek::pkcs8::EncodePublicKey;
use rsa::pkcs8::der::pem::LineEnding;
use ed25519_dalek::{Signer, SigningKey};
use serde_json::{Value, json};

use vmgrid_auth::{AgentVerifier, ConsoleTokenCodec, VerifierConfig, canonical_string, system_clock};
use vmgrid_manager::finalize::{FinalizePoller, PollerConfig};
use vmgrid_manager::images::DirImageCatalog;
use vmgrid_manager::ledger::CapacityLedger;
use vmgrid_manager::model::{Host, HostStatus};
use vmgrid_manager::provision::Orchestrator;
use vmgrid_manager::routes::{AppState, StoreKeys, router};
use vmgrid_manager::store::{MemStore, Store};

async fn spawn_stub_agent() -> SocketAddr {
    let app = Router::new()
        .route("/api/v1/health", axum::routing::get(|| async { "{\"status\": \"ok\"}" }))
        .route("/api/v1/vms", post(|| async { "{\"message\": \"created\"}" }))
        .route("/api/v1/vms/{vm_id}", delete(|| async { AxumStatus::OK }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

struct TestServer {
    base: String,
    store: Arc<MemStore>,
    images_dir: tempfile::TempDir,
}

async fn spawn_manager() -> TestServer {
    let images_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemStore::new());
    let clock = system_clock();
    let codec = Arc::new(ConsoleTokenCodec::from_private_key(
        rsa::RsaPrivateKey::new(&mut rand_core::OsRng, 1024).unwrap(),
        clock.clone(),
        120,
    ));
    let images = Arc::new(DirImageCatalog::new(images_dir.path()));
    let http = reqwest::Client::new();
    let poller = FinalizePoller::new(store.clone(), PollerConfig::default());
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        CapacityLedger::new(store.clone()),
        images.clone(),
        poller,
        http.clone(),
        "http://127.0.0.1:8080",
    ));
    let verifier = Arc::new(AgentVerifier::new(
        Arc::new(StoreKeys(store.clone())),
        clock,
        VerifierConfig::default(),
    ));
    let app = router(AppState {
        store: store.clone(),
        orchestrator,
        codec,
        verifier,
        images,
        http,
        console_port: 7900,
        skip_agent_checks: false,
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    TestServer {
        base: format!("http://{addr}"),
        store,
        images_dir,
    }
}

#[tokio::test]
async fn operator_flow_register_create_delete() {
    let agent = spawn_stub_agent().await;
    let server = spawn_manager().await;
    let client = reqwest::Client::new();

    // Register a host; the reachability probe hits the stub agent.
    let resp = client
        .post(format!("{}/api/v1/hosts", server.base))
        .json(&json!({
            "name": "rack1-node1",
            "ip_local": agent.ip().to_string(),
            "agent_port": agent.port(),
            "vcpus_max": 8,
            "ram_max": 16384,
            "disk_max": 200,
            "vms_gateway": "10.0.0.1",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 201);
    let host: Value = resp.json().await.unwrap();
    assert_eq!(host["public_id"], 1);
    assert_eq!(host["vcpus_available"], 8);

    // Create a VM with no OS: synchronous, 201.
    let resp = client
        .post(format!("{}/api/v1/vms", server.base))
        .json(&json!({
            "public_id": 100,
            "name": "build-box",
            "host_public_id": 1,
            "vcpus": 2,
            "ram": 2048,
            "disk": 20,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 201);
    let vm: Value = resp.json().await.unwrap();
    assert_eq!(vm["status"], "OPERATIONAL");
    assert!(vm["mac"].as_str().unwrap().starts_with("52:"));

    // Listing shows it; a duplicate id is a 409.
    let resp = client
        .get(format!("{}/api/v1/vms/100", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let resp = client
        .post(format!("{}/api/v1/vms", server.base))
        .json(&json!({
            "public_id": 100,
            "name": "copycat",
            "host_public_id": 1,
            "vcpus": 1,
            "ram": 512,
            "disk": 5,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 409);

    // A console token mints for the VM.
    let resp = client
        .post(format!("{}/api/v1/vms/100/console", server.base))
        .header("x-operator", "op@example.com")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["token"].as_str().unwrap().split('.').count(), 3);

    // Delete through the stub agent, then the row is gone.
    let resp = client
        .delete(format!("{}/api/v1/vms/100", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 204);
    let resp = client
        .get(format!("{}/api/v1/vms/100", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);
}

#[tokio::test]
async fn unknown_host_and_unreachable_agent_are_rejected() {
    let server = spawn_manager().await;
    let client = reqwest::Client::new();

    // Nothing listening at this port: registration fails the probe.
    let resp = client
        .post(format!("{}/api/v1/hosts", server.base))
        .json(&json!({
            "name": "ghost",
            "ip_local": "127.0.0.1",
            "agent_port": 1,
            "vcpus_max": 8,
            "ram_max": 16384,
            "disk_max": 200,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    // Creating a VM on a host that does not exist is a 404.
    let resp = client
        .post(format!("{}/api/v1/vms", server.base))
        .json(&json!({
            "public_id": 100,
            "name": "vm",
            "host_public_id": 9,
            "vcpus": 1,
            "ram": 512,
            "disk": 5,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);
}

fn sign_headers(
    signing: &SigningKey,
    method: &str,
    path_and_query: &str,
    nonce: &str,
    range: &str,
) -> Vec<(String, String)> {
    let timestamp = Utc::now().timestamp().to_string();
    let canonical = canonical_string(method, path_and_query, &timestamp, nonce, range);
    let signature =
        base64::engine::general_purpose::STANDARD.encode(signing.sign(canonical.as_bytes()).to_bytes());
    let mut headers = vec![
        ("x-agent-id".to_string(), "agent-host-1".to_string()),
        ("x-timestamp".to_string(), timestamp),
        ("x-nonce".to_string(), nonce.to_string()),
        ("x-signature".to_string(), signature),
    ];
    // A missing Range header signs as the empty string.
    if !range.is_empty() {
        headers.push(("range".to_string(), range.to_string()));
    }
    headers
}

#[tokio::test]
async fn signed_image_download_honors_range() {
    let server = spawn_manager().await;
    let client = reqwest::Client::new();

    // A host whose agent signs with this key.
    let signing = SigningKey::generate(&mut rand_core::OsRng);
    let pem = signing
        .verifying_key()
        .to_public_key_pem(LineEnding::LF)
        .unwrap();
    server
        .store
        .insert_host(Host {
            id: "agent-host-1".to_string(),
            public_id: 1,
            name: "rack1-node1".to_string(),
            ip_local: "127.0.0.1".to_string(),
            agent_port: 8500,
            vcpus_max: 8,
            ram_max: 16384,
            disk_max: 200,
            vcpus_available: 8,
            ram_available: 16384,
            disk_available: 200,
            vms_mac_prefix: None,
            vms_gateway: None,
            public_key: Some(pem),
            status: HostStatus::Active,
        })
        .await
        .unwrap();

    // Seed one image.
    let image_dir = server.images_dir.path().join("debian-12");
    std::fs::create_dir_all(&image_dir).unwrap();
    std::fs::write(image_dir.join("disk.qcow2"), b"0123456789").unwrap();
    std::fs::write(
        image_dir.join("meta.json"),
        r#"{"filename": "disk.qcow2", "type": "cloud"}"#,
    )
    .unwrap();

    let path = "/api/v1/agent/images/debian-12/download";

    // Unsigned request: uniform 401.
    let resp = client
        .get(format!("{}{path}", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);

    // Signed request with a Range: 206 with exactly those bytes.
    let mut req = client.get(format!("{}{path}", server.base));
    for (name, value) in sign_headers(&signing, "GET", path, "nonce-1", "bytes=2-5") {
        req = req.header(name, value);
    }
    let resp = req.send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 206);
    assert_eq!(
        resp.headers()
            .get("content-range")
            .unwrap()
            .to_str()
            .unwrap(),
        "bytes 2-5/10"
    );
    assert_eq!(resp.bytes().await.unwrap().as_ref(), b"2345");

    // Replaying the same nonce is rejected.
    let mut req = client.get(format!("{}{path}", server.base));
    for (name, value) in sign_headers(&signing, "GET", path, "nonce-1", "bytes=2-5") {
        req = req.header(name, value);
    }
    assert_eq!(req.send().await.unwrap().status().as_u16(), 401);

    // A fresh nonce with no Range streams the whole payload.
    let mut req = client.get(format!("{}{path}", server.base));
    for (name, value) in sign_headers(&signing, "GET", path, "nonce-2", "") {
        req = req.header(name, value);
    }
    let resp = req.send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.bytes().await.unwrap().as_ref(), b"0123456789");
}
