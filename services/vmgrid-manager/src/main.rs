// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

use std::sync::Arc;

use anyhow::{Context, Result};
use rsa::RsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use tracing::info;
use vmgrid_auth::{AgentVerifier, ConsoleTokenCodec, VerifierConfig, system_clock};

use vmgrid_manager::config::Config;
use vmgrid_manager::finalize::{FinalizePoller, PollerConfig};
use vmgrid_manager::images::DirImageCatalog;
use vmgrid_manager::ledger::CapacityLedger;
use vmgrid_manager::provision::Orchestrator;
use vmgrid_manager::routes::{AppState, StoreKeys, router};
use vmgrid_manager::store::MemStore;

/// Seconds a minted console token stays openable.
const CONSOLE_TOKEN_TTL_SECS: i64 = 120;

const CONSOLE_KEY_FILE: &str = "console_key.pem";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "vmgrid_manager=info,axum=info".to_string()),
        ))
        .init();

    let config = Config::from_env().context("loading configuration")?;
    info!(
        listen_port = config.listen_port,
        database = %config.masked_database_url(),
        jwt_mode = ?config.jwt_mode,
        images = %config.os_image_dir.display(),
        skip_agent_checks = config.skip_agent_checks,
        ignore_csrf = config.ignore_csrf,
        "starting vmgrid manager"
    );

    let console_key = load_or_create_console_key(&config)?;
    let clock = system_clock();
    let codec = Arc::new(ConsoleTokenCodec::from_private_key(
        console_key,
        clock.clone(),
        CONSOLE_TOKEN_TTL_SECS,
    ));

    let store = Arc::new(MemStore::new());
    let ledger = CapacityLedger::new(store.clone());
    let images = Arc::new(DirImageCatalog::new(config.os_image_dir.clone()));
    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .context("building HTTP client")?;

    let poller = FinalizePoller::new(store.clone(), PollerConfig::default());
    // Jobs do not survive restarts: fail whatever a previous process
    // left mid-format.
    poller.startup_sweep().await;

    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        ledger,
        images.clone(),
        poller.clone(),
        http.clone(),
        config.public_base_url.clone(),
    ));
    let verifier = Arc::new(AgentVerifier::new(
        Arc::new(StoreKeys(store.clone())),
        clock,
        VerifierConfig::default(),
    ));

    let app = router(AppState {
        store,
        orchestrator,
        codec,
        verifier,
        images,
        http,
        console_port: config.console_port,
        skip_agent_checks: config.skip_agent_checks,
    });

    let addr = format!("0.0.0.0:{}", config.listen_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "listening");
    axum::serve(listener, app).await.context("server failed")
}

/// Load the console RSA key, generating and persisting one on first run.
fn load_or_create_console_key(config: &Config) -> Result<RsaPrivateKey> {
    let path = config.console_key_dir.join(CONSOLE_KEY_FILE);
    if path.is_file() {
        let pem = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        return RsaPrivateKey::from_pkcs8_pem(&pem)
            .with_context(|| format!("parsing {}", path.display()));
    }

    info!(path = %path.display(), "generating console key pair");
    std::fs::create_dir_all(&config.console_key_dir)
        .with_context(|| format!("creating {}", config.console_key_dir.display()))?;
    let key = RsaPrivateKey::new(&mut rand_core::OsRng, 2048).context("generating RSA key")?;
    let pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .context("encoding console key")?;
    std::fs::write(&path, pem.as_bytes()).with_context(|| format!("writing {}", path.display()))?;
    Ok(key)
}
