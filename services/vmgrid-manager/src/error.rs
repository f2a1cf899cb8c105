// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Provisioning error taxonomy and its HTTP mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use vmgrid_agent_client::AgentError;

use crate::images::ImageError;
use crate::ledger::LedgerError;
use crate::store::StoreError;

/// Everything the orchestrator can report. Caller-fixable conditions,
/// operator misconfiguration and remote-agent failures stay distinct so
/// the HTTP layer maps them to 4xx / 500 / 502 respectively and the
/// agent's own diagnostic survives into the response body.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("host not found")]
    HostNotFound,

    #[error("host is not accepting new VMs")]
    HostNotActive,

    #[error("insufficient capacity on host")]
    InsufficientCapacity,

    #[error("a VM with id {0} already exists")]
    DuplicateId(i64),

    #[error("host misconfiguration: {0}")]
    Configuration(String),

    #[error("agent create failed: {0}")]
    AgentCreate(AgentError),

    #[error("agent format failed: {0}")]
    AgentFormat(AgentError),

    #[error("agent delete failed: {0}")]
    AgentDelete(AgentError),

    #[error("unknown OS image {0:?}")]
    ImageNotFound(String),

    #[error("VM not found")]
    NotFound,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ProvisionError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProvisionError::HostNotFound | ProvisionError::NotFound => StatusCode::NOT_FOUND,
            ProvisionError::HostNotActive
            | ProvisionError::InsufficientCapacity
            | ProvisionError::DuplicateId(_) => StatusCode::CONFLICT,
            ProvisionError::ImageNotFound(_) => StatusCode::BAD_REQUEST,
            ProvisionError::Configuration(_) | ProvisionError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ProvisionError::AgentCreate(_)
            | ProvisionError::AgentFormat(_)
            | ProvisionError::AgentDelete(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl From<LedgerError> for ProvisionError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::HostNotFound => ProvisionError::HostNotFound,
            LedgerError::InsufficientCapacity => ProvisionError::InsufficientCapacity,
            LedgerError::Store(e) => ProvisionError::Store(e),
        }
    }
}

impl From<ImageError> for ProvisionError {
    fn from(e: ImageError) -> Self {
        match e {
            ImageError::NotFound(id) | ImageError::BadId(id) => ProvisionError::ImageNotFound(id),
            other => ProvisionError::Configuration(other.to_string()),
        }
    }
}

impl IntoResponse for ProvisionError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
