// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! The vmgrid manager: the control plane that provisions, formats and
//! consoles into VMs spread across independently-operated host agents.
//!
//! The moving parts, in dependency order:
//!
//! - [`store`] / [`model`]: host and VM records behind the [`store::Store`]
//!   trait, with the in-memory implementation.
//! - [`ledger`]: atomic capacity accounting per host.
//! - [`mac`]: MAC derivation under a host's prefix policy.
//! - [`images`]: the OS image catalog agents download from.
//! - [`finalize`]: the poll loops that chase format completion.
//! - [`provision`]: the orchestrator driving create/format/delete with
//!   explicit compensation.
//! - [`console`]: the token-gated WebSocket-to-TCP console tunnel.
//! - [`routes`]: the axum surface tying it all together.

pub mod config;
pub mod console;
pub mod error;
pub mod finalize;
pub mod images;
pub mod ledger;
pub mod mac;
pub mod model;
pub mod provision;
pub mod routes;
pub mod store;
