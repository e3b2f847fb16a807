/*
 * Workspaces Platform - Runtime Controller
 * Copyright (C) 2025 Workspaces Platform
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Workspace runtime orchestration engine
//!
//! Realizes a workspace environment as objects in a Kubernetes or OpenShift
//! cluster: namespace provisioning and authorization, the provisioner
//! pipeline, secure server exposure through a signing proxy, the plugin
//! broker, and the start/stop lifecycle with its state cache.

pub mod api;
pub mod broker;
pub mod cluster;
pub mod config;
pub mod driver;
pub mod error;
pub mod model;
pub mod namespace;
pub mod provision;
pub mod retry;
pub mod runtime;
pub mod server;

// Re-export commonly used types
pub use config::ControllerConfig;
pub use error::{Error, Result};
pub use model::{KubernetesEnvironment, RuntimeIdentity, Subject};
pub use runtime::{RuntimeOrchestrator, RuntimeState, RuntimeStatus};
