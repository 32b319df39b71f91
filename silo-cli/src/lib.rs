//! Silo daemon library: HTTP control surface and configuration loading,
//! exposed for integration tests.

/// Router, shared state, and error mapping.
pub mod api;
/// TOML configuration and persisted node identity.
pub mod config;
/// HTTP handlers for the control surface.
pub mod http;

use std::sync::Arc;

use anyhow::Result;
use silo_core::config::ClusterConfig;
use silo_core::daemon::ControlPlane;
use silo_core::keepalive::Keepaliver;
use silo_core::node::{NodeDescriptor, NodeRole};

use api::ApiState;

/// Builds the control plane and role-appropriate keepaliver for one daemon.
#[must_use]
pub fn build_daemon(si: NodeDescriptor, cluster: ClusterConfig) -> ApiState {
    let core = ControlPlane::new(si, cluster);
    let keepaliver = match core.si.role {
        NodeRole::Proxy => Keepaliver::proxy(Arc::clone(&core)),
        NodeRole::Target => Keepaliver::target(Arc::clone(&core)),
    };
    ApiState { core, keepaliver }
}

/// Binds a listener, preferring the requested port.
pub async fn bind(host: &str, port: u16) -> Result<tokio::net::TcpListener> {
    let listener = tokio::net::TcpListener::bind(format!("{host}:{port}")).await?;
    Ok(listener)
}
