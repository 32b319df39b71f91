//! Cluster-membership and coordination core of the Silo object store.
//!
//! A Silo cluster is a federation of stateless gateway proxies and stateful
//! storage targets presenting one namespace of buckets and objects. This
//! crate owns the control plane underneath that data path: the versioned
//! cluster map and its single-writer mutation pipeline, the join/keepalive/
//! eviction protocol with adaptive per-peer timeouts, metadata
//! dissemination with convergence guarantees, two-phase primary
//! transitions, and the primary-side aggregation of long-running action
//! notifications.

/// Intra-cluster HTTP client and broadcast helpers.
pub mod client;
/// Cluster-wide configuration schema and partial updates.
pub mod config;
/// Per-daemon control-plane wiring: owners, lifecycle flags, receive paths.
pub mod daemon;
/// Two-phase primary transition and fail-over takeover.
pub mod election;
/// Error taxonomy surfaced by the core.
pub mod error;
/// Join, keepalive-renewal, and admission flows.
pub mod join;
/// Liveness protocol: heartbeats, primary sweeps, adaptive timeouts.
pub mod keepalive;
/// At-least-once, version-monotonic metadata dissemination.
pub mod metasync;
/// Node descriptors, roles, and flag bits.
pub mod node;
/// Notification listeners aggregating multi-target actions.
pub mod notifs;
/// Single-writer serialized mutation pipeline.
pub mod owner;
/// Rebalance triggering and membership-edit flows.
pub mod rebalance;
/// Versioned, UUID-scoped metadata revisions and their wire envelopes.
pub mod revision;
/// Rebalance metadata (epoch counter).
pub mod rmd;
/// The cluster map.
pub mod smap;
/// Idle-stream collector consumed by the transport layer.
pub mod stream;

pub use client::{ControlClient, HDR_CALLER_ID};
pub use config::{ClusterConfig, ConfigUpdate};
pub use daemon::{ClusterMetaBundle, ControlPlane, CoreEvent, Owners};
pub use error::ControlError;
pub use join::{JoinOp, JoinRequest, JoinResponse};
pub use keepalive::{KaSignal, Keepaliver};
pub use metasync::Metasyncer;
pub use node::{NetInfo, NodeDescriptor, NodeFlags, NodeId, NodeRole};
pub use notifs::{NotifListener, NotifMsg, NotifRegistry};
pub use owner::{Mutation, Owner};
pub use revision::{Action, ActionMsg, Revision, RevisionEnvelope, RevisionKind};
pub use rmd::RebalanceMd;
pub use smap::{ClusterMap, must_run_rebalance};
