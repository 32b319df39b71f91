//! Control-plane HTTP surface: `/v1/cluster`, `/v1/daemon`, `/v1/notifs`.

/// `/v1/cluster` handlers (primary-facing operations).
pub mod cluster;
/// `/v1/daemon` handlers (peer-facing operations).
pub mod daemon;
/// `/v1/notifs` handlers (target → primary notifications).
pub mod notifs;
