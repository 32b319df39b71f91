use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::ControlError;

/// Stable node identifier, generated once at first startup and persisted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Borrow the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Role a node plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Stateless gateway; one proxy is the primary coordinator.
    Proxy,
    /// Stateful storage node participating in data placement.
    Target,
}

/// Per-node flag bitset carried in the cluster map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeFlags(u16);

impl NodeFlags {
    /// Proxy may never be elected primary.
    pub const NON_ELECTABLE: Self = Self(1);
    /// Node is under maintenance: present but ineligible for placement.
    pub const MAINTENANCE: Self = Self(1 << 1);
    /// Node is being permanently decommissioned.
    pub const DECOMMISSION: Self = Self(1 << 2);
    /// Removal in progress (transient).
    pub const BEING_REMOVED: Self = Self(1 << 3);
    /// Either maintenance or decommission.
    pub const MAINT_OR_DECOMM: Self = Self(Self::MAINTENANCE.0 | Self::DECOMMISSION.0);

    /// Returns the union of `self` and `other`.
    #[must_use]
    pub const fn set(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns `self` with the bits of `other` cleared.
    #[must_use]
    pub const fn clear(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// True when any bit of `other` is set in `self`.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// True when no flags are set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// One network endpoint of a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetInfo {
    /// Hostname or address, no scheme.
    pub hostname: String,
    /// TCP port.
    pub port: u16,
}

impl NetInfo {
    /// Builds an endpoint from host and port.
    #[must_use]
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }

    /// Full URL for `path` on this endpoint.
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!("http://{}:{}{path}", self.hostname, self.port)
    }
}

impl fmt::Display for NetInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

/// Cluster-map entry describing a single daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Stable identifier; unique across the node's lifetime.
    pub id: NodeId,
    /// Proxy or target.
    pub role: NodeRole,
    /// Client-facing endpoint.
    pub public_net: NetInfo,
    /// Intra-cluster control endpoint (health, metasync, joins).
    pub control_net: NetInfo,
    /// Intra-cluster data endpoint.
    pub data_net: NetInfo,
    /// Current flag bits.
    #[serde(default)]
    pub flags: NodeFlags,
}

impl NodeDescriptor {
    /// Builds a descriptor with all three endpoints set to distinct ports on
    /// one host.
    #[must_use]
    pub fn new(id: impl Into<NodeId>, role: NodeRole, host: &str, base_port: u16) -> Self {
        Self {
            id: id.into(),
            role,
            public_net: NetInfo::new(host, base_port),
            control_net: NetInfo::new(host, base_port + 1),
            data_net: NetInfo::new(host, base_port + 2),
            flags: NodeFlags::default(),
        }
    }

    /// True for gateway nodes.
    #[must_use]
    pub fn is_proxy(&self) -> bool {
        self.role == NodeRole::Proxy
    }

    /// True for storage nodes.
    #[must_use]
    pub fn is_target(&self) -> bool {
        self.role == NodeRole::Target
    }

    /// True when the node carries maintenance or decommission flags and is
    /// therefore ineligible for data placement.
    #[must_use]
    pub fn in_maint_or_decomm(&self) -> bool {
        self.flags.intersects(NodeFlags::MAINT_OR_DECOMM)
    }

    /// Identity comparison ignoring flags: same id, role, and endpoints.
    #[must_use]
    pub fn same_identity(&self, other: &Self) -> bool {
        self.id == other.id
            && self.role == other.role
            && self.public_net == other.public_net
            && self.control_net == other.control_net
            && self.data_net == other.data_net
    }

    /// Content hash of the identity fields, used for duplicate detection.
    #[must_use]
    pub fn digest(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.id.hash(&mut hasher);
        self.role.hash(&mut hasher);
        self.public_net.hash(&mut hasher);
        self.control_net.hash(&mut hasher);
        self.data_net.hash(&mut hasher);
        hasher.finish()
    }

    /// URL for `path` on the intra-control endpoint.
    #[must_use]
    pub fn control_url(&self, path: &str) -> String {
        self.control_net.url(path)
    }

    /// Structural validation at admission time.
    pub fn validate(&self) -> Result<(), ControlError> {
        if self.id.as_str().is_empty() {
            return Err(ControlError::InvalidDescriptor("empty node ID".to_string()));
        }
        for net in [&self.public_net, &self.control_net, &self.data_net] {
            validate_hostname(&net.hostname)?;
            if net.port == 0 {
                return Err(ControlError::InvalidDescriptor(format!(
                    "{}: zero port",
                    self.id
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for NodeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.role {
            NodeRole::Proxy => write!(f, "p[{}]", self.id),
            NodeRole::Target => write!(f, "t[{}]", self.id),
        }
    }
}

fn validate_hostname(host: &str) -> Result<(), ControlError> {
    if host.is_empty() {
        return Err(ControlError::InvalidDescriptor(
            "empty hostname".to_string(),
        ));
    }
    if host
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':')))
    {
        return Err(ControlError::InvalidDescriptor(format!(
            "invalid hostname {host:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_set_and_clear() {
        let flags = NodeFlags::default()
            .set(NodeFlags::MAINTENANCE)
            .set(NodeFlags::NON_ELECTABLE);
        assert!(flags.intersects(NodeFlags::MAINT_OR_DECOMM));
        let cleared = flags.clear(NodeFlags::MAINTENANCE);
        assert!(!cleared.intersects(NodeFlags::MAINT_OR_DECOMM));
        assert!(cleared.intersects(NodeFlags::NON_ELECTABLE));
    }

    #[test]
    fn identity_ignores_flags() {
        let a = NodeDescriptor::new("t1", NodeRole::Target, "127.0.0.1", 9000);
        let mut b = a.clone();
        b.flags = NodeFlags::MAINTENANCE;
        assert!(a.same_identity(&b));
        assert_ne!(a, b);

        b.public_net.port = 9999;
        assert!(!a.same_identity(&b));
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn descriptor_validation_rejects_bad_hostname() {
        let mut si = NodeDescriptor::new("t1", NodeRole::Target, "127.0.0.1", 9000);
        si.control_net.hostname = "bad host".to_string();
        assert!(si.validate().is_err());
    }
}
