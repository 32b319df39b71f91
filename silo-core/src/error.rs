use thiserror::Error;

use crate::node::NodeId;
use crate::revision::RevisionKind;

/// Errors surfaced by the control-plane core.
#[derive(Debug, Error)]
pub enum ControlError {
    /// A mutating request reached a proxy that is not the current primary.
    /// The caller must re-resolve the primary and retry.
    #[error("{daemon}: not the primary proxy (primary is {primary:?}): {detail}")]
    NotPrimary {
        /// Proxy that rejected the request.
        daemon: NodeId,
        /// Primary known to that proxy, if any.
        primary: Option<NodeId>,
        /// What was attempted.
        detail: String,
    },
    /// UUID lineage mismatch for a revision kind ("cie"). The peer
    /// relationship is broken until the offender re-bootstraps.
    #[error("cluster integrity error: {kind:?} uuid {got} does not match lineage {expected}")]
    ClusterIntegrity {
        /// Revision kind whose lineage diverged.
        kind: RevisionKind,
        /// Locally installed lineage uuid.
        expected: String,
        /// Lineage uuid carried by the offending revision.
        got: String,
    },
    /// Two live nodes claim the same daemon ID.
    #[error("duplicate daemon ID {id}: {held_by} vs {claimed_by}")]
    DuplicateDaemonId {
        /// The contested identifier.
        id: NodeId,
        /// Endpoint of the node already holding the ID.
        held_by: String,
        /// Endpoint of the newcomer.
        claimed_by: String,
    },
    /// The id is absent from the current cluster map.
    #[error("node {id} not found in cluster map v{smap_version}")]
    NodeNotFound {
        /// Identifier that failed to resolve.
        id: NodeId,
        /// Version of the map consulted.
        smap_version: u64,
    },
    /// Cluster is still bootstrapping, or a startup rebalance is pending.
    /// The request should be retried later.
    #[error("{daemon}: primary not ready (cluster started: {started}, startup rebalance pending: {reb_pending})")]
    PrimaryNotReady {
        /// Proxy reporting the condition.
        daemon: NodeId,
        /// Whether cluster startup has completed.
        started: bool,
        /// Whether a startup-time rebalance has yet to resolve.
        reb_pending: bool,
    },
    /// Configuration forbids rebalancing. Rebalance requests become no-ops.
    #[error("rebalance is disabled by configuration")]
    RebalanceDisabled,
    /// The peer could not be reached; subject to the caller's retry logic.
    #[error("{peer} unreachable: {reason}")]
    Unreachable {
        /// Peer that failed to respond.
        peer: NodeId,
        /// Transport-level detail.
        reason: String,
    },
    /// Commit phase of a primary transition failed on the incoming primary.
    /// The cluster has committed locally; the daemon treats this as fatal.
    #[error("primary transition commit failed on new primary {new_primary}: {reason}")]
    CommitFailed {
        /// The proxy that was being promoted.
        new_primary: NodeId,
        /// Why the commit broadcast failed there.
        reason: String,
    },
    /// Descriptor failed structural validation at admission.
    #[error("invalid node descriptor: {0}")]
    InvalidDescriptor(String),
    /// Not enough targets to perform the requested operation.
    #[error("not enough active targets: have {have}, need {need}")]
    NotEnoughTargets {
        /// Active targets in the current map.
        have: usize,
        /// Minimum required by the operation.
        need: usize,
    },
    /// The daemon is shutting down; new work is rejected.
    #[error("shutting down")]
    Stopping,
    /// Payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Underlying HTTP transport failure that is not peer-attributable.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ControlError {
    /// Connection-level failures that keepalive retry loops may absorb
    /// without penalizing the attempt counter.
    #[must_use]
    pub const fn is_retriable_conn(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }

    /// True for the kinds a caller is expected to retry after re-resolving
    /// cluster state, as opposed to hard failures.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Unreachable { .. } | Self::NotPrimary { .. } | Self::PrimaryNotReady { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_is_retriable_conn() {
        let err = ControlError::Unreachable {
            peer: NodeId::from("t1"),
            reason: "connection refused".to_string(),
        };
        assert!(err.is_retriable_conn());
        assert!(err.is_retriable());
    }

    #[test]
    fn cie_is_not_retriable() {
        let err = ControlError::ClusterIntegrity {
            kind: RevisionKind::Smap,
            expected: "abc".to_string(),
            got: "def".to_string(),
        };
        assert!(!err.is_retriable());
    }
}
