use serde::{Deserialize, Serialize};

use crate::node::NodeId;
use crate::revision::{Revision, RevisionKind};

/// Rebalance metadata. Each version increment opens a new logical rebalance
/// epoch; the decimal string of the version is the rebalance id surfaced to
/// clients and notification listeners.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RebalanceMd {
    /// Monotonic epoch counter.
    pub version: u64,
    /// Lineage identifier shared with the rest of the cluster metadata.
    pub uuid: String,
    /// Targets added in this step, when the trigger was a join.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_ids: Vec<NodeId>,
}

impl RebalanceMd {
    /// Opens the next epoch, clearing the per-step target list.
    pub fn inc(&mut self) {
        self.version += 1;
        self.target_ids.clear();
    }

    /// Client-facing identifier of the epoch.
    #[must_use]
    pub fn rebalance_id(&self) -> String {
        self.version.to_string()
    }
}

impl Revision for RebalanceMd {
    fn kind(&self) -> RevisionKind {
        RevisionKind::Rmd
    }
    fn version(&self) -> u64 {
        self.version
    }
    fn uuid(&self) -> &str {
        &self.uuid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inc_clears_step_targets() {
        let mut rmd = RebalanceMd::default();
        rmd.target_ids.push(NodeId::from("t1"));
        rmd.inc();
        assert_eq!(rmd.version, 1);
        assert!(rmd.target_ids.is_empty());
        assert_eq!(rmd.rebalance_id(), "1");
    }
}
