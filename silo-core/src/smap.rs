use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ControlError;
use crate::node::{NodeDescriptor, NodeFlags, NodeId};
use crate::revision::{Revision, RevisionKind};

/// The cluster map: the authoritative, versioned roster of proxies and
/// targets with one designated primary proxy.
///
/// Mutated only through the map's owner; every mutation produces a new
/// snapshot published wholesale, so readers always observe a complete map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterMap {
    /// Monotonic version; bumped on every published mutation.
    pub version: u64,
    /// Lineage identifier fixed at bootstrap.
    pub uuid: String,
    /// Gateway nodes by id.
    pub proxies: BTreeMap<NodeId, NodeDescriptor>,
    /// Storage nodes by id.
    pub targets: BTreeMap<NodeId, NodeDescriptor>,
    /// The coordinator; must reference a proxy not under maintenance.
    pub primary_id: Option<NodeId>,
    /// Information council: bounded subset of proxies mirroring
    /// notification state.
    pub ic: BTreeSet<NodeId>,
}

impl ClusterMap {
    /// Bootstrap map with a fresh lineage.
    #[must_use]
    pub fn new(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            ..Self::default()
        }
    }

    /// The primary's descriptor, when the map has one.
    #[must_use]
    pub fn primary(&self) -> Option<&NodeDescriptor> {
        self.primary_id.as_ref().and_then(|id| self.proxies.get(id))
    }

    /// True when `id` is the current primary.
    #[must_use]
    pub fn is_primary(&self, id: &NodeId) -> bool {
        self.primary_id.as_ref() == Some(id)
    }

    /// True when `id` sits on the information council.
    #[must_use]
    pub fn is_ic(&self, id: &NodeId) -> bool {
        self.ic.contains(id)
    }

    /// Looks up a node in either roster.
    #[must_use]
    pub fn get_node(&self, id: &NodeId) -> Option<&NodeDescriptor> {
        self.proxies.get(id).or_else(|| self.targets.get(id))
    }

    /// Node lookup that treats maintenance/decommission entries as absent.
    #[must_use]
    pub fn get_active(&self, id: &NodeId) -> Option<&NodeDescriptor> {
        self.get_node(id).filter(|si| !si.in_maint_or_decomm())
    }

    /// Targets eligible for data placement.
    #[must_use]
    pub fn count_active_targets(&self) -> usize {
        self.targets
            .values()
            .filter(|si| !si.in_maint_or_decomm())
            .count()
    }

    /// Proxies eligible to serve (not in maintenance/decommission).
    #[must_use]
    pub fn count_active_proxies(&self) -> usize {
        self.proxies
            .values()
            .filter(|si| !si.in_maint_or_decomm())
            .count()
    }

    /// Total daemon count, both rosters.
    #[must_use]
    pub fn count(&self) -> usize {
        self.proxies.len() + self.targets.len()
    }

    /// Inserts or replaces a node, applying `flags` on top of the
    /// descriptor's own. Returns true when a node with this id was already
    /// present.
    pub fn put_node(&mut self, mut si: NodeDescriptor, flags: NodeFlags) -> bool {
        si.flags = si.flags.set(flags);
        let id = si.id.clone();
        let existed = if si.is_proxy() {
            self.proxies.insert(id, si).is_some()
        } else {
            self.targets.insert(id, si).is_some()
        };
        existed
    }

    /// Removes a proxy; clears the primary designation if it pointed here.
    pub fn del_proxy(&mut self, id: &NodeId) -> Option<NodeDescriptor> {
        let removed = self.proxies.remove(id);
        if removed.is_some() {
            if self.primary_id.as_ref() == Some(id) {
                self.primary_id = None;
            }
            self.ic.remove(id);
        }
        removed
    }

    /// Removes a target.
    pub fn del_target(&mut self, id: &NodeId) -> Option<NodeDescriptor> {
        self.targets.remove(id)
    }

    /// ORs `flags` into the node's bitset. Fails when the id is unknown.
    pub fn set_node_flags(&mut self, id: &NodeId, flags: NodeFlags) -> Result<(), ControlError> {
        let version = self.version;
        let si = self
            .node_mut(id)
            .ok_or_else(|| ControlError::NodeNotFound {
                id: id.clone(),
                smap_version: version,
            })?;
        si.flags = si.flags.set(flags);
        Ok(())
    }

    /// Clears `flags` from the node's bitset. Fails when the id is unknown.
    pub fn clear_node_flags(&mut self, id: &NodeId, flags: NodeFlags) -> Result<(), ControlError> {
        let version = self.version;
        let si = self
            .node_mut(id)
            .ok_or_else(|| ControlError::NodeNotFound {
                id: id.clone(),
                smap_version: version,
            })?;
        si.flags = si.flags.clear(flags);
        Ok(())
    }

    fn node_mut(&mut self, id: &NodeId) -> Option<&mut NodeDescriptor> {
        if let Some(si) = self.proxies.get_mut(id) {
            return Some(si);
        }
        self.targets.get_mut(id)
    }

    /// Re-staffs the information council: up to `size` proxies in id order,
    /// skipping maintenance, decommission, and the non-electable. Sitting
    /// members keep their seats while they remain eligible.
    pub fn staff_ic(&mut self, size: usize) {
        let eligible = |si: &NodeDescriptor| {
            !si.in_maint_or_decomm() && !si.flags.intersects(NodeFlags::NON_ELECTABLE)
        };
        self.ic
            .retain(|id| self.proxies.get(id).is_some_and(eligible));
        for (id, si) in &self.proxies {
            if self.ic.len() >= size {
                break;
            }
            if eligible(si) {
                self.ic.insert(id.clone());
            }
        }
        while self.ic.len() > size {
            if let Some(last) = self.ic.iter().next_back().cloned() {
                self.ic.remove(&last);
            }
        }
    }

    /// Checks whether `nsi` clashes with a present node: same id but
    /// different identity fields. Returns the conflicting descriptor.
    #[must_use]
    pub fn find_duplicate(&self, nsi: &NodeDescriptor) -> Option<&NodeDescriptor> {
        self.get_node(&nsi.id).filter(|osi| !osi.same_identity(nsi))
    }

    /// Structural invariants: exactly one primary, referencing a proxy not
    /// under maintenance; rosters disjoint.
    pub fn validate(&self) -> Result<(), ControlError> {
        let Some(primary_id) = &self.primary_id else {
            return Err(ControlError::InvalidDescriptor(
                "cluster map has no primary".to_string(),
            ));
        };
        let Some(primary) = self.proxies.get(primary_id) else {
            return Err(ControlError::NodeNotFound {
                id: primary_id.clone(),
                smap_version: self.version,
            });
        };
        if primary.flags.intersects(NodeFlags::MAINTENANCE) {
            return Err(ControlError::InvalidDescriptor(format!(
                "primary {primary} is under maintenance"
            )));
        }
        if let Some(id) = self.proxies.keys().find(|id| self.targets.contains_key(id)) {
            return Err(ControlError::InvalidDescriptor(format!(
                "node {id} present in both rosters"
            )));
        }
        Ok(())
    }

    /// Lineage check against a peer-supplied map ("cie" on mismatch).
    pub fn validate_uuid(&self, other: &Self) -> Result<(), ControlError> {
        if self.uuid.is_empty() || other.uuid.is_empty() || self.uuid == other.uuid {
            return Ok(());
        }
        Err(ControlError::ClusterIntegrity {
            kind: RevisionKind::Smap,
            expected: self.uuid.clone(),
            got: other.uuid.clone(),
        })
    }
}

impl Revision for ClusterMap {
    fn kind(&self) -> RevisionKind {
        RevisionKind::Smap
    }
    fn version(&self) -> u64 {
        self.version
    }
    fn uuid(&self) -> &str {
        &self.uuid
    }
}

impl fmt::Display for ClusterMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "smap v{} [p={}, t={}, primary={}]",
            self.version,
            self.proxies.len(),
            self.targets.len(),
            self.primary_id
                .as_ref()
                .map_or("none", |id| id.as_str())
        )
    }
}

/// Decides whether a map transition requires data redistribution.
///
/// True iff an active target was added or activated, or removed or
/// deactivated, and both maps have at least one active target (with no data
/// on either side there is nothing to move).
#[must_use]
pub fn must_run_rebalance(prev: &ClusterMap, cur: &ClusterMap) -> bool {
    let changed = cur
        .targets
        .values()
        .filter(|si| !si.in_maint_or_decomm())
        .any(|si| prev.get_active(&si.id).is_none())
        || prev
            .targets
            .values()
            .filter(|si| !si.in_maint_or_decomm())
            .any(|si| cur.get_active(&si.id).is_none());
    changed && prev.count_active_targets() != 0 && cur.count_active_targets() != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeRole;

    fn make_proxy(idx: u16) -> NodeDescriptor {
        NodeDescriptor::new(format!("p{idx}"), NodeRole::Proxy, "127.0.0.1", 8000 + idx * 10)
    }

    fn make_target(idx: u16) -> NodeDescriptor {
        NodeDescriptor::new(format!("t{idx}"), NodeRole::Target, "127.0.0.1", 9000 + idx * 10)
    }

    fn make_map(proxies: u16, targets: u16) -> ClusterMap {
        let mut smap = ClusterMap::new("lineage-1");
        for idx in 1..=proxies {
            smap.put_node(make_proxy(idx), NodeFlags::default());
        }
        for idx in 1..=targets {
            smap.put_node(make_target(idx), NodeFlags::default());
        }
        smap.primary_id = Some(NodeId::from("p1"));
        smap.version = 1;
        smap
    }

    #[test]
    fn validate_requires_live_primary() {
        let mut smap = make_map(2, 1);
        assert!(smap.validate().is_ok());

        smap.set_node_flags(&NodeId::from("p1"), NodeFlags::MAINTENANCE)
            .unwrap();
        assert!(smap.validate().is_err());

        smap.primary_id = None;
        assert!(smap.validate().is_err());
    }

    #[test]
    fn del_proxy_clears_primary_and_ic() {
        let mut smap = make_map(3, 0);
        smap.staff_ic(3);
        assert!(smap.is_ic(&NodeId::from("p1")));

        smap.del_proxy(&NodeId::from("p1"));
        assert!(smap.primary_id.is_none());
        assert!(!smap.is_ic(&NodeId::from("p1")));
    }

    #[test]
    fn staff_ic_skips_maintenance_and_nonelectable() {
        let mut smap = make_map(5, 0);
        smap.set_node_flags(&NodeId::from("p2"), NodeFlags::MAINTENANCE)
            .unwrap();
        smap.set_node_flags(&NodeId::from("p3"), NodeFlags::NON_ELECTABLE)
            .unwrap();
        smap.staff_ic(3);
        let ic: Vec<_> = smap.ic.iter().map(NodeId::as_str).collect();
        assert_eq!(ic, ["p1", "p4", "p5"]);
    }

    #[test]
    fn rebalance_on_added_target() {
        let prev = make_map(1, 2);
        let mut cur = prev.clone();
        cur.put_node(make_target(3), NodeFlags::default());
        cur.version += 1;
        assert!(must_run_rebalance(&prev, &cur));
    }

    #[test]
    fn rebalance_on_removed_target() {
        let prev = make_map(1, 2);
        let mut cur = prev.clone();
        cur.del_target(&NodeId::from("t2"));
        cur.version += 1;
        assert!(must_run_rebalance(&prev, &cur));
    }

    #[test]
    fn maintenance_counts_as_absent() {
        // P4: a node in maintenance is treated as absent on either side.
        let prev = make_map(1, 2);
        let mut cur = prev.clone();
        cur.set_node_flags(&NodeId::from("t2"), NodeFlags::MAINTENANCE)
            .unwrap();
        assert!(must_run_rebalance(&prev, &cur));

        // Clearing the flag back is an activation.
        assert!(must_run_rebalance(&cur, &prev));
    }

    #[test]
    fn no_rebalance_without_data_to_move() {
        // Single-target cluster going into maintenance: cur has zero active
        // targets, so there is nowhere to move data.
        let prev = make_map(1, 1);
        let mut cur = prev.clone();
        cur.set_node_flags(&NodeId::from("t1"), NodeFlags::MAINTENANCE)
            .unwrap();
        assert!(!must_run_rebalance(&prev, &cur));

        // First target ever joining: prev had none.
        let empty = make_map(1, 0);
        let one = make_map(1, 1);
        assert!(!must_run_rebalance(&empty, &one));
    }

    #[test]
    fn no_rebalance_on_proxy_changes() {
        let prev = make_map(2, 2);
        let mut cur = prev.clone();
        cur.put_node(make_proxy(3), NodeFlags::default());
        cur.version += 1;
        assert!(!must_run_rebalance(&prev, &cur));
    }

    #[test]
    fn duplicate_detection_spares_identical_descriptor() {
        let smap = make_map(1, 1);
        let same = make_target(1);
        assert!(smap.find_duplicate(&same).is_none());

        let mut moved = make_target(1);
        moved.public_net.port = 19999;
        assert!(smap.find_duplicate(&moved).is_some());
    }

    #[test]
    fn lineage_mismatch_is_cie() {
        let a = make_map(1, 0);
        let mut b = make_map(1, 0);
        b.uuid = "lineage-2".to_string();
        assert!(matches!(
            a.validate_uuid(&b),
            Err(ControlError::ClusterIntegrity { .. })
        ));
        b.uuid = String::new();
        assert!(a.validate_uuid(&b).is_ok());
    }
}
