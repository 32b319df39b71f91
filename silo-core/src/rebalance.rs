use std::sync::Arc;

use tracing::{info, warn};

use crate::daemon::ControlPlane;
use crate::error::ControlError;
use crate::node::{NodeFlags, NodeId};
use crate::notifs::{NlSummary, NotifCallback, NotifListener};
use crate::owner::Mutation;
use crate::revision::{Action, ActionMsg, RevisionPayload};
use crate::rmd::RebalanceMd;
use crate::smap::{ClusterMap, must_run_rebalance};

/// Opens the next rebalance epoch.
pub(crate) struct RmdInc {
    /// Targets added in this step, when the trigger was a join.
    pub target_ids: Vec<NodeId>,
}

impl Mutation<RebalanceMd> for RmdInc {
    fn pre(&mut self, _prev: &RebalanceMd, clone: &mut RebalanceMd) -> Result<(), ControlError> {
        clone.inc();
        clone.target_ids = std::mem::take(&mut self.target_ids);
        Ok(())
    }
}

/// Registers the primary-side listener aggregating completion notifications
/// for one rebalance epoch. Notifiers are the active targets of the map the
/// epoch was derived from.
pub(crate) fn register_reb_listener(
    core: &ControlPlane,
    rmd: &RebalanceMd,
    smap: &ClusterMap,
    callback: Option<NotifCallback>,
) {
    let notifiers = smap
        .targets
        .values()
        .filter(|si| !si.in_maint_or_decomm())
        .map(|si| si.id.clone())
        .collect();
    let nl = Arc::new(NotifListener::new(
        rmd.rebalance_id(),
        Action::Rebalance,
        smap.version,
        notifiers,
    ));
    if let Some(callback) = callback {
        nl.set_callback(callback);
    }
    if !core.notifs.add(nl) {
        warn!("rebalance {} already has a listener", rmd.rebalance_id());
    }
}

/// Membership edits that share the publish-then-metasync pipeline.
pub(crate) enum SmapOp {
    /// Drop unresponsive nodes found by the primary keepalive sweep.
    Evict(Vec<NodeId>),
    /// OR flags into a node (maintenance start, decommission marking).
    SetFlags(NodeId, NodeFlags),
    /// Clear flags from a node (maintenance stop).
    ClearFlags(NodeId, NodeFlags),
    /// Remove one node outright.
    Remove(NodeId),
}

/// Smap mutation used by eviction, maintenance, and removal flows: `pre`
/// applies the edit, `post` derives the rebalance epoch when the active
/// target set changed, `finalize` metasyncs the map (and RMD) as one batch
/// and registers the completion listener.
pub(crate) struct SmapChange<'a> {
    pub core: &'a Arc<ControlPlane>,
    pub op: SmapOp,
    pub msg: ActionMsg,
    /// Suppress rebalance derivation regardless of the transition.
    pub skip_reb: bool,
    /// Await the first metasync attempt round before returning; used when
    /// the change involves a target.
    pub wait: bool,
    pub callback: Option<NotifCallback>,
    /// Epoch derived in `post`, if any.
    pub rmd: Option<Arc<RebalanceMd>>,
    pub removed: usize,
}

impl<'a> SmapChange<'a> {
    pub fn new(core: &'a Arc<ControlPlane>, op: SmapOp, msg: ActionMsg) -> Self {
        Self {
            core,
            op,
            msg,
            skip_reb: false,
            wait: false,
            callback: None,
            rmd: None,
            removed: 0,
        }
    }

    /// Rebalance id of the epoch this change opened, if any.
    pub fn rebalance_id(&self) -> Option<String> {
        self.rmd.as_ref().map(|rmd| rmd.rebalance_id())
    }
}

impl Mutation<ClusterMap> for SmapChange<'_> {
    fn pre(&mut self, _prev: &ClusterMap, clone: &mut ClusterMap) -> Result<(), ControlError> {
        if !clone.is_primary(&self.core.si.id) {
            return Err(self.core.err_not_primary("cannot modify cluster map"));
        }
        match &self.op {
            SmapOp::Evict(ids) => {
                for id in ids {
                    if clone.del_proxy(id).is_some() {
                        info!(peer = %id, "keepalive: removed proxy");
                        self.removed += 1;
                    } else if clone.del_target(id).is_some() {
                        info!(peer = %id, "keepalive: removed target");
                        self.removed += 1;
                    } else {
                        warn!(peer = %id, "keepalive: not present in {clone}");
                    }
                }
                if self.removed == 0 {
                    return Err(ControlError::NodeNotFound {
                        id: ids.first().cloned().unwrap_or_else(|| NodeId::from("")),
                        smap_version: clone.version,
                    });
                }
            }
            SmapOp::SetFlags(id, flags) => {
                clone.set_node_flags(id, *flags)?;
            }
            SmapOp::ClearFlags(id, flags) => {
                clone.clear_node_flags(id, *flags)?;
            }
            SmapOp::Remove(id) => {
                if !self.core.node_started() {
                    return Err(ControlError::PrimaryNotReady {
                        daemon: self.core.si.id.clone(),
                        started: self.core.cluster_started(),
                        reb_pending: self.core.reb_startup_pending(),
                    });
                }
                let node = clone.get_node(id).cloned().ok_or(ControlError::NodeNotFound {
                    id: id.clone(),
                    smap_version: clone.version,
                })?;
                if node.is_proxy() {
                    clone.del_proxy(id);
                    info!("removed {node} ({} proxies left)", clone.proxies.len());
                } else {
                    clone.del_target(id);
                    info!("removed {node} ({} targets left)", clone.targets.len());
                }
                self.removed = 1;
            }
        }
        let ic_size = self.core.config().ic.size;
        clone.staff_ic(ic_size);
        Ok(())
    }

    async fn post(&mut self, prev: &Arc<ClusterMap>, published: &Arc<ClusterMap>) {
        if self.skip_reb || self.core.can_run_rebalance().is_err() {
            return;
        }
        if !must_run_rebalance(prev, published) {
            return;
        }
        match self
            .core
            .owners
            .rmd
            .modify(&mut RmdInc {
                target_ids: Vec::new(),
            })
            .await
        {
            Ok(rmd) => self.rmd = Some(rmd),
            Err(err) => warn!("failed to open rebalance epoch: {err}"),
        }
    }

    async fn finalize(&mut self, _prev: Arc<ClusterMap>, published: Arc<ClusterMap>) {
        let mut pairs = vec![(RevisionPayload::Smap(Arc::clone(&published)), self.msg.clone())];
        if let Some(rmd) = &self.rmd {
            register_reb_listener(self.core, rmd, &published, self.callback.take());
            pairs.push((RevisionPayload::Rmd(Arc::clone(rmd)), self.msg.clone()));
        }
        let handle = self.core.metasync.sync(pairs);
        if self.wait {
            handle.wait().await;
        }
    }
}

/// Derives and metasyncs a standalone rebalance epoch (explicit rebalance,
/// maintenance of a target when the map itself already changed).
pub(crate) async fn bump_and_sync_rmd(
    core: &Arc<ControlPlane>,
    msg: ActionMsg,
    callback: Option<NotifCallback>,
    wait: bool,
) -> Result<Arc<RebalanceMd>, ControlError> {
    let smap = core.smap();
    let rmd = core
        .owners
        .rmd
        .modify(&mut RmdInc {
            target_ids: Vec::new(),
        })
        .await?;
    register_reb_listener(core, &rmd, &smap, callback);
    let handle = core
        .metasync
        .sync(vec![(RevisionPayload::Rmd(Arc::clone(&rmd)), msg)]);
    if wait {
        handle.wait().await;
    }
    Ok(rmd)
}

/// Starts an operator-requested cluster-wide rebalance. Soft no-op when
/// there is nothing to move; hard error when this proxy cannot trigger one.
pub async fn rebalance_cluster(core: &Arc<ControlPlane>) -> Result<Option<String>, ControlError> {
    match core.can_run_rebalance() {
        // Operator request overrides the config switch being off.
        Ok(()) | Err(ControlError::RebalanceDisabled) => {}
        Err(err) => return Err(err),
    }
    if core.smap().count_active_targets() < 2 {
        warn!("rebalance requested with fewer than 2 active targets - nothing to do");
        return Ok(None);
    }
    let rmd = bump_and_sync_rmd(core, ActionMsg::new(Action::Rebalance), None, false).await?;
    Ok(Some(rmd.rebalance_id()))
}

/// Puts a node into maintenance (or marks it for decommission/shutdown),
/// rebalancing data off targets first. Returns the rebalance id when an
/// epoch was opened.
pub async fn rm_node(
    core: &Arc<ControlPlane>,
    id: &NodeId,
    action: Action,
    skip_rebalance: bool,
) -> Result<Option<String>, ControlError> {
    let smap = core.smap();
    let node = smap
        .get_node(id)
        .cloned()
        .ok_or(ControlError::NodeNotFound {
            id: id.clone(),
            smap_version: smap.version,
        })?;
    if node.in_maint_or_decomm() {
        return Err(ControlError::InvalidDescriptor(format!(
            "{node} is already in maintenance"
        )));
    }
    if node.id == core.si.id {
        return Err(ControlError::InvalidDescriptor(format!(
            "{node} is the primary; cannot {action:?} self"
        )));
    }
    let flags = match action {
        Action::StartMaintenance => NodeFlags::MAINTENANCE,
        Action::DecommissionNode | Action::ShutdownNode => {
            NodeFlags::MAINTENANCE.set(NodeFlags::DECOMMISSION)
        }
        _ => {
            return Err(ControlError::InvalidDescriptor(format!(
                "{action:?} is not a removal action"
            )));
        }
    };

    let mut change = SmapChange::new(
        core,
        SmapOp::SetFlags(id.clone(), flags),
        ActionMsg::named(action, id.as_str()),
    );
    change.skip_reb = skip_rebalance;
    change.wait = node.is_target();
    if node.is_target() && matches!(action, Action::DecommissionNode | Action::ShutdownNode) {
        change.callback = Some(remove_after_rebalance(core, id.clone(), action));
    }
    core.owners.smap.modify(&mut change).await?;
    let reb_id = change.rebalance_id();

    // No rebalance epoch was opened (last target, disabled, proxy, or
    // explicit skip): finish the removal right away.
    if reb_id.is_none() && matches!(action, Action::DecommissionNode | Action::ShutdownNode) {
        call_rm_self(core, id, action).await;
        unreg_node(core, id, action, true).await?;
    }
    Ok(reb_id)
}

/// Clears maintenance flags after probing the node back to health.
pub async fn stop_maintenance(
    core: &Arc<ControlPlane>,
    id: &NodeId,
) -> Result<Option<String>, ControlError> {
    let smap = core.smap();
    let node = smap
        .get_node(id)
        .cloned()
        .ok_or(ControlError::NodeNotFound {
            id: id.clone(),
            smap_version: smap.version,
        })?;
    if !node.in_maint_or_decomm() {
        return Err(ControlError::InvalidDescriptor(format!(
            "{node} is not under maintenance"
        )));
    }
    let timeout = core.config().timeouts.cplane_operation;
    if let Err(first) = core.client.health(&node, timeout).await {
        tokio::time::sleep(timeout).await;
        if let Err(err) = core.client.health(&node, timeout).await {
            warn!("{node} still unreachable after retry ({first}; {err})");
            return Err(err);
        }
    }
    let mut change = SmapChange::new(
        core,
        SmapOp::ClearFlags(id.clone(), NodeFlags::MAINT_OR_DECOMM),
        ActionMsg::named(Action::StopMaintenance, id.as_str()),
    );
    change.wait = node.is_target();
    core.owners.smap.modify(&mut change).await?;
    Ok(change.rebalance_id())
}

/// Removes a node from the map and metasyncs the shrunken cluster.
pub async fn unreg_node(
    core: &Arc<ControlPlane>,
    id: &NodeId,
    action: Action,
    skip_rebalance: bool,
) -> Result<(), ControlError> {
    let mut change = SmapChange::new(
        core,
        SmapOp::Remove(id.clone()),
        ActionMsg::named(action, id.as_str()),
    );
    change.skip_reb = skip_rebalance;
    change.wait = true;
    core.owners.smap.modify(&mut change).await?;
    Ok(())
}

/// Asks the node to take itself down; proceeds regardless of the outcome
/// (the node may already be gone).
pub(crate) async fn call_rm_self(core: &Arc<ControlPlane>, id: &NodeId, action: Action) {
    let smap = core.smap();
    let Some(node) = smap.get_node(id) else {
        return;
    };
    let timeout = core.config().timeouts.cplane_operation;
    let spec = match crate::client::ReqSpec::new(reqwest::Method::DELETE, "/v1/daemon/rm-self", timeout)
        .with_body(&ActionMsg::named(action, id.as_str()))
    {
        Ok(spec) => spec,
        Err(err) => {
            warn!("rm-self encoding failed: {err}");
            return;
        }
    };
    info!("asking {node} to remove itself ({action:?})");
    if let Err(err) = core.client.call(node, &spec).await {
        warn!("{node} being removed failed to respond: {err}");
    }
}

fn remove_after_rebalance(
    core: &Arc<ControlPlane>,
    id: NodeId,
    action: Action,
) -> NotifCallback {
    let core = Arc::clone(core);
    Box::new(move |summary: NlSummary| {
        if summary.aborted || summary.err.is_some() {
            warn!(
                "rebalance {} did not finish cleanly (aborted: {}, err: {:?}); {id} stays in the map",
                summary.uuid, summary.aborted, summary.err
            );
            return;
        }
        info!("rebalance {} finished; removing {id}", summary.uuid);
        tokio::spawn(async move {
            call_rm_self(&core, &id, action).await;
            if let Err(err) = unreg_node(&core, &id, action, true).await {
                warn!("failed to remove {id} after rebalance: {err}");
            }
        });
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::daemon::ControlPlane;
    use crate::node::{NodeDescriptor, NodeRole};

    async fn primary_with_targets(targets: u16) -> Arc<ControlPlane> {
        let si = NodeDescriptor::new("p1", NodeRole::Proxy, "127.0.0.1", 8000);
        let core = ControlPlane::new(si, ClusterConfig::default());
        core.bootstrap_primary();
        for idx in 1..=targets {
            let mut smap = (*core.smap()).clone();
            smap.put_node(
                NodeDescriptor::new(
                    format!("t{idx}"),
                    NodeRole::Target,
                    "127.0.0.1",
                    9000 + idx * 10,
                ),
                NodeFlags::default(),
            );
            smap.version += 1;
            core.owners.smap.put(smap);
        }
        core
    }

    #[tokio::test]
    async fn eviction_bumps_rmd_and_shrinks_map() {
        let core = primary_with_targets(3).await;
        let v_before = core.smap().version;
        let mut change = SmapChange::new(
            &core,
            SmapOp::Evict(vec![NodeId::from("t3")]),
            ActionMsg::new(Action::KeepaliveEvict),
        );
        core.owners.smap.modify(&mut change).await.unwrap();
        assert_eq!(change.removed, 1);
        assert_eq!(core.smap().version, v_before + 1);
        assert!(core.smap().get_node(&NodeId::from("t3")).is_none());
        assert_eq!(core.owners.rmd.get().version, 1);
        assert_eq!(change.rebalance_id().as_deref(), Some("1"));
        // The epoch's listener aggregates the remaining targets.
        let status = core.notifs.status();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].notifiers, 2);
    }

    #[tokio::test]
    async fn evicting_unknown_nodes_is_skipped() {
        let core = primary_with_targets(1).await;
        let v_before = core.smap().version;
        let mut change = SmapChange::new(
            &core,
            SmapOp::Evict(vec![NodeId::from("ghost")]),
            ActionMsg::new(Action::KeepaliveEvict),
        );
        assert!(matches!(
            core.owners.smap.modify(&mut change).await,
            Err(ControlError::NodeNotFound { .. })
        ));
        assert_eq!(core.smap().version, v_before);
    }

    #[tokio::test]
    async fn last_target_maintenance_skips_rebalance() {
        let core = primary_with_targets(1).await;
        let reb = rm_node(&core, &NodeId::from("t1"), Action::StartMaintenance, false)
            .await
            .unwrap();
        assert!(reb.is_none(), "no data to move with a single target");
        let smap = core.smap();
        assert!(smap
            .get_node(&NodeId::from("t1"))
            .unwrap()
            .in_maint_or_decomm());
        assert_eq!(core.owners.rmd.get().version, 0);
    }

    #[tokio::test]
    async fn target_maintenance_triggers_rebalance() {
        let core = primary_with_targets(3).await;
        let reb = rm_node(&core, &NodeId::from("t2"), Action::StartMaintenance, false)
            .await
            .unwrap();
        assert_eq!(reb.as_deref(), Some("1"));
        assert_eq!(core.smap().count_active_targets(), 2);
    }

    #[tokio::test]
    async fn rm_node_guards() {
        let core = primary_with_targets(2).await;
        assert!(matches!(
            rm_node(&core, &NodeId::from("ghost"), Action::StartMaintenance, false).await,
            Err(ControlError::NodeNotFound { .. })
        ));
        assert!(
            rm_node(&core, &NodeId::from("p1"), Action::StartMaintenance, false)
                .await
                .is_err(),
            "primary cannot maintenance itself"
        );
        rm_node(&core, &NodeId::from("t1"), Action::StartMaintenance, true)
            .await
            .unwrap();
        assert!(matches!(
            rm_node(&core, &NodeId::from("t1"), Action::StartMaintenance, false).await,
            Err(ControlError::InvalidDescriptor(_))
        ));
    }

    #[tokio::test]
    async fn explicit_rebalance_needs_two_targets() {
        let core = primary_with_targets(1).await;
        assert_eq!(rebalance_cluster(&core).await.unwrap(), None);

        let core = primary_with_targets(2).await;
        assert_eq!(rebalance_cluster(&core).await.unwrap().as_deref(), Some("1"));
    }
}
