use std::sync::Arc;

use reqwest::Method;
use tracing::{error, info, warn};

use crate::client::{PATH_DAEMON_PROXY, ReqSpec};
use crate::daemon::{ClusterMetaBundle, ControlPlane, CoreEvent};
use crate::error::ControlError;
use crate::node::{NodeDescriptor, NodeFlags, NodeId};
use crate::owner::Mutation;
use crate::revision::{Action, ActionMsg};
use crate::smap::ClusterMap;

/// Administrative primary transition, run on the current primary.
///
/// Two phases: a prepare broadcast that must succeed everywhere, then the
/// local handover (transition latch, map update, metasync demotion), then
/// the commit broadcast. A commit failure on the incoming primary is fatal
/// for the caller; other commit failures are logged and heal via metasync.
pub async fn set_primary(core: &Arc<ControlPlane>, candidate: &NodeId) -> Result<(), ControlError> {
    let smap = core.smap();
    if !smap.is_primary(&core.si.id) {
        return Err(core.err_not_primary(&format!("cannot set primary to {candidate}")));
    }
    if core.in_primary_transition() {
        // A concurrent transition is already underway.
        return Err(ControlError::PrimaryNotReady {
            daemon: core.si.id.clone(),
            started: core.cluster_started(),
            reb_pending: core.reb_startup_pending(),
        });
    }
    let Some(psi) = smap.proxies.get(candidate).cloned() else {
        return Err(ControlError::NodeNotFound {
            id: candidate.clone(),
            smap_version: smap.version,
        });
    };
    if psi.id == core.si.id {
        warn!("{}: already the primary - nothing to do", core.si);
        return Ok(());
    }
    if psi.in_maint_or_decomm() {
        return Err(ControlError::InvalidDescriptor(format!(
            "cannot set primary: {psi} is under maintenance"
        )));
    }
    if psi.flags.intersects(NodeFlags::NON_ELECTABLE) {
        return Err(ControlError::InvalidDescriptor(format!(
            "cannot set primary: {psi} is non-electable"
        )));
    }
    if !core.cluster_started() || core.reb_startup_pending() {
        return Err(ControlError::PrimaryNotReady {
            daemon: core.si.id.clone(),
            started: core.cluster_started(),
            reb_pending: core.reb_startup_pending(),
        });
    }

    // (I.1) Prepare: inform every node; all must acknowledge.
    let meta = core.cluster_meta(false);
    let timeout = core.config().timeouts.cplane_operation;
    let peers: Vec<NodeDescriptor> = smap
        .proxies
        .values()
        .chain(smap.targets.values())
        .filter(|si| si.id != core.si.id)
        .cloned()
        .collect();
    let prepare_spec = ReqSpec::new(
        Method::PUT,
        format!("{PATH_DAEMON_PROXY}/{candidate}?prepare=true"),
        timeout,
    )
    .with_body(&meta)?;
    let results = core
        .client
        .broadcast(peers.clone(), prepare_spec, peers.len().max(1))
        .await;
    for result in &results {
        let failed = match &result.response {
            Ok(resp) if resp.is_success() => None,
            Ok(resp) => Some(format!("status {}: {}", resp.status, resp.text())),
            Err(err) => Some(err.to_string()),
        };
        if let Some(reason) = failed {
            return Err(ControlError::Transport(format!(
                "node {} failed to set primary {candidate} in the prepare phase: {reason}",
                result.id
            )));
        }
    }

    // (I.2) Local handover under the transition latch.
    core.set_primary_transition(true);
    let outcome = commit_transition(core, &psi, peers, timeout).await;
    core.set_primary_transition(false);
    outcome
}

async fn commit_transition(
    core: &Arc<ControlPlane>,
    psi: &NodeDescriptor,
    peers: Vec<NodeDescriptor>,
    timeout: std::time::Duration,
) -> Result<(), ControlError> {
    let mut handover = SetPrimaryMutation {
        core,
        candidate: psi.id.clone(),
    };
    core.owners.smap.modify(&mut handover).await?;

    // (II) Commit.
    let commit_spec = ReqSpec::new(
        Method::PUT,
        format!("{PATH_DAEMON_PROXY}/{}?prepare=false", psi.id),
        timeout,
    );
    let results = core
        .client
        .broadcast(peers.clone(), commit_spec, peers.len().max(1))
        .await;
    for result in results {
        let failed = match &result.response {
            Ok(resp) if resp.is_success() => None,
            Ok(resp) => Some(format!("status {}", resp.status)),
            Err(err) => Some(err.to_string()),
        };
        let Some(reason) = failed else { continue };
        if result.id == psi.id {
            // The cluster has committed locally; without the new primary
            // the state cannot be walked back.
            error!(
                "commit phase failure: new primary {} returned: {reason}",
                psi.id
            );
            core.emit(CoreEvent::TransitionCommitFailed {
                new_primary: psi.id.clone(),
            });
            return Err(ControlError::CommitFailed {
                new_primary: psi.id.clone(),
                reason,
            });
        }
        error!(
            "commit phase failure: {} returned {reason} when setting primary = {}",
            result.id, psi.id
        );
    }
    info!("{}: handed primary role to {}", core.si, psi.id);
    Ok(())
}

struct SetPrimaryMutation<'a> {
    core: &'a Arc<ControlPlane>,
    candidate: NodeId,
}

impl Mutation<ClusterMap> for SetPrimaryMutation<'_> {
    fn pre(&mut self, _prev: &ClusterMap, clone: &mut ClusterMap) -> Result<(), ControlError> {
        clone.primary_id = Some(self.candidate.clone());
        Ok(())
    }

    async fn finalize(&mut self, _prev: Arc<ClusterMap>, _published: Arc<ClusterMap>) {
        self.core.metasync.become_non_primary();
    }
}

/// Daemon side of the two-phase transition.
///
/// Prepare installs the accompanying metadata and validates the candidate;
/// commit applies the primary change locally. A proxy that finds itself the
/// new primary assumes the role: it activates its metasyncer and publishes
/// a bumped map to the whole cluster.
pub async fn receive_set_primary(
    core: &Arc<ControlPlane>,
    candidate: &NodeId,
    prepare: bool,
    meta: Option<ClusterMetaBundle>,
) -> Result<(), ControlError> {
    let smap = core.smap();
    if smap.version > 0 && smap.proxies.get(candidate).is_none() && candidate != &core.si.id {
        return Err(ControlError::NodeNotFound {
            id: candidate.clone(),
            smap_version: smap.version,
        });
    }
    if prepare {
        if let Some(meta) = meta {
            core.install_meta(meta)?;
        }
        info!("{}: prepared for primary transition to {candidate}", core.si);
        return Ok(());
    }

    if candidate == &core.si.id {
        become_primary(core).await;
        return Ok(());
    }
    let mut clone = (*core.smap()).clone();
    clone.primary_id = Some(candidate.clone());
    core.owners.smap.put(clone);
    info!("{}: committed primary transition to {candidate}", core.si);
    Ok(())
}

/// Assumes the primary role: bump and publish the map with self as
/// primary, activate distribution, and push the full metadata bundle so
/// every peer converges on the new coordinator.
pub async fn become_primary(core: &Arc<ControlPlane>) {
    let mut clone = (*core.smap()).clone();
    clone.primary_id = Some(core.si.id.clone());
    clone.staff_ic(core.config().ic.size);
    clone.version += 1;
    info!("{}: assuming primary role at {clone}", core.si);
    core.owners.smap.put(clone);
    core.metasync.become_primary();
    let mut pairs = core.owners.full_bundle();
    for (_, msg) in &mut pairs {
        *msg = ActionMsg::named(Action::SetPrimary, core.si.id.as_str());
    }
    core.metasync.sync(pairs).wait().await;
}

/// Deterministic successor for the automatic fail-over path: the lowest-id
/// electable proxy that is not the failed primary.
#[must_use]
pub fn successor_of(smap: &ClusterMap, failed: &NodeId) -> Option<NodeId> {
    smap.proxies
        .values()
        .filter(|si| &si.id != failed)
        .filter(|si| !si.in_maint_or_decomm())
        .filter(|si| !si.flags.intersects(NodeFlags::NON_ELECTABLE))
        .map(|si| si.id.clone())
        .min()
}

/// Reaction to an unresponsive primary, invoked by the daemon when the
/// keepaliver exhausts its retries. The full vote is delegated to the
/// surrounding system; this applies its deterministic outcome: the
/// successor takes over, everyone else waits to hear from it.
///
/// Returns true when this proxy assumed the primary role.
pub async fn on_primary_fail(core: &Arc<ControlPlane>, failed: &NodeId) -> bool {
    if !core.si.is_proxy() {
        return false;
    }
    let smap = core.smap();
    if !smap.is_primary(failed) {
        // A newer map already names a different primary.
        return false;
    }
    let Some(successor) = successor_of(&smap, failed) else {
        error!("{}: no electable successor for failed primary {failed}", core.si);
        return false;
    };
    if successor != core.si.id {
        info!(
            "{}: waiting for {successor} to take over from failed {failed}",
            core.si
        );
        return false;
    }
    warn!("{}: taking over from failed primary {failed}", core.si);
    become_primary(core).await;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::node::NodeRole;

    fn plane_with_proxies(self_id: &str, primary: &str, proxies: &[&str]) -> Arc<ControlPlane> {
        let mut base_port = 8000;
        let si = NodeDescriptor::new(self_id, NodeRole::Proxy, "127.0.0.1", 7000);
        let core = ControlPlane::new(si.clone(), ClusterConfig::default());
        let mut smap = ClusterMap::new("lineage");
        for id in proxies {
            let descriptor = if *id == self_id {
                si.clone()
            } else {
                base_port += 10;
                NodeDescriptor::new(*id, NodeRole::Proxy, "127.0.0.1", base_port)
            };
            smap.put_node(descriptor, NodeFlags::default());
        }
        smap.primary_id = Some(NodeId::from(primary));
        smap.staff_ic(3);
        smap.version = 5;
        core.owners.smap.put(smap);
        core.mark_node_started();
        core.mark_cluster_started();
        core
    }

    #[tokio::test]
    async fn set_primary_guards() {
        let core = plane_with_proxies("p1", "p1", &["p1", "p2", "p3"]);

        assert!(matches!(
            set_primary(&core, &NodeId::from("ghost")).await,
            Err(ControlError::NodeNotFound { .. })
        ));

        // Setting to self is a no-op.
        set_primary(&core, &NodeId::from("p1")).await.unwrap();
        assert_eq!(core.smap().version, 5);

        let mut smap = (*core.smap()).clone();
        smap.set_node_flags(&NodeId::from("p2"), NodeFlags::MAINTENANCE)
            .unwrap();
        core.owners.smap.put(smap);
        assert!(matches!(
            set_primary(&core, &NodeId::from("p2")).await,
            Err(ControlError::InvalidDescriptor(_))
        ));

        core.set_primary_transition(true);
        assert!(matches!(
            set_primary(&core, &NodeId::from("p3")).await,
            Err(ControlError::PrimaryNotReady { .. })
        ));
        core.set_primary_transition(false);
    }

    #[tokio::test]
    async fn non_primary_cannot_transition() {
        let core = plane_with_proxies("p2", "p1", &["p1", "p2", "p3"]);
        assert!(matches!(
            set_primary(&core, &NodeId::from("p3")).await,
            Err(ControlError::NotPrimary { .. })
        ));
    }

    #[tokio::test]
    async fn commit_receiver_applies_new_primary() {
        let core = plane_with_proxies("p3", "p1", &["p1", "p2", "p3"]);
        receive_set_primary(&core, &NodeId::from("p2"), false, None)
            .await
            .unwrap();
        assert!(core.smap().is_primary(&NodeId::from("p2")));
        assert!(!core.metasync.is_primary());
    }

    #[tokio::test]
    async fn commit_receiver_promotes_self() {
        let core = plane_with_proxies("p2", "p1", &["p1", "p2", "p3"]);
        let v = core.smap().version;
        receive_set_primary(&core, &NodeId::from("p2"), false, None)
            .await
            .unwrap();
        assert!(core.is_primary());
        assert!(core.metasync.is_primary());
        assert_eq!(core.smap().version, v + 1, "takeover publishes a newer map");
    }

    #[tokio::test]
    async fn successor_is_lowest_electable() {
        let core = plane_with_proxies("p3", "p1", &["p1", "p2", "p3", "p4"]);
        let mut smap = (*core.smap()).clone();
        smap.set_node_flags(&NodeId::from("p2"), NodeFlags::NON_ELECTABLE)
            .unwrap();
        core.owners.smap.put(smap);

        let successor = successor_of(&core.smap(), &NodeId::from("p1"));
        assert_eq!(successor, Some(NodeId::from("p3")));

        // p3 is this daemon: it takes over.
        assert!(on_primary_fail(&core, &NodeId::from("p1")).await);
        assert!(core.is_primary());
    }

    #[tokio::test]
    async fn bystander_waits_for_successor() {
        let core = plane_with_proxies("p4", "p1", &["p1", "p2", "p3", "p4"]);
        assert!(!on_primary_fail(&core, &NodeId::from("p1")).await);
        assert!(!core.is_primary());

        // Stale report: the map has moved on to a different primary.
        let mut smap = (*core.smap()).clone();
        smap.primary_id = Some(NodeId::from("p2"));
        smap.version += 1;
        core.owners.smap.put(smap);
        assert!(!on_primary_fail(&core, &NodeId::from("p1")).await);
    }
}
