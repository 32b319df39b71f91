use std::sync::Arc;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::client::{PATH_DAEMON_ADMIN_JOIN, ReqSpec};
use crate::daemon::{ClusterMetaBundle, ControlPlane};
use crate::error::ControlError;
use crate::node::{NodeDescriptor, NodeFlags, NodeId};
use crate::owner::Mutation;
use crate::rebalance::{RmdInc, register_reb_listener};
use crate::revision::{Action, ActionMsg, RevisionPayload};
use crate::rmd::RebalanceMd;
use crate::smap::{ClusterMap, must_run_rebalance};

/// The three admission entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOp {
    /// Node auto-registering at startup.
    SelfJoin,
    /// Operator-driven registration.
    AdminJoin,
    /// Re-attestation from a node already expected in the map.
    Keepalive,
}

impl JoinOp {
    fn action(self, si: &NodeDescriptor) -> Action {
        match (self, si.is_proxy()) {
            (Self::SelfJoin, true) => Action::SelfJoinProxy,
            (Self::SelfJoin, false) => Action::SelfJoinTarget,
            (Self::AdminJoin, true) => Action::AdminJoinProxy,
            (Self::AdminJoin, false) => Action::AdminJoinTarget,
            (Self::Keepalive, _) => Action::KeepaliveUpdate,
        }
    }
}

/// Wire body of self-join and keepalive requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    /// The joining (or re-attesting) node.
    pub si: NodeDescriptor,
    /// The node's current view of the cluster map, for lineage validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smap: Option<ClusterMap>,
    /// Target-only: a previous rebalance was interrupted by restart.
    #[serde(default)]
    pub reb_interrupted: bool,
}

/// Primary's answer to an admission request.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct JoinResponse {
    /// Canonical id of the admitted node.
    pub daemon_id: Option<NodeId>,
    /// Rebalance epoch opened by this admission, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rebalance_id: Option<String>,
    /// Cluster metadata (map excluded; it arrives via metasync).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<ClusterMetaBundle>,
    /// Whether the cluster map was (or will be) mutated.
    pub updated: bool,
    /// Keepalive from an unknown node: it should re-join.
    #[serde(default)]
    pub rejoin: bool,
}

/// Admits a self-join, admin-join, or keepalive renewal on the primary.
pub async fn handle_join(
    core: &Arc<ControlPlane>,
    req: JoinRequest,
    op: JoinOp,
    non_electable: bool,
) -> Result<JoinResponse, ControlError> {
    // A retiring primary ignores keepalive beats mid-transition.
    if core.in_primary_transition() && op == JoinOp::Keepalive {
        return Ok(JoinResponse::default());
    }
    let smap = core.smap();
    if !smap.is_primary(&core.si.id) {
        return Err(core.err_not_primary(&format!("cannot admit {}", req.si)));
    }
    let mut nsi = req.si.clone();
    nsi.validate()?;

    // Admission never resets flags the cluster already holds for this id.
    if let Some(osi) = smap.get_node(&nsi.id) {
        nsi.flags = osi.flags;
    }
    if non_electable && nsi.is_proxy() {
        nsi.flags = nsi.flags.set(NodeFlags::NON_ELECTABLE);
    }

    // Lineage check against the joiner's view ("cie" on divergence); a
    // view that has fallen behind gets a full resync of the delta.
    if let Some(reg_smap) = &req.smap {
        smap.validate_uuid(reg_smap)?;
        if reg_smap.version + 1 < smap.version {
            warn!(
                "{}: {nsi} lags at map v{} (cluster at v{}) - resyncing",
                core.si, reg_smap.version, smap.version
            );
            core.metasync.resync_peer(nsi.id.clone());
        }
    }

    let update = match op {
        JoinOp::Keepalive => match smap.get_node(&nsi.id) {
            None => {
                // The map has no such node; hint it to run the join flow.
                return Ok(JoinResponse {
                    daemon_id: Some(nsi.id),
                    rejoin: true,
                    ..JoinResponse::default()
                });
            }
            Some(osi) if osi.same_identity(&nsi) => false,
            Some(osi) => {
                ensure_not_duplicate(core, osi, &nsi).await?;
                warn!("{}: renewing registration of {nsi} (identity changed)", core.si);
                true
            }
        },
        JoinOp::SelfJoin => match smap.get_node(&nsi.id) {
            Some(osi) if osi.same_identity(&nsi) => {
                info!("{}: {nsi} is already registered", core.si);
                false
            }
            Some(osi) => {
                ensure_not_duplicate(core, osi, &nsi).await?;
                warn!("{}: self-join of {nsi} renews a stale registration", core.si);
                true
            }
            None => true,
        },
        JoinOp::AdminJoin => true,
    };

    if nsi.is_target() && req.reb_interrupted && core.node_started() {
        warn!("{}: {nsi} reports an interrupted rebalance", core.si);
        core.set_reb_startup_pending(true);
    }

    if !update {
        return Ok(JoinResponse {
            daemon_id: Some(nsi.id.clone()),
            meta: (op == JoinOp::SelfJoin).then(|| core.cluster_meta(false)),
            ..JoinResponse::default()
        });
    }

    // Joins arriving before cluster startup finishes are pooled and
    // replayed; the map is grown without the full pipeline to speed up
    // initial assembly.
    if op == JoinOp::SelfJoin && !core.cluster_started() {
        core.reg_pool.lock().push(req);
        fast_put_node(core, nsi.clone());
        return Ok(JoinResponse {
            daemon_id: Some(nsi.id),
            meta: Some(core.cluster_meta(false)),
            updated: true,
            ..JoinResponse::default()
        });
    }

    if op == JoinOp::AdminJoin {
        admin_join_handshake(core, &nsi).await?;
    }

    let action = op.action(&nsi);
    info!("{}: admitting {nsi} ({action:?})", core.si);
    let mut join = JoinMutation {
        core,
        nsi: nsi.clone(),
        msg: ActionMsg::named(action, nsi.id.as_str()),
        existed: false,
        reb: false,
        rmd: None,
    };
    core.owners.smap.modify(&mut join).await?;

    Ok(JoinResponse {
        daemon_id: Some(nsi.id),
        rebalance_id: join.reb.then(|| join.rmd.as_ref().map(|rmd| rmd.rebalance_id())).flatten(),
        meta: (op == JoinOp::SelfJoin).then(|| core.cluster_meta(false)),
        updated: true,
        rejoin: false,
    })
}

/// Replays joins that arrived before cluster startup completed, this time
/// through the full pipeline.
pub async fn replay_reg_pool(core: &Arc<ControlPlane>) {
    let pool: Vec<JoinRequest> = std::mem::take(&mut *core.reg_pool.lock());
    for req in pool {
        let si = req.si.clone();
        if let Err(err) = handle_join(core, req, JoinOp::SelfJoin, false).await {
            warn!("deferred join of {si} failed: {err}");
        }
    }
}

/// Node side of the self-join flow: register with the primary at
/// `join_url`, install the returned metadata bundle, and wait for the map
/// to arrive via metasync.
pub async fn self_join(
    core: &Arc<ControlPlane>,
    join_url: &str,
    non_electable: bool,
    reb_interrupted: bool,
) -> Result<(), ControlError> {
    let current = core.smap();
    let req = JoinRequest {
        si: core.si.clone(),
        smap: (current.version > 0).then(|| (*current).clone()),
        reb_interrupted,
    };
    let timeout = core.config().timeouts.cplane_operation;
    let mut path = crate::client::PATH_CLUSTER_SELF_JOIN.to_string();
    if non_electable {
        path.push_str("?non_electable=true");
    }
    let spec = ReqSpec::new(Method::POST, path, timeout).with_body(&req)?;
    let resp = core
        .client
        .call_url(join_url, &core.si.id, &spec)
        .await?;
    if !resp.is_success() {
        return Err(ControlError::Transport(format!(
            "self-join rejected with {}: {}",
            resp.status,
            resp.text()
        )));
    }
    let reply: JoinResponse = resp.json()?;
    if let Some(meta) = reply.meta {
        core.install_meta(meta)?;
    }
    info!("{}: joined cluster via {join_url}", core.si);
    Ok(())
}

/// Out-of-band duplicate probe: when the known descriptor still answers at
/// its old address, the newcomer's id claim is rejected.
async fn ensure_not_duplicate(
    core: &Arc<ControlPlane>,
    osi: &NodeDescriptor,
    nsi: &NodeDescriptor,
) -> Result<(), ControlError> {
    let timeout = core.config().timeouts.cplane_operation;
    match core.client.health(osi, timeout).await {
        Ok(()) => Err(ControlError::DuplicateDaemonId {
            id: nsi.id.clone(),
            held_by: osi.control_net.to_string(),
            claimed_by: nsi.control_net.to_string(),
        }),
        Err(ControlError::Unreachable { .. }) => Ok(()),
        Err(err) => Err(err),
    }
}

/// Handshake preceding an admin join: push cluster metadata (map excluded)
/// to the joining node and only proceed when it accepts.
async fn admin_join_handshake(
    core: &Arc<ControlPlane>,
    nsi: &NodeDescriptor,
) -> Result<(), ControlError> {
    let meta = core.cluster_meta(false);
    let timeout = core.config().timeouts.cplane_operation;
    let spec = ReqSpec::new(Method::PUT, PATH_DAEMON_ADMIN_JOIN, timeout).with_body(&meta)?;
    let resp = core.client.call(nsi, &spec).await?;
    if resp.is_success() {
        return Ok(());
    }
    Err(ControlError::Transport(format!(
        "{nsi}: admin-join handshake rejected with {}: {}",
        resp.status,
        resp.text()
    )))
}

fn fast_put_node(core: &Arc<ControlPlane>, nsi: NodeDescriptor) {
    let mut clone = (*core.smap()).clone();
    let flags = nsi.flags;
    clone.put_node(nsi, flags);
    clone.staff_ic(core.config().ic.size);
    clone.version += 1;
    core.owners.smap.put(clone);
}

struct JoinMutation<'a> {
    core: &'a Arc<ControlPlane>,
    nsi: NodeDescriptor,
    msg: ActionMsg,
    existed: bool,
    reb: bool,
    rmd: Option<Arc<RebalanceMd>>,
}

impl Mutation<ClusterMap> for JoinMutation<'_> {
    fn pre(&mut self, _prev: &ClusterMap, clone: &mut ClusterMap) -> Result<(), ControlError> {
        if !clone.is_primary(&self.core.si.id) {
            return Err(self.core.err_not_primary(&format!("cannot add {}", self.nsi)));
        }
        let flags = self.nsi.flags;
        self.existed = clone.put_node(self.nsi.clone(), flags);
        clone.staff_ic(self.core.config().ic.size);
        Ok(())
    }

    async fn post(&mut self, prev: &Arc<ClusterMap>, published: &Arc<ClusterMap>) {
        if !self.nsi.is_target() {
            // RMD rides along on proxy joins so a newly admitted proxy can
            // become primary moments later without a resync.
            self.rmd = Some(self.core.owners.rmd.get());
            return;
        }
        if self.core.can_run_rebalance().is_err() {
            return;
        }
        // A re-join of a known target id also forces an epoch: the node may
        // have restarted with partial content.
        if self.existed || must_run_rebalance(prev, published) {
            match self
                .core
                .owners
                .rmd
                .modify(&mut RmdInc {
                    target_ids: vec![self.nsi.id.clone()],
                })
                .await
            {
                Ok(rmd) => {
                    self.reb = true;
                    self.rmd = Some(rmd);
                }
                Err(err) => warn!("failed to open rebalance epoch for {}: {err}", self.nsi),
            }
        }
    }

    async fn finalize(&mut self, _prev: Arc<ClusterMap>, published: Arc<ClusterMap>) {
        let msg = &self.msg;
        let mut pairs = vec![
            (
                RevisionPayload::Config(self.core.owners.config.get()),
                msg.clone(),
            ),
            (RevisionPayload::Smap(Arc::clone(&published)), msg.clone()),
            (RevisionPayload::Bmd(self.core.owners.bmd.get()), msg.clone()),
        ];
        if let Some(rmd) = &self.rmd {
            if self.reb {
                register_reb_listener(self.core, rmd, &published, None);
            }
            pairs.push((RevisionPayload::Rmd(Arc::clone(rmd)), msg.clone()));
        }
        let tokens = self.core.owners.tokens.get();
        if !tokens.revoked.is_empty() {
            pairs.push((RevisionPayload::Tokens(tokens), msg.clone()));
        }
        let etl = self.core.owners.etl.get();
        if etl.version > 0 {
            pairs.push((RevisionPayload::EtlMd(etl), msg.clone()));
        }
        let _ = self.core.metasync.sync(pairs);
    }
}
