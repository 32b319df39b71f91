use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};
use uuid::Uuid;

use crate::client::ControlClient;
use crate::config::ClusterConfig;
use crate::error::ControlError;
use crate::join::JoinRequest;
use crate::metasync::Metasyncer;
use crate::node::{NodeDescriptor, NodeFlags, NodeId};
use crate::notifs::{NotifListener, NotifRegistry};
use crate::owner::Owner;
use crate::revision::{
    Action, ActionMsg, Admission, BucketMd, ConfigRev, EtlMd, RevisionEnvelope, RevisionKind,
    RevisionPayload, TokenList, admit,
};
use crate::rmd::RebalanceMd;
use crate::smap::ClusterMap;

/// The owners guarding each distributable revision kind.
pub struct Owners {
    /// Cluster map.
    pub smap: Arc<Owner<ClusterMap>>,
    /// Rebalance metadata.
    pub rmd: Arc<Owner<RebalanceMd>>,
    /// Bucket metadata shell.
    pub bmd: Arc<Owner<BucketMd>>,
    /// Cluster configuration.
    pub config: Arc<Owner<ConfigRev>>,
    /// Revoked tokens.
    pub tokens: Arc<Owner<TokenList>>,
    /// ETL metadata shell.
    pub etl: Arc<Owner<EtlMd>>,
}

impl Owners {
    /// Fresh owners around empty metadata carrying `config`.
    #[must_use]
    pub fn new(config: ClusterConfig) -> Arc<Self> {
        Arc::new(Self {
            smap: Arc::new(Owner::new(ClusterMap::default())),
            rmd: Arc::new(Owner::new(RebalanceMd::default())),
            bmd: Arc::new(Owner::new(BucketMd::default())),
            config: Arc::new(Owner::new(ConfigRev {
                version: 1,
                uuid: String::new(),
                config,
            })),
            tokens: Arc::new(Owner::new(TokenList::default())),
            etl: Arc::new(Owner::new(EtlMd::default())),
        })
    }

    /// Current cluster configuration.
    #[must_use]
    pub fn cluster_config(&self) -> ClusterConfig {
        self.config.get().config.clone()
    }

    /// Every currently meaningful revision, for full resyncs and the
    /// admin-join handshake.
    #[must_use]
    pub fn full_bundle(&self) -> Vec<(RevisionPayload, ActionMsg)> {
        let msg = ActionMsg::new(Action::KeepaliveUpdate);
        let mut pairs = vec![
            (RevisionPayload::Smap(self.smap.get()), msg.clone()),
            (RevisionPayload::Bmd(self.bmd.get()), msg.clone()),
            (RevisionPayload::Config(self.config.get()), msg.clone()),
            (RevisionPayload::Rmd(self.rmd.get()), msg.clone()),
        ];
        let tokens = self.tokens.get();
        if !tokens.revoked.is_empty() {
            pairs.push((RevisionPayload::Tokens(tokens), msg.clone()));
        }
        let etl = self.etl.get();
        if etl.version > 0 {
            pairs.push((RevisionPayload::EtlMd(etl), msg));
        }
        pairs
    }

    /// Reject subsequent modifications on all owners.
    pub fn stop(&self) {
        self.smap.stop();
        self.rmd.stop();
        self.bmd.stop();
        self.config.stop();
        self.tokens.stop();
        self.etl.stop();
    }
}

/// Cluster metadata bundle exchanged at join time. The map is omitted on
/// the handshake and self-join replies; it arrives via metasync once the
/// join has been published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMetaBundle {
    /// Cluster map, when included.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smap: Option<ClusterMap>,
    /// Bucket metadata.
    pub bmd: BucketMd,
    /// Rebalance metadata.
    pub rmd: RebalanceMd,
    /// Cluster configuration revision.
    pub config: ConfigRev,
    /// Revoked tokens.
    pub tokens: TokenList,
}

/// Events the core surfaces to the embedding daemon.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// The primary stopped responding to keepalives; an election is due.
    PrimaryFailed {
        /// The unresponsive primary.
        primary: NodeId,
    },
    /// Commit-phase failure during a primary transition; the daemon should
    /// treat this as fatal.
    TransitionCommitFailed {
        /// The proxy that was being promoted.
        new_primary: NodeId,
    },
}

/// Shared control-plane state of one daemon: the owners, the metasyncer,
/// the notification registry, and the lifecycle flags everything else keys
/// off.
pub struct ControlPlane {
    /// This daemon's descriptor.
    pub si: NodeDescriptor,
    /// Revision owners.
    pub owners: Arc<Owners>,
    /// Intra-cluster client.
    pub client: ControlClient,
    /// Revision distributor (active only on the primary).
    pub metasync: Arc<Metasyncer>,
    /// Notification aggregation.
    pub notifs: NotifRegistry,
    /// Joins deferred until cluster startup completes.
    pub reg_pool: Mutex<Vec<JoinRequest>>,
    node_started: AtomicBool,
    cluster_started: AtomicBool,
    reb_startup_pending: AtomicBool,
    stopping: AtomicBool,
    in_primary_transition: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    events_tx: broadcast::Sender<CoreEvent>,
}

impl ControlPlane {
    /// Wires up the control plane for one daemon. Metadata starts empty;
    /// call [`bootstrap_primary`](Self::bootstrap_primary) on the founding
    /// proxy, or learn state from the primary via the join flow.
    #[must_use]
    pub fn new(si: NodeDescriptor, config: ClusterConfig) -> Arc<Self> {
        let owners = Owners::new(config);
        let client = ControlClient::new(si.id.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let metasync = Metasyncer::spawn(
            si.clone(),
            client.clone(),
            Arc::clone(&owners),
            shutdown_rx,
        );
        let (events_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            si,
            owners,
            client,
            metasync,
            notifs: NotifRegistry::new(),
            reg_pool: Mutex::new(Vec::new()),
            node_started: AtomicBool::new(false),
            cluster_started: AtomicBool::new(false),
            reb_startup_pending: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            in_primary_transition: AtomicBool::new(false),
            shutdown_tx,
            events_tx,
        })
    }

    /// Founds a new cluster with this proxy as primary: fresh lineage,
    /// map v1 containing only self.
    pub fn bootstrap_primary(&self) {
        let lineage = Uuid::new_v4().simple().to_string();
        let mut smap = ClusterMap::new(lineage.clone());
        smap.put_node(self.si.clone(), NodeFlags::default());
        smap.primary_id = Some(self.si.id.clone());
        smap.staff_ic(self.owners.cluster_config().ic.size);
        smap.version = 1;
        self.owners.smap.put(smap);

        let mut rmd = (*self.owners.rmd.get()).clone();
        rmd.uuid = lineage.clone();
        self.owners.rmd.put(rmd);
        let mut bmd = (*self.owners.bmd.get()).clone();
        bmd.uuid = lineage.clone();
        bmd.version = 1;
        self.owners.bmd.put(bmd);
        let mut config = (*self.owners.config.get()).clone();
        config.uuid = lineage;
        self.owners.config.put(config);

        self.metasync.become_primary();
        self.mark_node_started();
        self.mark_cluster_started();
        info!("bootstrapped {} as primary: {}", self.si, self.smap());
    }

    /// Current cluster-map snapshot.
    #[must_use]
    pub fn smap(&self) -> Arc<ClusterMap> {
        self.owners.smap.get()
    }

    /// Current cluster configuration.
    #[must_use]
    pub fn config(&self) -> ClusterConfig {
        self.owners.cluster_config()
    }

    /// True when this daemon is the primary proxy.
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.smap().is_primary(&self.si.id)
    }

    /// Local initialization finished.
    #[must_use]
    pub fn node_started(&self) -> bool {
        self.node_started.load(Ordering::Acquire)
    }

    /// Marks local initialization as finished.
    pub fn mark_node_started(&self) {
        self.node_started.store(true, Ordering::Release);
    }

    /// Cluster-wide startup finished (initial membership assembled).
    #[must_use]
    pub fn cluster_started(&self) -> bool {
        self.cluster_started.load(Ordering::Acquire)
    }

    /// Marks cluster startup as finished.
    pub fn mark_cluster_started(&self) {
        self.cluster_started.store(true, Ordering::Release);
    }

    /// A startup-time rebalance has yet to resolve.
    #[must_use]
    pub fn reb_startup_pending(&self) -> bool {
        self.reb_startup_pending.load(Ordering::Acquire)
    }

    /// Sets or clears the startup-rebalance latch.
    pub fn set_reb_startup_pending(&self, pending: bool) {
        self.reb_startup_pending.store(pending, Ordering::Release);
    }

    /// Global stop flag.
    #[must_use]
    pub fn stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Begins shutdown: owners reject new mutations, background tasks
    /// observe the watch channel and drain.
    pub fn stop(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("{}: stopping control plane", self.si);
        self.owners.stop();
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown signal for background tasks.
    #[must_use]
    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Subscribes to core events (primary failure, fatal transition).
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<CoreEvent> {
        self.events_tx.subscribe()
    }

    pub(crate) fn emit(&self, event: CoreEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Primary-transition latch. While set, inbound keepalives are ignored
    /// and concurrent set-primary requests are rejected.
    #[must_use]
    pub fn in_primary_transition(&self) -> bool {
        self.in_primary_transition.load(Ordering::Acquire)
    }

    pub(crate) fn set_primary_transition(&self, active: bool) {
        self.in_primary_transition.store(active, Ordering::Release);
    }

    /// Preflight for any rebalance-triggering operation.
    pub fn can_run_rebalance(&self) -> Result<(), ControlError> {
        let smap = self.smap();
        smap.validate()?;
        if !smap.is_primary(&self.si.id) {
            return Err(self.err_not_primary("cannot trigger rebalance"));
        }
        if !self.cluster_started() || self.reb_startup_pending() {
            return Err(ControlError::PrimaryNotReady {
                daemon: self.si.id.clone(),
                started: self.cluster_started(),
                reb_pending: self.reb_startup_pending(),
            });
        }
        if !self.config().rebalance.enabled {
            return Err(ControlError::RebalanceDisabled);
        }
        Ok(())
    }

    /// NotPrimary error against the current map.
    #[must_use]
    pub fn err_not_primary(&self, detail: &str) -> ControlError {
        ControlError::NotPrimary {
            daemon: self.si.id.clone(),
            primary: self.smap().primary_id.clone(),
            detail: detail.to_string(),
        }
    }

    /// Cluster metadata for handshakes and self-join replies.
    #[must_use]
    pub fn cluster_meta(&self, include_smap: bool) -> ClusterMetaBundle {
        ClusterMetaBundle {
            smap: include_smap.then(|| (*self.smap()).clone()),
            bmd: (*self.owners.bmd.get()).clone(),
            rmd: (*self.owners.rmd.get()).clone(),
            config: (*self.owners.config.get()).clone(),
            tokens: (*self.owners.tokens.get()).clone(),
        }
    }

    /// Installs a received metadata bundle (join replies, handshakes),
    /// subject to the same admission rules as metasync.
    pub fn install_meta(&self, meta: ClusterMetaBundle) -> Result<(), ControlError> {
        if let Some(smap) = meta.smap {
            self.install_smap(smap)?;
        }
        self.install_if_newer(RevisionKind::Bmd, meta.bmd.version, &meta.bmd.uuid.clone(), |this| {
            this.owners.bmd.put(meta.bmd.clone());
        })?;
        self.install_if_newer(RevisionKind::Rmd, meta.rmd.version, &meta.rmd.uuid.clone(), |this| {
            this.owners.rmd.put(meta.rmd.clone());
        })?;
        self.install_if_newer(
            RevisionKind::Config,
            meta.config.version,
            &meta.config.uuid.clone(),
            |this| {
                this.owners.config.put(meta.config.clone());
            },
        )?;
        self.install_if_newer(
            RevisionKind::Tokens,
            meta.tokens.version,
            &meta.tokens.uuid.clone(),
            |this| {
                this.owners.tokens.put(meta.tokens.clone());
            },
        )?;
        Ok(())
    }

    fn install_if_newer(
        &self,
        kind: RevisionKind,
        version: u64,
        uuid: &str,
        install: impl FnOnce(&Self),
    ) -> Result<(), ControlError> {
        let installed = self.installed(kind);
        match admit(kind, Some((installed.0, &installed.1)), version, uuid)? {
            Admission::Install => {
                install(self);
                Ok(())
            }
            Admission::Skip => Ok(()),
        }
    }

    fn installed(&self, kind: RevisionKind) -> (u64, String) {
        match kind {
            RevisionKind::Smap => {
                let smap = self.owners.smap.get();
                (smap.version, smap.uuid.clone())
            }
            RevisionKind::Bmd => {
                let bmd = self.owners.bmd.get();
                (bmd.version, bmd.uuid.clone())
            }
            RevisionKind::Rmd => {
                let rmd = self.owners.rmd.get();
                (rmd.version, rmd.uuid.clone())
            }
            RevisionKind::Config => {
                let config = self.owners.config.get();
                (config.version, config.uuid.clone())
            }
            RevisionKind::Tokens => {
                let tokens = self.owners.tokens.get();
                (tokens.version, tokens.uuid.clone())
            }
            RevisionKind::EtlMd => {
                let etl = self.owners.etl.get();
                (etl.version, etl.uuid.clone())
            }
        }
    }

    /// Applies one metasync batch as a set: each revision is admitted
    /// independently, stale versions drop silently, and a lineage mismatch
    /// rejects the whole delivery.
    pub fn receive_batch(&self, envelopes: Vec<RevisionEnvelope>) -> Result<(), ControlError> {
        for env in envelopes {
            let installed = self.installed(env.kind);
            match admit(env.kind, Some((installed.0, &installed.1)), env.version, &env.uuid)? {
                Admission::Skip => continue,
                Admission::Install => {}
            }
            match env.kind {
                RevisionKind::Smap => {
                    let smap: ClusterMap = serde_json::from_value(env.payload)?;
                    self.install_smap(smap)?;
                }
                RevisionKind::Bmd => {
                    self.owners.bmd.put(serde_json::from_value(env.payload)?);
                }
                RevisionKind::Rmd => {
                    let rmd: RebalanceMd = serde_json::from_value(env.payload)?;
                    self.receive_rmd(rmd);
                }
                RevisionKind::Config => {
                    self.owners.config.put(serde_json::from_value(env.payload)?);
                }
                RevisionKind::Tokens => {
                    self.owners.tokens.put(serde_json::from_value(env.payload)?);
                }
                RevisionKind::EtlMd => {
                    self.owners.etl.put(serde_json::from_value(env.payload)?);
                }
            }
        }
        Ok(())
    }

    fn install_smap(&self, smap: ClusterMap) -> Result<(), ControlError> {
        let current = self.smap();
        current.validate_uuid(&smap)?;
        if smap.version <= current.version && current.version > 0 {
            return Ok(());
        }
        let was_primary = current.is_primary(&self.si.id);
        let now_primary = smap.is_primary(&self.si.id);
        info!("{}: installing {}", self.si, smap);
        self.owners.smap.put(smap);
        let installed = self.smap();
        self.notifs.on_smap_changed(&installed);
        if was_primary && !now_primary {
            self.metasync.become_non_primary();
        } else if !was_primary && now_primary {
            self.metasync.become_primary();
        }
        Ok(())
    }

    /// Installs a received RMD revision and, on information-council
    /// members, registers the listener that aggregates the rebalance
    /// epoch's completion notifications.
    fn receive_rmd(&self, rmd: RebalanceMd) {
        let reb_id = rmd.rebalance_id();
        self.owners.rmd.put(rmd);
        let smap = self.smap();
        if !smap.is_ic(&self.si.id) || smap.is_primary(&self.si.id) {
            return;
        }
        let notifiers = smap
            .targets
            .values()
            .filter(|si| !si.in_maint_or_decomm())
            .map(|si| si.id.clone())
            .collect();
        let nl = Arc::new(NotifListener::new(
            reb_id,
            Action::Rebalance,
            smap.version,
            notifiers,
        ));
        if !self.notifs.add(nl) {
            warn!("listener for rebalance {} already mirrored", self.owners.rmd.get().rebalance_id());
        }
    }
}

/// Applies a cluster-config update on the primary. Persistent updates go
/// through the config owner and are metasynced; transient ones only touch
/// the in-memory copy of this daemon.
pub async fn set_cluster_config(
    core: &Arc<ControlPlane>,
    upd: crate::config::ConfigUpdate,
    transient: bool,
) -> Result<(), ControlError> {
    if upd.is_empty() {
        return Err(ControlError::InvalidDescriptor(
            "empty config update".to_string(),
        ));
    }
    if transient {
        let mut rev = (*core.owners.config.get()).clone();
        if rev.config.apply(&upd) {
            core.owners.config.put(rev);
        }
        return Ok(());
    }
    if !core.is_primary() {
        return Err(core.err_not_primary("cannot update cluster config"));
    }
    let mut change = ConfigChange { core, upd };
    core.owners.config.modify(&mut change).await?;
    Ok(())
}

/// Resets the cluster configuration to defaults and metasyncs it.
pub async fn reset_cluster_config(core: &Arc<ControlPlane>) -> Result<(), ControlError> {
    if !core.is_primary() {
        return Err(core.err_not_primary("cannot reset cluster config"));
    }
    let mut change = ConfigReset { core };
    core.owners.config.modify(&mut change).await?;
    Ok(())
}

struct ConfigChange<'a> {
    core: &'a Arc<ControlPlane>,
    upd: crate::config::ConfigUpdate,
}

impl crate::owner::Mutation<ConfigRev> for ConfigChange<'_> {
    fn pre(&mut self, _prev: &ConfigRev, clone: &mut ConfigRev) -> Result<(), ControlError> {
        if !clone.config.apply(&self.upd) {
            return Err(ControlError::InvalidDescriptor(
                "config update changes nothing".to_string(),
            ));
        }
        Ok(())
    }

    async fn finalize(&mut self, _prev: Arc<ConfigRev>, published: Arc<ConfigRev>) {
        let msg = ActionMsg::new(Action::SetConfig);
        self.core
            .metasync
            .sync(vec![(RevisionPayload::Config(published), msg)])
            .wait()
            .await;
    }
}

struct ConfigReset<'a> {
    core: &'a Arc<ControlPlane>,
}

impl crate::owner::Mutation<ConfigRev> for ConfigReset<'_> {
    fn pre(&mut self, _prev: &ConfigRev, clone: &mut ConfigRev) -> Result<(), ControlError> {
        clone.config = ClusterConfig::default();
        Ok(())
    }

    async fn finalize(&mut self, _prev: Arc<ConfigRev>, published: Arc<ConfigRev>) {
        let msg = ActionMsg::new(Action::ResetConfig);
        self.core
            .metasync
            .sync(vec![(RevisionPayload::Config(published), msg)])
            .wait()
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeRole;
    use crate::revision::RevisionPayload;

    fn make_plane() -> Arc<ControlPlane> {
        let si = NodeDescriptor::new("p1", NodeRole::Proxy, "127.0.0.1", 8000);
        ControlPlane::new(si, ClusterConfig::default())
    }

    #[tokio::test]
    async fn bootstrap_primary_founds_cluster() {
        let plane = make_plane();
        plane.bootstrap_primary();
        let smap = plane.smap();
        assert_eq!(smap.version, 1);
        assert!(smap.is_primary(&NodeId::from("p1")));
        assert!(smap.is_ic(&NodeId::from("p1")));
        assert!(plane.is_primary());
        assert!(plane.metasync.is_primary());
        assert!(!smap.uuid.is_empty());
    }

    #[tokio::test]
    async fn receive_batch_drops_stale_and_installs_newer() {
        let plane = make_plane();
        plane.bootstrap_primary();
        let lineage = plane.smap().uuid.clone();

        // Equal-version BMD silently drops.
        let bmd = BucketMd {
            version: 1,
            uuid: lineage.clone(),
        };
        let env = RevisionPayload::Bmd(Arc::new(bmd))
            .to_envelope(&ActionMsg::new(Action::SetConfig))
            .unwrap();
        plane.receive_batch(vec![env]).unwrap();
        assert_eq!(plane.owners.bmd.get().version, 1);

        // Newer installs.
        let bmd = BucketMd {
            version: 3,
            uuid: lineage,
        };
        let env = RevisionPayload::Bmd(Arc::new(bmd))
            .to_envelope(&ActionMsg::new(Action::SetConfig))
            .unwrap();
        plane.receive_batch(vec![env]).unwrap();
        assert_eq!(plane.owners.bmd.get().version, 3);
    }

    #[tokio::test]
    async fn receive_batch_rejects_foreign_lineage() {
        let plane = make_plane();
        plane.bootstrap_primary();
        let bmd = BucketMd {
            version: 9,
            uuid: "foreign".to_string(),
        };
        let env = RevisionPayload::Bmd(Arc::new(bmd))
            .to_envelope(&ActionMsg::new(Action::SetConfig))
            .unwrap();
        assert!(matches!(
            plane.receive_batch(vec![env]),
            Err(ControlError::ClusterIntegrity { .. })
        ));
    }

    #[tokio::test]
    async fn installing_map_with_new_primary_demotes_metasyncer() {
        let plane = make_plane();
        plane.bootstrap_primary();
        assert!(plane.metasync.is_primary());

        let mut next = (*plane.smap()).clone();
        next.put_node(
            NodeDescriptor::new("p2", NodeRole::Proxy, "127.0.0.1", 8100),
            NodeFlags::default(),
        );
        next.primary_id = Some(NodeId::from("p2"));
        next.version += 1;
        plane.install_smap(next).unwrap();
        assert!(!plane.is_primary());
        assert!(!plane.metasync.is_primary());
    }

    #[tokio::test]
    async fn can_run_rebalance_gates() {
        let plane = make_plane();
        plane.bootstrap_primary();
        assert!(plane.can_run_rebalance().is_ok());

        plane.set_reb_startup_pending(true);
        assert!(matches!(
            plane.can_run_rebalance(),
            Err(ControlError::PrimaryNotReady { .. })
        ));
        plane.set_reb_startup_pending(false);

        let mut config = plane.config();
        config.rebalance.enabled = false;
        let mut rev = (*plane.owners.config.get()).clone();
        rev.config = config;
        rev.version += 1;
        plane.owners.config.put(rev);
        assert!(matches!(
            plane.can_run_rebalance(),
            Err(ControlError::RebalanceDisabled)
        ));
    }
}
