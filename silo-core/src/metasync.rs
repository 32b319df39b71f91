use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use reqwest::Method;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::{ControlClient, PATH_METASYNC, ReqSpec};
use crate::daemon::Owners;
use crate::node::{NodeDescriptor, NodeId};
use crate::revision::{ActionMsg, RevisionEnvelope, RevisionKind, RevisionPayload};

const RETRY_BASE: Duration = Duration::from_secs(1);
const RETRY_CAP: Duration = Duration::from_secs(30);
const MAX_RETRY_ATTEMPTS: u32 = 8;

/// Completion handle for one metasync batch: resolves once at least one
/// attempt has been made to every recipient known at publication time.
/// Failed recipients move to background retry and do not block the wait.
pub struct SyncHandle {
    rx: Option<oneshot::Receiver<()>>,
}

impl SyncHandle {
    fn pending(rx: oneshot::Receiver<()>) -> Self {
        Self { rx: Some(rx) }
    }

    fn done() -> Self {
        Self { rx: None }
    }

    /// Waits for the first delivery attempt round to finish.
    pub async fn wait(mut self) {
        if let Some(rx) = self.rx.take() {
            let _ = rx.await;
        }
    }
}

enum Work {
    Batch {
        pairs: Vec<(RevisionPayload, ActionMsg)>,
        done: Option<oneshot::Sender<()>>,
    },
    BecomeNonPrimary,
    Resync {
        peer: NodeId,
    },
}

/// Disseminates revision batches to the current recipient set with
/// at-least-once delivery and per-recipient version monotonicity.
///
/// Batches are serialized through a dispatcher task, so a batch published by
/// modification N is enqueued before modification N's final hook returns and
/// recipients never observe N+1 effects without N having been attempted.
pub struct Metasyncer {
    work_tx: mpsc::UnboundedSender<Work>,
    active: AtomicBool,
}

impl Metasyncer {
    /// Starts the dispatcher task and returns the shared handle.
    pub fn spawn(
        si: NodeDescriptor,
        client: ControlClient,
        owners: Arc<Owners>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher {
            si,
            client,
            owners,
            ledger: HashMap::new(),
            retry: HashMap::new(),
            rng: SmallRng::from_entropy(),
        };
        tokio::spawn(dispatcher.run(work_rx, shutdown));
        Arc::new(Self {
            work_tx,
            active: AtomicBool::new(false),
        })
    }

    /// Enqueues one atomic batch; returns a handle resolving after the
    /// first attempt round. No-op (already-resolved handle) on a
    /// non-primary.
    pub fn sync(&self, pairs: Vec<(RevisionPayload, ActionMsg)>) -> SyncHandle {
        if !self.active.load(Ordering::Acquire) {
            debug!("metasync skipped: not primary");
            return SyncHandle::done();
        }
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .work_tx
            .send(Work::Batch {
                pairs,
                done: Some(done_tx),
            })
            .is_err()
        {
            return SyncHandle::done();
        }
        SyncHandle::pending(done_rx)
    }

    /// Fire-and-forget variant used for best-effort warm-up messages.
    pub fn notify(&self, pairs: Vec<(RevisionPayload, ActionMsg)>) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }
        let _ = self.work_tx.send(Work::Batch { pairs, done: None });
    }

    /// Schedules a full-bundle resync for one lagging or diverged peer.
    pub fn resync_peer(&self, peer: NodeId) {
        if self.active.load(Ordering::Acquire) {
            let _ = self.work_tx.send(Work::Resync { peer });
        }
    }

    /// Marks this daemon as the active distributor (new primary starts with
    /// an empty retry set).
    pub fn become_primary(&self) {
        self.active.store(true, Ordering::Release);
    }

    /// Drains pending work and stops distributing; called when the local
    /// proxy hands the primary role over.
    pub fn become_non_primary(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            info!("metasyncer: becoming non-primary");
            let _ = self.work_tx.send(Work::BecomeNonPrimary);
        }
    }

    /// Whether this metasyncer currently distributes metadata.
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

struct RetryEntry {
    si: NodeDescriptor,
    envelopes: Vec<RevisionEnvelope>,
    attempts: u32,
    next_at: Instant,
}

struct Dispatcher {
    si: NodeDescriptor,
    client: ControlClient,
    owners: Arc<Owners>,
    /// Last version successfully delivered, per peer per kind.
    ledger: HashMap<NodeId, HashMap<RevisionKind, u64>>,
    retry: HashMap<NodeId, RetryEntry>,
    rng: SmallRng,
}

impl Dispatcher {
    async fn run(mut self, mut work_rx: mpsc::UnboundedReceiver<Work>, mut shutdown: watch::Receiver<bool>) {
        let mut retry_tick = tokio::time::interval(RETRY_BASE);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                work = work_rx.recv() => match work {
                    None => break,
                    Some(Work::Batch { pairs, done }) => {
                        self.send_batch(pairs, done).await;
                    }
                    Some(Work::BecomeNonPrimary) => {
                        self.retry.clear();
                        self.ledger.clear();
                    }
                    Some(Work::Resync { peer }) => self.resync(peer).await,
                },
                _ = retry_tick.tick() => self.retry_pending().await,
            }
        }
        // Bounded final drain so a clean shutdown does not strand peers
        // that were one retry away from convergence.
        let deadline = Instant::now() + Duration::from_secs(2);
        while !self.retry.is_empty() && Instant::now() < deadline {
            self.retry_pending().await;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    fn recipients(&self) -> Vec<NodeDescriptor> {
        let smap = self.owners.smap.get();
        smap.proxies
            .values()
            .chain(smap.targets.values())
            .filter(|si| si.id != self.si.id)
            .cloned()
            .collect()
    }

    fn timeout(&self) -> Duration {
        self.owners.config.get().config.timeouts.cplane_operation
    }

    async fn send_batch(
        &mut self,
        pairs: Vec<(RevisionPayload, ActionMsg)>,
        done: Option<oneshot::Sender<()>>,
    ) {
        let mut envelopes = Vec::with_capacity(pairs.len());
        for (payload, msg) in &pairs {
            match payload.to_envelope(msg) {
                Ok(env) => envelopes.push(env),
                Err(err) => warn!("metasync: failed to encode {:?}: {err}", payload.kind()),
            }
        }
        if !envelopes.is_empty() {
            let recipients = self.recipients();
            self.fan_out(recipients, envelopes).await;
        }
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    async fn fan_out(&mut self, recipients: Vec<NodeDescriptor>, envelopes: Vec<RevisionEnvelope>) {
        let timeout = self.timeout();
        let mut tasks = JoinSet::new();
        for si in recipients {
            // A peer with sends still pending gets those revisions folded
            // into this batch, so it never observes a later batch without
            // an earlier one.
            let mut for_peer = envelopes.clone();
            if let Some(pending) = self.retry.remove(&si.id) {
                for env in pending.envelopes {
                    match for_peer.iter_mut().find(|e| e.kind == env.kind) {
                        Some(slot) if slot.version < env.version => *slot = env,
                        Some(_) => {}
                        None => for_peer.push(env),
                    }
                }
            }
            let body = match serde_json::to_value(&for_peer) {
                Ok(body) => body,
                Err(err) => {
                    warn!("metasync: batch serialization failed: {err}");
                    continue;
                }
            };
            let client = self.client.clone();
            let spec = ReqSpec {
                method: Method::PUT,
                path: PATH_METASYNC.to_string(),
                body: Some(body),
                timeout,
            };
            tasks.spawn(async move {
                let outcome = client.call(&si, &spec).await;
                (si, for_peer, outcome)
            });
        }
        while let Some(joined) = tasks.join_next().await {
            let Ok((si, sent, outcome)) = joined else { continue };
            match outcome {
                Ok(resp) if resp.is_success() => self.record_delivery(&si.id, &sent),
                Ok(resp) => {
                    // Peer rejected the batch: stale primary or lineage
                    // divergence. Not retriable from this side.
                    warn!(
                        peer = %si.id,
                        status = resp.status,
                        "metasync rejected: {}",
                        resp.text()
                    );
                    self.retry.remove(&si.id);
                }
                Err(err) => {
                    debug!(peer = %si.id, "metasync send failed, queueing retry: {err}");
                    self.queue_retry(si, sent);
                }
            }
        }
    }

    fn record_delivery(&mut self, id: &NodeId, envelopes: &[RevisionEnvelope]) {
        let peer = self.ledger.entry(id.clone()).or_default();
        for env in envelopes {
            let slot = peer.entry(env.kind).or_insert(0);
            if env.version > *slot {
                *slot = env.version;
            }
        }
        self.retry.remove(id);
    }

    fn queue_retry(&mut self, si: NodeDescriptor, envelopes: Vec<RevisionEnvelope>) {
        let entry = self.retry.entry(si.id.clone()).or_insert_with(|| RetryEntry {
            si,
            envelopes: Vec::new(),
            attempts: 0,
            next_at: Instant::now() + RETRY_BASE,
        });
        // Newer versions supersede whatever was pending for the same kind.
        for env in envelopes {
            match entry.envelopes.iter_mut().find(|e| e.kind == env.kind) {
                Some(slot) if slot.version < env.version => *slot = env,
                Some(_) => {}
                None => entry.envelopes.push(env),
            }
        }
    }

    async fn retry_pending(&mut self) {
        let now = Instant::now();
        let due: Vec<NodeId> = self
            .retry
            .iter()
            .filter(|(_, entry)| entry.next_at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in due {
            let Some(mut entry) = self.retry.remove(&id) else {
                continue;
            };
            // Peers evicted since the failure are dropped from retry.
            if self.owners.smap.get().get_node(&id).is_none() {
                debug!(peer = %id, "dropping metasync retries: no longer in cluster map");
                continue;
            }
            let si = entry.si.clone();
            let envelopes = entry.envelopes.clone();
            self.fan_out(vec![si], envelopes).await;
            if self.retry.contains_key(&id) {
                entry.attempts += 1;
                if entry.attempts >= MAX_RETRY_ATTEMPTS {
                    warn!(peer = %id, "metasync: giving up after {} attempts", entry.attempts);
                    self.retry.remove(&id);
                    continue;
                }
                // Jittered exponential backoff keeps a flapping peer's
                // retries from synchronizing across batches.
                let backoff = RETRY_BASE.saturating_mul(1 << entry.attempts.min(5)).min(RETRY_CAP)
                    + Duration::from_millis(self.rng.gen_range(0..250));
                if let Some(requeued) = self.retry.get_mut(&id) {
                    requeued.attempts = entry.attempts;
                    requeued.next_at = now + backoff;
                }
            }
        }
    }

    async fn resync(&mut self, peer: NodeId) {
        let Some(si) = self.owners.smap.get().get_node(&peer).cloned() else {
            return;
        };
        let pairs = self.owners.full_bundle();
        let mut envelopes = Vec::with_capacity(pairs.len());
        for (payload, msg) in &pairs {
            if let Ok(env) = payload.to_envelope(msg) {
                envelopes.push(env);
            }
        }
        info!(peer = %peer, "metasync: full resync of {} revisions", envelopes.len());
        self.fan_out(vec![si], envelopes).await;
    }
}
