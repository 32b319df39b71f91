use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use reqwest::Method;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::{PATH_CLUSTER_KEEPALIVE, ReqSpec};
use crate::config::{TrackerConf, TrackerKind};
use crate::daemon::{ControlPlane, CoreEvent};
use crate::error::ControlError;
use crate::join::{JoinRequest, JoinResponse};
use crate::node::{NodeDescriptor, NodeId};
use crate::rebalance::{SmapChange, SmapOp};
use crate::revision::{Action, ActionMsg};

const NUM_RETRIES: u32 = 3;

/// Per-peer adaptive timeout state, RFC-6298 style, in integer nanoseconds.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutStats {
    /// Smoothed round-trip time.
    pub srtt: i64,
    /// Mean deviation.
    pub rttvar: i64,
    /// Current retransmission timeout, clamped to
    /// `[max_keepalive/2, max_keepalive]`.
    pub timeout: i64,
}

/// Tracks one timeout estimate per peer.
pub struct TimeoutTracker {
    stats: DashMap<NodeId, TimeoutStats>,
}

impl TimeoutTracker {
    fn new() -> Self {
        Self {
            stats: DashMap::new(),
        }
    }

    /// Current stats for `id`; a missing entry materializes at the
    /// conservative defaults (`srtt = max`, `rttvar = max/2`,
    /// `timeout = max`).
    pub fn stats_for(&self, id: &NodeId, max_keepalive_ns: i64) -> TimeoutStats {
        *self.stats.entry(id.clone()).or_insert(TimeoutStats {
            srtt: max_keepalive_ns,
            rttvar: max_keepalive_ns / 2,
            timeout: max_keepalive_ns,
        })
    }

    /// Feeds one observed round-trip `sample` into the estimator and
    /// returns the new timeout. The recursion follows RFC 6298 with
    /// `alpha = 1/8`, `beta = 1/4`, `K = 4`, computed in integer
    /// nanoseconds with explicit rounding.
    pub fn update(&self, id: &NodeId, sample: Duration, max_keepalive_ns: i64) -> Duration {
        const ALPHA: i64 = 125;
        const BETA: i64 = 250;
        const K: i64 = 4;

        // Samples far beyond the ceiling carry no extra signal and would
        // overflow the fixed-point recursion.
        let next = i64::try_from(sample.as_nanos())
            .unwrap_or(i64::MAX)
            .min(max_keepalive_ns.saturating_mul(8));
        let mut entry = self.stats.entry(id.clone()).or_insert(TimeoutStats {
            srtt: max_keepalive_ns,
            rttvar: max_keepalive_ns / 2,
            timeout: max_keepalive_ns,
        });
        entry.rttvar = div_round(
            (1000 - BETA) * entry.rttvar + BETA * (entry.srtt - next).abs(),
            1000,
        );
        entry.srtt = div_round((1000 - ALPHA) * entry.srtt + ALPHA * next, 1000);
        entry.timeout = (entry.srtt + K * entry.rttvar)
            .min(max_keepalive_ns)
            .max(max_keepalive_ns / 2);
        Duration::from_nanos(entry.timeout.max(0).unsigned_abs())
    }
}

const fn div_round(a: i64, b: i64) -> i64 {
    (a + b / 2) / b
}

/// Liveness bookkeeping over keepalive arrivals. Safe for concurrent use.
pub trait LivenessTracker: Send + Sync {
    /// Notes that `id` responded; `reset` when this was a (re)registration
    /// rather than a regular keepalive.
    fn heard_from(&self, id: &NodeId, reset: bool);
    /// True when `id` has been silent long enough to warrant a probe.
    fn timed_out(&self, id: &NodeId) -> bool;
    /// Whether a tracker rebuild is needed for the new settings.
    fn changed(&self, conf: &TrackerConf) -> bool;
}

/// Timed out iff nothing was heard within one interval.
struct HeartbeatTracker {
    last: RwLock<HashMap<NodeId, Instant>>,
    interval: Duration,
}

impl LivenessTracker for HeartbeatTracker {
    fn heard_from(&self, id: &NodeId, _reset: bool) {
        self.last.write().insert(id.clone(), Instant::now());
    }

    fn timed_out(&self, id: &NodeId) -> bool {
        self.last
            .read()
            .get(id)
            .is_none_or(|last| last.elapsed() > self.interval)
    }

    fn changed(&self, conf: &TrackerConf) -> bool {
        conf.kind != TrackerKind::Heartbeat || conf.interval != self.interval
    }
}

#[derive(Clone, Copy)]
struct AvgRec {
    count: u64,
    last: Instant,
    total_ms: u64,
}

/// Timed out iff the current silence exceeds `factor` times the average
/// inter-arrival gap.
struct AverageTracker {
    rec: RwLock<HashMap<NodeId, AvgRec>>,
    factor: u8,
}

impl LivenessTracker for AverageTracker {
    fn heard_from(&self, id: &NodeId, reset: bool) {
        let mut recs = self.rec.write();
        let now = Instant::now();
        match recs.get_mut(id) {
            Some(rec) if !reset => {
                let delta = now.duration_since(rec.last);
                rec.last = now;
                rec.count += 1;
                rec.total_ms += u64::try_from(delta.as_millis()).unwrap_or(u64::MAX);
            }
            _ => {
                recs.insert(
                    id.clone(),
                    AvgRec {
                        count: 0,
                        last: now,
                        total_ms: 0,
                    },
                );
            }
        }
    }

    fn timed_out(&self, id: &NodeId) -> bool {
        let recs = self.rec.read();
        let Some(rec) = recs.get(id) else {
            return true;
        };
        if rec.count == 0 {
            return false;
        }
        let avg_ms = rec.total_ms / rec.count;
        u64::try_from(rec.last.elapsed().as_millis()).unwrap_or(u64::MAX)
            > u64::from(self.factor) * avg_ms
    }

    fn changed(&self, conf: &TrackerConf) -> bool {
        conf.kind != TrackerKind::Average || conf.factor != self.factor
    }
}

fn build_tracker(conf: &TrackerConf) -> Box<dyn LivenessTracker> {
    match conf.kind {
        TrackerKind::Heartbeat => Box::new(HeartbeatTracker {
            last: RwLock::new(HashMap::new()),
            interval: conf.interval,
        }),
        TrackerKind::Average => Box::new(AverageTracker {
            rec: RwLock::new(HashMap::new()),
            factor: conf.factor,
        }),
    }
}

/// Control signals accepted by the keepalive loop.
#[derive(Debug, Clone)]
pub enum KaSignal {
    /// Terminate the loop.
    Stop,
    /// Suspend ticking (e.g. while the node re-registers).
    Pause,
    /// Resume ticking.
    Resume,
    /// A transport error elsewhere; probe immediately (debounced).
    Error(String),
}

enum Variant {
    Target,
    Proxy { in_progress: AtomicBool },
}

/// Periodic liveness runner. Targets (and non-primary proxies) heartbeat
/// the primary; the primary proxy sweeps everyone and evicts the
/// unresponsive.
pub struct Keepaliver {
    name: &'static str,
    core: Arc<ControlPlane>,
    variant: Variant,
    tracker: RwLock<Box<dyn LivenessTracker>>,
    timeouts: TimeoutTracker,
    control_tx: mpsc::Sender<KaSignal>,
    control_rx: Mutex<Option<mpsc::Receiver<KaSignal>>>,
    max_keepalive_ns: AtomicI64,
    interval: Mutex<Duration>,
    paused: AtomicBool,
}

impl Keepaliver {
    /// Keepaliver for a storage target.
    #[must_use]
    pub fn target(core: Arc<ControlPlane>) -> Arc<Self> {
        Self::new("target-keepalive", core, Variant::Target)
    }

    /// Keepaliver for a proxy (sweeps the cluster while primary).
    #[must_use]
    pub fn proxy(core: Arc<ControlPlane>) -> Arc<Self> {
        Self::new(
            "proxy-keepalive",
            core,
            Variant::Proxy {
                in_progress: AtomicBool::new(false),
            },
        )
    }

    fn new(name: &'static str, core: Arc<ControlPlane>, variant: Variant) -> Arc<Self> {
        let config = core.config();
        let conf = match variant {
            Variant::Target => config.keepalive.target,
            Variant::Proxy { .. } => config.keepalive.proxy,
        };
        let (control_tx, control_rx) = mpsc::channel(8);
        Arc::new(Self {
            name,
            core,
            variant,
            tracker: RwLock::new(build_tracker(&conf)),
            timeouts: TimeoutTracker::new(),
            control_tx,
            control_rx: Mutex::new(Some(control_rx)),
            max_keepalive_ns: AtomicI64::new(duration_ns(config.timeouts.max_keepalive)),
            interval: Mutex::new(conf.interval),
            paused: AtomicBool::new(false),
        })
    }

    /// Sends a control signal to the loop.
    pub async fn send(&self, signal: KaSignal) {
        debug!("{}: signal {signal:?}", self.name);
        let _ = self.control_tx.send(signal).await;
    }

    /// Reports a transport error observed elsewhere; unreachable peers
    /// force an immediate (debounced) probe.
    pub fn on_err(&self, err: &ControlError) {
        if err.is_retriable_conn() {
            let _ = self
                .control_tx
                .try_send(KaSignal::Error(err.to_string()));
        }
    }

    /// Notes a keepalive (or equivalent) received from `id`.
    pub fn heard_from(&self, id: &NodeId, reset: bool) {
        self.tracker.read().heard_from(id, reset);
    }

    /// True when the loop is suspended.
    #[must_use]
    pub fn paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Adaptive timeout for `id`, within `[max_keepalive/2, max_keepalive]`.
    #[must_use]
    pub fn timeout_for(&self, id: &NodeId) -> Duration {
        let max = self.max_keepalive_ns.load(Ordering::Acquire);
        let stats = self.timeouts.stats_for(id, max);
        Duration::from_nanos(stats.timeout.max(0).unsigned_abs())
    }

    fn is_time_to_ping(&self, id: &NodeId) -> bool {
        self.tracker.read().timed_out(id)
    }

    fn record_sample(&self, id: &NodeId, sample: Duration) -> Duration {
        let max = self.max_keepalive_ns.load(Ordering::Acquire);
        self.timeouts.update(id, sample, max)
    }

    /// Runs the keepalive loop until a stop signal or shutdown. Waits for
    /// the node to finish starting up first.
    pub async fn run(self: Arc<Self>) {
        let mut control_rx = self
            .control_rx
            .lock()
            .take()
            .expect("keepalive loop started twice");
        let mut shutdown = self.core.shutdown_rx();

        while !self.core.node_started() {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(Duration::from_millis(300)) => {}
            }
        }
        info!("starting {}", self.name);

        let mut interval = *self.interval.lock();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_check = Instant::now()
            .checked_sub(interval)
            .unwrap_or_else(Instant::now);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {
                    if self.paused() {
                        continue;
                    }
                    last_check = Instant::now();
                    if self.do_keepalive().await {
                        return;
                    }
                    if let Some(new_interval) = self.config_update(interval) {
                        interval = new_interval;
                        ticker = tokio::time::interval(interval);
                        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                    }
                }
                signal = control_rx.recv() => match signal {
                    None | Some(KaSignal::Stop) => {
                        info!("stopping {}", self.name);
                        return;
                    }
                    Some(KaSignal::Pause) => {
                        self.paused.store(true, Ordering::Release);
                    }
                    Some(KaSignal::Resume) => {
                        self.paused.store(false, Ordering::Release);
                    }
                    Some(KaSignal::Error(reason)) => {
                        let retry_interval = self.core.config().keepalive.retry_interval;
                        if last_check.elapsed() >= retry_interval {
                            last_check = Instant::now();
                            info!("{}: immediate probe triggered by: {reason}", self.name);
                            if self.do_keepalive().await {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Re-reads config each tick; rebuilds the tracker iff its settings
    /// changed and returns the new tick interval when it did.
    fn config_update(&self, current_interval: Duration) -> Option<Duration> {
        let config = self.core.config();
        self.max_keepalive_ns
            .store(duration_ns(config.timeouts.max_keepalive), Ordering::Release);
        let conf = match self.variant {
            Variant::Target => config.keepalive.target,
            Variant::Proxy { .. } => config.keepalive.proxy,
        };
        if !self.tracker.read().changed(&conf) {
            return None;
        }
        info!("{}: rebuilding liveness tracker ({conf:?})", self.name);
        *self.tracker.write() = build_tracker(&conf);
        *self.interval.lock() = conf.interval;
        (conf.interval != current_interval).then_some(conf.interval)
    }

    async fn do_keepalive(self: &Arc<Self>) -> bool {
        let smap = self.core.smap();
        if smap.validate().is_err() {
            return false;
        }
        match &self.variant {
            Variant::Target => self.heartbeat().await,
            Variant::Proxy { in_progress } => {
                if smap.is_primary(&self.core.si.id) {
                    self.sweep(in_progress).await
                } else {
                    self.heartbeat().await
                }
            }
        }
    }

    /// Non-primary side: one keepalive to the primary, with up to three
    /// retries before declaring primary failure.
    async fn heartbeat(&self) -> bool {
        let smap = self.core.smap();
        let Some(primary) = smap.primary().cloned() else {
            return false;
        };
        if primary.id == self.core.si.id {
            return false;
        }
        if !self.is_time_to_ping(&primary.id) {
            return false;
        }
        let mut timeout = self.timeout_for(&primary.id);
        match self.send_keepalive(&primary, timeout).await {
            Ok(()) => return false,
            Err(err) => {
                warn!(
                    "{} => primary {} keepalive failed: {err} - retrying...",
                    self.core.si, primary.id
                );
            }
        }
        let retry_interval = self.core.config().keepalive.retry_interval;
        let mut ticker = tokio::time::interval(retry_interval);
        ticker.tick().await;
        let mut attempts = 0;
        loop {
            ticker.tick().await;
            if self.core.stopping() {
                return true;
            }
            attempts += 1;
            let started = Instant::now();
            let outcome = self.send_keepalive(&primary, timeout).await;
            // A refused connection returns much faster than the timeout;
            // feeding that short sample into the estimator would shrink the
            // next retransmission, so clamp it to the ceiling instead.
            let sample = match &outcome {
                Err(err) if err.is_retriable_conn() => {
                    Duration::from_nanos(self.max_keepalive_ns.load(Ordering::Acquire).unsigned_abs())
                }
                _ => started.elapsed(),
            };
            timeout = self.record_sample(&primary.id, sample);
            match outcome {
                Ok(()) => {
                    info!("{}: primary keepalive OK after {attempts} retries", self.core.si);
                    return false;
                }
                Err(err) if attempts >= NUM_RETRIES => {
                    warn!(
                        "{}: primary {} unresponsive after {attempts} attempts: {err}",
                        self.core.si, primary.id
                    );
                    self.core.emit(CoreEvent::PrimaryFailed {
                        primary: primary.id.clone(),
                    });
                    return false;
                }
                Err(err) => {
                    if !err.is_retriable_conn() {
                        warn!("{}: unexpected keepalive response: {err}", self.core.si);
                    }
                }
            }
        }
    }

    async fn send_keepalive(
        &self,
        primary: &NodeDescriptor,
        timeout: Duration,
    ) -> Result<(), ControlError> {
        let started = Instant::now();
        let req = JoinRequest {
            si: self.core.si.clone(),
            smap: Some((*self.core.smap()).clone()),
            reb_interrupted: false,
        };
        let spec = ReqSpec::new(Method::POST, PATH_CLUSTER_KEEPALIVE, timeout).with_body(&req)?;
        let resp = self.core.client.call(primary, &spec).await?;
        self.record_sample(&primary.id, started.elapsed());
        if !resp.is_success() {
            return Err(ControlError::Transport(format!(
                "keepalive rejected with {}",
                resp.status
            )));
        }
        if let Ok(reply) = resp.json::<JoinResponse>() {
            if reply.rejoin {
                warn!("{}: not in the cluster map - re-joining", self.core.si);
                let url = primary.control_net.url("");
                if let Err(err) = crate::join::self_join(&self.core, &url, false, false).await {
                    warn!("{}: re-join failed: {err}", self.core.si);
                }
            }
        }
        Ok(())
    }

    /// Primary side: probe every peer not recently heard from, in bounded
    /// parallel, and evict the unresponsive via the map pipeline. A single
    /// sweep runs at a time.
    async fn sweep(self: &Arc<Self>, in_progress: &AtomicBool) -> bool {
        if in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("{}: sweep already in progress", self.core.si);
            return false;
        }
        let stopped = self.sweep_inner().await;
        in_progress.store(false, Ordering::Release);
        stopped
    }

    async fn sweep_inner(self: &Arc<Self>) -> bool {
        let smap = self.core.smap();
        let peers: Vec<NodeDescriptor> = smap
            .proxies
            .values()
            .chain(smap.targets.values())
            .filter(|si| si.id != self.core.si.id)
            .filter(|si| !si.in_maint_or_decomm())
            .filter(|si| self.is_time_to_ping(&si.id))
            .cloned()
            .collect();
        if peers.is_empty() {
            return false;
        }
        let config = self.core.config();
        // Opened fresh per sweep so nothing carries over from the last one.
        let (remove_tx, mut remove_rx) = mpsc::channel::<NodeId>(peers.len() * 2);
        let semaphore = Arc::new(Semaphore::new(config.keepalive.max_bcast_parallel.max(1)));
        let mut probes = JoinSet::new();
        for si in peers {
            let semaphore = Arc::clone(&semaphore);
            let remove_tx = remove_tx.clone();
            let this = Arc::clone(self);
            probes.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                if this.core.stopping() {
                    return;
                }
                if !this.ping_with_retry(&si).await {
                    let _ = remove_tx.send(si.id).await;
                }
            });
        }
        drop(remove_tx);
        while probes.join_next().await.is_some() {}
        if self.core.stopping() {
            return true;
        }

        let mut to_remove = Vec::new();
        while let Ok(id) = remove_rx.try_recv() {
            to_remove.push(id);
        }
        if to_remove.is_empty() {
            return false;
        }
        let mut change = SmapChange::new(
            &self.core,
            SmapOp::Evict(to_remove),
            ActionMsg::new(Action::KeepaliveEvict),
        );
        if let Err(err) = self.core.owners.smap.modify(&mut change).await {
            warn!("{}: keepalive eviction skipped: {err}", self.core.si);
        }
        false
    }

    async fn ping_once(&self, si: &NodeDescriptor) -> Result<(), ControlError> {
        let timeout = self.timeout_for(&si.id);
        let started = Instant::now();
        let outcome = self.core.client.health(si, timeout).await;
        self.record_sample(&si.id, started.elapsed());
        outcome
    }

    async fn ping_with_retry(&self, si: &NodeDescriptor) -> bool {
        match self.ping_once(si).await {
            Ok(()) => {
                self.heard_from(&si.id, false);
                return true;
            }
            Err(err) => {
                warn!("{si} fails to respond: {err} - retrying...", si = si);
            }
        }
        let retry_interval = self.core.config().keepalive.retry_interval;
        let mut ticker = tokio::time::interval(retry_interval);
        ticker.tick().await;
        for attempt in 1..=NUM_RETRIES {
            ticker.tick().await;
            if self.core.stopping() {
                return true;
            }
            // The peer may have re-attested through another path meanwhile.
            if !self.is_time_to_ping(&si.id) {
                return true;
            }
            match self.ping_once(si).await {
                Ok(()) => {
                    self.heard_from(&si.id, false);
                    return true;
                }
                Err(err) if attempt == NUM_RETRIES => {
                    warn!(
                        "failed to keepalive {si} after {attempt} attempts ({err}) - removing from {}",
                        self.core.smap()
                    );
                    return false;
                }
                Err(err) => {
                    if !err.is_retriable_conn() {
                        warn!("unexpected error from {si}: {err}");
                    }
                }
            }
        }
        false
    }
}

fn duration_ns(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MAX_NS: i64 = 4_000_000_000;

    #[test]
    fn missing_entry_materializes_at_defaults() {
        let tracker = TimeoutTracker::new();
        let stats = tracker.stats_for(&NodeId::from("t1"), MAX_NS);
        assert_eq!(stats.srtt, MAX_NS);
        assert_eq!(stats.rttvar, MAX_NS / 2);
        assert_eq!(stats.timeout, MAX_NS);
    }

    #[test]
    fn fast_peers_converge_to_the_floor() {
        // Consecutive probes at max/10 pull srtt toward the sample until
        // srtt + 4*rttvar drops under max/2 and the floor takes over.
        let tracker = TimeoutTracker::new();
        let id = NodeId::from("t1");
        let sample = Duration::from_nanos((MAX_NS / 10) as u64);
        let mut timeout = Duration::ZERO;
        let mut after_ten = 0;
        for round in 0..40 {
            timeout = tracker.update(&id, sample, MAX_NS);
            if round == 9 {
                after_ten = tracker.stats_for(&id, MAX_NS).srtt;
            }
        }
        assert!(
            after_ten < MAX_NS / 2,
            "ten probes already pull srtt well below the start: {after_ten}"
        );
        let stats = tracker.stats_for(&id, MAX_NS);
        assert!(
            stats.srtt < MAX_NS / 5,
            "srtt should approach the sample: {}",
            stats.srtt
        );
        assert_eq!(timeout.as_nanos() as i64, MAX_NS / 2, "floor holds");
    }

    #[test]
    fn slow_samples_stay_at_the_ceiling() {
        let tracker = TimeoutTracker::new();
        let id = NodeId::from("t1");
        let timeout = tracker.update(&id, Duration::from_nanos(MAX_NS as u64 * 3), MAX_NS);
        assert_eq!(timeout.as_nanos() as i64, MAX_NS);
    }

    proptest! {
        #[test]
        fn timeout_always_within_bounds(samples in prop::collection::vec(0u64..20_000_000_000, 1..64)) {
            let tracker = TimeoutTracker::new();
            let id = NodeId::from("t1");
            for ns in samples {
                let timeout = tracker.update(&id, Duration::from_nanos(ns), MAX_NS);
                let timeout_ns = timeout.as_nanos() as i64;
                prop_assert!(timeout_ns >= MAX_NS / 2, "below floor: {timeout_ns}");
                prop_assert!(timeout_ns <= MAX_NS, "above ceiling: {timeout_ns}");
            }
        }
    }

    #[test]
    fn heartbeat_tracker_times_out_silent_peers() {
        let tracker = build_tracker(&TrackerConf {
            kind: TrackerKind::Heartbeat,
            interval: Duration::from_millis(50),
            factor: 3,
        });
        let id = NodeId::from("t1");
        assert!(tracker.timed_out(&id), "never heard from");
        tracker.heard_from(&id, false);
        assert!(!tracker.timed_out(&id));
        std::thread::sleep(Duration::from_millis(80));
        assert!(tracker.timed_out(&id));
    }

    #[test]
    fn average_tracker_uses_gap_factor() {
        let tracker = build_tracker(&TrackerConf {
            kind: TrackerKind::Average,
            interval: Duration::from_secs(10),
            factor: 2,
        });
        let id = NodeId::from("t1");
        assert!(tracker.timed_out(&id), "no record yet");
        tracker.heard_from(&id, true);
        assert!(!tracker.timed_out(&id), "no samples yet");
        std::thread::sleep(Duration::from_millis(20));
        tracker.heard_from(&id, false);
        assert!(!tracker.timed_out(&id), "just heard");
        // After ~3x the observed ~20ms gap, factor 2 is exceeded.
        std::thread::sleep(Duration::from_millis(60));
        assert!(tracker.timed_out(&id));
    }

    #[test]
    fn tracker_rebuild_detection() {
        let conf = TrackerConf {
            kind: TrackerKind::Heartbeat,
            interval: Duration::from_secs(10),
            factor: 3,
        };
        let tracker = build_tracker(&conf);
        assert!(!tracker.changed(&conf));
        assert!(tracker.changed(&TrackerConf {
            interval: Duration::from_secs(5),
            ..conf
        }));
        assert!(tracker.changed(&TrackerConf {
            kind: TrackerKind::Average,
            ..conf
        }));
    }
}
