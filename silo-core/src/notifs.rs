use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::node::NodeId;
use crate::revision::Action;
use crate::smap::ClusterMap;

/// How long a finished listener stays queryable before housekeeping drops it.
const FIN_RETENTION: Duration = Duration::from_secs(300);

/// Notification posted by a target to the primary for a long-running action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifMsg {
    /// Action id the notification belongs to (e.g. the rebalance id).
    pub uuid: String,
    /// Opaque per-target progress blob.
    #[serde(default)]
    pub data: serde_json::Value,
    /// True when the target aborted the action.
    #[serde(default)]
    pub aborted: bool,
    /// Error reported by the target, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

/// Who may finalize or delete a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerScope {
    /// Only the primary that registered it.
    Primary,
    /// Any information-council member.
    EqualIc,
}

/// Completion summary handed to the listener's callback.
#[derive(Debug, Clone)]
pub struct NlSummary {
    /// Action id.
    pub uuid: String,
    /// Action kind.
    pub action: Action,
    /// Whether the action was aborted (sticky).
    pub aborted: bool,
    /// First error observed, if any.
    pub err: Option<String>,
}

/// Callback fired exactly once when a listener completes or aborts.
pub type NotifCallback = Box<dyn FnOnce(NlSummary) + Send + 'static>;

struct ListenerState {
    finished: BTreeSet<NodeId>,
    stats: HashMap<NodeId, serde_json::Value>,
    aborted: bool,
    err: Option<String>,
    callback: Option<NotifCallback>,
    fired: bool,
    done_at: Option<Instant>,
}

/// Primary-side aggregator for one long-running, multi-target action.
///
/// The notifier set is a snapshot of target ids taken at creation; the
/// listener references cluster-map state by value, never the live owner.
pub struct NotifListener {
    /// Action id, typically a rebalance id.
    pub uuid: String,
    /// Action kind.
    pub action: Action,
    /// Cluster-map version at registration.
    pub smap_version: u64,
    /// Who may finalize the listener.
    pub scope: OwnerScope,
    /// Wall-clock registration time, surfaced in status views.
    pub started: DateTime<Utc>,
    notifiers: BTreeSet<NodeId>,
    state: Mutex<ListenerState>,
}

impl NotifListener {
    /// Creates a listener over the given notifier snapshot.
    #[must_use]
    pub fn new(
        uuid: impl Into<String>,
        action: Action,
        smap_version: u64,
        notifiers: BTreeSet<NodeId>,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            action,
            smap_version,
            scope: OwnerScope::EqualIc,
            started: Utc::now(),
            notifiers,
            state: Mutex::new(ListenerState {
                finished: BTreeSet::new(),
                stats: HashMap::new(),
                aborted: false,
                err: None,
                callback: None,
                fired: false,
                done_at: None,
            }),
        }
    }

    /// Attaches the completion callback. Call before registration.
    pub fn set_callback(&self, callback: NotifCallback) {
        self.state.lock().callback = Some(callback);
    }

    /// Notifier ids captured at creation.
    #[must_use]
    pub fn notifiers(&self) -> &BTreeSet<NodeId> {
        &self.notifiers
    }

    /// Count of notifiers that reported completion.
    #[must_use]
    pub fn fin_count(&self) -> usize {
        self.state.lock().finished.len()
    }

    /// True once every notifier finished, or the action aborted.
    #[must_use]
    pub fn finished(&self) -> bool {
        let state = self.state.lock();
        state.aborted || state.finished.len() == self.notifiers.len()
    }

    /// Sticky abort flag.
    #[must_use]
    pub fn aborted(&self) -> bool {
        self.state.lock().aborted
    }

    /// First error observed.
    #[must_use]
    pub fn err(&self) -> Option<String> {
        self.state.lock().err.clone()
    }

    /// Last stats blob reported by `id`.
    #[must_use]
    pub fn node_stats(&self, id: &NodeId) -> Option<serde_json::Value> {
        self.state.lock().stats.get(id).cloned()
    }

    fn summary_locked(&self, state: &ListenerState) -> NlSummary {
        NlSummary {
            uuid: self.uuid.clone(),
            action: self.action,
            aborted: state.aborted,
            err: state.err.clone(),
        }
    }

    /// Merges a progress report.
    fn on_progress(&self, from: &NodeId, msg: &NotifMsg) {
        let mut state = self.state.lock();
        state.stats.insert(from.clone(), msg.data.clone());
        if let Some(err) = &msg.err {
            state.err.get_or_insert_with(|| err.clone());
        }
    }

    /// Merges a completion report; returns the callback to fire (outside
    /// the lock) when this report completed the listener.
    fn on_finished(&self, from: &NodeId, msg: &NotifMsg) -> Option<(NotifCallback, NlSummary)> {
        let mut state = self.state.lock();
        state.stats.insert(from.clone(), msg.data.clone());
        if let Some(err) = &msg.err {
            state.err.get_or_insert_with(|| err.clone());
        }
        state.finished.insert(from.clone());
        if msg.aborted {
            state.aborted = true;
            state
                .err
                .get_or_insert_with(|| format!("{from} aborted {}", self.uuid));
        }
        self.try_complete(&mut state)
    }

    /// Aborts with a synthetic error (e.g. a notifier left the map).
    fn force_abort(&self, reason: String) -> Option<(NotifCallback, NlSummary)> {
        let mut state = self.state.lock();
        state.aborted = true;
        state.err.get_or_insert(reason);
        self.try_complete(&mut state)
    }

    fn try_complete(&self, state: &mut ListenerState) -> Option<(NotifCallback, NlSummary)> {
        let done = state.aborted || state.finished.len() == self.notifiers.len();
        if !done || state.fired {
            return None;
        }
        state.fired = true;
        state.done_at = Some(Instant::now());
        let summary = self.summary_locked(state);
        state.callback.take().map(|cb| (cb, summary))
    }
}

/// Per-listener progress view served for `what=status`.
#[derive(Debug, Clone, Serialize)]
pub struct NlStatus {
    /// Action id.
    pub uuid: String,
    /// Action kind.
    pub action: Action,
    /// When the listener was registered.
    pub started: DateTime<Utc>,
    /// Notifiers that reported completion.
    pub finished: usize,
    /// Total notifiers.
    pub notifiers: usize,
    /// Abort flag.
    pub aborted: bool,
    /// First error observed.
    pub err: Option<String>,
}

/// Outcome of delivering a notification to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Merged into a live listener.
    Merged,
    /// Unknown or archived uuid; dropped (the caller still responds 200;
    /// late arrivals after cleanup are expected).
    Dropped,
}

/// Registry of active and archived listeners, owned by the primary and
/// mirrored by information-council members.
#[derive(Default)]
pub struct NotifRegistry {
    nls: RwLock<HashMap<String, Arc<NotifListener>>>,
    fin: RwLock<HashMap<String, Arc<NotifListener>>>,
}

impl NotifRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener; duplicates of live uuids are rejected.
    pub fn add(&self, nl: Arc<NotifListener>) -> bool {
        let mut nls = self.nls.write();
        if nls.contains_key(&nl.uuid) {
            return false;
        }
        debug!(uuid = %nl.uuid, notifiers = nl.notifiers().len(), "registering listener");
        nls.insert(nl.uuid.clone(), nl);
        true
    }

    /// Looks up a live listener.
    #[must_use]
    pub fn entry(&self, uuid: &str) -> Option<Arc<NotifListener>> {
        self.nls.read().get(uuid).cloned()
    }

    /// Handles a progress notification.
    pub fn handle_progress(&self, from: &NodeId, msg: &NotifMsg) -> Delivery {
        let Some(nl) = self.entry(&msg.uuid) else {
            return Delivery::Dropped;
        };
        nl.on_progress(from, msg);
        Delivery::Merged
    }

    /// Handles a completion notification, firing the callback and archiving
    /// the listener when this was the last outstanding notifier (or an
    /// abort).
    pub fn handle_finished(&self, from: &NodeId, msg: &NotifMsg) -> Delivery {
        let Some(nl) = self.entry(&msg.uuid) else {
            return Delivery::Dropped;
        };
        let fire = nl.on_finished(from, msg);
        if nl.finished() {
            self.archive(&nl.uuid);
        }
        if let Some((cb, summary)) = fire {
            cb(summary);
        }
        Delivery::Merged
    }

    /// Reacts to a new cluster map: listeners whose notifiers are no longer
    /// present can never complete and are aborted with a synthetic error.
    pub fn on_smap_changed(&self, smap: &ClusterMap) {
        let stale: Vec<Arc<NotifListener>> = {
            let nls = self.nls.read();
            nls.values()
                .filter(|nl| nl.notifiers().iter().any(|id| smap.get_node(id).is_none()))
                .cloned()
                .collect()
        };
        for nl in stale {
            let gone: Vec<&NodeId> = nl
                .notifiers()
                .iter()
                .filter(|id| smap.get_node(id).is_none())
                .collect();
            warn!(uuid = %nl.uuid, ?gone, "aborting listener: notifier(s) left the cluster");
            let fire = nl.force_abort(format!(
                "notifier {} no longer in cluster map v{}",
                gone.first().map_or("?", |id| id.as_str()),
                smap.version
            ));
            self.archive(&nl.uuid);
            if let Some((cb, summary)) = fire {
                cb(summary);
            }
        }
    }

    /// Progress views over the live listeners.
    #[must_use]
    pub fn status(&self) -> Vec<NlStatus> {
        self.nls
            .read()
            .values()
            .map(|nl| {
                let state = nl.state.lock();
                NlStatus {
                    uuid: nl.uuid.clone(),
                    action: nl.action,
                    started: nl.started,
                    finished: state.finished.len(),
                    notifiers: nl.notifiers.len(),
                    aborted: state.aborted,
                    err: state.err.clone(),
                }
            })
            .collect()
    }

    /// Drops archived listeners past their retention window.
    pub fn housekeep(&self) {
        let now = Instant::now();
        self.fin.write().retain(|_, nl| {
            nl.state
                .lock()
                .done_at
                .is_none_or(|done| now.duration_since(done) < FIN_RETENTION)
        });
    }

    fn archive(&self, uuid: &str) {
        if let Some(nl) = self.nls.write().remove(uuid) {
            self.fin.write().insert(uuid.to_string(), nl);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn notifier_set(ids: &[&str]) -> BTreeSet<NodeId> {
        ids.iter().map(|id| NodeId::from(*id)).collect()
    }

    fn finished_msg(uuid: &str) -> NotifMsg {
        NotifMsg {
            uuid: uuid.to_string(),
            data: serde_json::json!({"objects": 10}),
            aborted: false,
            err: None,
        }
    }

    #[test]
    fn completes_when_all_notifiers_finish() {
        let registry = NotifRegistry::new();
        let nl = Arc::new(NotifListener::new(
            "1",
            Action::Rebalance,
            5,
            notifier_set(&["t1", "t2"]),
        ));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        nl.set_callback(Box::new(move |summary| {
            assert!(!summary.aborted);
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(registry.add(Arc::clone(&nl)));

        let msg = finished_msg("1");
        assert_eq!(
            registry.handle_finished(&NodeId::from("t1"), &msg),
            Delivery::Merged
        );
        assert!(!nl.finished());
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        registry.handle_finished(&NodeId::from("t2"), &msg);
        assert!(nl.finished());
        assert_eq!(nl.fin_count(), 2);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Archived: a late duplicate is dropped, callback not re-fired.
        assert_eq!(
            registry.handle_finished(&NodeId::from("t2"), &msg),
            Delivery::Dropped
        );
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn abort_is_sticky_and_fires_once() {
        let registry = NotifRegistry::new();
        let nl = Arc::new(NotifListener::new(
            "2",
            Action::Rebalance,
            5,
            notifier_set(&["t1", "t2"]),
        ));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        nl.set_callback(Box::new(move |summary| {
            assert!(summary.aborted);
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        registry.add(Arc::clone(&nl));

        let mut abort = finished_msg("2");
        abort.aborted = true;
        registry.handle_finished(&NodeId::from("t1"), &abort);
        assert!(nl.aborted());
        assert!(nl.finished());
        assert!(nl.err().is_some());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn progress_merges_stats_without_finishing() {
        let registry = NotifRegistry::new();
        let nl = Arc::new(NotifListener::new(
            "3",
            Action::Rebalance,
            5,
            notifier_set(&["t1"]),
        ));
        registry.add(Arc::clone(&nl));

        let msg = NotifMsg {
            uuid: "3".to_string(),
            data: serde_json::json!({"objects": 5}),
            aborted: false,
            err: None,
        };
        registry.handle_progress(&NodeId::from("t1"), &msg);
        assert!(!nl.finished());
        assert_eq!(
            nl.node_stats(&NodeId::from("t1")).unwrap()["objects"],
            serde_json::json!(5)
        );

        // A later finished report overwrites the progress blob.
        let done = NotifMsg {
            uuid: "3".to_string(),
            data: serde_json::json!({"objects": 12}),
            aborted: false,
            err: None,
        };
        registry.handle_finished(&NodeId::from("t1"), &done);
        assert_eq!(
            nl.node_stats(&NodeId::from("t1")).unwrap()["objects"],
            serde_json::json!(12)
        );
    }

    #[test]
    fn smap_change_aborts_orphaned_listener() {
        use crate::node::{NodeDescriptor, NodeFlags, NodeRole};

        let registry = NotifRegistry::new();
        let nl = Arc::new(NotifListener::new(
            "4",
            Action::Rebalance,
            5,
            notifier_set(&["t1", "t2"]),
        ));
        registry.add(Arc::clone(&nl));
        registry.handle_finished(&NodeId::from("t1"), &finished_msg("4"));

        // New map without t2.
        let mut smap = ClusterMap::new("lineage");
        smap.put_node(
            NodeDescriptor::new("p1", NodeRole::Proxy, "127.0.0.1", 8000),
            NodeFlags::default(),
        );
        smap.put_node(
            NodeDescriptor::new("t1", NodeRole::Target, "127.0.0.1", 9000),
            NodeFlags::default(),
        );
        smap.primary_id = Some(NodeId::from("p1"));
        smap.version = 6;

        registry.on_smap_changed(&smap);
        assert!(nl.aborted());
        assert!(nl.err().unwrap().contains("t2"));

        // Late notification from the removed target is dropped.
        assert_eq!(
            registry.handle_finished(&NodeId::from("t2"), &finished_msg("4")),
            Delivery::Dropped
        );
    }

    #[test]
    fn unknown_uuid_is_dropped() {
        let registry = NotifRegistry::new();
        assert_eq!(
            registry.handle_finished(&NodeId::from("t1"), &finished_msg("nope")),
            Delivery::Dropped
        );
    }

    #[test]
    fn duplicate_uuid_rejected() {
        let registry = NotifRegistry::new();
        let nl = Arc::new(NotifListener::new(
            "5",
            Action::Rebalance,
            5,
            notifier_set(&["t1"]),
        ));
        assert!(registry.add(Arc::clone(&nl)));
        assert!(!registry.add(nl));
    }
}
