use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tokio::sync::Mutex;

use crate::error::ControlError;
use crate::revision::{BucketMd, ConfigRev, EtlMd, TokenList};
use crate::rmd::RebalanceMd;
use crate::smap::ClusterMap;

/// Metadata whose version the owner bumps at publication.
pub trait Versioned: Clone + Send + Sync + 'static {
    /// Advance the monotonic version by one.
    fn bump_version(&mut self);
}

impl Versioned for ClusterMap {
    fn bump_version(&mut self) {
        self.version += 1;
    }
}

impl Versioned for RebalanceMd {
    fn bump_version(&mut self) {
        // RMD increments are explicit (`inc`) so that the epoch and its
        // per-step target list move together.
    }
}

impl Versioned for BucketMd {
    fn bump_version(&mut self) {
        self.version += 1;
    }
}

impl Versioned for ConfigRev {
    fn bump_version(&mut self) {
        self.version += 1;
    }
}

impl Versioned for TokenList {
    fn bump_version(&mut self) {
        self.version += 1;
    }
}

impl Versioned for EtlMd {
    fn bump_version(&mut self) {
        self.version += 1;
    }
}

/// One serialized mutation of an owned revision.
///
/// Hooks run in order under the owner's writer gate. `pre` validates and
/// mutates the clone; an error aborts the mutation with the published
/// snapshot unchanged. `post` runs after the clone has been published and
/// typically derives companion revisions. `finalize` is the commit point:
/// the only hook allowed external effects, and never rolled back.
pub trait Mutation<T: Versioned>: Send {
    /// Validate and mutate the clone.
    fn pre(&mut self, prev: &T, clone: &mut T) -> Result<(), ControlError>;

    /// Derive companion revisions once the clone is published.
    fn post(
        &mut self,
        _prev: &Arc<T>,
        _published: &Arc<T>,
    ) -> impl std::future::Future<Output = ()> + Send {
        async {}
    }

    /// External effects: metasync, listener registration, task spawns.
    fn finalize(
        &mut self,
        _prev: Arc<T>,
        _published: Arc<T>,
    ) -> impl std::future::Future<Output = ()> + Send {
        async {}
    }
}

/// Single-writer guard over one revision kind.
///
/// `get` hands out the published snapshot without touching the writer gate;
/// `modify` serializes the pre/publish/post/finalize pipeline so that
/// readers observe either the old snapshot or the new one, never an
/// intermediate.
pub struct Owner<T> {
    current: RwLock<Arc<T>>,
    gate: Mutex<()>,
    stopped: AtomicBool,
}

impl<T: Versioned> Owner<T> {
    /// Wraps the initial snapshot.
    pub fn new(initial: T) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
            gate: Mutex::new(()),
            stopped: AtomicBool::new(false),
        }
    }

    /// The currently published snapshot.
    pub fn get(&self) -> Arc<T> {
        Arc::clone(&self.current.read())
    }

    /// Installs a snapshot directly, bypassing the pipeline. Used on the
    /// receive path after monotonicity checks, and at bootstrap.
    pub fn put(&self, next: T) {
        *self.current.write() = Arc::new(next);
    }

    /// Rejects all subsequent modifications; the in-flight one completes.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    /// Runs one mutation through the serialized pipeline, returning the
    /// published snapshot.
    pub async fn modify<M: Mutation<T>>(&self, m: &mut M) -> Result<Arc<T>, ControlError> {
        let _gate = self.gate.lock().await;
        if self.stopped.load(Ordering::Acquire) {
            return Err(ControlError::Stopping);
        }
        let prev = self.get();
        let mut clone = (*prev).clone();
        m.pre(&prev, &mut clone)?;
        clone.bump_version();
        let published = Arc::new(clone);
        *self.current.write() = Arc::clone(&published);
        m.post(&prev, &published).await;
        m.finalize(Arc::clone(&prev), Arc::clone(&published)).await;
        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeDescriptor, NodeFlags, NodeId, NodeRole};

    struct AddTarget {
        idx: u16,
        fail: bool,
        finalized: Vec<u64>,
    }

    impl Mutation<ClusterMap> for AddTarget {
        fn pre(&mut self, _prev: &ClusterMap, clone: &mut ClusterMap) -> Result<(), ControlError> {
            if self.fail {
                return Err(ControlError::RebalanceDisabled);
            }
            clone.put_node(
                NodeDescriptor::new(
                    format!("t{}", self.idx),
                    NodeRole::Target,
                    "127.0.0.1",
                    9000 + self.idx,
                ),
                NodeFlags::default(),
            );
            Ok(())
        }

        async fn finalize(&mut self, _prev: Arc<ClusterMap>, published: Arc<ClusterMap>) {
            self.finalized.push(published.version);
        }
    }

    fn bootstrap() -> ClusterMap {
        let mut smap = ClusterMap::new("lineage");
        smap.put_node(
            NodeDescriptor::new("p1", NodeRole::Proxy, "127.0.0.1", 8000),
            NodeFlags::default(),
        );
        smap.primary_id = Some(NodeId::from("p1"));
        smap.version = 1;
        smap
    }

    #[tokio::test]
    async fn modify_publishes_and_bumps() {
        let owner = Owner::new(bootstrap());
        let mut m = AddTarget {
            idx: 1,
            fail: false,
            finalized: Vec::new(),
        };
        let published = owner.modify(&mut m).await.unwrap();
        assert_eq!(published.version, 2);
        assert_eq!(owner.get().version, 2);
        assert_eq!(m.finalized, [2]);
    }

    #[tokio::test]
    async fn failed_pre_leaves_snapshot_unchanged() {
        let owner = Owner::new(bootstrap());
        let before = owner.get();
        let mut m = AddTarget {
            idx: 1,
            fail: true,
            finalized: Vec::new(),
        };
        assert!(owner.modify(&mut m).await.is_err());
        assert_eq!(owner.get().version, before.version);
        assert!(m.finalized.is_empty(), "finalize must not run on abort");
    }

    #[tokio::test]
    async fn modifications_are_totally_ordered() {
        let owner = Arc::new(Owner::new(bootstrap()));
        let mut handles = Vec::new();
        for idx in 1..=8u16 {
            let owner = Arc::clone(&owner);
            handles.push(tokio::spawn(async move {
                let mut m = AddTarget {
                    idx,
                    fail: false,
                    finalized: Vec::new(),
                };
                owner.modify(&mut m).await.unwrap().version
            }));
        }
        let mut versions = Vec::new();
        for handle in handles {
            versions.push(handle.await.unwrap());
        }
        versions.sort_unstable();
        assert_eq!(versions, (2..=9).collect::<Vec<_>>());
        assert_eq!(owner.get().targets.len(), 8);
    }

    #[tokio::test]
    async fn stopped_owner_rejects_modify() {
        let owner = Owner::new(bootstrap());
        owner.stop();
        let mut m = AddTarget {
            idx: 1,
            fail: false,
            finalized: Vec::new(),
        };
        assert!(matches!(
            owner.modify(&mut m).await,
            Err(ControlError::Stopping)
        ));
        // Reads keep working after stop.
        assert_eq!(owner.get().version, 1);
    }
}
