use std::collections::{BinaryHeap, HashMap};
use std::cmp::Reverse;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info};

/// Lifecycle events published by the collector. Stream termination is an
/// ordinary housekeeping outcome and is never interpreted as node failure
/// (the keepaliver does not subscribe).
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// The stream idled out and was torn down; delivered payloads are
    /// unaffected.
    Terminated {
        /// Stream identifier (`peer/trname` by convention).
        id: String,
    },
}

enum Ctrl {
    Add(String),
    Remove(String),
    Touch(String),
}

/// Collector for intra-cluster streams: each registered stream carries an
/// idle-tick counter; the collector tears down streams that stay idle past
/// the limit, reporting terminations asynchronously.
pub struct StreamCollector {
    ctrl_tx: mpsc::Sender<Ctrl>,
    events_tx: broadcast::Sender<StreamEvent>,
}

impl StreamCollector {
    /// Starts the collector loop: streams idle for more than `idle_limit`
    /// ticks of `tick` duration are deactivated.
    #[must_use]
    pub fn spawn(
        idle_limit: u64,
        tick: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let (ctrl_tx, mut ctrl_rx) = mpsc::channel::<Ctrl>(64);
        let (events_tx, _) = broadcast::channel(64);
        let events = events_tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            let mut now_tick: u64 = 0;
            // Last-activity tick per stream; the heap orders streams by it
            // with stale entries dropped lazily on pop.
            let mut streams: HashMap<String, u64> = HashMap::new();
            let mut heap: BinaryHeap<Reverse<(u64, String)>> = BinaryHeap::new();
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!("stream collector: stopping ({} streams)", streams.len());
                        return;
                    }
                    ctrl = ctrl_rx.recv() => match ctrl {
                        None => return,
                        Some(Ctrl::Add(id)) => {
                            streams.insert(id.clone(), now_tick);
                            heap.push(Reverse((now_tick, id)));
                        }
                        Some(Ctrl::Remove(id)) => {
                            streams.remove(&id);
                        }
                        Some(Ctrl::Touch(id)) => {
                            if let Some(last) = streams.get_mut(&id) {
                                *last = now_tick;
                                heap.push(Reverse((now_tick, id)));
                            }
                        }
                    },
                    _ = ticker.tick() => {
                        now_tick += 1;
                        while let Some(Reverse((last, id))) = heap.peek().cloned() {
                            if now_tick.saturating_sub(last) <= idle_limit {
                                break;
                            }
                            heap.pop();
                            match streams.get(&id) {
                                // Stale heap entry: the stream was touched
                                // since; its fresher entry is still queued.
                                Some(current) if *current != last => continue,
                                None => continue,
                                Some(_) => {}
                            }
                            streams.remove(&id);
                            debug!(stream = %id, "idle stream torn down");
                            let _ = events.send(StreamEvent::Terminated { id });
                        }
                    }
                }
            }
        });
        Arc::new(Self { ctrl_tx, events_tx })
    }

    /// Registers a stream for idle tracking.
    pub async fn add(&self, id: impl Into<String>) {
        let _ = self.ctrl_tx.send(Ctrl::Add(id.into())).await;
    }

    /// Deregisters a stream (graceful close).
    pub async fn remove(&self, id: impl Into<String>) {
        let _ = self.ctrl_tx.send(Ctrl::Remove(id.into())).await;
    }

    /// Resets the stream's idle counter on activity.
    pub async fn touch(&self, id: impl Into<String>) {
        let _ = self.ctrl_tx.send(Ctrl::Touch(id.into())).await;
    }

    /// Subscribes to termination events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<StreamEvent> {
        self.events_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn idle_streams_are_torn_down() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let collector = StreamCollector::spawn(2, Duration::from_millis(10), shutdown_rx);
        let mut events = collector.events();

        collector.add("t1/objdata").await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        let event = events.recv().await.unwrap();
        let StreamEvent::Terminated { id } = event;
        assert_eq!(id, "t1/objdata");
    }

    #[tokio::test(start_paused = true)]
    async fn touched_streams_survive() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let collector = StreamCollector::spawn(3, Duration::from_millis(10), shutdown_rx);
        let mut events = collector.events();

        collector.add("t2/objdata").await;
        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            collector.touch("t2/objdata").await;
        }
        assert!(
            events.try_recv().is_err(),
            "an active stream must not be torn down"
        );

        // Stop touching: it idles out.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(events.recv().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn removed_streams_do_not_report() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let collector = StreamCollector::spawn(2, Duration::from_millis(10), shutdown_rx);
        let mut events = collector.events();

        collector.add("t3/objdata").await;
        collector.remove("t3/objdata").await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(events.try_recv().is_err());
    }
}
