//! Event batching and broadcast
//!
//! Game events are buffered and delivered to push subscribers as coalesced
//! batches. A batch is flushed when it reaches the size limit, when the
//! batch window expires, or immediately for critical events.

use chrono::Utc;
use civ_bridge_core::{EventBatch, GameEventRecord};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

struct BatchState {
    events: Vec<GameEventRecord>,
    timer: Option<JoinHandle<()>>,
    /// Bumped on every flush so a late timer cannot flush a newer batch
    epoch: u64,
    batches_flushed: u64,
    events_delivered: u64,
}

/// Broadcaster counters
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcasterStats {
    pub buffered: usize,
    pub batches_flushed: u64,
    pub events_delivered: u64,
    pub subscribers: usize,
}

/// Batches game events and fans them out to subscribers
pub struct EventBroadcaster {
    state: Mutex<BatchState>,
    sender: broadcast::Sender<EventBatch>,
    window: Duration,
    max_batch: usize,
}

impl EventBroadcaster {
    pub fn new(window: Duration, max_batch: usize, capacity: usize) -> Arc<Self> {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self {
            state: Mutex::new(BatchState {
                events: Vec::new(),
                timer: None,
                epoch: 0,
                batches_flushed: 0,
                events_delivered: 0,
            }),
            sender,
            window,
            max_batch: max_batch.max(1),
        })
    }

    /// Subscribe to flushed batches
    pub fn subscribe(&self) -> broadcast::Receiver<EventBatch> {
        self.sender.subscribe()
    }

    /// Queue an event; critical events flush everything buffered at once
    pub fn broadcast(self: &Arc<Self>, event: GameEventRecord, critical: bool) {
        let mut state = self.state.lock();
        trace!("Buffering event {}", event.event);
        state.events.push(event);

        if critical || state.events.len() >= self.max_batch {
            self.flush_locked(&mut state);
            return;
        }

        if state.timer.is_none() {
            let epoch = state.epoch;
            let window = self.window;
            let broadcaster: Weak<Self> = Arc::downgrade(self);
            state.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(window).await;
                if let Some(broadcaster) = broadcaster.upgrade() {
                    broadcaster.flush_epoch(epoch);
                }
            }));
        }
    }

    /// Deliver whatever is buffered as one batch
    pub fn flush(&self) {
        let mut state = self.state.lock();
        self.flush_locked(&mut state);
    }

    /// Flush anything left before the process exits
    pub fn shutdown(&self) {
        self.flush();
    }

    pub fn stats(&self) -> BroadcasterStats {
        let state = self.state.lock();
        BroadcasterStats {
            buffered: state.events.len(),
            batches_flushed: state.batches_flushed,
            events_delivered: state.events_delivered,
            subscribers: self.sender.receiver_count(),
        }
    }

    fn flush_epoch(&self, epoch: u64) {
        let mut state = self.state.lock();
        if state.epoch == epoch {
            self.flush_locked(&mut state);
        }
    }

    // Sends under the lock so batches reach subscribers in flush order
    fn flush_locked(&self, state: &mut BatchState) {
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.epoch += 1;
        if state.events.is_empty() {
            return;
        }

        let events = std::mem::take(&mut state.events);
        state.batches_flushed += 1;
        state.events_delivered += events.len() as u64;
        debug!("Flushing batch of {} event(s)", events.len());

        let batch = EventBatch {
            events,
            flushed_at: Utc::now(),
        };
        if self.sender.send(batch).is_err() {
            trace!("No event subscribers");
        }
    }
}

impl Drop for EventBroadcaster {
    fn drop(&mut self) {
        if let Some(timer) = self.state.get_mut().timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tokio::sync::broadcast::error::TryRecvError;

    fn event(name: &str) -> GameEventRecord {
        GameEventRecord::bridge(name, Value::Null)
    }

    fn names(batch: &EventBatch) -> Vec<&str> {
        batch.events.iter().map(|e| e.event.as_str()).collect()
    }

    fn broadcaster() -> Arc<EventBroadcaster> {
        EventBroadcaster::new(Duration::from_millis(50), 20, 64)
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_coalesces_spread_events() {
        let broadcaster = broadcaster();
        let mut rx = broadcaster.subscribe();

        broadcaster.broadcast(event("t0"), false);
        tokio::time::sleep(Duration::from_millis(10)).await;
        broadcaster.broadcast(event("t10"), false);
        tokio::time::sleep(Duration::from_millis(35)).await;
        broadcaster.broadcast(event("t45"), false);

        tokio::time::sleep(Duration::from_millis(4)).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        tokio::time::sleep(Duration::from_millis(2)).await;
        let batch = rx.try_recv().unwrap();
        assert_eq!(names(&batch), vec!["t0", "t10", "t45"]);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(broadcaster.stats().batches_flushed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_limit_flushes_immediately() {
        let broadcaster = broadcaster();
        let mut rx = broadcaster.subscribe();

        for i in 0..25 {
            broadcaster.broadcast(event(&format!("e{}", i)), false);
        }

        let first = rx.try_recv().unwrap();
        assert_eq!(first.len(), 20);
        assert_eq!(first.events[0].event, "e0");
        assert_eq!(first.events[19].event, "e19");
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(broadcaster.stats().buffered, 5);

        tokio::time::sleep(Duration::from_millis(51)).await;
        let rest = rx.try_recv().unwrap();
        assert_eq!(names(&rest), vec!["e20", "e21", "e22", "e23", "e24"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_event_flushes_buffer_ahead_of_it() {
        let broadcaster = broadcaster();
        let mut rx = broadcaster.subscribe();

        broadcaster.broadcast(event("a"), false);
        broadcaster.broadcast(event("b"), false);
        broadcaster.broadcast(event("dll_disconnected"), true);

        let batch = rx.try_recv().unwrap();
        assert_eq!(names(&batch), vec!["a", "b", "dll_disconnected"]);

        // The window timer armed by "a" must not produce an empty or stray batch
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_pending_events() {
        let broadcaster = broadcaster();
        let mut rx = broadcaster.subscribe();

        broadcaster.broadcast(event("last"), false);
        broadcaster.shutdown();

        assert_eq!(names(&rx.try_recv().unwrap()), vec!["last"]);
        let stats = broadcaster.stats();
        assert_eq!(stats.events_delivered, 1);
        assert_eq!(stats.buffered, 0);
    }
}
