use std::sync::{Arc, mpsc};

use tracing::trace;

use crate::task::Task;

/// Snapshot of the collection after a change.
pub type TasksSnapshot = Arc<[Task]>;

/// Broadcasts "tasks changed" to every subscriber.
///
/// Subscribers that hung up are dropped on the next publish.
#[derive(Debug, Default)]
pub struct ChangeFeed {
    subscribers: Vec<mpsc::Sender<TasksSnapshot>>,
}

impl ChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> mpsc::Receiver<TasksSnapshot> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    pub fn publish(&mut self, snapshot: TasksSnapshot) {
        self.subscribers
            .retain(|tx| tx.send(Arc::clone(&snapshot)).is_ok());
        trace!(
            subscribers = self.subscribers.len(),
            count = snapshot.len(),
            "published tasks snapshot"
        );
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[test]
    fn dropped_receivers_are_pruned() {
        let mut feed = ChangeFeed::new();
        let kept = feed.subscribe();
        drop(feed.subscribe());

        let snapshot: TasksSnapshot = vec![Task::new("x", Utc::now())].into();
        feed.publish(snapshot);

        assert_eq!(feed.subscriber_count(), 1);
        assert_eq!(kept.try_recv().expect("snapshot").len(), 1);
    }
}
