//! In-process progress fan-out. Subscribers get one replayed current snapshot
//! followed by events published after subscription. Channels are bounded; a
//! lagging subscriber skips ahead rather than blocking the producer. Nothing
//! here survives a restart — the metadata store stays the source of truth.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;

use crate::document::StatusSnapshot;

const CHANNEL_CAPACITY: usize = 64;

struct Topic {
    sender: broadcast::Sender<StatusSnapshot>,
    last: Option<StatusSnapshot>,
}

/// Single-process publish/subscribe surface keyed by document id.
#[derive(Default)]
pub struct ProgressBus {
    topics: Mutex<HashMap<i64, Topic>>,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a snapshot. Terminal snapshots tear the topic down once the
    /// event is delivered, so finished documents do not accumulate channels.
    pub fn publish(&self, snapshot: StatusSnapshot) {
        let mut topics = self.topics.lock().expect("progress bus mutex poisoned");
        let terminal = snapshot.status.is_terminal();
        let id = snapshot.document_id;
        let topic = topics.entry(id).or_insert_with(|| Topic {
            sender: broadcast::channel(CHANNEL_CAPACITY).0,
            last: None,
        });
        topic.last = Some(snapshot.clone());
        // Send errors just mean nobody is listening right now.
        let _ = topic.sender.send(snapshot);
        if terminal && topic.sender.receiver_count() == 0 {
            topics.remove(&id);
        }
    }

    /// Subscribe to a document's events. Returns the retained snapshot (if
    /// any) for replay plus the live receiver.
    pub fn subscribe(
        &self,
        document_id: i64,
    ) -> (Option<StatusSnapshot>, broadcast::Receiver<StatusSnapshot>) {
        let mut topics = self.topics.lock().expect("progress bus mutex poisoned");
        let topic = topics.entry(document_id).or_insert_with(|| Topic {
            sender: broadcast::channel(CHANNEL_CAPACITY).0,
            last: None,
        });
        (topic.last.clone(), topic.sender.subscribe())
    }

    /// Drop a finished topic once its last subscriber disconnects.
    pub fn release(&self, document_id: i64) {
        let mut topics = self.topics.lock().expect("progress bus mutex poisoned");
        if let Some(topic) = topics.get(&document_id) {
            let finished = topic
                .last
                .as_ref()
                .is_some_and(|snapshot| snapshot.status.is_terminal());
            if finished && topic.sender.receiver_count() == 0 {
                topics.remove(&document_id);
            }
        }
    }
}
