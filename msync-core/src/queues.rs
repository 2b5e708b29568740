use tokio::sync::mpsc;

use crate::proto::WireMessage;
use crate::update::Update;

/// Filesystem sources can burst hard during branch switches; the mailbox is
/// deep enough to absorb one.
pub const INCOMING_CAPACITY: usize = 1_000_000;
pub const SAVE_CAPACITY: usize = 10_000;
pub const OUTGOING_CAPACITY: usize = 10_000;

/// One item on the sync worker's mailbox. Everything the worker reacts to
/// arrives here, which is what gives each side its total event order.
#[derive(Debug)]
pub enum SyncEvent {
    /// A metadata update from the watcher (`update.local == true`) or from
    /// the peer stream (`false`).
    Tree(Update),
    /// The local initial scan has been fully enqueued.
    ScanComplete,
    /// The peer's seed stream is fully enqueued.
    SeedComplete,
    /// Our own save stage committed this update to disk.
    Saved(Update),
}

/// Sender sides of the four stage channels. Producers await on a full queue,
/// which backpressures slow disks and slow networks all the way to the event
/// source.
#[derive(Clone)]
pub struct Queues {
    pub incoming: mpsc::Sender<SyncEvent>,
    pub save_to_local: mpsc::Sender<Update>,
    pub save_to_remote: mpsc::Sender<Update>,
    pub outgoing: mpsc::Sender<WireMessage>,
}

/// Receiver sides; each is handed to exactly one worker.
pub struct QueueReceivers {
    pub incoming: mpsc::Receiver<SyncEvent>,
    pub save_to_local: mpsc::Receiver<Update>,
    pub save_to_remote: mpsc::Receiver<Update>,
    pub outgoing: mpsc::Receiver<WireMessage>,
}

/// Current depth of the administratively interesting queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backlog {
    pub incoming: usize,
    pub save_to_remote: usize,
}

impl Queues {
    pub fn new() -> (Queues, QueueReceivers) {
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_CAPACITY);
        let (stl_tx, stl_rx) = mpsc::channel(SAVE_CAPACITY);
        let (str_tx, str_rx) = mpsc::channel(SAVE_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel(OUTGOING_CAPACITY);
        (
            Queues {
                incoming: incoming_tx,
                save_to_local: stl_tx,
                save_to_remote: str_tx,
                outgoing: out_tx,
            },
            QueueReceivers {
                incoming: incoming_rx,
                save_to_local: stl_rx,
                save_to_remote: str_rx,
                outgoing: out_rx,
            },
        )
    }

    pub fn backlog(&self) -> Backlog {
        Backlog {
            incoming: self.incoming.max_capacity() - self.incoming.capacity(),
            save_to_remote: self.save_to_remote.max_capacity() - self.save_to_remote.capacity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn backlog_tracks_queued_items() {
        let (queues, mut rx) = Queues::new();
        assert_eq!(queues.backlog(), Backlog { incoming: 0, save_to_remote: 0 });
        queues.incoming.send(SyncEvent::ScanComplete).await.unwrap();
        queues.save_to_remote.send(Update::file("a", 1000)).await.unwrap();
        queues.save_to_remote.send(Update::file("b", 1000)).await.unwrap();
        assert_eq!(queues.backlog(), Backlog { incoming: 1, save_to_remote: 2 });
        rx.incoming.recv().await.unwrap();
        rx.save_to_remote.recv().await.unwrap();
        rx.save_to_remote.recv().await.unwrap();
        assert_eq!(queues.backlog(), Backlog { incoming: 0, save_to_remote: 0 });
    }
}
