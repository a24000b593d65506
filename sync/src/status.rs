//! Per-record sync status subscriptions.
//!
//! Each observed record gets a `watch` channel holding its latest
//! [`SyncMetadata`]. Subscribers see the current value first, then every
//! change. Dropping the stream cancels the subscription; the stream ends
//! when the record goes away or the hub is closed.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::watch;
use workspot_engine::{RecordId, SyncMetadata};

#[derive(Debug, Default)]
pub struct StatusHub {
    channels: DashMap<RecordId, watch::Sender<SyncMetadata>>,
}

impl StatusHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stream of status updates for `current.record_id`, starting with
    /// `current`.
    pub fn subscribe(&self, current: SyncMetadata) -> BoxStream<'static, SyncMetadata> {
        let receiver = match self.channels.entry(current.record_id.clone()) {
            Entry::Occupied(entry) => {
                entry.get().send_replace(current);
                entry.get().subscribe()
            }
            Entry::Vacant(entry) => {
                let (sender, receiver) = watch::channel(current);
                entry.insert(sender);
                receiver
            }
        };

        stream::unfold((receiver, true), |(mut receiver, first)| async move {
            if !first && receiver.changed().await.is_err() {
                return None;
            }
            let value = receiver.borrow_and_update().clone();
            Some((value, (receiver, false)))
        })
        .boxed()
    }

    /// Broadcast a new status. A no-op when nobody listens.
    pub fn publish(&self, meta: &SyncMetadata) {
        let unobserved = match self.channels.get(&meta.record_id) {
            Some(sender) => sender.send(meta.clone()).is_err(),
            None => return,
        };
        if unobserved {
            self.channels
                .remove_if(&meta.record_id, |_, sender| sender.receiver_count() == 0);
        }
    }

    /// End every stream observing `id`.
    pub fn close(&self, id: &str) {
        self.channels.remove(id);
    }

    /// End every stream.
    pub fn close_all(&self) {
        self.channels.clear();
    }

    pub fn observed(&self) -> usize {
        self.channels.len()
    }
}
