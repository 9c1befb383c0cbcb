//! Channel state: what the client believes it is subscribed to (used to
//! resubscribe after reconnect) and the pending batch that
//! `subscribe`/`unsubscribe` accumulate before a debounced flush.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// The confirmed `(channel, eventSet)` map, rebuilt from scratch on every
/// successful `rpc:on` response and replayed in full by
/// `resubscribeAllChannels` after a reconnect.
#[derive(Default)]
pub struct SubscriptionBook {
    confirmed: Mutex<HashMap<String, HashSet<String>>>,
}

impl SubscriptionBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn confirm_on(&self, channel: &str, events: &[String]) {
        let mut book = self.confirmed.lock().unwrap();
        let set = book.entry(channel.to_owned()).or_default();
        set.extend(events.iter().cloned());
    }

    pub fn confirm_off(&self, channel: &str, events: &[String]) {
        let mut book = self.confirmed.lock().unwrap();
        if let Some(set) = book.get_mut(channel) {
            for event in events {
                set.remove(event);
            }
            if set.is_empty() {
                book.remove(channel);
            }
        }
    }

    /// Snapshot of everything currently believed subscribed, in the shape
    /// `resubscribeAllChannels` replays as one `rpc:on` per channel.
    pub fn snapshot(&self) -> Vec<(String, Vec<String>)> {
        self.confirmed
            .lock()
            .unwrap()
            .iter()
            .map(|(channel, events)| (channel.clone(), events.iter().cloned().collect()))
            .collect()
    }
}

/// Pending adds/removes accumulated between debounce flushes, grouped by
/// channel so each flush issues exactly one `rpc:on`/`rpc:off` per channel.
#[derive(Default)]
pub struct PendingBatch {
    pending_on: Mutex<HashMap<String, HashSet<String>>>,
    pending_off: Mutex<HashMap<String, HashSet<String>>>,
}

impl PendingBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, channel: &str, event: &str) {
        self.pending_on
            .lock()
            .unwrap()
            .entry(channel.to_owned())
            .or_default()
            .insert(event.to_owned());
    }

    pub fn remove(&self, channel: &str, event: &str) {
        self.pending_off
            .lock()
            .unwrap()
            .entry(channel.to_owned())
            .or_default()
            .insert(event.to_owned());
    }

    pub fn is_empty(&self) -> bool {
        self.pending_on.lock().unwrap().is_empty() && self.pending_off.lock().unwrap().is_empty()
    }

    /// Atomically takes everything pending, leaving both maps empty.
    pub fn drain(&self) -> (HashMap<String, HashSet<String>>, HashMap<String, HashSet<String>>) {
        let on = std::mem::take(&mut *self.pending_on.lock().unwrap());
        let off = std::mem::take(&mut *self.pending_off.lock().unwrap());
        (on, off)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirm_on_then_off_clears_empty_channels() {
        let book = SubscriptionBook::new();
        book.confirm_on("room-1", &["tick".to_owned()]);
        assert_eq!(book.snapshot().len(), 1);
        book.confirm_off("room-1", &["tick".to_owned()]);
        assert!(book.snapshot().is_empty());
    }

    #[test]
    fn pending_batch_groups_by_channel() {
        let batch = PendingBatch::new();
        batch.add("room-1", "tick");
        batch.add("room-1", "tock");
        batch.remove("room-2", "ping");
        let (on, off) = batch.drain();
        assert_eq!(on["room-1"].len(), 2);
        assert_eq!(off["room-2"].len(), 1);
        assert!(batch.is_empty());
    }
}
