//! Broadcast hub: fans push messages out to every registered subscriber.
//!
//! Each subscriber owns a bounded queue. Publishing never waits: a message
//! is serialized once and offered to every queue without blocking, and a
//! full queue is handled by the configured [`OverflowPolicy`] for that
//! subscriber alone. The consuming side of a queue is a [`Subscription`],
//! normally driven by one push-channel task per client.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::model::{PushMessage, Record};

/// Default bound of each subscriber's outbound queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// A serialized push message, shared by every queue it was offered to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    kind: &'static str,
    json: Arc<str>,
}

impl Payload {
    /// Message type, e.g. `log`.
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn as_str(&self) -> &str {
        &self.json
    }
}

impl Deref for Payload {
    type Target = str;

    fn deref(&self) -> &str {
        &self.json
    }
}

/// What to do when a subscriber's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Discard the oldest queued message to make room.
    #[default]
    DropOldest,
    /// Close the subscriber and release its queue.
    Disconnect,
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverflowPolicy::DropOldest => f.write_str("drop-oldest"),
            OverflowPolicy::Disconnect => f.write_str("disconnect"),
        }
    }
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop-oldest" | "drop_oldest" | "drop" => Ok(OverflowPolicy::DropOldest),
            "disconnect" | "evict" => Ok(OverflowPolicy::Disconnect),
            other => Err(format!(
                "unknown overflow policy '{}' (expected drop-oldest or disconnect)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HubConfig {
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            overflow: OverflowPolicy::default(),
        }
    }
}

struct SlotState {
    queue: VecDeque<Payload>,
    /// Id of the last record queued for this subscriber.
    cursor: u64,
    closed: bool,
    dropped: u64,
}

struct Slot {
    id: u64,
    state: Mutex<SlotState>,
    notify: Notify,
}

impl Slot {
    fn new(id: u64, closed: bool) -> Self {
        Self {
            id,
            state: Mutex::new(SlotState {
                queue: VecDeque::new(),
                cursor: 0,
                closed,
                dropped: 0,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn close(&self, discard: bool) {
        {
            let mut state = self.lock();
            state.closed = true;
            if discard {
                state.queue.clear();
            }
        }
        self.notify.notify_one();
    }
}

enum Offer {
    Queued,
    Skipped,
    DroppedOldest,
    Evicted,
}

struct HubShared {
    config: HubConfig,
    next_id: AtomicU64,
    closed: AtomicBool,
    subscribers: RwLock<HashMap<u64, Arc<Slot>>>,
}

impl HubShared {
    fn remove(&self, id: u64) -> bool {
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .is_some()
    }

    fn offer(&self, slot: &Slot, payload: &Payload, record_id: Option<u64>) -> Offer {
        let capacity = self.config.queue_capacity.max(1);
        let outcome = {
            let mut state = slot.lock();
            if state.closed {
                return Offer::Skipped;
            }
            if let Some(id) = record_id {
                if id <= state.cursor {
                    return Offer::Skipped;
                }
                state.cursor = id;
            }

            if state.queue.len() < capacity {
                state.queue.push_back(payload.clone());
                Offer::Queued
            } else {
                match self.config.overflow {
                    OverflowPolicy::DropOldest => {
                        state.queue.pop_front();
                        state.queue.push_back(payload.clone());
                        state.dropped += 1;
                        Offer::DroppedOldest
                    }
                    OverflowPolicy::Disconnect => {
                        state.closed = true;
                        state.queue.clear();
                        Offer::Evicted
                    }
                }
            }
        };
        slot.notify.notify_one();
        outcome
    }
}

/// Registry of subscribers. Cheap to clone; clones share the registry.
#[derive(Clone)]
pub struct BroadcastHub {
    shared: Arc<HubShared>,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

impl BroadcastHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            shared: Arc::new(HubShared {
                config,
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                subscribers: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> HubConfig {
        self.shared.config
    }

    /// Register a new subscriber. After [`close_all`](Self::close_all) the
    /// returned subscription is already closed.
    pub fn subscribe(&self) -> Subscription {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);

        // The closed flag is read under the registry lock that close_all
        // drains under, so a slot is either drained or born closed.
        let mut subscribers = self
            .shared
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let closed = self.shared.closed.load(Ordering::Acquire);
        let slot = Arc::new(Slot::new(id, closed));
        if !closed {
            subscribers.insert(id, slot.clone());
            debug!(subscriber = id, total = subscribers.len(), "subscriber registered");
        }
        drop(subscribers);

        Subscription {
            slot,
            hub: Arc::downgrade(&self.shared),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Offer a newly appended record to every subscriber.
    pub fn publish_record(&self, record: &Record) {
        self.publish(&PushMessage::Log(record.clone()));
    }

    /// Offer `message` to every subscriber. Record messages are delivered
    /// at most once per subscriber, in increasing id order.
    pub fn publish(&self, message: &PushMessage) {
        let payload = match serde_json::to_string(message) {
            Ok(json) => Payload {
                kind: message.kind(),
                json: json.into(),
            },
            Err(e) => {
                error!(error = %e, kind = message.kind(), "failed to serialize push message");
                return;
            }
        };
        let record_id = match message {
            PushMessage::Log(record) => Some(record.id),
            _ => None,
        };

        let mut evicted = Vec::new();
        {
            let subscribers = self
                .shared
                .subscribers
                .read()
                .unwrap_or_else(|e| e.into_inner());
            for slot in subscribers.values() {
                match self.shared.offer(slot, &payload, record_id) {
                    Offer::Queued | Offer::Skipped => {}
                    Offer::DroppedOldest => {
                        debug!(subscriber = slot.id, "subscriber queue full, dropped oldest message");
                    }
                    Offer::Evicted => evicted.push(slot.id),
                }
            }
        }

        for id in evicted {
            if self.shared.remove(id) {
                warn!(
                    subscriber = id,
                    capacity = self.shared.config.queue_capacity,
                    "subscriber queue full, disconnecting"
                );
            }
        }
    }

    /// Close every subscriber. Already queued messages remain readable;
    /// afterwards each subscription yields `None`.
    pub fn close_all(&self) {
        let drained: Vec<Arc<Slot>> = {
            let mut subscribers = self
                .shared
                .subscribers
                .write()
                .unwrap_or_else(|e| e.into_inner());
            self.shared.closed.store(true, Ordering::Release);
            subscribers.drain().map(|(_, slot)| slot).collect()
        };
        for slot in &drained {
            slot.close(false);
        }
        if !drained.is_empty() {
            info!(subscribers = drained.len(), "closed all subscribers");
        }
    }
}

/// Receiving end of one subscriber's queue. Dropping it deregisters the
/// subscriber and releases the queue.
pub struct Subscription {
    slot: Arc<Slot>,
    hub: Weak<HubShared>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.slot.id
    }

    /// Wait for the next message. Returns `None` once the subscriber has
    /// been closed and its queue is empty.
    pub async fn recv(&mut self) -> Option<Payload> {
        loop {
            {
                let mut state = self.slot.lock();
                if let Some(payload) = state.queue.pop_front() {
                    return Some(payload);
                }
                if state.closed {
                    return None;
                }
            }
            self.slot.notify.notified().await;
        }
    }

    /// Take the next queued message without waiting.
    pub fn try_recv(&mut self) -> Option<Payload> {
        self.slot.lock().queue.pop_front()
    }

    /// Number of messages discarded by the drop-oldest policy.
    pub fn dropped(&self) -> u64 {
        self.slot.lock().dropped
    }

    /// Id of the last record queued for this subscriber.
    pub fn cursor(&self) -> u64 {
        self.slot.lock().cursor
    }

    pub fn is_closed(&self) -> bool {
        self.slot.lock().closed
    }

    pub fn queued(&self) -> usize {
        self.slot.lock().queue.len()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.slot.close(true);
        if let Some(hub) = self.hub.upgrade()
            && hub.remove(self.slot.id)
        {
            debug!(subscriber = self.slot.id, "subscriber deregistered");
        }
    }
}
