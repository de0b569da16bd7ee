//! Broadcast Hub: fan-out of live stream events to connected viewers.
//!
//! Every subscriber owns a fixed-capacity mailbox. Publishing never waits:
//! when a mailbox is full its oldest event is discarded to make room, so a
//! stalled viewer costs at most `capacity` events of memory and never delays
//! the publisher or any other subscriber.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::models::StreamEvent;

// ---

/// Default per-subscriber mailbox capacity.
pub const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug)]
struct Mailbox {
    queue: Mutex<VecDeque<StreamEvent>>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl Mailbox {
    // ---
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

#[derive(Debug)]
struct HubInner {
    capacity: usize,
    subscribers: RwLock<HashMap<Uuid, Arc<Mailbox>>>,
}

/// Cheaply cloneable handle to the shared subscriber set.
#[derive(Debug, Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl BroadcastHub {
    // ---
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                capacity: capacity.max(1),
                subscribers: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register a new subscriber. It sees only events published after this call.
    pub fn subscribe(&self) -> Subscription {
        // ---
        let id = Uuid::new_v4();
        let mailbox = Arc::new(Mailbox::new(self.inner.capacity));
        let count = {
            let mut subscribers = self.inner.subscribers.write();
            subscribers.insert(id, mailbox.clone());
            subscribers.len()
        };
        tracing::info!("Subscriber {} connected. Total: {}", id, count);

        Subscription {
            id,
            mailbox,
            hub: self.clone(),
        }
    }

    /// Remove a subscriber. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: Uuid) -> bool {
        // ---
        let (removed, count) = {
            let mut subscribers = self.inner.subscribers.write();
            let removed = subscribers.remove(&id);
            (removed, subscribers.len())
        };

        match removed {
            Some(mailbox) => {
                mailbox.close();
                tracing::info!("Subscriber {} disconnected. Total: {}", id, count);
                true
            }
            None => false,
        }
    }

    /// Deliver `event` to every current subscriber; returns how many were reached.
    pub fn publish(&self, event: StreamEvent) -> usize {
        // ---
        let subscribers = self.inner.subscribers.read();
        for (id, mailbox) in subscribers.iter() {
            {
                let mut queue = mailbox.queue.lock();
                if queue.len() >= self.inner.capacity {
                    queue.pop_front();
                    let dropped = mailbox.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::debug!("Subscriber {} lagging, {} events dropped", id, dropped);
                }
                queue.push_back(event.clone());
            }
            mailbox.notify.notify_one();
        }
        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }
}

/// A live subscriber handle. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: Uuid,
    mailbox: Arc<Mailbox>,
    hub: BroadcastHub,
}

impl Subscription {
    // ---
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the next event. Returns `None` once unsubscribed and drained.
    pub async fn recv(&self) -> Option<StreamEvent> {
        // ---
        loop {
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            if self.mailbox.closed.load(Ordering::Acquire) {
                return None;
            }
            self.mailbox.notify.notified().await;
        }
    }

    pub fn try_recv(&self) -> Option<StreamEvent> {
        self.mailbox.queue.lock().pop_front()
    }

    /// Events discarded because this subscriber fell behind.
    pub fn dropped(&self) -> u64 {
        self.mailbox.dropped.load(Ordering::Relaxed)
    }

    pub fn unsubscribe(&self) -> bool {
        self.hub.unsubscribe(self.id)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
    }
}
