//! Fan-out of count updates to live observers.
//!
//! Each subscriber owns a bounded channel. Publishing never waits: a subscriber whose
//! channel is full misses that update and is expected to catch up from the next one, and a
//! subscriber whose receiver is gone is pruned.

use log::debug;
use proctree_shared::protocol::CountUpdate;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Updates buffered per subscriber before new ones are dropped for it.
const CHANNEL_CAPACITY: usize = 64;

pub const DEFAULT_MAX_SUBSCRIBERS: usize = 1024;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SubscribeError {
    #[error("maximum subscribers reached ({max})")]
    TooManySubscribers { max: usize },
}

#[derive(Debug)]
struct Subscriber {
    id: u64,
    sender: mpsc::Sender<CountUpdate>,
    missed: u64,
}

#[derive(Debug)]
pub struct Notifier {
    subscribers: Vec<Subscriber>,
    next_id: u64,
    max_subscribers: usize,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SUBSCRIBERS)
    }
}

impl Notifier {
    pub fn new(max_subscribers: usize) -> Self {
        Self {
            subscribers: Vec::new(),
            next_id: 1,
            max_subscribers,
        }
    }

    /// Register a new subscriber. Returns its id and the receiving end of its channel.
    pub fn subscribe(&mut self) -> Result<(u64, mpsc::Receiver<CountUpdate>), SubscribeError> {
        self.prune_disconnected();
        if self.subscribers.len() >= self.max_subscribers {
            return Err(SubscribeError::TooManySubscribers {
                max: self.max_subscribers,
            });
        }

        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.push(Subscriber {
            id,
            sender,
            missed: 0,
        });
        debug!("Subscriber {id} registered ({} live)", self.subscribers.len());

        Ok((id, receiver))
    }

    pub fn unsubscribe(&mut self, id: u64) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| s.id != id);
        before != self.subscribers.len()
    }

    /// Push `total` to every live subscriber. Returns how many received it.
    pub fn notify(&mut self, total: usize) -> usize {
        let update = CountUpdate::new(total);
        let mut delivered = 0;

        self.subscribers
            .retain_mut(|subscriber| match subscriber.sender.try_send(update) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    subscriber.missed += 1;
                    debug!(
                        "Subscriber {} is lagging, dropped update (missed {})",
                        subscriber.id, subscriber.missed
                    );
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Subscriber {} disconnected", subscriber.id);
                    false
                }
            });

        delivered
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    fn prune_disconnected(&mut self) {
        self.subscribers.retain(|s| !s.sender.is_closed());
    }
}
