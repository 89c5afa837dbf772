//! Output hub: ordered fan-out of session output.
//!
//! Producers (reader loop, write dispatcher, session state changes)
//! publish without ever blocking. Each subscriber reads from its own
//! bounded window over the stream; a subscriber that falls more than
//! `capacity` messages behind loses the oldest ones and is told how
//! many on its next receive. Other subscribers are unaffected.

use crate::serial::types::HubMessage;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

/// What a subscriber observes.
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    Message(HubMessage),
    /// This subscriber fell behind and `n` messages were dropped.
    Lagged(u64),
    /// The hub is gone; no further messages will arrive.
    Closed,
}

/// Broadcast point shared by every producer of a session.
#[derive(Debug, Clone)]
pub struct OutputHub {
    tx: broadcast::Sender<HubMessage>,
    capacity: usize,
}

impl OutputHub {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            capacity: capacity.next_power_of_two(),
        }
    }

    /// Effective per-subscriber bound. The broadcast channel rounds the
    /// requested capacity up to a power of two.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Publish to every current subscriber. Returns how many received it;
    /// publishing with nobody attached is not an error.
    pub fn publish(&self, msg: HubMessage) -> usize {
        self.tx.send(msg).unwrap_or(0)
    }

    /// Attach a new consumer. It sees only messages published from now on.
    pub fn subscribe(&self) -> HubSubscriber {
        HubSubscriber {
            rx: self.tx.subscribe(),
            dropped: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// One consumer's view of the hub.
#[derive(Debug)]
pub struct HubSubscriber {
    rx: broadcast::Receiver<HubMessage>,
    dropped: u64,
}

impl HubSubscriber {
    /// Wait for the next event.
    pub async fn recv(&mut self) -> HubEvent {
        match self.rx.recv().await {
            Ok(msg) => HubEvent::Message(msg),
            Err(RecvError::Lagged(n)) => self.lagged(n),
            Err(RecvError::Closed) => HubEvent::Closed,
        }
    }

    /// Next event if one is ready.
    pub fn try_recv(&mut self) -> Option<HubEvent> {
        match self.rx.try_recv() {
            Ok(msg) => Some(HubEvent::Message(msg)),
            Err(TryRecvError::Lagged(n)) => Some(self.lagged(n)),
            Err(TryRecvError::Closed) => Some(HubEvent::Closed),
            Err(TryRecvError::Empty) => None,
        }
    }

    /// Drain everything that is ready, skipping lag notices.
    pub fn drain_messages(&mut self) -> Vec<HubMessage> {
        let mut out = Vec::new();
        while let Some(event) = self.try_recv() {
            match event {
                HubEvent::Message(msg) => out.push(msg),
                HubEvent::Lagged(_) => continue,
                HubEvent::Closed => break,
            }
        }
        out
    }

    /// Messages lost to lag so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn lagged(&mut self, n: u64) -> HubEvent {
        self.dropped += n;
        log::warn!("[serial:hub] subscriber fell behind, {} message(s) dropped", n);
        HubEvent::Lagged(n)
    }
}
