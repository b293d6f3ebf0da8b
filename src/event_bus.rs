//! Per-session publish/subscribe with a bounded replay buffer
//!
//! `EventBus` fans every published [`SessionEvent`] out to all live
//! subscribers and keeps the most recent events in a fixed-capacity ring so a
//! reconnecting viewer can catch up. Each subscriber owns an independent
//! unbounded queue, so a slow reader never stalls `publish`.

use crate::event::{EventEnvelope, SessionEvent};
use futures::Stream;
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

/// Default number of events retained for replay
pub const DEFAULT_REPLAY_CAPACITY: usize = 100;

/// Per-session event bus
pub struct EventBus {
    session_id: String,
    capacity: usize,
    inner: Mutex<BusInner>,
}

struct BusInner {
    buffer: VecDeque<EventEnvelope>,
    next_sequence: u64,
    subscribers: HashMap<String, mpsc::UnboundedSender<EventEnvelope>>,
    closed: bool,
}

impl EventBus {
    /// Create a bus retaining up to `capacity` events for replay
    pub fn new(session_id: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            session_id: session_id.into(),
            capacity,
            inner: Mutex::new(BusInner {
                buffer: VecDeque::with_capacity(capacity),
                next_sequence: 0,
                subscribers: HashMap::new(),
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Session this bus belongs to
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Publish an event to the ring buffer and every live subscriber
    ///
    /// Returns the event's sequence number, or `None` once the bus is closed.
    pub fn publish(&self, event: SessionEvent) -> Option<u64> {
        let mut inner = self.lock();
        if inner.closed {
            tracing::debug!(
                session_id = %self.session_id,
                event = event.kind(),
                "Dropping event published after bus close"
            );
            return None;
        }

        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        let envelope = EventEnvelope {
            sequence,
            timestamp: chrono::Utc::now(),
            event,
        };

        if inner.buffer.len() >= self.capacity {
            inner.buffer.pop_front();
        }
        inner.buffer.push_back(envelope.clone());

        // Receivers that went away are pruned here rather than on drop.
        inner.subscribers.retain(|subscriber_id, tx| {
            let alive = tx.send(envelope.clone()).is_ok();
            if !alive {
                tracing::debug!(subscriber = %subscriber_id, "Pruning disconnected subscriber");
            }
            alive
        });

        Some(sequence)
    }

    /// Subscribe to live events only
    ///
    /// Subscribing again with the same id closes the previous subscription.
    pub fn subscribe(&self, subscriber_id: &str) -> Subscription {
        self.subscribe_from(subscriber_id, None)
    }

    /// Subscribe, first replaying retained events with sequence >= `from`
    ///
    /// Replay and registration happen under one lock, so the subscriber sees
    /// every event exactly once across the replay/live boundary.
    pub fn subscribe_from(&self, subscriber_id: &str, from: Option<u64>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();

        if inner.subscribers.remove(subscriber_id).is_some() {
            tracing::debug!(
                session_id = %self.session_id,
                subscriber = %subscriber_id,
                "Replacing existing subscription"
            );
        }

        if let Some(from) = from {
            for envelope in inner.buffer.iter().filter(|e| e.sequence >= from) {
                // rx is held locally, send cannot fail
                let _ = tx.send(envelope.clone());
            }
        }

        if inner.closed {
            // Dropping tx ends the stream right after any replayed events.
            drop(tx);
        } else {
            inner.subscribers.insert(subscriber_id.to_string(), tx);
        }

        Subscription {
            subscriber_id: subscriber_id.to_string(),
            stream: UnboundedReceiverStream::new(rx),
        }
    }

    /// Close one subscriber's queue; returns whether it existed
    pub fn unsubscribe(&self, subscriber_id: &str) -> bool {
        self.lock().subscribers.remove(subscriber_id).is_some()
    }

    /// Close every subscriber queue and reject further publishes
    pub fn close_all(&self) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        let count = inner.subscribers.len();
        inner.subscribers.clear();
        tracing::debug!(session_id = %self.session_id, subscribers = count, "Event bus closed");
    }

    /// Snapshot of retained events with sequence >= `from`, in publish order
    pub fn replay(&self, from: u64) -> Vec<EventEnvelope> {
        self.lock()
            .buffer
            .iter()
            .filter(|e| e.sequence >= from)
            .cloned()
            .collect()
    }

    /// Number of events currently retained
    pub fn buffered(&self) -> usize {
        self.lock().buffer.len()
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Sequence number the next published event will receive
    pub fn next_sequence(&self) -> u64 {
        self.lock().next_sequence
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// Lazy stream of events for one subscriber
///
/// Ends when the subscriber is replaced, unsubscribed, or the bus closes.
pub struct Subscription {
    subscriber_id: String,
    stream: UnboundedReceiverStream<EventEnvelope>,
}

impl Subscription {
    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    /// Receive the next event, or `None` once the subscription has ended
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        self.stream.next().await
    }
}

impl Stream for Subscription {
    type Item = EventEnvelope;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.stream).poll_next(cx)
    }
}
