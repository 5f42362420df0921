//! Bounded FIFO of outbound messages waiting for an open transport.
//!
//! When full, the oldest message is evicted before a new one is inserted,
//! so `len() <= capacity()` always holds. A failed send during
//! [`MessageQueue::flush`] puts the message back at the front and stops,
//! which keeps the original order for the next flush.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, trace};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default queue capacity.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 10;

// ============================================================================
// QueuedMessage
// ============================================================================

/// A message waiting for delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    /// Opaque payload, encoded at send time.
    pub payload: Value,
    /// When the message entered the queue.
    pub enqueued_at: Instant,
}

impl QueuedMessage {
    /// Wraps a payload, stamped with the current time.
    #[inline]
    #[must_use]
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            enqueued_at: Instant::now(),
        }
    }
}

// ============================================================================
// FlushReport
// ============================================================================

/// Result of one [`MessageQueue::flush`] pass.
#[derive(Debug)]
pub struct FlushReport {
    /// Messages delivered in this pass.
    pub sent: usize,
    /// Messages still queued.
    pub remaining: usize,
    /// The send failure that stopped the pass, if any.
    pub error: Option<Error>,
}

impl FlushReport {
    /// Returns `true` if every queued message was delivered.
    #[inline]
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.error.is_none() && self.remaining == 0
    }
}

// ============================================================================
// MessageQueue
// ============================================================================

/// Drop-oldest bounded FIFO.
#[derive(Debug, Clone)]
pub struct MessageQueue {
    messages: VecDeque<QueuedMessage>,
    capacity: usize,
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_QUEUE_SIZE)
    }
}

impl MessageQueue {
    /// Creates an empty queue. A capacity of zero is raised to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            messages: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Maximum number of queued messages.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of queued messages.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Returns `true` if nothing is queued.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Appends a payload, evicting the oldest message when full.
    ///
    /// Returns the evicted message, if any.
    pub fn enqueue(&mut self, payload: Value) -> Option<QueuedMessage> {
        let evicted = if self.messages.len() >= self.capacity {
            self.messages.pop_front()
        } else {
            None
        };

        if evicted.is_some() {
            debug!(capacity = self.capacity, "Queue full, evicted oldest message");
        }

        self.messages.push_back(QueuedMessage::new(payload));
        trace!(len = self.messages.len(), "Message queued");
        evicted
    }

    /// Removes and returns every message, oldest first.
    pub fn dequeue_all(&mut self) -> Vec<QueuedMessage> {
        self.messages.drain(..).collect()
    }

    /// Removes and returns the oldest message.
    #[inline]
    pub fn pop_front(&mut self) -> Option<QueuedMessage> {
        self.messages.pop_front()
    }

    /// Puts a message back at the front.
    ///
    /// Used after a failed send; the message keeps its original timestamp.
    /// If the queue filled up meanwhile, the newest message is dropped and
    /// returned so the retried one keeps its place.
    pub fn requeue_front(&mut self, message: QueuedMessage) -> Option<QueuedMessage> {
        let dropped = if self.messages.len() >= self.capacity {
            self.messages.pop_back()
        } else {
            None
        };
        self.messages.push_front(message);
        dropped
    }

    /// Iterates over queued payloads, oldest first.
    pub fn payloads(&self) -> impl Iterator<Item = &Value> {
        self.messages.iter().map(|m| &m.payload)
    }

    /// Sends queued messages in order until one fails.
    ///
    /// The failed message returns to the front and the pass stops.
    pub fn flush<F>(&mut self, mut send: F) -> FlushReport
    where
        F: FnMut(&Value) -> Result<()>,
    {
        let mut sent = 0;
        let mut error = None;

        while let Some(message) = self.messages.pop_front() {
            match send(&message.payload) {
                Ok(()) => sent += 1,
                Err(e) => {
                    debug!(error = %e, sent, "Flush interrupted, message requeued");
                    self.messages.push_front(message);
                    error = Some(e);
                    break;
                }
            }
        }

        if sent > 0 {
            debug!(sent, remaining = self.messages.len(), "Queue flushed");
        }

        FlushReport {
            sent,
            remaining: self.messages.len(),
            error,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
