use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::messaging::envelope::{Envelope, MessageId};


#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub envelope: Envelope,
    pub first_sent_at: Instant,
    pub last_sent_at: Instant,
}

/// Messages that were transmitted with a request for acknowledgement, and that were not
///  acknowledged yet. Keyed by id, so retransmission happens in send order.
#[derive(Debug, Default)]
pub struct UnackedSet {
    pending: BTreeMap<MessageId, PendingMessage>,
}

impl UnackedSet {
    pub fn insert(&mut self, envelope: Envelope, now: Instant) {
        self.pending.insert(envelope.id, PendingMessage {
            envelope,
            first_sent_at: now,
            last_sent_at: now,
        });
    }

    /// returns `true` if the id was pending, `false` for duplicate or unknown acks
    pub fn ack(&mut self, id: MessageId) -> bool {
        self.pending.remove(&id).is_some()
    }

    /// pending messages whose last transmission lies more than `threshold` in the past
    pub fn due_for_resend(&self, now: Instant, threshold: Duration) -> Vec<PendingMessage> {
        self.pending.values()
            .filter(|p| now.saturating_duration_since(p.last_sent_at) > threshold)
            .cloned()
            .collect()
    }

    pub fn mark_resent(&mut self, id: MessageId, now: Instant) {
        if let Some(p) = self.pending.get_mut(&id) {
            p.last_sent_at = now;
        }
    }

    pub fn ids(&self) -> Vec<MessageId> {
        self.pending.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
