use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::enums::Priority;

/// Conversation context attached to an inbound message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageContext {
    #[serde(default)]
    pub page_id: Option<String>,
    /// A human operator has already taken over this conversation.
    #[serde(default)]
    pub human_handoff_active: bool,
    #[serde(default)]
    pub cart_items: u32,
}

/// Work item waiting for a worker slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedItem {
    pub id: String,
    pub sender_id: String,
    pub payload: String,
    pub priority: Priority,
    pub queued_at: DateTime<Utc>,
    #[serde(default)]
    pub page_context: Option<PageContext>,
}

/// Acknowledgment returned on admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueReceipt {
    /// Zero-based position in the queue; zero for a sender already in flight.
    pub position: usize,
    pub estimated_wait_ms: u64,
}

/// Admission queue counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: usize,
    pub in_flight: usize,
    pub enqueued_total: u64,
    pub dropped_total: u64,
    pub duplicates_total: u64,
    pub completed_total: u64,
    pub failed_total: u64,
    pub timed_out_total: u64,
    pub avg_wait_ms: f64,
}
