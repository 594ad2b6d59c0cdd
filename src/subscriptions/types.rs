//! Subscription types for engine events.

use crate::types::{Cursor, Epoch};
use serde::{Deserialize, Serialize};

/// Configuration for a subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    /// Max buffered events before dropping subscriber.
    /// Default: 1000
    pub buffer_size: usize,

    /// Filter criteria.
    pub filter: SubscriptionFilter,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            filter: SubscriptionFilter::all(),
        }
    }
}

/// Filter criteria for subscriptions.
#[derive(Clone, Debug, Default)]
pub struct SubscriptionFilter {
    /// Advance, revoke, merge and reset.
    pub include_epochs: bool,

    /// Solidify results.
    pub include_solidify: bool,

    /// Cursor marker moves.
    pub include_markers: bool,

    /// Store registration.
    pub include_stores: bool,
}

impl SubscriptionFilter {
    /// Epoch lifecycle only.
    pub fn epochs() -> Self {
        Self {
            include_epochs: true,
            ..Default::default()
        }
    }

    /// Finality: solidify and marker moves.
    pub fn finality() -> Self {
        Self {
            include_solidify: true,
            include_markers: true,
            ..Default::default()
        }
    }

    /// Subscribe to everything.
    pub fn all() -> Self {
        Self {
            include_epochs: true,
            include_solidify: true,
            include_markers: true,
            include_stores: true,
        }
    }

    pub(crate) fn matches(&self, event: &EngineEvent) -> bool {
        match event {
            EngineEvent::Advanced { .. }
            | EngineEvent::Revoked { .. }
            | EngineEvent::Merged { .. }
            | EngineEvent::Reset { .. } => self.include_epochs,
            EngineEvent::Solidified { .. } => self.include_solidify,
            EngineEvent::MarkerMoved { .. } => self.include_markers,
            EngineEvent::StoreRegistered { .. } => self.include_stores,
            EngineEvent::Dropped { .. } => true,
        }
    }
}

/// Events emitted by an engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    StoreRegistered {
        name: String,
    },

    /// A new epoch was opened on every store.
    Advanced {
        epoch: Epoch,
    },

    /// The newest epoch was discarded.
    Revoked {
        epoch: Epoch,
    },

    /// The newest epoch was folded into `into`.
    Merged {
        into: Epoch,
    },

    /// Epochs up to and including `through` are now irreversible.
    Solidified {
        through: Epoch,
        count: usize,
    },

    /// Every open epoch was discarded.
    Reset {
        root_epoch: Epoch,
    },

    MarkerMoved {
        cursor: Cursor,
        epoch: Epoch,
    },

    /// Subscription was dropped.
    Dropped {
        reason: DropReason,
    },
}

/// Why a subscription was dropped.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly unsubscribed.
    Unsubscribed,
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Handle to manage a subscription.
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    /// Channel to receive events.
    pub receiver: crossbeam_channel::Receiver<EngineEvent>,
}

impl SubscriptionHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<EngineEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<EngineEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<EngineEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything currently buffered.
    pub fn drain(&self) -> Vec<EngineEvent> {
        self.receiver.try_iter().collect()
    }
}
