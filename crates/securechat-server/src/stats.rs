//! Engine counters
//!
//! Lock-free counters updated by the engine and its handlers. `snapshot()`
//! copies them into a plain struct for reporting.

use core::sync::atomic::{AtomicU64, Ordering};

// ----------------------------------------------------------------------------
// Live Counters
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct EngineStats {
    connections_assigned: AtomicU64,
    assignments_rejected: AtomicU64,
    handshakes_completed: AtomicU64,
    handshakes_failed: AtomicU64,
    handlers_replaced: AtomicU64,
    sessions_closed: AtomicU64,
    broadcasts: AtomicU64,
    private_delivered: AtomicU64,
    private_dropped: AtomicU64,
    delivery_failures: AtomicU64,
}

macro_rules! counter {
    ($($record:ident => $field:ident),* $(,)?) => {
        $(
            pub(crate) fn $record(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl EngineStats {
    counter! {
        record_assigned => connections_assigned,
        record_rejected => assignments_rejected,
        record_handshake_completed => handshakes_completed,
        record_handshake_failed => handshakes_failed,
        record_replaced => handlers_replaced,
        record_session_closed => sessions_closed,
        record_broadcast => broadcasts,
        record_private_delivered => private_delivered,
        record_private_dropped => private_dropped,
        record_delivery_failure => delivery_failures,
    }

    /// Copy the current values
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            connections_assigned: load(&self.connections_assigned),
            assignments_rejected: load(&self.assignments_rejected),
            handshakes_completed: load(&self.handshakes_completed),
            handshakes_failed: load(&self.handshakes_failed),
            handlers_replaced: load(&self.handlers_replaced),
            sessions_closed: load(&self.sessions_closed),
            broadcasts: load(&self.broadcasts),
            private_delivered: load(&self.private_delivered),
            private_dropped: load(&self.private_dropped),
            delivery_failures: load(&self.delivery_failures),
        }
    }
}

// ----------------------------------------------------------------------------
// Snapshot
// ----------------------------------------------------------------------------

/// Point-in-time copy of the engine counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Connections handed to a handler
    pub connections_assigned: u64,
    /// Connections refused because the pool was empty
    pub assignments_rejected: u64,
    pub handshakes_completed: u64,
    pub handshakes_failed: u64,
    /// Handlers retired and replaced after a handshake failure
    pub handlers_replaced: u64,
    pub sessions_closed: u64,
    pub broadcasts: u64,
    pub private_delivered: u64,
    /// Private messages whose target matched no occupied handler
    pub private_dropped: u64,
    /// Outbound writes that failed and were swallowed
    pub delivery_failures: u64,
}
