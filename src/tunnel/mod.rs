//! Tunnel module - lanes, fair writes, and the multiplexer.

mod lane;
mod lane_table;
mod mux;
mod writer;

pub use lane::{ChunkPush, Lane, LaneMode, Opener, SendDecision};
pub use lane_table::LaneTable;
pub use mux::{Subscription, SubscriptionEvent, TunnelHandle};
pub use writer::{spawn_writer_task, OutboundQueues};

pub(crate) use mux::{spawn_tunnel, Role, TunnelParams};

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic transaction-id source, unique within one tunnel.
pub struct TxnCounter {
    counter: AtomicU64,
}

impl TxnCounter {
    pub fn new() -> Self {
        Self { counter: AtomicU64::new(1) }
    }

    /// Next id, `T-1`, `T-2`, …
    pub fn next(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("T-{n}")
    }
}

impl Default for TxnCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_txn_counter_monotone() {
        let txns = TxnCounter::new();
        assert_eq!(txns.next(), "T-1");
        assert_eq!(txns.next(), "T-2");
        assert_eq!(txns.next(), "T-3");
    }
}
