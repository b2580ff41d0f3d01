//! Types shared by every vnet crate.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

/// Identifier of a topology entity (node, bridge or router).
pub type EntityId = String;

/// Identifier of a router. Routers share the entity id namespace.
pub type RouterId = EntityId;

/// Identifier of a physical machine taking part in the emulation.
pub type MachineId = String;

/// Measured one-way delay towards a peer machine.
///
/// The value is written asynchronously by whatever measures round trips to the peer and read by
/// every shaper that forwards towards it, so that the real network latency is subtracted from the
/// emulated one. Cloning shares the underlying cell.
#[derive(Debug, Clone, Default)]
pub struct Delay(Arc<AtomicU64>);

impl Delay {
    /// Creates a new delay cell holding `value`.
    pub fn new(value: Duration) -> Self {
        let delay = Self::default();
        delay.set(value);
        delay
    }

    /// Returns the current delay.
    #[inline]
    pub fn get(&self) -> Duration {
        Duration::from_micros(self.0.load(Ordering::Relaxed))
    }

    /// Replaces the current delay. Sub-microsecond precision is truncated.
    #[inline]
    pub fn set(&self, value: Duration) {
        let micros = u64::try_from(value.as_micros()).unwrap_or(u64::MAX);
        self.0.store(micros, Ordering::Relaxed);
    }
}

/// Sizes and defaults shared by the vnet crates.
#[allow(non_upper_case_globals)]
pub mod constants {
    /// One kibibyte.
    pub const KiB: u32 = 1024;

    /// Maximum transmission unit of an Ethernet link, in bytes.
    pub const MTU_ETHERNET: u32 = 1500;

    /// Default capacity of every bounded frame queue.
    pub const DEFAULT_QUEUE_SIZE: usize = 1024;

    /// How long a router waits for a path before discarding a frame to an unknown destination.
    pub const DEFAULT_ORACLE_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(100);
}
