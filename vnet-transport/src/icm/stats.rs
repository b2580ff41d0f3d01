use std::sync::atomic::{AtomicUsize, Ordering};

/// Statistics for an inter-machine relay. These are shared between the relay loops and the
/// front-end.
#[derive(Debug, Default)]
pub struct IcmStats {
    /// Frames decoded from inbound connections.
    frames_in: AtomicUsize,
    /// Frames encoded onto outbound connections.
    frames_out: AtomicUsize,
    /// Inbound frames dropped because the inbound queue was full.
    inbound_dropped: AtomicUsize,
    /// Outbound frames dropped because the outbound or per-connection queue was full.
    outbound_dropped: AtomicUsize,
    /// Frames dropped because no local router or remote connection matched.
    unroutable: AtomicUsize,
    /// Inbound connections closed after a decode error.
    decode_errors: AtomicUsize,
    /// Outbound connections marked dead after a write error.
    dead_connections: AtomicUsize,
    /// Currently open inbound connections.
    active_inbound: AtomicUsize,
}

impl IcmStats {
    #[inline]
    pub(crate) fn increment_in(&self) {
        self.frames_in.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_out(&self, n: usize) {
        self.frames_out.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_inbound_dropped(&self) {
        self.inbound_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_outbound_dropped(&self) {
        self.outbound_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_unroutable(&self) {
        self.unroutable.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_decode_errors(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_dead_connections(&self) {
        self.dead_connections.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_active_inbound(&self) {
        self.active_inbound.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn decrement_active_inbound(&self) {
        self.active_inbound.fetch_sub(1, Ordering::Relaxed);
    }

    /// Frames decoded from inbound connections.
    #[inline]
    pub fn frames_in(&self) -> usize {
        self.frames_in.load(Ordering::Relaxed)
    }

    /// Frames encoded onto outbound connections.
    #[inline]
    pub fn frames_out(&self) -> usize {
        self.frames_out.load(Ordering::Relaxed)
    }

    /// Inbound frames dropped on a full inbound queue.
    #[inline]
    pub fn inbound_dropped(&self) -> usize {
        self.inbound_dropped.load(Ordering::Relaxed)
    }

    /// Outbound frames dropped on a full queue.
    #[inline]
    pub fn outbound_dropped(&self) -> usize {
        self.outbound_dropped.load(Ordering::Relaxed)
    }

    /// Frames no local router or remote connection matched.
    #[inline]
    pub fn unroutable(&self) -> usize {
        self.unroutable.load(Ordering::Relaxed)
    }

    /// Inbound connections closed after a decode error.
    #[inline]
    pub fn decode_errors(&self) -> usize {
        self.decode_errors.load(Ordering::Relaxed)
    }

    /// Outbound connections marked dead after a write error.
    #[inline]
    pub fn dead_connections(&self) -> usize {
        self.dead_connections.load(Ordering::Relaxed)
    }

    /// Currently open inbound connections.
    #[inline]
    pub fn active_inbound(&self) -> usize {
        self.active_inbound.load(Ordering::Relaxed)
    }
}
