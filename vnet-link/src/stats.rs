use std::sync::atomic::{AtomicUsize, Ordering};

/// Statistics for one direction of a link. Shared by every shaper the link goes through, so the
/// counters survive shaper conversions.
#[derive(Debug, Default)]
pub struct LinkStats {
    /// Frames taken from the incoming channel.
    frames_rx: AtomicUsize,
    /// Frames handed to the outgoing channel or the relay.
    frames_tx: AtomicUsize,
    /// Bytes handed to the outgoing channel or the relay, as accounted by frame size.
    bytes_tx: AtomicUsize,
    /// Frames dropped by the configured drop rate.
    dropped_loss: AtomicUsize,
    /// Frames dropped because the internal queue was full.
    dropped_queue_full: AtomicUsize,
    /// Frames dropped because the outgoing channel or the relay queue was full or closed.
    dropped_egress_full: AtomicUsize,
    /// Frames copied to a sniffing socket.
    mirrored: AtomicUsize,
    /// Copies not made because the sniffing socket queue was full. The frames themselves are
    /// still forwarded.
    dropped_mirror: AtomicUsize,
    /// Frames handed to an intercepting socket.
    intercepted: AtomicUsize,
    /// Frames discarded without a peer, by a null shaper or from a sniffing socket.
    discarded: AtomicUsize,
}

impl LinkStats {
    #[inline]
    pub(crate) fn increment_rx(&self) {
        self.frames_rx.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_tx(&self, bytes: usize) {
        self.frames_tx.fetch_add(1, Ordering::Relaxed);
        self.bytes_tx.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_dropped_loss(&self) {
        self.dropped_loss.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_dropped_queue_full(&self) {
        self.dropped_queue_full.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_dropped_egress_full(&self) {
        self.dropped_egress_full.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_mirrored(&self) {
        self.mirrored.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_dropped_mirror(&self) {
        self.dropped_mirror.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_intercepted(&self) {
        self.intercepted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_discarded(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Frames taken from the incoming channel.
    #[inline]
    pub fn frames_rx(&self) -> usize {
        self.frames_rx.load(Ordering::Relaxed)
    }

    /// Frames delivered.
    #[inline]
    pub fn frames_tx(&self) -> usize {
        self.frames_tx.load(Ordering::Relaxed)
    }

    /// Bytes delivered, as accounted by frame size.
    #[inline]
    pub fn bytes_tx(&self) -> usize {
        self.bytes_tx.load(Ordering::Relaxed)
    }

    /// Frames lost to the drop rate.
    #[inline]
    pub fn dropped_loss(&self) -> usize {
        self.dropped_loss.load(Ordering::Relaxed)
    }

    /// Frames dropped on a full internal or intercepting queue.
    #[inline]
    pub fn dropped_queue_full(&self) -> usize {
        self.dropped_queue_full.load(Ordering::Relaxed)
    }

    /// Frames dropped on a full or closed egress.
    #[inline]
    pub fn dropped_egress_full(&self) -> usize {
        self.dropped_egress_full.load(Ordering::Relaxed)
    }

    /// Frames copied to a sniffing socket.
    #[inline]
    pub fn mirrored(&self) -> usize {
        self.mirrored.load(Ordering::Relaxed)
    }

    /// Copies skipped because the sniffing socket was full.
    #[inline]
    pub fn dropped_mirror(&self) -> usize {
        self.dropped_mirror.load(Ordering::Relaxed)
    }

    /// Frames handed to an intercepting socket.
    #[inline]
    pub fn intercepted(&self) -> usize {
        self.intercepted.load(Ordering::Relaxed)
    }

    /// Frames discarded on purpose.
    #[inline]
    pub fn discarded(&self) -> usize {
        self.discarded.load(Ordering::Relaxed)
    }
}
