use std::time::Duration;

use vnet_common::constants::{DEFAULT_QUEUE_SIZE, MTU_ETHERNET};

use crate::Error;

/// Properties of a connection between two topology entities.
///
/// The latency, jitter and drop rate describe the whole connection. Each of the two directions of
/// a [`BiLink`](crate::BiLink) enforces half of them (see [`LinkProps::per_direction`]), so a
/// frame and its reply together experience the configured values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkProps {
    /// Base delay added to every frame.
    pub latency: Duration,
    /// Upper bound of the uniformly distributed extra delay added to every frame.
    pub jitter: Duration,
    /// Probability of dropping a frame, between 0 and 1.
    pub drop_rate: f64,
    /// Bandwidth in bytes per second. Zero means unlimited.
    pub bandwidth: u64,
    /// Routing cost of traversing this connection.
    pub weight: u32,
}

impl Default for LinkProps {
    fn default() -> Self {
        Self {
            latency: Duration::ZERO,
            jitter: Duration::ZERO,
            drop_rate: 0.0,
            bandwidth: 0,
            weight: 1,
        }
    }
}

impl LinkProps {
    /// Checks that the drop rate is a probability.
    pub fn validate(&self) -> Result<(), Error> {
        if !self.drop_rate.is_finite() || !(0.0..=1.0).contains(&self.drop_rate) {
            return Err(Error::InvalidProps(format!(
                "drop rate must be within [0, 1], got {}",
                self.drop_rate
            )));
        }

        Ok(())
    }

    /// Returns `true` if frames cross this link without delay or loss.
    #[inline]
    pub fn is_transparent(&self) -> bool {
        self.latency.is_zero() && self.jitter.is_zero() && self.drop_rate == 0.0
    }

    /// Returns `true` if bandwidth limiting is configured.
    #[inline]
    pub fn has_bandwidth_limit(&self) -> bool {
        self.bandwidth > 0
    }

    /// Returns the properties enforced by each direction of a bidirectional link.
    ///
    /// Latency and jitter are halved. The drop rate `p` becomes `1 - sqrt(1 - p)`, so that two
    /// independent drops compose back to `p`. Bandwidth and weight apply to each direction as-is.
    pub fn per_direction(&self) -> Self {
        Self {
            latency: self.latency / 2,
            jitter: self.jitter / 2,
            drop_rate: 1.0 - (1.0 - self.drop_rate).sqrt(),
            ..*self
        }
    }

    /// Compute the effective token bucket burst in bytes: one eighth of a second of traffic, or
    /// 10 MTU-sized frames, whichever is larger.
    pub fn effective_burst_bytes(&self) -> u32 {
        let one_eighth_second = u32::try_from(self.bandwidth / 8).unwrap_or(u32::MAX);
        std::cmp::max(one_eighth_second, MTU_ETHERNET * 10)
    }
}

/// Options shared by every shaper of a link.
#[derive(Debug, Clone)]
pub struct ShaperOptions {
    /// Capacity of the internal queue between the receive and the send loop.
    pub(crate) queue_size: usize,
}

impl Default for ShaperOptions {
    fn default() -> Self {
        Self { queue_size: DEFAULT_QUEUE_SIZE }
    }
}

impl ShaperOptions {
    /// Sets the capacity of the internal queue.
    pub fn queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }
}
