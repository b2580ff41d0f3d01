use std::sync::Arc;

use tokio::sync::mpsc;
use vnet_common::Delay;
use vnet_transport::RedirectionSocket;
use vnet_wire::Frame;

use super::{check_socket, Core, Egress, Mode, ShaperKind};
use crate::{Error, InterceptShaper, LinkProps, LinkStats, ShaperOptions, SniffShaper};

/// Delays, drops and rate limits frames between two local channels.
///
/// When the link has no latency, jitter or loss, frames are scheduled for immediate delivery and
/// only the bandwidth limit applies.
#[derive(Debug)]
pub struct NetworkShaper {
    pub(super) core: Core,
    pub(super) outgoing: mpsc::Sender<Frame>,
}

impl NetworkShaper {
    /// Creates a stopped shaper forwarding from `incoming` to `outgoing`.
    pub fn new(
        props: LinkProps,
        incoming: mpsc::Receiver<Frame>,
        outgoing: mpsc::Sender<Frame>,
        options: &ShaperOptions,
    ) -> Self {
        Self { core: Core::new(props, incoming, Delay::default(), options), outgoing }
    }

    /// The properties this shaper applies.
    pub fn props(&self) -> &LinkProps {
        self.core.props()
    }

    /// Counters shared with the link.
    pub fn stats(&self) -> &Arc<LinkStats> {
        self.core.stats()
    }

    /// Returns `true` if the shaper loops are running.
    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    /// Spawns the receive and send loops.
    pub fn start(&mut self) -> Result<(), Error> {
        self.core.start(
            ShaperKind::Network,
            Mode::Forward,
            None,
            Egress::Local(self.outgoing.clone()),
        )
    }

    /// Stops both loops, keeping the queue.
    pub async fn stop(&mut self) -> Result<(), Error> {
        self.core.stop().await.map(|_| ())
    }

    /// Stops this shaper and turns it into a [`SniffShaper`] mirroring to `socket`. A stopped
    /// socket is refused before the shaper is touched.
    pub async fn into_sniff(
        mut self,
        socket: RedirectionSocket,
    ) -> Result<SniffShaper, (Self, Error)> {
        if let Err(e) = check_socket(&socket) {
            return Err((self, e));
        }
        if let Err(e) = self.stop().await {
            return Err((self, e));
        }
        Ok(SniffShaper { core: self.core, outgoing: self.outgoing, socket })
    }

    /// Stops this shaper and turns it into an [`InterceptShaper`] redirecting through `socket`.
    pub async fn into_intercept(
        mut self,
        socket: RedirectionSocket,
    ) -> Result<InterceptShaper, (Self, Error)> {
        if let Err(e) = check_socket(&socket) {
            return Err((self, e));
        }
        if let Err(e) = self.stop().await {
            return Err((self, e));
        }
        Ok(InterceptShaper { core: self.core, outgoing: self.outgoing, socket })
    }

    pub(super) fn into_incoming(self) -> Option<mpsc::Receiver<Frame>> {
        self.core.into_incoming()
    }
}
