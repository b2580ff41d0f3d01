use std::sync::Arc;

use tokio::sync::mpsc;
use vnet_common::{Delay, RouterId};
use vnet_wire::{Frame, RouterFrame};

use super::{Core, Egress, Mode, ShaperKind};
use crate::{Error, LinkProps, LinkStats, ShaperOptions};

/// Shapes frames towards a router on another machine and posts them to the relay's outbound
/// queue.
///
/// The measured one-way delay to the peer machine is subtracted from the scheduled latency, since
/// the real network adds it back.
#[derive(Debug)]
pub struct RemoteShaper {
    core: Core,
    to: RouterId,
    from: RouterId,
    outbound: mpsc::Sender<RouterFrame>,
}

impl RemoteShaper {
    /// Creates a stopped shaper relaying frames from `from` to the remote router `to`.
    pub fn new(
        props: LinkProps,
        incoming: mpsc::Receiver<Frame>,
        to: RouterId,
        from: RouterId,
        outbound: mpsc::Sender<RouterFrame>,
        delay: Delay,
        options: &ShaperOptions,
    ) -> Self {
        Self { core: Core::new(props, incoming, delay, options), to, from, outbound }
    }

    /// The remote router frames are addressed to.
    pub fn to(&self) -> &RouterId {
        &self.to
    }

    /// The local router frames are sent from.
    pub fn from(&self) -> &RouterId {
        &self.from
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
        let egress = Egress::Remote {
            to: self.to.clone(),
            from: self.from.clone(),
            outbound: self.outbound.clone(),
        };
        self.core.start(ShaperKind::Remote, Mode::Forward, None, egress)
    }

    /// Stops both loops, keeping the queue.
    pub async fn stop(&mut self) -> Result<(), Error> {
        self.core.stop().await.map(|_| ())
    }

    pub(super) fn into_incoming(self) -> Option<mpsc::Receiver<Frame>> {
        self.core.into_incoming()
    }
}
