use std::sync::Arc;

use tokio::sync::mpsc;
use vnet_transport::RedirectionSocket;
use vnet_wire::Frame;

use super::{check_socket, Core, Egress, Mode, ShaperKind};
use crate::{Error, InterceptShaper, LinkProps, LinkStats, NetworkShaper};

/// A [`NetworkShaper`] that also copies every frame surviving the drop check to a redirection
/// socket. Whatever the socket client sends back is discarded.
#[derive(Debug)]
pub struct SniffShaper {
    pub(super) core: Core,
    pub(super) outgoing: mpsc::Sender<Frame>,
    pub(super) socket: RedirectionSocket,
}

impl SniffShaper {
    /// The properties this shaper applies.
    pub fn props(&self) -> &LinkProps {
        self.core.props()
    }

    /// Counters shared with the link.
    pub fn stats(&self) -> &Arc<LinkStats> {
        self.core.stats()
    }

    /// The socket copies are written to.
    pub fn socket(&self) -> &RedirectionSocket {
        &self.socket
    }

    /// Returns `true` if the shaper loops are running.
    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    /// Starts forwarding and mirroring.
    pub fn start(&mut self) -> Result<(), Error> {
        let tap = self.socket.take_receiver();
        self.core.start(
            ShaperKind::Sniff,
            Mode::Mirror(self.socket.sender()),
            tap,
            Egress::Local(self.outgoing.clone()),
        )
    }

    /// Stops both loops. The socket stays bound.
    pub async fn stop(&mut self) -> Result<(), Error> {
        if let Some(tap) = self.core.stop().await? {
            self.socket.restore_receiver(tap);
        }
        Ok(())
    }

    /// Stops this shaper and unbinds its socket.
    pub async fn into_network(mut self) -> Result<NetworkShaper, (Self, Error)> {
        if let Err(e) = self.stop().await {
            return Err((self, e));
        }
        self.socket.stop();
        Ok(NetworkShaper { core: self.core, outgoing: self.outgoing })
    }

    /// Stops this shaper, unbinds its socket and redirects through `socket` instead.
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
        self.socket.stop();
        Ok(InterceptShaper { core: self.core, outgoing: self.outgoing, socket })
    }

    /// Swaps the socket for `socket`, unbinding the current one.
    pub(super) async fn rebind(mut self, socket: RedirectionSocket) -> Result<Self, (Self, Error)> {
        if let Err(e) = check_socket(&socket) {
            return Err((self, e));
        }
        if let Err(e) = self.stop().await {
            return Err((self, e));
        }
        let mut previous = std::mem::replace(&mut self.socket, socket);
        previous.stop();
        Ok(self)
    }

    pub(super) fn into_incoming(mut self) -> Option<mpsc::Receiver<Frame>> {
        self.socket.stop();
        self.core.into_incoming()
    }
}
