//! Per-direction traffic shaping.
//!
//! A shaper owns the receiving end of a link's incoming channel and runs two tasks: a receive
//! loop that schedules or drops frames and puts them on an internal queue, and a send loop that
//! applies the bandwidth limit and delivers each frame once its scheduled time is reached.
//!
//! [`NetworkShaper`], [`SniffShaper`] and [`InterceptShaper`] can be converted into each other.
//! Conversions stop the source shaper first, then move its channels, queue, bucket and counters
//! into the new variant, so frames already queued are not lost.

use std::{fmt, sync::Arc};

use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument};
use vnet_common::Delay;
use vnet_transport::RedirectionSocket;
use vnet_wire::Frame;

use crate::{bucket::TokenBucket, Error, LinkProps, LinkStats, ShaperOptions};

mod intercept;
mod network;
mod null;
mod pipeline;
mod remote;
mod sniff;

pub use intercept::InterceptShaper;
pub use network::NetworkShaper;
pub use null::NullShaper;
pub use remote::RemoteShaper;
pub use sniff::SniffShaper;

use pipeline::{Admission, Egress, Mode, ReceiveParts};

/// Tag of a [`Shaper`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaperKind {
    /// See [`NetworkShaper`].
    Network,
    /// See [`SniffShaper`].
    Sniff,
    /// See [`InterceptShaper`].
    Intercept,
    /// See [`RemoteShaper`].
    Remote,
    /// See [`NullShaper`].
    Null,
}

impl fmt::Display for ShaperKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Network => "network",
            Self::Sniff => "sniff",
            Self::Intercept => "intercept",
            Self::Remote => "remote",
            Self::Null => "null",
        };
        f.write_str(name)
    }
}

/// Handles of a running shaper.
#[derive(Debug)]
struct Running {
    cancel: CancellationToken,
    receive: JoinHandle<ReceiveParts>,
    send: JoinHandle<mpsc::Receiver<Frame>>,
}

/// State shared by every forwarding shaper variant. Moved as a whole on conversion.
#[derive(Debug)]
pub(crate) struct Core {
    props: LinkProps,
    /// Lent to the receive loop while running.
    incoming: Option<mpsc::Receiver<Frame>>,
    queue_tx: mpsc::Sender<Frame>,
    /// Lent to the send loop while running.
    queue_rx: Option<mpsc::Receiver<Frame>>,
    bucket: Arc<Mutex<Option<TokenBucket>>>,
    delay: Delay,
    stats: Arc<LinkStats>,
    running: Option<Running>,
}

impl Core {
    pub(crate) fn new(
        props: LinkProps,
        incoming: mpsc::Receiver<Frame>,
        delay: Delay,
        options: &ShaperOptions,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(options.queue_size);
        let bucket =
            TokenBucket::new(props.bandwidth, props.effective_burst_bytes(), Instant::now());

        Self {
            props,
            incoming: Some(incoming),
            queue_tx,
            queue_rx: Some(queue_rx),
            bucket: Arc::new(Mutex::new(bucket)),
            delay,
            stats: Arc::new(LinkStats::default()),
            running: None,
        }
    }

    pub(crate) fn props(&self) -> &LinkProps {
        &self.props
    }

    pub(crate) fn stats(&self) -> &Arc<LinkStats> {
        &self.stats
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Spawns the receive and send loops. Does nothing if already running.
    pub(crate) fn start(
        &mut self,
        kind: ShaperKind,
        mode: Mode,
        tap: Option<mpsc::Receiver<Frame>>,
        egress: Egress,
    ) -> Result<(), Error> {
        if self.running.is_some() {
            debug!(%kind, "shaper already running");
            return Ok(());
        }

        let (Some(incoming), Some(queue_rx)) = (self.incoming.take(), self.queue_rx.take()) else {
            return Err(Error::Detached);
        };

        let cancel = CancellationToken::new();
        let span = tracing::debug_span!("shaper", %kind);

        let admission = Admission {
            props: self.props,
            delay: self.delay.clone(),
            stats: Arc::clone(&self.stats),
        };
        let receive = tokio::spawn(
            pipeline::receive_loop(
                incoming,
                tap,
                mode,
                admission,
                self.queue_tx.clone(),
                cancel.clone(),
            )
            .instrument(span.clone()),
        );
        let send = tokio::spawn(
            pipeline::send_loop(
                queue_rx,
                Arc::clone(&self.bucket),
                egress,
                Arc::clone(&self.stats),
                cancel.clone(),
            )
            .instrument(span),
        );

        self.running = Some(Running { cancel, receive, send });
        Ok(())
    }

    /// Stops both loops and takes back the channels they were using. Returns the socket tap, if
    /// the receive loop had one. Does nothing if not running.
    pub(crate) async fn stop(&mut self) -> Result<Option<mpsc::Receiver<Frame>>, Error> {
        let Some(running) = self.running.take() else {
            return Ok(None);
        };

        running.cancel.cancel();
        let send = running.send.await.map(|queue_rx| self.queue_rx = Some(queue_rx));
        let parts = running.receive.await?;
        self.incoming = Some(parts.incoming);
        send?;
        Ok(parts.tap)
    }

    /// Releases the incoming channel. Must only be called once stopped.
    pub(crate) fn into_incoming(mut self) -> Option<mpsc::Receiver<Frame>> {
        self.incoming.take()
    }
}

/// Rejects sockets that were stopped before being handed to a shaper.
fn check_socket(socket: &RedirectionSocket) -> Result<(), Error> {
    if socket.is_stopped() {
        return Err(Error::SocketStopped(socket.path().to_path_buf()));
    }
    Ok(())
}

impl Drop for Core {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.cancel.cancel();
        }
    }
}

/// The shaper of one link direction.
#[derive(Debug)]
pub enum Shaper {
    /// Shapes between two local channels.
    Network(NetworkShaper),
    /// Shapes and mirrors to a socket.
    Sniff(SniffShaper),
    /// Shapes what a socket client sends back.
    Intercept(InterceptShaper),
    /// Shapes towards a router on another machine.
    Remote(RemoteShaper),
    /// Discards everything.
    Null(NullShaper),
}

impl Default for Shaper {
    fn default() -> Self {
        Self::Null(NullShaper::detached())
    }
}

impl Shaper {
    /// Returns the tag of this variant.
    pub fn kind(&self) -> ShaperKind {
        match self {
            Self::Network(_) => ShaperKind::Network,
            Self::Sniff(_) => ShaperKind::Sniff,
            Self::Intercept(_) => ShaperKind::Intercept,
            Self::Remote(_) => ShaperKind::Remote,
            Self::Null(_) => ShaperKind::Null,
        }
    }

    /// Returns the counters of this shaper.
    pub fn stats(&self) -> &Arc<LinkStats> {
        match self {
            Self::Network(s) => s.stats(),
            Self::Sniff(s) => s.stats(),
            Self::Intercept(s) => s.stats(),
            Self::Remote(s) => s.stats(),
            Self::Null(s) => s.stats(),
        }
    }

    /// Returns `true` if the shaper loops are running.
    pub fn is_running(&self) -> bool {
        match self {
            Self::Network(s) => s.is_running(),
            Self::Sniff(s) => s.is_running(),
            Self::Intercept(s) => s.is_running(),
            Self::Remote(s) => s.is_running(),
            Self::Null(s) => s.is_running(),
        }
    }

    /// Starts the shaper. Does nothing if already running.
    pub fn start(&mut self) -> Result<(), Error> {
        match self {
            Self::Network(s) => s.start(),
            Self::Sniff(s) => s.start(),
            Self::Intercept(s) => s.start(),
            Self::Remote(s) => s.start(),
            Self::Null(s) => s.start(),
        }
    }

    /// Stops the shaper, keeping its channels and queued frames.
    pub async fn stop(&mut self) -> Result<(), Error> {
        match self {
            Self::Network(s) => s.stop().await,
            Self::Sniff(s) => s.stop().await,
            Self::Intercept(s) => s.stop().await,
            Self::Remote(s) => s.stop().await,
            Self::Null(s) => s.stop().await,
        }
    }

    /// Converts into a [`NetworkShaper`], releasing any redirection socket.
    ///
    /// On failure the shaper is handed back along with the error. [`ShaperKind::Remote`] and
    /// [`ShaperKind::Null`] cannot be converted and come back untouched.
    pub async fn into_network(self) -> Result<NetworkShaper, (Self, Error)> {
        let from = self.kind();
        match self {
            Self::Network(mut s) => match s.stop().await {
                Ok(()) => Ok(s),
                Err(e) => Err((Self::Network(s), e)),
            },
            Self::Sniff(s) => s.into_network().await.map_err(|(s, e)| (Self::Sniff(s), e)),
            Self::Intercept(s) => s.into_network().await.map_err(|(s, e)| (Self::Intercept(s), e)),
            other => Err((other, Error::InvalidConversion { from, to: ShaperKind::Network })),
        }
    }

    /// Converts into a [`SniffShaper`] mirroring to `socket`. When the conversion is not possible
    /// the socket is dropped, which unbinds it, and the shaper is handed back.
    pub async fn into_sniff(self, socket: RedirectionSocket) -> Result<SniffShaper, (Self, Error)> {
        let from = self.kind();
        match self {
            Self::Network(s) => s.into_sniff(socket).await.map_err(|(s, e)| (Self::Network(s), e)),
            Self::Sniff(s) => s.rebind(socket).await.map_err(|(s, e)| (Self::Sniff(s), e)),
            Self::Intercept(s) => {
                s.into_sniff(socket).await.map_err(|(s, e)| (Self::Intercept(s), e))
            }
            other => Err((other, Error::InvalidConversion { from, to: ShaperKind::Sniff })),
        }
    }

    /// Converts into an [`InterceptShaper`] redirecting through `socket`. When the conversion is
    /// not possible the socket is dropped, which unbinds it, and the shaper is handed back.
    pub async fn into_intercept(
        self,
        socket: RedirectionSocket,
    ) -> Result<InterceptShaper, (Self, Error)> {
        let from = self.kind();
        match self {
            Self::Network(s) => {
                s.into_intercept(socket).await.map_err(|(s, e)| (Self::Network(s), e))
            }
            Self::Sniff(s) => s.into_intercept(socket).await.map_err(|(s, e)| (Self::Sniff(s), e)),
            Self::Intercept(s) => s.rebind(socket).await.map_err(|(s, e)| (Self::Intercept(s), e)),
            other => Err((other, Error::InvalidConversion { from, to: ShaperKind::Intercept })),
        }
    }

    /// Stops the shaper, releases any redirection socket and returns the incoming channel.
    pub async fn close(mut self) -> Option<mpsc::Receiver<Frame>> {
        if let Err(e) = self.stop().await {
            debug!(?e, "shaper task failed while closing");
        }

        match self {
            Self::Network(s) => s.into_incoming(),
            Self::Sniff(s) => s.into_incoming(),
            Self::Intercept(s) => s.into_incoming(),
            Self::Remote(s) => s.into_incoming(),
            Self::Null(s) => s.into_incoming(),
        }
    }
}

impl From<NetworkShaper> for Shaper {
    fn from(s: NetworkShaper) -> Self {
        Self::Network(s)
    }
}

impl From<SniffShaper> for Shaper {
    fn from(s: SniffShaper) -> Self {
        Self::Sniff(s)
    }
}

impl From<InterceptShaper> for Shaper {
    fn from(s: InterceptShaper) -> Self {
        Self::Intercept(s)
    }
}

impl From<RemoteShaper> for Shaper {
    fn from(s: RemoteShaper) -> Self {
        Self::Remote(s)
    }
}

impl From<NullShaper> for Shaper {
    fn from(s: NullShaper) -> Self {
        Self::Null(s)
    }
}
