use std::{mem, sync::Arc};

use tokio::sync::mpsc;
use tracing::debug;
use vnet_transport::RedirectionSocket;
use vnet_wire::Frame;

use crate::{Error, LinkProps, LinkStats, Shaper, ShaperKind};

/// Identifier of a directed link, e.g. `n1-b1`.
pub type LinkId = String;

/// One direction of a connection, wrapped around exactly one shaper.
#[derive(Debug)]
pub struct Link {
    id: LinkId,
    shaper: Shaper,
}

impl Link {
    /// Wraps `shaper` in a link named `id`. The shaper is not started.
    pub fn new(id: impl Into<LinkId>, shaper: impl Into<Shaper>) -> Self {
        Self { id: id.into(), shaper: shaper.into() }
    }

    /// The identifier of this direction.
    pub fn id(&self) -> &LinkId {
        &self.id
    }

    /// The kind of the current shaper.
    pub fn kind(&self) -> ShaperKind {
        self.shaper.kind()
    }

    /// The current shaper.
    pub fn shaper(&self) -> &Shaper {
        &self.shaper
    }

    /// Returns the counters of the current shaper. Conversions between network, sniff and
    /// intercept shapers keep the same counters.
    pub fn stats(&self) -> &Arc<LinkStats> {
        self.shaper.stats()
    }

    /// Returns `true` if the shaper loops are running.
    pub fn is_running(&self) -> bool {
        self.shaper.is_running()
    }

    /// Starts the shaper. Does nothing if already running.
    pub fn start(&mut self) -> Result<(), Error> {
        let _span = tracing::debug_span!("link", id = %self.id).entered();
        self.shaper.start()
    }

    /// Stops the shaper, keeping its channels and queued frames.
    pub async fn stop(&mut self) -> Result<(), Error> {
        self.shaper.stop().await
    }

    /// Replaces the shaper and returns the previous one. Fails if the current shaper is still
    /// running. The new shaper is not started.
    pub fn set_shaper(&mut self, shaper: impl Into<Shaper>) -> Result<Shaper, Error> {
        if self.is_running() {
            return Err(Error::ShaperRunning(self.kind()));
        }
        Ok(mem::replace(&mut self.shaper, shaper.into()))
    }

    /// Takes the shaper out for a conversion, leaving a detached null shaper in its place. The
    /// conversion always hands a shaper back, either the converted one or the original.
    fn take_shaper(&mut self) -> Shaper {
        mem::take(&mut self.shaper)
    }

    /// Starts mirroring this link's traffic to `socket`.
    pub async fn sniff(&mut self, socket: RedirectionSocket) -> Result<(), Error> {
        let was_running = self.is_running();
        match self.take_shaper().into_sniff(socket).await {
            Ok(shaper) => self.resume(shaper.into(), was_running),
            Err((shaper, e)) => self.abort(shaper, e),
        }
    }

    /// Starts redirecting this link's traffic through `socket`.
    pub async fn intercept(&mut self, socket: RedirectionSocket) -> Result<(), Error> {
        let was_running = self.is_running();
        match self.take_shaper().into_intercept(socket).await {
            Ok(shaper) => self.resume(shaper.into(), was_running),
            Err((shaper, e)) => self.abort(shaper, e),
        }
    }

    /// Goes back to plain forwarding, unbinding any redirection socket.
    pub async fn restore(&mut self) -> Result<(), Error> {
        let was_running = self.is_running();
        match self.take_shaper().into_network().await {
            Ok(shaper) => self.resume(shaper.into(), was_running),
            Err((shaper, e)) => self.abort(shaper, e),
        }
    }

    fn resume(&mut self, shaper: Shaper, start: bool) -> Result<(), Error> {
        debug!(id = %self.id, kind = %shaper.kind(), "shaper converted");
        self.shaper = shaper;
        if start {
            self.start()?;
        }
        Ok(())
    }

    fn abort(&mut self, shaper: Shaper, e: Error) -> Result<(), Error> {
        self.shaper = shaper;
        Err(e)
    }

    /// Stops the link, releases any redirection socket and returns the incoming channel.
    pub async fn close(self) -> Option<mpsc::Receiver<Frame>> {
        debug!(id = %self.id, "closing link");
        self.shaper.close().await
    }
}

/// The two directions of a connection between entities `a` and `b`. `left` carries frames from
/// `a` to `b`, `right` from `b` to `a`.
#[derive(Debug)]
pub struct BiLink {
    props: LinkProps,
    /// Carries frames from `a` to `b`.
    pub left: Link,
    /// Carries frames from `b` to `a`.
    pub right: Link,
}

impl BiLink {
    /// Pairs two directions sharing the same properties.
    pub fn new(props: LinkProps, left: Link, right: Link) -> Self {
        Self { props, left, right }
    }

    /// The properties of the whole connection.
    pub fn props(&self) -> &LinkProps {
        &self.props
    }

    /// Returns the direction whose id is `id`.
    pub fn direction_mut(&mut self, id: &str) -> Option<&mut Link> {
        if self.left.id() == id {
            Some(&mut self.left)
        } else if self.right.id() == id {
            Some(&mut self.right)
        } else {
            None
        }
    }

    /// Returns the direction whose id is `id`.
    pub fn direction(&self, id: &str) -> Option<&Link> {
        if self.left.id() == id {
            Some(&self.left)
        } else if self.right.id() == id {
            Some(&self.right)
        } else {
            None
        }
    }

    /// Starts both directions.
    pub fn start(&mut self) -> Result<(), Error> {
        self.left.start()?;
        self.right.start()
    }

    /// Stops both directions, even if the first one fails.
    pub async fn stop(&mut self) -> Result<(), Error> {
        let left = self.left.stop().await;
        let right = self.right.stop().await;
        left.and(right)
    }

    /// Closes both directions and returns their incoming channels, left first.
    pub async fn close(self) -> (Option<mpsc::Receiver<Frame>>, Option<mpsc::Receiver<Frame>>) {
        (self.left.close().await, self.right.close().await)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use futures::{SinkExt, StreamExt};
    use tokio::{net::UnixStream, time::Instant};
    use tokio_util::codec::Framed;
    use vnet_common::Delay;
    use vnet_wire::{frame, MacAddr, RouterFrame};

    use super::*;
    use crate::{NetworkShaper, NullShaper, RemoteShaper, ShaperOptions};

    fn frame(payload: &'static [u8]) -> Frame {
        Frame::new(MacAddr([1; 6]), MacAddr([2; 6]), Bytes::from_static(payload))
    }

    async fn eventually(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    fn network_link(
        props: LinkProps,
    ) -> (Link, mpsc::Sender<Frame>, mpsc::Receiver<Frame>) {
        let (in_tx, in_rx) = mpsc::channel(64);
        let (out_tx, out_rx) = mpsc::channel(64);
        let shaper = NetworkShaper::new(props, in_rx, out_tx, &ShaperOptions::default());
        (Link::new("a-b", shaper), in_tx, out_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn latency_delays_delivery() {
        let _ = tracing_subscriber::fmt::try_init();
        let props = LinkProps { latency: Duration::from_millis(10), ..Default::default() };
        let (mut link, tx, mut rx) = network_link(props);
        link.start().unwrap();

        let start = Instant::now();
        tx.send(frame(b"hello")).await.unwrap();
        let received = rx.recv().await.unwrap();

        assert_eq!(received.payload(), "hello");
        assert!(start.elapsed() >= Duration::from_millis(10));
        assert!(start.elapsed() < Duration::from_millis(11));
        assert_eq!(link.stats().frames_tx(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn jitter_never_delivers_early() {
        let props = LinkProps {
            latency: Duration::from_millis(10),
            jitter: Duration::from_millis(5),
            ..Default::default()
        };
        let (mut link, tx, mut rx) = network_link(props);
        link.start().unwrap();

        let start = Instant::now();
        for _ in 0..20 {
            tx.send(frame(b"j")).await.unwrap();
        }
        for _ in 0..20 {
            rx.recv().await.unwrap();
            assert!(start.elapsed() >= Duration::from_millis(10));
        }
        assert!(start.elapsed() <= Duration::from_millis(16));
    }

    #[tokio::test(start_paused = true)]
    async fn bandwidth_spaces_frames_after_burst() {
        // 15 kB/s gives a burst of 10 frames of 1500 bytes, then one frame every 100ms.
        let props = LinkProps { bandwidth: 15_000, ..Default::default() };
        let (mut link, tx, mut rx) = network_link(props);
        link.start().unwrap();

        let start = Instant::now();
        for _ in 0..20 {
            tx.send(frame(b"bw").with_size(1500)).await.unwrap();
        }

        for i in 0..20 {
            rx.recv().await.unwrap();
            if i < 10 {
                assert!(start.elapsed() < Duration::from_millis(1));
            }
        }
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert!(start.elapsed() < Duration::from_millis(1100));
        assert_eq!(link.stats().bytes_tx(), 20 * 1500);
    }

    #[tokio::test]
    async fn full_drop_rate_loses_everything() {
        let props = LinkProps { drop_rate: 1.0, ..Default::default() };
        let (mut link, tx, mut rx) = network_link(props);
        link.start().unwrap();

        for _ in 0..5 {
            tx.send(frame(b"lost")).await.unwrap();
        }

        eventually(|| link.stats().dropped_loss() == 5).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn restart_keeps_channels() {
        let (mut link, tx, mut rx) = network_link(LinkProps::default());
        link.start().unwrap();
        link.stop().await.unwrap();
        assert!(!link.is_running());

        tx.send(frame(b"while stopped")).await.unwrap();
        link.start().unwrap();
        assert_eq!(rx.recv().await.unwrap().payload(), "while stopped");
    }

    #[tokio::test]
    async fn sniff_then_restore_keeps_forwarding() {
        let _ = tracing_subscriber::fmt::try_init();
        let dir = tempfile::tempdir().unwrap();
        let (mut link, tx, mut rx) = network_link(LinkProps::default());
        link.start().unwrap();
        let stats = Arc::clone(link.stats());

        let path = RedirectionSocket::sniff_path(dir.path(), link.id());
        link.sniff(RedirectionSocket::bind(&path, 16).unwrap()).await.unwrap();
        assert_eq!(link.kind(), ShaperKind::Sniff);
        assert!(link.is_running());

        let stream = UnixStream::connect(&path).await.unwrap();
        let mut client = Framed::new(stream, frame::Codec::new());
        let Shaper::Sniff(sniff) = link.shaper() else { unreachable!() };
        eventually(|| sniff.socket().stats().is_connected()).await;

        tx.send(frame(b"seen")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().payload(), "seen");
        assert_eq!(client.next().await.unwrap().unwrap().payload(), "seen");

        // Frames from the sniffing client go nowhere.
        client.send(frame(b"ignored")).await.unwrap();
        eventually(|| stats.discarded() == 1).await;

        link.restore().await.unwrap();
        assert_eq!(link.kind(), ShaperKind::Network);
        assert!(!path.exists());

        tx.send(frame(b"after")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().payload(), "after");
        assert!(Arc::ptr_eq(&stats, link.stats()));
        assert_eq!(stats.mirrored(), 1);
        assert_eq!(stats.frames_tx(), 2);
    }

    #[tokio::test]
    async fn intercept_puts_client_in_the_path() {
        let _ = tracing_subscriber::fmt::try_init();
        let dir = tempfile::tempdir().unwrap();
        let (mut link, tx, mut rx) = network_link(LinkProps::default());
        link.start().unwrap();

        let path = RedirectionSocket::intercept_path(dir.path(), link.id());
        link.intercept(RedirectionSocket::bind(&path, 16).unwrap()).await.unwrap();

        let stream = UnixStream::connect(&path).await.unwrap();
        let mut client = Framed::new(stream, frame::Codec::new());
        let Shaper::Intercept(intercept) = link.shaper() else { unreachable!() };
        eventually(|| intercept.socket().stats().is_connected()).await;

        tx.send(frame(b"original")).await.unwrap();
        let intercepted = client.next().await.unwrap().unwrap();
        assert_eq!(intercepted.payload(), "original");
        assert!(rx.try_recv().is_err());

        let rewritten =
            Frame::new(intercepted.src(), intercepted.dst(), Bytes::from_static(b"rewritten"));
        client.send(rewritten).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().payload(), "rewritten");
        assert_eq!(link.stats().intercepted(), 1);
    }

    #[tokio::test]
    async fn set_shaper_requires_stopped_link() {
        let (mut link, tx, _rx) = network_link(LinkProps::default());
        link.start().unwrap();

        let (_null_tx, null_rx) = mpsc::channel(4);
        let err = link.set_shaper(NullShaper::new(null_rx)).unwrap_err();
        assert!(matches!(err, Error::ShaperRunning(ShaperKind::Network)));

        link.stop().await.unwrap();
        let (_null_tx, null_rx) = mpsc::channel(4);
        let old = link.set_shaper(NullShaper::new(null_rx)).unwrap();
        assert_eq!(old.kind(), ShaperKind::Network);
        assert_eq!(link.kind(), ShaperKind::Null);

        // The old shaper still owns its channels.
        let mut incoming = old.close().await.unwrap();
        tx.send(frame(b"back")).await.unwrap();
        assert_eq!(incoming.recv().await.unwrap().payload(), "back");
    }

    #[tokio::test]
    async fn remote_and_null_cannot_be_sniffed() {
        let dir = tempfile::tempdir().unwrap();
        let (_tx, rx) = mpsc::channel(4);
        let mut link = Link::new("n1-b1", NullShaper::new(rx));

        let socket = RedirectionSocket::bind(dir.path().join("n1-b1.sniff"), 4).unwrap();
        let err = link.sniff(socket).await.unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidConversion { from: ShaperKind::Null, to: ShaperKind::Sniff }
        ));
        assert_eq!(link.kind(), ShaperKind::Null);
        assert!(!dir.path().join("n1-b1.sniff").exists());
    }

    #[tokio::test]
    async fn failed_conversion_keeps_link_forwarding() {
        let dir = tempfile::tempdir().unwrap();
        let (mut link, tx, mut rx) = network_link(LinkProps::default());
        link.start().unwrap();

        let mut stopped = RedirectionSocket::bind(dir.path().join("stale.sniff"), 4).unwrap();
        stopped.stop();
        let err = link.sniff(stopped).await.unwrap_err();
        assert!(matches!(err, Error::SocketStopped(_)));
        assert_eq!(link.kind(), ShaperKind::Network);
        assert!(link.is_running());

        tx.send(frame(b"still here")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().payload(), "still here");

        // A sniffing link refuses a stopped intercepting socket and keeps sniffing.
        let path = RedirectionSocket::sniff_path(dir.path(), link.id());
        link.sniff(RedirectionSocket::bind(&path, 4).unwrap()).await.unwrap();
        let mut stopped = RedirectionSocket::bind(dir.path().join("stale.intercept"), 4).unwrap();
        stopped.stop();
        let err = link.intercept(stopped).await.unwrap_err();
        assert!(matches!(err, Error::SocketStopped(_)));
        assert_eq!(link.kind(), ShaperKind::Sniff);
        assert!(link.is_running());
        assert!(path.exists());

        tx.send(frame(b"sniffed")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().payload(), "sniffed");
        eventually(|| link.stats().mirrored() == 1).await;
    }

    #[tokio::test(start_paused = true)]
    async fn conversions_keep_latency_and_bandwidth() {
        let _ = tracing_subscriber::fmt::try_init();
        let dir = tempfile::tempdir().unwrap();
        // 15 kB/s with a burst of 10 frames of 1500 bytes, refilling 750 bytes every 50ms.
        let props = LinkProps {
            latency: Duration::from_millis(50),
            bandwidth: 15_000,
            ..Default::default()
        };
        let (mut link, tx, mut rx) = network_link(props);
        link.start().unwrap();

        let start = Instant::now();
        tx.send(frame(b"network").with_size(1500)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().payload(), "network");
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(start.elapsed() < Duration::from_millis(52));

        let path = RedirectionSocket::sniff_path(dir.path(), link.id());
        link.sniff(RedirectionSocket::bind(&path, 16).unwrap()).await.unwrap();

        // The bucket holds 14250 bytes, so the tenth frame waits 50ms on top of the latency.
        let sniffing = Instant::now();
        for _ in 0..10 {
            tx.send(frame(b"sniff").with_size(1500)).await.unwrap();
        }
        for i in 0..10 {
            assert_eq!(rx.recv().await.unwrap().payload(), "sniff");
            assert!(sniffing.elapsed() >= Duration::from_millis(50));
            if i < 9 {
                assert!(sniffing.elapsed() < Duration::from_millis(52));
            }
        }
        assert!(sniffing.elapsed() >= Duration::from_millis(98));
        assert!(sniffing.elapsed() < Duration::from_millis(102));

        link.restore().await.unwrap();
        assert!(!path.exists());

        // Still 750 bytes in debt after refilling, so the same bucket delays this one too.
        let restored = Instant::now();
        tx.send(frame(b"restored").with_size(1500)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().payload(), "restored");
        assert!(restored.elapsed() >= Duration::from_millis(98));
        assert!(restored.elapsed() < Duration::from_millis(102));

        assert_eq!(link.stats().frames_tx(), 12);
        assert_eq!(link.stats().mirrored(), 10);
    }

    #[tokio::test]
    async fn frames_sent_during_conversions_all_arrive() {
        let dir = tempfile::tempdir().unwrap();
        let (in_tx, in_rx) = mpsc::channel(256);
        let (out_tx, mut out_rx) = mpsc::channel(256);
        let options = ShaperOptions::default();
        let shaper = NetworkShaper::new(LinkProps::default(), in_rx, out_tx, &options);
        let mut link = Link::new("a-b", shaper);
        link.start().unwrap();

        let sender = tokio::spawn(async move {
            for i in 0..200u32 {
                let payload = Bytes::from(i.to_string());
                in_tx.send(Frame::new(MacAddr([1; 6]), MacAddr([2; 6]), payload)).await.unwrap();
                if i % 10 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        });

        for round in 0..5 {
            let path = dir.path().join(format!("a-b-{round}.sniff"));
            link.sniff(RedirectionSocket::bind(&path, 256).unwrap()).await.unwrap();
            tokio::task::yield_now().await;
            link.restore().await.unwrap();
            tokio::task::yield_now().await;
        }
        sender.await.unwrap();

        for i in 0..200u32 {
            let frame = out_rx.recv().await.unwrap();
            assert_eq!(frame.payload(), i.to_string().as_str());
        }
        assert_eq!(link.stats().frames_tx(), 200);
        assert_eq!(link.stats().dropped_queue_full(), 0);
        assert_eq!(link.kind(), ShaperKind::Network);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_subtracts_peer_delay() {
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel::<RouterFrame>(4);
        let props = LinkProps { latency: Duration::from_millis(20), ..Default::default() };
        let shaper = RemoteShaper::new(
            props,
            in_rx,
            "r2".to_string(),
            "r1".to_string(),
            out_tx,
            Delay::new(Duration::from_millis(5)),
            &ShaperOptions::default(),
        );
        let mut link = Link::new("r1-r2", shaper);
        link.start().unwrap();

        let start = Instant::now();
        in_tx.send(frame(b"far")).await.unwrap();
        let msg = out_rx.recv().await.unwrap();

        assert_eq!(msg.to, "r2");
        assert_eq!(msg.from, "r1");
        assert_eq!(msg.frame.payload(), "far");
        assert!(start.elapsed() >= Duration::from_millis(15));
        assert!(start.elapsed() < Duration::from_millis(16));
    }

    #[tokio::test]
    async fn null_drains_and_close_returns_incoming() {
        let (tx, rx) = mpsc::channel(4);
        let mut link = Link::new("n1-b1", NullShaper::new(rx));
        link.start().unwrap();

        for _ in 0..10 {
            tx.send(frame(b"void")).await.unwrap();
        }
        eventually(|| link.stats().discarded() == 10).await;

        let mut rx = link.close().await.unwrap();
        tx.send(frame(b"kept")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().payload(), "kept");
    }

    #[tokio::test]
    async fn bilink_directions_are_independent() {
        let (mut left, left_tx, mut left_rx) = network_link(LinkProps::default());
        left.id = "a-b".to_string();
        let (mut right, right_tx, mut right_rx) = network_link(LinkProps::default());
        right.id = "b-a".to_string();

        let mut bilink = BiLink::new(LinkProps::default(), left, right);
        bilink.start().unwrap();
        assert!(bilink.direction("b-a").unwrap().is_running());
        assert!(bilink.direction("c-d").is_none());

        left_tx.send(frame(b"ab")).await.unwrap();
        right_tx.send(frame(b"ba")).await.unwrap();
        assert_eq!(left_rx.recv().await.unwrap().payload(), "ab");
        assert_eq!(right_rx.recv().await.unwrap().payload(), "ba");

        let (l, r) = bilink.close().await;
        assert!(l.is_some() && r.is_some());
    }
}
