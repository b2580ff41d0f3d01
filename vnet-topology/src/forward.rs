//! Frame forwarding inside bridges and routers.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, Instrument};
use vnet_common::{EntityId, RouterId};
use vnet_link::{Link, NullShaper};
use vnet_wire::{Frame, MacAddr};

/// Maps destination MAC addresses to the channel leading towards them.
pub(crate) type Table = Arc<RwLock<FxHashMap<MacAddr, mpsc::Sender<Frame>>>>;

/// A path from a router to a destination, as computed by a [`PathOracle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    /// Routers along the path, starting at the source router.
    pub hops: Vec<RouterId>,
    /// Sum of link weights along the path.
    pub cost: u32,
}

/// Computes paths for destinations a router has not learned a route to.
#[async_trait]
pub trait PathOracle: Send + Sync + 'static {
    async fn find_path(&self, from: &RouterId, dst: MacAddr) -> Option<Path>;
}

/// Counters of a bridge or router.
#[derive(Debug, Default)]
pub struct PortStats {
    /// Frames handed to the next link.
    forwarded: AtomicUsize,
    /// Frames without a destination, or whose next link was full.
    discarded: AtomicUsize,
    /// Frames forwarded using a path from the oracle.
    resolved: AtomicUsize,
}

impl PortStats {
    #[inline]
    fn increment_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn increment_discarded(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn increment_resolved(&self) {
        self.resolved.fetch_add(1, Ordering::Relaxed);
    }

    /// Frames handed to the next link.
    #[inline]
    pub fn forwarded(&self) -> usize {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Frames without a destination, or whose next link was full.
    #[inline]
    pub fn discarded(&self) -> usize {
        self.discarded.load(Ordering::Relaxed)
    }

    /// Frames forwarded using a path from the oracle.
    #[inline]
    pub fn resolved(&self) -> usize {
        self.resolved.load(Ordering::Relaxed)
    }
}

fn forward(tx: &mpsc::Sender<Frame>, frame: Frame, stats: &PortStats) {
    if tx.try_send(frame).is_ok() {
        stats.increment_forwarded();
    } else {
        debug!("next link full, dropping frame");
        stats.increment_discarded();
    }
}

/// The frame producer and consumer attached to a local node.
#[derive(Debug)]
pub struct NodeEndpoint {
    /// Frames sent by the node.
    pub tx: mpsc::Sender<Frame>,
    /// Frames delivered to the node.
    pub rx: mpsc::Receiver<Frame>,
}

/// Channels of a local node.
#[derive(Debug)]
pub(crate) struct NodePort {
    /// Where the bridge delivers frames for this node.
    pub(crate) inbox: mpsc::Sender<Frame>,
    /// Drains the node's frames while it has no bridge. `None` while bridged, in which case the
    /// uplink channel belongs to the bridge link.
    pub(crate) uplink: Option<Link>,
    pub(crate) endpoint: Option<NodeEndpoint>,
}

impl NodePort {
    pub(crate) fn new(id: &str, queue_size: usize) -> Result<Self, vnet_link::Error> {
        let (tx, uplink_rx) = mpsc::channel(queue_size);
        let (inbox, rx) = mpsc::channel(queue_size);

        let mut uplink = Link::new(format!("{id}-null"), NullShaper::new(uplink_rx));
        uplink.start()?;

        Ok(Self { inbox, uplink: Some(uplink), endpoint: Some(NodeEndpoint { tx, rx }) })
    }

    /// Puts a running null link back on the node's uplink channel.
    pub(crate) fn detach(
        &mut self,
        id: &str,
        uplink_rx: mpsc::Receiver<Frame>,
    ) -> Result<(), vnet_link::Error> {
        let mut uplink = Link::new(format!("{id}-null"), NullShaper::new(uplink_rx));
        uplink.start()?;
        self.uplink = Some(uplink);
        Ok(())
    }
}

/// Forwarding state of a local bridge.
#[derive(Debug)]
pub(crate) struct BridgePort {
    /// Every frame entering the bridge, from nodes or from the router.
    pub(crate) ingress: mpsc::Sender<Frame>,
    /// Links towards the bridge's nodes, by node MAC.
    pub(crate) ports: Table,
    /// Link towards the router. Frames from nodes to unknown destinations go there, or are
    /// discarded without a router.
    pub(crate) gateway: Arc<RwLock<Option<mpsc::Sender<Frame>>>>,
    pub(crate) stats: Arc<PortStats>,
    cancel: CancellationToken,
}

impl BridgePort {
    pub(crate) fn spawn(id: &str, queue_size: usize) -> Self {
        let (ingress, rx) = mpsc::channel(queue_size);
        let port = Self {
            ingress,
            ports: Table::default(),
            gateway: Arc::default(),
            stats: Arc::default(),
            cancel: CancellationToken::new(),
        };

        let span = tracing::debug_span!(parent: None, "bridge", %id);
        tokio::spawn(
            bridge_loop(
                rx,
                Arc::clone(&port.ports),
                Arc::clone(&port.gateway),
                Arc::clone(&port.stats),
                port.cancel.clone(),
            )
            .instrument(span),
        );

        port
    }
}

impl Drop for BridgePort {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn bridge_loop(
    mut rx: mpsc::Receiver<Frame>,
    ports: Table,
    gateway: Arc<RwLock<Option<mpsc::Sender<Frame>>>>,
    stats: Arc<PortStats>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let dst = frame.dst();
        if dst == MacAddr::BROADCAST {
            let targets: Vec<_> = ports
                .read()
                .iter()
                .filter(|(mac, _)| **mac != frame.src())
                .map(|(_, tx)| tx.clone())
                .collect();
            for tx in targets {
                forward(&tx, frame.clone(), &stats);
            }
            continue;
        }

        let (tx, from_node) = {
            let ports = ports.read();
            (ports.get(&dst).cloned(), ports.contains_key(&frame.src()))
        };

        match tx {
            Some(tx) => forward(&tx, frame, &stats),
            // Only frames from our own nodes leave through the gateway, anything else would bounce
            // back to the router.
            None if from_node => match gateway.read().clone() {
                Some(tx) => forward(&tx, frame, &stats),
                None => {
                    trace!(%dst, "no router, discarding frame");
                    stats.increment_discarded();
                }
            },
            None => {
                trace!(%dst, "unknown destination, discarding frame");
                stats.increment_discarded();
            }
        }
    }

    debug!("bridge stopped");
}

/// Forwarding state of a local router.
#[derive(Debug)]
pub(crate) struct RouterPort {
    /// Every frame entering the router, from bridges, local routers or the relay.
    pub(crate) ingress: mpsc::Sender<Frame>,
    /// Next link by destination MAC. Kept in line with the router's weights.
    pub(crate) table: Table,
    /// Links towards neighbor routers.
    pub(crate) neighbors: Arc<RwLock<FxHashMap<RouterId, mpsc::Sender<Frame>>>>,
    /// Links towards connected bridges.
    pub(crate) bridges: FxHashMap<EntityId, mpsc::Sender<Frame>>,
    pub(crate) stats: Arc<PortStats>,
    cancel: CancellationToken,
}

impl RouterPort {
    pub(crate) fn spawn(
        id: &RouterId,
        queue_size: usize,
        oracle: Option<(Arc<dyn PathOracle>, Duration)>,
    ) -> Self {
        let (ingress, rx) = mpsc::channel(queue_size);
        let port = Self {
            ingress,
            table: Table::default(),
            neighbors: Arc::default(),
            bridges: FxHashMap::default(),
            stats: Arc::default(),
            cancel: CancellationToken::new(),
        };

        let router = RouterLoop {
            id: id.clone(),
            table: Arc::clone(&port.table),
            neighbors: Arc::clone(&port.neighbors),
            oracle,
            stats: Arc::clone(&port.stats),
        };
        let span = tracing::debug_span!(parent: None, "router", %id);
        tokio::spawn(router.run(rx, port.cancel.clone()).instrument(span));

        port
    }

    /// Points `mac` at the link towards `neighbor`. Returns `false` if there is no such link.
    pub(crate) fn route_via_neighbor(&self, mac: MacAddr, neighbor: &RouterId) -> bool {
        let Some(tx) = self.neighbors.read().get(neighbor).cloned() else {
            return false;
        };
        self.table.write().insert(mac, tx);
        true
    }

    pub(crate) fn route_via_bridge(&self, mac: MacAddr, bridge: &EntityId) -> bool {
        let Some(tx) = self.bridges.get(bridge).cloned() else {
            return false;
        };
        self.table.write().insert(mac, tx);
        true
    }

    pub(crate) fn unroute(&self, mac: &MacAddr) {
        self.table.write().remove(mac);
    }
}

impl Drop for RouterPort {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct RouterLoop {
    id: RouterId,
    table: Table,
    neighbors: Arc<RwLock<FxHashMap<RouterId, mpsc::Sender<Frame>>>>,
    /// The oracle and how long to wait for it.
    oracle: Option<(Arc<dyn PathOracle>, Duration)>,
    stats: Arc<PortStats>,
}

impl RouterLoop {
    async fn run(self, mut rx: mpsc::Receiver<Frame>, cancel: CancellationToken) {
        loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            let tx = self.table.read().get(&frame.dst()).cloned();
            match tx {
                Some(tx) => forward(&tx, frame, &self.stats),
                None => self.resolve(frame).await,
            }
        }

        debug!("router stopped");
    }

    /// Forwards a frame for an unknown destination to the next hop suggested by the oracle, if
    /// that hop is a neighbor. Gives up on oracles slower than the configured timeout.
    async fn resolve(&self, frame: Frame) {
        let dst = frame.dst();
        let Some((oracle, timeout)) = &self.oracle else {
            trace!(%dst, "no route, discarding frame");
            self.stats.increment_discarded();
            return;
        };

        let path = match tokio::time::timeout(*timeout, oracle.find_path(&self.id, dst)).await {
            Ok(path) => path,
            Err(_) => {
                debug!(%dst, ?timeout, "path lookup timed out, discarding frame");
                self.stats.increment_discarded();
                return;
            }
        };

        let next = path
            .and_then(|path| path.hops.into_iter().find(|hop| *hop != self.id))
            .and_then(|hop| self.neighbors.read().get(&hop).cloned());

        match next {
            Some(tx) => {
                self.stats.increment_resolved();
                forward(&tx, frame, &self.stats);
            }
            None => {
                debug!(%dst, "no path to destination, discarding frame");
                self.stats.increment_discarded();
            }
        }
    }
}
