use std::{
    collections::VecDeque,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use vnet_common::{EntityId, MachineId, RouterId};
use vnet_link::{LinkProps, LinkStats};
use vnet_topology::{
    NodeEndpoint, PathOracle, PortStats, RemoteTrade, Topology, TopologyOptions, Weights,
};
use vnet_transport::{IcmError, IcmOptions, IcmStats, InterCommunicationManager};
use vnet_wire::MacAddr;

use crate::RouteExchange;

/// Errors raised by [`Engine`] operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Topology(#[from] vnet_topology::Error),
    #[error("Relay error: {0}")]
    Icm(#[from] IcmError),
}

/// Options of an [`Engine`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub(crate) machine_id: MachineId,
    /// Address the relay listens on for peer machines.
    pub(crate) listen_addr: SocketAddr,
    pub(crate) topology: TopologyOptions,
    pub(crate) icm: IcmOptions,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            machine_id: "local".to_string(),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            topology: TopologyOptions::default(),
            icm: IcmOptions::default(),
        }
    }
}

impl EngineOptions {
    /// Options for the machine `machine_id`, listening on an ephemeral local port.
    pub fn new(machine_id: impl Into<MachineId>) -> Self {
        Self { machine_id: machine_id.into(), ..Default::default() }
    }

    /// Sets the address the relay listens on.
    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    /// Sets the topology options. Their machine id is replaced by the engine's.
    pub fn topology(mut self, options: TopologyOptions) -> Self {
        self.topology = options;
        self
    }

    /// Sets the relay queue sizes.
    pub fn icm(mut self, options: IcmOptions) -> Self {
        self.icm = options;
        self
    }
}

/// The emulation engine of one machine.
///
/// Owns the machine's [`Topology`] and relay, and runs route propagation whenever routers get
/// connected. Every operation is serialized on the topology.
pub struct Engine {
    machine_id: MachineId,
    topology: Mutex<Topology>,
    icm: InterCommunicationManager,
    exchange: Arc<dyn RouteExchange>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("machine_id", &self.machine_id)
            .field("local_addr", &self.icm.local_addr())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Binds the relay and creates an empty topology.
    pub async fn new(
        options: EngineOptions,
        exchange: Arc<dyn RouteExchange>,
    ) -> Result<Arc<Self>, EngineError> {
        Self::build(options, exchange, None).await
    }

    /// Like [`Engine::new`], with routers consulting `oracle` for destinations they have no
    /// route to.
    pub async fn with_oracle(
        options: EngineOptions,
        exchange: Arc<dyn RouteExchange>,
        oracle: Arc<dyn PathOracle>,
    ) -> Result<Arc<Self>, EngineError> {
        Self::build(options, exchange, Some(oracle)).await
    }

    async fn build(
        options: EngineOptions,
        exchange: Arc<dyn RouteExchange>,
        oracle: Option<Arc<dyn PathOracle>>,
    ) -> Result<Arc<Self>, EngineError> {
        let icm = InterCommunicationManager::bind(options.listen_addr, options.icm).await?;

        let topology_options = options.topology.machine_id(options.machine_id.clone());
        let mut topology = Topology::new(topology_options).with_relay(icm.clone());
        if let Some(oracle) = oracle {
            topology = topology.with_oracle(oracle);
        }

        info!(machine = %options.machine_id, addr = %icm.local_addr(), "engine started");
        Ok(Arc::new(Self {
            machine_id: options.machine_id,
            topology: Mutex::new(topology),
            icm,
            exchange,
        }))
    }

    /// The machine this engine runs.
    pub fn machine_id(&self) -> &MachineId {
        &self.machine_id
    }

    /// The address peer machines reach this engine's relay on.
    pub fn local_addr(&self) -> SocketAddr {
        self.icm.local_addr()
    }

    /// Counters of the relay.
    pub fn icm_stats(&self) -> &IcmStats {
        self.icm.stats()
    }

    /// Locks the topology, e.g. to inspect entities.
    pub async fn topology(&self) -> MutexGuard<'_, Topology> {
        self.topology.lock().await
    }

    /// Records the relay address of a peer machine.
    pub async fn add_machine(&self, id: impl Into<MachineId>, addr: SocketAddr) {
        self.topology.lock().await.add_machine(id, addr);
    }

    /// Updates the measured one-way delay towards a peer machine.
    pub async fn set_machine_delay(&self, id: &str, delay: Duration) -> Result<(), EngineError> {
        Ok(self.topology.lock().await.set_machine_delay(id, delay)?)
    }

    /// Registers a node. See [`Topology::register_node`].
    pub async fn register_node(
        &self,
        id: impl Into<EntityId>,
        machine: impl Into<MachineId>,
        mac: MacAddr,
    ) -> Result<(), EngineError> {
        Ok(self.topology.lock().await.register_node(id, machine, mac)?)
    }

    /// Registers a bridge. See [`Topology::register_bridge`].
    pub async fn register_bridge(
        &self,
        id: impl Into<EntityId>,
        machine: impl Into<MachineId>,
    ) -> Result<(), EngineError> {
        Ok(self.topology.lock().await.register_bridge(id, machine)?)
    }

    /// Registers a router. See [`Topology::register_router`].
    pub async fn register_router(
        &self,
        id: impl Into<RouterId>,
        machine: impl Into<MachineId>,
    ) -> Result<(), EngineError> {
        Ok(self.topology.lock().await.register_router(id, machine)?)
    }

    /// Takes the frame channels of a local node.
    pub async fn take_endpoint(&self, node: &str) -> Result<NodeEndpoint, EngineError> {
        Ok(self.topology.lock().await.take_endpoint(node)?)
    }

    /// Connects a node to a bridge. If the bridge has a local router, the node's address is
    /// propagated from there.
    pub async fn connect_node_to_bridge(
        self: &Arc<Self>,
        node: &str,
        bridge: &str,
        props: LinkProps,
    ) -> Result<(), EngineError> {
        let router = {
            let mut topology = self.topology.lock().await;
            topology.connect_node_to_bridge(node, bridge, props).await?;
            topology.bridge(bridge).and_then(|b| b.router().cloned())
        };

        if let Some(router) = router {
            self.propagate_if_local(&router).await?;
        }
        Ok(())
    }

    /// Disconnects a node from its bridge.
    pub async fn disconnect_node_from_bridge(
        &self,
        node: &str,
        bridge: &str,
    ) -> Result<(), EngineError> {
        Ok(self.topology.lock().await.disconnect_node_from_bridge(node, bridge).await?)
    }

    /// Connects a bridge to a router and propagates the addresses behind the bridge.
    pub async fn connect_bridge_to_router(
        self: &Arc<Self>,
        bridge: &str,
        router: &str,
        props: LinkProps,
    ) -> Result<(), EngineError> {
        self.topology.lock().await.connect_bridge_to_router(bridge, router, props).await?;
        self.propagate_if_local(router).await
    }

    /// Disconnects a bridge from its router. Every local router drops its routes to the bridge's
    /// nodes.
    pub async fn disconnect_bridge_from_router(
        &self,
        bridge: &str,
        router: &str,
    ) -> Result<(), EngineError> {
        Ok(self.topology.lock().await.disconnect_bridge_from_router(bridge, router).await?)
    }

    /// Connects two routers of the same machine and trades routes between them.
    pub async fn connect_router_to_router_local(
        self: &Arc<Self>,
        r1: &str,
        r2: &str,
        props: LinkProps,
    ) -> Result<(), EngineError> {
        self.topology.lock().await.connect_router_to_router_local(r1, r2, props).await?;
        self.propagate_if_local(r1).await
    }

    /// Connects a local router to a router of another machine and trades routes with it. The
    /// other machine is expected to connect its side as well.
    pub async fn connect_router_to_router_remote(
        self: &Arc<Self>,
        local: &str,
        remote: &str,
        props: LinkProps,
    ) -> Result<(), EngineError> {
        self.topology.lock().await.connect_router_to_router_remote(local, remote, props).await?;
        self.propagate(local).await
    }

    /// Disconnects two routers. Routes learned through the lost connection are dropped on both
    /// sides. No propagation follows; use [`Engine::forget_routes`] and [`Engine::propagate`] to
    /// rebuild tables further away.
    pub async fn disconnect_routers(&self, r1: &str, r2: &str) -> Result<(), EngineError> {
        Ok(self.topology.lock().await.disconnect_routers(r1, r2).await?)
    }

    /// Removes a node.
    pub async fn remove_node(&self, id: &str) -> Result<(), EngineError> {
        Ok(self.topology.lock().await.remove_node(id).await?)
    }

    /// Removes a bridge.
    pub async fn remove_bridge(&self, id: &str) -> Result<(), EngineError> {
        Ok(self.topology.lock().await.remove_bridge(id).await?)
    }

    /// Removes a router.
    pub async fn remove_router(&self, id: &str) -> Result<(), EngineError> {
        Ok(self.topology.lock().await.remove_router(id).await?)
    }

    /// Returns a copy of the routing table of a local router.
    pub async fn router_weights(&self, router: &str) -> Result<Weights, EngineError> {
        Ok(self.topology.lock().await.router_weights(router)?)
    }

    /// Merges routes advertised by `from` into the table of `to`. See [`Topology::apply_routes`].
    pub async fn apply_routes(
        &self,
        to: &str,
        from: &str,
        weights: &Weights,
    ) -> Result<bool, EngineError> {
        Ok(self.topology.lock().await.apply_routes(to, from, weights)?)
    }

    /// Drops the learned routes of a local router.
    pub async fn forget_routes(&self, router: &str) -> Result<(), EngineError> {
        Ok(self.topology.lock().await.forget_routes(router)?)
    }

    /// Handles routes offered by a router of another machine. If they improve the local table,
    /// propagation continues from `to` in the background. Returns whether anything was
    /// installed.
    pub async fn trade_routes(
        self: &Arc<Self>,
        to: &str,
        from: &str,
        weights: Weights,
    ) -> Result<bool, EngineError> {
        let changed = self.topology.lock().await.apply_routes(to, from, &weights)?;

        if changed {
            let engine = Arc::clone(self);
            let to = to.to_string();
            tokio::spawn(async move {
                if let Err(e) = engine.propagate(&to).await {
                    warn!(?e, router = %to, "propagation failed");
                }
            });
        }

        Ok(changed)
    }

    async fn propagate_if_local(self: &Arc<Self>, router: &str) -> Result<(), EngineError> {
        let local = self.topology.lock().await.router(router).is_some_and(|r| r.is_local());
        if local {
            self.propagate(router).await?;
        }
        Ok(())
    }

    /// Floods routes from `start`: breadth-first across local routers, then through the
    /// exchange for neighbors on other machines. A failed exchange is logged and skipped.
    pub async fn propagate(self: &Arc<Self>, start: &str) -> Result<(), EngineError> {
        let mut pending = VecDeque::from([start.to_string()]);

        while let Some(router) = pending.pop_front() {
            let trades = self.topology.lock().await.propagate_local(&router)?;

            for trade in trades {
                if self.trade_with_peer(&trade).await {
                    debug!(router = %trade.local, "learned routes from peer");
                    pending.push_back(trade.local);
                }
            }
        }

        Ok(())
    }

    /// Pushes the local router's table to the peer and merges the peer's table back. Returns
    /// whether the local table changed.
    async fn trade_with_peer(&self, trade: &RemoteTrade) -> bool {
        let RemoteTrade { machine, local, remote } = trade;

        let ours = match self.topology.lock().await.router_weights(local) {
            Ok(weights) => weights,
            Err(e) => {
                warn!(?e, %local, "failed to read routes");
                return false;
            }
        };
        if let Err(e) = self.exchange.trade_routes(machine, remote, local, ours).await {
            warn!(?e, %machine, %remote, "failed to offer routes to peer");
        }

        let theirs = match self.exchange.router_weights(machine, remote).await {
            Ok(weights) => weights,
            Err(e) => {
                warn!(?e, %machine, %remote, "failed to fetch routes from peer");
                return false;
            }
        };

        match self.topology.lock().await.apply_routes(local, remote, &theirs) {
            Ok(changed) => changed,
            Err(e) => {
                warn!(?e, %local, %remote, "failed to apply routes from peer");
                false
            }
        }
    }

    /// Mirrors a link to a Unix socket and returns its path.
    pub async fn sniff_link(&self, from: &str, to: &str) -> Result<PathBuf, EngineError> {
        Ok(self.topology.lock().await.sniff_link(from, to).await?)
    }

    /// Puts a Unix socket client in the path of a link and returns the socket path.
    pub async fn intercept_link(&self, from: &str, to: &str) -> Result<PathBuf, EngineError> {
        Ok(self.topology.lock().await.intercept_link(from, to).await?)
    }

    /// Ends sniffing or interception of a link.
    pub async fn restore_link(&self, from: &str, to: &str) -> Result<(), EngineError> {
        Ok(self.topology.lock().await.restore_link(from, to).await?)
    }

    /// Returns the counters of a link.
    pub async fn link_stats(&self, from: &str, to: &str) -> Result<Arc<LinkStats>, EngineError> {
        Ok(self.topology.lock().await.link_stats(from, to)?)
    }

    /// Returns the counters of a local bridge.
    pub async fn bridge_stats(&self, id: &str) -> Result<Arc<PortStats>, EngineError> {
        Ok(self.topology.lock().await.bridge_stats(id)?)
    }

    /// Returns the counters of a local router.
    pub async fn router_stats(&self, id: &str) -> Result<Arc<PortStats>, EngineError> {
        Ok(self.topology.lock().await.router_stats(id)?)
    }

    /// Closes every link and socket, and stops the relay.
    pub async fn stop(&self) {
        self.topology.lock().await.shutdown().await;
        self.icm.stop();
        info!(machine = %self.machine_id, "engine stopped");
    }
}
