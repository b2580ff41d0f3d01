use std::{
    collections::VecDeque,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use vnet_common::{Delay, EntityId, MachineId, RouterId};
use vnet_link::{
    BiLink, Link, LinkProps, LinkStats, NetworkShaper, RemoteShaper, ShaperKind, ShaperOptions,
};
use vnet_transport::{InterCommunicationManager, RedirectionSocket};
use vnet_wire::MacAddr;

use crate::{
    entity::{Bridge, Node, Router},
    forward::{BridgePort, NodeEndpoint, NodePort, PathOracle, PortStats, RouterPort},
    routes::{self, RemoteTrade, Weight, Weights},
    Error, Result, TopologyOptions,
};

/// A peer machine taking part in the emulation.
#[derive(Debug, Clone)]
struct Machine {
    /// Address of the peer's relay.
    addr: SocketAddr,
    /// Measured one-way delay towards the peer.
    delay: Delay,
}

fn link_id(from: &str, to: &str) -> String {
    format!("{from}-{to}")
}

/// Every entity known to one machine, and the links between them.
///
/// Entities owned by this machine get channels and forwarding tasks. Entities owned by other
/// machines are placeholders that only carry connection bookkeeping, so that connections towards
/// them can be validated. All mutations go through the topology; callers serialize access to it.
pub struct Topology {
    options: TopologyOptions,
    shaper_options: ShaperOptions,
    nodes: FxHashMap<EntityId, Node>,
    bridges: FxHashMap<EntityId, Bridge>,
    routers: FxHashMap<RouterId, Router>,
    /// Connections keyed by their endpoints, in the order they were connected. The left link of
    /// `(a, b)` carries frames from `a` to `b`.
    links: FxHashMap<(EntityId, EntityId), BiLink>,
    machines: FxHashMap<MachineId, Machine>,
    icm: Option<InterCommunicationManager>,
    oracle: Option<Arc<dyn PathOracle>>,
}

impl Topology {
    /// Creates an empty topology without a relay or an oracle.
    pub fn new(options: TopologyOptions) -> Self {
        let shaper_options = ShaperOptions::default().queue_size(options.queue_size);
        Self {
            options,
            shaper_options,
            nodes: FxHashMap::default(),
            bridges: FxHashMap::default(),
            routers: FxHashMap::default(),
            links: FxHashMap::default(),
            machines: FxHashMap::default(),
            icm: None,
            oracle: None,
        }
    }

    /// Sets the relay used by connections to routers on other machines.
    pub fn with_relay(mut self, icm: InterCommunicationManager) -> Self {
        self.icm = Some(icm);
        self
    }

    /// Sets the oracle consulted by routers for unknown destinations. Only applies to routers
    /// registered afterwards.
    pub fn with_oracle(mut self, oracle: Arc<dyn PathOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    /// The machine this topology runs on.
    pub fn machine_id(&self) -> &MachineId {
        &self.options.machine_id
    }

    fn is_local(&self, machine: &MachineId) -> bool {
        *machine == self.options.machine_id
    }

    fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id) ||
            self.bridges.contains_key(id) ||
            self.routers.contains_key(id)
    }

    fn ensure_new(&self, id: &str) -> Result<()> {
        if self.contains(id) {
            return Err(Error::AlreadyExists(id.to_string()));
        }
        Ok(())
    }

    /// Returns the node `id`, local or not.
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Returns the bridge `id`, local or not.
    pub fn bridge(&self, id: &str) -> Option<&Bridge> {
        self.bridges.get(id)
    }

    /// Returns the router `id`, local or not.
    pub fn router(&self, id: &str) -> Option<&Router> {
        self.routers.get(id)
    }

    fn get_node(&self, id: &str) -> Result<&Node> {
        self.nodes.get(id).ok_or_else(|| Error::UnknownEntity(id.to_string()))
    }

    fn get_bridge(&self, id: &str) -> Result<&Bridge> {
        self.bridges.get(id).ok_or_else(|| Error::UnknownEntity(id.to_string()))
    }

    fn get_router(&self, id: &str) -> Result<&Router> {
        self.routers.get(id).ok_or_else(|| Error::UnknownEntity(id.to_string()))
    }

    fn local_router_mut(&mut self, id: &str) -> Result<&mut Router> {
        let router = self.routers.get_mut(id).ok_or_else(|| Error::UnknownEntity(id.to_string()))?;
        if router.port.is_none() {
            return Err(Error::NotLocal(id.to_string()));
        }
        Ok(router)
    }

    /// Returns the connection between `a` and `b`, in either order.
    pub fn bilink(&self, a: &str, b: &str) -> Option<&BiLink> {
        self.links
            .get(&(a.to_string(), b.to_string()))
            .or_else(|| self.links.get(&(b.to_string(), a.to_string())))
    }

    fn take_bilink(&mut self, a: &str, b: &str) -> Option<BiLink> {
        self.links
            .remove(&(a.to_string(), b.to_string()))
            .or_else(|| self.links.remove(&(b.to_string(), a.to_string())))
    }

    /// Returns the link carrying frames from `from` to `to`.
    pub fn link(&self, from: &str, to: &str) -> Option<&Link> {
        self.bilink(from, to).and_then(|bilink| bilink.direction(&link_id(from, to)))
    }

    fn link_mut(&mut self, from: &str, to: &str) -> Result<&mut Link> {
        let id = link_id(from, to);
        let key = if self.links.contains_key(&(from.to_string(), to.to_string())) {
            (from.to_string(), to.to_string())
        } else {
            (to.to_string(), from.to_string())
        };

        self.links
            .get_mut(&key)
            .and_then(|bilink| bilink.direction_mut(&id))
            .ok_or_else(|| Error::NotConnected(from.to_string(), to.to_string()))
    }

    /// Returns the counters of the link carrying frames from `from` to `to`.
    pub fn link_stats(&self, from: &str, to: &str) -> Result<Arc<LinkStats>> {
        self.link(from, to)
            .map(|link| Arc::clone(link.stats()))
            .ok_or_else(|| Error::NotConnected(from.to_string(), to.to_string()))
    }

    /// Returns the counters of a local bridge.
    pub fn bridge_stats(&self, id: &str) -> Result<Arc<PortStats>> {
        let bridge = self.get_bridge(id)?;
        let port = bridge.port.as_ref().ok_or_else(|| Error::NotLocal(id.to_string()))?;
        Ok(Arc::clone(&port.stats))
    }

    /// Returns the counters of a local router.
    pub fn router_stats(&self, id: &str) -> Result<Arc<PortStats>> {
        let router = self.get_router(id)?;
        let port = router.port.as_ref().ok_or_else(|| Error::NotLocal(id.to_string()))?;
        Ok(Arc::clone(&port.stats))
    }

    /// Records the relay address of a peer machine. The measured delay is kept if the machine
    /// was already known.
    pub fn add_machine(&mut self, id: impl Into<MachineId>, addr: SocketAddr) {
        let id = id.into();
        let delay = self.machines.get(&id).map(|m| m.delay.clone()).unwrap_or_default();
        info!(machine = %id, %addr, "added machine");
        self.machines.insert(id, Machine { addr, delay });
    }

    /// Updates the measured one-way delay towards a peer machine. Running links towards the
    /// machine pick it up immediately.
    pub fn set_machine_delay(&mut self, id: &str, delay: Duration) -> Result<()> {
        let machine = self.machines.get(id).ok_or_else(|| Error::UnknownMachine(id.to_string()))?;
        machine.delay.set(delay);
        Ok(())
    }

    /// The measured one-way delay towards a peer machine.
    pub fn machine_delay(&self, id: &str) -> Option<Duration> {
        self.machines.get(id).map(|m| m.delay.get())
    }

    /// Registers a node owned by `machine`. Only local nodes get channels.
    pub fn register_node(
        &mut self,
        id: impl Into<EntityId>,
        machine: impl Into<MachineId>,
        mac: MacAddr,
    ) -> Result<()> {
        let (id, machine) = (id.into(), machine.into());
        self.ensure_new(&id)?;

        let port = if self.is_local(&machine) {
            Some(NodePort::new(&id, self.options.queue_size)?)
        } else {
            None
        };

        debug!(%id, %machine, %mac, "registered node");
        self.nodes.insert(id.clone(), Node { id, machine, mac, bridge: None, port });
        Ok(())
    }

    /// Registers a bridge owned by `machine`. Only local bridges forward frames.
    pub fn register_bridge(
        &mut self,
        id: impl Into<EntityId>,
        machine: impl Into<MachineId>,
    ) -> Result<()> {
        let (id, machine) = (id.into(), machine.into());
        self.ensure_new(&id)?;

        let port = self
            .is_local(&machine)
            .then(|| BridgePort::spawn(&id, self.options.queue_size));

        debug!(%id, %machine, "registered bridge");
        self.bridges.insert(
            id.clone(),
            Bridge { id, machine, router: None, nodes: Default::default(), port },
        );
        Ok(())
    }

    /// Registers a router owned by `machine`. Only local routers forward frames and hold routes.
    pub fn register_router(
        &mut self,
        id: impl Into<RouterId>,
        machine: impl Into<MachineId>,
    ) -> Result<()> {
        let (id, machine) = (id.into(), machine.into());
        self.ensure_new(&id)?;

        let port = self.is_local(&machine).then(|| {
            let oracle =
                self.oracle.clone().map(|oracle| (oracle, self.options.oracle_timeout));
            RouterPort::spawn(&id, self.options.queue_size, oracle)
        });

        debug!(%id, %machine, "registered router");
        self.routers.insert(
            id.clone(),
            Router {
                id,
                machine,
                routers: Default::default(),
                bridges: Default::default(),
                weights: Weights::default(),
                port,
            },
        );
        Ok(())
    }

    /// Takes the channels through which frames are sent by and delivered to a local node.
    pub fn take_endpoint(&mut self, id: &str) -> Result<NodeEndpoint> {
        let node = self.nodes.get_mut(id).ok_or_else(|| Error::UnknownEntity(id.to_string()))?;
        let port = node.port.as_mut().ok_or_else(|| Error::NotLocal(id.to_string()))?;
        port.endpoint.take().ok_or_else(|| Error::EndpointTaken(id.to_string()))
    }

    /// Connects a node to a bridge of the same machine and starts both directions.
    pub async fn connect_node_to_bridge(
        &mut self,
        node_id: &str,
        bridge_id: &str,
        props: LinkProps,
    ) -> Result<()> {
        props.validate()?;
        let node = self.get_node(node_id)?;
        let bridge = self.get_bridge(bridge_id)?;
        if let Some(current) = &node.bridge {
            return Err(Error::AlreadyConnected(node_id.to_string(), current.clone()));
        }
        if node.machine != bridge.machine {
            return Err(Error::MachineMismatch(node_id.to_string(), bridge_id.to_string()));
        }
        let mac = node.mac;
        let router = bridge.router.clone();
        let bridge_port =
            bridge.port.as_ref().map(|port| (port.ingress.clone(), Arc::clone(&port.ports)));

        if let Some((ingress, ports)) = bridge_port {
            let half = props.per_direction();

            let node = self
                .nodes
                .get_mut(node_id)
                .ok_or_else(|| Error::UnknownEntity(node_id.to_string()))?;
            let port = node.port.as_mut().ok_or_else(|| Error::NotLocal(node_id.to_string()))?;
            let uplink = port.uplink.take().ok_or(vnet_link::Error::Detached)?;
            let uplink_rx = uplink.close().await.ok_or(vnet_link::Error::Detached)?;

            let (down_tx, down_rx) = mpsc::channel(self.options.queue_size);
            let left = Link::new(
                link_id(node_id, bridge_id),
                NetworkShaper::new(half, uplink_rx, ingress, &self.shaper_options),
            );
            let right = Link::new(
                link_id(bridge_id, node_id),
                NetworkShaper::new(half, down_rx, port.inbox.clone(), &self.shaper_options),
            );

            let mut bilink = BiLink::new(props, left, right);
            bilink.start()?;
            ports.write().insert(mac, down_tx);
            self.links.insert((node_id.to_string(), bridge_id.to_string()), bilink);
        }

        if let Some(node) = self.nodes.get_mut(node_id) {
            node.bridge = Some(bridge_id.to_string());
        }
        if let Some(bridge) = self.bridges.get_mut(bridge_id) {
            bridge.nodes.insert(node_id.to_string());
        }
        if let Some(router) = router {
            self.install_local_route(&router, bridge_id, mac);
        }

        info!(node = %node_id, bridge = %bridge_id, "connected node to bridge");
        Ok(())
    }

    /// Closes the connection between a node and its bridge. The node keeps draining into a null
    /// link.
    pub async fn disconnect_node_from_bridge(
        &mut self,
        node_id: &str,
        bridge_id: &str,
    ) -> Result<()> {
        let node = self.get_node(node_id)?;
        self.get_bridge(bridge_id)?;
        if node.bridge.as_deref() != Some(bridge_id) {
            return Err(Error::NotConnected(node_id.to_string(), bridge_id.to_string()));
        }
        let mac = node.mac;

        if let Some(port) = self.bridges.get(bridge_id).and_then(|b| b.port.as_ref()) {
            port.ports.write().remove(&mac);
        }

        if let Some(bilink) = self.take_bilink(node_id, bridge_id) {
            let (uplink_rx, _) = bilink.close().await;
            let node = self.nodes.get_mut(node_id);
            if let (Some(port), Some(rx)) = (node.and_then(|n| n.port.as_mut()), uplink_rx) {
                port.detach(node_id, rx)?;
            }
        }

        if let Some(node) = self.nodes.get_mut(node_id) {
            node.bridge = None;
        }
        if let Some(bridge) = self.bridges.get_mut(bridge_id) {
            bridge.nodes.remove(node_id);
        }
        self.purge_macs(&[mac]);

        info!(node = %node_id, bridge = %bridge_id, "disconnected node from bridge");
        Ok(())
    }

    /// Connects a bridge to a router of the same machine, and routes the bridge's nodes through it.
    pub async fn connect_bridge_to_router(
        &mut self,
        bridge_id: &str,
        router_id: &str,
        props: LinkProps,
    ) -> Result<()> {
        props.validate()?;
        let bridge = self.get_bridge(bridge_id)?;
        let router = self.get_router(router_id)?;
        if let Some(current) = &bridge.router {
            return Err(Error::AlreadyConnected(bridge_id.to_string(), current.clone()));
        }
        if bridge.machine != router.machine {
            return Err(Error::MachineMismatch(bridge_id.to_string(), router_id.to_string()));
        }

        let ports = match (&bridge.port, &router.port) {
            (Some(b), Some(r)) => {
                Some((b.ingress.clone(), Arc::clone(&b.gateway), r.ingress.clone()))
            }
            _ => None,
        };

        if let Some((bridge_ingress, gateway, router_ingress)) = ports {
            let half = props.per_direction();

            let (up_tx, up_rx) = mpsc::channel(self.options.queue_size);
            let (down_tx, down_rx) = mpsc::channel(self.options.queue_size);
            let left = Link::new(
                link_id(bridge_id, router_id),
                NetworkShaper::new(half, up_rx, router_ingress, &self.shaper_options),
            );
            let right = Link::new(
                link_id(router_id, bridge_id),
                NetworkShaper::new(half, down_rx, bridge_ingress, &self.shaper_options),
            );

            let mut bilink = BiLink::new(props, left, right);
            bilink.start()?;
            *gateway.write() = Some(up_tx);
            self.links.insert((bridge_id.to_string(), router_id.to_string()), bilink);

            if let Some(port) = self.routers.get_mut(router_id).and_then(|r| r.port.as_mut()) {
                port.bridges.insert(bridge_id.to_string(), down_tx);
            }
        }

        if let Some(bridge) = self.bridges.get_mut(bridge_id) {
            bridge.router = Some(router_id.to_string());
        }
        if let Some(router) = self.routers.get_mut(router_id) {
            router.bridges.insert(bridge_id.to_string());
        }
        for mac in self.macs_behind(bridge_id) {
            self.install_local_route(router_id, bridge_id, mac);
        }

        info!(bridge = %bridge_id, router = %router_id, "connected bridge to router");
        Ok(())
    }

    /// Closes the connection between a bridge and its router. Local routers drop their routes to
    /// the bridge's nodes.
    pub async fn disconnect_bridge_from_router(
        &mut self,
        bridge_id: &str,
        router_id: &str,
    ) -> Result<()> {
        let bridge = self.get_bridge(bridge_id)?;
        self.get_router(router_id)?;
        if bridge.router.as_deref() != Some(router_id) {
            return Err(Error::NotConnected(bridge_id.to_string(), router_id.to_string()));
        }

        if let Some(port) = &bridge.port {
            *port.gateway.write() = None;
        }
        if let Some(port) = self.routers.get_mut(router_id).and_then(|r| r.port.as_mut()) {
            port.bridges.remove(bridge_id);
        }
        if let Some(bilink) = self.take_bilink(bridge_id, router_id) {
            bilink.close().await;
        }

        if let Some(bridge) = self.bridges.get_mut(bridge_id) {
            bridge.router = None;
        }
        if let Some(router) = self.routers.get_mut(router_id) {
            router.bridges.remove(bridge_id);
        }
        let macs = self.macs_behind(bridge_id);
        self.purge_macs(&macs);

        info!(bridge = %bridge_id, router = %router_id, "disconnected bridge from router");
        Ok(())
    }

    fn check_router_pair(&self, r1: &str, r2: &str) -> Result<(&Router, &Router)> {
        if r1 == r2 {
            return Err(Error::SelfConnection(r1.to_string()));
        }
        let a = self.get_router(r1)?;
        let b = self.get_router(r2)?;
        if a.routers.contains(r2) {
            return Err(Error::AlreadyConnected(r1.to_string(), r2.to_string()));
        }
        Ok((a, b))
    }

    /// Connects two routers owned by the same machine. Routes are not traded here, see
    /// [`Topology::propagate_local`].
    pub async fn connect_router_to_router_local(
        &mut self,
        r1: &str,
        r2: &str,
        props: LinkProps,
    ) -> Result<()> {
        props.validate()?;
        let (a, b) = self.check_router_pair(r1, r2)?;
        if a.machine != b.machine {
            return Err(Error::MachineMismatch(r1.to_string(), r2.to_string()));
        }

        let ports = match (&a.port, &b.port) {
            (Some(a), Some(b)) => Some((
                a.ingress.clone(),
                Arc::clone(&a.neighbors),
                b.ingress.clone(),
                Arc::clone(&b.neighbors),
            )),
            _ => None,
        };

        if let Some((a_ingress, a_neighbors, b_ingress, b_neighbors)) = ports {
            let half = props.per_direction();

            let (ab_tx, ab_rx) = mpsc::channel(self.options.queue_size);
            let (ba_tx, ba_rx) = mpsc::channel(self.options.queue_size);
            let left = Link::new(
                link_id(r1, r2),
                NetworkShaper::new(half, ab_rx, b_ingress, &self.shaper_options),
            );
            let right = Link::new(
                link_id(r2, r1),
                NetworkShaper::new(half, ba_rx, a_ingress, &self.shaper_options),
            );

            let mut bilink = BiLink::new(props, left, right);
            bilink.start()?;
            a_neighbors.write().insert(r2.to_string(), ab_tx);
            b_neighbors.write().insert(r1.to_string(), ba_tx);
            self.links.insert((r1.to_string(), r2.to_string()), bilink);
        }

        self.record_router_pair(r1, r2);
        info!(%r1, %r2, "connected routers");
        Ok(())
    }

    /// Connects a local router to a router owned by a peer machine. Frames towards the peer are
    /// shaped here and relayed; frames from the peer were shaped by the peer and are delivered
    /// as they arrive. The peer connects its side the same way.
    pub async fn connect_router_to_router_remote(
        &mut self,
        local: &str,
        remote: &str,
        props: LinkProps,
    ) -> Result<()> {
        props.validate()?;
        let (a, b) = self.check_router_pair(local, remote)?;
        let Some(local_port) = &a.port else {
            return Err(Error::NotLocal(local.to_string()));
        };
        if a.machine == b.machine {
            return Err(Error::SameMachine(local.to_string(), remote.to_string()));
        }
        let machine = self
            .machines
            .get(&b.machine)
            .cloned()
            .ok_or_else(|| Error::UnknownMachine(b.machine.clone()))?;
        let icm = self.icm.clone().ok_or(Error::NoRelay)?;
        let ingress = local_port.ingress.clone();
        let neighbors = Arc::clone(&local_port.neighbors);

        icm.add_connection(local.to_string(), remote.to_string(), machine.addr).await?;

        let (out_tx, out_rx) = mpsc::channel(self.options.queue_size);
        let (in_tx, in_rx) = mpsc::channel(self.options.queue_size);
        let left = Link::new(
            link_id(local, remote),
            RemoteShaper::new(
                props.per_direction(),
                out_rx,
                remote.to_string(),
                local.to_string(),
                icm.outbound(),
                machine.delay.clone(),
                &self.shaper_options,
            ),
        );
        let inbound_props = LinkProps { weight: props.weight, ..Default::default() };
        let right = Link::new(
            link_id(remote, local),
            NetworkShaper::new(inbound_props, in_rx, ingress, &self.shaper_options),
        );

        let mut bilink = BiLink::new(props, left, right);
        bilink.start()?;
        icm.register_local(local.to_string(), remote.to_string(), in_tx);
        neighbors.write().insert(remote.to_string(), out_tx);
        self.links.insert((local.to_string(), remote.to_string()), bilink);

        self.record_router_pair(local, remote);
        info!(%local, %remote, "connected router to remote router");
        Ok(())
    }

    fn record_router_pair(&mut self, r1: &str, r2: &str) {
        if let Some(router) = self.routers.get_mut(r1) {
            router.routers.insert(r2.to_string());
        }
        if let Some(router) = self.routers.get_mut(r2) {
            router.routers.insert(r1.to_string());
        }
    }

    /// Disconnects two routers, on the same machine or not. Each side loses the routes it
    /// learned through the other; routes learned through other neighbors are kept.
    pub async fn disconnect_routers(&mut self, r1: &str, r2: &str) -> Result<()> {
        let a = self.get_router(r1)?;
        let b = self.get_router(r2)?;
        if !a.routers.contains(r2) {
            return Err(Error::NotConnected(r1.to_string(), r2.to_string()));
        }
        let crosses_machines = a.machine != b.machine;

        for (router, neighbor) in [(r1, r2), (r2, r1)] {
            let Some(router) = self.routers.get_mut(router) else { continue };
            router.routers.remove(neighbor);
            let Some(port) = &router.port else { continue };

            port.neighbors.write().remove(neighbor);
            if crosses_machines {
                if let Some(icm) = &self.icm {
                    icm.unregister_local(&router.id, &neighbor.to_string());
                    icm.remove_connection(&router.id, &neighbor.to_string());
                }
            }

            for mac in routes::purge_via(&mut router.weights, &neighbor.to_string()) {
                port.unroute(&mac);
            }
        }

        if let Some(bilink) = self.take_bilink(r1, r2) {
            bilink.close().await;
        }

        info!(%r1, %r2, "disconnected routers");
        Ok(())
    }

    /// Removes a node, disconnecting it first.
    pub async fn remove_node(&mut self, id: &str) -> Result<()> {
        let node = self.get_node(id)?;
        if let Some(bridge) = node.bridge.clone() {
            self.disconnect_node_from_bridge(id, &bridge).await?;
        }

        if let Some(mut node) = self.nodes.remove(id) {
            if let Some(uplink) = node.port.as_mut().and_then(|p| p.uplink.take()) {
                uplink.close().await;
            }
        }

        info!(%id, "removed node");
        Ok(())
    }

    /// Removes a bridge, disconnecting its nodes and router first.
    pub async fn remove_bridge(&mut self, id: &str) -> Result<()> {
        let bridge = self.get_bridge(id)?;
        let nodes: Vec<_> = bridge.nodes.iter().cloned().collect();
        let router = bridge.router.clone();

        for node in nodes {
            self.disconnect_node_from_bridge(&node, id).await?;
        }
        if let Some(router) = router {
            self.disconnect_bridge_from_router(id, &router).await?;
        }

        self.bridges.remove(id);
        info!(%id, "removed bridge");
        Ok(())
    }

    /// Removes a router, disconnecting its bridges and neighbors first.
    pub async fn remove_router(&mut self, id: &str) -> Result<()> {
        let router = self.get_router(id)?;
        let bridges: Vec<_> = router.bridges.iter().cloned().collect();
        let routers: Vec<_> = router.routers.iter().cloned().collect();

        for bridge in bridges {
            self.disconnect_bridge_from_router(&bridge, id).await?;
        }
        for neighbor in routers {
            self.disconnect_routers(id, &neighbor).await?;
        }

        self.routers.remove(id);
        info!(%id, "removed router");
        Ok(())
    }

    fn macs_behind(&self, bridge_id: &str) -> Vec<MacAddr> {
        self.bridges
            .get(bridge_id)
            .map(|bridge| {
                bridge.nodes.iter().filter_map(|node| self.nodes.get(node)).map(|n| n.mac).collect()
            })
            .unwrap_or_default()
    }

    /// Routes `mac` to the bridge it sits behind, at cost 0, if `router_id` is local.
    fn install_local_route(&mut self, router_id: &str, bridge_id: &str, mac: MacAddr) {
        let Some(router) = self.routers.get_mut(router_id) else { return };
        let Some(port) = &router.port else { return };

        if port.route_via_bridge(mac, &bridge_id.to_string()) {
            router.weights.insert(mac, Weight::new(router_id, 0));
        }
    }

    /// Removes every route to `macs` from every local router.
    fn purge_macs(&mut self, macs: &[MacAddr]) {
        for router in self.routers.values_mut() {
            let Some(port) = &router.port else { continue };
            for mac in macs {
                if router.weights.remove(mac).is_some() {
                    debug!(router = %router.id, %mac, "removed route");
                }
                port.unroute(mac);
            }
        }
    }

    /// Returns the routing table of a local router.
    pub fn router_weights(&self, id: &str) -> Result<Weights> {
        let router = self.get_router(id)?;
        if router.port.is_none() {
            return Err(Error::NotLocal(id.to_string()));
        }
        Ok(router.weights.clone())
    }

    /// Merges the routes advertised by `from` into the table of the local router `to`. A route is
    /// installed if its cost plus the weight of the connection is strictly lower than the known
    /// one, or if the address is unknown. Returns whether anything was installed.
    pub fn apply_routes(&mut self, to: &str, from: &str, weights: &Weights) -> Result<bool> {
        let link_weight = self
            .bilink(to, from)
            .map(|bilink| bilink.props().weight)
            .ok_or_else(|| Error::NotConnected(to.to_string(), from.to_string()))?;
        let router = self.local_router_mut(to)?;

        let installed = routes::merge(&mut router.weights, &from.to_string(), weights, link_weight);
        if let Some(port) = &router.port {
            for mac in &installed {
                if !port.route_via_neighbor(*mac, &from.to_string()) {
                    warn!(%to, %from, %mac, "no link towards neighbor");
                }
            }
        }

        if !installed.is_empty() {
            debug!(%to, %from, installed = installed.len(), "applied routes");
        }
        Ok(!installed.is_empty())
    }

    /// Drops every learned route of a local router, keeping the addresses behind its own
    /// bridges.
    pub fn forget_routes(&mut self, id: &str) -> Result<()> {
        let router = self.local_router_mut(id)?;
        let forgotten = routes::forget(&mut router.weights, id);
        if let Some(port) = &router.port {
            for mac in &forgotten {
                port.unroute(mac);
            }
        }

        debug!(%id, forgotten = forgotten.len(), "forgot routes");
        Ok(())
    }

    /// Floods routes breadth-first from `start` across the local routers. Neighbors on this
    /// machine trade tables with each other in both directions. Connections to routers on other
    /// machines are not traded here but returned, for the caller to trade through the peer.
    ///
    /// A router is visited again whenever its table changes. Since routes are only ever replaced
    /// by strictly cheaper ones, this terminates.
    pub fn propagate_local(&mut self, start: &str) -> Result<Vec<RemoteTrade>> {
        self.local_router_mut(start)?;

        let mut queue = VecDeque::from([start.to_string()]);
        let mut visited = FxHashSet::from_iter([start.to_string()]);
        let mut trades = Vec::new();

        while let Some(current) = queue.pop_front() {
            let Some(router) = self.routers.get(&current) else { continue };
            let neighbors: Vec<_> = router.routers.iter().cloned().collect();

            for neighbor in neighbors {
                let Some(other) = self.routers.get(&neighbor) else { continue };

                if other.port.is_none() {
                    let trade = RemoteTrade {
                        machine: other.machine.clone(),
                        local: current.clone(),
                        remote: neighbor.clone(),
                    };
                    if !trades.contains(&trade) {
                        trades.push(trade);
                    }
                    continue;
                }

                let ours = self.router_weights(&current)?;
                let theirs = self.router_weights(&neighbor)?;
                let neighbor_changed = self.apply_routes(&neighbor, &current, &ours)?;
                let current_changed = self.apply_routes(&current, &neighbor, &theirs)?;

                if visited.insert(neighbor.clone()) || neighbor_changed {
                    queue.push_back(neighbor);
                }
                if current_changed {
                    queue.push_back(current.clone());
                }
            }
        }

        Ok(trades)
    }

    /// Mirrors the traffic of the link from `from` to `to` to a Unix socket, replacing any
    /// previous sniffing session. Returns the socket path.
    pub async fn sniff_link(&mut self, from: &str, to: &str) -> Result<PathBuf> {
        let dir = self.options.socket_dir.clone();
        let queue_size = self.options.queue_size;
        let link = self.link_mut(from, to)?;
        if link.kind() == ShaperKind::Sniff {
            link.restore().await?;
        }

        let path = RedirectionSocket::sniff_path(&dir, link.id());
        let socket = RedirectionSocket::bind(&path, queue_size)?;
        link.sniff(socket).await?;

        info!(%from, %to, ?path, "sniffing link");
        Ok(path)
    }

    /// Puts a Unix socket client in the path of the link from `from` to `to`, replacing any
    /// previous interception. Returns the socket path.
    pub async fn intercept_link(&mut self, from: &str, to: &str) -> Result<PathBuf> {
        let dir = self.options.socket_dir.clone();
        let queue_size = self.options.queue_size;
        let link = self.link_mut(from, to)?;
        if link.kind() == ShaperKind::Intercept {
            link.restore().await?;
        }

        let path = RedirectionSocket::intercept_path(&dir, link.id());
        let socket = RedirectionSocket::bind(&path, queue_size)?;
        link.intercept(socket).await?;

        info!(%from, %to, ?path, "intercepting link");
        Ok(path)
    }

    /// Ends sniffing or interception on the link from `from` to `to`.
    pub async fn restore_link(&mut self, from: &str, to: &str) -> Result<()> {
        self.link_mut(from, to)?.restore().await?;
        info!(%from, %to, "restored link");
        Ok(())
    }

    /// Closes every link and stops every forwarding task. The topology is empty afterwards.
    pub async fn shutdown(&mut self) {
        for (_, bilink) in self.links.drain() {
            bilink.close().await;
        }
        for (_, mut node) in self.nodes.drain() {
            if let Some(uplink) = node.port.as_mut().and_then(|p| p.uplink.take()) {
                uplink.close().await;
            }
        }
        self.bridges.clear();
        self.routers.clear();
        debug!("topology shut down");
    }
}
