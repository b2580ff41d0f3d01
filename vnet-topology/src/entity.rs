use std::collections::BTreeSet;

use vnet_common::{EntityId, MachineId, RouterId};
use vnet_wire::MacAddr;

use crate::{
    forward::{BridgePort, NodePort, RouterPort},
    Weights,
};

/// An emulated host.
#[derive(Debug)]
pub struct Node {
    pub(crate) id: EntityId,
    pub(crate) machine: MachineId,
    pub(crate) mac: MacAddr,
    pub(crate) bridge: Option<EntityId>,
    /// Only present on the owning machine.
    pub(crate) port: Option<NodePort>,
}

impl Node {
    /// The node id.
    pub fn id(&self) -> &EntityId {
        &self.id
    }

    /// The machine owning this node.
    pub fn machine(&self) -> &MachineId {
        &self.machine
    }

    /// The node's hardware address.
    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    /// The bridge the node is connected to, if any.
    pub fn bridge(&self) -> Option<&EntityId> {
        self.bridge.as_ref()
    }

    /// Returns `true` if this machine runs the node.
    pub fn is_local(&self) -> bool {
        self.port.is_some()
    }
}

/// A layer 2 switch connecting nodes to at most one router.
#[derive(Debug)]
pub struct Bridge {
    pub(crate) id: EntityId,
    pub(crate) machine: MachineId,
    pub(crate) router: Option<RouterId>,
    pub(crate) nodes: BTreeSet<EntityId>,
    pub(crate) port: Option<BridgePort>,
}

impl Bridge {
    /// The bridge id.
    pub fn id(&self) -> &EntityId {
        &self.id
    }

    /// The machine owning this bridge.
    pub fn machine(&self) -> &MachineId {
        &self.machine
    }

    /// The router the bridge is connected to, if any.
    pub fn router(&self) -> Option<&RouterId> {
        self.router.as_ref()
    }

    /// Nodes connected to this bridge, in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &EntityId> {
        self.nodes.iter()
    }

    /// Returns `true` if this machine runs the bridge.
    pub fn is_local(&self) -> bool {
        self.port.is_some()
    }
}

/// A layer 3 router connecting bridges and other routers.
#[derive(Debug)]
pub struct Router {
    pub(crate) id: RouterId,
    pub(crate) machine: MachineId,
    pub(crate) routers: BTreeSet<RouterId>,
    pub(crate) bridges: BTreeSet<EntityId>,
    pub(crate) weights: Weights,
    pub(crate) port: Option<RouterPort>,
}

impl Router {
    /// The router id.
    pub fn id(&self) -> &RouterId {
        &self.id
    }

    /// The machine owning this router.
    pub fn machine(&self) -> &MachineId {
        &self.machine
    }

    /// Neighbor routers, local or remote, in id order.
    pub fn routers(&self) -> impl Iterator<Item = &RouterId> {
        self.routers.iter()
    }

    /// Bridges connected to this router, in id order.
    pub fn bridges(&self) -> impl Iterator<Item = &EntityId> {
        self.bridges.iter()
    }

    /// The routing table. Empty for routers of other machines.
    pub fn weights(&self) -> &Weights {
        &self.weights
    }

    /// Returns `true` if this machine runs the router.
    pub fn is_local(&self) -> bool {
        self.port.is_some()
    }
}
