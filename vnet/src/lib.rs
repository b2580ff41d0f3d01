#![doc(issue_tracker_base_url = "https://github.com/vnet-rs/vnet/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Emulates networks of nodes, bridges and routers spread over several machines.

mod engine;
mod exchange;

pub use engine::{Engine, EngineError, EngineOptions};
pub use exchange::{ExchangeError, InProcessExchange, NoExchange, RouteExchange};

pub use vnet_common::{constants, Delay, EntityId, MachineId, RouterId};
pub use vnet_link::{
    shaper, BiLink, Error as LinkError, InterceptShaper, Link, LinkId, LinkProps, LinkStats,
    NetworkShaper, NullShaper, RemoteShaper, Shaper, ShaperKind, ShaperOptions, SniffShaper,
};
pub use vnet_topology::{
    Bridge, Error as TopologyError, Node, NodeEndpoint, Path, PathOracle, PortStats, RemoteTrade,
    Router, Topology, TopologyOptions, Weight, Weights,
};
pub use vnet_transport::*;
pub use vnet_wire::{Frame, MacAddr, ParseMacError, RouterFrame};
