#![doc(issue_tracker_base_url = "https://github.com/vnet-rs/vnet/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! The entities emulated on one machine and the connections between them.

use std::{path::PathBuf, time::Duration};

use thiserror::Error;
use vnet_common::{
    constants::{DEFAULT_ORACLE_TIMEOUT, DEFAULT_QUEUE_SIZE},
    EntityId, MachineId,
};
use vnet_transport::IcmError;

mod entity;
mod forward;
mod routes;
mod topology;

pub use entity::{Bridge, Node, Router};
pub use forward::{NodeEndpoint, Path, PathOracle, PortStats};
pub use routes::{RemoteTrade, Weight, Weights};
pub use topology::Topology;

/// Errors raised by topology operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown entity: {0}")]
    UnknownEntity(EntityId),
    #[error("Entity already exists: {0}")]
    AlreadyExists(EntityId),
    #[error("{0} is already connected to {1}")]
    AlreadyConnected(EntityId, EntityId),
    #[error("{0} is not connected to {1}")]
    NotConnected(EntityId, EntityId),
    #[error("{0} cannot be connected to itself")]
    SelfConnection(EntityId),
    #[error("{0} and {1} are owned by different machines")]
    MachineMismatch(EntityId, EntityId),
    #[error("{0} and {1} are owned by the same machine")]
    SameMachine(EntityId, EntityId),
    #[error("{0} is not owned by this machine")]
    NotLocal(EntityId),
    #[error("Endpoint of {0} already taken")]
    EndpointTaken(EntityId),
    #[error("Unknown machine: {0}")]
    UnknownMachine(MachineId),
    #[error("No inter-machine relay configured")]
    NoRelay,
    #[error("Link error: {0}")]
    Link(#[from] vnet_link::Error),
    #[error("Relay error: {0}")]
    Icm(#[from] IcmError),
    #[error("IO error: {0:?}")]
    Io(#[from] std::io::Error),
}

/// Result of topology operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Options of a [`Topology`].
#[derive(Debug, Clone)]
pub struct TopologyOptions {
    /// The machine this topology runs on. Entities owned by other machines are placeholders.
    pub(crate) machine_id: MachineId,
    /// Capacity of every channel created by the topology.
    pub(crate) queue_size: usize,
    /// Directory of sniffing and intercepting sockets.
    pub(crate) socket_dir: PathBuf,
    /// Upper bound on a single [`PathOracle`] lookup. Routers do not forward anything else while
    /// they wait.
    pub(crate) oracle_timeout: Duration,
}

impl Default for TopologyOptions {
    fn default() -> Self {
        Self {
            machine_id: "local".to_string(),
            queue_size: DEFAULT_QUEUE_SIZE,
            socket_dir: std::env::temp_dir(),
            oracle_timeout: DEFAULT_ORACLE_TIMEOUT,
        }
    }
}

impl TopologyOptions {
    /// Options for the machine `machine_id`, with default queue sizes.
    pub fn new(machine_id: impl Into<MachineId>) -> Self {
        Self { machine_id: machine_id.into(), ..Default::default() }
    }

    /// Sets the machine this topology runs on.
    pub fn machine_id(mut self, machine_id: impl Into<MachineId>) -> Self {
        self.machine_id = machine_id.into();
        self
    }

    /// Sets the capacity of every channel created by the topology.
    pub fn queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }

    /// Sets the directory where sniffing and intercepting sockets are bound.
    pub fn socket_dir(mut self, socket_dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = socket_dir.into();
        self
    }

    /// Sets how long routers wait for the [`PathOracle`] before discarding a frame.
    pub fn oracle_timeout(mut self, timeout: Duration) -> Self {
        self.oracle_timeout = timeout;
        self
    }
}
