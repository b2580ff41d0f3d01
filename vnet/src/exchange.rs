use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use thiserror::Error;
use vnet_common::{MachineId, RouterId};
use vnet_topology::Weights;

use crate::Engine;

/// Errors raised while trading routes with another machine.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("Unknown machine: {0}")]
    UnknownMachine(MachineId),
    #[error("Peer failed: {0}")]
    Peer(String),
}

/// Trades routes with routers owned by other machines.
///
/// Propagation uses the same compare-and-install logic whether routers are on this machine or
/// not. This trait is the part that differs: it reaches the engine of another machine, however the
/// control plane connects engines.
#[async_trait]
pub trait RouteExchange: Send + Sync + 'static {
    /// Returns the routing table of `router` on `machine`.
    async fn router_weights(
        &self,
        machine: &MachineId,
        router: &RouterId,
    ) -> Result<Weights, ExchangeError>;

    /// Offers `weights` of `from` to `to` on `machine`. The peer installs what improves its table
    /// and carries on propagating on its own.
    async fn trade_routes(
        &self,
        machine: &MachineId,
        to: &RouterId,
        from: &RouterId,
        weights: Weights,
    ) -> Result<(), ExchangeError>;
}

/// A [`RouteExchange`] for engines that never connect to other machines.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoExchange;

#[async_trait]
impl RouteExchange for NoExchange {
    async fn router_weights(
        &self,
        machine: &MachineId,
        _router: &RouterId,
    ) -> Result<Weights, ExchangeError> {
        Err(ExchangeError::UnknownMachine(machine.clone()))
    }

    async fn trade_routes(
        &self,
        machine: &MachineId,
        _to: &RouterId,
        _from: &RouterId,
        _weights: Weights,
    ) -> Result<(), ExchangeError> {
        Err(ExchangeError::UnknownMachine(machine.clone()))
    }
}

/// A [`RouteExchange`] between engines running in the same process, e.g. to emulate several
/// machines in one test.
#[derive(Debug, Default)]
pub struct InProcessExchange {
    engines: RwLock<FxHashMap<MachineId, Weak<Engine>>>,
}

impl InProcessExchange {
    /// Creates an exchange without engines.
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    /// Makes `engine` reachable under its machine id.
    pub fn register(&self, engine: &Arc<Engine>) {
        self.engines.write().insert(engine.machine_id().clone(), Arc::downgrade(engine));
    }

    fn engine(&self, machine: &MachineId) -> Result<Arc<Engine>, ExchangeError> {
        self.engines
            .read()
            .get(machine)
            .and_then(Weak::upgrade)
            .ok_or_else(|| ExchangeError::UnknownMachine(machine.clone()))
    }
}

#[async_trait]
impl RouteExchange for InProcessExchange {
    async fn router_weights(
        &self,
        machine: &MachineId,
        router: &RouterId,
    ) -> Result<Weights, ExchangeError> {
        self.engine(machine)?
            .router_weights(router)
            .await
            .map_err(|e| ExchangeError::Peer(e.to_string()))
    }

    async fn trade_routes(
        &self,
        machine: &MachineId,
        to: &RouterId,
        from: &RouterId,
        weights: Weights,
    ) -> Result<(), ExchangeError> {
        self.engine(machine)?
            .trade_routes(to, from, weights)
            .await
            .map(|_| ())
            .map_err(|e| ExchangeError::Peer(e.to_string()))
    }
}
