//! Distance-vector routing state.

use rustc_hash::FxHashMap;
use vnet_common::{MachineId, RouterId};
use vnet_wire::MacAddr;

/// Cost of reaching a MAC address and the neighbor router it is reached through. Addresses
/// behind the router itself have cost 0 and go through the router itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Weight {
    /// The neighbor the address is reached through, or the router itself.
    pub via: RouterId,
    /// Sum of link weights up to the address.
    pub cost: u32,
}

impl Weight {
    /// Creates a weight reached through `via`.
    pub fn new(via: impl Into<RouterId>, cost: u32) -> Self {
        Self { via: via.into(), cost }
    }
}

/// The routing table of a router.
pub type Weights = FxHashMap<MacAddr, Weight>;

/// A router-to-router connection that crosses machines and must be traded through a
/// route exchange with the other machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrade {
    /// Machine owning the remote router.
    pub machine: MachineId,
    /// The router on this machine.
    pub local: RouterId,
    /// The router on the other machine.
    pub remote: RouterId,
}

/// Merges the routes advertised by `neighbor` over a link of weight `link_weight` into `weights`.
/// A route is installed if the address is unknown or the new cost is strictly lower. Returns the
/// installed addresses.
pub(crate) fn merge(
    weights: &mut Weights,
    neighbor: &RouterId,
    advertised: &Weights,
    link_weight: u32,
) -> Vec<MacAddr> {
    let mut installed = Vec::new();

    for (mac, weight) in advertised {
        let candidate = weight.cost.saturating_add(link_weight);
        let better = weights.get(mac).map_or(true, |existing| candidate < existing.cost);
        if better {
            weights.insert(*mac, Weight::new(neighbor.clone(), candidate));
            installed.push(*mac);
        }
    }

    installed
}

/// Removes every route learned through `neighbor`. Returns the removed addresses.
pub(crate) fn purge_via(weights: &mut Weights, neighbor: &RouterId) -> Vec<MacAddr> {
    let removed: Vec<_> =
        weights.iter().filter(|(_, w)| w.via == *neighbor).map(|(mac, _)| *mac).collect();
    for mac in &removed {
        weights.remove(mac);
    }
    removed
}

/// Removes every route learned from a neighbor, keeping the addresses behind `router` itself.
/// Routes over zero-weight links cost 0 as well, so only `via` tells them apart.
pub(crate) fn forget(weights: &mut Weights, router: &str) -> Vec<MacAddr> {
    let removed: Vec<_> =
        weights.iter().filter(|(_, w)| w.via != router).map(|(mac, _)| *mac).collect();
    for mac in &removed {
        weights.remove(mac);
    }
    removed
}
