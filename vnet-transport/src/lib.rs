#![doc(issue_tracker_base_url = "https://github.com/vnet-rs/vnet/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Transports between a machine and the outside world: the inter-machine relay and the Unix
//! sockets used to sniff and intercept links.

/// The relay carrying router frames between machines.
pub mod icm;
mod redirect;

pub use icm::{IcmError, IcmOptions, IcmStats, InterCommunicationManager};
pub use redirect::{RedirectStats, RedirectionSocket};
