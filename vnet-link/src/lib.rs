#![doc(issue_tracker_base_url = "https://github.com/vnet-rs/vnet/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Shaped, directed links between emulated entities.

use std::path::PathBuf;

use thiserror::Error;

mod bucket;
mod link;
mod props;
/// The shaper variants a [`Link`] can run.
pub mod shaper;
mod stats;

pub use link::{BiLink, Link, LinkId};
pub use props::{LinkProps, ShaperOptions};
pub use shaper::{
    InterceptShaper, NetworkShaper, NullShaper, RemoteShaper, Shaper, ShaperKind, SniffShaper,
};
pub use stats::LinkStats;

/// Errors raised by links and shapers.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid link properties: {0}")]
    InvalidProps(String),
    #[error("Cannot convert {from} shaper into {to} shaper")]
    InvalidConversion { from: ShaperKind, to: ShaperKind },
    #[error("Shaper is running: {0}")]
    ShaperRunning(ShaperKind),
    #[error("Shaper has no incoming channel")]
    Detached,
    #[error("Redirection socket is stopped: {0:?}")]
    SocketStopped(PathBuf),
    #[error("Shaper task failed: {0:?}")]
    Task(#[from] tokio::task::JoinError),
}
