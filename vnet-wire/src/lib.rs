#![doc(issue_tracker_base_url = "https://github.com/vnet-rs/vnet/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Frames and the codecs carrying them over redirection sockets and between machines.

use thiserror::Error;
use vnet_common::constants::KiB;

/// Ethernet-like frames and their codec.
pub mod frame;
mod mac;
/// Frames relayed between routers of different machines.
pub mod router;

pub use frame::Frame;
pub use mac::{MacAddr, ParseMacError};
pub use router::RouterFrame;

/// Largest payload accepted by the decoders.
pub const MAX_PAYLOAD_SIZE: usize = 64 * KiB as usize;

/// Errors raised while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0:?}")]
    Io(#[from] std::io::Error),
    #[error("Invalid wire ID: {0}")]
    WireId(u8),
    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("Router id too long: {0} bytes")]
    IdTooLong(usize),
    #[error("Router id is not valid UTF-8")]
    InvalidId,
}
