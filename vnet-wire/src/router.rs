use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use vnet_common::RouterId;

use crate::{frame::BodyHeader, Error, Frame, MAX_PAYLOAD_SIZE};

/// The ID of the router frame codec on the wire.
const WIRE_ID: u8 = 0x02;

/// A frame in transit between two routers living on different machines.
#[derive(Debug, Clone)]
pub struct RouterFrame {
    /// The destination router, local to the receiving machine.
    pub to: RouterId,
    /// The router that emitted the frame on the sending machine.
    pub from: RouterId,
    /// The frame being relayed.
    pub frame: Frame,
}

impl RouterFrame {
    /// Addresses `frame` from `from` to `to`.
    pub fn new(to: RouterId, from: RouterId, frame: Frame) -> Self {
        Self { to, from, frame }
    }
}

#[derive(Debug, Default)]
enum State {
    #[default]
    Header,
    Payload { to: RouterId, from: RouterId, header: BodyHeader },
}

/// Codec for a stream of [`RouterFrame`]s, used between inter-machine relays.
///
/// Layout: `wire_id:u8 | to_len:u16 | from_len:u16 | to | from | frame body`.
#[derive(Debug, Default)]
pub struct Codec {
    /// The current state of the decoder.
    state: State,
}

impl Codec {
    /// Creates a codec waiting for a frame header.
    pub fn new() -> Self {
        Self::default()
    }
}

fn read_id(src: &mut BytesMut, len: usize) -> Result<RouterId, Error> {
    let raw = src.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| Error::InvalidId)
}

impl Decoder for Codec {
    type Item = RouterFrame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                State::Header => {
                    // Wire ID plus both id lengths
                    if src.len() < 5 {
                        return Ok(None);
                    }

                    let wire_id = src[0];
                    if wire_id != WIRE_ID {
                        return Err(Error::WireId(wire_id));
                    }

                    let to_len = u16::from_be_bytes([src[1], src[2]]) as usize;
                    let from_len = u16::from_be_bytes([src[3], src[4]]) as usize;

                    if src.len() < 5 + to_len + from_len + BodyHeader::LEN {
                        return Ok(None);
                    }

                    src.advance(5);
                    let to = read_id(src, to_len)?;
                    let from = read_id(src, from_len)?;
                    let header = BodyHeader::read(src)?;

                    self.state = State::Payload { to, from, header };
                }
                State::Payload { ref mut to, ref mut from, header } => {
                    if src.len() < header.payload_len() {
                        src.reserve(header.payload_len() - src.len());
                        return Ok(None);
                    }

                    let payload = src.split_to(header.payload_len()).freeze();
                    let msg = RouterFrame {
                        to: std::mem::take(to),
                        from: std::mem::take(from),
                        frame: header.into_frame(payload),
                    };

                    self.state = State::Header;
                    return Ok(Some(msg));
                }
            }
        }
    }
}

impl Encoder<RouterFrame> for Codec {
    type Error = Error;

    fn encode(&mut self, item: RouterFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let to_len = u16::try_from(item.to.len()).map_err(|_| Error::IdTooLong(item.to.len()))?;
        let from_len =
            u16::try_from(item.from.len()).map_err(|_| Error::IdTooLong(item.from.len()))?;
        if item.frame.payload().len() > MAX_PAYLOAD_SIZE {
            return Err(Error::PayloadTooLarge(item.frame.payload().len()));
        }

        dst.reserve(5 + item.to.len() + item.from.len() + item.frame.body_len());

        dst.put_u8(WIRE_ID);
        dst.put_u16(to_len);
        dst.put_u16(from_len);
        dst.put_slice(item.to.as_bytes());
        dst.put_slice(item.from.as_bytes());
        item.frame.put_body(dst);

        Ok(())
    }
}
