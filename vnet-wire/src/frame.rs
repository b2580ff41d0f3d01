use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::time::Instant;
use tokio_util::codec::{Decoder, Encoder};

use crate::{Error, MacAddr, MAX_PAYLOAD_SIZE};

/// The ID of the frame codec on the wire.
const WIRE_ID: u8 = 0x01;

/// An emulated Ethernet frame.
///
/// Everything but [`Frame::scheduled_time`] is immutable once built. Shapers move the scheduled
/// time forward as the frame travels, and the frame is released when that instant is reached.
#[derive(Debug, Clone)]
pub struct Frame {
    src: MacAddr,
    dst: MacAddr,
    /// The size accounted against bandwidth limits. Defaults to the payload length.
    size: u32,
    payload: Bytes,
    /// The instant at which this frame should be delivered by the current hop.
    pub scheduled_time: Instant,
}

impl Frame {
    /// Creates a new frame whose size is the payload length.
    pub fn new(src: MacAddr, dst: MacAddr, payload: Bytes) -> Self {
        Self {
            src,
            dst,
            size: payload.len() as u32,
            payload,
            scheduled_time: Instant::now(),
        }
    }

    /// Overrides the size accounted for this frame, e.g. to emulate large frames without
    /// carrying their payload.
    pub fn with_size(mut self, size: u32) -> Self {
        self.size = size;
        self
    }

    /// The source address.
    #[inline]
    pub fn src(&self) -> MacAddr {
        self.src
    }

    /// The destination address.
    #[inline]
    pub fn dst(&self) -> MacAddr {
        self.dst
    }

    /// The size accounted by shapers, in bytes.
    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// The frame contents.
    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consumes the frame, returning its contents.
    #[inline]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Returns the length of the encoded frame body in bytes, without wire ID.
    #[inline]
    pub(crate) fn body_len(&self) -> usize {
        BodyHeader::LEN + self.payload.len()
    }

    /// Writes the frame body. The scheduled time is local to a machine and never encoded.
    pub(crate) fn put_body(self, dst: &mut BytesMut) {
        dst.put_slice(&self.src.0);
        dst.put_slice(&self.dst.0);
        dst.put_u32(self.size);
        dst.put_u32(self.payload.len() as u32);
        dst.put(self.payload);
    }
}

/// Fixed-size part of an encoded frame body.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BodyHeader {
    src: MacAddr,
    dst: MacAddr,
    size: u32,
    payload_len: u32,
}

impl BodyHeader {
    pub(crate) const LEN: usize = 6 + 6 + 4 + 4;

    /// Reads the header from `src`, which must hold at least [`Self::LEN`] bytes.
    pub(crate) fn read(src: &mut BytesMut) -> Result<Self, Error> {
        let mut mac = [0u8; 6];
        src.copy_to_slice(&mut mac);
        let src_mac = MacAddr(mac);
        src.copy_to_slice(&mut mac);
        let dst_mac = MacAddr(mac);

        let size = src.get_u32();
        let payload_len = src.get_u32();
        if payload_len as usize > MAX_PAYLOAD_SIZE {
            return Err(Error::PayloadTooLarge(payload_len as usize));
        }

        Ok(Self { src: src_mac, dst: dst_mac, size, payload_len })
    }

    #[inline]
    pub(crate) fn payload_len(&self) -> usize {
        self.payload_len as usize
    }

    /// Completes the frame with its payload. The scheduled time starts at the decoding instant.
    pub(crate) fn into_frame(self, payload: Bytes) -> Frame {
        Frame {
            src: self.src,
            dst: self.dst,
            size: self.size,
            payload,
            scheduled_time: Instant::now(),
        }
    }
}

#[derive(Debug, Default)]
enum State {
    #[default]
    Header,
    Payload(BodyHeader),
}

/// Codec for a stream of bare [`Frame`]s, used on redirection sockets.
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

impl Decoder for Codec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                State::Header => {
                    if src.len() < 1 + BodyHeader::LEN {
                        return Ok(None);
                    }

                    let wire_id = src.get_u8();
                    if wire_id != WIRE_ID {
                        return Err(Error::WireId(wire_id));
                    }

                    self.state = State::Payload(BodyHeader::read(src)?);
                }
                State::Payload(header) => {
                    if src.len() < header.payload_len() {
                        src.reserve(header.payload_len() - src.len());
                        return Ok(None);
                    }

                    let payload = src.split_to(header.payload_len()).freeze();

                    self.state = State::Header;
                    return Ok(Some(header.into_frame(payload)));
                }
            }
        }
    }
}

impl Encoder<Frame> for Codec {
    type Error = Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::PayloadTooLarge(item.payload.len()));
        }

        dst.reserve(1 + item.body_len());
        dst.put_u8(WIRE_ID);
        item.put_body(dst);

        Ok(())
    }
}
