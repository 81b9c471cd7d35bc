//! The byte-transparent message codec.
//!
//! A gRPC server normally refuses methods it has no generated stub for
//! because it cannot decode their arguments. [`RawCodec`] lifts that
//! restriction: it treats every message frame as an opaque byte buffer, so
//! a handler can receive frames for methods it has never seen declared and
//! forward them untouched. The outbound hop uses the same codec, which
//! re-emits the identical bytes.
//!
//! Typed control traffic (the signup exchange in [`crate::proto`]) does not
//! go through this codec; it is decoded by [`tonic::codec::ProstCodec`] on
//! the signup path. Failures there surface as marshalling [`Status`]
//! errors, never as a panic. The pass-through path itself cannot fail.

use bytes::{Buf, BufMut, Bytes};
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::Status;

/// A single message frame, carried through the proxy unparsed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    pub payload: Bytes,
}

impl Frame {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Frame {
            payload: payload.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Codec that moves [`Frame`]s in and out of gRPC message framing without
/// inspecting, validating, or re-encoding them.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec for RawCodec {
    type Encode = Frame;
    type Decode = Frame;

    type Encoder = RawEncoder;
    type Decoder = RawDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        RawEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        RawDecoder
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RawEncoder;

impl Encoder for RawEncoder {
    type Item = Frame;
    type Error = Status;

    fn encode(&mut self, item: Frame, dst: &mut EncodeBuf<'_>) -> Result<(), Status> {
        dst.put(item.payload);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RawDecoder;

impl Decoder for RawDecoder {
    type Item = Frame;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Frame>, Status> {
        // The runtime hands over exactly one length-delimited message at a
        // time; splitting it off the receive buffer does not copy.
        let payload = src.copy_to_bytes(src.remaining());
        Ok(Some(Frame { payload }))
    }
}
