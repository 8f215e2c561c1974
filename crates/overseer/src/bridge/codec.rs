//! Framed codec for worker communication.
//!
//! Uses LengthDelimitedCodec for framing + serde_json for serialization.
//! Works over any AsyncRead/AsyncWrite (pipes, sockets, in-memory duplex).
//!
//! Decoding is two-level: a broken length prefix or IO failure is fatal for
//! the stream, but a frame whose body is not a valid message is yielded as an
//! `Err` item so the reader can log it and keep going.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::protocol::ProtocolError;

/// Largest frame accepted in either direction.
pub const MAX_FRAME_BYTES: usize = 32 * 1024 * 1024;

/// Codec that frames messages with length prefix and serializes with JSON.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(MAX_FRAME_BYTES)
                .new_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = Result<T, ProtocolError>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).map_err(ProtocolError::from),
            )),
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let json_len = json.len();
        tracing::trace!(json_size_bytes = json_len, "Encoding frame");
        if json_len > 1_000_000 {
            tracing::info!(
                json_size_bytes = json_len,
                json_size_kb = json_len / 1024,
                "Large frame being encoded"
            );
        }
        self.inner.encode(Bytes::from(json), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{Body, Message, MessageId, Request, RequestKind};
    use tokio_util::bytes::BufMut;

    fn request(kind: &str) -> Message {
        Message {
            id: MessageId::new("m-1"),
            timestamp: 42,
            body: Body::Request(Request {
                kind: RequestKind::parse(kind).unwrap(),
                payload: serde_json::json!({"x": 1}),
            }),
        }
    }

    #[test]
    fn codec_carries_message() {
        let mut codec = JsonCodec::<Message>::new();
        let mut buf = BytesMut::new();

        codec.encode(request("agent:list"), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap().unwrap();

        assert_eq!(decoded, request("agent:list"));
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = JsonCodec::<Message>::new();
        let mut full = BytesMut::new();
        codec.encode(request("task:process"), &mut full).unwrap();

        let mut partial = full.split_to(full.len() - 3);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full);
        assert!(codec.decode(&mut partial).unwrap().unwrap().is_ok());
    }

    #[test]
    fn invalid_body_is_item_error_not_stream_error() {
        let mut codec = JsonCodec::<Message>::new();
        let mut buf = BytesMut::new();

        let garbage = br#"{"kind": "", "id": "x", "timestamp": 0}"#;
        buf.put_u32(garbage.len() as u32);
        buf.extend_from_slice(garbage);
        codec.encode(request("agent:list"), &mut buf).unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(first, Err(ProtocolError::Malformed(_))));

        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert!(second.is_ok());
    }
}
