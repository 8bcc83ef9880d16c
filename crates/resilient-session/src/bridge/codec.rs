//! Length-prefixed JSON framing for the session channel.
//!
//! A frame is a 4-byte big-endian body length followed by one JSON document.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

const LENGTH_FIELD_BYTES: usize = 4;

/// Upper bound on a frame body. Envelopes are small control messages;
/// anything bigger is treated as a corrupted stream.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("malformed frame body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("outbound frame of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },
}

/// Frames `T` values as JSON. Oversized inbound frames fail the read.
pub struct JsonCodec<T> {
    frames: LengthDelimitedCodec,
    max_frame_bytes: usize,
    _item: PhantomData<fn() -> T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self::with_max_frame_bytes(MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .length_field_length(LENGTH_FIELD_BYTES)
                .max_frame_length(max_frame_bytes)
                .new_codec(),
            max_frame_bytes,
            _item: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>, FrameError> {
        match self.frames.decode(src)? {
            Some(body) => Ok(Some(serde_json::from_slice(&body)?)),
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = FrameError;

    /// Serializes straight into `dst` behind a placeholder length, then
    /// patches the length in.
    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), FrameError> {
        let start = dst.len();
        dst.put_u32(0);
        if let Err(e) = serde_json::to_writer((&mut *dst).writer(), &item) {
            dst.truncate(start);
            return Err(e.into());
        }

        let size = dst.len() - start - LENGTH_FIELD_BYTES;
        let length = match u32::try_from(size) {
            Ok(length) if size <= self.max_frame_bytes => length,
            _ => {
                dst.truncate(start);
                return Err(FrameError::TooLarge {
                    size,
                    max: self.max_frame_bytes,
                });
            }
        };
        dst[start..start + LENGTH_FIELD_BYTES].copy_from_slice(&length.to_be_bytes());
        tracing::trace!(size, "Encoded frame");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{Envelope, Metadata};

    fn lifecycle(event: &str) -> Envelope {
        Envelope {
            name: "lifecycle".to_string(),
            args: serde_json::json!({ "event": event }),
            metadata: None,
        }
    }

    #[test]
    fn frame_carries_length_prefix() {
        let mut codec = JsonCodec::<Envelope>::new();
        let mut buf = BytesMut::new();
        codec.encode(lifecycle("booting"), &mut buf).unwrap();

        let declared = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(declared, buf.len() - LENGTH_FIELD_BYTES);
    }

    #[test]
    fn back_to_back_frames_decode_in_order() {
        let mut codec = JsonCodec::<Envelope>::new();
        let mut buf = BytesMut::new();
        codec.encode(lifecycle("one"), &mut buf).unwrap();
        codec.encode(lifecycle("two"), &mut buf).unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.args["event"], "one");
        assert_eq!(second.args["event"], "two");
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = JsonCodec::<Envelope>::new();
        let mut buf = BytesMut::new();

        let envelope = Envelope {
            name: "update_polling_interval".to_string(),
            args: serde_json::json!({"newPollingIntervalSeconds": 5}),
            metadata: Some(Metadata::request("abc")),
        };
        codec.encode(envelope, &mut buf).unwrap();

        let mut head = buf.split_to(buf.len() / 2);
        assert!(codec.decode(&mut head).unwrap().is_none());

        head.unsplit(buf);
        let decoded = codec.decode(&mut head).unwrap().unwrap();
        assert_eq!(decoded.name, "update_polling_interval");
        assert_eq!(decoded.metadata, Some(Metadata::request("abc")));
    }

    #[test]
    fn garbage_body_is_malformed() {
        let mut codec = JsonCodec::<Envelope>::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&3u32.to_be_bytes());
        buf.extend_from_slice(b"{{{");

        assert!(matches!(
            codec.decode(&mut buf).unwrap_err(),
            FrameError::Json(_)
        ));
    }

    #[test]
    fn oversized_frames_are_refused_both_ways() {
        let mut codec = JsonCodec::<Envelope>::with_max_frame_bytes(32);
        let mut buf = BytesMut::from(&b"keep"[..]);
        let err = codec
            .encode(lifecycle(&"x".repeat(64)), &mut buf)
            .unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { max: 32, .. }));
        assert_eq!(&buf[..], b"keep");

        let mut inbound = BytesMut::new();
        inbound.extend_from_slice(&64u32.to_be_bytes());
        inbound.extend_from_slice(&[b' '; 64]);
        assert!(matches!(
            codec.decode(&mut inbound).unwrap_err(),
            FrameError::Io(_)
        ));
    }
}
