//! Tokio codec for actuator frames on a byte stream.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{ActuatorFrame, FRAME_LEN};
use crate::tracing::prelude::*;

/// Puts [`ActuatorFrame`]s on the wire and reads them back.
///
/// Decoding resynchronizes on garbage: when the bytes at the head of the
/// buffer are not a well-formed frame, one byte is dropped and the search
/// continues.
#[derive(Debug, Default)]
pub struct ActuatorCodec;

impl Encoder<ActuatorFrame> for ActuatorCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: ActuatorFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(FRAME_LEN);
        dst.put_slice(frame.as_bytes());
        trace!(frame = %frame, "TX actuator");
        Ok(())
    }
}

impl Decoder for ActuatorCodec {
    type Item = ActuatorFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while src.len() >= FRAME_LEN {
            let mut candidate = [0u8; FRAME_LEN];
            candidate.copy_from_slice(&src[..FRAME_LEN]);

            if let Some(frame) = ActuatorFrame::from_bytes(candidate) {
                src.advance(FRAME_LEN);
                trace!(frame = %frame, "RX actuator");
                return Ok(Some(frame));
            }

            trace!(byte = src[0], "Skipping byte outside frame");
            src.advance(1);
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;

    fn frame(v1: i32, v2: i32, v3: i32) -> ActuatorFrame {
        ActuatorFrame::encode(&Command::new(v1, v2, v3))
    }

    #[test]
    fn encodes_exactly_five_bytes() {
        let mut codec = ActuatorCodec;
        let mut buf = BytesMut::new();
        codec.encode(frame(1, 0, 150), &mut buf).unwrap();
        assert_eq!(&buf[..], &[0x00, 0x01, 0x00, 0x64, 0xff]);
    }

    #[test]
    fn decodes_back_to_back_frames() {
        let mut codec = ActuatorCodec;
        let mut buf = BytesMut::new();
        codec.encode(frame(1, 0, 10), &mut buf).unwrap();
        codec.encode(frame(0, 1, 20), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(frame(1, 0, 10)));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(frame(0, 1, 20)));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn waits_for_partial_frame() {
        let mut codec = ActuatorCodec;
        let mut buf = BytesMut::from(&[0x00, 0x01, 0x00][..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 3);

        buf.extend_from_slice(&[0x32, 0xff]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(frame(1, 0, 50)));
    }

    #[test]
    fn resynchronizes_after_noise() {
        let mut codec = ActuatorCodec;
        let mut buf = BytesMut::from(&[0xaa, 0x55, 0x00, 0x00, 0x01, 0x07, 0xff][..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(frame(0, 1, 7)));
        assert!(buf.is_empty());
    }
}
