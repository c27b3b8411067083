//! Envelope framing for the message protocol.
//!
//! A frame is a 4-byte big-endian length followed by the bincode encoding of a
//! [`WireEnvelope`]. Only `kind` and `value` are on the wire; hashes,
//! timestamps and senders are derived by the receiver.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};
use weft_core::constants::MAX_FRAME_SIZE;
use weft_core::error::NetworkError;
use weft_core::types::MessageType;

/// Wire schema of one envelope.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct WireEnvelope {
    pub kind: MessageType,
    pub value: Vec<u8>,
}

fn bincode_config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<{ MAX_FRAME_SIZE }>()
}

/// Encode a wire envelope into a frame payload (without the length prefix).
pub fn encode(wire: &WireEnvelope) -> Result<Vec<u8>, NetworkError> {
    bincode::encode_to_vec(wire, bincode_config())
        .map_err(|e| NetworkError::SendFailure(format!("encode error: {e}")))
}

/// Decode a frame payload. Rejects schema violations and trailing bytes.
pub fn decode(payload: &[u8]) -> Result<WireEnvelope, NetworkError> {
    let (wire, read): (WireEnvelope, usize) =
        bincode::decode_from_slice(payload, bincode_config())
            .map_err(|e| NetworkError::MalformedFrame(e.to_string()))?;
    if read != payload.len() {
        return Err(NetworkError::MalformedFrame(format!(
            "{} trailing bytes",
            payload.len() - read
        )));
    }
    Ok(wire)
}

/// Length-delimited [`WireEnvelope`] codec for `FramedRead` / `FramedWrite`.
#[derive(Debug)]
pub struct EnvelopeCodec {
    frames: LengthDelimitedCodec,
    max_frame_size: usize,
}

impl EnvelopeCodec {
    pub fn new(max_frame_size: usize) -> Self {
        let frames = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .big_endian()
            .max_frame_length(max_frame_size)
            .new_codec();
        Self {
            frames,
            max_frame_size,
        }
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl Decoder for EnvelopeCodec {
    type Item = WireEnvelope;
    type Error = NetworkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.frames.decode(src)? {
            Some(frame) => decode(&frame).map(Some),
            None => Ok(None),
        }
    }
}

impl Encoder<WireEnvelope> for EnvelopeCodec {
    type Error = NetworkError;

    fn encode(&mut self, item: WireEnvelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = encode(&item)?;
        if payload.len() > self.max_frame_size {
            return Err(NetworkError::FrameTooLarge {
                size: payload.len(),
                max: self.max_frame_size,
            });
        }
        self.frames.encode(Bytes::from(payload), dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(value: &[u8]) -> WireEnvelope {
        WireEnvelope {
            kind: MessageType::Transaction,
            value: value.to_vec(),
        }
    }

    #[test]
    fn encoding_is_deterministic() {
        assert_eq!(encode(&wire(b"abc")).unwrap(), encode(&wire(b"abc")).unwrap());
    }

    #[test]
    fn payload_decodes_to_same_envelope() {
        let original = WireEnvelope {
            kind: MessageType::SmartContract,
            value: vec![0xAA; 300],
        };
        let decoded = decode(&encode(&original).unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn garbage_is_malformed() {
        let err = decode(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF]).unwrap_err();
        assert!(matches!(err, NetworkError::MalformedFrame(_)));
    }

    #[test]
    fn empty_payload_is_malformed() {
        assert!(matches!(decode(&[]), Err(NetworkError::MalformedFrame(_))));
    }

    #[test]
    fn trailing_bytes_are_malformed() {
        let mut payload = encode(&wire(b"x")).unwrap();
        payload.push(0);
        let err = decode(&payload).unwrap_err();
        assert_eq!(err, NetworkError::MalformedFrame("1 trailing bytes".into()));
    }

    #[test]
    fn frame_has_big_endian_length_prefix() {
        let mut codec = EnvelopeCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(wire(b"hello"), &mut buf).unwrap();
        let payload_len = encode(&wire(b"hello")).unwrap().len();
        assert_eq!(&buf[..4], &(payload_len as u32).to_be_bytes());
        assert_eq!(buf.len(), 4 + payload_len);
    }

    #[test]
    fn decoder_waits_for_complete_frame() {
        let mut codec = EnvelopeCodec::default();
        let mut full = BytesMut::new();
        codec.encode(wire(b"partial"), &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[full.len() - 1..]);
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(wire(b"partial")));
    }

    #[test]
    fn decoder_yields_frames_in_order() {
        let mut codec = EnvelopeCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(wire(b"first"), &mut buf).unwrap();
        codec.encode(wire(b"second"), &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(wire(b"first")));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(wire(b"second")));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn oversized_frame_rejected_on_encode() {
        let mut codec = EnvelopeCodec::new(16);
        let mut buf = BytesMut::new();
        let err = codec.encode(wire(&[0u8; 64]), &mut buf).unwrap_err();
        assert!(matches!(err, NetworkError::FrameTooLarge { max: 16, .. }));
    }

    #[test]
    fn oversized_frame_rejected_on_decode() {
        let mut codec = EnvelopeCodec::new(16);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&1024u32.to_be_bytes());
        buf.extend_from_slice(&[0u8; 32]);
        assert!(matches!(codec.decode(&mut buf), Err(NetworkError::MalformedFrame(_))));
    }
}
