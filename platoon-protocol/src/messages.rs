//! Control messages and framing for vehicle-to-vehicle links.

use std::io::{Read, Write};
use thiserror::Error;

/// Largest payload a vehicle link frame may declare.
pub const MAX_FRAME_LEN: usize = 64;

/// Size of the big-endian length prefix.
pub(crate) const LEN_PREFIX: usize = 4;

/// Quoted tag payloads
mod tag {
    pub const ACCELERATE: &[u8] = b"\"A\"";
    pub const DECELERATE: &[u8] = b"\"D\"";
    pub const STOP: &[u8] = b"\"S\"";
    pub const QUIT: &[u8] = b"\"Q\"";
}

/// Protocol error types
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// I/O error during read/write
    #[error("I/O error: {0}")]
    Io(std::io::Error),
    /// Peer closed the stream
    #[error("connection closed")]
    ConnectionClosed,
    /// Declared frame length exceeds [`MAX_FRAME_LEN`]
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
    /// Frame payload is neither a known tag nor a finite number
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    /// Broker sent something other than a decimal vehicle ID
    #[error("invalid vehicle id: {0:?}")]
    InvalidIdentity(String),
    /// Broker sent a peer table that does not parse
    #[error("invalid peer table: {0}")]
    InvalidTable(#[source] serde_json::Error),
    /// Broker sent something other than a decimal start position
    #[error("invalid start position: {0:?}")]
    InvalidStartPosition(String),
    /// A report could not be encoded or decoded
    #[error("invalid report: {0}")]
    InvalidReport(#[source] serde_json::Error),
    /// Broker answered a report with something other than `ACK`
    #[error("unexpected acknowledgment: {0:?}")]
    UnexpectedAck(Vec<u8>),
}

impl ProtocolError {
    /// True if this is a read deadline expiring rather than a failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProtocolError::Io(e) if crate::socket::is_timeout(e))
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::ConnectionClosed
        } else {
            ProtocolError::Io(e)
        }
    }
}

/// Messages exchanged between neighbouring vehicles
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlMessage {
    Accelerate,
    Decelerate,
    Stop,
    Quit,
    /// Position sample of the sending vehicle
    Position(f64),
}

impl ControlMessage {
    /// Payload bytes without the length prefix
    pub fn payload(&self) -> Vec<u8> {
        match self {
            ControlMessage::Accelerate => tag::ACCELERATE.to_vec(),
            ControlMessage::Decelerate => tag::DECELERATE.to_vec(),
            ControlMessage::Stop => tag::STOP.to_vec(),
            ControlMessage::Quit => tag::QUIT.to_vec(),
            ControlMessage::Position(value) => value.to_string().into_bytes(),
        }
    }

    /// Parse a payload (without the length prefix)
    pub fn from_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        match payload {
            tag::ACCELERATE => return Ok(ControlMessage::Accelerate),
            tag::DECELERATE => return Ok(ControlMessage::Decelerate),
            tag::STOP => return Ok(ControlMessage::Stop),
            tag::QUIT => return Ok(ControlMessage::Quit),
            _ => {}
        }

        let text = std::str::from_utf8(payload)
            .map_err(|_| ProtocolError::InvalidPayload(format!("{:02X?}", payload)))?;
        match text.trim().parse::<f64>() {
            Ok(value) if value.is_finite() => Ok(ControlMessage::Position(value)),
            _ => Err(ProtocolError::InvalidPayload(text.to_string())),
        }
    }

    /// Encode message to wire format
    pub fn encode(&self) -> Vec<u8> {
        let payload = self.payload();

        // Format: [len:u32-BE][payload...]
        let len = payload.len() as u32;
        let mut result = Vec::with_capacity(LEN_PREFIX + payload.len());
        result.extend(&len.to_be_bytes());
        result.extend(&payload);
        result
    }

    /// Decode one complete frame from the front of `data`.
    ///
    /// Returns the message and the number of bytes consumed.
    pub fn decode(data: &[u8]) -> Result<(ControlMessage, usize), ProtocolError> {
        match split_frame(data)? {
            Some((payload, consumed)) => Ok((ControlMessage::from_payload(payload)?, consumed)),
            None => Err(ProtocolError::InvalidPayload(format!(
                "incomplete frame: have {} bytes",
                data.len()
            ))),
        }
    }

    /// Write message to a writer
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), ProtocolError> {
        let encoded = self.encode();
        writer.write_all(&encoded)?;
        writer.flush()?;
        Ok(())
    }

    /// Read message from a reader (blocking)
    pub fn read_from<R: Read>(reader: &mut R) -> Result<ControlMessage, ProtocolError> {
        let mut len_buf = [0u8; LEN_PREFIX];
        reader.read_exact(&mut len_buf)?;
        let len = u32::from_be_bytes(len_buf) as usize;

        if len > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge(len));
        }

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;
        ControlMessage::from_payload(&payload)
    }
}

/// Split the first complete frame off `data`.
///
/// Returns `Ok(None)` while the frame is still incomplete. An oversized
/// length prefix is an error since the stream cannot be resynchronised.
pub(crate) fn split_frame(data: &[u8]) -> Result<Option<(&[u8], usize)>, ProtocolError> {
    if data.len() < LEN_PREFIX {
        return Ok(None);
    }

    let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }

    let total_len = LEN_PREFIX + len;
    if data.len() < total_len {
        return Ok(None);
    }
    Ok(Some((&data[LEN_PREFIX..total_len], total_len)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_tags() {
        for msg in [
            ControlMessage::Accelerate,
            ControlMessage::Decelerate,
            ControlMessage::Stop,
            ControlMessage::Quit,
        ] {
            let encoded = msg.encode();
            let (decoded, len) = ControlMessage::decode(&encoded).unwrap();
            assert_eq!(decoded, msg);
            assert_eq!(len, encoded.len());
        }
    }

    #[test]
    fn test_encode_decode_position() {
        for value in [0.0, 100.0, 412.75, 1049.999_871_2, 123_456.000_001] {
            let encoded = ControlMessage::Position(value).encode();
            match ControlMessage::decode(&encoded).unwrap() {
                (ControlMessage::Position(decoded), _) => {
                    assert!((decoded - value).abs() < 1e-9, "{} != {}", decoded, value)
                }
                (other, _) => panic!("expected a position, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_wire_format() {
        // [len:u32-BE]["Q"]
        assert_eq!(
            ControlMessage::Quit.encode(),
            vec![0x00, 0x00, 0x00, 0x03, b'"', b'Q', b'"']
        );
        assert_eq!(
            ControlMessage::Position(400.0).encode(),
            vec![0x00, 0x00, 0x00, 0x03, b'4', b'0', b'0']
        );
    }

    #[test]
    fn test_declared_length_matches_payload() {
        let encoded = ControlMessage::Position(250.125).encode();
        let len = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]) as usize;
        assert_eq!(len, encoded.len() - LEN_PREFIX);
    }

    #[test]
    fn test_accepts_python_style_float() {
        assert_eq!(
            ControlMessage::from_payload(b"400.0").unwrap(),
            ControlMessage::Position(400.0)
        );
    }

    #[test]
    fn test_rejects_unknown_tag_and_garbage() {
        assert!(matches!(
            ControlMessage::from_payload(b"\"X\""),
            Err(ProtocolError::InvalidPayload(_))
        ));
        assert!(matches!(
            ControlMessage::from_payload(b"fast"),
            Err(ProtocolError::InvalidPayload(_))
        ));
        assert!(matches!(
            ControlMessage::from_payload(b"NaN"),
            Err(ProtocolError::InvalidPayload(_))
        ));
        assert!(matches!(
            ControlMessage::from_payload(&[0xff, 0xfe]),
            Err(ProtocolError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut data = 1000u32.to_be_bytes().to_vec();
        data.extend(std::iter::repeat(b'1').take(10));
        assert!(matches!(
            ControlMessage::decode(&data),
            Err(ProtocolError::FrameTooLarge(1000))
        ));
    }

    #[test]
    fn test_read_from_eof_is_connection_closed() {
        let encoded = ControlMessage::Stop.encode();
        let mut truncated = &encoded[..5];
        assert!(matches!(
            ControlMessage::read_from(&mut truncated),
            Err(ProtocolError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_read_from_sequence() {
        let mut data = ControlMessage::Accelerate.encode();
        data.extend(ControlMessage::Position(12.5).encode());
        let mut reader = &data[..];
        assert_eq!(
            ControlMessage::read_from(&mut reader).unwrap(),
            ControlMessage::Accelerate
        );
        assert_eq!(
            ControlMessage::read_from(&mut reader).unwrap(),
            ControlMessage::Position(12.5)
        );
    }
}
