//! Frame codec: 12-byte headers plus length-delimited payloads.
//!
//! Layout (both directions, little-endian):
//!   [0..4]   magic ("GLCI" for commands, "GLCO" for responses)
//!   [4..8]   command id / result code (u32)
//!   [8..12]  payload length (u32)
//!   [12..]   payload

use crate::error::{Error, TransportError};
use crate::protocol::{
    write_u32_le, ResultCode, COMMAND_MAGIC, HEADER_LEN, MAX_CHUNK, MAX_PAYLOAD, RESPONSE_MAGIC,
};
use crate::transport::Transport;

/// One decoded command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    pub command_id: u32,
    pub payload: Vec<u8>,
}

/// Outcome of reading one command from the stream.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    Command(CommandFrame),
    /// Payload exceeded `MAX_PAYLOAD`; it was drained so the stream stays aligned.
    Oversized { command_id: u32, length: usize },
}

/// A response ready to be framed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: ResultCode,
    pub payload: Vec<u8>,
}

impl Response {
    pub fn ok(payload: Vec<u8>) -> Self {
        Response {
            code: ResultCode::Ok,
            payload,
        }
    }

    pub fn error(code: ResultCode) -> Self {
        Response {
            code,
            payload: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_response(self.code, &self.payload)
    }
}

fn split_header(header: &[u8; HEADER_LEN]) -> ([u8; 4], u32, usize) {
    let magic = [header[0], header[1], header[2], header[3]];
    let word = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    let length = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
    (magic, word, length as usize)
}

fn frame(magic: [u8; 4], word: u32, payload: &[u8]) -> Vec<u8> {
    // Payloads are bounded by MAX_PAYLOAD long before u32 overflows.
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&magic);
    write_u32_le(&mut buf, word);
    write_u32_le(&mut buf, payload.len() as u32);
    buf.extend_from_slice(payload);
    buf
}

/// Read and throw away `length` bytes in bounded pieces.
fn drain<T: Transport + ?Sized>(transport: &mut T, mut length: usize) -> Result<(), TransportError> {
    let mut scratch = vec![0u8; length.min(MAX_CHUNK)];
    while length > 0 {
        let n = length.min(scratch.len());
        transport.read_exact(&mut scratch[..n])?;
        length -= n;
    }
    Ok(())
}

/// Read exactly one command frame.
///
/// A magic mismatch is returned as `Error::BadMagic`: without a delimiter
/// there is no way to find the next frame, so the caller must end the session.
pub fn decode_command<T: Transport + ?Sized>(transport: &mut T) -> Result<Decoded, Error> {
    let mut header = [0u8; HEADER_LEN];
    transport.read_exact(&mut header)?;

    let (magic, command_id, length) = split_header(&header);
    if magic != COMMAND_MAGIC {
        return Err(Error::BadMagic(magic));
    }

    if length > MAX_PAYLOAD {
        drain(transport, length)?;
        return Ok(Decoded::Oversized { command_id, length });
    }

    let mut payload = vec![0u8; length];
    transport.read_exact(&mut payload)?;
    Ok(Decoded::Command(CommandFrame {
        command_id,
        payload,
    }))
}

/// Frame a response. The length field is always derived from `payload`.
pub fn encode_response(code: ResultCode, payload: &[u8]) -> Vec<u8> {
    frame(RESPONSE_MAGIC, code as u32, payload)
}

/// Frame a command (client side; used by tools and tests).
pub fn encode_command(command_id: u32, payload: &[u8]) -> Vec<u8> {
    frame(COMMAND_MAGIC, command_id, payload)
}

/// Read exactly one response frame (client side).
pub fn read_response<T: Transport + ?Sized>(transport: &mut T) -> Result<Response, Error> {
    let mut header = [0u8; HEADER_LEN];
    transport.read_exact(&mut header)?;

    let (magic, code, length) = split_header(&header);
    if magic != RESPONSE_MAGIC {
        return Err(Error::BadMagic(magic));
    }
    let code = ResultCode::from_u32(code).ok_or(Error::BadResultCode(code))?;

    let mut payload = vec![0u8; length];
    transport.read_exact(&mut payload)?;
    Ok(Response { code, payload })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    #[test]
    fn decodes_one_frame_and_leaves_the_next() {
        let mut input = encode_command(0x03, b"abc");
        input.extend_from_slice(&encode_command(0x01, &[]));
        let mut t = MemoryTransport::new(input);

        let first = decode_command(&mut t).unwrap();
        assert_eq!(
            first,
            Decoded::Command(CommandFrame {
                command_id: 0x03,
                payload: b"abc".to_vec(),
            })
        );
        assert_eq!(t.remaining(), HEADER_LEN);
    }

    #[test]
    fn header_layout_is_fixed() {
        let bytes = encode_response(ResultCode::NoSuchPath, &[7, 8]);
        assert_eq!(&bytes[0..4], b"GLCO");
        assert_eq!(&bytes[4..8], &0xBAF6u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &2u32.to_le_bytes());
        assert_eq!(&bytes[12..], &[7, 8]);
    }

    #[test]
    fn bad_magic_is_fatal() {
        let mut input = encode_command(0x01, &[]);
        input[0] = b'X';
        let mut t = MemoryTransport::new(input);
        match decode_command(&mut t) {
            Err(Error::BadMagic(magic)) => assert_eq!(&magic, b"XLCI"),
            other => panic!("expected BadMagic, got {other:?}"),
        }
    }

    #[test]
    fn oversized_payload_is_drained() {
        let length = MAX_PAYLOAD + 5;
        let mut input = Vec::new();
        input.extend_from_slice(&COMMAND_MAGIC);
        write_u32_le(&mut input, 0x0D);
        write_u32_le(&mut input, length as u32);
        input.resize(HEADER_LEN + length, 0xAA);
        input.extend_from_slice(&encode_command(0x01, &[]));
        let mut t = MemoryTransport::new(input);

        assert_eq!(
            decode_command(&mut t).unwrap(),
            Decoded::Oversized {
                command_id: 0x0D,
                length,
            }
        );
        // The following frame is still aligned.
        assert!(matches!(
            decode_command(&mut t).unwrap(),
            Decoded::Command(CommandFrame { command_id: 0x01, .. })
        ));
    }

    #[test]
    fn truncated_payload_is_a_transport_error() {
        let mut input = encode_command(0x03, b"abcdef");
        input.truncate(HEADER_LEN + 2);
        let mut t = MemoryTransport::new(input);
        assert!(matches!(
            decode_command(&mut t),
            Err(Error::Transport(TransportError::Disconnected))
        ));
    }

    #[test]
    fn response_round_trips_through_client_reader() {
        let mut t = MemoryTransport::new(Response::ok(vec![1, 2, 3]).encode());
        let response = read_response(&mut t).unwrap();
        assert_eq!(response, Response::ok(vec![1, 2, 3]));
    }
}
