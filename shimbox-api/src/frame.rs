//! Length-prefixed MessagePack framing
//!
//! A frame is a 4-byte big-endian body length followed by the
//! MessagePack-encoded body. The blocking helpers here are used by the guest;
//! the host reads the same layout asynchronously.

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Largest body accepted on either side of the channel
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Errors raised while encoding, decoding or moving frames
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Channel I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Deserialization failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("Frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
}

/// Encode `message` into a complete frame (prefix included)
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    let body = rmp_serde::to_vec(message)?;
    check_len(body.len())?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode a frame body (prefix already stripped)
pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ProtocolError> {
    Ok(rmp_serde::from_slice(body)?)
}

/// Validate a length prefix
pub fn check_len(len: usize) -> Result<(), ProtocolError> {
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    Ok(())
}

/// Write one frame and flush
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<(), ProtocolError> {
    let frame = encode_frame(message)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame, blocking until it is complete
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T, ProtocolError> {
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix)?;
    let len = u32::from_be_bytes(prefix) as usize;
    check_len(len)?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    decode_body(&body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Request, Response};
    use crate::value::NativeResultCode;
    use std::io::Cursor;

    #[test]
    fn test_frame_through_buffer() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &Request::Ping).unwrap();
        write_frame(&mut buffer, &Response::code(NativeResultCode::Success)).unwrap();

        let mut cursor = Cursor::new(buffer);
        let request: Request = read_frame(&mut cursor).unwrap();
        let response: Response = read_frame(&mut cursor).unwrap();
        assert_eq!(request, Request::Ping);
        assert_eq!(response, Response::code(NativeResultCode::Success));
    }

    #[test]
    fn test_oversized_prefix_rejected() {
        let prefix = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes();
        let mut cursor = Cursor::new(prefix.to_vec());
        let result: Result<Request, _> = read_frame(&mut cursor);
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_truncated_frame_is_io_error() {
        let mut frame = encode_frame(&Request::Ping).unwrap();
        frame.pop();
        let mut cursor = Cursor::new(frame);
        let result: Result<Request, _> = read_frame(&mut cursor);
        assert!(matches!(result, Err(ProtocolError::Io(_))));
    }
}
