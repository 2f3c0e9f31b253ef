//! Length-prefixed CBOR framing for the tunnel control stream.
//!
//! Wire format: `[4-byte big-endian length][CBOR payload]`

use crate::error::{TunnelError, TunnelResult};
use ciborium::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Cursor;

/// Largest payload accepted by [`FrameDecoder`].
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Encode a serializable value into a length-prefixed CBOR frame.
pub fn frame_encode<T: Serialize>(value: &T) -> TunnelResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(TunnelError::Codec(format!(
            "frame of {} bytes exceeds limit",
            payload.len()
        )));
    }

    let len = payload.len() as u32;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend(payload);
    Ok(frame)
}

/// Decode a CBOR payload (without length prefix) into a typed value.
pub fn cbor_decode<T: DeserializeOwned>(data: &[u8]) -> TunnelResult<T> {
    let value: T = ciborium::from_reader(Cursor::new(data))?;
    Ok(value)
}

/// Convert a message into the generic body carried by RPC frames.
pub fn to_value<T: Serialize>(value: &T) -> TunnelResult<Value> {
    Ok(Value::serialized(value)?)
}

/// Convert an RPC frame body back into a typed message.
pub fn from_value<T: DeserializeOwned>(value: &Value) -> TunnelResult<T> {
    value
        .deserialized()
        .map_err(|e| TunnelError::Protocol(format!("malformed message body: {e}")))
}

/// Streaming frame decoder: accumulates bytes and yields complete messages.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed bytes into the decoder and return all complete CBOR-decoded messages.
    pub fn feed<T: DeserializeOwned>(&mut self, data: &[u8]) -> TunnelResult<Vec<T>> {
        self.buffer.extend_from_slice(data);
        let mut messages = Vec::new();

        while self.buffer.len() >= 4 {
            let len = u32::from_be_bytes([
                self.buffer[0],
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
            ]) as usize;
            if len > MAX_FRAME_LEN {
                return Err(TunnelError::Codec(format!(
                    "incoming frame of {len} bytes exceeds limit"
                )));
            }
            if self.buffer.len() < 4 + len {
                break;
            }

            messages.push(cbor_decode(&self.buffer[4..4 + len])?);
            self.buffer.drain(..4 + len);
        }

        Ok(messages)
    }

    /// Number of bytes remaining in the internal buffer.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
