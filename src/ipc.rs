//! Length-prefixed message framing for subsystem pipes.
//!
//! Frame layout: magic, body length, crc32c of the body (all u32
//! little-endian), then a JSON body. One pipe per subsystem boundary;
//! the core event loop drains them all.

use std::io::{Read, Write};

use crc32c::crc32c;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::{Error, Result};

const FRAME_MAGIC: u32 = 0x4445_3150; // "DE1P"
const FRAME_HEADER_LEN: usize = 12;
/// Payloads are small JSON; anything past this is a framing error, not
/// a message.
const MAX_BODY_BYTES: usize = 1 << 20;

pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(message)
        .map_err(|e| Error::Transport(format!("frame encode: {e}")))?;
    if body.len() > MAX_BODY_BYTES {
        return Err(Error::Transport(format!(
            "frame body too large ({} bytes)",
            body.len()
        )));
    }
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    buf.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(&crc32c(&body).to_le_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

pub fn write_frame<T: Serialize, W: Write>(writer: &mut W, message: &T) -> Result<()> {
    let frame = encode_frame(message)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame; `None` at clean end-of-stream.
pub fn read_frame<T: DeserializeOwned, R: Read>(reader: &mut R) -> Result<Option<T>> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    match read_exact_or_eof(reader, &mut header)? {
        ReadOutcome::Eof => return Ok(None),
        ReadOutcome::Full => {}
    }

    let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if magic != FRAME_MAGIC {
        return Err(Error::Transport(format!(
            "frame magic mismatch: {magic:#010x}"
        )));
    }
    let length = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if length == 0 || length > MAX_BODY_BYTES {
        return Err(Error::Transport(format!("frame length invalid: {length}")));
    }
    let expected_crc = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body)?;
    let actual_crc = crc32c(&body);
    if actual_crc != expected_crc {
        return Err(Error::Transport(format!(
            "frame crc mismatch: expected {expected_crc:#010x}, got {actual_crc:#010x}"
        )));
    }
    let message = serde_json::from_slice(&body)
        .map_err(|e| Error::Transport(format!("frame decode: {e}")))?;
    Ok(Some(message))
}

enum ReadOutcome {
    Full,
    Eof,
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(ReadOutcome::Eof);
            }
            return Err(Error::Transport("truncated frame header".to_string()));
        }
        filled += n;
    }
    Ok(ReadOutcome::Full)
}
