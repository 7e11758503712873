//! Length-prefixed framing and command encoding.
//!
//! Every unit on the wire is a frame: a 2-byte big-endian body length
//! followed by the body. The prefix only exists to find message boundaries
//! on a stream socket, so a receiver must collect exactly `length` bytes
//! before decoding.
//!
//! ```text
//! Frame    := uint16_BE(len(Body)) Body
//! Command  := Payload 0x20 CommandName
//! Result   := Payload 0x20 ResultCode 0x20 CommandName
//! ```
//!
//! Bodies are decoded from the right: the payload may itself contain spaces
//! (JSON), command names and result codes never do.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::commands::DISCONNECT;
use crate::message::{Command, CommandResult, ResultCode};

/// Size of the frame length prefix.
pub const LENGTH_PREFIX: usize = 2;

/// Largest body a frame can carry.
pub const MAX_BODY_LEN: usize = u16::MAX as usize;

/// Separator between payload, result code and command name.
const SEPARATOR: u8 = b' ';

/// Errors raised while framing or decoding messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Frame body too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Truncated frame: expected {expected} bytes, stream ended after {received}")]
    TruncatedFrame { expected: usize, received: usize },

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Invalid result code: '{0}'")]
    InvalidResultCode(String),

    #[error("Invalid command name: '{0}'")]
    InvalidCommandName(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Checks that `name` can be sent as a command name.
///
/// Names are non-empty printable ASCII tokens without spaces. The local
/// `disconnect` pseudo-command is refused.
pub fn validate_command_name(name: &str) -> Result<(), ProtocolError> {
    let valid = !name.is_empty() && name.bytes().all(|b| b.is_ascii_graphic());
    if !valid || name == DISCONNECT {
        return Err(ProtocolError::InvalidCommandName(name.to_string()));
    }
    Ok(())
}

/// Wraps a body in a length-prefixed frame.
pub fn encode_frame(body: &[u8]) -> Result<Bytes, ProtocolError> {
    frame_from_parts(&[body])
}

/// Encodes `"<payload> <name>"` as a complete frame.
pub fn encode_command(name: &str, payload: &[u8]) -> Result<Bytes, ProtocolError> {
    validate_command_name(name)?;
    frame_from_parts(&[payload, &[SEPARATOR], name.as_bytes()])
}

/// Encodes `"<payload> <code> <name>"` as a complete frame.
pub fn encode_result(name: &str, code: ResultCode, payload: &[u8]) -> Result<Bytes, ProtocolError> {
    validate_command_name(name)?;
    frame_from_parts(&[
        payload,
        &[SEPARATOR],
        code.as_wire().as_bytes(),
        &[SEPARATOR],
        name.as_bytes(),
    ])
}

/// Decodes a command body by splitting at the rightmost space.
///
/// A body without a space, or with nothing after the last space, is a
/// [`ProtocolError::MalformedFrame`].
pub fn decode_command(body: &Bytes) -> Result<Command, ProtocolError> {
    let (payload, token) = split_last_token(body)?;
    let name = command_name(token)?;
    Ok(Command { name, payload })
}

/// Decodes a result body: the command split applied twice.
pub fn decode_result(body: &Bytes) -> Result<CommandResult, ProtocolError> {
    let command = decode_command(body)?;
    let (code, payload) = split_result(&command.payload)?;
    Ok(CommandResult {
        name: command.name,
        code,
        payload,
    })
}

/// Splits the trailing result code off an already command-decoded payload.
///
/// Used by handlers of result names that arrive through the normal command
/// dispatch (e.g. `docker_greetings_reply`).
pub fn split_result(payload: &Bytes) -> Result<(ResultCode, Bytes), ProtocolError> {
    let (rest, token) = split_last_token(payload)?;
    let code = ResultCode::from_wire(token)?;
    Ok((code, rest))
}

fn split_last_token(body: &Bytes) -> Result<(Bytes, &[u8]), ProtocolError> {
    let index = body
        .iter()
        .rposition(|b| *b == SEPARATOR)
        .ok_or_else(|| ProtocolError::MalformedFrame("no separator in body".to_string()))?;
    let token = body.get(index + 1..).unwrap_or_default();
    Ok((body.slice(..index), token))
}

fn command_name(token: &[u8]) -> Result<String, ProtocolError> {
    if token.is_empty() {
        return Err(ProtocolError::MalformedFrame(
            "empty command name".to_string(),
        ));
    }
    if !token.iter().all(u8::is_ascii_graphic) {
        return Err(ProtocolError::MalformedFrame(format!(
            "command name is not an ASCII token: {:?}",
            String::from_utf8_lossy(token)
        )));
    }
    Ok(String::from_utf8_lossy(token).into_owned())
}

fn frame_from_parts(parts: &[&[u8]]) -> Result<Bytes, ProtocolError> {
    let size: usize = parts.iter().map(|p| p.len()).sum();
    let len = u16::try_from(size).map_err(|_| ProtocolError::FrameTooLarge {
        size,
        max: MAX_BODY_LEN,
    })?;

    let mut frame = BytesMut::with_capacity(LENGTH_PREFIX + size);
    frame.put_u16(len);
    for part in parts {
        frame.extend_from_slice(part);
    }
    Ok(frame.freeze())
}

/// Frame layer for `tokio_util::codec`.
///
/// Decodes to raw frame bodies; command/result decoding is left to the
/// caller, which knows which of the two it expects.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, Self::Error> {
        let body_len = match src.get(..LENGTH_PREFIX) {
            Some(&[hi, lo]) => usize::from(u16::from_be_bytes([hi, lo])),
            _ => return Ok(None),
        };

        let frame_len = LENGTH_PREFIX + body_len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        Ok(Some(src.split_to(body_len).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if src.is_empty() {
            return Ok(None);
        }

        let expected = match src.get(..LENGTH_PREFIX) {
            Some(&[hi, lo]) => LENGTH_PREFIX + usize::from(u16::from_be_bytes([hi, lo])),
            _ => LENGTH_PREFIX,
        };
        Err(ProtocolError::TruncatedFrame {
            expected,
            received: src.len(),
        })
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, body: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = u16::try_from(body.len()).map_err(|_| ProtocolError::FrameTooLarge {
            size: body.len(),
            max: MAX_BODY_LEN,
        })?;
        dst.reserve(LENGTH_PREFIX + body.len());
        dst.put_u16(len);
        dst.extend_from_slice(&body);
        Ok(())
    }
}
