//! beege protocol - wire format for cluster communication
//!
//! This crate provides the length-prefixed frame codec, the command and
//! result message types, the reserved command names and the JSON payloads
//! exchanged between controller and docker nodes.

pub mod codec;
pub mod commands;
pub mod message;
pub mod payload;

pub use codec::{
    decode_command, decode_result, encode_command, encode_frame, encode_result, split_result,
    validate_command_name, FrameCodec, ProtocolError, MAX_BODY_LEN,
};
pub use message::{Command, CommandResult, ResultCode};
pub use payload::{decode_roster, encode_roster, HostStatus, PayloadError};
