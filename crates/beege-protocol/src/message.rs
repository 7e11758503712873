//! Decoded command and result messages.

use std::fmt;

use bytes::Bytes;

use crate::codec::ProtocolError;

/// Outcome carried by a result frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    /// Encoded as `"0"`
    Success,

    /// Encoded as `"1"`
    Failure,
}

impl ResultCode {
    /// Returns the wire token for this code.
    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::Success => "0",
            Self::Failure => "1",
        }
    }

    /// Parses a wire token. Anything other than `"0"` or `"1"` is rejected.
    pub fn from_wire(token: &[u8]) -> Result<Self, ProtocolError> {
        match token {
            b"0" => Ok(Self::Success),
            b"1" => Ok(Self::Failure),
            other => Err(ProtocolError::InvalidResultCode(
                String::from_utf8_lossy(other).into_owned(),
            )),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("SUCCESS"),
            Self::Failure => f.write_str("FAILURE"),
        }
    }
}

/// A request or fire-and-forget command: `"<payload> <name>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub payload: Bytes,
}

/// A reply to a request: `"<payload> <code> <name>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub name: String,
    pub code: ResultCode,
    pub payload: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_code_wire_tokens() {
        assert_eq!(ResultCode::Success.as_wire(), "0");
        assert_eq!(ResultCode::Failure.as_wire(), "1");
        assert_eq!(ResultCode::from_wire(b"0").unwrap(), ResultCode::Success);
        assert_eq!(ResultCode::from_wire(b"1").unwrap(), ResultCode::Failure);
    }

    #[test]
    fn test_result_code_rejects_other_tokens() {
        for token in [&b""[..], b"2", b"00", b"ok"] {
            assert!(matches!(
                ResultCode::from_wire(token),
                Err(ProtocolError::InvalidResultCode(_))
            ));
        }
    }
}
