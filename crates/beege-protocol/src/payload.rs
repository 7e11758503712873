//! JSON payloads carried inside command frames.

use beege_core::{PeerTable, UnixTimestamp};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while encoding or decoding a JSON payload.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("Invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encodes a roster as the join reply payload: `{"<address>": <unix_ts>}`.
pub fn encode_roster(table: &PeerTable) -> Result<Vec<u8>, PayloadError> {
    Ok(serde_json::to_vec(table)?)
}

/// Decodes a join reply payload.
///
/// An empty payload decodes to an empty roster.
pub fn decode_roster(payload: &[u8]) -> Result<PeerTable, PayloadError> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Ok(PeerTable::new());
    }
    Ok(serde_json::from_slice(payload)?)
}

/// Host metrics reported by a docker node as `docker_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostStatus {
    /// Global CPU usage across all cores, 0-100
    pub cpu_percent: f32,

    /// Total memory in bytes
    pub memory_total: u64,

    /// Used memory in bytes
    pub memory_used: u64,

    pub swap_total: u64,
    pub swap_used: u64,

    /// Load averages over 1, 5 and 15 minutes
    pub load_one: f64,
    pub load_five: f64,
    pub load_fifteen: f64,

    /// When the sample was taken
    pub timestamp: UnixTimestamp,
}

impl HostStatus {
    pub fn to_payload(&self) -> Result<Vec<u8>, PayloadError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, PayloadError> {
        Ok(serde_json::from_slice(payload)?)
    }
}
