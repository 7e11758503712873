//! Peer records and role-scoped peer tables.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{DomainError, DomainResult};

/// Seconds since the Unix epoch.
pub type UnixTimestamp = i64;

/// Returns the current time as a Unix timestamp.
pub fn unix_now() -> UnixTimestamp {
    Utc::now().timestamp()
}

/// Checks that an advertised address can be used as a roster key.
///
/// Addresses travel as command payloads and JSON keys, so they must be
/// non-empty and free of whitespace.
pub fn validate_address(value: &str) -> DomainResult<&str> {
    if value.is_empty() {
        return Err(DomainError::InvalidAddress {
            value: value.to_string(),
            reason: "address is empty".to_string(),
        });
    }
    if value.chars().any(char::is_whitespace) {
        return Err(DomainError::InvalidAddress {
            value: value.to_string(),
            reason: "address contains whitespace".to_string(),
        });
    }
    Ok(value)
}

/// A single known cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub address: String,
    pub last_seen: UnixTimestamp,
}

/// Mapping of peer address to last-seen timestamp for one role.
///
/// Serializes as a plain JSON object (`{"10.0.0.1:9001": 1700000000}`),
/// which is the roster payload exchanged during a join. A `BTreeMap` keeps
/// the encoding deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerTable(BTreeMap<String, UnixTimestamp>);

impl PeerTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.0.contains_key(address)
    }

    /// Returns when the peer was last seen, if it is a member.
    pub fn last_seen(&self, address: &str) -> Option<UnixTimestamp> {
        self.0.get(address).copied()
    }

    /// Records a sighting of `address` at `at`.
    ///
    /// Inserts the peer if unknown. An existing timestamp is only ever moved
    /// forward. Returns `true` if the peer was newly inserted.
    pub fn touch(&mut self, address: &str, at: UnixTimestamp) -> bool {
        match self.0.get_mut(address) {
            Some(last_seen) => {
                if at > *last_seen {
                    *last_seen = at;
                }
                false
            }
            None => {
                self.0.insert(address.to_string(), at);
                true
            }
        }
    }

    /// Inserts `address` only if it is not already a member.
    ///
    /// Returns `true` if the peer was inserted.
    pub fn insert_if_absent(&mut self, address: &str, at: UnixTimestamp) -> bool {
        if self.0.contains_key(address) {
            return false;
        }
        self.0.insert(address.to_string(), at);
        true
    }

    /// Removes a peer, returning its record if it was a member.
    pub fn remove(&mut self, address: &str) -> Option<PeerRecord> {
        self.0.remove_entry(address).map(|(address, last_seen)| PeerRecord {
            address,
            last_seen,
        })
    }

    /// Iterates over member addresses in sorted order.
    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl FromIterator<(String, UnixTimestamp)> for PeerTable {
    fn from_iter<I: IntoIterator<Item = (String, UnixTimestamp)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_touch_never_moves_backwards() {
        let mut table = PeerTable::new();
        assert!(table.touch("10.0.0.1:9001", 100));
        assert!(!table.touch("10.0.0.1:9001", 50));
        assert_eq!(table.last_seen("10.0.0.1:9001"), Some(100));

        assert!(!table.touch("10.0.0.1:9001", 150));
        assert_eq!(table.last_seen("10.0.0.1:9001"), Some(150));
    }

    #[test]
    fn test_insert_if_absent_keeps_existing() {
        let mut table = PeerTable::new();
        assert!(table.insert_if_absent("a:1", 10));
        assert!(!table.insert_if_absent("a:1", 20));
        assert_eq!(table.last_seen("a:1"), Some(10));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_remove_returns_record() {
        let mut table = PeerTable::new();
        table.touch("a:1", 10);

        let record = table.remove("a:1").unwrap();
        assert_eq!(record.address, "a:1");
        assert_eq!(record.last_seen, 10);
        assert!(table.remove("a:1").is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_json_shape_is_plain_object() {
        let table: PeerTable = [("b:2".to_string(), 2), ("a:1".to_string(), 1)]
            .into_iter()
            .collect();
        let json = serde_json::to_string(&table).unwrap();
        assert_eq!(json, r#"{"a:1":1,"b:2":2}"#);

        let parsed: PeerTable = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, table);
        assert_eq!(parsed.addresses().collect::<Vec<_>>(), vec!["a:1", "b:2"]);
    }

    #[test]
    fn test_validate_address() {
        assert_eq!(validate_address("10.0.0.5:7000"), Ok("10.0.0.5:7000"));
        assert!(validate_address("").is_err());
        assert!(validate_address("10.0.0.5 7000").is_err());
        assert!(validate_address("host:1\n").is_err());
    }
}
