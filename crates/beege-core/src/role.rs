//! Node role identification.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::DomainError;

/// Role a node plays in the cluster.
///
/// Fixed for the lifetime of a process. Controllers accept joins and
/// greetings; docker nodes dial every known controller and report to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Cluster controller (accepts inbound connections)
    Controller,

    /// Docker host agent (dials controllers)
    Docker,
}

impl Role {
    /// Returns the role name used as the command prefix on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Controller => "controller",
            Self::Docker => "docker",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "controller" => Ok(Self::Controller),
            "docker" => Ok(Self::Docker),
            other => Err(DomainError::UnknownRole(other.to_string())),
        }
    }
}
