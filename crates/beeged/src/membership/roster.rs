//! Role-scoped roster shared by handlers, discovery and the dialer.
//!
//! Each role has its own table behind its own `RwLock`. Guards are held
//! only for the duration of a single table operation and never across a
//! switcher send.

use tokio::sync::RwLock;

use beege_core::{unix_now, PeerRecord, PeerTable, Role, UnixTimestamp};

/// Known controllers and dockers with their last-seen timestamps.
#[derive(Debug, Default)]
pub struct Roster {
    controllers: RwLock<PeerTable>,
    dockers: RwLock<PeerTable>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, role: Role) -> &RwLock<PeerTable> {
        match role {
            Role::Controller => &self.controllers,
            Role::Docker => &self.dockers,
        }
    }

    /// Records a sighting now. Returns `true` if the peer was new.
    pub async fn touch(&self, role: Role, address: &str) -> bool {
        self.touch_at(role, address, unix_now()).await
    }

    pub async fn touch_at(&self, role: Role, address: &str, at: UnixTimestamp) -> bool {
        self.table(role).write().await.touch(address, at)
    }

    /// Records `address` only if it is unknown. Returns `true` if inserted.
    pub async fn insert_if_absent(&self, role: Role, address: &str) -> bool {
        self.table(role)
            .write()
            .await
            .insert_if_absent(address, unix_now())
    }

    pub async fn remove(&self, role: Role, address: &str) -> Option<PeerRecord> {
        self.table(role).write().await.remove(address)
    }

    pub async fn contains(&self, role: Role, address: &str) -> bool {
        self.table(role).read().await.contains(address)
    }

    pub async fn last_seen(&self, role: Role, address: &str) -> Option<UnixTimestamp> {
        self.table(role).read().await.last_seen(address)
    }

    pub async fn len(&self, role: Role) -> usize {
        self.table(role).read().await.len()
    }

    /// Copy of one table, e.g. for a join reply.
    pub async fn snapshot(&self, role: Role) -> PeerTable {
        self.table(role).read().await.clone()
    }

    /// Member addresses of one table, sorted.
    pub async fn addresses(&self, role: Role) -> Vec<String> {
        self.table(role)
            .read()
            .await
            .addresses()
            .map(str::to_string)
            .collect()
    }

    /// Refreshes `address` in whichever table already holds it.
    ///
    /// Returns the role it was found under, or `None` for an unknown peer
    /// (which is not inserted).
    pub async fn refresh(&self, address: &str) -> Option<Role> {
        let now = unix_now();
        for role in [Role::Controller, Role::Docker] {
            let mut table = self.table(role).write().await;
            if table.contains(address) {
                table.touch(address, now);
                return Some(role);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tables_are_role_scoped() {
        let roster = Roster::new();
        assert!(roster.touch(Role::Controller, "10.0.0.1:9001").await);
        assert!(roster.touch(Role::Docker, "10.0.0.5:7000").await);

        assert!(roster.contains(Role::Controller, "10.0.0.1:9001").await);
        assert!(!roster.contains(Role::Docker, "10.0.0.1:9001").await);
        assert_eq!(roster.len(Role::Controller).await, 1);
        assert_eq!(roster.len(Role::Docker).await, 1);
    }

    #[tokio::test]
    async fn test_refresh_finds_owning_table() {
        let roster = Roster::new();
        roster.touch_at(Role::Docker, "10.0.0.5:7000", 1).await;

        assert_eq!(roster.refresh("10.0.0.5:7000").await, Some(Role::Docker));
        assert!(roster.last_seen(Role::Docker, "10.0.0.5:7000").await.unwrap() > 1);

        assert_eq!(roster.refresh("10.0.0.9:7000").await, None);
        assert!(!roster.contains(Role::Docker, "10.0.0.9:7000").await);
    }

    #[tokio::test]
    async fn test_insert_if_absent_and_remove() {
        let roster = Roster::new();
        roster.touch_at(Role::Controller, "a:1", 5).await;

        assert!(!roster.insert_if_absent(Role::Controller, "a:1").await);
        assert_eq!(roster.last_seen(Role::Controller, "a:1").await, Some(5));
        assert!(roster.insert_if_absent(Role::Controller, "b:2").await);

        assert_eq!(roster.addresses(Role::Controller).await, vec!["a:1", "b:2"]);
        assert!(roster.remove(Role::Controller, "a:1").await.is_some());
        assert_eq!(roster.snapshot(Role::Controller).await.len(), 1);
    }
}
