//! Shared online-presence state
//!
//! The server announces who is online through two frame kinds: a full
//! `presence_snapshot` on connect and incremental `user_presence` deltas
//! afterwards. [`PresenceSet`] applies both and keeps at most one entry
//! per user id. Only the connection manager mutates it; consumers read
//! cloned snapshots.

use serde::{Deserialize, Serialize};

/// One currently-online user as announced by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUser {
    pub user_id: String,
    pub name: String,
    /// Avatar index (1-4 on the reference server).
    #[serde(default)]
    pub profile: u8,
}

/// The set of online users, keyed by user id, in arrival order.
#[derive(Debug, Default, Clone)]
pub struct PresenceSet {
    users: Vec<OnlineUser>,
}

impl PresenceSet {
    /// Replace the whole set from a snapshot frame.
    ///
    /// The snapshot is folded through [`PresenceSet::upsert`] so a server
    /// that repeats a user id cannot break the one-entry-per-id invariant.
    pub fn replace(&mut self, users: Vec<OnlineUser>) {
        self.users.clear();
        for user in users {
            self.upsert(user);
        }
    }

    /// Insert or update a user by id.
    pub fn upsert(&mut self, user: OnlineUser) {
        match self.users.iter_mut().find(|u| u.user_id == user.user_id) {
            Some(existing) => *existing = user,
            None => self.users.push(user),
        }
    }

    /// Remove a user by id. Removing an unknown id is a no-op.
    pub fn remove(&mut self, user_id: &str) -> bool {
        let before = self.users.len();
        self.users.retain(|u| u.user_id != user_id);
        self.users.len() != before
    }

    pub fn clear(&mut self) {
        self.users.clear();
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.users.iter().any(|u| u.user_id == user_id)
    }

    /// Cloned view for consumers.
    pub fn to_vec(&self) -> Vec<OnlineUser> {
        self.users.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str, name: &str) -> OnlineUser {
        OnlineUser {
            user_id: id.to_string(),
            name: name.to_string(),
            profile: 1,
        }
    }

    #[test]
    fn upsert_is_idempotent_per_user_id() {
        let mut set = PresenceSet::default();
        set.upsert(user("a", "Alice"));
        set.upsert(user("b", "Bob"));
        set.upsert(user("a", "Alice"));
        set.upsert(user("b", "Bob"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn upsert_updates_in_place() {
        let mut set = PresenceSet::default();
        set.upsert(user("a", "Alice"));
        set.upsert(OnlineUser {
            user_id: "a".to_string(),
            name: "Alicia".to_string(),
            profile: 3,
        });
        assert_eq!(set.len(), 1);
        let users = set.to_vec();
        assert_eq!(users[0].name, "Alicia");
        assert_eq!(users[0].profile, 3);
    }

    #[test]
    fn remove_unknown_id_is_noop() {
        let mut set = PresenceSet::default();
        set.upsert(user("a", "Alice"));
        assert!(!set.remove("ghost"));
        assert_eq!(set.len(), 1);
        assert!(set.remove("a"));
        assert!(set.is_empty());
    }

    #[test]
    fn replace_swaps_entire_contents() {
        let mut set = PresenceSet::default();
        set.upsert(user("a", "Alice"));
        set.upsert(user("b", "Bob"));
        set.replace(vec![user("c", "Carol")]);
        assert_eq!(set.len(), 1);
        assert!(set.contains("c"));
        assert!(!set.contains("a"));
        assert!(!set.contains("b"));
    }

    #[test]
    fn replace_dedupes_by_user_id() {
        let mut set = PresenceSet::default();
        set.replace(vec![user("a", "Alice"), user("a", "Alicia")]);
        assert_eq!(set.len(), 1);
        assert_eq!(set.to_vec()[0].name, "Alicia");
    }
}
