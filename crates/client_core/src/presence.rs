use std::collections::HashSet;

use shared::domain::UserId;

#[derive(Debug, Default)]
pub struct PresenceTracker {
    online: HashSet<UserId>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.online.contains(user_id)
    }

    /// Applies a push `user_online` event. Returns whether the set changed.
    pub fn mark_online(&mut self, user_id: UserId) -> bool {
        self.online.insert(user_id)
    }

    pub fn mark_offline(&mut self, user_id: &UserId) -> bool {
        self.online.remove(user_id)
    }

    /// Swaps in a full snapshot. Entries missing from the snapshot are dropped
    /// even if their offline event was never observed.
    pub fn replace_snapshot(&mut self, users: impl IntoIterator<Item = UserId>) -> bool {
        let next: HashSet<UserId> = users.into_iter().collect();
        if next == self.online {
            return false;
        }
        self.online = next;
        true
    }

    pub fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.online.iter().cloned().collect();
        users.sort();
        users
    }
}
