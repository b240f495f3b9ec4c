use std::collections::HashMap;
use std::sync::Arc;

use super::channel::Channel;

/// One bucket's share of a room: the members whose home bucket this is.
///
/// A room id may exist in every bucket at once; the union of the partial
/// rooms is the logical room.
#[derive(Debug)]
pub struct Room {
    id: String,
    members: HashMap<String, Arc<Channel>>,
}

impl Room {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            members: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns `false` if the channel was already a member.
    pub fn insert(&mut self, channel: &Arc<Channel>) -> bool {
        self.members
            .insert(channel.id().to_string(), channel.clone())
            .is_none()
    }

    pub fn remove(&mut self, channel_id: &str) -> bool {
        self.members.remove(channel_id).is_some()
    }

    pub fn contains(&self, channel_id: &str) -> bool {
        self.members.contains_key(channel_id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> impl Iterator<Item = &Arc<Channel>> {
        self.members.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing;

    #[test]
    fn insert_is_idempotent_per_channel() {
        let (a, _ra) = testing::authenticated("a", "10.0.0.1:1", 4);
        let (b, _rb) = testing::authenticated("b", "10.0.0.2:1", 4);
        let mut room = Room::new("live://1");
        assert!(room.insert(&a));
        assert!(!room.insert(&a));
        assert!(room.insert(&b));
        assert_eq!(room.len(), 2);
        assert!(room.contains(a.id()));

        assert!(room.remove(a.id()));
        assert!(!room.remove(a.id()));
        assert_eq!(room.members().count(), 1);
        assert!(room.remove(b.id()));
        assert!(room.is_empty());
    }
}
