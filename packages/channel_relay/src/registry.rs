//! Channel membership tracking.
//!
//! Maps channel keys to their members in join order. Closed members are not
//! removed eagerly; `prune` drops them when the router next touches the
//! channel.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::connection::Connection;

/// Result of pruning one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PruneResult {
    /// Members dropped because they were no longer open.
    pub pruned: usize,
    /// The channel had no open members left and was deleted.
    pub removed: bool,
}

#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: HashMap<String, Vec<Arc<Connection>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `connection` to the members of `channel_id`, creating the
    /// channel if needed.
    ///
    /// Registering the same handle twice into one channel is a no-op and
    /// returns `false`.
    pub fn register(&mut self, channel_id: &str, connection: Arc<Connection>) -> bool {
        let members = self.channels.entry(channel_id.to_string()).or_default();
        if members.iter().any(|m| Arc::ptr_eq(m, &connection)) {
            debug!(
                "Connection {} already registered in channel {:?}",
                connection.id(),
                channel_id
            );
            return false;
        }
        members.push(connection);
        true
    }

    /// Members of `channel_id` in join order, or `None` if the channel was
    /// never registered or has been pruned away.
    pub fn lookup(&self, channel_id: &str) -> Option<&[Arc<Connection>]> {
        self.channels.get(channel_id).map(Vec::as_slice)
    }

    /// Keep only open members. Deletes the channel if none remain.
    pub fn prune(&mut self, channel_id: &str) -> PruneResult {
        let Some(members) = self.channels.get_mut(channel_id) else {
            return PruneResult::default();
        };

        let before = members.len();
        members.retain(|m| m.is_open());
        let pruned = before - members.len();

        let removed = members.is_empty();
        if removed {
            self.channels.remove(channel_id);
        }

        PruneResult { pruned, removed }
    }

    /// Delete a channel entry outright. Returns `true` if it existed.
    pub fn remove(&mut self, channel_id: &str) -> bool {
        self.channels.remove(channel_id).is_some()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Number of members currently listed (open or not) for `channel_id`.
    pub fn member_count(&self, channel_id: &str) -> usize {
        self.channels.get(channel_id).map_or(0, Vec::len)
    }

    #[cfg(test)]
    pub(crate) fn insert_empty(&mut self, channel_id: &str) {
        self.channels.insert(channel_id.to_string(), Vec::new());
    }
}
