//! Fan-out of one inbound payload to the rest of a channel.

use std::sync::Arc;

use tracing::debug;

use crate::connection::{Connection, Payload, SendOutcome};
use crate::registry::ChannelRegistry;

/// What a single broadcast pass did. Nothing here is reported to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BroadcastReport {
    /// The channel key was not registered.
    pub missing: bool,
    /// The channel entry was deleted during this pass.
    pub removed: bool,
    /// Closed members dropped before sending.
    pub pruned: usize,
    /// Payloads queued to recipients.
    pub delivered: usize,
    /// Sends whose transport writer had already gone away.
    pub discarded: usize,
    /// The sender itself (loopback suppression).
    pub skipped_sender: usize,
    /// Members that closed between pruning and sending.
    pub skipped_closed: usize,
}

/// Deliver `payload` to every open member of `channel_id` except `sender`.
///
/// Members are visited in join order. Closed members are pruned first, and
/// the channel is deleted when no open member remains. Sends never block and
/// are never retried.
pub fn broadcast(
    registry: &mut ChannelRegistry,
    sender: &Arc<Connection>,
    channel_id: &str,
    payload: &Payload,
) -> BroadcastReport {
    let mut report = BroadcastReport::default();

    let Some(members) = registry.lookup(channel_id) else {
        debug!("Channel {:?} does not exist", channel_id);
        report.missing = true;
        return report;
    };

    if members.is_empty() {
        registry.remove(channel_id);
        debug!("Removed empty channel: {:?}", channel_id);
        report.removed = true;
        return report;
    }

    let pruned = registry.prune(channel_id);
    report.pruned = pruned.pruned;
    if pruned.removed {
        debug!("Removed empty channel: {:?}", channel_id);
        report.removed = true;
        return report;
    }

    let Some(members) = registry.lookup(channel_id) else {
        return report;
    };

    for member in members {
        if Arc::ptr_eq(member, sender) {
            debug!("Skipping sender {} in {:?}", member.id(), channel_id);
            report.skipped_sender += 1;
            continue;
        }
        if !member.is_open() {
            debug!("Client {} state is closed", member.id());
            report.skipped_closed += 1;
            continue;
        }
        match member.send(payload.clone()) {
            SendOutcome::Queued => {
                debug!("Message queued for {}", member.id());
                report.delivered += 1;
            }
            SendOutcome::Discarded => {
                debug!("Send to {} discarded, writer is gone", member.id());
                report.discarded += 1;
            }
        }
    }

    report
}
