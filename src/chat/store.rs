// In-memory per-room message state. The store is the single source of truth
// for what a conversation looks like: every mutation goes through one of the
// operations below and re-establishes the ordering invariant before
// returning, so a snapshot taken at any point is renderable as-is.

use std::cmp::Ordering;
use std::collections::HashMap;

use log::{debug, warn};

use crate::models::{DeliveryState, Message};

#[derive(Debug, Default)]
struct RoomEntry {
    messages: Vec<Message>,
    loading: bool,
}

/// Map from room key to its ordered message sequence plus a loading flag.
///
/// Sequences are kept ascending by `sent_at`. Ties put server records before
/// local echoes, order server records by id and echoes by their local
/// sequence number, so repeated merges of the same data can never flip two
/// messages.
#[derive(Debug, Default)]
pub struct MessageStore {
    rooms: HashMap<String, RoomEntry>,
    next_seq: u64,
}

impl MessageStore {
    pub fn new() -> Self {
        MessageStore::default()
    }

    /// Replace a room's sequence wholesale, used after the initial history
    /// fetch. Incoming order is not trusted; the batch is re-sorted here.
    pub fn seed(&mut self, room_key: &str, mut messages: Vec<Message>) {
        sort_messages(&mut messages);
        debug!("seeding {} with {} messages", room_key, messages.len());
        let entry = self.rooms.entry(room_key.to_string()).or_default();
        entry.messages = messages;
    }

    /// Fold a batch of confirmed messages into a room.
    ///
    /// Duplicate ids are skipped, so merging the same batch twice is a
    /// no-op. A confirmed message that matches a live local echo (same
    /// sender, same text, same attachment) replaces that echo instead of
    /// landing next to it; that is how an optimistic send becomes its
    /// canonical server record. Malformed entries are dropped with a log
    /// line. Returns how many entries were applied.
    pub fn merge(&mut self, room_key: &str, incoming: Vec<Message>) -> usize {
        let entry = self.rooms.entry(room_key.to_string()).or_default();
        let mut applied = 0;

        for message in incoming {
            if message.id.trim().is_empty() {
                warn!("dropping message without an id for {}", room_key);
                continue;
            }
            if message.delivery != DeliveryState::Confirmed {
                warn!(
                    "dropping non-confirmed message {} routed into merge for {}",
                    message.id, room_key
                );
                continue;
            }
            if entry.messages.iter().any(|m| m.id == message.id) {
                continue;
            }
            let echo = entry.messages.iter_mut().find(|m| {
                m.local_echo
                    && m.delivery.awaiting_server()
                    && m.sender_id == message.sender_id
                    && m.text == message.text
                    && attachment_url(m) == attachment_url(&message)
            });
            match echo {
                Some(echo) => *echo = message,
                None => entry.messages.push(message),
            }
            applied += 1;
        }

        if applied > 0 {
            sort_messages(&mut entry.messages);
        }
        applied
    }

    /// Append a locally-originated message awaiting the server. Runs
    /// synchronously so the sender sees their message before any network
    /// round trip. The store stamps the echo's sequence number and state.
    pub fn append_pending(&mut self, room_key: &str, mut message: Message) {
        self.next_seq += 1;
        message.local_seq = self.next_seq;
        message.local_echo = true;
        message.delivery = DeliveryState::Pending;
        let entry = self.rooms.entry(room_key.to_string()).or_default();
        entry.messages.push(message);
        sort_messages(&mut entry.messages);
    }

    /// The server accepted a send without returning its canonical record;
    /// the echo stays visible as sent until a merge pass promotes it.
    pub fn mark_sent(&mut self, room_key: &str, local_id: &str) -> bool {
        self.transition(room_key, local_id, DeliveryState::Pending, DeliveryState::Sent)
    }

    /// A send was rejected. The entry keeps its text and attachment so the
    /// user can retry or dismiss it; only the state changes.
    pub fn mark_failed(&mut self, room_key: &str, local_id: &str) -> bool {
        self.transition(room_key, local_id, DeliveryState::Pending, DeliveryState::Failed)
    }

    fn transition(
        &mut self,
        room_key: &str,
        local_id: &str,
        from: DeliveryState,
        to: DeliveryState,
    ) -> bool {
        let entry = match self.rooms.get_mut(room_key) {
            Some(entry) => entry,
            None => return false,
        };
        match entry
            .messages
            .iter_mut()
            .find(|m| m.id == local_id && m.delivery == from)
        {
            Some(message) => {
                message.delivery = to;
                true
            }
            None => {
                debug!(
                    "no {:?} message {} in {} to move to {:?}",
                    from, local_id, room_key, to
                );
                false
            }
        }
    }

    /// Remove a failed entry, handing it back for a retry or a discard.
    /// Live entries are left alone.
    pub fn remove_failed(&mut self, room_key: &str, local_id: &str) -> Option<Message> {
        let entry = self.rooms.get_mut(room_key)?;
        let position = entry
            .messages
            .iter()
            .position(|m| m.id == local_id && m.delivery == DeliveryState::Failed)?;
        Some(entry.messages.remove(position))
    }

    /// Snapshot of a room's sequence, empty for rooms never touched.
    pub fn messages(&self, room_key: &str) -> Vec<Message> {
        self.rooms
            .get(room_key)
            .map(|entry| entry.messages.clone())
            .unwrap_or_default()
    }

    pub fn set_loading(&mut self, room_key: &str, loading: bool) {
        self.rooms.entry(room_key.to_string()).or_default().loading = loading;
    }

    pub fn loading(&self, room_key: &str) -> bool {
        self.rooms
            .get(room_key)
            .map(|entry| entry.loading)
            .unwrap_or(false)
    }
}

fn attachment_url(message: &Message) -> Option<&str> {
    message.attachment.as_ref().map(|a| a.url.as_str())
}

fn sort_messages(messages: &mut [Message]) {
    messages.sort_by(compare_messages);
}

/// One total order for every room sequence: ascending `sent_at`, server
/// records before local echoes on a tie, then server id or local sequence.
fn compare_messages(a: &Message, b: &Message) -> Ordering {
    a.sent_at
        .cmp(&b.sent_at)
        .then_with(|| (a.local_echo as u8).cmp(&(b.local_echo as u8)))
        .then_with(|| {
            if a.local_echo && b.local_echo {
                a.local_seq.cmp(&b.local_seq)
            } else {
                a.id.cmp(&b.id)
            }
        })
}
