// Orchestration of the conversation core: contact listing, the room
// lifecycle, optimistic sends and the live-push pump all meet here. The
// message store is the only shared mutable state; it is touched strictly
// through its own operations, under its lock, and never across a network
// await.

pub mod live;
pub mod room;
pub mod store;
pub mod transport;
pub mod upload;

pub use live::{ChannelEvent, LiveChannel};
pub use room::derive_room_key;
pub use store::MessageStore;
pub use transport::RestTransport;
pub use upload::{AttachmentUpload, HttpUploader};

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::config::ChatConfig;
use crate::error::ChatError;
use crate::models::{Attachment, Contact, DeliveryState, Message, Role};

const EVENT_CHANNEL_CAPACITY: usize = 100;

/// REST seam the controller drives. `RestTransport` is the production
/// implementation; tests substitute their own.
#[async_trait]
pub trait ConversationApi: Send + Sync {
    /// Contacts visible to the given role, newest conversation first if the
    /// server orders them. The result replaces any cached list wholesale.
    async fn list_contacts(&self, role: Role) -> Result<Vec<Contact>, ChatError>;

    /// Full history for one room, ascending by send time. Empty for rooms
    /// that exist but have no messages, and for rooms not created yet.
    async fn fetch_history(&self, room_key: &str) -> Result<Vec<Message>, ChatError>;

    /// Deliver one message. `room_key` is only used to map the response
    /// back onto the conversation; the server addresses by recipient.
    async fn send_message(
        &self,
        room_key: &str,
        recipient_id: i64,
        text: Option<&str>,
        attachment: Option<&Attachment>,
    ) -> Result<SendReceipt, ChatError>;
}

/// Upload seam, separate from the conversation API because it fails
/// differently and runs before anything optimistic is shown.
#[async_trait]
pub trait AttachmentUploader: Send + Sync {
    async fn upload(&self, upload: AttachmentUpload) -> Result<Attachment, ChatError>;
}

/// What a send comes back with: the canonical record when the server
/// returns one, or a bare acknowledgement.
#[derive(Debug, Clone)]
pub enum SendReceipt {
    Message(Message),
    Accepted,
}

/// Lifecycle of the room currently on screen. Sending is deliberately not a
/// state here; sends overlap `Ready` and are tracked separately.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RoomState {
    Idle,
    LoadingHistory,
    Ready,
}

/// Notifications for the embedding application.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// A message appeared in a room, by live push or as a local echo.
    MessageAdded { room_key: String, message: Message },
    /// An existing entry changed state: echo confirmed, send failed, ...
    MessageUpdated { room_key: String, message: Message },
    /// A reconciliation pass changed the room; re-read it from the store.
    RoomRefreshed { room_key: String },
    RoomState { room_key: String, state: RoomState },
    /// The live channel spent its retry budget; the room is fetch-only now.
    ChannelLost { room_key: String },
}

struct ActiveRoom {
    room_key: String,
    generation: u64,
    state: RoomState,
    channel: Option<LiveChannel>,
}

/// Orchestrator for one authenticated session.
///
/// All methods take `&self`; the controller is made to be wrapped in an
/// `Arc` and driven from several tasks at once.
pub struct ChatController {
    config: ChatConfig,
    api: Arc<dyn ConversationApi>,
    uploader: Arc<dyn AttachmentUploader>,
    store: Arc<Mutex<MessageStore>>,
    contacts: Arc<Mutex<Vec<Contact>>>,
    active: Arc<Mutex<Option<ActiveRoom>>>,
    /// Bumped on every open and close. Async work tags itself with the
    /// value it saw, and anything stale is discarded instead of applied.
    generation: Arc<AtomicU64>,
    sends_in_flight: Arc<AtomicUsize>,
    events: mpsc::Sender<ChatEvent>,
}

impl ChatController {
    pub fn new(
        config: ChatConfig,
        api: Arc<dyn ConversationApi>,
        uploader: Arc<dyn AttachmentUploader>,
    ) -> (Self, mpsc::Receiver<ChatEvent>) {
        let (events, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let controller = ChatController {
            config,
            api,
            uploader,
            store: Arc::new(Mutex::new(MessageStore::new())),
            contacts: Arc::new(Mutex::new(Vec::new())),
            active: Arc::new(Mutex::new(None)),
            generation: Arc::new(AtomicU64::new(0)),
            sends_in_flight: Arc::new(AtomicUsize::new(0)),
            events,
        };
        (controller, events_rx)
    }

    /// Fetch the contact list for the configured role. The result replaces
    /// the cached list wholesale; contacts the server has not assigned a
    /// room key get the locally derived one, so every entry is addressable.
    pub async fn refresh_contacts(&self) -> Result<Vec<Contact>, ChatError> {
        let mut fetched = self.api.list_contacts(self.config.role).await?;
        for contact in &mut fetched {
            if contact.room_key.is_none() {
                match derive_room_key(&self.config.user_id, &contact.id.to_string()) {
                    Ok(key) => contact.room_key = Some(key),
                    Err(e) => warn!("cannot derive a room key for contact {}: {}", contact.id, e),
                }
            }
        }
        let mut contacts = self.contacts.lock().await;
        *contacts = fetched.clone();
        Ok(fetched)
    }

    /// Last fetched contact list.
    pub async fn contacts(&self) -> Vec<Contact> {
        self.contacts.lock().await.clone()
    }

    /// Server-assigned key first, derived key as the fallback for rooms
    /// that have never seen a message.
    pub fn resolve_room_key(&self, contact: &Contact) -> Result<String, ChatError> {
        match &contact.room_key {
            Some(key) => Ok(key.clone()),
            None => derive_room_key(&self.config.user_id, &contact.id.to_string()),
        }
    }

    /// Bring a conversation on screen: tear down whatever was open, load
    /// history, seed the store and subscribe to pushes. Returns the room
    /// key. A history result arriving after the user has moved on is
    /// discarded by the generation check rather than applied to the wrong
    /// room.
    pub async fn open_room(&self, contact: &Contact) -> Result<String, ChatError> {
        let room_key = self.resolve_room_key(contact)?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        {
            let mut active = self.active.lock().await;
            if let Some(mut previous) = active.take() {
                if let Some(channel) = previous.channel.as_mut() {
                    channel.close();
                }
                let mut store = self.store.lock().await;
                store.set_loading(&previous.room_key, false);
                debug!("left {} to open {}", previous.room_key, room_key);
            }
            *active = Some(ActiveRoom {
                room_key: room_key.clone(),
                generation,
                state: RoomState::LoadingHistory,
                channel: None,
            });
        }
        {
            let mut store = self.store.lock().await;
            store.set_loading(&room_key, true);
        }
        self.emit(ChatEvent::RoomState {
            room_key: room_key.clone(),
            state: RoomState::LoadingHistory,
        })
        .await;

        let history = self.api.fetch_history(&room_key).await;

        // The user may have switched or closed rooms while we waited.
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!("discarding a stale history result for {}", room_key);
            return Ok(room_key);
        }

        let history = match history {
            Ok(history) => history,
            Err(e) => {
                {
                    let mut store = self.store.lock().await;
                    store.set_loading(&room_key, false);
                }
                let was_current = {
                    let mut active = self.active.lock().await;
                    let current = active
                        .as_ref()
                        .map(|room| room.generation == generation)
                        .unwrap_or(false);
                    if current {
                        *active = None;
                    }
                    current
                };
                if was_current {
                    self.emit(ChatEvent::RoomState {
                        room_key: room_key.clone(),
                        state: RoomState::Idle,
                    })
                    .await;
                }
                return Err(e);
            }
        };

        {
            let mut store = self.store.lock().await;
            store.seed(&room_key, history);
            store.set_loading(&room_key, false);
        }

        // Opening a room consumes its unread counter.
        {
            let mut contacts = self.contacts.lock().await;
            if let Some(entry) = contacts.iter_mut().find(|c| c.id == contact.id) {
                entry.unread = Some(0);
            }
        }

        let (channel_tx, channel_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let channel = LiveChannel::open(&self.config, &room_key, channel_tx);
        if channel.is_some() {
            self.spawn_pump(room_key.clone(), generation, channel_rx);
        }

        let became_ready = {
            let mut active = self.active.lock().await;
            let current = active
                .as_ref()
                .map(|room| room.generation == generation)
                .unwrap_or(false);
            if current {
                if let Some(room) = active.as_mut() {
                    room.channel = channel;
                    room.state = RoomState::Ready;
                }
                true
            } else {
                // Someone opened another room while we were finishing up.
                drop(active);
                if let Some(mut channel) = channel {
                    channel.close();
                }
                false
            }
        };
        if became_ready {
            self.emit(ChatEvent::RoomState {
                room_key: room_key.clone(),
                state: RoomState::Ready,
            })
            .await;
        }
        Ok(room_key)
    }

    /// Close the active room. The live channel goes away and in-flight
    /// results for the room become stale; the history stays cached for an
    /// instant redisplay later. Safe to call with nothing open.
    pub async fn close_room(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let closed = {
            let mut active = self.active.lock().await;
            match active.take() {
                Some(mut room) => {
                    if let Some(channel) = room.channel.as_mut() {
                        channel.close();
                    }
                    let mut store = self.store.lock().await;
                    store.set_loading(&room.room_key, false);
                    Some(room.room_key)
                }
                None => None,
            }
        };
        if let Some(room_key) = closed {
            info!("closed room {}", room_key);
            self.emit(ChatEvent::RoomState {
                room_key,
                state: RoomState::Idle,
            })
            .await;
        }
    }

    /// Optimistic send. The echo is in the store (and on screen) before the
    /// network is touched; the transport's answer then promotes or fails
    /// it. Returns the echo's local id, which retry and dismiss take.
    pub async fn send_message(
        &self,
        contact: &Contact,
        text: Option<&str>,
        attachment_file: Option<AttachmentUpload>,
    ) -> Result<String, ChatError> {
        let trimmed = text.map(str::trim).filter(|t| !t.is_empty());
        if trimmed.is_none() && attachment_file.is_none() {
            return Err(ChatError::EmptyMessage);
        }

        let room_key = self.resolve_room_key(contact)?;

        // Upload first. A failed upload surfaces as-is and nothing
        // optimistic is ever shown for it.
        let attachment = match attachment_file {
            Some(file) => Some(self.uploader.upload(file).await?),
            None => None,
        };

        self.dispatch_send(contact.id, room_key, trimmed.map(str::to_string), attachment)
            .await
    }

    /// Re-run a failed send. The original text and the already-uploaded
    /// attachment reference are reused; nothing is uploaded twice. Returns
    /// `Ok(None)` when there is no failed entry under that id.
    pub async fn retry_message(
        &self,
        contact: &Contact,
        local_id: &str,
    ) -> Result<Option<String>, ChatError> {
        let room_key = self.resolve_room_key(contact)?;
        let failed = {
            let mut store = self.store.lock().await;
            store.remove_failed(&room_key, local_id)
        };
        let failed = match failed {
            Some(failed) => failed,
            None => {
                debug!("no failed message {} in {} to retry", local_id, room_key);
                return Ok(None);
            }
        };
        self.dispatch_send(contact.id, room_key, failed.text, failed.attachment)
            .await
            .map(Some)
    }

    /// Drop a failed entry the user chose to discard. Live entries are left
    /// alone. Returns whether anything was removed.
    pub async fn dismiss_failed(&self, room_key: &str, local_id: &str) -> bool {
        let removed = {
            let mut store = self.store.lock().await;
            store.remove_failed(room_key, local_id)
        };
        match removed {
            Some(_) => {
                self.emit(ChatEvent::RoomRefreshed {
                    room_key: room_key.to_string(),
                })
                .await;
                true
            }
            None => false,
        }
    }

    /// Snapshot of a room's ordered sequence. Empty for rooms never opened.
    pub async fn messages(&self, room_key: &str) -> Vec<Message> {
        self.store.lock().await.messages(room_key)
    }

    pub async fn room_state(&self, room_key: &str) -> RoomState {
        let active = self.active.lock().await;
        match active.as_ref() {
            Some(room) if room.room_key == room_key => room.state,
            _ => RoomState::Idle,
        }
    }

    pub async fn history_loading(&self, room_key: &str) -> bool {
        self.store.lock().await.loading(room_key)
    }

    /// True while at least one send sits between its optimistic append and
    /// the transport's answer. Sending overlaps `Ready`, it never replaces
    /// it.
    pub fn is_sending(&self) -> bool {
        self.sends_in_flight.load(Ordering::SeqCst) > 0
    }

    /// Second half of the send path, shared with retry: append the echo,
    /// hit the transport, reconcile the echo with the answer.
    async fn dispatch_send(
        &self,
        recipient_id: i64,
        room_key: String,
        text: Option<String>,
        attachment: Option<Attachment>,
    ) -> Result<String, ChatError> {
        let sender_id = local_participant_id(&self.config)?;
        let local_id = format!("local-{}", Uuid::new_v4());
        let echo = Message {
            id: local_id.clone(),
            room_key: room_key.clone(),
            sender_id,
            text,
            attachment,
            sent_at: Utc::now(),
            local_echo: true,
            delivery: DeliveryState::Pending,
            local_seq: 0, // the store stamps the real value
        };

        {
            let mut store = self.store.lock().await;
            store.append_pending(&room_key, echo.clone());
        }
        self.emit(ChatEvent::MessageAdded {
            room_key: room_key.clone(),
            message: echo.clone(),
        })
        .await;

        self.sends_in_flight.fetch_add(1, Ordering::SeqCst);
        let result = self
            .api
            .send_message(
                &room_key,
                recipient_id,
                echo.text.as_deref(),
                echo.attachment.as_ref(),
            )
            .await;
        self.sends_in_flight.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(SendReceipt::Message(confirmed)) => {
                {
                    let mut store = self.store.lock().await;
                    store.merge(&room_key, vec![confirmed.clone()]);
                }
                self.emit(ChatEvent::MessageUpdated {
                    room_key,
                    message: confirmed,
                })
                .await;
                Ok(local_id)
            }
            Ok(SendReceipt::Accepted) => {
                {
                    let mut store = self.store.lock().await;
                    store.mark_sent(&room_key, &local_id);
                }
                let mut sent = echo;
                sent.delivery = DeliveryState::Sent;
                self.emit(ChatEvent::MessageUpdated {
                    room_key,
                    message: sent,
                })
                .await;
                Ok(local_id)
            }
            Err(e) => {
                warn!("send into {} failed: {}", room_key, e);
                {
                    let mut store = self.store.lock().await;
                    store.mark_failed(&room_key, &local_id);
                }
                let mut failed = echo;
                failed.delivery = DeliveryState::Failed;
                self.emit(ChatEvent::MessageUpdated {
                    room_key,
                    message: failed,
                })
                .await;
                Err(e)
            }
        }
    }

    /// Per-room task translating channel events into store mutations and
    /// application events. Every application is gated on the generation, so
    /// a pump outliving its room cannot touch a newer one.
    fn spawn_pump(
        &self,
        room_key: String,
        generation: u64,
        mut channel_rx: mpsc::Receiver<ChannelEvent>,
    ) {
        let store = Arc::clone(&self.store);
        let api = Arc::clone(&self.api);
        let events = self.events.clone();
        let current_generation = Arc::clone(&self.generation);

        tokio::spawn(async move {
            while let Some(event) = channel_rx.recv().await {
                if current_generation.load(Ordering::SeqCst) != generation {
                    debug!("pump for {} outlived its room, stopping", room_key);
                    break;
                }
                match event {
                    ChannelEvent::Message(message) => {
                        let applied = {
                            let mut store = store.lock().await;
                            store.merge(&room_key, vec![message.clone()])
                        };
                        if applied > 0 {
                            let _ = events
                                .send(ChatEvent::MessageAdded {
                                    room_key: room_key.clone(),
                                    message,
                                })
                                .await;
                        }
                    }
                    ChannelEvent::Connected { resumed: true, .. } => {
                        // One-shot reconciliation closes whatever gap the
                        // outage left. Merged rather than seeded, so local
                        // echoes survive it.
                        match api.fetch_history(&room_key).await {
                            Ok(history) => {
                                if current_generation.load(Ordering::SeqCst) != generation {
                                    break;
                                }
                                let applied = {
                                    let mut store = store.lock().await;
                                    store.merge(&room_key, history)
                                };
                                info!(
                                    "reconciled {} after a reconnect ({} entries)",
                                    room_key, applied
                                );
                                if applied > 0 {
                                    let _ = events
                                        .send(ChatEvent::RoomRefreshed {
                                            room_key: room_key.clone(),
                                        })
                                        .await;
                                }
                            }
                            Err(e) => {
                                warn!("reconciliation fetch for {} failed: {}", room_key, e)
                            }
                        }
                    }
                    ChannelEvent::Connected { .. } => {
                        debug!("live channel ready for {}", room_key);
                    }
                    ChannelEvent::Dropped { .. } => {
                        // Reconnecting is the channel's own business.
                        debug!("live channel for {} dropped, waiting it out", room_key);
                    }
                    ChannelEvent::Exhausted { .. } => {
                        let _ = events
                            .send(ChatEvent::ChannelLost {
                                room_key: room_key.clone(),
                            })
                            .await;
                    }
                }
            }
        });
    }

    async fn emit(&self, event: ChatEvent) {
        if self.events.send(event).await.is_err() {
            debug!("event receiver dropped, nobody is listening");
        }
    }
}

fn local_participant_id(config: &ChatConfig) -> Result<i64, ChatError> {
    config
        .user_id
        .trim()
        .parse::<i64>()
        .map_err(|_| ChatError::InvalidIdentifier(config.user_id.clone()))
}
