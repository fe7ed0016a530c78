#![allow(dead_code)] // not every test binary uses every helper

// Common test utilities for integration tests
// This module contains shared code for all integration tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use log::LevelFilter;
use tokio::sync::Notify;

use chinwag::chat::{AttachmentUpload, AttachmentUploader, ConversationApi, SendReceipt};
use chinwag::error::ChatError;
use chinwag::models::{Attachment, AttachmentKind, Contact, DeliveryState, Message, Role};

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .init();
    });
}

pub fn contact(id: i64, name: &str) -> Contact {
    Contact {
        id,
        name: name.to_string(),
        avatar: None,
        last_message: None,
        last_message_at: None,
        unread: None,
        room_key: None,
    }
}

pub fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 14, 10, minute, 0).unwrap()
}

pub fn confirmed(id: &str, room_key: &str, sender_id: i64, text: &str, minute: u32) -> Message {
    Message {
        id: id.to_string(),
        room_key: room_key.to_string(),
        sender_id,
        text: Some(text.to_string()),
        attachment: None,
        sent_at: at(minute),
        local_echo: false,
        delivery: DeliveryState::Confirmed,
        local_seq: 0,
    }
}

/// Canned conversation API. Contacts and histories are plain maps; the
/// gates let a test hold a call open to exercise the interleavings the
/// controller has to survive.
pub struct StubApi {
    pub local_id: i64,
    contacts: Mutex<Vec<Contact>>,
    history: Mutex<HashMap<String, Vec<Message>>>,
    history_gates: Mutex<HashMap<String, Arc<Notify>>>,
    send_gate: Mutex<Option<Arc<Notify>>>,
    fail_sends: AtomicBool,
    fail_history: AtomicBool,
    minimal_ack: AtomicBool,
    next_server_id: AtomicU64,
    /// Every room `fetch_history` was called for, in order.
    pub fetched_rooms: Mutex<Vec<String>>,
    /// Every send that reached the stub: recipient, text, attachment url.
    pub sent: Mutex<Vec<(i64, Option<String>, Option<String>)>>,
}

impl StubApi {
    pub fn new(local_id: i64) -> Self {
        StubApi {
            local_id,
            contacts: Mutex::new(Vec::new()),
            history: Mutex::new(HashMap::new()),
            history_gates: Mutex::new(HashMap::new()),
            send_gate: Mutex::new(None),
            fail_sends: AtomicBool::new(false),
            fail_history: AtomicBool::new(false),
            minimal_ack: AtomicBool::new(false),
            next_server_id: AtomicU64::new(100),
            fetched_rooms: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn with_contacts(self, contacts: Vec<Contact>) -> Self {
        *self.contacts.lock().unwrap() = contacts;
        self
    }

    pub fn with_history(self, room_key: &str, messages: Vec<Message>) -> Self {
        self.history
            .lock()
            .unwrap()
            .insert(room_key.to_string(), messages);
        self
    }

    pub fn set_contacts(&self, contacts: Vec<Contact>) {
        *self.contacts.lock().unwrap() = contacts;
    }

    pub fn set_history(&self, room_key: &str, messages: Vec<Message>) {
        self.history
            .lock()
            .unwrap()
            .insert(room_key.to_string(), messages);
    }

    /// Make `fetch_history` for this room wait until the returned gate is
    /// notified. Lets a test hold a fetch open while the user moves on.
    pub fn gate_history(&self, room_key: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.history_gates
            .lock()
            .unwrap()
            .insert(room_key.to_string(), Arc::clone(&gate));
        gate
    }

    /// Same for sends.
    pub fn gate_sends(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.send_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn fail_history(&self, fail: bool) {
        self.fail_history.store(fail, Ordering::SeqCst);
    }

    /// Answer sends with a bare acknowledgement instead of the canonical
    /// record.
    pub fn minimal_ack(&self, on: bool) {
        self.minimal_ack.store(on, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConversationApi for StubApi {
    async fn list_contacts(&self, _role: Role) -> Result<Vec<Contact>, ChatError> {
        Ok(self.contacts.lock().unwrap().clone())
    }

    async fn fetch_history(&self, room_key: &str) -> Result<Vec<Message>, ChatError> {
        self.fetched_rooms
            .lock()
            .unwrap()
            .push(room_key.to_string());
        let gate = self.history_gates.lock().unwrap().get(room_key).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail_history.load(Ordering::SeqCst) {
            return Err(ChatError::Transport("stub refused the fetch".to_string()));
        }
        Ok(self
            .history
            .lock()
            .unwrap()
            .get(room_key)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_message(
        &self,
        room_key: &str,
        recipient_id: i64,
        text: Option<&str>,
        attachment: Option<&Attachment>,
    ) -> Result<SendReceipt, ChatError> {
        let gate = self.send_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.sent.lock().unwrap().push((
            recipient_id,
            text.map(str::to_string),
            attachment.map(|a| a.url.clone()),
        ));
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ChatError::Transport("stub refused the send".to_string()));
        }
        if self.minimal_ack.load(Ordering::SeqCst) {
            return Ok(SendReceipt::Accepted);
        }
        let id = self.next_server_id.fetch_add(1, Ordering::SeqCst);
        Ok(SendReceipt::Message(Message {
            id: id.to_string(),
            room_key: room_key.to_string(),
            sender_id: self.local_id,
            text: text.map(str::to_string),
            attachment: attachment.cloned(),
            sent_at: Utc::now(),
            local_echo: false,
            delivery: DeliveryState::Confirmed,
            local_seq: 0,
        }))
    }
}

/// Upload stand-in: canned success or failure, records what it was given.
pub struct StubUploader {
    fail: AtomicBool,
    pub uploads: Mutex<Vec<String>>,
}

impl StubUploader {
    pub fn new() -> Self {
        StubUploader {
            fail: AtomicBool::new(false),
            uploads: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_uploads(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl AttachmentUploader for StubUploader {
    async fn upload(&self, upload: AttachmentUpload) -> Result<Attachment, ChatError> {
        self.uploads.lock().unwrap().push(upload.file_name.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(ChatError::UploadFailed("stub upload refused".to_string()));
        }
        Ok(Attachment {
            url: format!("https://files.example.test/{}", upload.file_name),
            kind: if upload.is_image() {
                AttachmentKind::Image
            } else {
                AttachmentKind::File
            },
            name: Some(upload.file_name),
        })
    }
}
