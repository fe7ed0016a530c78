// REST side of the conversation core: contact listing, history fetches and
// sends. Wire payloads are deserialized into the DTOs below and mapped into
// the typed models right here; nothing downstream touches raw JSON.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use log::{debug, warn};
use reqwest::StatusCode;
use serde::Deserialize;

use crate::chat::{ConversationApi, SendReceipt};
use crate::config::ChatConfig;
use crate::error::ChatError;
use crate::models::{Attachment, AttachmentKind, Contact, DeliveryState, Message, Role};

/// Production `ConversationApi` over HTTP. Every call carries the bearer
/// credential and the configured timeout; failures map onto `ChatError` and
/// are never retried here.
pub struct RestTransport {
    client: reqwest::Client,
    api_base: String,
    token: String,
}

impl RestTransport {
    pub fn new(config: &ChatConfig) -> Result<Self, ChatError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ChatError::Transport(format!("building http client: {}", e)))?;
        Ok(RestTransport {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }
}

#[async_trait]
impl ConversationApi for RestTransport {
    async fn list_contacts(&self, role: Role) -> Result<Vec<Contact>, ChatError> {
        let url = self.url(&contacts_path(role));
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(request_error)?;
        let response = check_status(response, &url)?;
        let rows: Vec<ContactDto> = response
            .json()
            .await
            .map_err(|e| ChatError::Transport(format!("decoding contacts: {}", e)))?;
        debug!("{} contacts for role {}", rows.len(), role);
        Ok(rows.into_iter().map(contact_from_wire).collect())
    }

    async fn fetch_history(&self, room_key: &str) -> Result<Vec<Message>, ChatError> {
        let url = self.url(&history_path(room_key));
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(request_error)?;
        // A room nobody has written to yet is not an error; rooms come into
        // being with their first message.
        if response.status() == StatusCode::NOT_FOUND {
            debug!("no history yet for {}", room_key);
            return Ok(Vec::new());
        }
        let response = check_status(response, &url)?;
        let rows: Vec<MessageDto> = response
            .json()
            .await
            .map_err(|e| ChatError::Transport(format!("decoding history: {}", e)))?;
        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            match message_from_wire(room_key, row) {
                Some(message) => messages.push(message),
                None => warn!("dropping malformed history row for {}", room_key),
            }
        }
        Ok(messages)
    }

    async fn send_message(
        &self,
        room_key: &str,
        recipient_id: i64,
        text: Option<&str>,
        attachment: Option<&Attachment>,
    ) -> Result<SendReceipt, ChatError> {
        let url = self.url("/api/chat/send/");
        let form = send_form(recipient_id, text, attachment);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .form(&form)
            .send()
            .await
            .map_err(request_error)?;
        let response = check_status(response, &url)?;

        // Servers answer with the canonical record when they have one ready
        // and a bare acknowledgement otherwise.
        let body = response
            .text()
            .await
            .map_err(|e| ChatError::Transport(format!("reading send response: {}", e)))?;
        match serde_json::from_str::<MessageDto>(&body) {
            Ok(dto) => match message_from_wire(room_key, dto) {
                Some(message) => Ok(SendReceipt::Message(message)),
                None => Ok(SendReceipt::Accepted),
            },
            Err(_) => Ok(SendReceipt::Accepted),
        }
    }
}

/// Map transport-level reqwest failures. Timeouts and connection problems
/// are the same thing to the caller.
fn request_error(error: reqwest::Error) -> ChatError {
    if error.is_timeout() {
        ChatError::Transport(format!("request timed out: {}", error))
    } else {
        ChatError::Transport(error.to_string())
    }
}

/// Reject non-success statuses, splitting credential problems from the rest.
fn check_status(response: reqwest::Response, url: &str) -> Result<reqwest::Response, ChatError> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(ChatError::Unauthorized(format!("{} for {}", status, url)));
    }
    if !status.is_success() {
        return Err(ChatError::Transport(format!(
            "unexpected status {} for {}",
            status, url
        )));
    }
    Ok(response)
}

fn contacts_path(role: Role) -> String {
    format!("/api/chat/contacts/{}/", role.as_str())
}

fn history_path(room_key: &str) -> String {
    format!("/api/chat/history/{}/", room_key)
}

// The server ignores absent fields; an empty body next to an attachment
// would read as a deliberate blank message.
fn send_form(
    recipient_id: i64,
    text: Option<&str>,
    attachment: Option<&Attachment>,
) -> Vec<(String, String)> {
    let mut form = vec![("recipient".to_string(), recipient_id.to_string())];
    if let Some(text) = text {
        form.push(("body".to_string(), text.to_string()));
    }
    if let Some(attachment) = attachment {
        form.push(("attachment".to_string(), attachment.url.clone()));
    }
    form
}

#[derive(Debug, Deserialize)]
pub(crate) struct ContactDto {
    id: i64,
    name: String,
    #[serde(default)]
    avatar: Option<String>,
    #[serde(default)]
    room_key: Option<String>,
    #[serde(default)]
    last_message: Option<String>,
    #[serde(default)]
    last_message_at: Option<String>,
    #[serde(default)]
    unread: Option<u32>,
}

// Every field is defaulted so one broken row degrades to a droppable DTO
// instead of poisoning the whole batch.
#[derive(Debug, Deserialize)]
pub(crate) struct MessageDto {
    #[serde(default)]
    id: String,
    #[serde(default)]
    sender_id: i64,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    sent_at: String,
    #[serde(default)]
    attachment: Option<AttachmentDto>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AttachmentDto {
    url: String,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

fn contact_from_wire(dto: ContactDto) -> Contact {
    Contact {
        id: dto.id,
        name: dto.name,
        avatar: dto.avatar,
        last_message: dto.last_message,
        last_message_at: dto
            .last_message_at
            .as_deref()
            .and_then(parse_wire_timestamp),
        unread: dto.unread,
        room_key: dto.room_key,
    }
}

/// Map one wire row into a confirmed message. `None` means the row was
/// malformed (blank id or unparseable timestamp) and should be dropped.
pub(crate) fn message_from_wire(room_key: &str, dto: MessageDto) -> Option<Message> {
    if dto.id.trim().is_empty() {
        return None;
    }
    let sent_at = parse_wire_timestamp(&dto.sent_at)?;
    Some(Message {
        id: dto.id,
        room_key: room_key.to_string(),
        sender_id: dto.sender_id,
        text: dto.body,
        attachment: dto.attachment.map(attachment_from_wire),
        sent_at,
        local_echo: false,
        delivery: DeliveryState::Confirmed,
        local_seq: 0,
    })
}

fn attachment_from_wire(dto: AttachmentDto) -> Attachment {
    let kind = match dto.kind.as_deref() {
        Some("image") => AttachmentKind::Image,
        _ => AttachmentKind::File,
    };
    Attachment {
        url: dto.url,
        kind,
        name: dto.name,
    }
}

/// Accept RFC 3339 first, then the naive `2024-05-14T10:15:00` form some
/// backends emit, read as UTC.
fn parse_wire_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    // Answers exactly one request with a canned response, then closes.
    async fn serve_one(listener: TcpListener, response: &'static str) {
        if let Ok((mut socket, _)) = listener.accept().await {
            let mut buf = [0u8; 1024];
            let mut seen = Vec::new();
            loop {
                match socket.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        seen.extend_from_slice(&buf[..n]);
                        if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    }

    fn transport_against(listener: &TcpListener) -> RestTransport {
        let config = ChatConfig::new(
            format!("http://{}", listener.local_addr().expect("local addr")),
            "tok",
            "3",
            Role::Seeker,
        );
        RestTransport::new(&config).expect("client")
    }

    #[tokio::test]
    async fn missing_history_reads_as_an_empty_room() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let transport = transport_against(&listener);
        let server = tokio::spawn(serve_one(
            listener,
            "HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        ));

        let history = transport.fetch_history("room_3_7").await.expect("history");
        assert!(history.is_empty());
        server.await.expect("server task");
    }

    #[tokio::test]
    async fn rejected_credentials_surface_as_unauthorized() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let transport = transport_against(&listener);
        let server = tokio::spawn(serve_one(
            listener,
            "HTTP/1.1 401 Unauthorized\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        ));

        let err = transport.fetch_history("room_3_7").await.unwrap_err();
        assert!(matches!(err, ChatError::Unauthorized(_)));
        server.await.expect("server task");
    }

    #[test]
    fn timestamps_parse_in_both_wire_shapes() {
        let rfc = parse_wire_timestamp("2024-05-14T10:15:00+02:00").unwrap();
        assert_eq!(rfc.hour(), 8, "offset must be folded into UTC");

        let naive = parse_wire_timestamp("2024-05-14T10:15:00.250").unwrap();
        assert_eq!(naive.hour(), 10);

        assert!(parse_wire_timestamp("yesterday-ish").is_none());
    }

    #[test]
    fn history_rows_map_into_confirmed_messages() {
        let dto: MessageDto = serde_json::from_str(
            r#"{
                "id": "41",
                "sender_id": 7,
                "body": "hello",
                "sent_at": "2024-05-14T10:15:00Z",
                "attachment": {"url": "https://files.example.test/a.png", "kind": "image"}
            }"#,
        )
        .unwrap();
        let message = message_from_wire("room_3_7", dto).unwrap();
        assert_eq!(message.id, "41");
        assert_eq!(message.room_key, "room_3_7");
        assert_eq!(message.sender_id, 7);
        assert_eq!(message.delivery, DeliveryState::Confirmed);
        assert!(!message.local_echo);
        let attachment = message.attachment.unwrap();
        assert_eq!(attachment.kind, AttachmentKind::Image);
    }

    #[test]
    fn malformed_rows_map_to_none() {
        let blank_id: MessageDto = serde_json::from_str(
            r#"{"id": " ", "sender_id": 7, "sent_at": "2024-05-14T10:15:00Z"}"#,
        )
        .unwrap();
        assert!(message_from_wire("room_3_7", blank_id).is_none());

        let bad_timestamp: MessageDto =
            serde_json::from_str(r#"{"id": "41", "sender_id": 7, "sent_at": "soon"}"#).unwrap();
        assert!(message_from_wire("room_3_7", bad_timestamp).is_none());

        // Structurally broken rows still deserialize (defaults) and drop.
        let missing_everything: MessageDto =
            serde_json::from_str(r#"{"body": "who sent this?"}"#).unwrap();
        assert!(message_from_wire("room_3_7", missing_everything).is_none());
    }

    #[test]
    fn contacts_tolerate_missing_optional_fields() {
        let dto: ContactDto =
            serde_json::from_str(r#"{"id": 7, "name": "Php Company"}"#).unwrap();
        let contact = contact_from_wire(dto);
        assert_eq!(contact.id, 7);
        assert_eq!(contact.name, "Php Company");
        assert!(contact.room_key.is_none());
        assert!(contact.unread.is_none());
    }

    #[test]
    fn unknown_attachment_kinds_fall_back_to_file() {
        let dto = AttachmentDto {
            url: "https://files.example.test/x.bin".to_string(),
            kind: Some("hologram".to_string()),
            name: None,
        };
        assert_eq!(attachment_from_wire(dto).kind, AttachmentKind::File);
    }

    #[test]
    fn endpoints_follow_the_role_and_room() {
        assert_eq!(contacts_path(Role::Seeker), "/api/chat/contacts/seeker/");
        assert_eq!(contacts_path(Role::Provider), "/api/chat/contacts/provider/");
        assert_eq!(history_path("room_3_7"), "/api/chat/history/room_3_7/");
    }

    #[test]
    fn send_form_skips_absent_fields() {
        let bare = send_form(7, None, None);
        assert_eq!(bare, vec![("recipient".to_string(), "7".to_string())]);

        let attachment = Attachment {
            url: "https://files.example.test/a.png".to_string(),
            kind: AttachmentKind::Image,
            name: None,
        };
        let full = send_form(7, Some("hello"), Some(&attachment));
        assert_eq!(full.len(), 3);
        assert_eq!(full[1], ("body".to_string(), "hello".to_string()));
        assert_eq!(
            full[2],
            (
                "attachment".to_string(),
                "https://files.example.test/a.png".to_string()
            )
        );
    }
}
