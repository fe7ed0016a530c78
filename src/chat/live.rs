// Push side of the conversation core. One channel per open room; the server
// pushes fully-formed message records as JSON text frames. The channel owns
// its reconnect policy and reports every state change, so the consumer can
// reconcile after an outage without knowing how long it lasted.

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Duration};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::chat::transport::{message_from_wire, MessageDto};
use crate::config::ChatConfig;
use crate::models::Message;

/// Retry budget per outage. Once spent the channel reports itself exhausted
/// and stops; reopening the room starts a fresh channel.
const MAX_RECONNECT_ATTEMPTS: u32 = 5;
const RECONNECT_BASE_MS: u64 = 500;
const RECONNECT_JITTER_MS: u64 = 250;
const RECONNECT_CAP_MS: u64 = 30_000;

/// What the channel reports back to its consumer.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// The subscription is live. `resumed` is set on every re-establishment
    /// after a drop, the consumer's cue to reconcile whatever it missed.
    Connected { room_key: String, resumed: bool },
    /// A message record pushed by the server.
    Message(Message),
    /// The connection went away; a reconnect is already scheduled.
    Dropped { room_key: String },
    /// The retry budget is spent. The channel is dead until reopened.
    Exhausted { room_key: String },
}

/// Handle for one per-room push subscription.
pub struct LiveChannel {
    room_key: String,
    shutdown: Option<watch::Sender<bool>>,
}

impl LiveChannel {
    /// Open the subscription for one room. Returns `None` without touching
    /// the network when the credential is empty; the room then runs in
    /// fetch-only mode.
    pub fn open(
        config: &ChatConfig,
        room_key: &str,
        events: mpsc::Sender<ChannelEvent>,
    ) -> Option<LiveChannel> {
        if config.token.trim().is_empty() {
            warn!("no credential, skipping the live channel for {}", room_key);
            return None;
        }
        let url = config.ws_endpoint(room_key);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(run_channel(room_key.to_string(), url, events, shutdown_rx));
        Some(LiveChannel {
            room_key: room_key.to_string(),
            shutdown: Some(shutdown_tx),
        })
    }

    pub fn room_key(&self) -> &str {
        &self.room_key
    }

    /// Idempotent: the first call signals the task to wind down, later calls
    /// are no-ops. Dropping the handle has the same effect.
    pub fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            debug!("closing live channel for {}", self.room_key);
            let _ = shutdown.send(true);
        }
    }
}

async fn run_channel(
    room_key: String,
    url: String,
    events: mpsc::Sender<ChannelEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;
    let mut resumed = false;

    loop {
        if *shutdown.borrow() {
            return;
        }

        match connect_async(url.as_str()).await {
            Ok((stream, _response)) => {
                attempt = 0;
                info!("live channel up for {}", room_key);
                let connected = ChannelEvent::Connected {
                    room_key: room_key.clone(),
                    resumed,
                };
                if events.send(connected).await.is_err() {
                    return; // consumer gone
                }
                resumed = true;

                let (mut write, mut read) = stream.split();
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            // Consumer closed the room (or dropped the
                            // handle); try to part cleanly.
                            let _ = write.send(WsMessage::Close(None)).await;
                            return;
                        }
                        frame = read.next() => match frame {
                            Some(Ok(WsMessage::Text(raw))) => {
                                match parse_push_frame(&room_key, raw.as_str()) {
                                    Some(message) => {
                                        if events.send(ChannelEvent::Message(message)).await.is_err() {
                                            return;
                                        }
                                    }
                                    None => warn!("dropping unreadable push frame for {}", room_key),
                                }
                            }
                            Some(Ok(WsMessage::Ping(payload))) => {
                                let _ = write.send(WsMessage::Pong(payload)).await;
                            }
                            Some(Ok(WsMessage::Close(_))) | None => break,
                            Some(Ok(_)) => {} // binary and pong frames carry nothing for us
                            Some(Err(e)) => {
                                warn!("live channel read error for {}: {}", room_key, e);
                                break;
                            }
                        }
                    }
                }

                let dropped = ChannelEvent::Dropped {
                    room_key: room_key.clone(),
                };
                if events.send(dropped).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!("live channel connect failed for {}: {}", room_key, e);
            }
        }

        attempt += 1;
        if attempt >= MAX_RECONNECT_ATTEMPTS {
            info!(
                "live channel giving up on {} after {} attempts",
                room_key, attempt
            );
            let exhausted = ChannelEvent::Exhausted {
                room_key: room_key.clone(),
            };
            let _ = events.send(exhausted).await;
            return;
        }

        let delay = reconnect_delay(attempt);
        debug!("reconnecting {} in {:?} (attempt {})", room_key, delay, attempt);
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = sleep(delay) => {}
        }
    }
}

/// Exponential backoff with jitter, capped. The first retry waits around
/// half a second, each further one doubles that.
fn reconnect_delay(attempt: u32) -> Duration {
    let shift = attempt.clamp(1, 16) - 1;
    let base = RECONNECT_BASE_MS.saturating_mul(1u64 << shift);
    let jitter = rand::random::<u64>() % RECONNECT_JITTER_MS;
    Duration::from_millis(base.min(RECONNECT_CAP_MS) + jitter)
}

fn parse_push_frame(room_key: &str, raw: &str) -> Option<Message> {
    let dto: MessageDto = serde_json::from_str(raw).ok()?;
    message_from_wire(room_key, dto)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_stays_capped() {
        for _ in 0..20 {
            let first = reconnect_delay(1).as_millis() as u64;
            assert!((RECONNECT_BASE_MS..RECONNECT_BASE_MS + RECONNECT_JITTER_MS).contains(&first));

            let third = reconnect_delay(3).as_millis() as u64;
            assert!((2000..2000 + RECONNECT_JITTER_MS).contains(&third));

            let huge = reconnect_delay(60).as_millis() as u64;
            assert!(huge <= RECONNECT_CAP_MS + RECONNECT_JITTER_MS);
        }
    }

    #[test]
    fn push_frames_parse_into_confirmed_messages() {
        let message = parse_push_frame(
            "room_3_7",
            r#"{"id": "41", "sender_id": 7, "body": "hi", "sent_at": "2024-05-14T10:15:00Z"}"#,
        )
        .unwrap();
        assert_eq!(message.id, "41");
        assert_eq!(message.room_key, "room_3_7");
        assert!(!message.local_echo);

        assert!(parse_push_frame("room_3_7", "not json").is_none());
        assert!(parse_push_frame("room_3_7", r#"{"kind": "typing"}"#).is_none());
    }
}
