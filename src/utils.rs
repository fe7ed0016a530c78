use anyhow::Result;
use chrono::Local;

use chinwag::models::{Contact, DeliveryState, Message};

// Small terminal helpers for the demo client.

/// Read a line of input from stdin, trimming whitespace
pub fn read_line() -> Result<String> {
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

/// One-line rendering of a contact for the picker list.
pub fn format_contact(contact: &Contact) -> String {
    let unread = match contact.unread {
        Some(n) if n > 0 => format!(" [{} unread]", n),
        _ => String::new(),
    };
    let preview = contact.last_message.as_deref().unwrap_or("");
    format!("#{:<6} {}{}  {}", contact.id, contact.name, unread, preview)
}

/// One-line rendering of a message with its delivery marker.
pub fn format_message(message: &Message) -> String {
    let marker = match message.delivery {
        DeliveryState::Pending => "…",
        DeliveryState::Sent => "✓",
        DeliveryState::Failed => "✗",
        DeliveryState::Confirmed => " ",
    };
    let time = message.sent_at.with_timezone(&Local).format("%H:%M");
    let body = message.text.as_deref().unwrap_or("");
    let attachment = message
        .attachment
        .as_ref()
        .map(|a| format!(" <{}>", a.url))
        .unwrap_or_default();
    format!("[{}] {} {}: {}{}", time, marker, message.sender_id, body, attachment)
}
