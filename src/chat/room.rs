use crate::error::ChatError;

/// Derive the canonical key for the conversation between two participants.
///
/// The two numeric ids are sorted before joining, so `derive_room_key(a, b)`
/// and `derive_room_key(b, a)` agree and both sides can address the room
/// before any message exists. When the server has already assigned a key to
/// a contact that value wins; this derivation is only the fallback for rooms
/// that have never seen a message.
pub fn derive_room_key(a: &str, b: &str) -> Result<String, ChatError> {
    let first = parse_participant(a)?;
    let second = parse_participant(b)?;
    let (low, high) = if first <= second {
        (first, second)
    } else {
        (second, first)
    };
    Ok(format!("room_{}_{}", low, high))
}

fn parse_participant(raw: &str) -> Result<i64, ChatError> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| ChatError::InvalidIdentifier(raw.to_string()))
}
