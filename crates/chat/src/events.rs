//! Decoding of bot-API updates into gateway messages.

use pricebot_core::gateway::InboundMessage;
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct Update {
    #[serde(default)]
    update_id: Option<i64>,
    #[serde(default)]
    message: Option<Message>,
    #[serde(default)]
    edited_message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    from: Option<Sender>,
    chat: Chat,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Sender {
    id: i64,
    #[serde(default)]
    is_bot: bool,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

/// Extracts the text message carried by an update.
///
/// Returns `None` for anything the assistant does not answer: updates
/// without text, messages from bots, blank messages and payloads that do
/// not match the update shape at all.
pub fn decode_update(payload: &serde_json::Value) -> Option<InboundMessage> {
    let update = match Update::deserialize(payload) {
        Ok(update) => update,
        Err(error) => {
            debug!(event_name = "chat.update.undecodable", error = %error, "ignoring update");
            return None;
        }
    };

    let update_id = update.update_id;
    let message = update.message.or(update.edited_message)?;
    let sender = message.from?;
    if sender.is_bot {
        debug!(event_name = "chat.update.from_bot", update_id, "ignoring bot message");
        return None;
    }

    let text = message.text?.trim().to_owned();
    if text.is_empty() {
        return None;
    }

    Some(InboundMessage {
        user_id: sender.id.to_string(),
        chat_id: message.chat.id.to_string(),
        text,
    })
}

pub fn decode_update_str(raw: &str) -> Option<InboundMessage> {
    let payload = serde_json::from_str::<serde_json::Value>(raw).ok()?;
    decode_update(&payload)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{decode_update, decode_update_str};

    #[test]
    fn decodes_text_message() {
        let update = json!({
            "update_id": 10,
            "message": {
                "message_id": 3,
                "from": { "id": 4242, "is_bot": false, "first_name": "Ana" },
                "chat": { "id": -100200, "type": "private" },
                "text": "  diesel in Porto  "
            }
        });

        let message = decode_update(&update).expect("text message");
        assert_eq!(message.user_id, "4242");
        assert_eq!(message.chat_id, "-100200");
        assert_eq!(message.text, "diesel in Porto");
    }

    #[test]
    fn falls_back_to_edited_message() {
        let update = json!({
            "update_id": 11,
            "edited_message": {
                "from": { "id": 7 },
                "chat": { "id": 7 },
                "text": "gasoline 95"
            }
        });

        assert_eq!(decode_update(&update).map(|m| m.text).as_deref(), Some("gasoline 95"));
    }

    #[test]
    fn ignores_non_text_bot_and_blank_updates() {
        let sticker = json!({
            "update_id": 1,
            "message": { "from": { "id": 1 }, "chat": { "id": 1 }, "sticker": {} }
        });
        let bot = json!({
            "update_id": 2,
            "message": { "from": { "id": 2, "is_bot": true }, "chat": { "id": 2 }, "text": "hi" }
        });
        let blank = json!({
            "update_id": 3,
            "message": { "from": { "id": 3 }, "chat": { "id": 3 }, "text": "   " }
        });
        let callback = json!({ "update_id": 4, "callback_query": { "id": "x" } });

        for update in [sticker, bot, blank, callback] {
            assert_eq!(decode_update(&update), None);
        }
    }

    #[test]
    fn ignores_malformed_payloads() {
        assert_eq!(decode_update(&json!({ "message": { "text": "no chat" } })), None);
        assert_eq!(decode_update(&json!([1, 2, 3])), None);
        assert_eq!(decode_update_str("not json"), None);
    }
}
