//! Tagged inbound message variant, discriminated on `msgtype`.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatTypeField {
    Single,
    Group,
}

#[derive(Debug, Clone)]
pub struct Quote {
    pub content: String,
}

#[derive(Debug, Clone)]
pub enum MixedItem {
    Text(String),
    Image { url: String },
    File { url: String },
}

#[derive(Debug, Clone)]
pub enum InboundPayload {
    Text { content: String },
    Voice { content: Option<String> },
    Image { url: String },
    File { url: String },
    Mixed { items: Vec<MixedItem> },
    Link { title: Option<String>, url: Option<String> },
    Location { label: Option<String> },
    Event { eventtype: String, raw: Value },
    Stream { id: String },
    /// Any `msgtype` not in the recognized set: kept with its raw payload so
    /// nothing is silently dropped.
    Unknown { msgtype: String, raw: Value },
}

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub msg_id: Option<String>,
    pub ai_bot_id: Option<String>,
    pub chat_type: ChatTypeField,
    pub chat_id: Option<String>,
    pub response_url: Option<String>,
    pub from_user_id: Option<String>,
    pub payload: InboundPayload,
    pub quote: Option<Quote>,
}

fn get_str(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(Value::as_str).map(str::to_string)
}

fn first_of<'a>(v: &'a Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| get_str(v, k))
}

/// Parses the decrypted Bot-channel plaintext JSON into an [`InboundMessage`].
pub fn parse_inbound_message(v: &Value) -> InboundMessage {
    let msg_id = get_str(v, "msgid");
    let ai_bot_id = get_str(v, "aibotid");
    let chat_type = match get_str(v, "chattype").as_deref() {
        Some("group") => ChatTypeField::Group,
        _ => ChatTypeField::Single,
    };
    let chat_id = get_str(v, "chatid");
    let response_url = get_str(v, "response_url");
    let from_user_id = v
        .get("from")
        .and_then(|f| get_str(f, "userid"))
        .or_else(|| first_of(v, &["fromuserid", "from_userid", "fromUserId"]));

    let quote = v.get("quote").and_then(|q| get_str(q, "content")).map(|content| Quote { content });

    let msgtype = get_str(v, "msgtype").unwrap_or_default();
    let payload = match msgtype.as_str() {
        "text" => InboundPayload::Text {
            content: v
                .get("text")
                .and_then(|t| get_str(t, "content"))
                .unwrap_or_default(),
        },
        "voice" => InboundPayload::Voice {
            content: v.get("voice").and_then(|t| get_str(t, "content")),
        },
        "image" => InboundPayload::Image {
            url: v.get("image").and_then(|t| get_str(t, "url")).unwrap_or_default(),
        },
        "file" => InboundPayload::File {
            url: v.get("file").and_then(|t| get_str(t, "url")).unwrap_or_default(),
        },
        "mixed" => {
            let items = v
                .get("mixed")
                .and_then(|m| m.get("msg_item"))
                .and_then(Value::as_array)
                .map(|arr| arr.iter().map(parse_mixed_item).collect())
                .unwrap_or_default();
            InboundPayload::Mixed { items }
        }
        "link" => InboundPayload::Link {
            title: v.get("link").and_then(|t| get_str(t, "title")),
            url: v.get("link").and_then(|t| get_str(t, "url")),
        },
        "location" => InboundPayload::Location {
            label: v.get("location").and_then(|t| get_str(t, "label")),
        },
        "event" => InboundPayload::Event {
            eventtype: v
                .get("event")
                .and_then(|t| get_str(t, "eventtype"))
                .unwrap_or_default(),
            raw: v.get("event").cloned().unwrap_or(Value::Null),
        },
        "stream" => InboundPayload::Stream {
            id: v.get("stream").and_then(|t| get_str(t, "id")).unwrap_or_default(),
        },
        other => InboundPayload::Unknown {
            msgtype: other.to_string(),
            raw: v.clone(),
        },
    };

    InboundMessage {
        msg_id,
        ai_bot_id,
        chat_type,
        chat_id,
        response_url,
        from_user_id,
        payload,
        quote,
    }
}

fn parse_mixed_item(item: &Value) -> MixedItem {
    match get_str(item, "msgtype").as_deref() {
        Some("image") => MixedItem::Image {
            url: item.get("image").and_then(|t| get_str(t, "url")).unwrap_or_default(),
        },
        Some("file") => MixedItem::File {
            url: item.get("file").and_then(|t| get_str(t, "url")).unwrap_or_default(),
        },
        _ => MixedItem::Text(
            item.get("text")
                .and_then(|t| get_str(t, "content"))
                .unwrap_or_default(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_text_message_with_from_userid_variants() {
        let v = json!({
            "msgid": "m1",
            "chattype": "single",
            "from": { "userid": "u1" },
            "msgtype": "text",
            "text": { "content": "hi" },
        });
        let msg = parse_inbound_message(&v);
        assert_eq!(msg.from_user_id.as_deref(), Some("u1"));
        match msg.payload {
            InboundPayload::Text { content } => assert_eq!(content, "hi"),
            _ => panic!("expected text payload"),
        }
    }

    #[test]
    fn falls_back_to_fromuserid_alias() {
        let v = json!({ "msgtype": "text", "text": { "content": "hi" }, "fromuserid": "u2" });
        let msg = parse_inbound_message(&v);
        assert_eq!(msg.from_user_id.as_deref(), Some("u2"));
    }

    #[test]
    fn unknown_msgtype_is_preserved_as_raw() {
        let v = json!({ "msgtype": "weird", "weird": { "a": 1 } });
        let msg = parse_inbound_message(&v);
        match msg.payload {
            InboundPayload::Unknown { msgtype, .. } => assert_eq!(msgtype, "weird"),
            _ => panic!("expected unknown payload"),
        }
    }
}
