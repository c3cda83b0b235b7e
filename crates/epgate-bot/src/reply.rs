//! Builds and seals Bot-channel reply envelopes.

use epgate_core::types::StreamState;
use serde_json::{json, Value};

use crate::error::{BotError, Result};

pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Builds the `{msgtype: "stream", stream: {...}}` payload for a stream
/// reply, including `msg_item` images only when the stream is finished.
pub fn stream_payload(stream: &StreamState) -> Value {
    let mut stream_obj = json!({
        "id": stream.stream_id.as_str(),
        "finish": stream.finished,
        "content": stream.content(),
    });
    if stream.finished && !stream.images.is_empty() {
        let items: Vec<Value> = stream
            .images
            .iter()
            .map(|img| {
                json!({
                    "msgtype": "image",
                    "image": { "base64": img.base64, "md5": img.md5 },
                })
            })
            .collect();
        stream_obj["msg_item"] = Value::Array(items);
    }
    json!({ "msgtype": "stream", "stream": stream_obj })
}

/// Seals `payload` into the `{encrypt, msgsignature, timestamp, nonce}`
/// body the Bot channel expects as its `text/plain` response.
pub fn seal_reply(
    encoding_aes_key: &str,
    token: &str,
    receiver_id: &str,
    timestamp: &str,
    nonce: &str,
    payload: &Value,
) -> Result<Value> {
    let msg = serde_json::to_vec(payload).map_err(|e| BotError::InvalidPayload(e.to_string()))?;
    let (encrypt, sig) = epgate_crypto::seal_envelope(encoding_aes_key, token, receiver_id, timestamp, nonce, &msg)
        .map_err(|e| BotError::Decrypt(e.to_string()))?;
    Ok(json!({
        "encrypt": encrypt,
        "msgsignature": sig,
        "timestamp": timestamp,
        "nonce": nonce,
    }))
}

/// Seals an empty payload — EP expects a 200 with an encrypted empty body
/// for several event acknowledgements.
pub fn seal_empty(encoding_aes_key: &str, token: &str, receiver_id: &str, timestamp: &str, nonce: &str) -> Result<Value> {
    seal_reply(encoding_aes_key, token, receiver_id, timestamp, nonce, &Value::String(String::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use epgate_core::types::{ChatType, StreamId};

    #[test]
    fn stream_payload_omits_images_until_finished() {
        let mut stream = StreamState::new(
            StreamId::generate(),
            "acct:u:direct".into(),
            "acct:u:direct".into(),
            "u".into(),
            ChatType::Direct,
            None,
        );
        stream.append_content("partial");
        let payload = stream_payload(&stream);
        assert_eq!(payload["stream"]["finish"], false);
        assert!(payload["stream"].get("msg_item").is_none());
    }
}
