//! Application-channel XML shapes: the outer `<xml><Encrypt>` envelope and
//! the inner decrypted message, in EP's PascalCase field names.

use serde::Deserialize;

use crate::error::{AppError, Result};

/// Outer POST body: `<xml><ToUserName/><Encrypt/><AgentID/></xml>`.
#[derive(Debug, Deserialize)]
#[serde(rename = "xml")]
pub struct EnvelopeXml {
    #[serde(rename = "ToUserName", default)]
    pub to_user_name: Option<String>,
    #[serde(rename = "Encrypt")]
    pub encrypt: String,
    #[serde(rename = "AgentID", default)]
    pub agent_id: Option<String>,
}

pub fn parse_envelope(body: &[u8]) -> Result<EnvelopeXml> {
    let text = std::str::from_utf8(body).map_err(|e| AppError::InvalidPayload(e.to_string()))?;
    quick_xml::de::from_str(text).map_err(|e| AppError::InvalidPayload(e.to_string()))
}

/// Inner decrypted message XML — every field EP might send across the
/// recognized `MsgType`s, all optional since each type only populates its
/// own subset. text/voice/image/file/mixed aren't modeled on this channel
/// the same way as the Bot channel, but video/link/location/event all
/// appear per the WeCom application-message callback shape.
#[derive(Debug, Default, Deserialize)]
#[serde(rename = "xml")]
pub struct RawXmlMessage {
    #[serde(rename = "ToUserName", default)]
    pub to_user_name: Option<String>,
    #[serde(rename = "FromUserName", default)]
    pub from_user_name: Option<String>,
    #[serde(rename = "CreateTime", default)]
    pub create_time: Option<i64>,
    #[serde(rename = "MsgType", default)]
    pub msg_type: String,
    #[serde(rename = "Content", default)]
    pub content: Option<String>,
    #[serde(rename = "MsgId", default)]
    pub msg_id: Option<String>,
    #[serde(rename = "PicUrl", default)]
    pub pic_url: Option<String>,
    #[serde(rename = "MediaId", default)]
    pub media_id: Option<String>,
    #[serde(rename = "Format", default)]
    pub format: Option<String>,
    #[serde(rename = "ThumbMediaId", default)]
    pub thumb_media_id: Option<String>,
    #[serde(rename = "FileName", default)]
    pub file_name: Option<String>,
    #[serde(rename = "Title", default)]
    pub title: Option<String>,
    #[serde(rename = "Description", default)]
    pub description: Option<String>,
    #[serde(rename = "Url", default)]
    pub url: Option<String>,
    #[serde(rename = "Location_X", default)]
    pub location_x: Option<String>,
    #[serde(rename = "Location_Y", default)]
    pub location_y: Option<String>,
    #[serde(rename = "Label", default)]
    pub label: Option<String>,
    #[serde(rename = "Event", default)]
    pub event: Option<String>,
    #[serde(rename = "EventKey", default)]
    pub event_key: Option<String>,
    #[serde(rename = "AgentID", default)]
    pub agent_id: Option<String>,
}

pub fn parse_message(plaintext: &[u8]) -> Result<RawXmlMessage> {
    let text = std::str::from_utf8(plaintext).map_err(|e| AppError::InvalidPayload(e.to_string()))?;
    quick_xml::de::from_str(text).map_err(|e| AppError::InvalidPayload(e.to_string()))
}

#[derive(Debug, Clone)]
pub enum InboundPayload {
    Text { content: String },
    Image { media_id: String },
    Voice { media_id: String, format: Option<String> },
    Video { media_id: String, thumb_media_id: Option<String> },
    File { media_id: String, file_name: Option<String> },
    Link { title: Option<String>, description: Option<String>, url: Option<String> },
    Location { x: Option<String>, y: Option<String>, label: Option<String> },
    Event { event: String, event_key: Option<String> },
    Unknown { msg_type: String },
}

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub msg_id: Option<String>,
    pub from_user_name: Option<String>,
    pub to_user_name: Option<String>,
    pub payload: InboundPayload,
}

impl RawXmlMessage {
    pub fn into_inbound(self) -> InboundMessage {
        let payload = match self.msg_type.as_str() {
            "text" => InboundPayload::Text {
                content: self.content.unwrap_or_default(),
            },
            "image" => InboundPayload::Image {
                media_id: self.media_id.unwrap_or_default(),
            },
            "voice" => InboundPayload::Voice {
                media_id: self.media_id.unwrap_or_default(),
                format: self.format,
            },
            "video" => InboundPayload::Video {
                media_id: self.media_id.unwrap_or_default(),
                thumb_media_id: self.thumb_media_id,
            },
            "file" => InboundPayload::File {
                media_id: self.media_id.unwrap_or_default(),
                file_name: self.file_name,
            },
            "link" => InboundPayload::Link {
                title: self.title,
                description: self.description,
                url: self.url,
            },
            "location" => InboundPayload::Location {
                x: self.location_x,
                y: self.location_y,
                label: self.label,
            },
            "event" => InboundPayload::Event {
                event: self.event.unwrap_or_default(),
                event_key: self.event_key,
            },
            other => InboundPayload::Unknown {
                msg_type: other.to_string(),
            },
        };
        InboundMessage {
            msg_id: self.msg_id,
            from_user_name: self.from_user_name,
            to_user_name: self.to_user_name,
            payload,
        }
    }
}

/// Does this payload carry a downloadable media attachment? True for the
/// `{image, voice, video, file}` media-type set.
impl InboundPayload {
    pub fn media_id(&self) -> Option<&str> {
        match self {
            InboundPayload::Image { media_id }
            | InboundPayload::Voice { media_id, .. }
            | InboundPayload::Video { media_id, .. }
            | InboundPayload::File { media_id, .. } => Some(media_id.as_str()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_message_xml() {
        let xml = r#"<xml>
            <ToUserName><![CDATA[toUser]]></ToUserName>
            <FromUserName><![CDATA[fromUser]]></FromUserName>
            <CreateTime>1348831860</CreateTime>
            <MsgType><![CDATA[text]]></MsgType>
            <Content><![CDATA[this is a test]]></Content>
            <MsgId>1234567890123456</MsgId>
            <AgentID>1</AgentID>
        </xml>"#;
        let raw = parse_message(xml.as_bytes()).unwrap();
        let msg = raw.into_inbound();
        assert_eq!(msg.from_user_name.as_deref(), Some("fromUser"));
        match msg.payload {
            InboundPayload::Text { content } => assert_eq!(content, "this is a test"),
            _ => panic!("expected text payload"),
        }
    }

    #[test]
    fn parses_file_message_with_filename() {
        let xml = r#"<xml>
            <MsgType><![CDATA[file]]></MsgType>
            <MediaId><![CDATA[media123]]></MediaId>
            <FileName><![CDATA[report.pdf]]></FileName>
        </xml>"#;
        let raw = parse_message(xml.as_bytes()).unwrap();
        let msg = raw.into_inbound();
        match msg.payload {
            InboundPayload::File { media_id, file_name } => {
                assert_eq!(media_id, "media123");
                assert_eq!(file_name.as_deref(), Some("report.pdf"));
            }
            _ => panic!("expected file payload"),
        }
    }

    #[test]
    fn parses_envelope_with_encrypt_field() {
        let xml = r#"<xml><ToUserName><![CDATA[toUser]]></ToUserName><Encrypt><![CDATA[abc123==]]></Encrypt><AgentID><![CDATA[1]]></AgentID></xml>"#;
        let env = parse_envelope(xml.as_bytes()).unwrap();
        assert_eq!(env.encrypt, "abc123==");
    }
}
