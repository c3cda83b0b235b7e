//! Template-card detection: a delivered block is a template card when its
//! trimmed text is JSON whose top level contains the `"template_card"` key.

use serde_json::Value;

pub fn is_template_card(text: &str) -> bool {
    let t = text.trim();
    t.starts_with('{') && t.contains("\"template_card\"")
}

/// Parses `text` as a template-card payload, returning `None` if it isn't
/// one or fails to parse as JSON.
pub fn parse(text: &str) -> Option<Value> {
    if !is_template_card(text) {
        return None;
    }
    serde_json::from_str(text.trim()).ok()
}

/// Renders a template card to plain text — main title/description followed
/// by the button list — for group chats or when no response-url is
/// available to deliver the card object itself.
pub fn render_to_text(card: &Value) -> String {
    let root = card.get("template_card").unwrap_or(card);
    let main_title = root.pointer("/main_title/title").and_then(Value::as_str).unwrap_or("");
    let desc = root.pointer("/main_title/desc").and_then(Value::as_str).unwrap_or("");

    let mut out = String::new();
    if !main_title.is_empty() {
        out.push_str(main_title);
    }
    if !desc.is_empty() {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(desc);
    }
    if let Some(buttons) = root.pointer("/button_list").and_then(Value::as_array) {
        for button in buttons {
            if let Some(text) = button.get("text").and_then(Value::as_str) {
                out.push_str("\n- ");
                out.push_str(text);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_template_card_json() {
        let text = r#"  { "template_card": { "main_title": { "title": "t" } } }  "#;
        assert!(is_template_card(text));
        assert!(parse(text).is_some());
    }

    #[test]
    fn rejects_plain_text() {
        assert!(!is_template_card("just some text"));
        assert!(!is_template_card("{not json"));
    }

    #[test]
    fn renders_title_desc_and_buttons() {
        let card = serde_json::json!({
            "template_card": {
                "main_title": { "title": "Approve request?", "desc": "From alice" },
                "button_list": [{ "text": "Approve" }, { "text": "Reject" }],
            }
        });
        let rendered = render_to_text(&card);
        assert!(rendered.contains("Approve request?"));
        assert!(rendered.contains("From alice"));
        assert!(rendered.contains("- Approve"));
        assert!(rendered.contains("- Reject"));
    }
}
