//! Command parsing and the `/new`/`/reset` ack rewrite, implemented as pure
//! functions rather than a handler keyed on a context object.

pub const NEW_SESSION_ACK_ZH: &str = "已为您开启新会话。";
pub const RESET_ACK_ZH: &str = "会话已重置。";

/// Returns the command token (`/new`, `/reset`, ...) if `raw_body` parses as
/// a command — i.e. trims to something starting with `/`.
pub fn parse_command(raw_body: &str) -> Option<&str> {
    let trimmed = raw_body.trim();
    if trimmed.starts_with('/') {
        Some(trimmed.split_whitespace().next().unwrap_or(trimmed))
    } else {
        None
    }
}

pub fn is_session_reset_command(cmd: &str) -> bool {
    matches!(cmd, "/new" | "/reset")
}

/// The localized ack the driver substitutes for the runtime's English ack
/// text. Empty string for anything that isn't a recognized reset-family
/// command.
pub fn localized_ack(cmd: &str) -> &'static str {
    match cmd {
        "/new" => NEW_SESSION_ACK_ZH,
        "/reset" => RESET_ACK_ZH,
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_leading_slash_commands() {
        assert_eq!(parse_command("/new please"), Some("/new"));
        assert_eq!(parse_command("  /reset  "), Some("/reset"));
        assert_eq!(parse_command("hello /new"), None);
    }

    #[test]
    fn only_new_and_reset_are_session_reset_commands() {
        assert!(is_session_reset_command("/new"));
        assert!(is_session_reset_command("/reset"));
        assert!(!is_session_reset_command("/help"));
    }

    #[test]
    fn localized_ack_covers_both_commands() {
        assert_eq!(localized_ack("/new"), NEW_SESSION_ACK_ZH);
        assert_eq!(localized_ack("/reset"), RESET_ACK_ZH);
        assert_eq!(localized_ack("/help"), "");
    }
}
