//! Resolves a raw, operator-facing target string into exactly one of
//! `{user, party, tag, chat}` — a pure function, no I/O.

const PLATFORM_PREFIXES: &[&str] = &["application", "platform", "ep", "alt-alias", "alt-alias2"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    User(String),
    Party(String),
    Tag(String),
    Chat(String),
}

/// Strips one leading platform prefix (case-insensitive, colon-delimited),
/// then applies explicit-prefix and heuristic rules to classify the rest.
pub fn resolve_target(raw: &str) -> Target {
    let trimmed = raw.trim();
    let rest = strip_platform_prefix(trimmed);

    if let Some(id) = strip_prefix_ci(rest, "party:") {
        return Target::Party(id.to_string());
    }
    if let Some(id) = strip_prefix_ci(rest, "dept:") {
        return Target::Party(id.to_string());
    }
    if let Some(id) = strip_prefix_ci(rest, "tag:") {
        return Target::Tag(id.to_string());
    }
    if let Some(id) = strip_prefix_ci(rest, "group:") {
        return Target::Chat(id.to_string());
    }
    if let Some(id) = strip_prefix_ci(rest, "chat:") {
        return Target::Chat(id.to_string());
    }
    if let Some(id) = strip_prefix_ci(rest, "user:") {
        return Target::User(id.to_string());
    }

    if rest.len() >= 2 {
        let lower_prefix = rest[..2].to_ascii_lowercase();
        if lower_prefix == "wr" || lower_prefix == "wc" {
            return Target::Chat(rest.to_string());
        }
    }
    if !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()) {
        return Target::Party(rest.to_string());
    }
    Target::User(rest.to_string())
}

fn strip_platform_prefix(s: &str) -> &str {
    if let Some((prefix, rest)) = s.split_once(':') {
        if PLATFORM_PREFIXES
            .iter()
            .any(|p| p.eq_ignore_ascii_case(prefix))
        {
            return rest;
        }
    }
    s
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_prefixes_win_over_heuristics() {
        assert_eq!(resolve_target("party:1001"), Target::Party("1001".into()));
        assert_eq!(resolve_target("dept:1001"), Target::Party("1001".into()));
        assert_eq!(resolve_target("tag:vip"), Target::Tag("vip".into()));
        assert_eq!(resolve_target("group:abc"), Target::Chat("abc".into()));
        assert_eq!(resolve_target("chat:abc"), Target::Chat("abc".into()));
        assert_eq!(resolve_target("user:zhangsan"), Target::User("zhangsan".into()));
    }

    #[test]
    fn platform_prefix_is_stripped_before_classification() {
        assert_eq!(resolve_target("ep:user:zhangsan"), Target::User("zhangsan".into()));
        assert_eq!(resolve_target("EP:tag:vip"), Target::Tag("vip".into()));
        assert_eq!(resolve_target("Application:party:1001"), Target::Party("1001".into()));
    }

    #[test]
    fn heuristics_classify_chat_id_prefix() {
        assert_eq!(resolve_target("wrAbCdEf123"), Target::Chat("wrAbCdEf123".into()));
        assert_eq!(resolve_target("wcXyZ000"), Target::Chat("wcXyZ000".into()));
    }

    #[test]
    fn heuristics_classify_all_digits_as_department() {
        assert_eq!(resolve_target("12345"), Target::Party("12345".into()));
    }

    #[test]
    fn heuristics_default_to_user() {
        assert_eq!(resolve_target("zhangsan"), Target::User("zhangsan".into()));
    }

    #[test]
    fn case_insensitive_explicit_prefix() {
        assert_eq!(resolve_target("TAG:vip"), Target::Tag("vip".into()));
        assert_eq!(resolve_target("User:bob"), Target::User("bob".into()));
    }
}
