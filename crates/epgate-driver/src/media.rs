//! Local-path media detection and loading.

use std::sync::OnceLock;

use base64::{engine::general_purpose::STANDARD, Engine};
use epgate_core::types::StreamImage;
use md5::{Digest, Md5};
use regex::Regex;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "bmp"];
const SEND_VERBS: &[&str] = &["发送", "发给", "帮我发", "发一下", "传给", "发过去"];

fn local_image_path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:/Users|/tmp)/[^\s]+\.(?:png|jpe?g|gif|webp|bmp)").unwrap())
}

fn local_path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:/Users|/tmp)/[^\s]+").unwrap())
}

/// Finds `/Users/...`/`/tmp/...` paths with an image extension.
pub fn find_local_image_paths(text: &str) -> Vec<String> {
    local_image_path_re().find_iter(text).map(|m| m.as_str().to_string()).collect()
}

/// Finds any `/Users/...`/`/tmp/...` path regardless of extension.
pub fn find_local_paths(text: &str) -> Vec<String> {
    local_path_re().find_iter(text).map(|m| m.as_str().to_string()).collect()
}

/// Guards against exfiltration: a model-suggested local path is only
/// honored if it also appears verbatim in the user's original raw body.
pub fn accept_candidate(path: &str, raw_body: &str) -> bool {
    raw_body.contains(path)
}

pub fn contains_send_intent(text: &str) -> bool {
    SEND_VERBS.iter().any(|verb| text.contains(verb))
}

pub fn is_image_path(path: &str) -> bool {
    path.rsplit('.')
        .next()
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Loads a local file and converts it into a [`StreamImage`] (md5 + base64).
pub async fn load_image_as_stream_image(path: &str) -> std::io::Result<StreamImage> {
    let bytes = tokio::fs::read(path).await?;
    Ok(to_stream_image(&bytes))
}

pub fn to_stream_image(bytes: &[u8]) -> StreamImage {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    let md5 = hex::encode(hasher.finalize());
    StreamImage {
        base64: STANDARD.encode(bytes),
        md5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_local_image_paths_under_tmp_and_users() {
        let text = "see /tmp/a.png and /Users/bob/pic.JPEG and /tmp/notes.txt";
        let found = find_local_image_paths(text);
        assert_eq!(found, vec!["/tmp/a.png", "/Users/bob/pic.JPEG"]);
    }

    #[test]
    fn candidate_guard_requires_raw_body_match() {
        let raw = "please look at /tmp/a.png";
        assert!(accept_candidate("/tmp/a.png", raw));
        assert!(!accept_candidate("/tmp/b.png", raw));
    }

    #[test]
    fn send_intent_detects_common_verbs() {
        assert!(contains_send_intent("帮我发 /tmp/a.png 给张三"));
        assert!(!contains_send_intent("look at this file"));
    }

    #[test]
    fn classifies_image_vs_non_image_extension() {
        assert!(is_image_path("/tmp/a.png"));
        assert!(!is_image_path("/tmp/a.pdf"));
    }

    #[test]
    fn to_stream_image_produces_matching_md5_and_base64() {
        let img = to_stream_image(b"hello");
        assert_eq!(img.md5, "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(img.base64, STANDARD.encode(b"hello"));
    }
}
