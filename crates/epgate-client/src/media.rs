//! Media content-type inference and hand-rolled multipart body construction.
//!
//! `reqwest::multipart::Part` can't express the `filelength` parameter EP
//! requires in the `Content-Disposition` header, so the multipart body is
//! built by hand here instead of through `reqwest::multipart::Form`.

/// Maps a lowercase file extension to the content-type EP's upload API
/// expects, falling back to `application/octet-stream`.
pub fn content_type_for_extension(ext: &str) -> &'static str {
    match ext.to_ascii_lowercase().as_str() {
        "jpg" => "image/jpg",
        "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "amr" => "voice/amr",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Voice,
    Video,
    File,
}

impl MediaKind {
    pub fn as_query_value(self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Voice => "voice",
            MediaKind::Video => "video",
            MediaKind::File => "file",
        }
    }
}

/// Builds a single-part `multipart/form-data` body for field `media`,
/// returning `(content_type_header_value, body_bytes)`.
pub fn build_multipart_body(filename: &str, content_type: &str, bytes: &[u8]) -> (String, Vec<u8>) {
    let boundary = format!("----epgateboundary{:016x}", boundary_nonce());
    let mut body = Vec::with_capacity(bytes.len() + 256);

    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"media\"; filename=\"{filename}\"; filelength={}\r\n",
            bytes.len()
        )
        .as_bytes(),
    );
    body.extend_from_slice(format!("Content-Type: {content_type}\r\n\r\n").as_bytes());
    body.extend_from_slice(bytes);
    body.extend_from_slice(b"\r\n");
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());

    (format!("multipart/form-data; boundary={boundary}"), body)
}

fn boundary_nonce() -> u64 {
    rand::random::<u64>()
}

/// Extracts a filename from a `Content-Disposition` header value, handling
/// both `filename="…"` and RFC 5987 `filename*=UTF-8''…` forms.
pub fn filename_from_content_disposition(header: &str) -> Option<String> {
    for part in header.split(';').map(str::trim) {
        if let Some(rest) = part.strip_prefix("filename*=") {
            let rest = rest.trim_start_matches("UTF-8''").trim_start_matches("utf-8''");
            return percent_decode(rest);
        }
    }
    for part in header.split(';').map(str::trim) {
        if let Some(rest) = part.strip_prefix("filename=") {
            return Some(rest.trim_matches('"').to_string());
        }
    }
    None
}

fn percent_decode(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_map_covers_known_extensions() {
        assert_eq!(content_type_for_extension("jpg"), "image/jpg");
        assert_eq!(content_type_for_extension("PNG"), "image/png");
        assert_eq!(content_type_for_extension("amr"), "voice/amr");
        assert_eq!(content_type_for_extension("mp4"), "video/mp4");
        assert_eq!(content_type_for_extension("xyz"), "application/octet-stream");
    }

    #[test]
    fn multipart_body_includes_filelength() {
        let (content_type, body) = build_multipart_body("a.png", "image/png", b"hello");
        assert!(content_type.starts_with("multipart/form-data; boundary="));
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("filelength=5"));
        assert!(text.contains("filename=\"a.png\""));
    }

    #[test]
    fn parses_plain_filename() {
        let header = r#"attachment; filename="report.pdf""#;
        assert_eq!(
            filename_from_content_disposition(header),
            Some("report.pdf".to_string())
        );
    }

    #[test]
    fn parses_rfc5987_filename() {
        let header = "attachment; filename*=UTF-8''%e6%8a%a5%e5%91%8a.pdf";
        assert_eq!(
            filename_from_content_disposition(header),
            Some("报告.pdf".to_string())
        );
    }
}
