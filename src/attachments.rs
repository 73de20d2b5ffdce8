use crate::constants::{ATTACHMENT_TRUNCATION_MARKER, MAX_ATTACHMENT_CHARS, NUL_BINARY_FRACTION};
use crate::types::FileAttachment;
use base64::Engine;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref DATA_URL_RE: Regex = match Regex::new(r"^data:[^;]+;base64,(.+)$") {
        Ok(re) => re,
        Err(e) => panic!("invalid data URL regex: {}", e),
    };
}

/// Extracts the text content of an attachment, or `None` when the attachment
/// is not text (images, binaries, malformed data URLs). Pure and infallible:
/// every failure collapses to `None`.
///
/// Output is capped at 50,000 characters with an explicit truncation marker;
/// the cap bounds prompt size and is a hard contract, not a suggestion.
pub fn extract_file_content(file: &FileAttachment) -> Option<String> {
    // Images are inlined by the conversation builder as multimodal parts
    if file.is_image() {
        return None;
    }

    let payload = DATA_URL_RE
        .captures(&file.data)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())?;

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload)
        .ok()?;

    if bytes.is_empty() {
        return Some(String::new());
    }

    if looks_binary(&bytes) {
        return None;
    }

    let content = match String::from_utf8(bytes) {
        Ok(text) => text,
        // Latin-1 maps every byte, so this is the terminal fallback
        Err(e) => decode_latin1(e.as_bytes()),
    };

    Some(crate::str_utils::truncate_chars(
        &content,
        MAX_ATTACHMENT_CHARS,
        ATTACHMENT_TRUNCATION_MARKER,
    ))
}

/// NUL-fraction heuristic: at or above the threshold the payload is treated
/// as binary. The 10% figure classifies obviously-binary vs obviously-text;
/// it carries no meaning beyond that.
fn looks_binary(bytes: &[u8]) -> bool {
    let nul_count = bytes.iter().filter(|b| **b == 0).count();
    nul_count as f64 >= bytes.len() as f64 * NUL_BINARY_FRACTION
}

fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    fn attachment(mime: &str, bytes: &[u8]) -> FileAttachment {
        let payload = base64::engine::general_purpose::STANDARD.encode(bytes);
        FileAttachment {
            name: "test.txt".to_string(),
            mime_type: mime.to_string(),
            size: bytes.len() as u64,
            data: format!("data:{};base64,{}", mime, payload),
        }
    }

    #[test]
    fn test_plain_text_extracts() {
        let file = attachment("text/plain", b"hello world");
        assert_eq!(extract_file_content(&file).as_deref(), Some("hello world"));
    }

    #[test]
    fn test_image_mime_never_extracts() {
        let file = attachment("image/png", b"hello world");
        assert!(extract_file_content(&file).is_none());
    }

    #[test]
    fn test_non_data_url_rejected() {
        let file = FileAttachment {
            name: "x".to_string(),
            mime_type: "text/plain".to_string(),
            size: 3,
            data: "https://example.com/x.txt".to_string(),
        };
        assert!(extract_file_content(&file).is_none());
    }

    #[test]
    fn test_invalid_base64_rejected() {
        let file = FileAttachment {
            name: "x".to_string(),
            mime_type: "text/plain".to_string(),
            size: 3,
            data: "data:text/plain;base64,!!!not-base64!!!".to_string(),
        };
        assert!(extract_file_content(&file).is_none());
    }

    #[test]
    fn test_nul_fraction_boundary() {
        // Exactly 10% NUL bytes: binary
        let mut bytes = vec![b'a'; 90];
        bytes.extend(vec![0u8; 10]);
        let file = attachment("application/octet-stream", &bytes);
        assert!(extract_file_content(&file).is_none());

        // 9% NUL bytes: text
        let mut bytes = vec![b'a'; 91];
        bytes.extend(vec![0u8; 9]);
        let file = attachment("application/octet-stream", &bytes);
        assert!(extract_file_content(&file).is_some());
    }

    #[test]
    fn test_latin1_fallback_for_invalid_utf8() {
        // 0xE9 alone is invalid UTF-8 but is 'é' in Latin-1
        let file = attachment("text/plain", &[b'c', b'a', b'f', 0xE9]);
        assert_eq!(extract_file_content(&file).as_deref(), Some("café"));
    }

    #[test]
    fn test_truncation_boundary() {
        let exact = "a".repeat(MAX_ATTACHMENT_CHARS);
        let file = attachment("text/plain", exact.as_bytes());
        let out = extract_file_content(&file).unwrap();
        assert_eq!(out.len(), MAX_ATTACHMENT_CHARS);
        assert!(!out.contains("truncated"));

        let over = "a".repeat(MAX_ATTACHMENT_CHARS + 1);
        let file = attachment("text/plain", over.as_bytes());
        let out = extract_file_content(&file).unwrap();
        assert!(out.ends_with(ATTACHMENT_TRUNCATION_MARKER));
        assert_eq!(
            out.len(),
            MAX_ATTACHMENT_CHARS + ATTACHMENT_TRUNCATION_MARKER.len()
        );
    }

    #[test]
    fn test_extraction_is_idempotent() {
        let file = attachment("text/csv", b"a,b,c\n1,2,3");
        assert_eq!(extract_file_content(&file), extract_file_content(&file));
        let binary = attachment("application/octet-stream", &[0u8; 64]);
        assert_eq!(extract_file_content(&binary), extract_file_content(&binary));
    }
}
