//! Helpers for the `data:image/...;base64,` embedding used for images.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Prefix attached to every uploaded image before it is stored or relayed.
pub const JPEG_DATA_URL_PREFIX: &str = "data:image/jpeg;base64,";

/// Return the raw base64 payload of an image, dropping a leading
/// `data:image/...,` header when present.
pub fn strip_data_url_prefix(content: &str) -> &str {
    if !content.starts_with("data:image/") {
        return content;
    }
    match content.find(',') {
        Some(idx) => &content[idx + 1..],
        None => content,
    }
}

/// Wrap an already base64-encoded JPEG payload into a data URL.
pub fn jpeg_data_url(payload: &str) -> String {
    format!("{JPEG_DATA_URL_PREFIX}{payload}")
}

/// Base64-encode raw image bytes into a JPEG data URL.
pub fn encode_jpeg_data_url(bytes: &[u8]) -> String {
    jpeg_data_url(&STANDARD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_jpeg_prefix() {
        assert_eq!(strip_data_url_prefix("data:image/jpeg;base64,AAAA"), "AAAA");
    }

    #[test]
    fn strips_png_prefix() {
        assert_eq!(strip_data_url_prefix("data:image/png;base64,iVBOR"), "iVBOR");
    }

    #[test]
    fn raw_payload_untouched() {
        assert_eq!(strip_data_url_prefix("AAAA"), "AAAA");
    }

    #[test]
    fn prefix_without_comma_untouched() {
        assert_eq!(strip_data_url_prefix("data:image/jpeg"), "data:image/jpeg");
    }

    #[test]
    fn non_image_data_url_untouched() {
        assert_eq!(strip_data_url_prefix("data:text/plain,hi"), "data:text/plain,hi");
    }

    #[test]
    fn encode_bytes() {
        assert_eq!(encode_jpeg_data_url(&[0, 0, 0]), "data:image/jpeg;base64,AAAA");
    }

    #[test]
    fn encode_then_strip_gives_payload() {
        let url = jpeg_data_url("QUJD");
        assert_eq!(strip_data_url_prefix(&url), "QUJD");
    }
}
