//! Legacy payload classification: untagged datagrams from peers that predate
//! the framed protocol. Text carries a `"msg:"` prefix, controls are literal
//! tokens, images are recognized by magic number.

/// Prefix marking untagged UTF-8 text.
pub const TEXT_PREFIX: &str = "msg:";
/// Literal delivery-acknowledgment token.
pub const TOKEN_CHECKED: &str = "checked";
/// Literal graceful-disconnect token.
pub const TOKEN_DISCONNECT: &str = "disconnect";

/// What an untagged payload turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegacyPayload {
    Text(String),
    Image(Vec<u8>),
    Checked,
    Disconnect,
    /// Anything else. Dropped silently by the router.
    Unrecognized,
}

/// Classify an untagged payload. Image magic is checked first, then the
/// text prefix and control tokens.
pub fn classify(bytes: &[u8]) -> LegacyPayload {
    if looks_like_image(bytes) {
        return LegacyPayload::Image(bytes.to_vec());
    }
    let Ok(text) = std::str::from_utf8(bytes) else {
        return LegacyPayload::Unrecognized;
    };
    if let Some(body) = text.strip_prefix(TEXT_PREFIX) {
        return LegacyPayload::Text(body.to_string());
    }
    match text {
        TOKEN_CHECKED => LegacyPayload::Checked,
        TOKEN_DISCONNECT => LegacyPayload::Disconnect,
        _ => LegacyPayload::Unrecognized,
    }
}

/// Encode text the way legacy peers expect it.
pub fn encode_text(body: &str) -> Vec<u8> {
    format!("{TEXT_PREFIX}{body}").into_bytes()
}

const JPEG_MAGIC: &[u8] = &[0xff, 0xd8, 0xff];
const PNG_MAGIC: &[u8] = &[0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a];

fn looks_like_image(bytes: &[u8]) -> bool {
    bytes.starts_with(JPEG_MAGIC) || bytes.starts_with(PNG_MAGIC)
}
