use uuid::Uuid;

use crate::types::{Annotations, Header, HeaderValue, Message, Metadata, IDENTITY_HEADER};

/// Canonical hyphenated text form of a uuid.
const TEXT_UUID_LEN: usize = 36;

/// Picks the message identity from its headers.
///
/// The first `_id` header holding a well-formed uuid wins and is reported as client supplied.
/// Otherwise a fresh v4 uuid is generated. This never fails.
pub fn resolve(headers: &[Header]) -> (Uuid, bool) {
    headers
        .iter()
        .filter(|h| h.key == IDENTITY_HEADER)
        .find_map(|h| parse_identity(&h.value))
        .map(|uuid| (uuid, true))
        .unwrap_or_else(|| (Uuid::new_v4(), false))
}

/// Standard (zlib) CRC32 of the raw payload.
pub fn checksum(payload: &[u8]) -> u32 {
    crc32fast::hash(payload)
}

pub fn annotate(message: &Message, metadata: &Metadata) -> Annotations {
    let (uuid, is_client_uuid) = resolve(&metadata.headers);
    Annotations {
        text_uuid: uuid.hyphenated().to_string(),
        is_client_uuid,
        message_crc32: checksum(&message.content),
    }
}

// 16 raw bytes, or the canonical text form.
fn parse_identity(value: &HeaderValue) -> Option<Uuid> {
    let bytes = value.as_bytes();
    match bytes.len() {
        16 => Uuid::from_slice(bytes).ok(),
        TEXT_UUID_LEN => std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| Uuid::try_parse(s).ok()),
        _ => None,
    }
}
