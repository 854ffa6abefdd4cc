use thiserror::Error;

use crate::types::Bundle;

/// Leading byte of every stored bundle.
pub const BUNDLE_FORMAT_VERSION: u8 = 1;
pub const BUNDLE_EXTENSION: &str = "bundle";

#[derive(Error, Debug)]
pub enum BundleError {
    #[error("Empty bundle")]
    Empty,
    #[error("Unknown bundle version: {0}")]
    UnknownVersion(u8),
    #[error("Failed to encode bundle: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("Failed to decode bundle: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("Trailing bytes after bundle: {0}")]
    TrailingBytes(usize),
}

pub fn encode(bundle: &Bundle) -> Result<Vec<u8>, BundleError> {
    let mut buf = vec![BUNDLE_FORMAT_VERSION];
    let encoded = bincode::serde::encode_to_vec(bundle, bincode::config::standard())?;
    buf.extend(encoded);
    Ok(buf)
}

pub fn decode(bytes: &[u8]) -> Result<Bundle, BundleError> {
    let (version, payload) = bytes.split_first().ok_or(BundleError::Empty)?;
    match version {
        1 => {
            let (bundle, read): (Bundle, usize) =
                bincode::serde::decode_from_slice(payload, bincode::config::standard())?;
            if read != payload.len() {
                return Err(BundleError::TrailingBytes(payload.len() - read));
            }
            Ok(bundle)
        }
        v => Err(BundleError::UnknownVersion(*v)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Annotations, Header, Message, Metadata};

    fn bundle(content: Vec<u8>) -> Bundle {
        Bundle {
            message: Message::new("blob", content),
            metadata: Metadata {
                topic: "t1".to_string(),
                timestamp: 1_700_000_000_123,
                headers: vec![
                    Header::text("_id", "3f1c5b8e-6a0b-4f5e-9f57-3c3c7c1b2a10"),
                    Header::bytes("sig", vec![0, 159, 146, 150]),
                    Header::text("sig", ""),
                ],
            },
            annotations: Annotations {
                text_uuid: "3f1c5b8e-6a0b-4f5e-9f57-3c3c7c1b2a10".to_string(),
                is_client_uuid: true,
                message_crc32: 42,
            },
        }
    }

    #[test]
    fn test_empty_and_large_payloads_survive() {
        for content in [Vec::new(), vec![0xAB; 3 * 1024 * 1024]] {
            let original = bundle(content);
            let bytes = encode(&original).unwrap();
            assert_eq!(bytes[0], BUNDLE_FORMAT_VERSION);
            assert_eq!(decode(&bytes).unwrap(), original);
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode(&[]), Err(BundleError::Empty)));
        assert!(matches!(decode(&[7, 1, 2]), Err(BundleError::UnknownVersion(7))));
        assert!(matches!(decode(&[1, 255, 255, 255]), Err(BundleError::Decode(_))));
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut bytes = encode(&bundle(b"x".to_vec())).unwrap();
        bytes.extend([0, 0]);
        assert!(matches!(decode(&bytes), Err(BundleError::TrailingBytes(2))));
    }
}
