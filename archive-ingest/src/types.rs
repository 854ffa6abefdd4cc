use serde::{Deserialize, Serialize};

/// Header carrying the publisher-assigned message identity.
pub const IDENTITY_HEADER: &str = "_id";
/// Header carrying the publisher's payload format tag.
pub const FORMAT_HEADER: &str = "_format";
/// Header keys starting with this prefix belong to the broker or the archiver.
pub const RESERVED_HEADER_PREFIX: &str = "_";
pub const DEFAULT_FORMAT: &str = "blob";

/// Raw payload plus the format tag it was published with. Never modified after receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub format: String,
    pub content: Vec<u8>,
}

impl Message {
    pub fn new(format: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            format: format.into(),
            content: content.into(),
        }
    }

    /// Builds a message, taking the format tag from the first `_format` text header.
    pub fn from_headers(headers: &[Header], content: impl Into<Vec<u8>>) -> Self {
        let format = headers
            .iter()
            .filter(|h| h.key == FORMAT_HEADER)
            .find_map(|h| match &h.value {
                HeaderValue::Text(s) if !s.is_empty() => Some(s.clone()),
                _ => None,
            })
            .unwrap_or_else(|| DEFAULT_FORMAT.to_string());
        Self::new(format, content)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeaderValue {
    Text(String),
    Bytes(Vec<u8>),
}

impl HeaderValue {
    /// Broker headers arrive as bytes; valid UTF-8 is kept as text.
    pub fn from_wire(value: Option<&[u8]>) -> Self {
        match value {
            None => HeaderValue::Text(String::new()),
            Some(bytes) => match std::str::from_utf8(bytes) {
                Ok(s) => HeaderValue::Text(s.to_string()),
                Err(_) => HeaderValue::Bytes(bytes.to_vec()),
            },
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            HeaderValue::Text(s) => s.as_bytes(),
            HeaderValue::Bytes(b) => b,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub key: String,
    pub value: HeaderValue,
}

impl Header {
    pub fn text(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: HeaderValue::Text(value.into()),
        }
    }

    pub fn bytes(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: HeaderValue::Bytes(value.into()),
        }
    }

    pub fn is_reserved(&self) -> bool {
        self.key.starts_with(RESERVED_HEADER_PREFIX)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub topic: String,
    /// Broker-assigned, milliseconds since the epoch.
    pub timestamp: i64,
    /// In wire order. Keys may repeat.
    pub headers: Vec<Header>,
}

/// Identity annotations, fixed once the message has been identified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotations {
    pub text_uuid: String,
    pub is_client_uuid: bool,
    pub message_crc32: u32,
}

/// What the object store reports back after a successful put.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreInfo {
    pub size: u64,
    pub key: String,
    pub bucket: String,
    pub bundle_crc32: u32,
}

/// Identity annotations enriched with the storage result, handed to the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAnnotations {
    pub identity: Annotations,
    pub store: StoreInfo,
}

/// The unit of storage: one serialized object per archived message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    pub message: Message,
    pub metadata: Metadata,
    pub annotations: Annotations,
}
