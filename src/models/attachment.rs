use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Stable reference to an uploaded file, owned by the message it is attached to.
///
/// Tagged by `kind` so consumers match exhaustively instead of probing optional fields.
/// Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Attachment {
    Image {
        url: String,
        name: String,
        size: u64,
        #[serde(rename = "type")]
        content_type: String,
    },
    File {
        url: String,
        name: String,
        size: u64,
        #[serde(rename = "type")]
        content_type: String,
    },
}

impl Attachment {
    /// Build the right variant from the content type.
    pub fn from_upload(url: String, name: String, size: u64, content_type: String) -> Self {
        if content_type.starts_with("image/") {
            Attachment::Image {
                url,
                name,
                size,
                content_type,
            }
        } else {
            Attachment::File {
                url,
                name,
                size,
                content_type,
            }
        }
    }

    pub fn url(&self) -> &str {
        match self {
            Attachment::Image { url, .. } | Attachment::File { url, .. } => url,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Attachment::Image { name, .. } | Attachment::File { name, .. } => name,
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            Attachment::Image { size, .. } | Attachment::File { size, .. } => *size,
        }
    }
}

/// A file picked in the composer, not uploaded yet
#[derive(Debug, Clone)]
pub struct PendingFile {
    pub name: String,
    pub content_type: String,
    pub bytes: Bytes,
}

impl PendingFile {
    pub fn new(name: impl Into<String>, content_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            bytes: bytes.into(),
        }
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}
