use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Container format advertised by the feed for a media reference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerHint {
    Mp4,
    Hls,
    Dash,
    #[default]
    Unknown,
}

impl ContainerHint {
    /// File extension used for cached copies.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Hls => "m3u8",
            Self::Dash => "mpd",
            Self::Unknown => "bin",
        }
    }

    /// Guess the container from a URI path.
    pub fn from_uri(uri: &str) -> Self {
        let path = uri.split(['?', '#']).next().unwrap_or_default();
        let ext = path.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
        match ext.as_deref() {
            Some("mp4") | Some("m4v") | Some("mov") => Self::Mp4,
            Some("m3u8") => Self::Hls,
            Some("mpd") => Self::Dash,
            _ => Self::Unknown,
        }
    }
}

/// A feed item's media reference.
///
/// Identity is `id`: two descriptors with the same id at different positions are the same item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDescriptor {
    pub id: String,
    pub uri: String,
    #[serde(default)]
    pub container_hint: ContainerHint,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl MediaDescriptor {
    pub fn new(id: impl Into<String>, uri: impl Into<String>) -> Self {
        let uri = uri.into();
        Self {
            id: id.into(),
            container_hint: ContainerHint::from_uri(&uri),
            uri,
            headers: BTreeMap::new(),
        }
    }

    pub fn with_container(mut self, hint: ContainerHint) -> Self {
        self.container_hint = hint;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Stable, filesystem-safe key derived from the id.
    pub fn cache_key(&self) -> String {
        cache_key_for(&self.id)
    }

    /// File name of the cached copy.
    pub fn cache_file_name(&self) -> String {
        format!("{}.{}", self.cache_key(), self.container_hint.extension())
    }
}

/// Hash an asset id into the key used on disk.
pub fn cache_key_for(id: &str) -> String {
    let digest = Sha256::digest(id.as_bytes());
    hex::encode(&digest[..16])
}
