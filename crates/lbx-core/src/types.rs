use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier of a stored object
pub type ObjectId = Uuid;

/// How an object's payload is laid out in blob storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Layout {
    /// One AEAD blob: `{uuid}.enc`
    Single,
    /// Independently encrypted chunks: `{uuid}.{index}.chunk.enc`
    Chunked {
        chunk_size: u64,
        chunk_count: u32,
        original_size: u64,
    },
}

impl Layout {
    pub fn is_chunked(&self) -> bool {
        matches!(self, Layout::Chunked { .. })
    }

    /// Number of payload blobs backing the object.
    pub fn blob_count(&self) -> u32 {
        match self {
            Layout::Single => 1,
            Layout::Chunked { chunk_count, .. } => *chunk_count,
        }
    }
}

/// Decrypted metadata describing one stored object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub id: ObjectId,
    pub display_name: String,
    pub mime_type: String,
    pub size: u64,
    /// Ordered folder segments, root first
    pub folder_path: Vec<String>,
    pub tags: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub layout: Layout,
    pub has_preview: bool,
}

impl ObjectMetadata {
    pub fn is_video(&self) -> bool {
        self.mime_type.starts_with("video/")
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }

    /// True if the object lives at or below `prefix`.
    pub fn in_folder(&self, prefix: &[String]) -> bool {
        self.folder_path.len() >= prefix.len()
            && self.folder_path.iter().zip(prefix).all(|(a, b)| a == b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(folder: &[&str]) -> ObjectMetadata {
        ObjectMetadata {
            id: Uuid::new_v4(),
            display_name: "clip.mp4".into(),
            mime_type: "video/mp4".into(),
            size: 10,
            folder_path: folder.iter().map(|s| s.to_string()).collect(),
            tags: BTreeSet::new(),
            created_at: Utc::now(),
            layout: Layout::Single,
            has_preview: false,
        }
    }

    #[test]
    fn folder_prefix_matching() {
        let meta = sample(&["media", "2024"]);
        assert!(meta.in_folder(&[]));
        assert!(meta.in_folder(&["media".to_string()]));
        assert!(meta.in_folder(&["media".to_string(), "2024".to_string()]));
        assert!(!meta.in_folder(&["docs".to_string()]));
        assert!(!meta.in_folder(&[
            "media".to_string(),
            "2024".to_string(),
            "june".to_string()
        ]));
    }

    #[test]
    fn blob_count_follows_layout() {
        assert_eq!(Layout::Single.blob_count(), 1);
        let chunked = Layout::Chunked {
            chunk_size: 1024,
            chunk_count: 7,
            original_size: 7000,
        };
        assert_eq!(chunked.blob_count(), 7);
        assert!(chunked.is_chunked());
        assert!(sample(&[]).is_video());
    }
}
