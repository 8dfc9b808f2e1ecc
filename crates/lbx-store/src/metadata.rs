//! Metadata wire format (JSON, encrypted as one blob)
//!
//! ```json
//! {"name":"clip.mp4","type":"video/mp4","size":5242880,
//!  "folderPath":["media"],"tags":["holiday"],
//!  "uuid":"…","encryptedAt":"2024-06-01T12:00:00.000Z","version":"2.0",
//!  "isChunked":true,"chunkSize":1048576,"totalChunks":5,"originalSize":5242880}
//! ```
//!
//! `version` "1.0" is a single-blob payload, "2.0" a chunked one. Older
//! writers omit any of the optional fields; readers fill them in.

use std::collections::BTreeSet;

use chrono::{DateTime, SecondsFormat, Utc};
use lbx_core::config::DEFAULT_CHUNK_SIZE;
use lbx_core::{LbxError, LbxResult, Layout, ObjectId, ObjectMetadata};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const VERSION_SINGLE: &str = "1.0";
pub const VERSION_CHUNKED: &str = "2.0";

const DEFAULT_MIME: &str = "application/octet-stream";

fn default_mime() -> String {
    DEFAULT_MIME.to_string()
}

fn default_version() -> String {
    VERSION_SINGLE.to_string()
}

/// Pre-encryption JSON record, field names fixed by the vault format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataRecord {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default = "default_mime")]
    pub mime_type: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub folder_path: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub uuid: String,
    #[serde(default)]
    pub encrypted_at: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_chunked: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_preview: Option<bool>,
}

impl MetadataRecord {
    pub fn from_metadata(meta: &ObjectMetadata) -> Self {
        let mut record = Self {
            name: meta.display_name.clone(),
            mime_type: meta.mime_type.clone(),
            size: meta.size,
            folder_path: meta.folder_path.clone(),
            tags: meta.tags.iter().cloned().collect(),
            uuid: meta.id.to_string(),
            encrypted_at: Some(
                meta.created_at
                    .to_rfc3339_opts(SecondsFormat::Millis, true),
            ),
            version: VERSION_SINGLE.to_string(),
            is_chunked: None,
            chunk_size: None,
            total_chunks: None,
            original_size: None,
            has_preview: Some(meta.has_preview),
        };
        if let Layout::Chunked {
            chunk_size,
            chunk_count,
            original_size,
        } = meta.layout
        {
            record.version = VERSION_CHUNKED.to_string();
            record.is_chunked = Some(true);
            record.chunk_size = Some(chunk_size);
            record.total_chunks = Some(chunk_count);
            record.original_size = Some(original_size);
        }
        record
    }

    /// Convert into domain metadata, defaulting absent optional fields.
    ///
    /// `expected` is the id encoded in the blob name; a record claiming a
    /// different id is treated as corrupted.
    pub fn into_metadata(self, expected: Option<ObjectId>) -> LbxResult<ObjectMetadata> {
        let id = Uuid::parse_str(&self.uuid)
            .map_err(|e| LbxError::Corrupted(format!("metadata uuid {:?}: {e}", self.uuid)))?;
        if let Some(expected) = expected {
            if expected != id {
                return Err(LbxError::Corrupted(format!(
                    "metadata blob for {expected} describes {id}"
                )));
            }
        }

        let created_at = self
            .encrypted_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_default();

        let chunked = self.is_chunked.unwrap_or(false) || self.version == VERSION_CHUNKED;
        let layout = if chunked {
            let chunk_size = self.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE);
            if chunk_size == 0 {
                return Err(LbxError::Corrupted(format!("chunk size 0 in metadata of {id}")));
            }
            let original_size = self.original_size.unwrap_or(self.size);
            let chunk_count = match self.total_chunks {
                Some(n) => n,
                None => lbx_crypto::chunk::chunk_count(original_size, chunk_size)?,
            };
            Layout::Chunked {
                chunk_size,
                chunk_count,
                original_size,
            }
        } else {
            Layout::Single
        };

        let size = match layout {
            Layout::Chunked { original_size, .. } if self.size == 0 => original_size,
            _ => self.size,
        };

        Ok(ObjectMetadata {
            id,
            display_name: self.name,
            mime_type: self.mime_type,
            size,
            folder_path: self.folder_path,
            tags: self.tags.into_iter().collect::<BTreeSet<_>>(),
            created_at,
            layout,
            has_preview: self.has_preview.unwrap_or(false),
        })
    }

    pub fn to_bytes(&self) -> LbxResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> LbxResult<Self> {
        serde_json::from_slice(data)
            .map_err(|e| LbxError::Corrupted(format!("metadata JSON: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunked_meta() -> ObjectMetadata {
        ObjectMetadata {
            id: Uuid::new_v4(),
            display_name: "clip.mp4".into(),
            mime_type: "video/mp4".into(),
            size: 5 * 1024 * 1024,
            folder_path: vec!["media".into()],
            tags: ["holiday".to_string()].into_iter().collect(),
            created_at: DateTime::parse_from_rfc3339("2024-06-01T12:00:00.000Z")
                .unwrap()
                .with_timezone(&Utc),
            layout: Layout::Chunked {
                chunk_size: 1024 * 1024,
                chunk_count: 5,
                original_size: 5 * 1024 * 1024,
            },
            has_preview: false,
        }
    }

    #[test]
    fn chunked_record_uses_version_2_and_camel_case() {
        let meta = chunked_meta();
        let json: serde_json::Value =
            serde_json::from_slice(&MetadataRecord::from_metadata(&meta).to_bytes().unwrap())
                .unwrap();

        assert_eq!(json["version"], "2.0");
        assert_eq!(json["type"], "video/mp4");
        assert_eq!(json["isChunked"], true);
        assert_eq!(json["chunkSize"], 1048576);
        assert_eq!(json["totalChunks"], 5);
        assert_eq!(json["originalSize"], 5242880);
        assert_eq!(json["folderPath"][0], "media");
        assert_eq!(json["encryptedAt"], "2024-06-01T12:00:00.000Z");
        assert_eq!(json["uuid"], meta.id.to_string());
    }

    #[test]
    fn single_record_omits_chunk_fields() {
        let mut meta = chunked_meta();
        meta.layout = Layout::Single;
        let json: serde_json::Value =
            serde_json::from_slice(&MetadataRecord::from_metadata(&meta).to_bytes().unwrap())
                .unwrap();
        assert_eq!(json["version"], "1.0");
        assert!(json.get("isChunked").is_none());
        assert!(json.get("chunkSize").is_none());
    }

    #[test]
    fn roundtrip_preserves_metadata() {
        let meta = chunked_meta();
        let bytes = MetadataRecord::from_metadata(&meta).to_bytes().unwrap();
        let back = MetadataRecord::from_bytes(&bytes)
            .unwrap()
            .into_metadata(Some(meta.id))
            .unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn minimal_legacy_record_defaults_safely() {
        let id = Uuid::new_v4();
        let json = format!(r#"{{"name":"a.txt","size":10,"uuid":"{id}"}}"#);
        let meta = MetadataRecord::from_bytes(json.as_bytes())
            .unwrap()
            .into_metadata(Some(id))
            .unwrap();

        assert_eq!(meta.layout, Layout::Single);
        assert_eq!(meta.mime_type, DEFAULT_MIME);
        assert!(meta.folder_path.is_empty());
        assert!(meta.tags.is_empty());
        assert!(!meta.has_preview);
        assert_eq!(meta.created_at, DateTime::<Utc>::default());
    }

    #[test]
    fn version_2_without_chunk_fields_fills_them_in() {
        let id = Uuid::new_v4();
        let json = format!(
            r#"{{"name":"v.mp4","type":"video/mp4","size":2500000,"uuid":"{id}","version":"2.0","unknownField":42}}"#
        );
        let meta = MetadataRecord::from_bytes(json.as_bytes())
            .unwrap()
            .into_metadata(None)
            .unwrap();
        assert_eq!(
            meta.layout,
            Layout::Chunked {
                chunk_size: DEFAULT_CHUNK_SIZE,
                chunk_count: 3,
                original_size: 2_500_000,
            }
        );
    }

    #[test]
    fn mismatched_uuid_is_corrupted() {
        let id = Uuid::new_v4();
        let json = format!(r#"{{"name":"a","uuid":"{id}"}}"#);
        let err = MetadataRecord::from_bytes(json.as_bytes())
            .unwrap()
            .into_metadata(Some(Uuid::new_v4()))
            .unwrap_err();
        assert!(matches!(err, LbxError::Corrupted(_)));
    }

    #[test]
    fn garbage_is_corrupted() {
        assert!(matches!(
            MetadataRecord::from_bytes(b"not json"),
            Err(LbxError::Corrupted(_))
        ));
    }
}
