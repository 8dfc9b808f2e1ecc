//! Blob naming convention.
//!
//! ```text
//! {uuid}.enc                 single-layout payload
//! {uuid}.{index}.chunk.enc   chunk payload
//! {uuid}.metadata.enc        metadata
//! {uuid}.preview.enc         optional preview
//! ```
//!
//! These names are read by other implementations of the vault format and
//! must not change.

use lbx_core::ObjectId;
use uuid::Uuid;

const ENC: &str = ".enc";
const CHUNK_ENC: &str = ".chunk.enc";
const METADATA_ENC: &str = ".metadata.enc";
const PREVIEW_ENC: &str = ".preview.enc";

/// Which part of an object a blob holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobKind {
    Payload,
    Chunk(u32),
    Metadata,
    Preview,
}

pub fn payload_name(id: &ObjectId) -> String {
    format!("{id}{ENC}")
}

pub fn chunk_name(id: &ObjectId, index: u32) -> String {
    format!("{id}.{index}{CHUNK_ENC}")
}

pub fn metadata_name(id: &ObjectId) -> String {
    format!("{id}{METADATA_ENC}")
}

pub fn preview_name(id: &ObjectId) -> String {
    format!("{id}{PREVIEW_ENC}")
}

/// Classify a blob name. Names outside the convention yield `None`.
pub fn parse_blob_name(name: &str) -> Option<(ObjectId, BlobKind)> {
    if let Some(stem) = name.strip_suffix(METADATA_ENC) {
        return Some((Uuid::parse_str(stem).ok()?, BlobKind::Metadata));
    }
    if let Some(stem) = name.strip_suffix(PREVIEW_ENC) {
        return Some((Uuid::parse_str(stem).ok()?, BlobKind::Preview));
    }
    if let Some(stem) = name.strip_suffix(CHUNK_ENC) {
        let (id, index) = stem.rsplit_once('.')?;
        let index = index.parse::<u32>().ok()?;
        return Some((Uuid::parse_str(id).ok()?, BlobKind::Chunk(index)));
    }
    let stem = name.strip_suffix(ENC)?;
    Some((Uuid::parse_str(stem).ok()?, BlobKind::Payload))
}

/// Object id of a metadata blob name.
pub fn parse_metadata_name(name: &str) -> Option<ObjectId> {
    match parse_blob_name(name)? {
        (id, BlobKind::Metadata) => Some(id),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "3f2c8a9e-1b4d-4c6e-9f0a-2b3c4d5e6f70";

    fn id() -> ObjectId {
        Uuid::parse_str(ID).unwrap()
    }

    #[test]
    fn names_follow_convention() {
        let id = id();
        assert_eq!(payload_name(&id), format!("{ID}.enc"));
        assert_eq!(chunk_name(&id, 12), format!("{ID}.12.chunk.enc"));
        assert_eq!(metadata_name(&id), format!("{ID}.metadata.enc"));
        assert_eq!(preview_name(&id), format!("{ID}.preview.enc"));
    }

    #[test]
    fn parse_roundtrips_every_kind() {
        let id = id();
        assert_eq!(parse_blob_name(&payload_name(&id)), Some((id, BlobKind::Payload)));
        assert_eq!(parse_blob_name(&chunk_name(&id, 0)), Some((id, BlobKind::Chunk(0))));
        assert_eq!(parse_blob_name(&chunk_name(&id, 4096)), Some((id, BlobKind::Chunk(4096))));
        assert_eq!(parse_blob_name(&metadata_name(&id)), Some((id, BlobKind::Metadata)));
        assert_eq!(parse_blob_name(&preview_name(&id)), Some((id, BlobKind::Preview)));
    }

    #[test]
    fn foreign_names_are_ignored() {
        assert_eq!(parse_blob_name("notes.txt"), None);
        assert_eq!(parse_blob_name("vault.enc"), None);
        assert_eq!(parse_blob_name(&format!("{ID}.x.chunk.enc")), None);
        assert_eq!(parse_blob_name(".metadata.enc"), None);
        assert_eq!(parse_metadata_name(&payload_name(&id())), None);
        assert_eq!(parse_metadata_name(&metadata_name(&id())), Some(id()));
    }
}
