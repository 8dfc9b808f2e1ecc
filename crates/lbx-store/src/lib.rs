//! lbx-store: encrypted object store over named blobs
//!
//! Each object is a metadata blob plus either one payload blob or a run of
//! independently encrypted chunks, and optionally a preview. See
//! [`names`] for the blob naming convention and [`metadata`] for the
//! metadata wire format.

pub mod metadata;
pub mod names;
pub mod store;

pub use metadata::MetadataRecord;
pub use store::{DeleteReport, ListFilter, ObjectStore, SaveRequest, StoreOptions};
