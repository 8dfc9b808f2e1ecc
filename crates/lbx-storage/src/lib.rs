//! lbx-storage: named-blob storage for the lockbox object store
//!
//! The store only needs five operations on opaque named blobs; everything
//! above this crate is backend-agnostic.

pub mod blob;
pub mod health;
pub mod operator;

pub use blob::{BlobStorage, OpendalBlobStorage};
pub use health::{check_health, is_healthy};
pub use operator::{build_operator, memory_operator};
