pub mod config;
pub mod error;
pub mod types;

pub use error::{LbxError, LbxResult};
pub use types::{Layout, ObjectId, ObjectMetadata};
