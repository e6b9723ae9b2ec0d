//! Durable blob store boundary.
//!
//! The pipeline never re-downloads uploaded images; it only records the
//! identifiers the store hands back. In the original deployment this was a
//! messaging channel used as object storage, where `locator_id` was the
//! message id and `entry_id` the attachment's file id.

use crate::RenderError;
use async_trait::async_trait;
use std::path::Path;

/// Opaque reference to an uploaded render in the remote store.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRef {
    pub locator_id: i64,
    pub entry_id: String,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Upload a local capture file with a caption, returning the reference
    /// to record in the cache store.
    async fn upload(&self, local_file: &Path, caption: &str) -> Result<RemoteRef, RenderError>;
}
