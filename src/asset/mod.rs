//! Upload side: the remote asset system that receives annotation batches.

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

pub mod client;
pub use client::{ApiCredentials, AssetClient};

/// Result of an upload that reached the asset system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResponse {
    pub ok: bool,
    /// Response body, kept for diagnostics when `ok` is false.
    pub body: String,
}

#[derive(Debug, Error)]
pub enum AssetError {
    #[error("upload transport failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to read payload: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

#[async_trait]
pub trait AssetSink: Send + Sync {
    /// Uploads the tabular payload at `payload` to the tenant-scoped
    /// endpoint, tagged as an "add" operation.
    async fn upload(&self, tenant: &str, payload: &Path) -> Result<UploadResponse, AssetError>;
}
