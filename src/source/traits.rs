use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

pub struct SourceInfo {
    /// Announced body length; `None` when the server sent no length.
    pub content_length: Option<u64>,
    pub content_type: String,
}

/// An opened transfer: response metadata plus the body delivered chunk by chunk.
pub struct SourceStream {
    pub info: SourceInfo,
    pub chunks: mpsc::Receiver<Result<Bytes>>,
}

#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn open(&self, url: &str) -> Result<SourceStream>;
}
