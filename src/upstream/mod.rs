pub mod http;

pub use http::HttpFetcher;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// Retrieves raw tile bytes from a URL.
#[async_trait]
pub trait TileFetcher: Send + Sync {
    /// Fetches `url`, sending `If-None-Match` when an etag is known.
    async fn fetch(&self, url: &str, etag: Option<&str>) -> Result<FetchResult>;
}

#[derive(Debug)]
pub enum FetchResult {
    Data { data: Bytes, etag: Option<String> },
    NotModified,
}
