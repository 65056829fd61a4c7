use super::{FetchResult, TileFetcher};
use crate::config::Config;
use crate::error::{Result, TileError};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ETAG, IF_NONE_MATCH};
use reqwest::Client;
use std::time::Duration;

const ACCEPT_HEADER: &str = "image/png, image/jpeg, image/gif, */*";

/// Fetches tiles over HTTP with a fixed overall timeout per request.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_timeout(&config.user_agent, config.upstream_timeout)
    }

    pub fn with_timeout(user_agent: &str, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_HEADER));

        let client = Client::builder()
            .user_agent(user_agent)
            .default_headers(headers)
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(TileError::Upstream)?;

        Ok(Self { client })
    }
}

fn classify(e: reqwest::Error) -> TileError {
    if e.is_timeout() {
        TileError::Timeout
    } else {
        TileError::Upstream(e)
    }
}

#[async_trait]
impl TileFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, etag: Option<&str>) -> Result<FetchResult> {
        let mut request = self.client.get(url);

        if let Some(etag) = etag {
            request = request.header(IF_NONE_MATCH, etag);
        }

        let response = request.send().await.map_err(classify)?;
        let status = response.status();

        match status.as_u16() {
            304 => {
                tracing::debug!(url, "Tile not modified (304)");
                Ok(FetchResult::NotModified)
            }
            404 => Err(TileError::NotFound),
            _ if status.is_success() => {
                let etag = response
                    .headers()
                    .get(ETAG)
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string());

                let data = response.bytes().await.map_err(classify)?;
                tracing::debug!(url, size = data.len(), "Fetched tile from upstream");
                Ok(FetchResult::Data { data, etag })
            }
            code => Err(TileError::UpstreamStatus(code)),
        }
    }
}
