use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::header::{CONTENT_TYPE, ETAG, IF_NONE_MATCH, USER_AGENT};
use reqwest::StatusCode;
use serde::Serialize;

use crate::read_cache::{CacheRequest, ReadCache};

/// What the origin said when asked for a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome<V> {
    Fresh {
        payload: V,
        validator: Option<String>,
    },
    /// The stale validator offered to the origin is still current.
    NotModified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchSource {
    Cache,
    Revalidated,
    Origin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedFetch<V> {
    pub payload: V,
    pub validator: Option<String>,
    pub source: FetchSource,
}

/// Serves `request` from `cache` when fresh, otherwise calls `fetch` with the
/// stale validator (if any) and updates the cache from its outcome.
pub async fn fetch_cached<V, F, Fut>(
    cache: &ReadCache<V>,
    request: &CacheRequest,
    fetch: F,
) -> Result<CachedFetch<V>>
where
    V: Clone,
    F: FnOnce(Option<String>) -> Fut,
    Fut: Future<Output = Result<FetchOutcome<V>>>,
{
    let stale = cache.peek(request);
    if let Some(hit) = cache.get(request) {
        return Ok(CachedFetch {
            payload: hit.payload,
            validator: hit.validator,
            source: FetchSource::Cache,
        });
    }

    let stale_validator = stale.as_ref().and_then(|value| value.validator.clone());
    match fetch(stale_validator.clone()).await? {
        FetchOutcome::Fresh { payload, validator } => {
            cache.set(request, payload.clone(), validator.clone());
            Ok(CachedFetch {
                payload,
                validator,
                source: FetchSource::Origin,
            })
        }
        FetchOutcome::NotModified => {
            let (Some(stale), Some(validator)) = (stale, stale_validator) else {
                bail!(
                    "origin reported '{}' not modified but no cached validator exists",
                    request.url
                );
            };
            // get() drops expired entries; put the stale payload back with a fresh TTL.
            if !cache.is_valid(request, &validator) {
                cache.set(request, stale.payload.clone(), Some(validator.clone()));
            }
            Ok(CachedFetch {
                payload: stale.payload,
                validator: Some(validator),
                source: FetchSource::Revalidated,
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedHttpResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

/// GET client that answers from a [`ReadCache`] and revalidates with `ETag`.
#[derive(Debug, Clone)]
pub struct CachedHttpClient {
    http: reqwest::Client,
    cache: Arc<ReadCache<CachedHttpResponse>>,
}

impl CachedHttpClient {
    pub fn new(cache: Arc<ReadCache<CachedHttpResponse>>, request_timeout_ms: u64) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            USER_AGENT,
            reqwest::header::HeaderValue::from_static("tau-io-layer"),
        );
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(request_timeout_ms.max(1)))
            .build()
            .context("failed to create cached http client")?;
        Ok(Self { http, cache })
    }

    pub fn cache(&self) -> &Arc<ReadCache<CachedHttpResponse>> {
        &self.cache
    }

    #[tracing::instrument(name = "netbatch.cached_get", skip_all, fields(url = %request.url))]
    pub async fn get(&self, request: &CacheRequest) -> Result<CachedFetch<CachedHttpResponse>> {
        let fetched = fetch_cached(&self.cache, request, |validator| async move {
            let mut builder = self.http.get(&request.url);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(validator) = &validator {
                builder = builder.header(IF_NONE_MATCH, validator.as_str());
            }
            let response = builder
                .send()
                .await
                .with_context(|| format!("failed to fetch '{}'", request.url))?;
            let status = response.status();
            if status == StatusCode::NOT_MODIFIED {
                return Ok(FetchOutcome::NotModified);
            }
            if !status.is_success() {
                bail!("fetch of '{}' returned status {}", request.url, status);
            }
            let header_text = |name: reqwest::header::HeaderName| {
                response
                    .headers()
                    .get(name)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string)
            };
            let validator = header_text(ETAG);
            let content_type = header_text(CONTENT_TYPE);
            let body = response
                .text()
                .await
                .with_context(|| format!("failed to read body of '{}'", request.url))?;
            Ok(FetchOutcome::Fresh {
                payload: CachedHttpResponse {
                    status: status.as_u16(),
                    content_type,
                    body,
                },
                validator,
            })
        })
        .await?;
        tracing::debug!(source = ?fetched.source, "cached fetch complete");
        Ok(fetched)
    }
}
