use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{CompletedPart, RangeBody, ResolveResponse, StartUploadResponse, TransferApi};
use crate::{Error, Result};

const RETRYABLE_STATUS: [u16; 5] = [429, 500, 502, 503, 504];

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
        }
    }
}

/// Retry `op` on `Error::Transient` with exponential backoff
/// (`base_delay * 2^attempt`). Any other error, and the last transient error
/// once attempts are exhausted, propagate to the caller.
pub(crate) async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(Error::Transient { message }) if attempt + 1 < policy.max_attempts => {
                let delay = policy.base_delay * 2u32.saturating_pow(attempt);
                debug!(
                    event = "io.retry",
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "io.retry"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpTransferApiConfig {
    pub base_url: String,
    pub token: String,
    pub retry: RetryPolicy,
}

/// HTTPS implementation of [`TransferApi`]. Holds the one `reqwest::Client`
/// (and so the one connection pool) for the whole invocation.
pub struct HttpTransferApi {
    config: HttpTransferApiConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct SignedUrlData {
    url: String,
}

#[derive(Debug, Deserialize)]
struct SignedUrlsData {
    urls: HashMap<String, String>,
}

impl HttpTransferApi {
    pub fn new(config: HttpTransferApiConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self, name: &str) -> String {
        format!("{}/ldata/{name}", self.config.base_url.trim_end_matches('/'))
    }

    fn transient(message: String) -> Error {
        Error::Transient { message }
    }

    fn classify_reqwest(context: &str, e: reqwest::Error) -> Error {
        if e.is_connect() || e.is_timeout() {
            Self::transient(format!("{context}: {e}"))
        } else {
            Error::Api {
                message: format!("{context}: {e}"),
            }
        }
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        name: &str,
        body: &serde_json::Value,
    ) -> Result<T> {
        let res = self
            .client
            .post(self.endpoint(name))
            .bearer_auth(&self.config.token)
            .json(body)
            .send()
            .await
            .map_err(|e| Self::classify_reqwest(name, e))?;

        let status = res.status();
        if RETRYABLE_STATUS.contains(&status.as_u16()) {
            return Err(Self::transient(format!("{name}: http {status}")));
        }
        let text = res.text().await.map_err(|e| Error::Api {
            message: format!("{name}: read response failed: {e}"),
        })?;
        if !status.is_success() {
            return Err(Error::Api {
                message: format!("{name}: http {status}: {text}"),
            });
        }

        let parsed: Envelope<T> = serde_json::from_str(&text).map_err(|e| Error::Protocol {
            message: format!("{name}: invalid json: {e}; body={text}"),
        })?;
        Ok(parsed.data)
    }

    async fn post_expect_ok(&self, name: &str, body: &serde_json::Value) -> Result<()> {
        let res = self
            .client
            .post(self.endpoint(name))
            .bearer_auth(&self.config.token)
            .json(body)
            .send()
            .await
            .map_err(|e| Self::classify_reqwest(name, e))?;

        let status = res.status();
        if RETRYABLE_STATUS.contains(&status.as_u16()) {
            return Err(Self::transient(format!("{name}: http {status}")));
        }
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(Error::Api {
                message: format!("{name}: http {status}: {text}"),
            });
        }
        Ok(())
    }

    async fn put_part_once(&self, url: &str, bytes: Vec<u8>) -> Result<String> {
        let res = self
            .client
            .put(url)
            .body(bytes)
            .send()
            .await
            .map_err(|e| Self::classify_reqwest("put_part", e))?;

        let status = res.status();
        if RETRYABLE_STATUS.contains(&status.as_u16()) {
            return Err(Self::transient(format!("put_part: http {status}")));
        }
        if !status.is_success() {
            return Err(Error::Api {
                message: format!("put_part: http {status}"),
            });
        }

        // A successful part put without an ETag cannot be finalized; the
        // response is malformed, not transient.
        let etag = res
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::Protocol {
                message: "part response missing ETag header".to_string(),
            })?;
        Ok(etag.to_string())
    }

    async fn get_range_once(&self, url: &str, offset: u64, len: Option<u64>) -> Result<RangeBody> {
        let mut req = self.client.get(url);
        if let Some(len) = len {
            let end = offset + len - 1;
            req = req.header(reqwest::header::RANGE, format!("bytes={offset}-{end}"));
        }
        let res = req
            .send()
            .await
            .map_err(|e| Self::classify_reqwest("get_range", e))?;

        let status = res.status();
        if RETRYABLE_STATUS.contains(&status.as_u16()) {
            return Err(Self::transient(format!("get_range: http {status}")));
        }
        // A range on a zero-length object is unsatisfiable; that is the
        // empty read, not an error.
        if status == reqwest::StatusCode::RANGE_NOT_SATISFIABLE {
            return Ok(RangeBody {
                bytes: Vec::new(),
                total_size: Some(0),
            });
        }
        if !status.is_success() {
            return Err(Error::Api {
                message: format!("get_range: http {status}"),
            });
        }

        let total_size = if status == reqwest::StatusCode::PARTIAL_CONTENT {
            Some(parse_content_range_total(res.headers())?)
        } else {
            // Whole-object response; a missing length is a protocol
            // violation because the caller sizes its write from it.
            res.headers()
                .get(reqwest::header::CONTENT_LENGTH)
                .ok_or_else(|| Error::Protocol {
                    message: "download response missing Content-Length".to_string(),
                })?;
            None
        };

        let bytes = res
            .bytes()
            .await
            .map_err(|e| Self::transient(format!("get_range: read body failed: {e}")))?;
        Ok(RangeBody {
            bytes: bytes.to_vec(),
            total_size,
        })
    }
}

fn parse_content_range_total(headers: &reqwest::header::HeaderMap) -> Result<u64> {
    let value = headers
        .get(reqwest::header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::Protocol {
            message: "ranged response missing Content-Range".to_string(),
        })?;
    // Format: "bytes <start>-<end>/<total>"
    value
        .rsplit('/')
        .next()
        .and_then(|total| total.parse().ok())
        .ok_or_else(|| Error::Protocol {
            message: format!("unparseable Content-Range: {value}"),
        })
}

impl TransferApi for HttpTransferApi {
    fn resolve<'a>(
        &'a self,
        paths: &'a [String],
        allow_parent: bool,
    ) -> Pin<Box<dyn Future<Output = Result<ResolveResponse>> + Send + 'a>> {
        Box::pin(async move {
            let body = json!({ "paths": paths, "allow_parent": allow_parent });
            with_retry(&self.config.retry, || {
                self.post_json::<ResolveResponse>("resolve-paths", &body)
            })
            .await
        })
    }

    fn start_upload<'a>(
        &'a self,
        path: &'a str,
        content_type: &'a str,
        part_count: u64,
    ) -> Pin<Box<dyn Future<Output = Result<StartUploadResponse>> + Send + 'a>> {
        Box::pin(async move {
            let body = json!({
                "path": path,
                "content_type": content_type,
                "part_count": part_count,
            });
            with_retry(&self.config.retry, || {
                self.post_json::<StartUploadResponse>("start-upload", &body)
            })
            .await
        })
    }

    fn end_upload<'a>(
        &'a self,
        path: &'a str,
        upload_id: &'a str,
        parts: Vec<CompletedPart>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let body = json!({ "path": path, "upload_id": upload_id, "parts": parts });
            with_retry(&self.config.retry, || self.post_expect_ok("end-upload", &body)).await
        })
    }

    fn signed_url<'a>(
        &'a self,
        path: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(async move {
            let body = json!({ "path": path });
            let data = with_retry(&self.config.retry, || {
                self.post_json::<SignedUrlData>("signed-url", &body)
            })
            .await?;
            Ok(data.url)
        })
    }

    fn signed_urls_recursive<'a>(
        &'a self,
        path: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<HashMap<String, String>>> + Send + 'a>> {
        Box::pin(async move {
            let body = json!({ "path": path });
            let data = with_retry(&self.config.retry, || {
                self.post_json::<SignedUrlsData>("signed-urls-recursive", &body)
            })
            .await?;
            Ok(data.urls)
        })
    }

    fn put_part<'a>(
        &'a self,
        url: &'a str,
        bytes: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(async move {
            with_retry(&self.config.retry, || self.put_part_once(url, bytes.clone())).await
        })
    }

    fn get_range<'a>(
        &'a self,
        url: &'a str,
        offset: u64,
        len: Option<u64>,
    ) -> Pin<Box<dyn Future<Output = Result<RangeBody>> + Send + 'a>> {
        Box::pin(async move {
            with_retry(&self.config.retry, || self.get_range_once(url, offset, len)).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn with_retry_retries_transient_until_success() {
        let attempts = AtomicUsize::new(0);
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(1),
        };

        let value = with_retry(&policy, || async {
            if attempts.fetch_add(1, Ordering::Relaxed) < 2 {
                Err(Error::Transient {
                    message: "boom".to_string(),
                })
            } else {
                Ok(7u32)
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(attempts.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn with_retry_gives_up_after_max_attempts() {
        let attempts = AtomicUsize::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        };

        let err = with_retry::<u32, _, _>(&policy, || async {
            attempts.fetch_add(1, Ordering::Relaxed);
            Err(Error::Transient {
                message: "still down".to_string(),
            })
        })
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Transient { .. }));
        assert_eq!(attempts.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn with_retry_does_not_retry_fatal_errors() {
        let attempts = AtomicUsize::new(0);
        let policy = RetryPolicy::default();

        let err = with_retry::<u32, _, _>(&policy, || async {
            attempts.fetch_add(1, Ordering::Relaxed);
            Err(Error::Protocol {
                message: "missing etag".to_string(),
            })
        })
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Protocol { .. }));
        assert_eq!(attempts.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn content_range_total_parses() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::CONTENT_RANGE,
            "bytes 0-15/4096".parse().unwrap(),
        );
        assert_eq!(parse_content_range_total(&headers).unwrap(), 4096);
    }
}
