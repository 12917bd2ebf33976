use encoding_rs::{Encoding, UTF_8};
use regex::Regex;
use reqwest::{Client, ClientBuilder, StatusCode};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::classifier::DataUri;
use crate::config::SnapshotConfig;
use crate::error::{JobError, ReferenceError};

/// How far into a page to look for a `<meta charset>` declaration.
const META_SNIFF_BYTES: usize = 1024;

/// Bytes acquired for one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedBody {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Result of a single fetch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Success(FetchedBody),
    /// Never retried (404, a 2xx other than 200, undecodable data URI).
    PermanentFailure(String),
    /// Network error or any other non-2xx status.
    TransientFailure(String),
}

/// Final outcome of a fetch, after retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchReport {
    pub outcome: FetchOutcome,
    /// HTTP requests actually issued; zero for data URIs and caller-supplied bodies.
    pub attempts: u32,
}

impl FetchReport {
    pub fn into_result(self, url: &str) -> Result<FetchedBody, ReferenceError> {
        match self.outcome {
            FetchOutcome::Success(body) => Ok(body),
            FetchOutcome::PermanentFailure(reason) => Err(ReferenceError::FetchPermanent {
                url: url.to_string(),
                reason,
            }),
            FetchOutcome::TransientFailure(reason) => Err(ReferenceError::FetchTransient {
                url: url.to_string(),
                reason,
            }),
        }
    }
}

/// Linear backoff: the wait after attempt `n` is `n * base_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

/// Acquires resource bytes: decodes data URIs, GETs network URLs with retry.
///
/// Network fetches made through [`ResourceFetcher::fetch`] share one
/// semaphore, so at most `concurrency_limit` requests are in flight at once.
#[derive(Clone)]
pub struct ResourceFetcher {
    client: Client,
    retry: RetryPolicy,
    limiter: Arc<Semaphore>,
    prefetched: Arc<HashMap<String, Vec<u8>>>,
}

impl ResourceFetcher {
    pub fn new(config: &SnapshotConfig) -> Result<Self, JobError> {
        let client = Self::build_http_client(config).map_err(JobError::HttpClient)?;
        Ok(Self {
            client,
            retry: RetryPolicy::new(config.max_retries, config.retry_base_delay()),
            limiter: Arc::new(Semaphore::new(config.concurrency_limit.max(1))),
            prefetched: Arc::new(HashMap::new()),
        })
    }

    fn build_http_client(config: &SnapshotConfig) -> reqwest::Result<Client> {
        ClientBuilder::new()
            .use_rustls_tls()
            .user_agent(config.user_agent.as_str())
            .timeout(config.fetch_timeout())
            .connect_timeout(config.connect_timeout())
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Bodies the caller already captured, keyed by absolute URL.
    pub fn with_prefetched(mut self, bodies: HashMap<String, Vec<u8>>) -> Self {
        self.prefetched = Arc::new(bodies);
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn decode_data(&self, data: &DataUri) -> FetchReport {
        let outcome = match data.decode() {
            Ok(bytes) => FetchOutcome::Success(FetchedBody {
                bytes,
                content_type: Some(data.mime.clone()),
            }),
            Err(e) => FetchOutcome::PermanentFailure(e.to_string()),
        };
        FetchReport {
            outcome,
            attempts: 0,
        }
    }

    /// Fetches through the shared pool. A permit is held per attempt, not
    /// across backoff sleeps.
    pub async fn fetch(&self, url: &Url) -> FetchReport {
        self.fetch_with_retry(url, true).await
    }

    /// Fetches without waiting for a pool slot.
    pub async fn fetch_direct(&self, url: &Url) -> FetchReport {
        self.fetch_with_retry(url, false).await
    }

    #[instrument(skip(self, url), fields(url = %url))]
    async fn fetch_with_retry(&self, url: &Url, pooled: bool) -> FetchReport {
        if let Some(bytes) = self.prefetched.get(url.as_str()) {
            debug!("using caller-supplied body");
            return FetchReport {
                outcome: FetchOutcome::Success(FetchedBody {
                    bytes: bytes.clone(),
                    content_type: None,
                }),
                attempts: 0,
            };
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = if pooled {
                match self.limiter.acquire().await {
                    Ok(_permit) => self.fetch_once(url).await,
                    Err(_) => FetchOutcome::PermanentFailure("fetch pool closed".to_string()),
                }
            } else {
                self.fetch_once(url).await
            };

            match outcome {
                FetchOutcome::TransientFailure(reason) if attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_after(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        %reason,
                        "download failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                FetchOutcome::TransientFailure(reason) => {
                    warn!(attempt, %reason, "download failed, giving up");
                    return FetchReport {
                        outcome: FetchOutcome::PermanentFailure(format!(
                            "gave up after {attempt} attempts: {reason}"
                        )),
                        attempts: attempt,
                    };
                }
                outcome => {
                    return FetchReport {
                        outcome,
                        attempts: attempt,
                    }
                }
            }
        }
    }

    /// One GET, classified into a [`FetchOutcome`].
    pub async fn fetch_once(&self, url: &Url) -> FetchOutcome {
        let response = match self.client.get(url.clone()).send().await {
            Ok(resp) => resp,
            Err(e) => return FetchOutcome::TransientFailure(e.to_string()),
        };

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            warn!(url = %url, "resource does not exist");
            return FetchOutcome::PermanentFailure(format!("HTTP {status}"));
        }
        if status.is_success() && status != StatusCode::OK {
            // 204 and 206 carry no complete body.
            return FetchOutcome::PermanentFailure(format!("unexpected HTTP {status}"));
        }
        if !status.is_success() {
            return FetchOutcome::TransientFailure(format!("HTTP {status}"));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        match response.bytes().await {
            Ok(bytes) => FetchOutcome::Success(FetchedBody {
                bytes: bytes.to_vec(),
                content_type,
            }),
            Err(e) => FetchOutcome::TransientFailure(format!("failed to read body: {e}")),
        }
    }
}

/// Decodes an HTML body to text.
///
/// The charset comes from the `Content-Type` header, then from a `<meta>`
/// declaration near the top of the document, then defaults to UTF-8. A byte
/// order mark overrides all of them.
pub fn decode_html(bytes: &[u8], content_type: Option<&str>) -> String {
    let encoding = content_type
        .and_then(|ct| ct.parse::<mime::Mime>().ok())
        .and_then(|m| m.get_param(mime::CHARSET).map(|c| c.as_str().to_string()))
        .or_else(|| sniff_meta_charset(bytes))
        .and_then(|label| Encoding::for_label(label.trim().as_bytes()))
        .unwrap_or(UTF_8);

    let (text, used, had_errors) = encoding.decode(bytes);
    if had_errors {
        warn!(encoding = used.name(), "page contained malformed byte sequences");
    }
    text.into_owned()
}

fn sniff_meta_charset(bytes: &[u8]) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r#"(?i)<meta[^>]*?charset\s*=\s*["']?\s*([a-z0-9_:.\-]+)"#)
            .expect("meta charset pattern is a valid regex")
    });
    let head = &bytes[..bytes.len().min(META_SNIFF_BYTES)];
    re.captures(&String::from_utf8_lossy(head))
        .and_then(|cap| cap.get(1))
        .map(|m| m.as_str().to_string())
}
