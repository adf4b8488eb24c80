use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use reqwest::StatusCode;
use reqwest::blocking::Client;
use tracing::{debug, warn};

use crate::config::HttpSettings;
use crate::error::IngestError;

#[derive(Debug, Clone)]
pub struct FetchedAsset {
    pub url: String,
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

impl FetchedAsset {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Run-wide deadline and cancellation signal threaded into every network call.
#[derive(Debug, Clone, Default)]
pub struct FetchBudget {
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl FetchBudget {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_deadline(limit: Option<Duration>) -> Self {
        Self {
            deadline: limit.map(|limit| Instant::now() + limit),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Makes every later fetch through this budget (or a clone) fail immediately.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Time left before the deadline; `None` when the run is unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn check(&self, url: &str) -> Result<(), IngestError> {
        if self.is_cancelled() {
            return Err(IngestError::Fetch {
                url: url.to_string(),
                status: None,
                reason: "run cancelled".to_string(),
                retryable: false,
            });
        }
        if self.remaining().is_some_and(|left| left.is_zero()) {
            return Err(IngestError::Fetch {
                url: url.to_string(),
                status: None,
                reason: "run deadline exceeded".to_string(),
                retryable: false,
            });
        }
        Ok(())
    }
}

/// Source of remote bytes. Implementations perform exactly one request per call;
/// retrying is the caller's business (see [`fetch_with_retry`]).
pub trait AssetFetcher: Sync {
    fn fetch(&self, url: &str, budget: &FetchBudget) -> Result<FetchedAsset, IngestError>;
    fn request_count(&self) -> usize;
}

pub struct HttpFetcher {
    client: Client,
    settings: HttpSettings,
    request_count: AtomicUsize,
}

impl HttpFetcher {
    pub fn new(settings: HttpSettings) -> Result<Self, IngestError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .map_err(|error| IngestError::Config(format!("failed to build HTTP client: {error}")))?;
        Ok(Self {
            client,
            settings,
            request_count: AtomicUsize::new(0),
        })
    }
}

impl AssetFetcher for HttpFetcher {
    fn fetch(&self, url: &str, budget: &FetchBudget) -> Result<FetchedAsset, IngestError> {
        budget.check(url)?;
        let mut timeout = Duration::from_millis(self.settings.timeout_ms);
        if let Some(remaining) = budget.remaining() {
            timeout = timeout.min(remaining);
        }

        self.request_count.fetch_add(1, Ordering::Relaxed);
        let response = self
            .client
            .get(url)
            .header("User-Agent", self.settings.user_agent.clone())
            .timeout(timeout)
            .send()
            .map_err(|error| IngestError::Fetch {
                url: url.to_string(),
                status: None,
                retryable: is_retryable_error(&error),
                reason: error.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::Fetch {
                url: url.to_string(),
                status: Some(status.as_u16()),
                reason: format!("HTTP {}", status.as_u16()),
                retryable: is_retryable_status(status),
            });
        }
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string);
        let bytes = response.bytes().map_err(|error| IngestError::Fetch {
            url: url.to_string(),
            status: Some(status.as_u16()),
            retryable: is_retryable_error(&error),
            reason: format!("failed to read response body: {error}"),
        })?;

        debug!(url, bytes = bytes.len(), "fetched");
        Ok(FetchedAsset {
            url: url.to_string(),
            bytes: bytes.to_vec(),
            content_type,
        })
    }

    fn request_count(&self) -> usize {
        self.request_count.load(Ordering::Relaxed)
    }
}

/// Bounded retry with exponential backoff and jitter. Only errors flagged as
/// retryable are retried, and the budget is re-checked before every attempt.
pub fn fetch_with_retry<F: AssetFetcher + ?Sized>(
    fetcher: &F,
    url: &str,
    budget: &FetchBudget,
    settings: &HttpSettings,
) -> Result<FetchedAsset, IngestError> {
    let mut attempt = 0usize;
    loop {
        match fetcher.fetch(url, budget) {
            Ok(asset) => return Ok(asset),
            Err(error) if error.is_retryable() && attempt < settings.retries => {
                warn!(url, attempt = attempt + 1, %error, "retrying fetch");
                sleep(backoff_delay(settings.retry_delay_ms, attempt, budget));
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

fn backoff_delay(retry_delay_ms: u64, attempt: usize, budget: &FetchBudget) -> Duration {
    let exponent = u32::try_from(attempt).unwrap_or(16);
    let base = retry_delay_ms.saturating_mul(2u64.saturating_pow(exponent));
    let jitter = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| u64::from(duration.subsec_millis() % 100))
        .unwrap_or(0);
    let delay = Duration::from_millis(base.saturating_add(jitter));
    match budget.remaining() {
        Some(remaining) => delay.min(remaining),
        None => delay,
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use reqwest::StatusCode;

    use super::{AssetFetcher, FetchBudget, FetchedAsset, fetch_with_retry, is_retryable_status};
    use crate::config::HttpSettings;
    use crate::error::{ErrorKind, IngestError};

    struct FlakyFetcher {
        failures_left: Mutex<usize>,
        retryable: bool,
        calls: AtomicUsize,
    }

    impl AssetFetcher for FlakyFetcher {
        fn fetch(&self, url: &str, budget: &FetchBudget) -> Result<FetchedAsset, IngestError> {
            budget.check(url)?;
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut left = self.failures_left.lock().expect("lock");
            if *left > 0 {
                *left -= 1;
                return Err(IngestError::Fetch {
                    url: url.to_string(),
                    status: Some(503),
                    reason: "HTTP 503".to_string(),
                    retryable: self.retryable,
                });
            }
            Ok(FetchedAsset {
                url: url.to_string(),
                bytes: b"ok".to_vec(),
                content_type: None,
            })
        }

        fn request_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn settings(retries: usize) -> HttpSettings {
        HttpSettings {
            retries,
            retry_delay_ms: 1,
            ..HttpSettings::default()
        }
    }

    #[test]
    fn retryable_failures_are_retried_within_budget() {
        let fetcher = FlakyFetcher {
            failures_left: Mutex::new(2),
            retryable: true,
            calls: AtomicUsize::new(0),
        };
        let asset = fetch_with_retry(
            &fetcher,
            "https://example.test/x",
            &FetchBudget::unbounded(),
            &settings(2),
        )
        .expect("third attempt succeeds");
        assert_eq!(asset.text(), "ok");
        assert_eq!(fetcher.request_count(), 3);
    }

    #[test]
    fn permanent_failures_are_not_retried() {
        let fetcher = FlakyFetcher {
            failures_left: Mutex::new(1),
            retryable: false,
            calls: AtomicUsize::new(0),
        };
        let error = fetch_with_retry(
            &fetcher,
            "https://example.test/x",
            &FetchBudget::unbounded(),
            &settings(5),
        )
        .expect_err("must fail");
        assert_eq!(error.kind(), ErrorKind::Fetch);
        assert_eq!(fetcher.request_count(), 1);
    }

    #[test]
    fn cancelled_budget_fails_before_any_request() {
        let fetcher = FlakyFetcher {
            failures_left: Mutex::new(0),
            retryable: true,
            calls: AtomicUsize::new(0),
        };
        let budget = FetchBudget::with_deadline(None);
        budget.cancel();
        let error = fetch_with_retry(&fetcher, "https://example.test/x", &budget, &settings(3))
            .expect_err("must fail");
        assert!(error.to_string().contains("cancelled"));
        assert_eq!(fetcher.request_count(), 0);
    }

    #[test]
    fn expired_deadline_is_reported() {
        let budget = FetchBudget::with_deadline(Some(Duration::ZERO));
        let error = budget.check("https://example.test/x").expect_err("must fail");
        assert!(error.to_string().contains("deadline"));
    }

    #[test]
    fn retryable_statuses_match_transient_codes() {
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
    }
}
