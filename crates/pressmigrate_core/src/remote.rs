use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use tracing::debug;

use crate::config::RemoteSettings;

const RETRY_BACKOFF: Duration = Duration::from_millis(1_000);

/// Status and body of one GET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl FetchResponse {
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

/// Outbound HTTP against a publisher's host.
pub trait RemoteFetcher {
    /// Non-2xx statuses are returned, not raised. Transport failures are errors.
    fn get(&mut self, url: &str) -> Result<FetchResponse>;
}

impl<T: RemoteFetcher + ?Sized> RemoteFetcher for &mut T {
    fn get(&mut self, url: &str) -> Result<FetchResponse> {
        (**self).get(url)
    }
}

/// Keeps at least `delay` between the starts of consecutive requests.
#[derive(Debug, Clone)]
struct RequestPacer {
    delay: Duration,
    last_request_at: Option<Instant>,
}

impl RequestPacer {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            last_request_at: None,
        }
    }

    /// How long a request starting at `now` has to wait.
    fn wait_needed(&self, now: Instant) -> Duration {
        match self.last_request_at {
            Some(last) => self.delay.saturating_sub(now.saturating_duration_since(last)),
            None => Duration::ZERO,
        }
    }

    fn mark(&mut self, at: Instant) {
        self.last_request_at = Some(at);
    }
}

pub struct HttpFetcher {
    client: Client,
    user_agent: String,
    retries: usize,
    retry_backoff: Duration,
    pacer: RequestPacer,
}

impl HttpFetcher {
    pub fn new(settings: &RemoteSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .context("failed to build remote HTTP client")?;
        Ok(Self {
            client,
            user_agent: settings.user_agent.clone(),
            retries: settings.retries,
            retry_backoff: RETRY_BACKOFF,
            pacer: RequestPacer::new(Duration::from_millis(settings.request_delay_ms)),
        })
    }

    /// Base wait before a retry; attempt `n` waits `n` times this.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    fn wait_for_slot(&mut self) {
        let wait = self.pacer.wait_needed(Instant::now());
        if !wait.is_zero() {
            sleep(wait);
        }
        self.pacer.mark(Instant::now());
    }

    fn back_off(&self, attempt: usize) {
        sleep(self.retry_backoff.saturating_mul(attempt as u32 + 1));
    }
}

impl RemoteFetcher for HttpFetcher {
    fn get(&mut self, url: &str) -> Result<FetchResponse> {
        let mut last_error = None::<String>;
        for attempt in 0..=self.retries {
            self.wait_for_slot();
            debug!(url, attempt, "remote GET");
            let response = self
                .client
                .get(url)
                .header("User-Agent", self.user_agent.clone())
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_server_error() && attempt < self.retries {
                        last_error = Some(format!("HTTP {status}"));
                        self.back_off(attempt);
                        continue;
                    }
                    let content_type = response
                        .headers()
                        .get("content-type")
                        .and_then(|value| value.to_str().ok())
                        .map(str::to_string);
                    let body = response
                        .bytes()
                        .with_context(|| format!("failed to read response body from {url}"))?;
                    return Ok(FetchResponse {
                        status: status.as_u16(),
                        content_type,
                        body: body.to_vec(),
                    });
                }
                Err(error) => {
                    last_error = Some(error.to_string());
                    if attempt < self.retries {
                        self.back_off(attempt);
                    }
                }
            }
        }

        let message = last_error.unwrap_or_else(|| "remote request failed".to_string());
        bail!("GET {url}: {message}")
    }
}

/// Final path segment of a URL, without query or fragment.
pub fn file_name_from_url(url: &str) -> Option<&str> {
    let without_fragment = url.split('#').next().unwrap_or(url);
    let without_query = without_fragment
        .split('?')
        .next()
        .unwrap_or(without_fragment);
    let path = without_query
        .split_once("://")
        .map_or(without_query, |(_, rest)| rest);
    let (_, path) = path.split_once('/')?;
    path.rsplit('/')
        .next()
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
}
