//! Remote-fetch imagery strategy: download ready-made tiles from a tile service.

use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::render::ImageryStrategy;
use crate::select::TileJob;
use crate::{MosaicError, MosaicResult, TileCoord};

/// OpenAerialMap titiler endpoint serving RGB tiles.
pub const DEFAULT_TILE_URL_TEMPLATE: &str = "https://oam-eoapi-prod.imagery-services.k8s-prod.hotosm.org/raster/collections/{collection}/tiles/WebMercatorQuad/{z}/{x}/{y}.png?assets=visual&bidx=1&bidx=2&bidx=3";
/// Retries after the first failed request.
pub const DEFAULT_RETRIES: u32 = 2;
/// Backoff unit, multiplied by the attempt number.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);
/// Per-request timeout.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Tile URL with `{collection}`, `{z}`, `{x}` and `{y}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTemplate(String);

impl UrlTemplate {
    /// Fails if `{z}`, `{x}` or `{y}` is missing.
    pub fn new(template: impl Into<String>) -> MosaicResult<Self> {
        let template = template.into();
        for placeholder in ["{z}", "{x}", "{y}"] {
            if !template.contains(placeholder) {
                return Err(MosaicError::Config(format!(
                    "tile URL template {template} lacks {placeholder}"
                )));
            }
        }
        Ok(Self(template))
    }

    /// URL of `coord` in `collection`.
    #[must_use]
    pub fn render(&self, collection: &str, coord: TileCoord) -> String {
        self.0
            .replace("{collection}", collection)
            .replace("{z}", &coord.z().to_string())
            .replace("{x}", &coord.x().to_string())
            .replace("{y}", &coord.y().to_string())
    }

    /// The raw template.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for UrlTemplate {
    fn default() -> Self {
        Self(DEFAULT_TILE_URL_TEMPLATE.to_string())
    }
}

impl FromStr for UrlTemplate {
    type Err = MosaicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Bounded retries with linearly growing delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retries: u32,
    /// Delay before the first retry. Later retries wait longer.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            base_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Total number of attempts, the first one included.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Delay after `failed_attempts` attempts, before the next one.
    #[must_use]
    pub fn delay(&self, failed_attempts: u32) -> Duration {
        self.base_delay.saturating_mul(failed_attempts)
    }

    /// Sleeps before the next attempt. Returns `false` if cancelled while waiting.
    pub async fn wait(&self, failed_attempts: u32, cancel: &CancellationToken) -> bool {
        tokio::select! {
            () = cancel.cancelled() => false,
            () = tokio::time::sleep(self.delay(failed_attempts)) => true,
        }
    }
}

/// Status and body of one tile request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    /// HTTP status code.
    pub status: u16,
    /// Empty unless the status is 200.
    pub body: Bytes,
}

/// Failure to get any response.
#[derive(Debug, Error)]
pub enum FetchError {
    /// No response within the client timeout.
    #[error("request timed out")]
    Timeout,
    /// Connection or protocol failure.
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Transport(e.to_string())
        }
    }
}

/// Minimal HTTP GET used by [`RemoteFetch`].
pub trait TileClient: Send + Sync {
    /// Any response, whatever its status, is `Ok`.
    fn get(&self, url: &str) -> impl Future<Output = Result<FetchResponse, FetchError>> + Send;
}

/// [`TileClient`] backed by `reqwest`, with a per-request timeout.
#[derive(Debug, Clone)]
pub struct HttpTileClient {
    client: reqwest::Client,
}

impl HttpTileClient {
    /// Client giving up on a request after `timeout`.
    pub fn new(timeout: Duration) -> MosaicResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

impl TileClient for HttpTileClient {
    async fn get(&self, url: &str) -> Result<FetchResponse, FetchError> {
        let response = self.client.get(url).send().await?;
        let status = response.status().as_u16();
        let body = if status == 200 {
            response.bytes().await?
        } else {
            Bytes::new()
        };
        Ok(FetchResponse { status, body })
    }
}

/// Snapshot of remote fetch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchStats {
    /// Requests sent, retries included.
    pub requests: u64,
    /// Requests repeated after a retryable failure.
    pub retries: u64,
    /// Tiles answered with 404.
    pub not_found: u64,
    /// Tiles given up on.
    pub failures: u64,
}

#[derive(Debug, Default)]
struct FetchCounters {
    requests: AtomicU64,
    retries: AtomicU64,
    not_found: AtomicU64,
    failures: AtomicU64,
}

impl FetchCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Downloads each tile from a templated URL.
///
/// 200 yields the body verbatim, 404 yields `None`. 5xx responses and timeouts are
/// retried per the [`RetryPolicy`]; every other status or transport error ends the
/// fetch immediately as failed.
pub struct RemoteFetch<C> {
    client: C,
    template: UrlTemplate,
    collection: String,
    policy: RetryPolicy,
    cancel: CancellationToken,
    counters: FetchCounters,
}

impl<C: TileClient> RemoteFetch<C> {
    /// Fetches tiles of `collection` from `template`. Backoff sleeps end early on `cancel`.
    pub fn new(
        client: C,
        template: UrlTemplate,
        collection: impl Into<String>,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            template,
            collection: collection.into(),
            policy,
            cancel,
            counters: FetchCounters::default(),
        }
    }

    /// Counters so far.
    #[must_use]
    pub fn stats(&self) -> FetchStats {
        let c = &self.counters;
        FetchStats {
            requests: c.requests.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            not_found: c.not_found.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
        }
    }

    /// Fetches one tile. `Ok(None)` means the service has no tile there.
    pub async fn fetch(&self, coord: TileCoord) -> MosaicResult<Option<Bytes>> {
        let url = self.template.render(&self.collection, coord);
        let attempts = self.policy.attempts();

        for attempt in 0..attempts {
            if attempt > 0 {
                FetchCounters::bump(&self.counters.retries);
                if !self.policy.wait(attempt, &self.cancel).await {
                    log::debug!("Fetch of {url} cancelled");
                    return Err(self.failed(url, attempt));
                }
            }
            FetchCounters::bump(&self.counters.requests);
            match self.client.get(&url).await {
                Ok(FetchResponse { status: 200, body }) => {
                    if body.is_empty() {
                        log::debug!("Empty tile body for {url}");
                        return Ok(None);
                    }
                    return Ok(Some(body));
                }
                Ok(FetchResponse { status: 404, .. }) => {
                    FetchCounters::bump(&self.counters.not_found);
                    log::debug!("Tile not found (404): {url}");
                    return Ok(None);
                }
                Ok(FetchResponse { status, .. }) if (500..600).contains(&status) => {
                    log::warn!(
                        "Server error {status} for {url} (attempt {}/{attempts})",
                        attempt + 1
                    );
                }
                Ok(FetchResponse { status, .. }) => {
                    log::warn!("Unexpected status {status} for {url}");
                    return Err(self.failed(url, attempt + 1));
                }
                Err(FetchError::Timeout) => {
                    log::warn!("Timeout fetching {url} (attempt {}/{attempts})", attempt + 1);
                }
                Err(e) => {
                    log::warn!("Error fetching {url}: {e}");
                    return Err(self.failed(url, attempt + 1));
                }
            }
        }

        log::error!("Failed to fetch {url} after {attempts} attempts");
        Err(self.failed(url, attempts))
    }

    fn failed(&self, url: String, attempts: u32) -> MosaicError {
        FetchCounters::bump(&self.counters.failures);
        MosaicError::FetchFailed { url, attempts }
    }
}

#[async_trait]
impl<C: TileClient> ImageryStrategy for RemoteFetch<C> {
    async fn render(&self, job: &TileJob) -> MosaicResult<Option<Bytes>> {
        self.fetch(job.coord).await
    }

    fn fetch_stats(&self) -> Option<FetchStats> {
        Some(self.stats())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use tokio::time::Instant;

    use super::*;

    /// Replays scripted responses, repeating the last one, and records request times.
    pub(crate) struct ScriptedClient {
        script: Mutex<VecDeque<Result<FetchResponse, FetchError>>>,
        last: fn() -> Result<FetchResponse, FetchError>,
        pub(crate) calls: Mutex<Vec<(String, Instant)>>,
    }

    impl ScriptedClient {
        pub(crate) fn new(
            script: Vec<Result<FetchResponse, FetchError>>,
            last: fn() -> Result<FetchResponse, FetchError>,
        ) -> Self {
            Self {
                script: Mutex::new(script.into()),
                last,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn always(last: fn() -> Result<FetchResponse, FetchError>) -> Self {
            Self::new(Vec::new(), last)
        }

        pub(crate) fn call_times(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().iter().map(|(_, t)| *t).collect()
        }
    }

    impl TileClient for ScriptedClient {
        async fn get(&self, url: &str) -> Result<FetchResponse, FetchError> {
            self.calls
                .lock()
                .unwrap()
                .push((url.to_string(), Instant::now()));
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(self.last)
        }
    }

    pub(crate) fn status(code: u16) -> Result<FetchResponse, FetchError> {
        Ok(FetchResponse {
            status: code,
            body: if code == 200 {
                Bytes::from_static(b"tile")
            } else {
                Bytes::new()
            },
        })
    }

    fn template() -> UrlTemplate {
        UrlTemplate::new("https://tiles.test/{collection}/{z}/{x}/{y}.png").unwrap()
    }

    fn coord() -> TileCoord {
        TileCoord::new(12, 2048, 1500).unwrap()
    }

    fn fetcher(client: ScriptedClient, retries: u32) -> RemoteFetch<ScriptedClient> {
        RemoteFetch::new(
            client,
            template(),
            "openaerialmap",
            RetryPolicy {
                retries,
                base_delay: Duration::from_millis(500),
            },
            CancellationToken::new(),
        )
    }

    #[test]
    fn template_requires_placeholders() {
        assert!(UrlTemplate::new("https://x/{z}/{x}.png").is_err());
        let url = template().render("oam", coord());
        assert_eq!(url, "https://tiles.test/oam/12/2048/1500.png");
    }

    #[test]
    fn linear_delays() {
        let policy = RetryPolicy {
            retries: 3,
            base_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.attempts(), 4);
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(3), Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn ok_returns_body() {
        let fetch = fetcher(ScriptedClient::always(|| status(200)), 2);
        let tile = fetch.fetch(coord()).await.unwrap();
        assert_eq!(tile.unwrap(), &b"tile"[..]);
        assert_eq!(fetch.stats().requests, 1);
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let fetch = fetcher(ScriptedClient::always(|| status(404)), 2);
        assert!(fetch.fetch(coord()).await.unwrap().is_none());
        let stats = fetch.stats();
        assert_eq!((stats.requests, stats.not_found, stats.retries), (1, 1, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn server_errors_retry_with_growing_delays() {
        let fetch = fetcher(ScriptedClient::always(|| status(503)), 2);
        let err = fetch.fetch(coord()).await.unwrap_err();
        assert!(matches!(err, MosaicError::FetchFailed { attempts: 3, .. }));

        let times = fetch.client.call_times();
        assert_eq!(times.len(), 3);
        let gaps: Vec<_> = times.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(gaps, vec![Duration::from_millis(500), Duration::from_millis(1000)]);
        assert!(gaps[0] < gaps[1]);
        assert_eq!(fetch.stats().failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_last_attempt() {
        let retries = 3;
        let client = ScriptedClient::new(vec![status(500), status(500), status(502)], || {
            status(200)
        });
        let fetch = fetcher(client, retries);
        let tile = fetch.fetch(coord()).await.unwrap();
        assert_eq!(tile.unwrap(), &b"tile"[..]);

        let times = fetch.client.call_times();
        assert_eq!(times.len(), retries as usize + 1);
        let gaps: Vec<_> = times.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps.windows(2).all(|g| g[0] < g[1]));
        assert_eq!(fetch.stats().retries, u64::from(retries));
        assert_eq!(fetch.stats().failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_then_success() {
        let client = ScriptedClient::new(vec![Err(FetchError::Timeout)], || status(200));
        let fetch = fetcher(client, 2);
        assert!(fetch.fetch(coord()).await.unwrap().is_some());
        assert_eq!(fetch.stats().retries, 1);
    }

    #[tokio::test]
    async fn other_failures_are_terminal() {
        let fetch = fetcher(ScriptedClient::always(|| status(403)), 2);
        assert!(fetch.fetch(coord()).await.is_err());
        assert_eq!(fetch.stats().requests, 1);

        let fetch = fetcher(
            ScriptedClient::always(|| Err(FetchError::Transport("refused".into()))),
            2,
        );
        assert!(fetch.fetch(coord()).await.is_err());
        assert_eq!(fetch.stats().requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let fetch = RemoteFetch::new(
            ScriptedClient::always(|| status(500)),
            template(),
            "oam",
            RetryPolicy {
                retries: 5,
                base_delay: Duration::from_secs(60),
            },
            cancel.clone(),
        );
        cancel.cancel();
        let err = fetch.fetch(coord()).await.unwrap_err();
        assert!(matches!(err, MosaicError::FetchFailed { attempts: 1, .. }));
        assert_eq!(fetch.stats().requests, 1);
    }
}
