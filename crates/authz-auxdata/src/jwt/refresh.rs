//! Shared refresh cache for remote keysets
//!
//! One [`JwksRefresher`] serves every remote keyset of a registry. URLs are
//! registered up front without any I/O. The first request that needs a URL
//! fetches it (single-flight per URL, bounded by the request's
//! [`RequestContext`]); from then on a background task keeps the material
//! fresh and requests read the latest snapshot without awaiting anything.
//!
//! # Schedule
//!
//! - A configured refresh interval is used as is.
//! - Otherwise the cadence is [`DEFAULT_REFRESH_INTERVAL`], or the
//!   endpoint's `Cache-Control: max-age` when that is longer.
//! - A failed background refresh keeps serving the last good material and is
//!   retried after `min(interval, ERROR_RETRY_INTERVAL)`.
//! - A failed first fetch is returned to the caller and not remembered; the
//!   next request tries again.
//!
//! The background task starts with the first successful fetch and stops on
//! [`JwksRefresher::shutdown`] or when the refresher is dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::keys::KeyMaterial;
use crate::config::ConfigError;
use crate::context::RequestContext;
use crate::error::{AuxDataError, Result};
use crate::metrics;

/// Refresh cadence when neither configuration nor the endpoint says otherwise
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Upper bound on the delay before retrying a failed background refresh
pub const ERROR_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// HTTP timeout for a single JWKS fetch
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the background task sleeps when nothing is scheduled
const IDLE_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct RemoteEntry {
    url: String,
    interval: RwLock<Option<Duration>>,
    material: RwLock<Option<KeyMaterial>>,
    next_refresh: Mutex<Option<Instant>>,
    /// Serializes first fetches of this URL
    fetch_lock: tokio::sync::Mutex<()>,
}

impl RemoteEntry {
    fn new(url: &str, interval: Option<Duration>) -> Self {
        Self {
            url: url.to_string(),
            interval: RwLock::new(interval),
            material: RwLock::new(None),
            next_refresh: Mutex::new(None),
            fetch_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn current(&self) -> Option<KeyMaterial> {
        self.material.read().clone()
    }

    fn is_due(&self, now: Instant) -> bool {
        matches!(*self.next_refresh.lock(), Some(at) if at <= now)
    }

    fn refresh_interval(&self, max_age: Option<Duration>) -> Duration {
        match *self.interval.read() {
            Some(configured) => configured,
            None => max_age.map_or(DEFAULT_REFRESH_INTERVAL, |age| {
                age.max(DEFAULT_REFRESH_INTERVAL)
            }),
        }
    }
}

struct Fetched {
    material: KeyMaterial,
    max_age: Option<Duration>,
}

struct RefresherInner {
    client: reqwest::Client,
    entries: DashMap<String, Arc<RemoteEntry>>,
    wake: Notify,
    fetches: AtomicU64,
    fetch_errors: AtomicU64,
}

impl RefresherInner {
    fn entry(&self, url: &str) -> Option<Arc<RemoteEntry>> {
        self.entries.get(url).map(|e| Arc::clone(e.value()))
    }

    fn next_due(&self) -> Option<Instant> {
        self.entries
            .iter()
            .filter_map(|e| *e.value().next_refresh.lock())
            .min()
    }

    async fn fetch(&self, url: &str) -> Result<Fetched> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        info!(url = %url, "Fetching JWKS from endpoint");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AuxDataError::fetch(url, format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuxDataError::fetch(
                url,
                format!("endpoint returned status {status}"),
            ));
        }

        let max_age = response
            .headers()
            .get(reqwest::header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_max_age);

        let body = response
            .bytes()
            .await
            .map_err(|e| AuxDataError::fetch(url, format!("failed to read body: {e}")))?;

        let material = KeyMaterial::parse_json(&body)
            .map_err(|e| AuxDataError::fetch(url, format!("invalid JWKS: {e}")))?;

        Ok(Fetched { material, max_age })
    }

    fn apply_success(&self, entry: &RemoteEntry, fetched: Fetched) -> KeyMaterial {
        let interval = entry.refresh_interval(fetched.max_age);
        *entry.material.write() = Some(fetched.material.clone());
        *entry.next_refresh.lock() = Some(Instant::now() + interval);
        metrics::record_keyset_refresh(true);

        info!(
            url = %entry.url,
            key_count = fetched.material.len(),
            next_refresh_secs = interval.as_secs(),
            "Successfully fetched JWKS"
        );
        fetched.material
    }

    fn record_failure(&self, url: &str, err: &AuxDataError) {
        self.fetch_errors.fetch_add(1, Ordering::Relaxed);
        metrics::record_keyset_refresh(false);
        warn!(url = %url, error = %err, "Error refreshing keyset");
    }

    /// Refresh one already-fetched entry; failures keep the previous material
    async fn refresh_entry(&self, entry: &RemoteEntry) {
        match self.fetch(&entry.url).await {
            Ok(fetched) => {
                self.apply_success(entry, fetched);
            }
            Err(err) => {
                self.record_failure(&entry.url, &err);
                let retry = entry.refresh_interval(None).min(ERROR_RETRY_INTERVAL);
                *entry.next_refresh.lock() = Some(Instant::now() + retry);
            }
        }
    }

    async fn refresh_due(&self) {
        let now = Instant::now();
        let due: Vec<Arc<RemoteEntry>> = self
            .entries
            .iter()
            .filter(|e| e.value().is_due(now))
            .map(|e| Arc::clone(e.value()))
            .collect();

        if due.is_empty() {
            return;
        }

        debug!(count = due.len(), "Refreshing due keysets");
        futures::future::join_all(due.iter().map(|entry| self.refresh_entry(entry))).await;
    }

    async fn run(self: Arc<Self>, token: CancellationToken) {
        loop {
            let wake_at = self
                .next_due()
                .unwrap_or_else(|| Instant::now() + IDLE_WAIT);

            tokio::select! {
                _ = token.cancelled() => break,
                _ = self.wake.notified() => continue,
                _ = tokio::time::sleep_until(wake_at) => {}
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = self.refresh_due() => {}
            }
        }
        info!("keyset refresh task shutting down");
    }
}

/// Process-wide cache of remote key material with background refresh
///
/// Construct it once, share it by `Arc` with every remote keyset, and call
/// [`shutdown`](Self::shutdown) when the process stops.
pub struct JwksRefresher {
    inner: Arc<RefresherInner>,
    cancel_token: CancellationToken,
    started: AtomicBool,
    refresh_handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for JwksRefresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwksRefresher")
            .field("urls", &self.registered_urls())
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl JwksRefresher {
    /// Create a refresher with its own HTTP client
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::HttpClient`] if the HTTP client cannot be built.
    pub fn new() -> std::result::Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;
        Ok(Self::with_client(client))
    }

    /// Create a refresher around an existing HTTP client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            inner: Arc::new(RefresherInner {
                client,
                entries: DashMap::new(),
                wake: Notify::new(),
                fetches: AtomicU64::new(0),
                fetch_errors: AtomicU64::new(0),
            }),
            cancel_token: CancellationToken::new(),
            started: AtomicBool::new(false),
            refresh_handle: Mutex::new(None),
        }
    }

    /// Register `url` for refreshing; performs no I/O
    ///
    /// A zero or absent interval selects the default cadence. Registering a
    /// URL again updates its interval and keeps any fetched material.
    pub fn register(&self, url: &str, interval: Option<Duration>) {
        let interval = interval.filter(|i| !i.is_zero());
        match self.inner.entries.entry(url.to_string()) {
            Entry::Occupied(existing) => {
                *existing.get().interval.write() = interval;
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(RemoteEntry::new(url, interval)));
            }
        }
        debug!(url = %url, ?interval, "Registered remote keyset");
    }

    pub fn is_registered(&self, url: &str) -> bool {
        self.inner.entries.contains_key(url)
    }

    pub fn registered_urls(&self) -> Vec<String> {
        self.inner.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Latest fetched material for `url`, without any I/O
    pub fn current(&self, url: &str) -> Option<KeyMaterial> {
        self.inner.entry(url).and_then(|e| e.current())
    }

    /// Latest material for `url`, fetching it first if it never was
    ///
    /// # Errors
    ///
    /// Returns [`AuxDataError::KeySetFetch`] if the URL is not registered or
    /// the first fetch fails, and [`AuxDataError::Cancelled`] /
    /// [`AuxDataError::DeadlineExceeded`] if `cx` ends first.
    pub async fn get(&self, url: &str, cx: &RequestContext) -> Result<KeyMaterial> {
        let entry = self
            .inner
            .entry(url)
            .ok_or_else(|| AuxDataError::fetch(url, "keyset URL is not registered"))?;

        if let Some(material) = entry.current() {
            return Ok(material);
        }

        let _guard = cx.run(entry.fetch_lock.lock()).await?;

        // Another request may have completed the first fetch while we waited.
        if let Some(material) = entry.current() {
            return Ok(material);
        }

        let fetched = match cx.run(self.inner.fetch(url)).await? {
            Ok(fetched) => fetched,
            Err(err) => {
                self.inner.record_failure(url, &err);
                return Err(err);
            }
        };

        let material = self.inner.apply_success(&entry, fetched);
        self.ensure_started();
        self.inner.wake.notify_one();
        Ok(material)
    }

    /// Fetch `url` now, replacing its material on success
    ///
    /// # Errors
    ///
    /// Returns [`AuxDataError::KeySetFetch`] if the URL is not registered or
    /// the fetch fails; the previous material is kept in that case.
    pub async fn refresh(&self, url: &str) -> Result<KeyMaterial> {
        let entry = self
            .inner
            .entry(url)
            .ok_or_else(|| AuxDataError::fetch(url, "keyset URL is not registered"))?;

        match self.inner.fetch(url).await {
            Ok(fetched) => {
                let material = self.inner.apply_success(&entry, fetched);
                self.ensure_started();
                self.inner.wake.notify_one();
                Ok(material)
            }
            Err(err) => {
                self.inner.record_failure(url, &err);
                Err(err)
            }
        }
    }

    /// Total fetch attempts (first fetches and refreshes)
    pub fn fetch_count(&self) -> u64 {
        self.inner.fetches.load(Ordering::Relaxed)
    }

    /// Total failed fetch attempts
    pub fn fetch_error_count(&self) -> u64 {
        self.inner.fetch_errors.load(Ordering::Relaxed)
    }

    /// Whether the background refresh task is running
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.cancel_token.is_cancelled()
    }

    /// Returns the cancellation token for the background refresh task.
    ///
    /// Callers can use this to integrate with external shutdown signals.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    /// Stop the background task and wait for it to finish
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        let handle = self.refresh_handle.lock().take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            warn!(error = %err, "keyset refresh task panicked");
        }
    }

    fn ensure_started(&self) {
        if self.cancel_token.is_cancelled() || self.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.started.store(false, Ordering::Release);
            return;
        };

        let inner = Arc::clone(&self.inner);
        let token = self.cancel_token.clone();
        let handle = runtime.spawn(inner.run(token));
        *self.refresh_handle.lock() = Some(handle);
    }
}

impl Drop for JwksRefresher {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Extract `max-age` from a `Cache-Control` header value
fn parse_max_age(header: &str) -> Option<Duration> {
    header.split(',').find_map(|directive| {
        let (name, value) = directive.trim().split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("max-age") {
            return None;
        }
        value.trim().trim_matches('"').parse::<u64>().ok().map(Duration::from_secs)
    })
}
