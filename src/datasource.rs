//! Background feature-catalog data sources. Generalizes the teacher's
//! blocking `FeatureRepository::load_features` refresh thread into a
//! `tokio`-driven state machine supporting polling and SSE, both cancellable
//! through a shared `CancellationToken`.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use log::{debug, error, warn};
use rand::Rng;
use reqwest::Client;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::client::SharedState;
use crate::error::GrowthBookError;
use crate::model::FeaturesApiResponse;
use crate::util;

const MIN_POLL_INTERVAL: Duration = Duration::from_secs(10);
const SSE_MAX_BACKOFF: Duration = Duration::from_secs(300);
const SSE_MAX_CONSECUTIVE_PARSE_ERRORS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSourceState {
    Unstarted,
    Starting,
    Running,
    Reconnecting,
    Closed,
}

/// Lets callers block until the first data-source attempt (success or
/// failure) completes, via a one-shot `tokio::sync::Notify` latch carrying
/// that attempt's result — matching `ensureLoaded`'s "return its error"
/// contract.
#[derive(Clone)]
pub struct FirstLoadLatch {
    notify: Arc<Notify>,
    loaded: Arc<AtomicBool>,
    result: Arc<Mutex<Option<Result<(), GrowthBookError>>>>,
}

impl FirstLoadLatch {
    pub fn new() -> Self {
        Self { notify: Arc::new(Notify::new()), loaded: Arc::new(AtomicBool::new(false)), result: Arc::new(Mutex::new(None)) }
    }

    /// Waits for the first attempt to complete and returns its outcome.
    /// Resolves immediately if it already has.
    pub async fn wait(&self) -> Result<(), GrowthBookError> {
        if !self.loaded.load(Ordering::Acquire) {
            self.notify.notified().await;
        }
        self.result.lock().unwrap_or_else(|e| e.into_inner()).clone().unwrap_or(Ok(()))
    }

    /// Records the outcome of a data-source attempt. Only the first call
    /// sets the latched result and wakes waiters; later calls (subsequent
    /// poll ticks) are no-ops for the latch itself.
    fn signal(&self, outcome: Result<(), GrowthBookError>) {
        if !self.loaded.swap(true, Ordering::AcqRel) {
            *self.result.lock().unwrap_or_else(|e| e.into_inner()) = Some(outcome);
            self.notify.notify_waiters();
        }
    }
}

impl Default for FirstLoadLatch {
    fn default() -> Self {
        Self::new()
    }
}

pub trait DataSource: Send + Sync {
    /// Spawns the background refresh task. Returns once the task is
    /// scheduled; does not block on the first successful load.
    fn start(&self, cancel: CancellationToken) -> Result<(), GrowthBookError>;

    /// Requests the background task stop at its next opportunity. With the
    /// shared `cancel` token already observed inside the spawned task, most
    /// implementations have nothing further to do here.
    fn close(&self) -> Result<(), GrowthBookError> {
        Ok(())
    }
}

fn feature_url(shared: &SharedState, client_key: &str) -> String {
    format!("{}/api/features/{}", shared.api_host.trim_end_matches('/'), client_key)
}

fn sse_url(shared: &SharedState, client_key: &str) -> String {
    format!("{}/sub/{}", shared.api_host.trim_end_matches('/'), client_key)
}

async fn apply_response(shared: &SharedState, body: &[u8], etag: Option<String>) -> Result<(), GrowthBookError> {
    let parsed: FeaturesApiResponse = serde_json::from_slice(body)?;
    apply_parsed(shared, parsed)?;
    if let Some(etag) = etag {
        if let Ok(mut guard) = shared.etag.write() {
            *guard = Some(etag);
        }
    }
    Ok(())
}

fn apply_parsed(shared: &SharedState, parsed: FeaturesApiResponse) -> Result<(), GrowthBookError> {
    let features = if let Some(encrypted) = &parsed.encrypted_features {
        let key = shared.decryption_key.as_deref().ok_or(GrowthBookError::NoDecryptionKey)?;
        let plaintext = util::decrypt_string(encrypted, key)?;
        serde_json::from_str(&plaintext)?
    } else {
        parsed.features
    };

    let saved_groups = if let Some(encrypted) = &parsed.encrypted_saved_groups {
        let key = shared.decryption_key.as_deref().ok_or(GrowthBookError::NoDecryptionKey)?;
        let plaintext = util::decrypt_string(encrypted, key)?;
        serde_json::from_str(&plaintext)?
    } else {
        parsed.saved_groups
    };

    match shared.features.write() {
        Ok(mut guard) => *guard = features,
        Err(_) => error!("feature catalog lock poisoned on write"),
    }
    match shared.saved_groups.write() {
        Ok(mut guard) => *guard = saved_groups,
        Err(_) => error!("saved groups lock poisoned on write"),
    }
    shared.run_refresh_callbacks();
    Ok(())
}

/// Polls `GET {apiHost}/api/features/{clientKey}` on a fixed interval, using
/// `If-None-Match`/`ETag` to skip re-parsing an unchanged catalog.
pub struct PollingDataSource {
    shared: Arc<SharedState>,
    client_key: String,
    interval: Duration,
    state: Arc<Mutex<DataSourceState>>,
    first_load: FirstLoadLatch,
}

impl PollingDataSource {
    pub fn new(shared: Arc<SharedState>, client_key: String, interval: Duration, first_load: FirstLoadLatch) -> Self {
        let interval = if interval < MIN_POLL_INTERVAL { MIN_POLL_INTERVAL } else { interval };
        Self { shared, client_key, interval, state: Arc::new(Mutex::new(DataSourceState::Unstarted)), first_load }
    }

    pub fn state(&self) -> DataSourceState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, s: DataSourceState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = s;
    }

    async fn poll_once(&self, http: &Client) -> Result<(), GrowthBookError> {
        let url = feature_url(&self.shared, &self.client_key);
        let mut req = http.get(&url).header("User-Agent", format!("growthbook-sdk-rust/{}", crate::client::SDK_VERSION));

        let prior_etag = self.shared.etag.read().ok().and_then(|g| g.clone());
        if let Some(etag) = &prior_etag {
            req = req.header("If-None-Match", etag);
        }

        let res = req.send().await.map_err(|e| GrowthBookError::Http(e.to_string()))?;
        if res.status() == reqwest::StatusCode::NOT_MODIFIED {
            debug!("feature catalog unchanged (304)");
            return Ok(());
        }
        if !res.status().is_success() {
            return Err(GrowthBookError::Http(format!("unexpected status {}", res.status())));
        }

        let etag = res.headers().get(reqwest::header::ETAG).and_then(|v| v.to_str().ok()).map(str::to_string);
        let body = res.bytes().await.map_err(|e| GrowthBookError::Http(e.to_string()))?;
        apply_response(&self.shared, &body, etag).await
    }
}

impl DataSource for PollingDataSource {
    fn start(&self, cancel: CancellationToken) -> Result<(), GrowthBookError> {
        self.set_state(DataSourceState::Starting);
        let shared = self.shared.clone();
        let client_key = self.client_key.clone();
        let interval = self.interval;
        let state = self.state.clone();
        let first_load = self.first_load.clone();
        let http = shared.http_client.clone();

        tokio::spawn(async move {
            let ds = PollingDataSource { shared, client_key, interval, state: state.clone(), first_load: first_load.clone() };
            *state.lock().unwrap_or_else(|e| e.into_inner()) = DataSourceState::Running;
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        *state.lock().unwrap_or_else(|e| e.into_inner()) = DataSourceState::Closed;
                        break;
                    }
                    _ = ticker.tick() => {
                        match ds.poll_once(&http).await {
                            Ok(()) => first_load.signal(Ok(())),
                            Err(e) => {
                                warn!("feature poll failed: {}", e);
                                first_load.signal(Err(e));
                            }
                        }
                    }
                }
            }
        });

        Ok(())
    }
}

/// Subscribes to `GET {apiHost}/sub/{clientKey}`, a `text/event-stream`
/// response, reconnecting with jittered exponential backoff on failure.
pub struct SseDataSource {
    shared: Arc<SharedState>,
    client_key: String,
    state: Arc<Mutex<DataSourceState>>,
    first_load: FirstLoadLatch,
}

impl SseDataSource {
    pub fn new(shared: Arc<SharedState>, client_key: String, first_load: FirstLoadLatch) -> Self {
        Self { shared, client_key, state: Arc::new(Mutex::new(DataSourceState::Unstarted)), first_load }
    }

    pub fn state(&self) -> DataSourceState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Splits a byte buffer of `text/event-stream` frames on blank lines,
/// extracting the concatenated `data:` payload of each frame. Returns the
/// parsed events and any unconsumed trailing bytes.
fn drain_sse_frames(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut events = Vec::new();
    loop {
        let Some(pos) = find_double_newline(buffer) else { break };
        let frame: Vec<u8> = buffer.drain(..pos + 2).collect();
        let text = String::from_utf8_lossy(&frame);
        let mut data = String::new();
        for line in text.lines() {
            if let Some(rest) = line.strip_prefix("data:") {
                data.push_str(rest.trim_start());
                data.push('\n');
            }
        }
        let data = data.trim_end().to_string();
        if !data.is_empty() {
            events.push(data);
        }
    }
    events
}

fn find_double_newline(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let base = Duration::from_secs(1) * 3u32.saturating_pow(attempt.min(8));
    let capped = base.min(SSE_MAX_BACKOFF);
    let jitter_ms = rand::thread_rng().gen_range(0..1000);
    capped + Duration::from_millis(jitter_ms)
}

impl DataSource for SseDataSource {
    fn start(&self, cancel: CancellationToken) -> Result<(), GrowthBookError> {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = DataSourceState::Starting;
        let shared = self.shared.clone();
        let client_key = self.client_key.clone();
        let state = self.state.clone();
        let first_load = self.first_load.clone();
        let http = shared.http_client.clone();

        tokio::spawn(async move {
            let url = sse_url(&shared, &client_key);
            let mut attempt = 0u32;
            let mut consecutive_parse_errors = 0u32;

            'reconnect: loop {
                if cancel.is_cancelled() {
                    break;
                }
                *state.lock().unwrap_or_else(|e| e.into_inner()) = if attempt == 0 { DataSourceState::Running } else { DataSourceState::Reconnecting };

                let response = tokio::select! {
                    _ = cancel.cancelled() => break 'reconnect,
                    res = http.get(&url).header("Accept", "text/event-stream").send() => res,
                };

                let response = match response {
                    Ok(r) if r.status().is_success() => r,
                    Ok(r) => {
                        warn!("sse connect failed with status {}", r.status());
                        attempt += 1;
                        tokio::time::sleep(backoff_with_jitter(attempt)).await;
                        continue 'reconnect;
                    }
                    Err(e) => {
                        warn!("sse connect error: {}", e);
                        attempt += 1;
                        tokio::time::sleep(backoff_with_jitter(attempt)).await;
                        continue 'reconnect;
                    }
                };

                attempt = 0;
                let mut stream = response.bytes_stream();
                let mut buffer: Vec<u8> = Vec::new();

                loop {
                    let chunk = tokio::select! {
                        _ = cancel.cancelled() => break 'reconnect,
                        next = stream.next() => next,
                    };

                    let Some(chunk) = chunk else {
                        warn!("sse stream ended, reconnecting");
                        break;
                    };

                    let Ok(chunk) = chunk else {
                        warn!("sse stream error, reconnecting");
                        break;
                    };

                    buffer.extend_from_slice(&chunk);
                    for event in drain_sse_frames(&mut buffer) {
                        match serde_json::from_str::<FeaturesApiResponse>(&event) {
                            Ok(parsed) => {
                                consecutive_parse_errors = 0;
                                first_load.signal(apply_parsed(&shared, parsed));
                            }
                            Err(e) => {
                                consecutive_parse_errors += 1;
                                warn!("sse payload parse error: {}", e);
                                if consecutive_parse_errors >= SSE_MAX_CONSECUTIVE_PARSE_ERRORS {
                                    warn!("too many consecutive sse parse errors, forcing reconnect");
                                    consecutive_parse_errors = 0;
                                    break;
                                }
                            }
                        }
                    }
                }

                attempt += 1;
                tokio::time::sleep(backoff_with_jitter(attempt)).await;
            }

            *state.lock().unwrap_or_else(|e| e.into_inner()) = DataSourceState::Closed;
        });

        Ok(())
    }
}

/// Installs nothing, but — unlike `NoneDataSource` — signals the first-load
/// latch immediately with `Ok(())`, so `ensure_loaded` resolves right away.
pub struct EmptyDataSource {
    first_load: FirstLoadLatch,
}

impl EmptyDataSource {
    pub fn new(first_load: FirstLoadLatch) -> Self {
        Self { first_load }
    }
}

impl DataSource for EmptyDataSource {
    fn start(&self, _cancel: CancellationToken) -> Result<(), GrowthBookError> {
        self.first_load.signal(Ok(()));
        Ok(())
    }
}

/// No background refresh at all; features are only ever set explicitly via
/// `set_features`/`set_encrypted_features`. Never signals the first-load
/// latch on its own — `ensure_loaded` only resolves via cancellation.
pub struct NoneDataSource;

impl DataSource for NoneDataSource {
    fn start(&self, _cancel: CancellationToken) -> Result<(), GrowthBookError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_sse_frames_extracts_data_lines() {
        let mut buf = b"data: {\"features\":{}}\n\n".to_vec();
        let events = drain_sse_frames(&mut buf);
        assert_eq!(events, vec!["{\"features\":{}}".to_string()]);
        assert!(buf.is_empty());
    }

    #[test]
    fn drain_sse_frames_handles_multiline_data() {
        let mut buf = b"data: line1\ndata: line2\n\n".to_vec();
        let events = drain_sse_frames(&mut buf);
        assert_eq!(events, vec!["line1\nline2".to_string()]);
    }

    #[test]
    fn drain_sse_frames_leaves_partial_frame_buffered() {
        let mut buf = b"data: partial".to_vec();
        let events = drain_sse_frames(&mut buf);
        assert!(events.is_empty());
        assert_eq!(buf, b"data: partial".to_vec());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let small = backoff_with_jitter(0);
        let large = backoff_with_jitter(20);
        assert!(small < Duration::from_secs(2));
        assert!(large <= SSE_MAX_BACKOFF + Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn first_load_latch_signals_waiters() {
        let latch = FirstLoadLatch::new();
        let latch2 = latch.clone();
        let handle = tokio::spawn(async move { latch2.wait().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        latch.signal(Ok(()));
        let result = handle.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn first_load_latch_carries_error() {
        let latch = FirstLoadLatch::new();
        latch.signal(Err(GrowthBookError::Cancelled));
        assert!(latch.wait().await.is_err());
    }

    fn shared_state(api_host: String) -> Arc<SharedState> {
        Arc::new(SharedState {
            api_host,
            client_key: Some("test-key".to_string()),
            decryption_key: None,
            features: std::sync::RwLock::new(Default::default()),
            saved_groups: std::sync::RwLock::new(Default::default()),
            etag: std::sync::RwLock::new(None),
            sticky_bucket_service: None,
            http_client: Client::new(),
            refresh_callbacks: std::sync::RwLock::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn poll_once_installs_features_and_honors_etag() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/features/test-key")
            .with_status(200)
            .with_header("etag", "v1")
            .with_body(r#"{"features":{"flag":{"defaultValue":true,"rules":[]}}}"#)
            .create_async()
            .await;

        let shared = shared_state(server.url());
        let ds = PollingDataSource::new(shared.clone(), "test-key".to_string(), Duration::from_secs(60), FirstLoadLatch::new());

        ds.poll_once(&shared.http_client).await.expect("first poll should succeed");
        mock.assert_async().await;
        assert_eq!(shared.features.read().unwrap().len(), 1);
        assert_eq!(shared.etag.read().unwrap().as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn poll_once_skips_reparse_on_304() {
        let mut server = mockito::Server::new_async().await;
        let not_modified = server.mock("GET", "/api/features/test-key").match_header("if-none-match", "v1").with_status(304).create_async().await;

        let shared = shared_state(server.url());
        *shared.etag.write().unwrap() = Some("v1".to_string());
        let ds = PollingDataSource::new(shared.clone(), "test-key".to_string(), Duration::from_secs(60), FirstLoadLatch::new());

        ds.poll_once(&shared.http_client).await.expect("304 should be treated as success");
        not_modified.assert_async().await;
        assert_eq!(shared.features.read().unwrap().len(), 0);
    }
}
