//! The concurrent SDK entry point. Generalizes the teacher's `GrowthBook` +
//! `FeatureRepository` split into a single `GrowthBookClient`: an
//! `Arc<SharedState>` collaborator (catalog, saved groups, sticky-bucket
//! service, http client) referenced by a parent and all of its child clones,
//! plus a per-clone `LocalOverrides` struct holding evaluation-time fields.
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::error;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::datasource::{DataSource, EmptyDataSource, FirstLoadLatch, NoneDataSource, PollingDataSource, SseDataSource};
use crate::error::GrowthBookError;
use crate::evaluator::{self, EvalContext};
use crate::model::{Experiment, ExperimentResult, FeatureMap, FeatureResult, ForcedVariationsMap, SavedGroupsMap};
use crate::sticky_bucket::StickyBucketService;
use crate::util;

// should match Cargo.toml's [package] version
pub const SDK_VERSION: &str = "0.1.0";

const DEFAULT_API_HOST: &str = "https://cdn.growthbook.io";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

pub struct FeatureRefreshCallback(pub Box<dyn Fn(&FeatureMap) + Send + Sync>);

impl fmt::Debug for FeatureRefreshCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<feature_refresh_callback>")
    }
}

type ExperimentCallback = dyn Fn(&Experiment, &ExperimentResult) + Send + Sync;
type FeatureUsageCallback = dyn Fn(&str, &FeatureResult) + Send + Sync;

/// The data this client and all clones derived from it share. Reads take the
/// relevant `RwLock` only for the duration of the copy/lookup; evaluation
/// itself runs lock-free against a snapshot.
pub struct SharedState {
    pub api_host: String,
    pub client_key: Option<String>,
    pub decryption_key: Option<String>,
    pub features: RwLock<FeatureMap>,
    pub saved_groups: RwLock<SavedGroupsMap>,
    pub etag: RwLock<Option<String>>,
    pub sticky_bucket_service: Option<Arc<dyn StickyBucketService>>,
    pub http_client: reqwest::Client,
    pub refresh_callbacks: RwLock<Vec<FeatureRefreshCallback>>,
}

impl SharedState {
    pub fn run_refresh_callbacks(&self) {
        let features = match self.features.read() {
            Ok(g) => g.clone(),
            Err(_) => {
                error!("feature catalog lock poisoned on read");
                return;
            }
        };
        match self.refresh_callbacks.read() {
            Ok(callbacks) => {
                for callback in callbacks.iter() {
                    (callback.0)(&features);
                }
            }
            Err(_) => error!("refresh callback list lock poisoned on read"),
        }
    }
}

/// Per-clone evaluation-time fields. Never shared: a child client's
/// `with_*` call produces a new `LocalOverrides`, leaving the parent's
/// untouched.
#[derive(Clone)]
pub struct LocalOverrides {
    pub attributes: Value,
    pub url: String,
    pub forced_variations: ForcedVariationsMap,
    pub enabled: bool,
    pub qa_mode: bool,
    pub extra_data: Value,
    /// When set, takes precedence over `SharedState::saved_groups` for this
    /// client and any clones derived from it, the way `with_attributes`
    /// replaces attributes wholesale — independent of the parent and of
    /// any sibling clones.
    pub saved_groups: Option<SavedGroupsMap>,
    pub experiment_callback: Option<Arc<ExperimentCallback>>,
    pub feature_usage_callback: Option<Arc<FeatureUsageCallback>>,
}

impl Default for LocalOverrides {
    fn default() -> Self {
        Self {
            attributes: Value::Object(Default::default()),
            url: String::new(),
            forced_variations: ForcedVariationsMap::new(),
            enabled: true,
            qa_mode: false,
            extra_data: Value::Object(Default::default()),
            saved_groups: None,
            experiment_callback: None,
            feature_usage_callback: None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub enum DataSourceConfig {
    Polling(Duration),
    Sse,
    /// Installs nothing; `start` succeeds immediately and resolves
    /// `ensure_loaded` right away, unlike `None`, which never signals.
    Empty,
    /// No data source at all; `ensure_loaded` only resolves via
    /// cancellation unless the catalog is installed manually.
    None,
}

impl Default for DataSourceConfig {
    fn default() -> Self {
        DataSourceConfig::Polling(DEFAULT_POLL_INTERVAL)
    }
}

pub struct GrowthBookClientBuilder {
    api_host: String,
    client_key: Option<String>,
    decryption_key: Option<String>,
    attributes: Value,
    url: String,
    enabled: bool,
    qa_mode: bool,
    forced_variations: ForcedVariationsMap,
    sticky_bucket_service: Option<Arc<dyn StickyBucketService>>,
    http_client: Option<reqwest::Client>,
    data_source_config: DataSourceConfig,
}

impl Default for GrowthBookClientBuilder {
    fn default() -> Self {
        Self {
            api_host: DEFAULT_API_HOST.to_string(),
            client_key: None,
            decryption_key: None,
            attributes: Value::Object(Default::default()),
            url: String::new(),
            enabled: true,
            qa_mode: false,
            forced_variations: ForcedVariationsMap::new(),
            sticky_bucket_service: None,
            http_client: None,
            data_source_config: DataSourceConfig::default(),
        }
    }
}

impl GrowthBookClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn api_host(mut self, api_host: impl Into<String>) -> Self {
        self.api_host = api_host.into();
        self
    }

    pub fn client_key(mut self, client_key: impl Into<String>) -> Self {
        self.client_key = Some(client_key.into());
        self
    }

    pub fn decryption_key(mut self, decryption_key: impl Into<String>) -> Self {
        self.decryption_key = Some(decryption_key.into());
        self
    }

    pub fn attributes(mut self, attributes: Value) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn qa_mode(mut self, qa_mode: bool) -> Self {
        self.qa_mode = qa_mode;
        self
    }

    pub fn forced_variations(mut self, forced_variations: ForcedVariationsMap) -> Self {
        self.forced_variations = forced_variations;
        self
    }

    pub fn sticky_bucket_service(mut self, service: Arc<dyn StickyBucketService>) -> Self {
        self.sticky_bucket_service = Some(service);
        self
    }

    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn data_source(mut self, config: DataSourceConfig) -> Self {
        self.data_source_config = config;
        self
    }

    pub fn build(self) -> Result<GrowthBookClient, GrowthBookError> {
        let http_client = self.http_client.unwrap_or_else(|| {
            reqwest::Client::builder().user_agent(format!("growthbook-sdk-rust/{}", SDK_VERSION)).build().unwrap_or_default()
        });

        let shared = Arc::new(SharedState {
            api_host: self.api_host,
            client_key: self.client_key,
            decryption_key: self.decryption_key,
            features: RwLock::new(FeatureMap::new()),
            saved_groups: RwLock::new(SavedGroupsMap::new()),
            etag: RwLock::new(None),
            sticky_bucket_service: self.sticky_bucket_service,
            http_client,
            refresh_callbacks: RwLock::new(Vec::new()),
        });

        let overrides = LocalOverrides {
            attributes: self.attributes,
            url: self.url,
            forced_variations: self.forced_variations,
            enabled: self.enabled,
            qa_mode: self.qa_mode,
            ..LocalOverrides::default()
        };

        Ok(GrowthBookClient {
            shared,
            overrides,
            data_source_config: self.data_source_config,
            data_source: None,
            cancel: CancellationToken::new(),
            first_load: FirstLoadLatch::new(),
        })
    }
}

/// The main SDK handle. Cheap to clone the `Arc<SharedState>` it wraps;
/// `with_*` methods instead return an independent client carrying a fresh
/// `LocalOverrides`, sharing the same catalog.
pub struct GrowthBookClient {
    shared: Arc<SharedState>,
    overrides: LocalOverrides,
    data_source_config: DataSourceConfig,
    data_source: Option<Arc<dyn DataSource>>,
    cancel: CancellationToken,
    first_load: FirstLoadLatch,
}

impl GrowthBookClient {
    pub fn builder() -> GrowthBookClientBuilder {
        GrowthBookClientBuilder::new()
    }

    fn clone_with(&self, overrides: LocalOverrides) -> GrowthBookClient {
        GrowthBookClient {
            shared: self.shared.clone(),
            overrides,
            data_source_config: self.data_source_config,
            data_source: self.data_source.clone(),
            cancel: self.cancel.clone(),
            first_load: self.first_load.clone(),
        }
    }

    pub fn with_attributes(&self, attributes: Value) -> GrowthBookClient {
        self.clone_with(LocalOverrides { attributes, ..self.overrides.clone() })
    }

    /// Shallow-merges `patch` into the current attributes object.
    pub fn with_attributes_overrides(&self, patch: Value) -> GrowthBookClient {
        let mut merged = self.overrides.attributes.clone();
        if let (Some(base), Some(patch_obj)) = (merged.as_object_mut(), patch.as_object()) {
            for (k, v) in patch_obj {
                base.insert(k.clone(), v.clone());
            }
        }
        self.clone_with(LocalOverrides { attributes: merged, ..self.overrides.clone() })
    }

    pub fn with_url(&self, url: impl Into<String>) -> GrowthBookClient {
        self.clone_with(LocalOverrides { url: url.into(), ..self.overrides.clone() })
    }

    pub fn with_enabled(&self, enabled: bool) -> GrowthBookClient {
        self.clone_with(LocalOverrides { enabled, ..self.overrides.clone() })
    }

    pub fn with_qa_mode(&self, qa_mode: bool) -> GrowthBookClient {
        self.clone_with(LocalOverrides { qa_mode, ..self.overrides.clone() })
    }

    pub fn with_forced_variations(&self, forced_variations: ForcedVariationsMap) -> GrowthBookClient {
        self.clone_with(LocalOverrides { forced_variations, ..self.overrides.clone() })
    }

    pub fn with_extra_data(&self, extra_data: Value) -> GrowthBookClient {
        self.clone_with(LocalOverrides { extra_data, ..self.overrides.clone() })
    }

    pub fn with_experiment_callback(&self, callback: Arc<ExperimentCallback>) -> GrowthBookClient {
        self.clone_with(LocalOverrides { experiment_callback: Some(callback), ..self.overrides.clone() })
    }

    pub fn with_feature_usage_callback(&self, callback: Arc<FeatureUsageCallback>) -> GrowthBookClient {
        self.clone_with(LocalOverrides { feature_usage_callback: Some(callback), ..self.overrides.clone() })
    }

    /// Returns a child client with its own saved groups, independent of the
    /// parent and every sibling clone, same as `with_attributes`/
    /// `with_forced_variations`.
    pub fn with_saved_groups(&self, saved_groups: SavedGroupsMap) -> GrowthBookClient {
        self.clone_with(LocalOverrides { saved_groups: Some(saved_groups), ..self.overrides.clone() })
    }

    pub fn extra_data(&self) -> &Value {
        &self.overrides.extra_data
    }

    /// Atomically replaces the shared feature catalog.
    pub fn set_features(&self, features: FeatureMap) {
        match self.shared.features.write() {
            Ok(mut guard) => *guard = features,
            Err(_) => error!("feature catalog lock poisoned on write"),
        }
        self.shared.run_refresh_callbacks();
    }

    /// Decrypts and installs an encrypted feature payload.
    pub fn set_encrypted_features(&self, encrypted: &str) -> Result<(), GrowthBookError> {
        let key = self.shared.decryption_key.as_deref().ok_or(GrowthBookError::NoDecryptionKey)?;
        let plaintext = util::decrypt_string(encrypted, key)?;
        let features: FeatureMap = serde_json::from_str(&plaintext)?;
        self.set_features(features);
        Ok(())
    }

    fn build_data_source(&self) -> Arc<dyn DataSource> {
        let client_key = self.shared.client_key.clone().unwrap_or_default();
        match self.data_source_config {
            DataSourceConfig::Polling(interval) => Arc::new(PollingDataSource::new(self.shared.clone(), client_key, interval, self.first_load.clone())),
            DataSourceConfig::Sse => Arc::new(SseDataSource::new(self.shared.clone(), client_key, self.first_load.clone())),
            DataSourceConfig::Empty => Arc::new(EmptyDataSource::new(self.first_load.clone())),
            DataSourceConfig::None => Arc::new(NoneDataSource),
        }
    }

    /// Starts the background data source. Returns once the task is
    /// scheduled; use `ensure_loaded` to wait for the first attempt.
    pub fn start(&mut self) -> Result<(), GrowthBookError> {
        let data_source = self.build_data_source();
        data_source.start(self.cancel.clone())?;
        self.data_source = Some(data_source);
        Ok(())
    }

    /// Waits until the data source's first load attempt has completed
    /// (successfully or not), returning that attempt's error if any. Races
    /// against this client's cancellation token, so `close()` (or a
    /// cancelled parent) always unblocks a pending call, even for a
    /// `DataSourceConfig::None` client whose data source never signals.
    pub async fn ensure_loaded(&self) -> Result<(), GrowthBookError> {
        tokio::select! {
            result = self.first_load.wait() => result,
            _ = self.cancel.cancelled() => Err(GrowthBookError::Cancelled),
        }
    }

    /// Stops the background data source. Idempotent; safe to call from
    /// multiple clones concurrently, since they share the same token.
    pub fn close(&self) -> Result<(), GrowthBookError> {
        self.cancel.cancel();
        if let Some(ds) = &self.data_source {
            ds.close()?;
        }
        Ok(())
    }

    fn eval_context(&self) -> (FeatureMap, SavedGroupsMap) {
        let features = self.shared.features.read().map(|g| g.clone()).unwrap_or_else(|_| {
            error!("feature catalog lock poisoned on read");
            FeatureMap::new()
        });
        let saved_groups = match &self.overrides.saved_groups {
            Some(overridden) => overridden.clone(),
            None => self.shared.saved_groups.read().map(|g| g.clone()).unwrap_or_else(|_| {
                error!("saved groups lock poisoned on read");
                SavedGroupsMap::new()
            }),
        };
        (features, saved_groups)
    }

    pub fn eval_feature(&self, key: &str) -> FeatureResult {
        let (features, saved_groups) = self.eval_context();
        let ctx = EvalContext {
            features: &features,
            saved_groups: &saved_groups,
            attributes: &self.overrides.attributes,
            url: &self.overrides.url,
            forced_variations: &self.overrides.forced_variations,
            enabled: self.overrides.enabled,
            qa_mode: self.overrides.qa_mode,
            sticky_bucket_service: self.shared.sticky_bucket_service.as_deref(),
        };
        let result = evaluator::eval_feature(&ctx, key);
        if let Some(callback) = &self.overrides.feature_usage_callback {
            callback(key, &result);
        }
        if let (Some(exp), Some(exp_result)) = (&result.experiment, &result.experiment_result) {
            if let Some(callback) = &self.overrides.experiment_callback {
                callback(exp, exp_result);
            }
        }
        result
    }

    pub fn run_experiment(&self, experiment: &Experiment) -> ExperimentResult {
        let (features, saved_groups) = self.eval_context();
        let ctx = EvalContext {
            features: &features,
            saved_groups: &saved_groups,
            attributes: &self.overrides.attributes,
            url: &self.overrides.url,
            forced_variations: &self.overrides.forced_variations,
            enabled: self.overrides.enabled,
            qa_mode: self.overrides.qa_mode,
            sticky_bucket_service: self.shared.sticky_bucket_service.as_deref(),
        };
        let result = evaluator::run_experiment(&ctx, experiment);
        if let Some(callback) = &self.overrides.experiment_callback {
            callback(experiment, &result);
        }
        result
    }

    pub fn is_on(&self, key: &str) -> bool {
        self.eval_feature(key).on
    }

    pub fn is_off(&self, key: &str) -> bool {
        self.eval_feature(key).off
    }

    pub fn get_feature_value(&self, key: &str, fallback: &Value) -> Value {
        let value = self.eval_feature(key).value;
        if value.is_null() {
            fallback.clone()
        } else {
            value
        }
    }

    pub fn get_feature_value_as_str(&self, key: &str, fallback: &str) -> String {
        let value = self.eval_feature(key).value;
        if value.is_null() {
            fallback.to_string()
        } else {
            value.as_str().map(str::to_string).unwrap_or_else(|| fallback.to_string())
        }
    }

    pub fn get_feature_value_as_int(&self, key: &str, fallback: i64) -> i64 {
        let value = self.eval_feature(key).value;
        if value.is_null() {
            fallback
        } else {
            value.as_i64().unwrap_or(fallback)
        }
    }

    pub fn get_feature_value_as_bool(&self, key: &str, fallback: bool) -> bool {
        let value = self.eval_feature(key).value;
        if value.is_null() {
            fallback
        } else {
            value.as_bool().unwrap_or(fallback)
        }
    }

    pub fn get_feature_value_as_float(&self, key: &str, fallback: f64) -> f64 {
        let value = self.eval_feature(key).value;
        if value.is_null() {
            fallback
        } else {
            value.as_f64().unwrap_or(fallback)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Feature, FeatureRuleBuilder};
    use serde_json::json;

    fn client_with_feature() -> GrowthBookClient {
        let client = GrowthBookClient::builder().attributes(json!({"id": "u1"})).build().expect("client should build");
        let mut features = FeatureMap::new();
        features.insert("flag".to_string(), Feature { default_value: Some(json!(false)), rules: vec![FeatureRuleBuilder::default().force(Some(json!(true))).build().unwrap()] });
        client.set_features(features);
        client
    }

    #[test]
    fn eval_feature_reflects_installed_catalog() {
        let client = client_with_feature();
        assert!(client.is_on("flag"));
    }

    #[test]
    fn child_client_inherits_catalog_but_not_attributes() {
        let parent = client_with_feature();
        let child = parent.with_attributes(json!({"id": "u2"}));
        assert!(child.is_on("flag"));
        assert_eq!(child.extra_data(), &Value::Object(Default::default()));
    }

    #[test]
    fn with_attributes_overrides_merges_shallow() {
        let parent = GrowthBookClient::builder().attributes(json!({"id": "u1", "plan": "free"})).build().unwrap();
        let child = parent.with_attributes_overrides(json!({"plan": "pro"}));
        assert_eq!(child.overrides.attributes, json!({"id": "u1", "plan": "pro"}));
    }

    #[test]
    fn set_encrypted_features_without_key_errors() {
        let client = GrowthBookClient::builder().build().unwrap();
        let result = client.set_encrypted_features("abc.def");
        assert!(matches!(result, Err(GrowthBookError::NoDecryptionKey)));
    }

    #[tokio::test]
    async fn ensure_loaded_with_no_data_source_never_resolves_without_start() {
        let client = GrowthBookClient::builder().data_source(DataSourceConfig::None).build().unwrap();
        let result = tokio::time::timeout(Duration::from_millis(50), client.ensure_loaded()).await;
        assert!(result.is_err(), "ensure_loaded should not resolve until start() runs the data source");
    }

    #[tokio::test]
    async fn start_with_none_data_source_still_pending_after_start() {
        let mut client = GrowthBookClient::builder().data_source(DataSourceConfig::None).build().unwrap();
        client.start().unwrap();
        // NoneDataSource never signals, so ensure_loaded should still be pending
        // immediately after start.
        let result = tokio::time::timeout(Duration::from_millis(20), client.ensure_loaded()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn close_unblocks_a_pending_ensure_loaded() {
        let mut client = GrowthBookClient::builder().data_source(DataSourceConfig::None).build().unwrap();
        client.start().unwrap();
        client.close().unwrap();
        let result = tokio::time::timeout(Duration::from_millis(50), client.ensure_loaded()).await.expect("close should unblock ensure_loaded");
        assert!(matches!(result, Err(GrowthBookError::Cancelled)));
    }

    #[tokio::test]
    async fn empty_data_source_resolves_ensure_loaded_immediately() {
        let mut client = GrowthBookClient::builder().data_source(DataSourceConfig::Empty).build().unwrap();
        client.start().unwrap();
        let result = tokio::time::timeout(Duration::from_millis(50), client.ensure_loaded()).await.expect("empty data source should signal right away");
        assert!(result.is_ok());
    }
}
