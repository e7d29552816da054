//! Localization dictionary
//!
//! The dictionary is fetched once from a JSON endpoint and then serves
//! `lookup` from memory. Until the fetch succeeds every lookup reports
//! `NotReady`; there is no undefined result.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DictionaryError {
    #[error("Dictionary has not been loaded yet")]
    NotReady,

    #[error("Unknown message key: {0}")]
    UnknownKey(String),

    #[error("Failed to fetch dictionary: {0}")]
    Fetch(String),
}

/// Shared, load-once key/value dictionary. Clones share the same entries.
#[derive(Debug, Clone)]
pub struct Dictionary {
    entries: Arc<OnceCell<HashMap<String, String>>>,
    client: reqwest::Client,
}

impl Default for Dictionary {
    fn default() -> Self {
        Self::new()
    }
}

impl Dictionary {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            entries: Arc::new(OnceCell::new()),
            client,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.entries.initialized()
    }

    /// Fetch the dictionary from `url` unless it is already loaded.
    /// Concurrent callers share one request. A failed fetch leaves the
    /// dictionary not ready so it can be retried.
    pub async fn load(&self, url: &str) -> Result<usize, DictionaryError> {
        let entries = self
            .entries
            .get_or_try_init(|| fetch(&self.client, url))
            .await?;
        Ok(entries.len())
    }

    /// Load in the background, logging the outcome
    pub fn spawn_load(&self, url: String) -> JoinHandle<()> {
        let dictionary = self.clone();
        tokio::spawn(async move {
            if let Err(e) = dictionary.load(&url).await {
                tracing::warn!(url = %url, "Dictionary unavailable: {}", e);
            }
        })
    }

    /// Install entries directly. Returns false if already loaded.
    pub fn install(&self, entries: HashMap<String, String>) -> bool {
        self.entries.set(entries).is_ok()
    }

    pub fn lookup(&self, key: &str) -> Result<String, DictionaryError> {
        let entries = self.entries.get().ok_or(DictionaryError::NotReady)?;
        entries
            .get(key)
            .cloned()
            .ok_or_else(|| DictionaryError::UnknownKey(key.to_string()))
    }

    /// `lookup`, falling back to `default` for any error
    pub fn lookup_or(&self, key: &str, default: &str) -> String {
        self.lookup(key).unwrap_or_else(|_| default.to_string())
    }
}

async fn fetch(
    client: &reqwest::Client,
    url: &str,
) -> Result<HashMap<String, String>, DictionaryError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| DictionaryError::Fetch(e.to_string()))?;

    if !response.status().is_success() {
        return Err(DictionaryError::Fetch(format!(
            "dictionary endpoint returned status: {}",
            response.status()
        )));
    }

    let raw: HashMap<String, Value> = response
        .json()
        .await
        .map_err(|e| DictionaryError::Fetch(e.to_string()))?;

    let entries = flatten(raw);
    tracing::info!(url, entries = entries.len(), "Dictionary loaded");
    Ok(entries)
}

/// Keep string values; numbers and booleans are stringified, anything
/// nested is skipped.
fn flatten(raw: HashMap<String, Value>) -> HashMap<String, String> {
    raw.into_iter()
        .filter_map(|(key, value)| match value {
            Value::String(s) => Some((key, s)),
            Value::Number(n) => Some((key, n.to_string())),
            Value::Bool(b) => Some((key, b.to_string())),
            _ => {
                tracing::debug!(key = %key, "Skipping non-scalar dictionary entry");
                None
            }
        })
        .collect()
}
