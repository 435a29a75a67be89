//! Read-through cache over the backend client.
//!
//! Reads are cached per key with an absolute expiry; concurrent misses on
//! one key coalesce onto a single upstream request. Writes pass through and
//! invalidate the entries they affect before returning. Cached values are
//! shared `Arc`s and must not be mutated; pointer identity doubles as a
//! cheap cache-hit signal for downstream parsers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::OnceCell;
use tracing::debug;

use shellfs_common::model::ModelCatalog;
use shellfs_common::summary::parse_summaries;

use crate::backend::{BackendClient, StartedConversation};
use crate::error::{ClientError, SharedError};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CacheKey {
    Conversation(String),
    ConversationList,
    ArchivedList,
    Models,
}

#[derive(Clone)]
enum CacheValue {
    Bytes(Arc<[u8]>),
    Models(Arc<ModelCatalog>),
}

struct Entry {
    value: CacheValue,
    expires_at: Instant,
}

type FlightCell = Arc<OnceCell<Result<CacheValue, SharedError>>>;

/// Caching wrapper around [`BackendClient`].
pub struct CachingClient {
    backend: BackendClient,
    ttl: Duration,
    entries: RwLock<HashMap<CacheKey, Entry>>,
    flights: Mutex<HashMap<CacheKey, FlightCell>>,
}

impl CachingClient {
    /// Wraps a backend client with the given cache TTL. A zero TTL disables
    /// caching; coalescing of concurrent identical reads stays active.
    pub fn new(backend: BackendClient, ttl: Duration) -> Self {
        Self {
            backend,
            ttl,
            entries: RwLock::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> &BackendClient {
        &self.backend
    }

    fn probe(&self, key: &CacheKey) -> Option<CacheValue> {
        if self.ttl.is_zero() {
            return None;
        }
        let entries = self.entries.read().ok()?;
        let entry = entries.get(key)?;
        (entry.expires_at > Instant::now()).then(|| entry.value.clone())
    }

    fn store(&self, key: CacheKey, value: CacheValue) {
        if self.ttl.is_zero() {
            return;
        }
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(
                key,
                Entry {
                    value,
                    expires_at: Instant::now() + self.ttl,
                },
            );
        }
    }

    fn drop_key(&self, key: &CacheKey) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(key);
        }
    }

    /// Read through the cache, coalescing concurrent misses for `key` onto a
    /// single upstream call. No lock is held across the upstream request,
    /// and failures are never cached.
    async fn read_through<F, Fut>(&self, key: CacheKey, fetch: F) -> Result<CacheValue, SharedError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CacheValue, ClientError>>,
    {
        if let Some(value) = self.probe(&key) {
            return Ok(value);
        }

        let cell: FlightCell = {
            let mut flights = self.flights.lock().map_err(|_| poisoned())?;
            Arc::clone(flights.entry(key.clone()).or_default())
        };

        let result = cell
            .get_or_init(|| async {
                let outcome = fetch().await.map_err(Arc::new);
                if let Ok(value) = &outcome {
                    self.store(key.clone(), value.clone());
                }
                outcome
            })
            .await
            .clone();

        if let Ok(mut flights) = self.flights.lock() {
            if flights.get(&key).is_some_and(|cur| Arc::ptr_eq(cur, &cell)) {
                flights.remove(&key);
            }
        }

        result
    }

    /// One conversation's raw JSON bytes.
    pub async fn get_conversation(&self, backend_id: &str) -> Result<Arc<[u8]>, SharedError> {
        let key = CacheKey::Conversation(backend_id.to_string());
        let id = backend_id.to_string();
        let value = self
            .read_through(key, || async move {
                self.backend
                    .get_conversation(&id)
                    .await
                    .map(|bytes| CacheValue::Bytes(Arc::from(bytes)))
            })
            .await?;
        Ok(value.into_bytes())
    }

    /// Raw JSON bytes of the active conversation listing.
    pub async fn list_conversations(&self) -> Result<Arc<[u8]>, SharedError> {
        let value = self
            .read_through(CacheKey::ConversationList, || async {
                self.backend
                    .list_conversations()
                    .await
                    .map(|bytes| CacheValue::Bytes(Arc::from(bytes)))
            })
            .await?;
        Ok(value.into_bytes())
    }

    /// Raw JSON bytes of the archived conversation listing.
    pub async fn list_archived(&self) -> Result<Arc<[u8]>, SharedError> {
        let value = self
            .read_through(CacheKey::ArchivedList, || async {
                self.backend
                    .list_archived()
                    .await
                    .map(|bytes| CacheValue::Bytes(Arc::from(bytes)))
            })
            .await?;
        Ok(value.into_bytes())
    }

    /// The model catalog. The upstream listing degrades instead of failing,
    /// so this can only fail on an internal invariant.
    pub async fn models(&self) -> Result<Arc<ModelCatalog>, SharedError> {
        let value = self
            .read_through(CacheKey::Models, || async {
                Ok(CacheValue::Models(Arc::new(self.backend.list_models().await)))
            })
            .await?;
        Ok(value.into_models())
    }

    /// Creates a conversation and invalidates the active listing.
    pub async fn start_conversation(
        &self,
        message: &str,
        model_api_id: &str,
        cwd: &str,
    ) -> Result<StartedConversation, SharedError> {
        let started = self
            .backend
            .start_conversation(message, model_api_id, cwd)
            .await
            .map_err(Arc::new)?;
        self.drop_key(&CacheKey::ConversationList);
        Ok(started)
    }

    /// Sends a message and invalidates that conversation's cache entry. The
    /// invalidation is visible before this returns.
    pub async fn send_message(
        &self,
        backend_id: &str,
        message: &str,
        model_api_id: &str,
    ) -> Result<(), SharedError> {
        self.backend
            .send_message(backend_id, message, model_api_id)
            .await
            .map_err(Arc::new)?;
        self.drop_key(&CacheKey::Conversation(backend_id.to_string()));
        Ok(())
    }

    /// Archives a conversation and invalidates both listings.
    pub async fn archive(&self, backend_id: &str) -> Result<(), SharedError> {
        self.backend.archive(backend_id).await.map_err(Arc::new)?;
        self.drop_key(&CacheKey::ConversationList);
        self.drop_key(&CacheKey::ArchivedList);
        Ok(())
    }

    /// Unarchives a conversation and invalidates both listings.
    pub async fn unarchive(&self, backend_id: &str) -> Result<(), SharedError> {
        self.backend.unarchive(backend_id).await.map_err(Arc::new)?;
        self.drop_key(&CacheKey::ConversationList);
        self.drop_key(&CacheKey::ArchivedList);
        Ok(())
    }

    /// Whether the backend reports the conversation archived, answered from
    /// the cached listings: the active one first, then the archived one.
    pub async fn is_archived(&self, backend_id: &str) -> Result<bool, SharedError> {
        let active = self.list_conversations().await?;
        if parse_summaries(&active).iter().any(|s| s.id == backend_id) {
            return Ok(false);
        }
        let archived = self.list_archived().await?;
        Ok(parse_summaries(&archived)
            .iter()
            .any(|s| s.id == backend_id))
    }

    /// Drops the cache entry for one conversation.
    pub fn invalidate(&self, backend_id: &str) {
        debug!(backend_id, "invalidating conversation cache entry");
        self.drop_key(&CacheKey::Conversation(backend_id.to_string()));
    }

    /// Drops every cache entry.
    pub fn invalidate_all(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }
}

impl CacheValue {
    fn into_bytes(self) -> Arc<[u8]> {
        match self {
            Self::Bytes(bytes) => bytes,
            Self::Models(_) => unreachable!("byte-valued cache key held a model catalog"),
        }
    }

    fn into_models(self) -> Arc<ModelCatalog> {
        match self {
            Self::Models(catalog) => catalog,
            Self::Bytes(_) => unreachable!("model cache key held raw bytes"),
        }
    }
}

fn poisoned() -> SharedError {
    Arc::new(ClientError::Internal("cache lock poisoned".to_string()))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TTL: Duration = Duration::from_secs(60);

    async fn caching_client(server: &MockServer, ttl: Duration) -> CachingClient {
        CachingClient::new(BackendClient::new(&server.uri()).unwrap(), ttl)
    }

    #[tokio::test]
    async fn concurrent_reads_coalesce_to_one_upstream_get() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/conversation/conv-1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"messages": []}))
                    .set_delay(Duration::from_millis(50)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = Arc::new(caching_client(&server, TTL).await);
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let client = Arc::clone(&client);
            tasks.push(tokio::spawn(async move {
                client.get_conversation("conv-1").await
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }
    }

    #[tokio::test]
    async fn cache_hits_share_the_same_allocation() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/conversation/conv-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "messages": []
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = caching_client(&server, TTL).await;
        let first = client.get_conversation("conv-1").await.unwrap();
        let second = client.get_conversation("conv-1").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn send_invalidates_that_conversation() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/conversation/conv-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "messages": []
            })))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/conversation/conv-1/chat"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let client = caching_client(&server, TTL).await;
        client.get_conversation("conv-1").await.unwrap();
        client.send_message("conv-1", "hello", "").await.unwrap();
        client.get_conversation("conv-1").await.unwrap();
    }

    #[tokio::test]
    async fn archive_invalidates_both_listings() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/conversations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/conversations/archived"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/conversation/conv-1/archive"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = caching_client(&server, TTL).await;
        client.list_conversations().await.unwrap();
        client.list_archived().await.unwrap();
        client.archive("conv-1").await.unwrap();
        client.list_conversations().await.unwrap();
        client.list_archived().await.unwrap();
    }

    #[tokio::test]
    async fn zero_ttl_disables_caching() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/conversations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .expect(2)
            .mount(&server)
            .await;

        let client = caching_client(&server, Duration::ZERO).await;
        client.list_conversations().await.unwrap();
        client.list_conversations().await.unwrap();
    }

    #[tokio::test]
    async fn errors_are_not_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/conversation/flaky"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/conversation/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "messages": []
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = caching_client(&server, TTL).await;
        assert!(client.get_conversation("flaky").await.is_err());
        assert!(client.get_conversation("flaky").await.is_ok());
    }

    #[tokio::test]
    async fn explicit_invalidation_forces_a_refetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/conversation/conv-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "messages": []
            })))
            .expect(2)
            .mount(&server)
            .await;

        let client = caching_client(&server, TTL).await;
        client.get_conversation("conv-1").await.unwrap();
        client.invalidate("conv-1");
        client.get_conversation("conv-1").await.unwrap();
    }

    #[tokio::test]
    async fn models_are_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"id": "m1", "display_name": "Model One", "ready": true}
            ])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "window.__SHELLEY_INIT__ = {\"default_model\":\"m1\"};",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let client = caching_client(&server, TTL).await;
        let first = client.models().await.unwrap();
        let second = client.models().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.default_id, "m1");
    }
}
