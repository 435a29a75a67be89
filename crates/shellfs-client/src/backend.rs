//! The thin RPC surface over the conversation backend.
//!
//! Pure request/response; all state lives in the caller. Every request
//! carries the fixed identity header, writes additionally mark themselves
//! as frontend requests.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use shellfs_common::model::{InitPayload, ModelCatalog, ModelRecord};
use shellfs_common::summary::parse_summaries;

use crate::error::{ClientError, Result};

const IDENTITY_HEADER: &str = "X-Exedev-Userid";
const IDENTITY_VALUE: &str = "1";
const REQUEST_HEADER: &str = "X-Shelley-Request";

/// Model responses can take minutes; keep the per-request timeout generous.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

fn init_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)window\.__SHELLEY_INIT__\s*=\s*(\{.*?\});").ok())
        .as_ref()
}

/// The backend's answer to a conversation create.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartedConversation {
    #[serde(default)]
    pub conversation_id: String,
    /// Slug assignment is asynchronous on the backend; this may be empty
    /// right after create and gets backfilled from a later listing.
    #[serde(default)]
    pub slug: String,
}

#[derive(Debug, Serialize)]
struct StartRequest<'a> {
    message: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    model: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    cwd: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    message: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    model: &'a str,
}

/// Stateless client for the conversation backend.
#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
}

impl BackendClient {
    /// Creates a client for the given backend URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL does not parse or the HTTP client cannot
    /// be constructed.
    pub fn new(base_url: &str) -> Result<Self> {
        url::Url::parse(base_url)
            .map_err(|e| ClientError::InvalidUrl(format!("{base_url}: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// The backend URL this client talks to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .get(format!("{}{path}", self.base_url))
            .header(IDENTITY_HEADER, IDENTITY_VALUE)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .post(format!("{}{path}", self.base_url))
            .header(IDENTITY_HEADER, IDENTITY_VALUE)
            .header(REQUEST_HEADER, "1")
    }

    async fn accept(resp: reqwest::Response, accepted: &[StatusCode]) -> Result<Vec<u8>> {
        let status = resp.status();
        let bytes = resp.bytes().await?;
        if accepted.contains(&status) {
            Ok(bytes.to_vec())
        } else {
            Err(ClientError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            })
        }
    }

    /// Fetches the model listing and the default model id.
    ///
    /// Models come from `/api/models`, falling back to the legacy
    /// `__SHELLEY_INIT__` payload; the default always comes from the init
    /// payload. Missing or invalid sources degrade to an empty catalog.
    pub async fn list_models(&self) -> ModelCatalog {
        let init = self.fetch_init().await.unwrap_or_else(|e| {
            debug!(error = %e, "init payload unavailable");
            InitPayload::default()
        });
        let models = match self.fetch_api_models().await {
            Ok(models) if !models.is_empty() => models,
            Ok(_) => init.models,
            Err(e) => {
                debug!(error = %e, "model listing unavailable, using init payload");
                init.models
            }
        };
        ModelCatalog {
            models,
            default_id: init.default_model,
        }
    }

    /// The backend's default model id, or empty when it reports none.
    pub async fn default_model(&self) -> String {
        self.fetch_init()
            .await
            .map(|init| init.default_model)
            .unwrap_or_default()
    }

    async fn fetch_init(&self) -> Result<InitPayload> {
        let body = Self::accept(self.get("/").send().await?, &[StatusCode::OK]).await?;
        let html = String::from_utf8_lossy(&body);
        let Some(blob) = init_regex()
            .and_then(|re| re.captures(&html))
            .and_then(|caps| caps.get(1))
        else {
            return Ok(InitPayload::default());
        };
        Ok(serde_json::from_str(blob.as_str()).unwrap_or_default())
    }

    async fn fetch_api_models(&self) -> Result<Vec<ModelRecord>> {
        let body = Self::accept(self.get("/api/models").send().await?, &[StatusCode::OK]).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Raw JSON bytes of the active conversation listing.
    pub async fn list_conversations(&self) -> Result<Vec<u8>> {
        Self::accept(
            self.get("/api/conversations").send().await?,
            &[StatusCode::OK],
        )
        .await
    }

    /// Raw JSON bytes of the archived conversation listing. A 404 is
    /// normalised to an empty listing.
    pub async fn list_archived(&self) -> Result<Vec<u8>> {
        let resp = self.get("/api/conversations/archived").send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(b"[]".to_vec());
        }
        Self::accept(resp, &[StatusCode::OK]).await
    }

    /// Raw JSON bytes of one conversation, messages included.
    pub async fn get_conversation(&self, backend_id: &str) -> Result<Vec<u8>> {
        Self::accept(
            self.get(&format!("/api/conversation/{backend_id}"))
                .send()
                .await?,
            &[StatusCode::OK],
        )
        .await
    }

    /// Creates a conversation with its initial message.
    pub async fn start_conversation(
        &self,
        message: &str,
        model_api_id: &str,
        cwd: &str,
    ) -> Result<StartedConversation> {
        let body = Self::accept(
            self.post("/api/conversations/new")
                .json(&StartRequest {
                    message,
                    model: model_api_id,
                    cwd,
                })
                .send()
                .await?,
            &[StatusCode::OK, StatusCode::CREATED],
        )
        .await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Sends a follow-up message to an existing conversation.
    pub async fn send_message(
        &self,
        backend_id: &str,
        message: &str,
        model_api_id: &str,
    ) -> Result<()> {
        Self::accept(
            self.post(&format!("/api/conversation/{backend_id}/chat"))
                .json(&ChatRequest {
                    message,
                    model: model_api_id,
                })
                .send()
                .await?,
            &[StatusCode::OK, StatusCode::CREATED, StatusCode::ACCEPTED],
        )
        .await?;
        Ok(())
    }

    /// Archives a conversation.
    pub async fn archive(&self, backend_id: &str) -> Result<()> {
        Self::accept(
            self.post(&format!("/api/conversation/{backend_id}/archive"))
                .send()
                .await?,
            &[StatusCode::OK],
        )
        .await?;
        Ok(())
    }

    /// Unarchives a conversation.
    pub async fn unarchive(&self, backend_id: &str) -> Result<()> {
        Self::accept(
            self.post(&format!("/api/conversation/{backend_id}/unarchive"))
                .send()
                .await?,
            &[StatusCode::OK],
        )
        .await?;
        Ok(())
    }

    /// Whether the backend reports the conversation archived. Checks the
    /// active listing first, then the archived one.
    pub async fn is_archived(&self, backend_id: &str) -> Result<bool> {
        let active = self.list_conversations().await?;
        if parse_summaries(&active).iter().any(|s| s.id == backend_id) {
            return Ok(false);
        }
        let archived = self.list_archived().await?;
        if parse_summaries(&archived)
            .iter()
            .any(|s| s.id == backend_id)
        {
            return Ok(true);
        }
        warn!(backend_id, "conversation in neither listing");
        Ok(false)
    }
}
