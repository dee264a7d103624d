//! Client for the Yandex Search API v2 in deferred (async operation)
//! mode.
//!
//! Creating a search returns an operation id; the result arrives later
//! as a base64-encoded XML blob once the operation reports `done`.
//! Creation is gated on a local-time quiet window and both endpoints
//! are throttled with independent sliding-window limits.

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use data_encoding::BASE64;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

mod iam;
mod ratelimit;

pub use iam::{
    load_service_account_key_from_file, load_service_account_key_from_str, IamTokenProvider,
    ServiceAccountKey, StaticTokenProvider, TokenProvider, TOKEN_ENDPOINT,
};
pub use ratelimit::{RateLimitConfig, SlidingWindowLimiter};

pub const SEARCH_ASYNC_URL: &str = "https://searchapi.api.cloud.yandex.net/v2/web/searchAsync";
pub const OPERATIONS_URL: &str = "https://operation.api.cloud.yandex.net/operations";

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("deferred search creation is only allowed inside the night window (00:00-07:59 local)")]
    NightWindowViolation,
    #[error("operation {0} did not complete before the deadline")]
    OperationTimeout(String),
    #[error("search API returned HTTP {status}: {body}")]
    Api { status: u16, body: String },
    #[error("operation response is missing expected data: {0}")]
    InvalidResponse(String),
    #[error("token: {0}")]
    Token(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SearchType {
    #[serde(rename = "SEARCH_TYPE_RU")]
    Ru,
    #[serde(rename = "SEARCH_TYPE_TR")]
    Tr,
    #[serde(rename = "SEARCH_TYPE_COM")]
    Com,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FamilyMode {
    #[serde(rename = "FAMILY_MODE_NONE")]
    None,
    #[serde(rename = "FAMILY_MODE_MODERATE")]
    Moderate,
    #[serde(rename = "FAMILY_MODE_STRICT")]
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FixTypoMode {
    #[serde(rename = "FIX_TYPO_MODE_ON")]
    On,
    #[serde(rename = "FIX_TYPO_MODE_OFF")]
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SortMode {
    #[serde(rename = "SORT_MODE_BY_RELEVANCE")]
    ByRelevance,
    #[serde(rename = "SORT_MODE_BY_TIME")]
    ByTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SortOrder {
    #[serde(rename = "SORT_ORDER_DESC")]
    Desc,
    #[serde(rename = "SORT_ORDER_ASC")]
    Asc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GroupMode {
    #[serde(rename = "GROUP_MODE_DEEP")]
    Deep,
    #[serde(rename = "GROUP_MODE_FLAT")]
    Flat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResponseFormat {
    #[serde(rename = "FORMAT_XML")]
    Xml,
    #[serde(rename = "FORMAT_HTML")]
    Html,
}

/// Parameters for one deferred search. The defaults match what the
/// pipeline submits: russian web search, deep grouping, one document
/// per group, XML payload.
#[derive(Debug, Clone)]
pub struct DeferredQueryParams {
    pub query_text: String,
    pub region: i64,
    pub search_type: SearchType,
    pub localization: String,
    pub page: u32,
    pub fix_typo_mode: FixTypoMode,
    pub sort_mode: SortMode,
    pub sort_order: SortOrder,
    pub group_mode: GroupMode,
    pub groups_on_page: u32,
    pub docs_in_group: u32,
    pub max_passages: u32,
    pub response_format: ResponseFormat,
    pub user_agent: Option<String>,
}

impl DeferredQueryParams {
    pub fn new<S: Into<String>>(query_text: S) -> Self {
        Self {
            query_text: query_text.into(),
            region: 225,
            search_type: SearchType::Ru,
            localization: "LOCALIZATION_RU".to_string(),
            page: 0,
            fix_typo_mode: FixTypoMode::On,
            sort_mode: SortMode::ByRelevance,
            sort_order: SortOrder::Desc,
            group_mode: GroupMode::Deep,
            groups_on_page: 100,
            docs_in_group: 1,
            max_passages: 3,
            response_format: ResponseFormat::Xml,
            user_agent: None,
        }
    }

    fn to_request(&self, folder_id: &str) -> AsyncSearchRequest<'_> {
        AsyncSearchRequest {
            query: QuerySpec {
                search_type: self.search_type,
                query_text: &self.query_text,
                family_mode: FamilyMode::Moderate,
                page: self.page,
                fix_typo_mode: self.fix_typo_mode,
            },
            sort_spec: SortSpec {
                sort_mode: self.sort_mode,
                sort_order: self.sort_order,
            },
            group_spec: GroupSpec {
                group_mode: self.group_mode,
                groups_on_page: self.groups_on_page,
                docs_in_group: self.docs_in_group,
            },
            max_passages: self.max_passages,
            region: self.region,
            l10n: &self.localization,
            folder_id,
            response_format: self.response_format,
            user_agent: self.user_agent.as_deref(),
        }
    }
}

#[derive(Serialize)]
struct QuerySpec<'a> {
    search_type: SearchType,
    query_text: &'a str,
    family_mode: FamilyMode,
    page: u32,
    fix_typo_mode: FixTypoMode,
}

#[derive(Serialize)]
struct SortSpec {
    sort_mode: SortMode,
    sort_order: SortOrder,
}

#[derive(Serialize)]
struct GroupSpec {
    group_mode: GroupMode,
    groups_on_page: u32,
    docs_in_group: u32,
}

#[derive(Serialize)]
struct AsyncSearchRequest<'a> {
    query: QuerySpec<'a>,
    sort_spec: SortSpec,
    group_spec: GroupSpec,
    max_passages: u32,
    region: i64,
    l10n: &'a str,
    folder_id: &'a str,
    response_format: ResponseFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_agent: Option<&'a str>,
}

/// Payload of a completed operation. Known fields are typed; anything
/// else the API tacks on rides along in `extra`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OperationPayload {
    #[serde(rename = "rawData")]
    pub raw_data: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OperationResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub response: Option<OperationPayload>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

impl OperationResponse {
    /// Base64-decode the XML payload of a completed operation.
    pub fn decode_raw_data(&self) -> Result<Vec<u8>, SearchError> {
        let encoded = self
            .response
            .as_ref()
            .and_then(|r| r.raw_data.as_deref())
            .filter(|raw| !raw.is_empty())
            .ok_or_else(|| {
                SearchError::InvalidResponse("response.rawData is absent".to_string())
            })?;
        BASE64
            .decode(encoded.as_bytes())
            .map_err(|err| SearchError::InvalidResponse(format!("rawData is not base64: {err}")))
    }
}

#[derive(Debug, Clone)]
pub struct YandexSearchConfig {
    pub folder_id: String,
    pub timezone: Tz,
    pub enforce_night_window: bool,
    pub poll_interval: Duration,
    pub max_wait: Duration,
    pub timeout: Duration,
    pub create_limits: RateLimitConfig,
    pub status_limits: RateLimitConfig,
    pub search_url: String,
    pub operations_url: String,
}

impl Default for YandexSearchConfig {
    fn default() -> Self {
        Self {
            folder_id: String::new(),
            timezone: chrono_tz::Europe::Moscow,
            enforce_night_window: true,
            poll_interval: Duration::from_secs(60),
            max_wait: Duration::from_secs(180 * 60),
            timeout: Duration::from_secs(10),
            create_limits: RateLimitConfig::default(),
            status_limits: RateLimitConfig::default(),
            search_url: SEARCH_ASYNC_URL.to_string(),
            operations_url: OPERATIONS_URL.to_string(),
        }
    }
}

pub struct YandexDeferredClient {
    http: reqwest::Client,
    token_provider: Arc<dyn TokenProvider>,
    config: YandexSearchConfig,
    create_limits: SlidingWindowLimiter,
    status_limits: SlidingWindowLimiter,
}

impl YandexDeferredClient {
    pub fn new(config: YandexSearchConfig, token_provider: Arc<dyn TokenProvider>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("reqwest client");
        Self {
            http,
            token_provider,
            create_limits: SlidingWindowLimiter::new(config.create_limits),
            status_limits: SlidingWindowLimiter::new(config.status_limits),
            config,
        }
    }

    /// The quiet-window rule: deferred operations may only be created
    /// between 00:00 and 07:59 in the configured timezone.
    pub fn ensure_night_window(&self, now: DateTime<Utc>) -> Result<(), SearchError> {
        if !self.config.enforce_night_window {
            return Ok(());
        }
        let local = now.with_timezone(&self.config.timezone);
        if local.hour() < 8 {
            Ok(())
        } else {
            Err(SearchError::NightWindowViolation)
        }
    }

    async fn bearer(&self) -> Result<String, SearchError> {
        self.token_provider
            .get_token()
            .await
            .map_err(|err| SearchError::Token(format!("{err:#}")))
    }

    /// Submit a deferred search. Returns the operation envelope with
    /// its id; the actual results arrive later via [`get_operation`].
    ///
    /// [`get_operation`]: Self::get_operation
    pub async fn create_deferred_search(
        &self,
        params: &DeferredQueryParams,
    ) -> Result<OperationResponse, SearchError> {
        self.ensure_night_window(Utc::now())?;
        self.create_limits.admit().await;

        let token = self.bearer().await?;
        let request = params.to_request(&self.config.folder_id);
        tracing::debug!("creating deferred search for {:?}", params.query_text);

        let response = self
            .http
            .post(&self.config.search_url)
            .bearer_auth(token)
            .json(&request)
            .send()
            .await?;

        Self::decode_response(response).await
    }

    /// Fetch the current state of an operation.
    pub async fn get_operation(&self, operation_id: &str) -> Result<OperationResponse, SearchError> {
        self.status_limits.admit().await;

        let token = self.bearer().await?;
        let url = format!("{}/{operation_id}", self.config.operations_url);
        let response = self.http.get(&url).bearer_auth(token).send().await?;

        Self::decode_response(response).await
    }

    /// Poll the operation until it reports `done` or the deadline
    /// passes.
    pub async fn wait_until_ready(
        &self,
        operation_id: &str,
        poll_interval: Option<Duration>,
        max_wait: Option<Duration>,
    ) -> Result<OperationResponse, SearchError> {
        let interval = poll_interval.unwrap_or(self.config.poll_interval);
        let deadline = tokio::time::Instant::now() + max_wait.unwrap_or(self.config.max_wait);

        loop {
            let operation = self.get_operation(operation_id).await?;
            if operation.done {
                return Ok(operation);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SearchError::OperationTimeout(operation_id.to_string()));
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn decode_response(response: reqwest::Response) -> Result<OperationResponse, SearchError> {
        let status = response.status();
        if status.as_u16() >= 400 {
            let body = response.text().await.unwrap_or_default();
            tracing::error!("search API error: {status} {body}");
            return Err(SearchError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    fn client(config: YandexSearchConfig) -> YandexDeferredClient {
        YandexDeferredClient::new(config, Arc::new(StaticTokenProvider::new("token")))
    }

    fn msk(hour: u32) -> DateTime<Utc> {
        // Europe/Moscow is UTC+3 year round
        chrono_tz::Europe::Moscow
            .with_ymd_and_hms(2024, 1, 1, hour, 0, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[tokio::test]
    async fn night_window_accepts_early_hours() {
        let client = client(YandexSearchConfig {
            folder_id: "folder".to_string(),
            ..Default::default()
        });
        assert!(client.ensure_night_window(msk(0)).is_ok());
        assert!(client.ensure_night_window(msk(7)).is_ok());
    }

    #[tokio::test]
    async fn night_window_rejects_daytime() {
        let client = client(YandexSearchConfig {
            folder_id: "folder".to_string(),
            ..Default::default()
        });
        assert!(matches!(
            client.ensure_night_window(msk(8)),
            Err(SearchError::NightWindowViolation)
        ));
        assert!(matches!(
            client.ensure_night_window(msk(10)),
            Err(SearchError::NightWindowViolation)
        ));
    }

    #[tokio::test]
    async fn night_window_disabled_always_passes() {
        let client = client(YandexSearchConfig {
            folder_id: "folder".to_string(),
            enforce_night_window: false,
            ..Default::default()
        });
        assert!(client.ensure_night_window(msk(12)).is_ok());
    }

    #[tokio::test]
    async fn create_posts_payload_and_parses_operation() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/searchAsync")
            .match_header("authorization", "Bearer token")
            .with_status(200)
            .with_body(r#"{"id": "op-123", "done": false}"#)
            .create_async()
            .await;

        let client = client(YandexSearchConfig {
            folder_id: "folder".to_string(),
            enforce_night_window: false,
            search_url: format!("{}/searchAsync", server.url()),
            ..Default::default()
        });

        let params = DeferredQueryParams::new("site:example.com маркетинг");
        let operation = client.create_deferred_search(&params).await.unwrap();

        assert_eq!(operation.id, "op-123");
        assert!(!operation.done);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn create_surfaces_api_errors() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/searchAsync")
            .with_status(403)
            .with_body("denied")
            .create_async()
            .await;

        let client = client(YandexSearchConfig {
            folder_id: "folder".to_string(),
            enforce_night_window: false,
            search_url: format!("{}/searchAsync", server.url()),
            ..Default::default()
        });

        let err = client
            .create_deferred_search(&DeferredQueryParams::new("b2b leads"))
            .await
            .unwrap_err();
        assert!(matches!(err, SearchError::Api { status: 403, .. }));
    }

    #[tokio::test]
    async fn wait_until_ready_returns_completed_operation() {
        let mut server = mockito::Server::new_async().await;
        let encoded = BASE64.encode(b"<doc><url>https://example.com</url></doc>");
        server
            .mock("GET", "/operations/op-456")
            .with_status(200)
            .with_body(r#"{"id": "op-456", "done": false}"#)
            .expect(1)
            .create_async()
            .await;
        server
            .mock("GET", "/operations/op-456")
            .with_status(200)
            .with_body(format!(
                r#"{{"id": "op-456", "done": true, "response": {{"rawData": "{encoded}"}}}}"#
            ))
            .create_async()
            .await;

        let client = client(YandexSearchConfig {
            folder_id: "folder".to_string(),
            operations_url: format!("{}/operations", server.url()),
            ..Default::default()
        });

        let operation = client
            .wait_until_ready(
                "op-456",
                Some(Duration::from_millis(10)),
                Some(Duration::from_secs(5)),
            )
            .await
            .unwrap();
        assert!(operation.done);
        assert_eq!(
            operation.decode_raw_data().unwrap(),
            b"<doc><url>https://example.com</url></doc>"
        );
    }

    #[tokio::test]
    async fn wait_until_ready_times_out() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/operations/op-789")
            .with_status(200)
            .with_body(r#"{"id": "op-789", "done": false}"#)
            .expect_at_least(1)
            .create_async()
            .await;

        let client = client(YandexSearchConfig {
            folder_id: "folder".to_string(),
            operations_url: format!("{}/operations", server.url()),
            ..Default::default()
        });

        let err = client
            .wait_until_ready(
                "op-789",
                Some(Duration::from_millis(5)),
                Some(Duration::from_millis(20)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SearchError::OperationTimeout(_)));
    }

    #[test]
    fn decode_raw_data_requires_payload() {
        let operation = OperationResponse {
            id: "op-1".to_string(),
            done: true,
            response: Some(OperationPayload::default()),
            error: None,
        };
        assert!(matches!(
            operation.decode_raw_data(),
            Err(SearchError::InvalidResponse(_))
        ));
    }

    #[test]
    fn request_serializes_explicit_enums() {
        let params = DeferredQueryParams::new("стоматология Москва");
        let request = params.to_request("folder-1");
        let value = serde_json::to_value(&request).unwrap();

        assert_eq!(value["query"]["search_type"], "SEARCH_TYPE_RU");
        assert_eq!(value["query"]["family_mode"], "FAMILY_MODE_MODERATE");
        assert_eq!(value["query"]["fix_typo_mode"], "FIX_TYPO_MODE_ON");
        assert_eq!(value["sort_spec"]["sort_mode"], "SORT_MODE_BY_RELEVANCE");
        assert_eq!(value["group_spec"]["docs_in_group"], 1);
        assert_eq!(value["response_format"], "FORMAT_XML");
        assert_eq!(value["folder_id"], "folder-1");
        assert!(value.get("user_agent").is_none());
    }
}
