use std::sync::Arc;
use std::time::Duration;

use futures_util::{Stream, stream};
use reqwest::header::ACCEPT;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::backoff::Backoff;
use crate::rate_limit::RateLimiter;
use crate::window::RequestWindow;

const PRODUCTS_PATH: &str = "/products";
const BARCODE_PATH: &str = "/products/barcode";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    IdAsc,
    IdDesc,
}

impl SortOrder {
    pub fn as_param(&self) -> &'static str {
        match self {
            SortOrder::IdAsc => "id ASC",
            SortOrder::IdDesc => "id DESC",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
            max_attempts: 3,
            backoff: Backoff::default(),
        }
    }
}

/// One page of a paginated listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub number: u32,
    pub items: Vec<Value>,
}

#[derive(Clone)]
pub struct CatalogClient {
    http: Client,
    base_url: Url,
    token: String,
    limiter: Arc<RateLimiter>,
    window: Arc<RequestWindow>,
    max_attempts: u32,
    backoff: Backoff,
}

impl CatalogClient {
    pub fn new(
        base_url: &str,
        token: impl Into<String>,
        limiter: Arc<RateLimiter>,
    ) -> Result<Self, CatalogError> {
        Self::with_config(base_url, token, limiter, ClientConfig::default())
    }

    pub fn with_config(
        base_url: &str,
        token: impl Into<String>,
        limiter: Arc<RateLimiter>,
        config: ClientConfig,
    ) -> Result<Self, CatalogError> {
        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: Url::parse(base_url)?,
            token: token.into(),
            limiter,
            window: Arc::new(RequestWindow::default()),
            max_attempts: config.max_attempts.max(1),
            backoff: config.backoff,
        })
    }

    /// Requests that reached the upstream in the trailing minute.
    pub fn current_rpm(&self) -> usize {
        self.window.count()
    }

    pub async fn get(&self, path: &str, params: &[(&str, String)]) -> Result<Value, CatalogError> {
        self.get_weighted(path, params, 1).await
    }

    /// Issues a GET that costs `weight` tokens per attempt.
    ///
    /// Transport failures, 429 and 5xx are retried with backoff until
    /// `max_attempts` is reached; any other 4xx fails immediately.
    pub async fn get_weighted(
        &self,
        path: &str,
        params: &[(&str, String)],
        weight: u32,
    ) -> Result<Value, CatalogError> {
        let url = self.endpoint(path, params)?;
        let mut attempt = 1u32;
        loop {
            self.limiter.acquire(weight).await;
            match self.send(url.clone()).await {
                Ok(payload) => return Ok(payload),
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.backoff.delay(attempt);
                    warn!(%url, attempt, ?delay, error = %err, "retrying upstream request");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Lazily walks `path` page by page starting at `start_page`.
    ///
    /// Ends on the first empty batch, or once `meta.total_pages` says the
    /// current page is the last one.
    pub fn paginate<'a>(
        &'a self,
        path: &'a str,
        params: Vec<(String, String)>,
        start_page: u32,
    ) -> impl Stream<Item = Result<Page, CatalogError>> + 'a {
        stream::try_unfold(Some(start_page.max(1)), move |next| {
            let params = params.clone();
            async move {
                let Some(number) = next else {
                    return Ok(None);
                };
                let mut query: Vec<(&str, String)> = params
                    .iter()
                    .map(|(key, value)| (key.as_str(), value.clone()))
                    .collect();
                query.push(("page", number.to_string()));
                let payload = self.get(path, &query).await?;
                let items = extract_batch(&payload);
                if items.is_empty() {
                    return Ok(None);
                }
                debug!(path, page = number, items = items.len(), "fetched page");
                let is_last = total_pages(&payload).is_some_and(|total| number >= total);
                let following = if is_last { None } else { Some(number + 1) };
                Ok(Some((Page { number, items }, following)))
            }
        })
    }

    pub fn products_pages(
        &self,
        sort: SortOrder,
        start_page: u32,
    ) -> impl Stream<Item = Result<Page, CatalogError>> + '_ {
        self.paginate(
            PRODUCTS_PATH,
            vec![("sort".to_string(), sort.as_param().to_string())],
            start_page,
        )
    }

    pub async fn fetch_products_page(
        &self,
        page: u32,
        sort: SortOrder,
    ) -> Result<Vec<Value>, CatalogError> {
        let payload = self
            .get(
                PRODUCTS_PATH,
                &[
                    ("page", page.to_string()),
                    ("sort", sort.as_param().to_string()),
                ],
            )
            .await?;
        Ok(extract_batch(&payload))
    }

    pub async fn fetch_by_barcode(&self, barcode: &str) -> Result<Option<Value>, CatalogError> {
        let payload = match self
            .get(BARCODE_PATH, &[("barcode", barcode.to_string())])
            .await
        {
            Ok(payload) => payload,
            Err(CatalogError::Api { status, .. }) if status == StatusCode::NOT_FOUND => {
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        let product = match payload {
            Value::Object(mut object) if object.contains_key("product") => {
                object.remove("product").unwrap_or(Value::Null)
            }
            other => other,
        };
        if product.get("id").is_some_and(|id| !id.is_null()) {
            Ok(Some(product))
        } else {
            Ok(None)
        }
    }

    pub async fn fetch_by_sku(&self, sku: &str) -> Result<Vec<Value>, CatalogError> {
        let payload = self
            .get(
                PRODUCTS_PATH,
                &[("sku", sku.to_string()), ("page", "1".to_string())],
            )
            .await?;
        Ok(extract_batch(&payload))
    }

    pub async fn fetch_by_query(&self, query: &str) -> Result<Vec<Value>, CatalogError> {
        let payload = self
            .get(
                PRODUCTS_PATH,
                &[("query", query.to_string()), ("page", "1".to_string())],
            )
            .await?;
        Ok(extract_batch(&payload))
    }

    async fn send(&self, url: Url) -> Result<Value, CatalogError> {
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .header(ACCEPT, "application/json")
            .send()
            .await?;
        self.window.record();
        Self::handle_response(response).await
    }

    fn endpoint(&self, path: &str, params: &[(&str, String)]) -> Result<Url, CatalogError> {
        let base = self.base_url.as_str().trim_end_matches('/');
        let mut url = Url::parse(&format!("{base}{path}"))?;
        if !params.is_empty() {
            let mut query = url.query_pairs_mut();
            for (key, value) in params {
                query.append_pair(key, value);
            }
        }
        Ok(url)
    }

    async fn handle_response(response: reqwest::Response) -> Result<Value, CatalogError> {
        if response.status().is_success() {
            Ok(response.json::<Value>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(CatalogError::Api { status, body })
        }
    }
}

impl CatalogError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            CatalogError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            CatalogError::Request(err) => {
                err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
            }
            CatalogError::Api { .. } => matches!(
                self.classification(),
                Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
            ),
            CatalogError::Url(_) => false,
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error() {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

/// Item batch of a listing response: `products`, else `data`, else the first
/// array-valued top-level field in document order.
pub fn extract_batch(payload: &Value) -> Vec<Value> {
    let Some(object) = payload.as_object() else {
        return payload.as_array().cloned().unwrap_or_default();
    };
    for key in ["products", "data"] {
        if let Some(Value::Array(items)) = object.get(key) {
            return items.clone();
        }
    }
    object
        .values()
        .find_map(|value| value.as_array().cloned())
        .unwrap_or_default()
}

fn total_pages(payload: &Value) -> Option<u32> {
    payload
        .get("meta")?
        .get("total_pages")?
        .as_u64()
        .and_then(|total| u32::try_from(total).ok())
        .filter(|total| *total > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_statuses() {
        let err = |code: u16| CatalogError::Api {
            status: StatusCode::from_u16(code).unwrap(),
            body: String::new(),
        };
        assert_eq!(err(401).classification(), Some(ApiErrorClass::Auth));
        assert_eq!(err(429).classification(), Some(ApiErrorClass::RateLimit));
        assert_eq!(err(503).classification(), Some(ApiErrorClass::Transient));
        assert_eq!(err(404).classification(), Some(ApiErrorClass::Permanent));
        assert!(err(429).is_retryable());
        assert!(err(500).is_retryable());
        assert!(!err(400).is_retryable());
        assert!(!err(409).is_retryable());
    }

    #[test]
    fn extract_batch_prefers_products_then_data() {
        let payload = json!({"data": [{"id": 2}], "products": [{"id": 1}]});
        assert_eq!(extract_batch(&payload), vec![json!({"id": 1})]);

        let payload = json!({"meta": {"total_pages": 1}, "data": [{"id": 3}]});
        assert_eq!(extract_batch(&payload), vec![json!({"id": 3})]);
    }

    #[test]
    fn extract_batch_falls_back_to_any_array() {
        let payload = json!({"meta": {"page": 1}, "customers": [{"id": 9}]});
        assert_eq!(extract_batch(&payload), vec![json!({"id": 9})]);
        assert!(extract_batch(&json!({"meta": {}})).is_empty());
        assert!(extract_batch(&json!("nope")).is_empty());
    }

    #[test]
    fn extract_batch_fallback_follows_document_order() {
        let payload: Value =
            serde_json::from_str(r#"{"serials": [{"id": 5}], "assets": [{"id": 6}]}"#).unwrap();
        assert_eq!(extract_batch(&payload), vec![json!({"id": 5})]);
    }

    #[test]
    fn total_pages_ignores_missing_or_zero() {
        assert_eq!(total_pages(&json!({"meta": {"total_pages": 4}})), Some(4));
        assert_eq!(total_pages(&json!({"meta": {"total_pages": 0}})), None);
        assert_eq!(total_pages(&json!({"products": []})), None);
    }

    #[test]
    fn endpoint_keeps_base_path_prefix() {
        let limiter = Arc::new(RateLimiter::per_minute(60));
        let client =
            CatalogClient::new("https://shop.example.com/api/v1", "key", limiter).unwrap();
        let url = client
            .endpoint("/products", &[("page", "2".to_string())])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://shop.example.com/api/v1/products?page=2"
        );
    }
}
