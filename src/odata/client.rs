//! Dataverse Web API client
//!
//! One client per input item: it owns the resolved [`Environment`] and routes every
//! request through the host's transport. Provider failures come back normalized as
//! [`DataverseError`].

use crate::auth::{resolve_environment, Environment, EnvironmentAuth};
use crate::host::{Host, RetryPolicy};
use crate::odata::error::{normalize_error, DataverseError};
use reqwest::header::{ACCEPT, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::time::sleep;

/// Web API version segment
pub const API_PATH: &str = "/api/data/v9.2";

/// Paths served outside the versioned Web API root
const UNVERSIONED_PREFIXES: &[&str] = &["/api/", "/Image/"];

/// Query options for collection requests
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub select: Option<Vec<String>>,
    pub filter: Option<String>,
    pub top: Option<usize>,
    pub orderby: Option<String>,
    pub expand: Option<String>,
    /// Non-`$` parameters such as `fetchXml`
    pub extra: Vec<(String, String)>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        self.select = if fields.is_empty() { None } else { Some(fields) };
        self
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn top(mut self, top: usize) -> Self {
        self.top = Some(top);
        self
    }

    pub fn orderby(mut self, orderby: impl Into<String>) -> Self {
        self.orderby = Some(orderby.into());
        self
    }

    pub fn expand(mut self, expand: impl Into<String>) -> Self {
        self.expand = Some(expand.into());
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.push((name.into(), value.into()));
        self
    }

    /// Key/value pairs in a stable order; the client URL-encodes them
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut params = Vec::new();

        if let Some(ref select) = self.select {
            params.push(("$select".to_string(), select.join(",")));
        }

        if let Some(ref filter) = self.filter {
            params.push(("$filter".to_string(), filter.clone()));
        }

        if let Some(ref orderby) = self.orderby {
            params.push(("$orderby".to_string(), orderby.clone()));
        }

        if let Some(top) = self.top {
            params.push(("$top".to_string(), top.to_string()));
        }

        if let Some(ref expand) = self.expand {
            params.push(("$expand".to_string(), expand.clone()));
        }

        params.extend(self.extra.iter().cloned());
        params
    }
}

/// Collection response envelope
#[derive(Debug, Deserialize)]
pub struct ODataResponse {
    #[serde(rename = "@odata.context")]
    pub context: Option<String>,

    #[serde(rename = "@odata.nextLink")]
    pub next_link: Option<String>,

    #[serde(rename = "@odata.count")]
    pub count: Option<i64>,

    #[serde(default)]
    pub value: Vec<Value>,
}

/// Compose the absolute URL for a request path.
///
/// The result always starts with `base_url`. `/api/...` and `/Image/...` paths are
/// appended to the environment root as-is; everything else lands under [`API_PATH`].
pub fn resolve_url(base_url: &str, path: &str) -> String {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };

    if UNVERSIONED_PREFIXES.iter().any(|p| path.starts_with(p)) {
        format!("{}{}", base_url, path)
    } else {
        format!("{}{}{}", base_url, API_PATH, path)
    }
}

/// Client for one logical call against one environment
pub struct DataverseClient<'a> {
    host: &'a dyn Host,
    environment: Environment,
    retry: RetryPolicy,
}

impl<'a> DataverseClient<'a> {
    pub fn new(host: &'a dyn Host, environment: Environment) -> Self {
        Self {
            host,
            environment,
            retry: host.retry_policy(),
        }
    }

    /// Resolve the environment for `item` and build a client for it
    pub async fn connect(host: &'a dyn Host, item: usize) -> Result<Self, DataverseError> {
        let environment = resolve_environment(host, item).await?;
        Ok(Self::new(host, environment))
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn base_url(&self) -> &str {
        &self.environment.base_url
    }

    pub fn host(&self) -> &'a dyn Host {
        self.host
    }

    fn url(&self, path: &str, query: &[(String, String)]) -> Result<Url, DataverseError> {
        let raw = resolve_url(&self.environment.base_url, path);
        let mut url = Url::parse(&raw)
            .map_err(|e| DataverseError::Configuration(format!("Invalid request URL '{}': {}", raw, e)))?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    async fn authorize(&self, request: RequestBuilder) -> Result<RequestBuilder, DataverseError> {
        match self.environment.auth {
            EnvironmentAuth::Bearer(ref token) => Ok(request.bearer_auth(token)),
            EnvironmentAuth::Host => self.host.authorize(request).await,
        }
    }

    /// Issue a JSON request and return the parsed body (`null` for empty bodies)
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        query: &[(String, String)],
    ) -> Result<Value, DataverseError> {
        let url = self.url(path, query)?;
        let mut attempt = 0;
        let mut delay = self.retry.retry_delay_ms;

        loop {
            attempt += 1;
            tracing::debug!("{} {}", method, url);

            let mut request = self
                .host
                .http_client()
                .request(method.clone(), url.clone())
                .header(ACCEPT, "application/json")
                .header(CONTENT_TYPE, "application/json")
                .header("OData-MaxVersion", "4.0")
                .header("OData-Version", "4.0");

            if method == Method::POST || method == Method::PATCH {
                request = request.header("Prefer", "return=representation");
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = self
                .authorize(request)
                .await?
                .send()
                .await
                .map_err(|e| transport_error(&url, e))?;

            let status = response.status();
            if status.is_success() {
                return read_json(response, &url).await;
            }

            let can_retry = attempt <= self.retry.max_retries;
            match status {
                StatusCode::TOO_MANY_REQUESTS if can_retry => {
                    let wait = retry_after(&response).unwrap_or(Duration::from_millis(delay));
                    tracing::warn!(
                        "Rate limited (429), attempt {}/{}, retrying after {:?}",
                        attempt,
                        self.retry.max_retries,
                        wait
                    );
                    sleep(wait).await;
                    delay = delay.saturating_mul(2);
                }
                status if status.is_server_error() && method == Method::GET && can_retry => {
                    tracing::warn!(
                        "Server error ({}), attempt {}/{}, retrying...",
                        status,
                        attempt,
                        self.retry.max_retries
                    );
                    sleep(Duration::from_millis(delay)).await;
                    delay = delay.saturating_mul(2);
                }
                status => {
                    let body = response.text().await.unwrap_or_default();
                    return Err(normalize_error(status.as_u16(), &body, url.as_str()));
                }
            }
        }
    }

    pub async fn get(&self, path: &str, query: &QueryOptions) -> Result<Value, DataverseError> {
        self.request(Method::GET, path, None, &query.to_pairs()).await
    }

    /// GET a collection and return its `value` rows
    pub async fn get_collection(
        &self,
        path: &str,
        query: &QueryOptions,
    ) -> Result<Vec<Value>, DataverseError> {
        let body = self.get(path, query).await?;
        let response: ODataResponse = serde_json::from_value(body).map_err(|e| {
            DataverseError::Parse(format!("Failed to parse OData response: {}", e))
        })?;
        tracing::debug!(
            "Fetched {} records, next_link: {:?}",
            response.value.len(),
            response.next_link.is_some()
        );
        Ok(response.value)
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<Value, DataverseError> {
        self.request(Method::POST, path, Some(body), &[]).await
    }

    pub async fn patch(&self, path: &str, body: &Value) -> Result<Value, DataverseError> {
        self.request(Method::PATCH, path, Some(body), &[]).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value, DataverseError> {
        self.request(Method::DELETE, path, None, &[]).await
    }

    /// Fetch a binary payload as raw bytes. Never retried.
    pub async fn download_binary(&self, method: Method, endpoint: &str) -> Result<Vec<u8>, DataverseError> {
        let url = self.url(endpoint, &[])?;
        tracing::debug!("Downloading binary {} {}", method, url);

        let request = self
            .host
            .http_client()
            .request(method, url.clone())
            .header(ACCEPT, "*/*");

        let response = self
            .authorize(request)
            .await?
            .send()
            .await
            .map_err(|e| DataverseError::Binary {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DataverseError::Binary {
                url: url.to_string(),
                message: format!("HTTP {}", status.as_u16()),
            });
        }

        let bytes = response.bytes().await.map_err(|e| DataverseError::Binary {
            url: url.to_string(),
            message: format!("Failed to read body: {}", e),
        })?;

        Ok(bytes.to_vec())
    }
}

fn transport_error(url: &Url, error: reqwest::Error) -> DataverseError {
    DataverseError::Api {
        status: error.status().map(|s| s.as_u16()),
        code: None,
        message: error.to_string(),
        url: url.to_string(),
    }
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

async fn read_json(response: Response, url: &Url) -> Result<Value, DataverseError> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| transport_error(url, e))?;

    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }

    serde_json::from_slice(&bytes)
        .map_err(|e| DataverseError::Parse(format!("Failed to parse response from {}: {}", url, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_options_empty() {
        assert!(QueryOptions::new().to_pairs().is_empty());
    }

    #[test]
    fn test_query_options_full() {
        let pairs = QueryOptions::new()
            .select(["name", "accountid"])
            .filter("name eq 'Contoso'")
            .orderby("name asc")
            .top(10)
            .expand("Keys($select=LogicalName)")
            .to_pairs();

        assert_eq!(
            pairs,
            vec![
                ("$select".to_string(), "name,accountid".to_string()),
                ("$filter".to_string(), "name eq 'Contoso'".to_string()),
                ("$orderby".to_string(), "name asc".to_string()),
                ("$top".to_string(), "10".to_string()),
                ("$expand".to_string(), "Keys($select=LogicalName)".to_string()),
            ]
        );
    }

    #[test]
    fn test_empty_select_is_omitted() {
        let pairs = QueryOptions::new().select(Vec::<String>::new()).to_pairs();
        assert!(pairs.is_empty());
    }

    #[test]
    fn test_extra_params_follow_odata_options() {
        let pairs = QueryOptions::new().top(5).param("fetchXml", "<fetch/>").to_pairs();
        assert_eq!(pairs[1], ("fetchXml".to_string(), "<fetch/>".to_string()));
    }

    #[test]
    fn test_resolve_url_versioned() {
        assert_eq!(
            resolve_url("https://org.crm.dynamics.com", "/accounts(1)"),
            "https://org.crm.dynamics.com/api/data/v9.2/accounts(1)"
        );
        assert_eq!(
            resolve_url("https://org.crm.dynamics.com", "EntityDefinitions"),
            "https://org.crm.dynamics.com/api/data/v9.2/EntityDefinitions"
        );
    }

    #[test]
    fn test_resolve_url_unversioned_prefixes() {
        assert_eq!(
            resolve_url(
                "https://org.crm.dynamics.com",
                "/Image/download.aspx?Entity=account&Attribute=entityimage&Id=1&Full=true"
            ),
            "https://org.crm.dynamics.com/Image/download.aspx?Entity=account&Attribute=entityimage&Id=1&Full=true"
        );
        assert_eq!(
            resolve_url("https://org.crm.dynamics.com", "/api/data/v9.1/accounts"),
            "https://org.crm.dynamics.com/api/data/v9.1/accounts"
        );
    }

    #[test]
    fn test_resolve_url_stays_on_environment() {
        let url = resolve_url("https://org.crm.dynamics.com", "https://other.example.com/x");
        assert!(url.starts_with("https://org.crm.dynamics.com/"));
    }
}
