//! Error model for the Dataverse request layer
//!
//! Every failure leaving this crate is a [`DataverseError`]. Provider error bodies are
//! parsed once, by [`ProviderError::parse`], into a single normalized shape.

use serde_json::Value;
use thiserror::Error;

/// Errors raised by the request layer and the operation handlers
#[derive(Error, Debug)]
pub enum DataverseError {
    /// Missing or invalid credentials / connection options. Never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Dataverse answered with an error (or the request never got an answer).
    #[error("{}", format_api_error(.message, *.status, .code.as_deref(), .url))]
    Api {
        status: Option<u16>,
        code: Option<String>,
        message: String,
        url: String,
    },

    /// A client-side lookup returned zero rows.
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Dataverse binary request failed: {message}. URL: {url}")]
    Binary { url: String, message: String },

    #[error(transparent)]
    Sql(#[from] SqlError),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("The operation \"{operation}\" is not supported for {resource}")]
    UnsupportedOperation { resource: String, operation: String },

    #[error("Parse error: {0}")]
    Parse(String),
}

/// Failures of the TDS bridge
#[derive(Error, Debug)]
pub enum SqlError {
    #[error(
        "Failed to connect to Dataverse TDS endpoint at {server}:{port}. Please verify:\n\
         1. TDS endpoint is enabled in your Dataverse environment\n\
         2. Your IP address is allowed in Dataverse firewall rules\n\
         3. The OAuth2 token has the correct scope ({environment_url}/.default)\n\
         Error: {message}"
    )]
    Connection {
        server: String,
        port: u16,
        environment_url: String,
        message: String,
    },

    #[error("SQL query execution failed: {0}")]
    Execution(String),

    #[error("Invalid environment URL format. Expected format: https://org.crm.dynamics.com (got '{0}')")]
    InvalidEnvironment(String),
}

impl DataverseError {
    /// HTTP status of a provider error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            DataverseError::Api { status, .. } => *status,
            _ => None,
        }
    }

    /// Whether this looks like an authentication/authorization failure
    pub fn is_auth_failure(&self) -> bool {
        match self {
            DataverseError::Api { status, message, .. } => {
                matches!(status, Some(401) | Some(403)) || message.contains("Unauthorized")
            }
            DataverseError::Configuration(_) => true,
            _ => false,
        }
    }

    pub(crate) fn missing_parameter(name: &str) -> Self {
        DataverseError::InvalidParameter(format!("missing required parameter '{}'", name))
    }
}

fn format_api_error(message: &str, status: Option<u16>, code: Option<&str>, url: &str) -> String {
    let mut out = format!("Dataverse API request failed: {}", message);
    if let Some(status) = status {
        out.push_str(&format!(" (HTTP {})", status));
    }
    if let Some(code) = code {
        out.push_str(&format!(" [Error Code: {}]", code));
    }
    out.push_str(&format!("\nURL: {}", url));
    out
}

/// The `{error:{code,message}}` object Dataverse returns on failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    pub code: Option<String>,
    pub message: Option<String>,
}

/// Places a provider error object has been observed, outermost first.
const PROVIDER_ERROR_PATHS: &[&str] = &[
    "/error",
    "/cause/response/body/error",
    "/response/data/error",
    "/cause/error",
    "/body/error",
];

impl ProviderError {
    /// Find the provider error object inside a response body.
    ///
    /// Tries each known nesting shape in order and stops at the first one that holds an
    /// object with a `code` or `message`.
    pub fn parse(body: &Value) -> Option<Self> {
        PROVIDER_ERROR_PATHS.iter().find_map(|path| {
            let error = body.pointer(path)?.as_object()?;
            let code = error.get("code").and_then(value_as_text);
            let message = error.get("message").and_then(value_as_text);
            if code.is_none() && message.is_none() {
                return None;
            }
            Some(Self { code, message })
        })
    }

    /// Parse a raw body; non-JSON bodies are not provider errors
    pub fn parse_text(body: &str) -> Option<Self> {
        serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|value| Self::parse(&value))
    }

    /// Build the normalized error for a failed request
    pub fn into_error(self, status: Option<u16>, fallback: &str, url: &str) -> DataverseError {
        DataverseError::Api {
            status,
            code: self.code.filter(|c| !c.is_empty()),
            message: self
                .message
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| fallback.to_string()),
            url: url.to_string(),
        }
    }
}

fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Normalize a non-success HTTP response body into a [`DataverseError`]
pub fn normalize_error(status: u16, body: &str, url: &str) -> DataverseError {
    let fallback = if body.trim().is_empty() {
        "Unknown error".to_string()
    } else {
        body.trim().to_string()
    };

    match ProviderError::parse_text(body) {
        Some(provider) => provider.into_error(Some(status), &fallback, url),
        None => DataverseError::Api {
            status: Some(status),
            code: None,
            message: fallback,
            url: url.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_top_level_error() {
        let body = json!({"error": {"code": "0x80040217", "message": "X"}});
        let parsed = ProviderError::parse(&body).unwrap();
        assert_eq!(parsed.code.as_deref(), Some("0x80040217"));
        assert_eq!(parsed.message.as_deref(), Some("X"));
    }

    #[test]
    fn test_parse_cause_response_body_shape() {
        let body = json!({"cause": {"response": {"body": {"error": {"code": "c1", "message": "m1"}}}}});
        let parsed = ProviderError::parse(&body).unwrap();
        assert_eq!(parsed.code.as_deref(), Some("c1"));
        assert_eq!(parsed.message.as_deref(), Some("m1"));
    }

    #[test]
    fn test_parse_response_data_shape() {
        let body = json!({"response": {"data": {"error": {"message": "only message"}}}});
        let parsed = ProviderError::parse(&body).unwrap();
        assert_eq!(parsed.code, None);
        assert_eq!(parsed.message.as_deref(), Some("only message"));
    }

    #[test]
    fn test_parse_cause_error_shape() {
        let body = json!({"cause": {"error": {"code": "0x1"}}});
        let parsed = ProviderError::parse(&body).unwrap();
        assert_eq!(parsed.code.as_deref(), Some("0x1"));
    }

    #[test]
    fn test_parse_body_error_shape() {
        let body = json!({"body": {"error": {"code": 42, "message": "numeric code"}}});
        let parsed = ProviderError::parse(&body).unwrap();
        assert_eq!(parsed.code.as_deref(), Some("42"));
    }

    #[test]
    fn test_first_matching_shape_wins() {
        let body = json!({
            "error": {"code": "outer", "message": "outer message"},
            "cause": {"error": {"code": "inner", "message": "inner message"}}
        });
        let parsed = ProviderError::parse(&body).unwrap();
        assert_eq!(parsed.code.as_deref(), Some("outer"));
    }

    #[test]
    fn test_empty_error_object_is_skipped() {
        let body = json!({"error": {}, "cause": {"error": {"message": "deeper"}}});
        let parsed = ProviderError::parse(&body).unwrap();
        assert_eq!(parsed.message.as_deref(), Some("deeper"));
    }

    #[test]
    fn test_no_provider_error() {
        assert!(ProviderError::parse(&json!({"value": []})).is_none());
        assert!(ProviderError::parse_text("<html>bad gateway</html>").is_none());
    }

    #[test]
    fn test_normalized_message_contains_status_code_and_message() {
        let err = normalize_error(
            404,
            r#"{"error":{"code":"0x80040217","message":"X"}}"#,
            "https://org.crm.dynamics.com/api/data/v9.2/accounts(1)",
        );
        let text = err.to_string();
        assert!(text.contains("404"));
        assert!(text.contains("0x80040217"));
        assert!(text.contains("X"));
        assert!(text.contains("URL: https://org.crm.dynamics.com/api/data/v9.2/accounts(1)"));
        assert_eq!(err.status(), Some(404));
    }

    #[test]
    fn test_normalize_plain_body() {
        let err = normalize_error(502, "upstream down", "https://x/api");
        assert_eq!(
            err.to_string(),
            "Dataverse API request failed: upstream down (HTTP 502)\nURL: https://x/api"
        );
    }

    #[test]
    fn test_auth_failure_detection() {
        assert!(normalize_error(401, "", "u").is_auth_failure());
        assert!(!normalize_error(404, "", "u").is_auth_failure());
    }
}
