//! Host interface
//!
//! The connector never reads global state: everything an operation needs (per-item
//! parameters, stored credentials, the credential-injecting transport) comes from a
//! [`Host`]. The MCP server in [`crate::mcp`] is one host; tests use a fake one.

use crate::auth::DataverseCredentials;
use crate::odata::DataverseError;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Retry behaviour for throttled requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

/// Everything the connector needs from the surrounding automation host
#[async_trait]
pub trait Host: Send + Sync {
    /// Parameter value for the given input item, `None` when unset
    fn parameter(&self, name: &str, item: usize) -> Option<Value>;

    /// Stored OAuth2 credentials, `None` when the host has none configured
    async fn credentials(&self) -> Option<DataverseCredentials>;

    /// Attach the host's credentials to an outgoing request
    async fn authorize(&self, request: RequestBuilder) -> Result<RequestBuilder, DataverseError> {
        let credentials = self.credentials().await.ok_or_else(|| {
            DataverseError::Configuration(
                "OAuth2 credentials are required. Please configure Dataverse OAuth2 API credentials."
                    .to_string(),
            )
        })?;
        match credentials.access_token() {
            Some(token) => Ok(request.bearer_auth(token)),
            None => Err(DataverseError::Configuration(
                "No access token available. Please authenticate with OAuth2.".to_string(),
            )),
        }
    }

    fn http_client(&self) -> &Client;

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }

    /// Record per-item errors instead of aborting the batch
    fn continue_on_fail(&self) -> bool {
        false
    }
}

/// Typed parameter access for one input item
#[derive(Clone, Copy)]
pub struct Params<'a> {
    host: &'a dyn Host,
    item: usize,
}

impl<'a> Params<'a> {
    pub fn new(host: &'a dyn Host, item: usize) -> Self {
        Self { host, item }
    }

    pub fn host(&self) -> &'a dyn Host {
        self.host
    }

    pub fn item(&self) -> usize {
        self.item
    }

    /// Raw value; JSON `null` counts as unset
    pub fn raw(&self, name: &str) -> Option<Value> {
        self.host
            .parameter(name, self.item)
            .filter(|value| !value.is_null())
    }

    /// Required, non-empty string parameter
    pub fn string(&self, name: &str) -> Result<String, DataverseError> {
        self.optional_string(name)
            .ok_or_else(|| DataverseError::missing_parameter(name))
    }

    /// String parameter; empty strings count as unset
    pub fn optional_string(&self, name: &str) -> Option<String> {
        match self.raw(name)? {
            Value::String(s) if s.trim().is_empty() => None,
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn i64(&self, name: &str) -> Result<i64, DataverseError> {
        self.optional_i64(name)?
            .ok_or_else(|| DataverseError::missing_parameter(name))
    }

    pub fn i64_or(&self, name: &str, default: i64) -> Result<i64, DataverseError> {
        Ok(self.optional_i64(name)?.unwrap_or(default))
    }

    /// Integer parameter; numeric strings are accepted
    pub fn optional_i64(&self, name: &str) -> Result<Option<i64>, DataverseError> {
        match self.raw(name) {
            None => Ok(None),
            Some(Value::Number(n)) => n.as_i64().map(Some).ok_or_else(|| {
                DataverseError::InvalidParameter(format!("'{}' must be an integer", name))
            }),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(Value::String(s)) => s.trim().parse().map(Some).map_err(|_| {
                DataverseError::InvalidParameter(format!("'{}' must be an integer, got '{}'", name, s))
            }),
            Some(_) => Err(DataverseError::InvalidParameter(format!(
                "'{}' must be an integer",
                name
            ))),
        }
    }

    pub fn bool_or(&self, name: &str, default: bool) -> bool {
        match self.raw(name) {
            Some(Value::Bool(b)) => b,
            Some(Value::String(s)) => s == "true",
            _ => default,
        }
    }

    /// The `options` collection of this item
    pub fn options(&self) -> Map<String, Value> {
        match self.raw("options") {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    /// A fixed collection such as `[{name, value}]`.
    ///
    /// Accepts either the bare array or the object form `{"<inner_key>": [...]}`.
    pub fn collection<T: DeserializeOwned>(
        &self,
        name: &str,
        inner_key: &str,
    ) -> Result<Vec<T>, DataverseError> {
        let value = match self.raw(name) {
            None => return Ok(Vec::new()),
            Some(Value::Object(mut map)) => map.remove(inner_key).unwrap_or(Value::Array(Vec::new())),
            Some(other) => other,
        };
        serde_json::from_value(value).map_err(|e| {
            DataverseError::InvalidParameter(format!("'{}' is not a valid collection: {}", name, e))
        })
    }

    /// List parameter given either as an array or a comma-separated string
    pub fn string_list(&self, name: &str) -> Vec<String> {
        match self.raw(name) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            Some(Value::String(s)) => split_list(&s),
            _ => Vec::new(),
        }
    }

    /// The `table` resource locator, resolved to a plain table name
    pub fn table(&self) -> Result<String, DataverseError> {
        let value = self
            .raw("table")
            .ok_or_else(|| DataverseError::missing_parameter("table"))?;
        Ok(TableLocator::from_value(&value)?.into_table_name())
    }
}

/// Split a comma-separated list, dropping empty entries
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// How a table was picked in the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocatorMode {
    List,
    Name,
    Id,
}

/// The `table` parameter: an entity set name, a logical name, or a list selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLocator {
    pub mode: LocatorMode,
    pub value: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawLocator {
    Plain(String),
    Tagged { mode: LocatorMode, value: String },
}

impl TableLocator {
    pub fn from_value(value: &Value) -> Result<Self, DataverseError> {
        let raw: RawLocator = serde_json::from_value(value.clone()).map_err(|_| {
            DataverseError::InvalidParameter(
                "'table' must be a string or a {mode, value} object".to_string(),
            )
        })?;

        let locator = match raw {
            RawLocator::Plain(value) => TableLocator {
                mode: LocatorMode::Name,
                value,
            },
            RawLocator::Tagged { mode, value } => TableLocator { mode, value },
        };

        let value = locator.value.trim();
        if value.is_empty() {
            return Err(DataverseError::missing_parameter("table"));
        }
        if locator.mode != LocatorMode::List && !is_table_identifier(value) {
            return Err(DataverseError::InvalidParameter(format!(
                "Table name must be lowercase and contain only letters, numbers, and underscores (got '{}')",
                value
            )));
        }

        Ok(TableLocator {
            mode: locator.mode,
            value: value.to_string(),
        })
    }

    pub fn into_table_name(self) -> String {
        self.value
    }
}

/// `^[a-z_][a-z0-9_]*$`
fn is_table_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Named binary payload attached to a result item
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BinaryAttachment {
    pub file_name: String,
    pub mime_type: String,
    pub file_size: usize,
    #[serde(serialize_with = "serialize_base64")]
    pub data: Vec<u8>,
}

impl BinaryAttachment {
    pub fn new(data: Vec<u8>, file_name: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            file_size: data.len(),
            data,
        }
    }
}

fn serialize_base64<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(data))
}

/// One output row, tagged with the input item it came from
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionItem {
    pub json: Value,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub binary: BTreeMap<String, BinaryAttachment>,
    #[serde(rename = "pairedItem")]
    pub paired_item: usize,
}

impl ExecutionItem {
    pub fn new(json: Value, item: usize) -> Self {
        Self {
            json,
            binary: BTreeMap::new(),
            paired_item: item,
        }
    }

    /// One item per row of a collection response
    pub fn from_rows(rows: Vec<Value>, item: usize) -> Vec<Self> {
        rows.into_iter().map(|row| Self::new(row, item)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_locator_plain_string() {
        let locator = TableLocator::from_value(&json!("accounts")).unwrap();
        assert_eq!(locator.mode, LocatorMode::Name);
        assert_eq!(locator.into_table_name(), "accounts");
    }

    #[test]
    fn test_locator_tagged_modes() {
        let list = TableLocator::from_value(&json!({"mode": "list", "value": "cr1b_Widgets"})).unwrap();
        assert_eq!(list.mode, LocatorMode::List);
        assert_eq!(list.value, "cr1b_Widgets");

        let id = TableLocator::from_value(&json!({"mode": "id", "value": "account"})).unwrap();
        assert_eq!(id.mode, LocatorMode::Id);
    }

    #[test]
    fn test_locator_rejects_bad_names() {
        assert!(TableLocator::from_value(&json!({"mode": "name", "value": "Accounts"})).is_err());
        assert!(TableLocator::from_value(&json!({"mode": "id", "value": "1account"})).is_err());
        assert!(TableLocator::from_value(&json!({"mode": "list", "value": ""})).is_err());
        assert!(TableLocator::from_value(&json!(42)).is_err());
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list(" a, b ,,c "), vec!["a", "b", "c"]);
        assert!(split_list("").is_empty());
    }

    #[test]
    fn test_binary_attachment_serializes_as_base64() {
        let attachment = BinaryAttachment::new(vec![0xff, 0xd8, 0xff], "a.jpg", "image/jpeg");
        let value = serde_json::to_value(&attachment).unwrap();
        assert_eq!(value["data"], "/9j/");
        assert_eq!(value["fileSize"], 3);
        assert_eq!(value["mimeType"], "image/jpeg");
    }

    #[test]
    fn test_execution_item_shape() {
        let item = ExecutionItem::new(json!({"name": "x"}), 2);
        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(value, json!({"json": {"name": "x"}, "pairedItem": 2}));
    }
}
