//! Shared fixtures for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use dataverse_connector::auth::{DataverseCredentials, OAuthTokenData};
use dataverse_connector::host::{Host, RetryPolicy};
use reqwest::Client;
use serde_json::{Map, Value};

pub const TEST_TOKEN: &str = "test-token";

/// In-memory host: one parameter map per input item, credentials pointing at a mock server
pub struct FakeHost {
    items: Vec<Map<String, Value>>,
    environment_url: Option<String>,
    client: Client,
    continue_on_fail: bool,
}

impl FakeHost {
    pub fn new(environment_url: &str, items: Vec<Value>) -> Self {
        Self {
            items: items
                .into_iter()
                .map(|item| match item {
                    Value::Object(map) => map,
                    other => panic!("item must be an object, got {}", other),
                })
                .collect(),
            environment_url: Some(environment_url.to_string()),
            client: Client::new(),
            continue_on_fail: false,
        }
    }

    pub fn single(environment_url: &str, item: Value) -> Self {
        Self::new(environment_url, vec![item])
    }

    pub fn without_credentials(items: Vec<Value>) -> Self {
        let mut host = Self::new("", items);
        host.environment_url = None;
        host
    }

    pub fn with_continue_on_fail(mut self) -> Self {
        self.continue_on_fail = true;
        self
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }
}

#[async_trait]
impl Host for FakeHost {
    fn parameter(&self, name: &str, item: usize) -> Option<Value> {
        self.items.get(item).and_then(|map| map.get(name)).cloned()
    }

    async fn credentials(&self) -> Option<DataverseCredentials> {
        self.environment_url.as_ref().map(|url| DataverseCredentials {
            environment_url: url.clone(),
            oauth_token_data: Some(OAuthTokenData::new(TEST_TOKEN)),
        })
    }

    fn http_client(&self) -> &Client {
        &self.client
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            retry_delay_ms: 1,
        }
    }

    fn continue_on_fail(&self) -> bool {
        self.continue_on_fail
    }
}

/// Web API path under the versioned root
pub fn api(path: &str) -> String {
    format!("/api/data/v9.2{}", path)
}

/// An `EntityDefinitions` collection row
pub fn entity_row(logical_name: &str, entity_set_name: &str, display_name: &str) -> Value {
    serde_json::json!({
        "LogicalName": logical_name,
        "EntitySetName": entity_set_name,
        "PrimaryIdAttribute": format!("{}id", logical_name),
        "DisplayName": { "UserLocalizedLabel": { "Label": display_name } }
    })
}
