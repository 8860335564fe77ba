//! MCP Server implementation for Dataverse
//!
//! Exposes the connector's operations and metadata pickers as MCP tools. Each tool
//! call becomes a short-lived [`ToolCallHost`] whose input items are the call arguments.

use crate::auth::{DataverseCredentials, OAuthSession};
use crate::config::RuntimeConfig;
use crate::host::{Host, RetryPolicy};
use crate::mcp::load_options::{self, PropertyOption};
use crate::mcp::protocol::*;
use crate::operations;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// MCP Server for Dataverse
pub struct DataverseMcpServer {
    session: Option<Arc<OAuthSession>>,
    http_client: Client,
    retry: RetryPolicy,
}

impl DataverseMcpServer {
    /// Create a new MCP server instance
    pub fn new(session: Option<Arc<OAuthSession>>, http_client: Client, retry: RetryPolicy) -> Self {
        Self {
            session,
            http_client,
            retry,
        }
    }

    /// Build the server from validated runtime configuration
    pub fn from_runtime(config: &RuntimeConfig) -> anyhow::Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        // Without an environment URL every call has to bring custom auth options
        let session = config.environment_url.as_ref().map(|url| {
            Arc::new(OAuthSession::new(
                config.oauth.clone(),
                url.clone(),
                config.token.clone(),
            ))
        });

        Ok(Self::new(
            session,
            http_client,
            RetryPolicy {
                max_retries: config.max_retries,
                retry_delay_ms: config.retry_delay_ms,
            },
        ))
    }

    /// Get list of available tools
    pub fn get_tools() -> Vec<Tool> {
        vec![
            Tool {
                name: "dataverse_execute".to_string(),
                description: "Run a Dataverse operation. Resources: record (create, get, getMany, update, upsert, delete, shareAccessAdd, shareAccessList, shareAccessRevoke, assign), globalChoice (list, get, create, addOption, updateOption, deleteOption, delete), plugin (uploadPluginAssembly, registerPluginStep, listPluginAssemblies, deletePluginAssembly), webresource (uploadWebResource, updateWebResource, listWebResources, deleteWebResource), webhook (registerEndpoint, registerWebhookStep, listEndpoints, deleteEndpoint, listEndpointSteps, deleteStep, listSdkMessageFilters), sql (executeQuery).".to_string(),
                input_schema: InputSchema::new()
                    .required("resource", "string", "Resource, e.g. 'record', 'globalChoice', 'sql'")
                    .required("operation", "string", "Operation of the resource, e.g. 'getMany'")
                    .optional("items", "array", "One parameter object per input item, e.g. [{\"table\": \"accounts\", \"recordId\": \"...\"}]")
                    .optional("parameters", "object", "Parameters of a single input item (used when 'items' is absent)")
                    .optional("continueOnFail", "boolean", "Report per-item errors instead of failing the whole call")
                    .build(),
            },
            Tool {
                name: "search_tables".to_string(),
                description: "Search Dataverse tables. Returns '<Display> (<logical>)' names with the entity set name as value.".to_string(),
                input_schema: InputSchema::new()
                    .optional("filter", "string", "Case-insensitive text to match against names")
                    .optional("options", "object", "Connection options (useCustomAuth, customEnvironmentUrl, accessToken)")
                    .build(),
            },
            Tool {
                name: "list_table_fields".to_string(),
                description: "List readable fields of a table with type and Create/Update/Read flags".to_string(),
                input_schema: InputSchema::new()
                    .required("table", "string", "Entity set name, e.g. 'accounts'")
                    .optional("options", "object", "Connection options")
                    .build(),
            },
            Tool {
                name: "list_table_field_names".to_string(),
                description: "List readable field names of a table".to_string(),
                input_schema: InputSchema::new()
                    .required("table", "string", "Entity set name, e.g. 'accounts'")
                    .optional("options", "object", "Connection options")
                    .build(),
            },
            Tool {
                name: "list_alternate_key_fields".to_string(),
                description: "List the fields that make up the alternate keys of a table".to_string(),
                input_schema: InputSchema::new()
                    .required("table", "string", "Entity set name, e.g. 'accounts'")
                    .optional("options", "object", "Connection options")
                    .build(),
            },
            Tool {
                name: "list_choice_options".to_string(),
                description: "List the options of a choice (picklist, state or status) field".to_string(),
                input_schema: InputSchema::new()
                    .required("table", "string", "Entity set name, e.g. 'accounts'")
                    .required("field", "string", "Logical name of the choice field, e.g. 'industrycode'")
                    .optional("options", "object", "Connection options")
                    .build(),
            },
        ]
    }

    /// Handle a tool call
    pub async fn call_tool(&self, name: &str, args: &HashMap<String, Value>) -> CallToolResult {
        match name {
            "dataverse_execute" => self.execute(args).await,
            "search_tables" => {
                let host = self.single_item_host(args);
                let filter = args.get("filter").and_then(Value::as_str);
                picker_result(load_options::search_tables(&host, 0, filter).await)
            }
            "list_table_fields" => {
                let host = self.single_item_host(args);
                picker_result(load_options::table_fields_for_display(&host, 0).await)
            }
            "list_table_field_names" => {
                let host = self.single_item_host(args);
                picker_result(load_options::table_field_names(&host, 0).await)
            }
            "list_alternate_key_fields" => {
                let host = self.single_item_host(args);
                picker_result(load_options::alternate_key_fields(&host, 0).await)
            }
            "list_choice_options" => {
                let mut host = self.single_item_host(args);
                if let Some(field) = args.get("field") {
                    host.items[0].insert("viewChoiceField".to_string(), field.clone());
                }
                picker_result(load_options::choice_field_options(&host, 0).await)
            }
            _ => CallToolResult::error(format!("Unknown tool: {}", name)),
        }
    }

    async fn execute(&self, args: &HashMap<String, Value>) -> CallToolResult {
        let resource = match args.get("resource").and_then(Value::as_str) {
            Some(r) => r,
            None => return CallToolResult::error("Missing required parameter: resource".to_string()),
        };
        let operation = match args.get("operation").and_then(Value::as_str) {
            Some(o) => o,
            None => return CallToolResult::error("Missing required parameter: operation".to_string()),
        };

        let items = match input_items(args) {
            Ok(items) => items,
            Err(message) => return CallToolResult::error(message),
        };
        let continue_on_fail = args
            .get("continueOnFail")
            .and_then(|v| v.as_bool().or_else(|| v.as_str().map(|s| s == "true")))
            .unwrap_or(false);

        let item_count = items.len();
        let host = ToolCallHost::new(self, items, continue_on_fail);

        match operations::execute(&host, resource, operation, item_count).await {
            Ok(results) => CallToolResult::json(&results),
            Err(e) => CallToolResult::error(format!("Error: {}", e)),
        }
    }

    fn single_item_host(&self, args: &HashMap<String, Value>) -> ToolCallHost<'_> {
        let item: Map<String, Value> = args.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        ToolCallHost::new(self, vec![item], false)
    }

    /// Dispatch one JSON-RPC request
    pub async fn handle_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let id = request.id.clone();

        match request.method.as_str() {
            "initialize" => {
                let result = initialize_result("dataverse-mcp", env!("CARGO_PKG_VERSION"));
                JsonRpcResponse::success(id, result)
            }

            "initialized" | "notifications/initialized" => JsonRpcResponse::success(id, json!({})),

            "tools/list" => to_response(id, &HashMap::from([("tools", Self::get_tools())])),

            "tools/call" => {
                let params: CallToolParams = match request.params {
                    Some(p) => match serde_json::from_value(p) {
                        Ok(params) => params,
                        Err(e) => {
                            return JsonRpcResponse::error(
                                id,
                                INVALID_PARAMS,
                                format!("Invalid params: {}", e),
                            );
                        }
                    },
                    None => {
                        return JsonRpcResponse::error(id, INVALID_PARAMS, "Missing params");
                    }
                };

                let args = params.arguments.unwrap_or_default();
                let result = self.call_tool(&params.name, &args).await;
                to_response(id, &result)
            }

            "ping" => JsonRpcResponse::success(id, json!({})),

            _ => JsonRpcResponse::error(
                id,
                METHOD_NOT_FOUND,
                format!("Method not found: {}", request.method),
            ),
        }
    }
}

fn to_response<T: serde::Serialize>(id: Option<Value>, result: &T) -> JsonRpcResponse {
    match serde_json::to_value(result) {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(e) => JsonRpcResponse::error(id, INTERNAL_ERROR, format!("Internal error: {}", e)),
    }
}

fn picker_result(rows: Vec<PropertyOption>) -> CallToolResult {
    CallToolResult::json(&rows)
}

/// Per-item parameter objects from `items`, or the single `parameters` object
fn input_items(args: &HashMap<String, Value>) -> Result<Vec<Map<String, Value>>, String> {
    let items = args.get("items").filter(|v| !v.is_null());
    let parameters = args.get("parameters").filter(|v| !v.is_null());

    match (items, parameters) {
        (Some(Value::Array(items)), _) => items
            .iter()
            .enumerate()
            .map(|(i, item)| match item {
                Value::Object(map) => Ok(map.clone()),
                _ => Err(format!("items[{}] must be an object", i)),
            })
            .collect(),
        (Some(_), _) => Err("'items' must be an array of objects".to_string()),
        (None, Some(Value::Object(map))) => Ok(vec![map.clone()]),
        (None, Some(_)) => Err("'parameters' must be an object".to_string()),
        (None, None) => Ok(vec![Map::new()]),
    }
}

/// Host view of one tool call
pub struct ToolCallHost<'a> {
    server: &'a DataverseMcpServer,
    items: Vec<Map<String, Value>>,
    continue_on_fail: bool,
}

impl<'a> ToolCallHost<'a> {
    pub fn new(
        server: &'a DataverseMcpServer,
        items: Vec<Map<String, Value>>,
        continue_on_fail: bool,
    ) -> Self {
        Self {
            server,
            items,
            continue_on_fail,
        }
    }
}

#[async_trait]
impl Host for ToolCallHost<'_> {
    fn parameter(&self, name: &str, item: usize) -> Option<Value> {
        self.items.get(item)?.get(name).cloned()
    }

    async fn credentials(&self) -> Option<DataverseCredentials> {
        match self.server.session {
            Some(ref session) => Some(session.credentials().await),
            None => None,
        }
    }

    fn http_client(&self) -> &Client {
        &self.server.http_client
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.server.retry
    }

    fn continue_on_fail(&self) -> bool {
        self.continue_on_fail
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> DataverseMcpServer {
        DataverseMcpServer::new(None, Client::new(), RetryPolicy::default())
    }

    fn args(value: Value) -> HashMap<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_tool_names() {
        let names: Vec<String> = DataverseMcpServer::get_tools()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(
            names,
            vec![
                "dataverse_execute",
                "search_tables",
                "list_table_fields",
                "list_table_field_names",
                "list_alternate_key_fields",
                "list_choice_options"
            ]
        );
    }

    #[test]
    fn test_input_items() {
        let items = input_items(&args(json!({"items": [{"a": 1}, {"b": 2}]}))).unwrap();
        assert_eq!(items.len(), 2);

        let single = input_items(&args(json!({"parameters": {"table": "accounts"}}))).unwrap();
        assert_eq!(single[0]["table"], "accounts");

        assert_eq!(input_items(&args(json!({}))).unwrap(), vec![Map::new()]);
        assert!(input_items(&args(json!({"items": [1]}))).is_err());
        assert!(input_items(&args(json!({"items": "x"}))).is_err());
    }

    #[test]
    fn test_tool_call_host_parameters() {
        let server = server();
        let mut item = Map::new();
        item.insert("table".to_string(), json!("accounts"));
        let host = ToolCallHost::new(&server, vec![item], true);

        assert_eq!(host.parameter("table", 0), Some(json!("accounts")));
        assert_eq!(host.parameter("table", 1), None);
        assert!(host.continue_on_fail());
        assert!(tokio_test::block_on(host.credentials()).is_none());
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let request: JsonRpcRequest =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": 1, "method": "resources/list"})).unwrap();
        let response = server().handle_request(request).await;
        assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_tools_call_without_params() {
        let request: JsonRpcRequest =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/call"})).unwrap();
        let response = server().handle_request(request).await;
        assert_eq!(response.error.unwrap().code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_custom_auth_without_url_fails_before_any_request() {
        let result = server()
            .call_tool(
                "dataverse_execute",
                &args(json!({
                    "resource": "record",
                    "operation": "get",
                    "parameters": {
                        "table": "accounts",
                        "recordId": "1",
                        "options": {"useCustomAuth": true, "customEnvironmentUrl": "", "accessToken": "t"}
                    }
                })),
            )
            .await;
        assert!(result.is_error);
        assert!(result.content[0].text.contains("Environment URL is required"));
    }

    #[tokio::test]
    async fn test_picker_without_table() {
        let result = server().call_tool("list_table_fields", &HashMap::new()).await;
        assert!(!result.is_error);
        assert!(result.content[0].text.contains("Please select a table first"));
    }
}
