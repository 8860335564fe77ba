//! Webhook service endpoints and their processing steps

use super::steps::{endpoint_steps_filter, filtering_attributes, resolve_message_filter};
use super::{list_limit, unsupported, Resource};
use crate::host::{ExecutionItem, Params};
use crate::odata::client::{DataverseClient, QueryOptions};
use crate::odata::query::escape_odata_string;
use crate::odata::DataverseError;
use serde_json::{json, Value};

/// `contract` value of webhook service endpoints
const WEBHOOK_CONTRACT: i64 = 8;
/// `messageformat` JSON
const MESSAGE_FORMAT_JSON: i64 = 2;

const AUTH_NONE: i64 = 0;
const AUTH_HTTP_HEADER: i64 = 4;

const WEBHOOK_MESSAGES: &[&str] = &["Create", "Update", "Delete", "Assign", "SetState"];

pub async fn execute(params: &Params<'_>, operation: &str) -> Result<Vec<ExecutionItem>, DataverseError> {
    let item = params.item();
    let single = |json: Value| -> Result<Vec<ExecutionItem>, DataverseError> {
        Ok(vec![ExecutionItem::new(json, item)])
    };

    match operation {
        "registerEndpoint" => {
            let client = DataverseClient::connect(params.host(), item).await?;
            single(register_endpoint(&client, params).await?)
        }
        "registerWebhookStep" => {
            let table = params.table()?;
            let client = DataverseClient::connect(params.host(), item).await?;
            single(register_step(&client, params, &table).await?)
        }
        "listEndpoints" => {
            let client = DataverseClient::connect(params.host(), item).await?;
            let mut query = QueryOptions::new()
                .select([
                    "serviceendpointid",
                    "name",
                    "description",
                    "url",
                    "authtype",
                    "createdon",
                    "modifiedon",
                ])
                .filter(format!("contract eq {}", WEBHOOK_CONTRACT));
            if let Some(top) = list_limit(params)? {
                query = query.top(top);
            }
            let rows = client.get_collection("/serviceendpoints", &query).await?;
            Ok(ExecutionItem::from_rows(rows, item))
        }
        "deleteEndpoint" => {
            let endpoint_id = params.string("serviceEndpointId")?;
            let client = DataverseClient::connect(params.host(), item).await?;
            single(delete_endpoint(&client, &endpoint_id).await?)
        }
        "listEndpointSteps" => {
            let endpoint_id = params.string("serviceEndpointId")?;
            let client = DataverseClient::connect(params.host(), item).await?;
            let mut query = QueryOptions::new()
                .select([
                    "sdkmessageprocessingstepid",
                    "name",
                    "mode",
                    "rank",
                    "stage",
                    "asyncautodelete",
                ])
                .expand("sdkmessageid($select=name),sdkmessagefilterid($select=primaryobjecttypecode)")
                .filter(endpoint_steps_filter(&endpoint_id));
            if let Some(top) = list_limit(params)? {
                query = query.top(top);
            }
            let rows = client
                .get_collection("/sdkmessageprocessingsteps", &query)
                .await?;
            Ok(ExecutionItem::from_rows(rows, item))
        }
        "deleteStep" => {
            let step_id = params.string("stepId")?;
            let client = DataverseClient::connect(params.host(), item).await?;
            client
                .delete(&format!("/sdkmessageprocessingsteps({})", step_id))
                .await?;
            single(json!({ "sdkmessageprocessingstepid": step_id, "deleted": true }))
        }
        "listSdkMessageFilters" => {
            let table = params.table()?;
            let client = DataverseClient::connect(params.host(), item).await?;
            let query = QueryOptions::new()
                .filter(format!(
                    "primaryobjecttypecode eq '{}'",
                    escape_odata_string(&table)
                ))
                .select(["sdkmessagefilterid", "primaryobjecttypecode"])
                .expand("sdkmessageid($select=name)");
            let rows = client.get_collection("/sdkmessagefilters", &query).await?;
            Ok(ExecutionItem::from_rows(rows, item))
        }
        other => Err(unsupported(Resource::Webhook, other)),
    }
}

/// Service endpoint body; a non-empty auth header switches to header auth
pub fn endpoint_body(name: &str, url: &str, description: Option<&str>, auth_header: Option<&str>) -> Value {
    let mut body = json!({
        "name": name,
        "description": description
            .map(str::to_string)
            .unwrap_or_else(|| format!("Webhook endpoint: {}", name)),
        "contract": WEBHOOK_CONTRACT,
        "messageformat": MESSAGE_FORMAT_JSON,
        "url": url,
        "authtype": if auth_header.is_some() { AUTH_HTTP_HEADER } else { AUTH_NONE },
    });
    if let Some(header) = auth_header {
        body["authvalue"] = Value::String(header.to_string());
    }
    body
}

async fn register_endpoint(client: &DataverseClient<'_>, params: &Params<'_>) -> Result<Value, DataverseError> {
    let name = params.string("endpointName")?;
    let url = params.string("webhookUrl")?;
    let auth_header = params.optional_string("authHeader");
    let description = params.optional_string("endpointDescription");

    let body = endpoint_body(&name, &url, description.as_deref(), auth_header.as_deref());
    let response = client.post("/serviceendpoints", &body).await?;

    let endpoint_id = response
        .get("serviceendpointid")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| {
            DataverseError::Parse("Failed to create service endpoint - no ID returned".to_string())
        })?;
    tracing::info!("Registered webhook endpoint {} ({})", name, endpoint_id);

    Ok(json!({
        "serviceendpointid": endpoint_id,
        "name": name,
        "url": url,
        "authtype": body["authtype"],
        "success": true,
    }))
}

async fn register_step(
    client: &DataverseClient<'_>,
    params: &Params<'_>,
    table: &str,
) -> Result<Value, DataverseError> {
    let endpoint_id = params.string("serviceEndpointId")?;
    let message = params.string("webhookOperation")?;
    if !WEBHOOK_MESSAGES.contains(&message.as_str()) {
        return Err(DataverseError::InvalidParameter(format!(
            "Unsupported webhook operation: {}",
            message
        )));
    }
    let step_name = params
        .optional_string("stepName")
        .unwrap_or_else(|| format!("{} {} Webhook", table, message));
    let attributes = params.string_list("filteringAttributes");

    let filter = resolve_message_filter(
        client,
        table,
        &message,
        &["sdkmessagefilterid", "primaryobjecttypecode"],
    )
    .await?;

    let mut body = json!({
        "name": step_name,
        "mode": 1,
        "rank": 1,
        "stage": 40,
        "supporteddeployment": 0,
        "asyncautodelete": true,
        "eventhandler_serviceendpoint@odata.bind": format!("/serviceendpoints({})", endpoint_id),
        "sdkmessageid@odata.bind": format!("/sdkmessages({})", filter.sdkmessageid),
        "sdkmessagefilterid@odata.bind": format!("/sdkmessagefilters({})", filter.sdkmessagefilterid),
    });
    if let Some(attributes) = filtering_attributes(&attributes) {
        body["filteringattributes"] = attributes;
    }

    let step = client.post("/sdkmessageprocessingsteps", &body).await?;

    Ok(json!({
        "serviceendpointid": endpoint_id,
        "sdkmessagefilterid": filter.sdkmessagefilterid,
        "sdkmessageid": filter.sdkmessageid,
        "table": table,
        "operation": message,
        "step": step,
        "success": true,
    }))
}

/// Steps go first, one at a time; the endpoint cannot be deleted while referenced
async fn delete_endpoint(client: &DataverseClient<'_>, endpoint_id: &str) -> Result<Value, DataverseError> {
    let steps = client
        .get_collection(
            "/sdkmessageprocessingsteps",
            &QueryOptions::new()
                .select(["sdkmessageprocessingstepid"])
                .filter(endpoint_steps_filter(endpoint_id)),
        )
        .await?;

    for step in &steps {
        if let Some(step_id) = step.get("sdkmessageprocessingstepid").and_then(Value::as_str) {
            client
                .delete(&format!("/sdkmessageprocessingsteps({})", step_id))
                .await?;
        }
    }

    client
        .delete(&format!("/serviceendpoints({})", endpoint_id))
        .await?;
    tracing::info!(
        "Deleted webhook endpoint {} and {} step(s)",
        endpoint_id,
        steps.len()
    );

    Ok(json!({
        "serviceendpointid": endpoint_id,
        "deleted": true,
        "stepsDeleted": steps.len(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_body_without_auth() {
        let body = endpoint_body("orders", "https://hooks.example.com/o", None, None);
        assert_eq!(body["description"], "Webhook endpoint: orders");
        assert_eq!(body["contract"], 8);
        assert_eq!(body["messageformat"], 2);
        assert_eq!(body["authtype"], 0);
        assert!(body.get("authvalue").is_none());
    }

    #[test]
    fn test_endpoint_body_with_header_auth() {
        let body = endpoint_body(
            "orders",
            "https://hooks.example.com/o",
            Some("Order hooks"),
            Some("x-key=secret"),
        );
        assert_eq!(body["description"], "Order hooks");
        assert_eq!(body["authtype"], 4);
        assert_eq!(body["authvalue"], "x-key=secret");
    }
}
