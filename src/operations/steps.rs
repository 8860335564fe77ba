//! SDK message lookups shared by plugin and webhook step registration

use crate::odata::client::{DataverseClient, QueryOptions};
use crate::odata::query::escape_odata_string;
use crate::odata::DataverseError;
use serde::Deserialize;
use serde_json::Value;

/// The message filter a processing step binds to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFilter {
    pub sdkmessagefilterid: String,
    pub sdkmessageid: String,
}

#[derive(Debug, Deserialize)]
struct FilterRow {
    sdkmessagefilterid: String,
    sdkmessageid: Option<MessageRow>,
}

#[derive(Debug, Deserialize)]
struct MessageRow {
    name: Option<String>,
    sdkmessageid: Option<String>,
}

/// Find the filter for `message` (e.g. `Create`) on `table`
pub async fn resolve_message_filter(
    client: &DataverseClient<'_>,
    table: &str,
    message: &str,
    select: &[&str],
) -> Result<MessageFilter, DataverseError> {
    let query = QueryOptions::new()
        .filter(format!(
            "primaryobjecttypecode eq '{}'",
            escape_odata_string(table)
        ))
        .select(select.iter().copied())
        .expand("sdkmessageid($select=name,sdkmessageid)");

    let rows = client.get_collection("/sdkmessagefilters", &query).await?;
    if rows.is_empty() {
        return Err(DataverseError::NotFound(format!(
            "No SDK message filter found for table: {}",
            table
        )));
    }

    rows.into_iter()
        .filter_map(|row| serde_json::from_value::<FilterRow>(row).ok())
        .find_map(|row| {
            let message_row = row.sdkmessageid?;
            if message_row.name.as_deref() != Some(message) {
                return None;
            }
            Some(MessageFilter {
                sdkmessagefilterid: row.sdkmessagefilterid,
                sdkmessageid: message_row.sdkmessageid?,
            })
        })
        .ok_or_else(|| {
            DataverseError::NotFound(format!(
                "No SDK message filter found for table: {} and operation: {}",
                table, message
            ))
        })
}

/// The `sdkmessageprocessingsteps` filter for steps of a service endpoint
pub fn endpoint_steps_filter(endpoint_id: &str) -> String {
    format!(
        "eventhandler_serviceendpoint/serviceendpointid eq {}",
        endpoint_id
    )
}

/// Non-empty `filteringattributes` from a list parameter
pub fn filtering_attributes(attributes: &[String]) -> Option<Value> {
    if attributes.is_empty() {
        None
    } else {
        Some(Value::String(attributes.join(",")))
    }
}
