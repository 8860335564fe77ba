//! Operation handlers
//!
//! `execute` runs one resource/operation pair over every input item of a batch. Each
//! handler resolves its own environment per item; nothing is shared between items.

pub mod access;
pub mod global_choice;
pub mod plugin;
pub mod record;
pub mod sql;
pub mod steps;
pub mod web_resource;
pub mod webhook;

use crate::host::{ExecutionItem, Host, Params};
use crate::odata::DataverseError;
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Default page size for list operations
pub const DEFAULT_LIMIT: i64 = 50;

/// Top-level resource selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Record,
    GlobalChoice,
    Plugin,
    WebResource,
    Webhook,
    Sql,
}

impl Resource {
    pub fn parse(value: &str) -> Result<Self, DataverseError> {
        match value {
            "record" => Ok(Resource::Record),
            "globalChoice" => Ok(Resource::GlobalChoice),
            "plugin" => Ok(Resource::Plugin),
            "webresource" => Ok(Resource::WebResource),
            "webhook" => Ok(Resource::Webhook),
            "sql" => Ok(Resource::Sql),
            other => Err(DataverseError::InvalidParameter(format!(
                "Unknown resource '{}'",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Record => "record",
            Resource::GlobalChoice => "globalChoice",
            Resource::Plugin => "plugin",
            Resource::WebResource => "webresource",
            Resource::Webhook => "webhook",
            Resource::Sql => "sql",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure that aborted the batch
#[derive(Error, Debug)]
#[error("Item {item_index}: {source}")]
pub struct BatchError {
    pub item_index: usize,
    #[source]
    pub source: DataverseError,
}

pub(crate) fn unsupported(resource: Resource, operation: &str) -> DataverseError {
    DataverseError::UnsupportedOperation {
        resource: resource.to_string(),
        operation: operation.to_string(),
    }
}

/// `$top` for list operations: `None` when `returnAll` is set
pub(crate) fn list_limit(params: &Params<'_>) -> Result<Option<usize>, DataverseError> {
    if params.bool_or("returnAll", false) {
        return Ok(None);
    }
    let limit = params.i64_or("limit", DEFAULT_LIMIT)?;
    if limit < 1 {
        return Err(DataverseError::InvalidParameter(
            "'limit' must be at least 1".to_string(),
        ));
    }
    Ok(Some(limit as usize))
}

/// Run one operation for a single item
pub async fn execute_item(
    host: &dyn Host,
    resource: Resource,
    operation: &str,
    item: usize,
) -> Result<Vec<ExecutionItem>, DataverseError> {
    let params = Params::new(host, item);
    match resource {
        Resource::Record => record::execute(&params, operation).await,
        Resource::GlobalChoice => global_choice::execute(&params, operation).await,
        Resource::Plugin => plugin::execute(&params, operation).await,
        Resource::WebResource => web_resource::execute(&params, operation).await,
        Resource::Webhook => webhook::execute(&params, operation).await,
        Resource::Sql => match operation {
            "executeQuery" => sql::execute_query(&params, &sql::TiberiusConnector).await,
            other => Err(unsupported(resource, other)),
        },
    }
}

/// Run an operation over `item_count` input items, in order.
///
/// With the host's continue-on-fail policy a failing item yields
/// `{"json": {"error": ...}}` and the batch goes on; otherwise the first failure
/// aborts the batch.
pub async fn execute(
    host: &dyn Host,
    resource: &str,
    operation: &str,
    item_count: usize,
) -> Result<Vec<ExecutionItem>, BatchError> {
    let resource = Resource::parse(resource).map_err(|source| BatchError {
        item_index: 0,
        source,
    })?;

    let mut results = Vec::new();
    for item in 0..item_count {
        match execute_item(host, resource, operation, item).await {
            Ok(items) => results.extend(items),
            Err(e) if host.continue_on_fail() => {
                tracing::warn!("{} {} failed for item {}: {}", resource, operation, item, e);
                results.push(ExecutionItem::new(json!({ "error": e.to_string() }), item));
            }
            Err(source) => {
                return Err(BatchError {
                    item_index: item,
                    source,
                })
            }
        }
    }

    tracing::info!(
        "{} {}: {} input item(s), {} result(s)",
        resource,
        operation,
        item_count,
        results.len()
    );
    Ok(results)
}
