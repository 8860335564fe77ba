//! Plugin assembly upload and step registration

use super::steps::{filtering_attributes, resolve_message_filter};
use super::{list_limit, unsupported, Resource};
use crate::host::{ExecutionItem, Params};
use crate::odata::client::{DataverseClient, QueryOptions};
use crate::odata::query::escape_odata_string;
use crate::odata::DataverseError;
use serde_json::{json, Value};

const ASSEMBLY_VERSION: &str = "1.0.0.0";

/// SDK message a plugin step fires on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOperation {
    Create = 1,
    Update = 2,
    Delete = 3,
}

impl EventOperation {
    pub fn from_code(code: i64) -> Result<Self, DataverseError> {
        match code {
            1 => Ok(Self::Create),
            2 => Ok(Self::Update),
            3 => Ok(Self::Delete),
            other => Err(DataverseError::InvalidParameter(format!(
                "Unsupported event operation: {}",
                other
            ))),
        }
    }

    pub fn message_name(&self) -> &'static str {
        match self {
            Self::Create => "Create",
            Self::Update => "Update",
            Self::Delete => "Delete",
        }
    }
}

/// Pipeline stage of a processing step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    PreValidation = 10,
    PreOperation = 20,
    PostOperation = 40,
}

impl Stage {
    pub fn from_code(code: i64) -> Result<Self, DataverseError> {
        match code {
            10 => Ok(Self::PreValidation),
            20 => Ok(Self::PreOperation),
            40 => Ok(Self::PostOperation),
            other => Err(DataverseError::InvalidParameter(format!(
                "Unsupported step stage: {} (expected 10, 20 or 40)",
                other
            ))),
        }
    }
}

pub async fn execute(params: &Params<'_>, operation: &str) -> Result<Vec<ExecutionItem>, DataverseError> {
    let item = params.item();
    match operation {
        "uploadPluginAssembly" => {
            let client = DataverseClient::connect(params.host(), item).await?;
            Ok(vec![ExecutionItem::new(upload_assembly(&client, params).await?, item)])
        }
        "registerPluginStep" => {
            let table = params.table()?;
            let client = DataverseClient::connect(params.host(), item).await?;
            Ok(vec![ExecutionItem::new(register_step(&client, params, &table).await?, item)])
        }
        "listPluginAssemblies" => {
            let client = DataverseClient::connect(params.host(), item).await?;
            let mut query = QueryOptions::new().select([
                "pluginassemblyid",
                "name",
                "version",
                "createdon",
                "modifiedon",
                "isolationmode",
                "sourcetype",
            ]);
            if let Some(top) = list_limit(params)? {
                query = query.top(top);
            }
            let rows = client.get_collection("/pluginassemblies", &query).await?;
            Ok(ExecutionItem::from_rows(rows, item))
        }
        "deletePluginAssembly" => {
            let assembly_id = params.string("assemblyId")?;
            let client = DataverseClient::connect(params.host(), item).await?;
            client
                .delete(&format!("/pluginassemblies({})", assembly_id))
                .await?;
            Ok(vec![ExecutionItem::new(
                json!({ "pluginassemblyid": assembly_id, "deleted": true }),
                item,
            )])
        }
        other => Err(unsupported(Resource::Plugin, other)),
    }
}

/// `dllFile` is the base64-encoded assembly
async fn upload_assembly(client: &DataverseClient<'_>, params: &Params<'_>) -> Result<Value, DataverseError> {
    let name = params.string("assemblyName")?;
    let body = json!({
        "name": name,
        "content": params.string("dllFile")?,
        "sourcetype": params.i64_or("sourceType", 0)?,
        "isolationmode": params.i64_or("isolationMode", 2)?,
        "version": ASSEMBLY_VERSION,
    });

    let response = client.post("/pluginassemblies", &body).await?;
    tracing::info!("Uploaded plugin assembly {}", name);

    Ok(json!({
        "pluginassemblyid": response.get("pluginassemblyid").cloned().unwrap_or(Value::Null),
        "name": name,
        "success": true,
    }))
}

async fn register_step(
    client: &DataverseClient<'_>,
    params: &Params<'_>,
    table: &str,
) -> Result<Value, DataverseError> {
    let assembly_id = params.string("pluginAssemblyId")?;
    let type_name = params.string("pluginTypeName")?;
    let step_name = params.string("stepName")?;
    let operation = EventOperation::from_code(params.i64("eventOperation")?)?;
    let stage = Stage::from_code(params.i64_or("stage", Stage::PostOperation as i64)?)?;
    let attributes = params.string_list("filteringAttributes");

    let filter = resolve_message_filter(
        client,
        table,
        operation.message_name(),
        &["sdkmessagefilterid"],
    )
    .await?;

    let types = client
        .get_collection(
            "/plugintypes",
            &QueryOptions::new()
                .filter(format!(
                    "_pluginassemblyid_value eq {} and name eq '{}'",
                    assembly_id,
                    escape_odata_string(&type_name)
                ))
                .select(["plugintypeid"]),
        )
        .await?;
    let plugin_type_id = types
        .first()
        .and_then(|row| row.get("plugintypeid"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            DataverseError::NotFound(format!(
                "Plugin type '{}' not found in assembly {}",
                type_name, assembly_id
            ))
        })?;

    let mut body = json!({
        "name": step_name,
        "mode": 0,
        "rank": 1,
        "stage": stage as i64,
        "supporteddeployment": 0,
        "eventhandler_plugintype@odata.bind": format!("/plugintypes({})", plugin_type_id),
        "sdkmessageid@odata.bind": format!("/sdkmessages({})", filter.sdkmessageid),
        "sdkmessagefilterid@odata.bind": format!("/sdkmessagefilters({})", filter.sdkmessagefilterid),
    });
    if let Some(attributes) = filtering_attributes(&attributes) {
        body["filteringattributes"] = attributes;
    }

    let step = client.post("/sdkmessageprocessingsteps", &body).await?;
    tracing::info!(
        "Registered plugin step {} on {} {}",
        step_name,
        table,
        operation.message_name()
    );

    Ok(json!({
        "pluginassemblyid": assembly_id,
        "plugintypeid": plugin_type_id,
        "sdkmessagefilterid": filter.sdkmessagefilterid,
        "sdkmessageid": filter.sdkmessageid,
        "table": table,
        "operation": operation.message_name(),
        "step": step,
        "success": true,
    }))
}
