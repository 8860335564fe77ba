//! Global choice (shared option set) management
//!
//! Every mutation first looks the choice up by name to get its `MetadataId`, then
//! calls the bound action on that id.

use super::{unsupported, Resource};
use crate::host::{ExecutionItem, Params};
use crate::odata::client::{DataverseClient, QueryOptions};
use crate::odata::query::escape_odata_string;
use crate::odata::DataverseError;
use serde::Deserialize;
use serde_json::{json, Value};

/// User locale for new labels (English)
const LANGUAGE_CODE: i64 = 1033;

const DEFINITIONS: &str = "/GlobalOptionSetDefinitions";

/// One entry of the `choiceOptions` collection on create
#[derive(Debug, Clone, Deserialize)]
pub struct NewOption {
    pub label: String,
    pub value: i64,
}

pub async fn execute(params: &Params<'_>, operation: &str) -> Result<Vec<ExecutionItem>, DataverseError> {
    if !matches!(
        operation,
        "list" | "get" | "create" | "addOption" | "updateOption" | "deleteOption" | "delete"
    ) {
        return Err(unsupported(Resource::GlobalChoice, operation));
    }

    let client = DataverseClient::connect(params.host(), params.item()).await?;
    let json = match operation {
        "list" => list(&client).await?,
        "get" => get(&client, &params.string("choiceName")?).await?,
        "create" => create(&client, params).await?,
        "addOption" => add_option(&client, params).await?,
        "updateOption" => update_option(&client, params).await?,
        "deleteOption" => delete_option(&client, params).await?,
        _ => delete(&client, params).await?,
    };

    Ok(vec![ExecutionItem::new(json, params.item())])
}

fn by_name(name: &str) -> String {
    format!("{}(Name='{}')", DEFINITIONS, escape_odata_string(name))
}

/// `Label` complex value; new metadata carries the full localized shape
fn label(text: &str, full: bool) -> Value {
    let mut localized = json!({
        "@odata.type": "Microsoft.Dynamics.CRM.LocalizedLabel",
        "Label": text,
        "LanguageCode": LANGUAGE_CODE,
    });
    if !full {
        return json!({
            "@odata.type": "Microsoft.Dynamics.CRM.Label",
            "LocalizedLabels": [localized],
        });
    }

    localized["IsManaged"] = Value::Bool(false);
    json!({
        "@odata.type": "Microsoft.Dynamics.CRM.Label",
        "LocalizedLabels": [localized.clone()],
        "UserLocalizedLabel": localized,
    })
}

/// Body for a new `Picklist` option set
pub fn option_set_body(name: &str, display_name: &str, description: &str, options: &[NewOption]) -> Value {
    let options: Vec<Value> = options
        .iter()
        .map(|option| {
            json!({
                "Value": option.value,
                "Label": label(&option.label, true),
            })
        })
        .collect();

    json!({
        "@odata.type": "Microsoft.Dynamics.CRM.OptionSetMetadata",
        "Name": name,
        "DisplayName": label(display_name, true),
        "Description": label(description, true),
        "OptionSetType": "Picklist",
        "Options": options,
    })
}

async fn metadata_id(client: &DataverseClient<'_>, name: &str) -> Result<String, DataverseError> {
    let response = client
        .get(&by_name(name), &QueryOptions::new().select(["MetadataId"]))
        .await?;
    response
        .get("MetadataId")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| DataverseError::NotFound(format!("Global choice not found: {}", name)))
}

async fn list(client: &DataverseClient<'_>) -> Result<Value, DataverseError> {
    let query = QueryOptions::new()
        .select(["Name", "DisplayName", "Description"])
        .expand("Options($select=Label,Value)");
    let choices = client.get_collection(DEFINITIONS, &query).await?;
    let count = choices.len();
    Ok(json!({ "globalChoices": choices, "count": count }))
}

async fn get(client: &DataverseClient<'_>, name: &str) -> Result<Value, DataverseError> {
    client
        .get(
            &by_name(name),
            &QueryOptions::new().expand("Options($select=Label,Value)"),
        )
        .await
}

async fn create(client: &DataverseClient<'_>, params: &Params<'_>) -> Result<Value, DataverseError> {
    let name = params.string("newChoiceName")?;
    let display_name = params.string("displayName")?;
    let description = params.optional_string("description").unwrap_or_default();
    let options: Vec<NewOption> = params.collection("choiceOptions", "option")?;

    let body = option_set_body(&name, &display_name, &description, &options);
    let response = client.post(DEFINITIONS, &body).await?;
    tracing::info!("Created global choice {} with {} option(s)", name, options.len());

    Ok(json!({
        "success": true,
        "name": name,
        "metadataId": response.get("MetadataId").cloned().unwrap_or(Value::Null),
    }))
}

async fn add_option(client: &DataverseClient<'_>, params: &Params<'_>) -> Result<Value, DataverseError> {
    let name = params.string("choiceName")?;
    let option_label = params.string("optionLabel")?;
    let value = params.optional_i64("optionValue")?;

    let id = metadata_id(client, &name).await?;
    let mut body = json!({
        "Label": label(&option_label, false),
        "OptionSetName": name,
    });
    if let Some(value) = value {
        body["Value"] = json!(value);
    }

    let response = client
        .post(
            &format!("{}({})/Microsoft.Dynamics.CRM.InsertOptionValue", DEFINITIONS, id),
            &body,
        )
        .await?;

    Ok(json!({
        "success": true,
        "choiceName": name,
        "newOptionValue": response.get("NewOptionValue").cloned().unwrap_or(Value::Null),
    }))
}

async fn update_option(client: &DataverseClient<'_>, params: &Params<'_>) -> Result<Value, DataverseError> {
    let name = params.string("choiceName")?;
    let value = params.i64("optionValue")?;
    let new_label = params.string("newLabel")?;

    let id = metadata_id(client, &name).await?;
    let body = json!({
        "OptionSetName": name,
        "Value": value,
        "Label": label(&new_label, false),
        "MergeLabels": false,
    });
    client
        .post(
            &format!("{}({})/Microsoft.Dynamics.CRM.UpdateOptionValue", DEFINITIONS, id),
            &body,
        )
        .await?;

    Ok(json!({
        "success": true,
        "choiceName": name,
        "optionValue": value,
        "newLabel": new_label,
    }))
}

async fn delete_option(client: &DataverseClient<'_>, params: &Params<'_>) -> Result<Value, DataverseError> {
    let name = params.string("choiceName")?;
    let value = params.i64("optionValue")?;

    let id = metadata_id(client, &name).await?;
    client
        .post(
            &format!("{}({})/Microsoft.Dynamics.CRM.DeleteOptionValue", DEFINITIONS, id),
            &json!({ "OptionSetName": name, "Value": value }),
        )
        .await?;

    Ok(json!({
        "success": true,
        "choiceName": name,
        "deletedOptionValue": value,
    }))
}

async fn delete(client: &DataverseClient<'_>, params: &Params<'_>) -> Result<Value, DataverseError> {
    let name = params.string("choiceName")?;
    let id = metadata_id(client, &name).await?;
    client.delete(&format!("{}({})", DEFINITIONS, id)).await?;
    tracing::info!("Deleted global choice {}", name);

    Ok(json!({ "success": true, "deletedChoice": name }))
}
