//! Web resource upload, update, listing and deletion

use super::{list_limit, unsupported, Resource};
use crate::host::{ExecutionItem, Params};
use crate::odata::client::{DataverseClient, QueryOptions};
use crate::odata::DataverseError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Value};

const WEB_RESOURCES: &str = "/webresourceset";

/// `webresourcetype` codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebResourceType {
    Html = 1,
    Css = 2,
    JavaScript = 3,
    Xml = 4,
    Png = 5,
    Jpg = 6,
    Gif = 7,
    Xap = 8,
    Xsl = 9,
    Ico = 10,
    Svg = 11,
    Resx = 12,
}

impl WebResourceType {
    pub fn from_code(code: i64) -> Result<Self, DataverseError> {
        Ok(match code {
            1 => Self::Html,
            2 => Self::Css,
            3 => Self::JavaScript,
            4 => Self::Xml,
            5 => Self::Png,
            6 => Self::Jpg,
            7 => Self::Gif,
            8 => Self::Xap,
            9 => Self::Xsl,
            10 => Self::Ico,
            11 => Self::Svg,
            12 => Self::Resx,
            other => {
                return Err(DataverseError::InvalidParameter(format!(
                    "Unknown web resource type: {}",
                    other
                )))
            }
        })
    }

    pub fn code(&self) -> i64 {
        *self as i64
    }

    /// Text types arrive as plain text; everything else is already base64
    pub fn needs_text_encoding(&self) -> bool {
        matches!(
            self,
            Self::Html | Self::Css | Self::JavaScript | Self::Xml | Self::Xap | Self::Xsl | Self::Resx
        )
    }

    pub fn encode_content(&self, content: &str) -> String {
        if self.needs_text_encoding() {
            STANDARD.encode(content.as_bytes())
        } else {
            content.to_string()
        }
    }
}

pub async fn execute(params: &Params<'_>, operation: &str) -> Result<Vec<ExecutionItem>, DataverseError> {
    let item = params.item();
    match operation {
        "uploadWebResource" => {
            let client = DataverseClient::connect(params.host(), item).await?;
            Ok(vec![ExecutionItem::new(upload(&client, params).await?, item)])
        }
        "updateWebResource" => {
            let client = DataverseClient::connect(params.host(), item).await?;
            Ok(vec![ExecutionItem::new(update(&client, params).await?, item)])
        }
        "listWebResources" => {
            let client = DataverseClient::connect(params.host(), item).await?;
            let mut query = QueryOptions::new().select([
                "webresourceid",
                "name",
                "displayname",
                "webresourcetype",
                "description",
                "createdon",
                "modifiedon",
            ]);
            let type_filter = params.i64_or("webResourceTypeFilter", 0)?;
            if type_filter > 0 {
                query = query.filter(format!("webresourcetype eq {}", type_filter));
            }
            if let Some(top) = list_limit(params)? {
                query = query.top(top);
            }
            let rows = client.get_collection(WEB_RESOURCES, &query).await?;
            Ok(ExecutionItem::from_rows(rows, item))
        }
        "deleteWebResource" => {
            let id = params.string("webResourceId")?;
            let client = DataverseClient::connect(params.host(), item).await?;
            client.delete(&format!("{}({})", WEB_RESOURCES, id)).await?;
            Ok(vec![ExecutionItem::new(
                json!({ "webresourceid": id, "deleted": true }),
                item,
            )])
        }
        other => Err(unsupported(Resource::WebResource, other)),
    }
}

async fn upload(client: &DataverseClient<'_>, params: &Params<'_>) -> Result<Value, DataverseError> {
    let display_name = params.string("webResourceDisplayName")?;
    let name = params.string("webResourceName")?;
    let resource_type = WebResourceType::from_code(params.i64("webResourceType")?)?;
    let content = params.optional_string("webResourceContent").unwrap_or_default();

    let mut body = json!({
        "displayname": display_name,
        "name": name,
        "webresourcetype": resource_type.code(),
        "content": resource_type.encode_content(&content),
    });
    if let Some(description) = params.optional_string("webResourceDescription") {
        body["description"] = Value::String(description);
    }

    let response = client.post(WEB_RESOURCES, &body).await?;
    tracing::info!("Uploaded web resource {}", name);

    Ok(json!({
        "webresourceid": response.get("webresourceid").cloned().unwrap_or(Value::Null),
        "displayname": display_name,
        "name": name,
        "webresourcetype": resource_type.code(),
        "success": true,
    }))
}

/// Content encoding follows the stored type, so read it first
async fn update(client: &DataverseClient<'_>, params: &Params<'_>) -> Result<Value, DataverseError> {
    let id = params.string("webResourceId")?;
    let content = params.optional_string("webResourceContent").unwrap_or_default();
    let path = format!("{}({})", WEB_RESOURCES, id);

    let existing = client
        .get(&path, &QueryOptions::new().select(["webresourcetype"]))
        .await?;
    let code = existing
        .get("webresourcetype")
        .and_then(Value::as_i64)
        .ok_or_else(|| DataverseError::Parse(format!("Web resource {} has no webresourcetype", id)))?;
    let resource_type = WebResourceType::from_code(code)?;

    client
        .patch(&path, &json!({ "content": resource_type.encode_content(&content) }))
        .await?;

    Ok(json!({ "webresourceid": id, "updated": true }))
}
