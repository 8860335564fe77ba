//! Record operations
//!
//! CRUD, upsert, sharing and assignment of table rows, plus materializing image and
//! file columns as binary attachments on `get`.

use super::access::{resolve_principal, AccessRights};
use super::{list_limit, unsupported, Resource};
use crate::host::{split_list, BinaryAttachment, ExecutionItem, Params};
use crate::odata::client::{DataverseClient, QueryOptions};
use crate::odata::metadata::{classify_virtual_fields, resolve_entity, resolve_logical_name};
use crate::odata::query::{
    build_record_identifier, fields_to_object, record_path, AlternateKey, FieldValue, RecordIdType,
};
use crate::odata::DataverseError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::{Method, Url};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordOperation {
    Create,
    Get,
    GetMany,
    Update,
    Upsert,
    Delete,
    Share,
    ShareList,
    ShareRevoke,
    Assign,
}

impl RecordOperation {
    fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "create" => Self::Create,
            "get" => Self::Get,
            "getMany" => Self::GetMany,
            "update" => Self::Update,
            "upsert" => Self::Upsert,
            "delete" => Self::Delete,
            "share" | "shareAccessAdd" => Self::Share,
            "shareAccessList" => Self::ShareList,
            "shareAccessRevoke" => Self::ShareRevoke,
            "assign" => Self::Assign,
            _ => return None,
        })
    }
}

pub async fn execute(params: &Params<'_>, operation: &str) -> Result<Vec<ExecutionItem>, DataverseError> {
    let op = RecordOperation::parse(operation).ok_or_else(|| unsupported(Resource::Record, operation))?;
    let table = params.table()?;
    let client = DataverseClient::connect(params.host(), params.item()).await?;
    let item = params.item();

    let json = match op {
        RecordOperation::Get => return Ok(vec![get(&client, params, &table).await?]),
        RecordOperation::GetMany => return get_many(&client, params, &table).await,
        RecordOperation::Create => create(&client, params, &table).await?,
        RecordOperation::Update => update(&client, params, &table).await?,
        RecordOperation::Upsert => upsert(&client, params, &table).await?,
        RecordOperation::Delete => delete(&client, params, &table).await?,
        RecordOperation::Share => share(&client, params, &table).await?,
        RecordOperation::ShareList => list_shared(&client, params, &table).await?,
        RecordOperation::ShareRevoke => revoke(&client, params, &table).await?,
        RecordOperation::Assign => assign(&client, params, &table).await?,
    };

    Ok(vec![ExecutionItem::new(json, item)])
}

/// Record body from either the `{name, value}` collection or the JSON parameter
fn record_body(
    params: &Params<'_>,
    collection_name: &str,
    json_name: &str,
) -> Result<Map<String, Value>, DataverseError> {
    let mode = params
        .optional_string("fieldsInputMode")
        .unwrap_or_else(|| "collection".to_string());

    match mode.as_str() {
        "json" => match params.raw(json_name) {
            None => Ok(Map::new()),
            Some(Value::Object(map)) => Ok(map),
            Some(Value::String(text)) if text.trim().is_empty() => Ok(Map::new()),
            Some(Value::String(text)) => match serde_json::from_str(&text) {
                Ok(Value::Object(map)) => Ok(map),
                Ok(_) => Err(DataverseError::InvalidParameter(format!(
                    "'{}' must be a JSON object",
                    json_name
                ))),
                Err(e) => Err(DataverseError::InvalidParameter(format!(
                    "'{}' is not valid JSON: {}",
                    json_name, e
                ))),
            },
            Some(_) => Err(DataverseError::InvalidParameter(format!(
                "'{}' must be a JSON object",
                json_name
            ))),
        },
        "collection" => {
            let fields: Vec<FieldValue> = params.collection(collection_name, "field")?;
            Ok(fields_to_object(&fields))
        }
        other => Err(DataverseError::InvalidParameter(format!(
            "Unknown fields input mode '{}'",
            other
        ))),
    }
}

fn record_identifier(
    params: &Params<'_>,
    default: RecordIdType,
) -> Result<(RecordIdType, String), DataverseError> {
    let id_type = match params.optional_string("recordIdType") {
        Some(value) => RecordIdType::parse(&value)?,
        None => default,
    };
    let keys = AlternateKey::from_fields(&params.collection("alternateKeys", "key")?);
    let identifier = build_record_identifier(id_type, params.optional_string("recordId").as_deref(), &keys)?;
    Ok((id_type, identifier))
}

/// Primary key GUID of the addressed record; alternate keys cost one extra GET
async fn record_guid(
    client: &DataverseClient<'_>,
    table: &str,
    id_type: RecordIdType,
    identifier: &str,
    primary_id_attribute: &str,
) -> Result<String, DataverseError> {
    if id_type == RecordIdType::Id {
        return Ok(identifier.to_string());
    }
    let record = client
        .get(
            &record_path(table, identifier),
            &QueryOptions::new().select([primary_id_attribute]),
        )
        .await?;
    record
        .get(primary_id_attribute)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            DataverseError::NotFound(format!(
                "Record {}({}) has no {} value",
                table, identifier, primary_id_attribute
            ))
        })
}

/// Logical name and primary key column of `table`
async fn table_identity(client: &DataverseClient<'_>, table: &str) -> (String, String) {
    match resolve_entity(client, table).await {
        Ok(Some(entity)) => (entity.logical_name, entity.primary_id_attribute),
        Ok(None) | Err(_) => (table.to_string(), format!("{}id", table)),
    }
}

fn success(identifier: &str) -> Value {
    json!({ "success": true, "id": identifier })
}

async fn create(client: &DataverseClient<'_>, params: &Params<'_>, table: &str) -> Result<Value, DataverseError> {
    let body = record_body(params, "fields", "fieldsJson")?;
    tracing::info!("Creating {} record", table);
    client.post(&format!("/{}", table), &Value::Object(body)).await
}

async fn update(client: &DataverseClient<'_>, params: &Params<'_>, table: &str) -> Result<Value, DataverseError> {
    let (_, identifier) = record_identifier(params, RecordIdType::Id)?;
    let body = record_body(params, "updateFields", "updateFieldsJson")?;
    let response = client
        .patch(&record_path(table, &identifier), &Value::Object(body))
        .await?;
    Ok(if response.is_null() { success(&identifier) } else { response })
}

/// PATCH against a key; the server decides between create and update
async fn upsert(client: &DataverseClient<'_>, params: &Params<'_>, table: &str) -> Result<Value, DataverseError> {
    let (_, identifier) = record_identifier(params, RecordIdType::AlternateKey)?;
    let body = record_body(params, "upsertFields", "upsertFieldsJson")?;
    let response = client
        .patch(&record_path(table, &identifier), &Value::Object(body))
        .await?;
    Ok(if response.is_null() { success(&identifier) } else { response })
}

async fn delete(client: &DataverseClient<'_>, params: &Params<'_>, table: &str) -> Result<Value, DataverseError> {
    let (_, identifier) = record_identifier(params, RecordIdType::Id)?;
    client.delete(&record_path(table, &identifier)).await?;
    Ok(success(&identifier))
}

async fn get_many(
    client: &DataverseClient<'_>,
    params: &Params<'_>,
    table: &str,
) -> Result<Vec<ExecutionItem>, DataverseError> {
    let query_type = params
        .optional_string("queryType")
        .unwrap_or_else(|| "odata".to_string());

    let query = match query_type.as_str() {
        "odata" => {
            let mut query = QueryOptions::new().select(
                params
                    .optional_string("selectFields")
                    .map(|s| split_list(&s))
                    .unwrap_or_default(),
            );
            if let Some(filter) = params.optional_string("odataFilter") {
                query = query.filter(filter);
            }
            if let Some(orderby) = params.optional_string("odataOrderBy") {
                query = query.orderby(orderby);
            }
            if let Some(top) = list_limit(params)? {
                query = query.top(top);
            }
            query
        }
        "fetchxml" => QueryOptions::new().param("fetchXml", params.string("fetchXml")?),
        other => {
            return Err(DataverseError::InvalidParameter(format!(
                "Unknown query type '{}'",
                other
            )))
        }
    };

    let rows = client.get_collection(&format!("/{}", table), &query).await?;
    Ok(ExecutionItem::from_rows(rows, params.item()))
}

/// Image download mode of a `get`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageMode {
    None,
    /// Decode the base64 thumbnail already in the response
    Thumbnails,
    /// One extra request per field for the full-size image
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetOptions {
    pub images: ImageMode,
    pub image_field_names: Vec<String>,
    pub download_files: bool,
    pub file_field_names: Vec<String>,
}

impl GetOptions {
    pub fn from_options(options: &Map<String, Value>) -> Self {
        let text = |key: &str| options.get(key).and_then(Value::as_str).unwrap_or_default();
        Self {
            images: match text("downloadImages") {
                "thumbnails" => ImageMode::Thumbnails,
                "full" => ImageMode::Full,
                _ => ImageMode::None,
            },
            image_field_names: split_list(text("imageFieldNames")),
            download_files: options
                .get("downloadFiles")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            file_field_names: split_list(text("fileFieldNames")),
        }
    }
}

async fn get(client: &DataverseClient<'_>, params: &Params<'_>, table: &str) -> Result<ExecutionItem, DataverseError> {
    let (id_type, identifier) = record_identifier(params, RecordIdType::Id)?;
    let query = QueryOptions::new().select(
        params
            .optional_string("selectFields")
            .map(|s| split_list(&s))
            .unwrap_or_default(),
    );
    let record = client.get(&record_path(table, &identifier), &query).await?;
    let mut item = ExecutionItem::new(record, params.item());

    let options = GetOptions::from_options(&params.options());
    if options.images == ImageMode::None && !options.download_files {
        return Ok(item);
    }

    let record_id = match id_type {
        RecordIdType::Id => identifier.clone(),
        RecordIdType::AlternateKey => primary_key_value(&item.json),
    };
    let target = RecordTarget {
        table,
        identifier: &identifier,
        record_id: &record_id,
    };

    if options.images != ImageMode::None {
        attach_images(client, &target, &options, &mut item).await;
    }
    if options.download_files {
        attach_files(client, &target, &options, &mut item).await;
    }

    Ok(item)
}

struct RecordTarget<'a> {
    table: &'a str,
    identifier: &'a str,
    /// Primary key used for file names and the image fallback URL
    record_id: &'a str,
}

/// First `...id` field without an underscore, else `record`
fn primary_key_value(record: &Value) -> String {
    record
        .as_object()
        .and_then(|map| {
            map.iter()
                .find(|(key, _)| key.ends_with("id") && !key.contains('_'))
                .and_then(|(_, value)| value.as_str())
        })
        .unwrap_or("record")
        .to_string()
}

fn has_value(record: &Value, field: &str) -> bool {
    match record.get(field) {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

/// Attachment key for a field: custom-prefixed names (`pub_some_field`) stay whole,
/// `prefix_name` keeps only `name`, and `entityimage` becomes `image`.
pub fn attachment_property_name(field: &str) -> String {
    let name = if field.contains('_') {
        let parts: Vec<&str> = field.split('_').collect();
        if parts.len() > 2 {
            field
        } else {
            parts[parts.len() - 1]
        }
    } else {
        field
    };
    name.replacen("entityimage", "image", 1)
}

/// Guess image columns from the values alone.
///
/// Used only when the metadata lookup failed. Best effort: long strings that start
/// like base64 JPEG/PNG data or whose names look image-like.
pub fn detect_image_fields(record: &Value) -> Vec<String> {
    let map = match record.as_object() {
        Some(map) => map,
        None => return Vec::new(),
    };

    map.iter()
        .filter_map(|(key, value)| {
            let value = value.as_str()?;
            if value.len() <= 100
                || key.contains("_url")
                || key.contains("_timestamp")
                || key.ends_with("id")
                || key.ends_with("name")
            {
                return None;
            }
            let looks_like_image = value.starts_with("/9j/")
                || value.starts_with("iVBOR")
                || key.ends_with("_img")
                || key.ends_with("_image")
                || key.contains("photo")
                || key.contains("picture")
                || key.contains("avatar")
                || key == "entityimage";
            looks_like_image.then(|| key.clone())
        })
        .collect()
}

async fn attach_images(
    client: &DataverseClient<'_>,
    target: &RecordTarget<'_>,
    options: &GetOptions,
    item: &mut ExecutionItem,
) {
    let fields: Vec<String> = if !options.image_field_names.is_empty() {
        options
            .image_field_names
            .iter()
            .filter(|f| has_value(&item.json, f))
            .cloned()
            .collect()
    } else {
        match classify_virtual_fields(client, target.table).await {
            Ok(classified) => classified
                .image_fields
                .into_iter()
                .filter(|f| has_value(&item.json, f))
                .collect(),
            Err(e) => {
                tracing::warn!("Image field metadata unavailable, guessing from values: {}", e);
                detect_image_fields(&item.json)
            }
        }
    };

    for field in fields {
        let data = match options.images {
            ImageMode::Thumbnails => decode_thumbnail(&item.json, &field),
            _ => download_full_image(client, target, &item.json, &field).await,
        };
        match data {
            Ok(data) => {
                let file_name = format!("{}_{}.jpg", target.record_id, field);
                item.binary.insert(
                    attachment_property_name(&field),
                    BinaryAttachment::new(data, file_name, "image/jpeg"),
                );
            }
            Err(e) => tracing::warn!("Failed to download image {}: {}", field, e),
        }
    }
}

fn decode_thumbnail(record: &Value, field: &str) -> Result<Vec<u8>, DataverseError> {
    let data = record
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| DataverseError::Parse(format!("Field {} has no base64 image", field)))?;
    STANDARD
        .decode(data)
        .map_err(|e| DataverseError::Parse(format!("Field {} is not valid base64: {}", field, e)))
}

/// Full-size image via the `<field>_url` hint, or the download page when absent
async fn download_full_image(
    client: &DataverseClient<'_>,
    target: &RecordTarget<'_>,
    record: &Value,
    field: &str,
) -> Result<Vec<u8>, DataverseError> {
    let hint = record
        .get(format!("{}_url", field))
        .and_then(Value::as_str)
        .filter(|url| !url.is_empty());

    let endpoint = match hint {
        Some(url) => full_image_url(url, client.base_url())?,
        None => {
            let logical_name = resolve_logical_name(client, target.table).await;
            format!(
                "/Image/download.aspx?Entity={}&Attribute={}&Id={}&Full=true",
                logical_name, field, target.record_id
            )
        }
    };

    client.download_binary(Method::GET, &endpoint).await
}

/// Ask for the full image and make the hint root-relative.
///
/// Absolute hints must point at the environment itself; only their path and query are kept.
pub fn full_image_url(hint: &str, base_url: &str) -> Result<String, DataverseError> {
    let mut url = if hint.starts_with("https://") || hint.starts_with("http://") {
        let parsed = Url::parse(hint).map_err(|e| DataverseError::Binary {
            url: hint.to_string(),
            message: format!("Invalid image URL: {}", e),
        })?;
        let environment = Url::parse(base_url)
            .map_err(|e| DataverseError::Configuration(format!("Invalid environment URL '{}': {}", base_url, e)))?;
        if parsed.origin() != environment.origin() {
            return Err(DataverseError::Binary {
                url: hint.to_string(),
                message: "Image URL does not belong to the environment".to_string(),
            });
        }
        match parsed.query() {
            Some(query) => format!("{}?{}", parsed.path(), query),
            None => parsed.path().to_string(),
        }
    } else if hint.starts_with('/') {
        hint.to_string()
    } else {
        format!("/{}", hint)
    };

    if !url.contains("Full=") {
        url.push_str(if url.contains('?') { "&Full=true" } else { "?Full=true" });
    }
    Ok(url)
}

async fn attach_files(
    client: &DataverseClient<'_>,
    target: &RecordTarget<'_>,
    options: &GetOptions,
    item: &mut ExecutionItem,
) {
    let fields: Vec<String> = if !options.file_field_names.is_empty() {
        options.file_field_names.clone()
    } else {
        match classify_virtual_fields(client, target.table).await {
            Ok(classified) => classified.file_fields,
            Err(e) => {
                tracing::warn!("File field metadata unavailable, skipping file download: {}", e);
                Vec::new()
            }
        }
    };

    for field in fields {
        let endpoint = format!("{}/{}/$value", record_path(target.table, target.identifier), field);
        match client.download_binary(Method::GET, &endpoint).await {
            Ok(data) => {
                let file_name = item
                    .json
                    .get(format!("{}_name", field))
                    .and_then(Value::as_str)
                    .filter(|n| !n.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{}_{}", target.record_id, field));
                let mime_type = mime_from_file_name(&file_name);
                item.binary.insert(
                    attachment_property_name(&field),
                    BinaryAttachment::new(data, file_name, mime_type),
                );
            }
            Err(e) => tracing::warn!("Failed to download file {}: {}", field, e),
        }
    }
}

fn mime_from_file_name(file_name: &str) -> &'static str {
    let extension = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "txt" => "text/plain",
        "csv" => "text/csv",
        "json" => "application/json",
        "xml" => "application/xml",
        "zip" => "application/zip",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        _ => "application/octet-stream",
    }
}

/// Entity reference for the record in GrantAccess / RevokeAccess bodies
fn target_reference(logical_name: &str, primary_id_attribute: &str, guid: &str) -> Value {
    let mut target = Map::new();
    target.insert(primary_id_attribute.to_string(), Value::String(guid.to_string()));
    target.insert(
        "@odata.type".to_string(),
        Value::String(format!("Microsoft.Dynamics.CRM.{}", logical_name)),
    );
    Value::Object(target)
}

async fn share(client: &DataverseClient<'_>, params: &Params<'_>, table: &str) -> Result<Value, DataverseError> {
    let (id_type, identifier) = record_identifier(params, RecordIdType::Id)?;
    let (logical_name, primary_id) = table_identity(client, table).await;
    let guid = record_guid(client, table, id_type, &identifier, &primary_id).await?;
    let principal = resolve_principal(client, params).await?;

    let names = params.string_list("accessRights");
    let rights = if names.is_empty() {
        AccessRights::READ | AccessRights::WRITE
    } else {
        AccessRights::parse_list(&names)?
    };

    let body = json!({
        "Target": target_reference(&logical_name, &primary_id, &guid),
        "PrincipalAccess": {
            "Principal": principal.to_entity_reference(),
            "AccessMask": rights.to_string(),
        },
    });
    client.post("/GrantAccess", &body).await?;

    tracing::info!("Shared {}({}) with {}", table, guid, principal.id);
    Ok(json!({
        "success": true,
        "recordId": guid,
        "principalId": principal.id,
        "principalType": principal.kind.logical_name(),
        "accessRights": rights.to_string(),
    }))
}

async fn list_shared(client: &DataverseClient<'_>, params: &Params<'_>, table: &str) -> Result<Value, DataverseError> {
    let (id_type, identifier) = record_identifier(params, RecordIdType::Id)?;
    let (_, primary_id) = table_identity(client, table).await;
    let guid = record_guid(client, table, id_type, &identifier, &primary_id).await?;

    let target = format!("{{'@odata.id':'{}({})'}}", table, guid);
    let response = client
        .request(
            Method::GET,
            "/RetrieveSharedPrincipalsAndAccess(Target=@tid)",
            None,
            &[("@tid".to_string(), target)],
        )
        .await?;

    let shared = response
        .get("PrincipalAccesses")
        .cloned()
        .unwrap_or_else(|| Value::Array(Vec::new()));
    let count = shared.as_array().map(Vec::len).unwrap_or(0);

    Ok(json!({
        "recordId": guid,
        "principalAccesses": shared,
        "count": count,
    }))
}

async fn revoke(client: &DataverseClient<'_>, params: &Params<'_>, table: &str) -> Result<Value, DataverseError> {
    let (id_type, identifier) = record_identifier(params, RecordIdType::Id)?;
    let (logical_name, primary_id) = table_identity(client, table).await;
    let guid = record_guid(client, table, id_type, &identifier, &primary_id).await?;
    let principal = resolve_principal(client, params).await?;

    let body = json!({
        "Target": target_reference(&logical_name, &primary_id, &guid),
        "Revokee": principal.to_entity_reference(),
    });
    client.post("/RevokeAccess", &body).await?;

    Ok(json!({
        "success": true,
        "recordId": guid,
        "principalId": principal.id,
        "revoked": true,
    }))
}

async fn assign(client: &DataverseClient<'_>, params: &Params<'_>, table: &str) -> Result<Value, DataverseError> {
    let (_, identifier) = record_identifier(params, RecordIdType::Id)?;
    let principal = resolve_principal(client, params).await?;

    let body = json!({ "ownerid@odata.bind": principal.bind_path() });
    let response = client.patch(&record_path(table, &identifier), &body).await?;

    Ok(if response.is_null() {
        json!({
            "success": true,
            "id": identifier,
            "ownerId": principal.id,
            "ownerType": principal.kind.logical_name(),
        })
    } else {
        response
    })
}
