//! Metadata resolver
//!
//! Read-only, uncached lookups against `/EntityDefinitions`. Every function returns a
//! `Result`; flattening failures into UI placeholder rows happens in
//! [`crate::mcp::load_options`], not here.

use crate::odata::client::{DataverseClient, QueryOptions};
use crate::odata::query::escape_odata_string;
use crate::odata::DataverseError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};

/// Attribute types that carry an option set
pub const CHOICE_ATTRIBUTE_TYPES: &[&str] = &["Picklist", "State", "Status"];

/// `{"UserLocalizedLabel": {"Label": ...}}`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Label {
    #[serde(default)]
    pub user_localized_label: Option<LocalizedLabel>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LocalizedLabel {
    #[serde(default)]
    pub label: Option<String>,
}

impl Label {
    pub fn text(&self) -> Option<&str> {
        self.user_localized_label
            .as_ref()
            .and_then(|l| l.label.as_deref())
            .filter(|l| !l.is_empty())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EntityDefinition {
    logical_name: String,
    #[serde(default)]
    entity_set_name: Option<String>,
    #[serde(default)]
    display_name: Option<Label>,
    #[serde(default)]
    primary_id_attribute: Option<String>,
}

/// A table as seen by the metadata API
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityDescriptor {
    pub logical_name: String,
    pub entity_set_name: String,
    pub display_name: String,
    /// Primary key column, `<logicalName>id` when the API does not say
    pub primary_id_attribute: String,
}

impl From<EntityDefinition> for EntityDescriptor {
    fn from(def: EntityDefinition) -> Self {
        let display_name = def
            .display_name
            .as_ref()
            .and_then(Label::text)
            .unwrap_or(def.logical_name.as_str())
            .to_string();
        Self {
            entity_set_name: def
                .entity_set_name
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| def.logical_name.clone()),
            primary_id_attribute: def
                .primary_id_attribute
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| format!("{}id", def.logical_name)),
            logical_name: def.logical_name,
            display_name,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AttributeDefinition {
    logical_name: String,
    #[serde(default)]
    display_name: Option<Label>,
    #[serde(default)]
    attribute_type: Option<String>,
    #[serde(default)]
    is_valid_for_create: Option<bool>,
    #[serde(default)]
    is_valid_for_update: Option<bool>,
    #[serde(default)]
    is_valid_for_read: Option<bool>,
}

/// A column as seen by the metadata API
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeDescriptor {
    pub logical_name: String,
    pub display_name: String,
    pub attribute_type: Option<String>,
    pub is_valid_for_create: bool,
    pub is_valid_for_update: bool,
    pub is_valid_for_read: bool,
}

impl AttributeDescriptor {
    pub fn new(logical_name: impl Into<String>, attribute_type: Option<&str>) -> Self {
        let logical_name = logical_name.into();
        Self {
            display_name: logical_name.clone(),
            logical_name,
            attribute_type: attribute_type.map(str::to_string),
            is_valid_for_create: false,
            is_valid_for_update: false,
            is_valid_for_read: true,
        }
    }

    /// `C`, `U`, `R` for each capability flag that is set
    pub fn capability_flags(&self) -> String {
        let mut flags = String::new();
        if self.is_valid_for_create {
            flags.push('C');
        }
        if self.is_valid_for_update {
            flags.push('U');
        }
        if self.is_valid_for_read {
            flags.push('R');
        }
        flags
    }
}

impl From<AttributeDefinition> for AttributeDescriptor {
    fn from(def: AttributeDefinition) -> Self {
        let display_name = def
            .display_name
            .as_ref()
            .and_then(Label::text)
            .unwrap_or(def.logical_name.as_str())
            .to_string();
        Self {
            logical_name: def.logical_name,
            display_name,
            attribute_type: def.attribute_type,
            is_valid_for_create: def.is_valid_for_create.unwrap_or(false),
            is_valid_for_update: def.is_valid_for_update.unwrap_or(false),
            is_valid_for_read: def.is_valid_for_read.unwrap_or(false),
        }
    }
}

/// Image and file columns of a table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualFields {
    pub image_fields: Vec<String>,
    pub file_fields: Vec<String>,
}

/// Where a choice column gets its options from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ChoiceType {
    Local,
    Global { name: String },
    /// Not a choice column at all
    Unsupported { attribute_type: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChoiceOption {
    pub value: i64,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChoiceOptions {
    pub choice_type: ChoiceType,
    pub options: Vec<ChoiceOption>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawOption {
    value: i64,
    #[serde(default)]
    label: Option<Label>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawOptionSet {
    #[serde(default)]
    options: Option<Vec<RawOption>>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ChoiceAttribute {
    #[serde(default)]
    attribute_type: Option<String>,
    #[serde(default)]
    option_set: Option<RawOptionSet>,
    #[serde(default)]
    global_option_set: Option<RawOptionSet>,
}

fn entity_definition_path(logical_name: &str) -> String {
    format!(
        "/EntityDefinitions(LogicalName='{}')",
        escape_odata_string(logical_name)
    )
}

/// Look up a table by entity set name
pub async fn resolve_entity(
    client: &DataverseClient<'_>,
    entity_set_name: &str,
) -> Result<Option<EntityDescriptor>, DataverseError> {
    let query = QueryOptions::new()
        .select(["LogicalName", "EntitySetName", "DisplayName", "PrimaryIdAttribute"])
        .filter(format!(
            "EntitySetName eq '{}'",
            escape_odata_string(entity_set_name)
        ));
    let rows = client.get_collection("/EntityDefinitions", &query).await?;

    match rows.into_iter().next() {
        Some(row) => {
            let def: EntityDefinition = serde_json::from_value(row)
                .map_err(|e| DataverseError::Parse(format!("Invalid entity definition: {}", e)))?;
            Ok(Some(def.into()))
        }
        None => Ok(None),
    }
}

/// Entity set name to logical name. Best effort: any failure or an empty result
/// falls back to the input, which is then assumed to be a logical name already.
pub async fn resolve_logical_name(client: &DataverseClient<'_>, table: &str) -> String {
    match resolve_entity(client, table).await {
        Ok(Some(entity)) => entity.logical_name,
        Ok(None) => table.to_string(),
        Err(e) => {
            tracing::debug!("Logical name lookup for '{}' failed, using as-is: {}", table, e);
            table.to_string()
        }
    }
}

/// Tables valid for advanced find
pub async fn list_tables(client: &DataverseClient<'_>) -> Result<Vec<EntityDescriptor>, DataverseError> {
    let query = QueryOptions::new()
        .select(["LogicalName", "EntitySetName", "DisplayName"])
        .filter("IsValidForAdvancedFind eq true");
    let rows = client.get_collection("/EntityDefinitions", &query).await?;

    rows.into_iter()
        .map(|row| {
            serde_json::from_value::<EntityDefinition>(row)
                .map(EntityDescriptor::from)
                .map_err(|e| DataverseError::Parse(format!("Invalid entity definition: {}", e)))
        })
        .collect()
}

/// Attributes of a table, ordered by logical name
pub async fn list_attributes(
    client: &DataverseClient<'_>,
    logical_name: &str,
    filter_readable: bool,
) -> Result<Vec<AttributeDescriptor>, DataverseError> {
    let mut query = QueryOptions::new()
        .select([
            "LogicalName",
            "DisplayName",
            "AttributeType",
            "IsValidForCreate",
            "IsValidForUpdate",
            "IsValidForRead",
        ])
        .orderby("LogicalName");
    if filter_readable {
        query = query.filter("IsValidForRead eq true");
    }

    let path = format!("{}/Attributes", entity_definition_path(logical_name));
    let rows = client.get_collection(&path, &query).await?;

    rows.into_iter()
        .map(|row| {
            serde_json::from_value::<AttributeDefinition>(row)
                .map(AttributeDescriptor::from)
                .map_err(|e| DataverseError::Parse(format!("Invalid attribute definition: {}", e)))
        })
        .collect()
}

/// Every column that takes part in any alternate key of the table
pub async fn list_alternate_keys(
    client: &DataverseClient<'_>,
    logical_name: &str,
) -> Result<BTreeSet<String>, DataverseError> {
    let query = QueryOptions::new()
        .select(["LogicalName"])
        .expand("Keys($select=LogicalName,KeyAttributes)");
    let body = client.get(&entity_definition_path(logical_name), &query).await?;
    Ok(key_attribute_names(&body))
}

/// `KeyAttributes` comes back either as plain strings or as `{LogicalName}` objects
fn key_attribute_names(entity: &Value) -> BTreeSet<String> {
    let keys = match entity.get("Keys").and_then(Value::as_array) {
        Some(keys) => keys,
        None => return BTreeSet::new(),
    };

    keys.iter()
        .filter_map(|key| key.get("KeyAttributes").and_then(Value::as_array))
        .flatten()
        .filter_map(|attr| match attr {
            Value::String(name) => Some(name.as_str()),
            other => other.get("LogicalName").and_then(Value::as_str),
        })
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// Split Virtual attributes into image and file columns by their companion fields:
/// `<f>_url` plus `<f>_timestamp` marks an image, otherwise `<f>_name` marks a file.
pub fn classify_attributes(attributes: &[AttributeDescriptor]) -> VirtualFields {
    let names: HashSet<&str> = attributes.iter().map(|a| a.logical_name.as_str()).collect();
    let mut fields = VirtualFields::default();

    for attr in attributes {
        if attr.attribute_type.as_deref() != Some("Virtual") || attr.logical_name.is_empty() {
            continue;
        }
        let name = attr.logical_name.as_str();
        let has = |suffix: &str| names.contains(format!("{}{}", name, suffix).as_str());

        if has("_url") && has("_timestamp") {
            fields.image_fields.push(name.to_string());
        } else if has("_name") {
            fields.file_fields.push(name.to_string());
        }
    }

    fields
}

/// Image and file columns of `table` (entity set or logical name)
pub async fn classify_virtual_fields(
    client: &DataverseClient<'_>,
    table: &str,
) -> Result<VirtualFields, DataverseError> {
    let logical_name = resolve_logical_name(client, table).await;
    let attributes = list_attributes(client, &logical_name, false).await?;
    Ok(classify_attributes(&attributes))
}

/// Options of a choice column, local or global
pub async fn list_choice_options(
    client: &DataverseClient<'_>,
    logical_name: &str,
    field_name: &str,
) -> Result<ChoiceOptions, DataverseError> {
    let query = QueryOptions::new()
        .select(["LogicalName", "AttributeType"])
        .expand("OptionSet($select=Options),GlobalOptionSet($select=Options,Name)");
    let path = format!(
        "{}/Attributes(LogicalName='{}')",
        entity_definition_path(logical_name),
        escape_odata_string(field_name)
    );
    let body = client.get(&path, &query).await?;
    let attribute: ChoiceAttribute = serde_json::from_value(body)
        .map_err(|e| DataverseError::Parse(format!("Invalid attribute definition: {}", e)))?;

    Ok(choice_options_from(attribute))
}

fn choice_options_from(attribute: ChoiceAttribute) -> ChoiceOptions {
    let attribute_type = attribute.attribute_type.unwrap_or_default();
    if !CHOICE_ATTRIBUTE_TYPES.contains(&attribute_type.as_str()) {
        return ChoiceOptions {
            choice_type: ChoiceType::Unsupported { attribute_type },
            options: Vec::new(),
        };
    }

    // Only one of the two is populated
    let (choice_type, raw) = match (attribute.option_set, attribute.global_option_set) {
        (Some(RawOptionSet { options: Some(options), .. }), _) => (ChoiceType::Local, options),
        (_, Some(RawOptionSet { options: Some(options), name })) => (
            ChoiceType::Global {
                name: name.unwrap_or_default(),
            },
            options,
        ),
        _ => (ChoiceType::Local, Vec::new()),
    };

    let options = raw
        .into_iter()
        .map(|option| ChoiceOption {
            label: option
                .label
                .as_ref()
                .and_then(Label::text)
                .map(str::to_string)
                .unwrap_or_else(|| format!("Option {}", option.value)),
            value: option.value,
        })
        .collect();

    ChoiceOptions { choice_type, options }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attr(name: &str, ty: &str) -> AttributeDescriptor {
        AttributeDescriptor::new(name, Some(ty))
    }

    #[test]
    fn test_classify_image_and_file() {
        let attributes = vec![
            attr("entityimage", "Virtual"),
            attr("entityimage_url", "String"),
            attr("entityimage_timestamp", "BigInt"),
            attr("cr1b_contract", "Virtual"),
            attr("cr1b_contract_name", "String"),
            attr("name", "String"),
        ];
        let fields = classify_attributes(&attributes);
        assert_eq!(fields.image_fields, vec!["entityimage"]);
        assert_eq!(fields.file_fields, vec!["cr1b_contract"]);
    }

    #[test]
    fn test_classify_image_wins_over_file() {
        let attributes = vec![
            attr("cr1b_photo", "Virtual"),
            attr("cr1b_photo_url", "String"),
            attr("cr1b_photo_timestamp", "BigInt"),
            attr("cr1b_photo_name", "String"),
        ];
        let fields = classify_attributes(&attributes);
        assert_eq!(fields.image_fields, vec!["cr1b_photo"]);
        assert!(fields.file_fields.is_empty());
    }

    #[test]
    fn test_classify_ignores_non_virtual() {
        let attributes = vec![
            attr("cr1b_doc", "String"),
            attr("cr1b_doc_name", "String"),
            attr("cr1b_half", "Virtual"),
            attr("cr1b_half_url", "String"),
        ];
        assert_eq!(classify_attributes(&attributes), VirtualFields::default());
    }

    #[test]
    fn test_key_attribute_names_mixed_shapes() {
        let entity = json!({
            "LogicalName": "contact",
            "Keys": [
                {"LogicalName": "k1", "KeyAttributes": ["emailaddress1", "lastname"]},
                {"LogicalName": "k2", "KeyAttributes": [{"LogicalName": "emailaddress1"}, {"LogicalName": "employeeid"}]},
                {"LogicalName": "k3"}
            ]
        });
        let names: Vec<_> = key_attribute_names(&entity).into_iter().collect();
        assert_eq!(names, vec!["emailaddress1", "employeeid", "lastname"]);
        assert!(key_attribute_names(&json!({})).is_empty());
    }

    #[test]
    fn test_entity_descriptor_display_fallback() {
        let def: EntityDefinition = serde_json::from_value(json!({
            "LogicalName": "account",
            "EntitySetName": "accounts",
            "DisplayName": {"UserLocalizedLabel": null}
        }))
        .unwrap();
        let entity = EntityDescriptor::from(def);
        assert_eq!(entity.display_name, "account");
        assert_eq!(entity.entity_set_name, "accounts");
        assert_eq!(entity.primary_id_attribute, "accountid");
    }

    #[test]
    fn test_attribute_flags() {
        let def: AttributeDefinition = serde_json::from_value(json!({
            "LogicalName": "name",
            "DisplayName": {"UserLocalizedLabel": {"Label": "Account Name"}},
            "AttributeType": "String",
            "IsValidForCreate": true,
            "IsValidForUpdate": false,
            "IsValidForRead": true
        }))
        .unwrap();
        let attribute = AttributeDescriptor::from(def);
        assert_eq!(attribute.display_name, "Account Name");
        assert_eq!(attribute.capability_flags(), "CR");
    }

    #[test]
    fn test_choice_options_local() {
        let attribute: ChoiceAttribute = serde_json::from_value(json!({
            "AttributeType": "Picklist",
            "OptionSet": {"Options": [
                {"Value": 1, "Label": {"UserLocalizedLabel": {"Label": "Preferred"}}},
                {"Value": 2, "Label": {"UserLocalizedLabel": null}}
            ]},
            "GlobalOptionSet": null
        }))
        .unwrap();
        let choices = choice_options_from(attribute);
        assert_eq!(choices.choice_type, ChoiceType::Local);
        assert_eq!(choices.options[0].label, "Preferred");
        assert_eq!(choices.options[1].label, "Option 2");
    }

    #[test]
    fn test_choice_options_global() {
        let attribute: ChoiceAttribute = serde_json::from_value(json!({
            "AttributeType": "Picklist",
            "OptionSet": null,
            "GlobalOptionSet": {"Name": "cr1b_colors", "Options": [{"Value": 100, "Label": {"UserLocalizedLabel": {"Label": "Red"}}}]}
        }))
        .unwrap();
        let choices = choice_options_from(attribute);
        assert_eq!(
            choices.choice_type,
            ChoiceType::Global {
                name: "cr1b_colors".to_string()
            }
        );
        assert_eq!(choices.options.len(), 1);
    }

    #[test]
    fn test_choice_options_rejects_non_choice() {
        let attribute: ChoiceAttribute =
            serde_json::from_value(json!({"AttributeType": "String"})).unwrap();
        let choices = choice_options_from(attribute);
        assert_eq!(
            choices.choice_type,
            ChoiceType::Unsupported {
                attribute_type: "String".to_string()
            }
        );
        assert!(choices.options.is_empty());
    }
}
