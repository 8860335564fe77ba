//! Metadata lookups for interactive pickers
//!
//! Each lookup returns display rows. Failures never propagate: they turn into
//! placeholder rows with an empty value so a picker can still render something.

use crate::host::{Host, Params, TableLocator};
use crate::odata::client::DataverseClient;
use crate::odata::metadata::{
    list_alternate_keys, list_attributes, list_choice_options, list_tables, resolve_logical_name,
    ChoiceType,
};
use crate::odata::DataverseError;
use serde::Serialize;

/// One picker row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PropertyOption {
    pub name: String,
    pub value: String,
}

impl PropertyOption {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Informational row that cannot be selected
    pub fn placeholder(name: impl Into<String>) -> Self {
        Self::new(name, "")
    }
}

const REFERENCE_ONLY: &str = "Note: This is reference only - you can still execute the workflow";

/// The selected table, or `None` when nothing usable was picked
fn selected_table(params: &Params<'_>) -> Option<String> {
    let value = params.raw("table")?;
    TableLocator::from_value(&value)
        .ok()
        .map(TableLocator::into_table_name)
}

fn select_table_first() -> Vec<PropertyOption> {
    vec![PropertyOption::placeholder("Please select a table first")]
}

/// Tables valid for advanced find as `"<Display> (<logical>)"`, sorted by name.
///
/// `filter` matches case-insensitively on the row name, the entity set name or the
/// logical name.
pub async fn search_tables(host: &dyn Host, item: usize, filter: Option<&str>) -> Vec<PropertyOption> {
    let result = async {
        let client = DataverseClient::connect(host, item).await?;
        list_tables(&client).await
    }
    .await;

    let tables = match result {
        Ok(tables) => tables,
        Err(e) => {
            let mut rows = vec![PropertyOption::placeholder(format!("⚠️ Failed to load tables: {}", e))];
            if e.is_auth_failure() {
                rows.push(PropertyOption::placeholder(
                    "Please check your credentials and re-authenticate",
                ));
            }
            return rows;
        }
    };

    let needle = filter.map(str::to_lowercase).filter(|f| !f.is_empty());
    let mut rows: Vec<PropertyOption> = tables
        .into_iter()
        .map(|table| {
            let name = format!("{} ({})", table.display_name, table.logical_name);
            (name, table.entity_set_name, table.logical_name)
        })
        .filter(|(name, value, logical)| match &needle {
            Some(needle) => {
                name.to_lowercase().contains(needle)
                    || value.to_lowercase().contains(needle)
                    || logical.to_lowercase().contains(needle)
            }
            None => true,
        })
        .map(|(name, value, _)| PropertyOption::new(name, value))
        .collect();

    rows.sort_by(|a, b| a.name.cmp(&b.name));
    rows
}

/// Readable columns as `"<Display> (<logical>) - <Type> [CUR]"`
pub async fn table_fields_for_display(host: &dyn Host, item: usize) -> Vec<PropertyOption> {
    let params = Params::new(host, item);
    let table = match selected_table(&params) {
        Some(table) => table,
        None => return select_table_first(),
    };

    let client = match DataverseClient::connect(host, item).await {
        Ok(client) => client,
        Err(e) => {
            return vec![
                PropertyOption::placeholder(format!("⚠️ Error: {}", e)),
                PropertyOption::placeholder("Please check your credentials and table selection"),
            ]
        }
    };

    let logical_name = resolve_logical_name(&client, &table).await;
    let attributes = match list_attributes(&client, &logical_name, true).await {
        Ok(attributes) => attributes,
        Err(e) if e.is_auth_failure() => {
            return vec![
                PropertyOption::placeholder("⚠️ Authentication failed - field list unavailable"),
                PropertyOption::placeholder(
                    "Workaround: Execute the node once, then close and reopen to refresh the list",
                ),
                PropertyOption::placeholder(REFERENCE_ONLY),
            ]
        }
        Err(e) => {
            return vec![
                PropertyOption::placeholder(format!("⚠️ Could not load fields for table: {}", table)),
                PropertyOption::placeholder(format!("Error: {}", e)),
                PropertyOption::placeholder(REFERENCE_ONLY),
            ]
        }
    };

    if attributes.is_empty() {
        return vec![PropertyOption::placeholder("No fields found for this table")];
    }

    attributes
        .into_iter()
        .map(|attr| {
            let flags = attr.capability_flags();
            let flags = if flags.is_empty() {
                String::new()
            } else {
                format!(" [{}]", flags)
            };
            let name = format!(
                "{} ({}) - {}{}",
                attr.display_name,
                attr.logical_name,
                attr.attribute_type.as_deref().unwrap_or("Unknown"),
                flags
            );
            PropertyOption::new(name, attr.logical_name)
        })
        .collect()
}

/// Readable columns for field-name inputs, `"<Display> (<logical>) - <Type>"`
pub async fn table_field_names(host: &dyn Host, item: usize) -> Vec<PropertyOption> {
    let params = Params::new(host, item);
    let table = match selected_table(&params) {
        Some(table) => table,
        None => return select_table_first(),
    };

    let result = async {
        let client = DataverseClient::connect(host, item).await?;
        let logical_name = resolve_logical_name(&client, &table).await;
        list_attributes(&client, &logical_name, true).await
    }
    .await;

    match result {
        Ok(attributes) if attributes.is_empty() => vec![PropertyOption::placeholder("No fields found")],
        Ok(attributes) => attributes
            .into_iter()
            .map(|attr| {
                let name = format!(
                    "{} ({}) - {}",
                    attr.display_name,
                    attr.logical_name,
                    attr.attribute_type.as_deref().unwrap_or("Unknown")
                );
                PropertyOption::new(name, attr.logical_name)
            })
            .collect(),
        Err(e) => vec![PropertyOption::placeholder(format!("Error loading fields: {}", e))],
    }
}

/// Columns that take part in any alternate key, sorted
pub async fn alternate_key_fields(host: &dyn Host, item: usize) -> Vec<PropertyOption> {
    let params = Params::new(host, item);
    let table = match selected_table(&params) {
        Some(table) => table,
        None => return select_table_first(),
    };

    let client = match DataverseClient::connect(host, item).await {
        Ok(client) => client,
        Err(e) => {
            return vec![PropertyOption::placeholder(format!(
                "Error loading alternate keys: {}",
                e
            ))]
        }
    };

    let logical_name = resolve_logical_name(&client, &table).await;
    match list_alternate_keys(&client, &logical_name).await {
        Ok(fields) if fields.is_empty() => vec![
            PropertyOption::placeholder("⚠️ No alternate keys defined on this table"),
            PropertyOption::placeholder(
                "Tip: Define alternate keys in Dataverse or type field name manually",
            ),
        ],
        Ok(fields) => fields
            .into_iter()
            .map(|field| PropertyOption::new(field.clone(), field))
            .collect(),
        Err(e) => vec![
            PropertyOption::placeholder(format!("⚠️ Could not load alternate keys: {}", e)),
            PropertyOption::placeholder("Tip: You can still type the field name manually"),
        ],
    }
}

/// Options of the choice column named by `viewChoiceField`
pub async fn choice_field_options(host: &dyn Host, item: usize) -> Vec<PropertyOption> {
    let params = Params::new(host, item);
    let table = match selected_table(&params) {
        Some(table) => table,
        None => return select_table_first(),
    };
    let field = match params.optional_string("viewChoiceField") {
        Some(field) => field,
        None => {
            return vec![PropertyOption::placeholder(
                "Please select a field to view its options",
            )]
        }
    };

    let client = match DataverseClient::connect(host, item).await {
        Ok(client) => client,
        Err(e) => return choice_error(&e),
    };

    let logical_name = resolve_logical_name(&client, &table).await;
    let choices = match list_choice_options(&client, &logical_name, &field).await {
        Ok(choices) => choices,
        Err(e) => {
            return vec![
                PropertyOption::placeholder(format!("⚠️ Could not load field: {}", field)),
                PropertyOption::placeholder(format!("Error: {}", e)),
            ]
        }
    };

    let header = match choices.choice_type {
        ChoiceType::Unsupported { attribute_type } => {
            return vec![
                PropertyOption::placeholder(format!("⚠️ Field \"{}\" is not a choice field", field)),
                PropertyOption::placeholder(format!("Type: {}", attribute_type)),
            ]
        }
        ChoiceType::Local => "Local Choice".to_string(),
        ChoiceType::Global { name } => format!("Global Choice ({})", name),
    };

    if choices.options.is_empty() {
        return vec![PropertyOption::placeholder("No options available for this field")];
    }

    let mut rows = vec![PropertyOption::placeholder(format!("━━━ {} ━━━", header))];
    rows.extend(choices.options.into_iter().map(|option| {
        PropertyOption::new(
            format!("{} ({})", option.label, option.value),
            option.value.to_string(),
        )
    }));
    rows
}

fn choice_error(error: &DataverseError) -> Vec<PropertyOption> {
    vec![
        PropertyOption::placeholder("⚠️ Error loading choice options"),
        PropertyOption::placeholder(error.to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_has_empty_value() {
        let row = PropertyOption::placeholder("Please select a table first");
        assert_eq!(row.value, "");
        assert_eq!(
            serde_json::to_value(&row).unwrap(),
            serde_json::json!({"name": "Please select a table first", "value": ""})
        );
    }

    #[test]
    fn test_choice_error_rows() {
        let rows = choice_error(&DataverseError::Configuration("no credentials".to_string()));
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, "⚠️ Error loading choice options");
        assert_eq!(rows[1].name, "Configuration error: no credentials");
    }
}
