//! Record addressing and field helpers

use crate::odata::DataverseError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// How a record is addressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordIdType {
    Id,
    AlternateKey,
}

impl RecordIdType {
    pub fn parse(value: &str) -> Result<Self, DataverseError> {
        match value {
            "id" => Ok(RecordIdType::Id),
            "alternateKey" => Ok(RecordIdType::AlternateKey),
            other => Err(DataverseError::InvalidParameter(format!(
                "Unknown record identifier type '{}'",
                other
            ))),
        }
    }
}

/// A `{name, value}` pair as supplied by the host
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FieldValue {
    pub name: String,
    #[serde(default)]
    pub value: Value,
}

/// One component of a composite alternate key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlternateKey {
    pub name: String,
    pub value: String,
}

impl AlternateKey {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Convert host pairs; empty names are dropped
    pub fn from_fields(fields: &[FieldValue]) -> Vec<Self> {
        fields
            .iter()
            .filter(|f| !f.name.trim().is_empty())
            .map(|f| Self::new(f.name.trim(), value_as_key_text(&f.value)))
            .collect()
    }
}

fn value_as_key_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Quote a string literal for OData: `'` becomes `''`
pub fn escape_odata_string(value: &str) -> String {
    value.replace('\'', "''")
}

/// Build the parenthesized identifier of a record: a GUID or `k1='v1',k2='v2'`
pub fn build_record_identifier(
    id_type: RecordIdType,
    record_id: Option<&str>,
    keys: &[AlternateKey],
) -> Result<String, DataverseError> {
    match id_type {
        RecordIdType::Id => {
            let id = record_id
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .ok_or_else(|| DataverseError::missing_parameter("recordId"))?;
            Ok(id.trim_start_matches('{').trim_end_matches('}').to_string())
        }
        RecordIdType::AlternateKey => {
            if keys.is_empty() {
                return Err(DataverseError::InvalidParameter(
                    "At least one alternate key is required".to_string(),
                ));
            }
            Ok(keys
                .iter()
                .map(|k| format!("{}='{}'", k.name, escape_odata_string(&k.value)))
                .collect::<Vec<_>>()
                .join(","))
        }
    }
}

/// Parse a composite key string back into its pairs.
///
/// Quoted values may contain commas and doubled quotes; unquoted values (numbers,
/// GUIDs) run to the next comma.
pub fn parse_alternate_key(input: &str) -> Result<Vec<AlternateKey>, DataverseError> {
    let invalid = |why: &str| DataverseError::Parse(format!("Invalid alternate key '{}': {}", input, why));
    let mut keys = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        let mut name = String::new();
        for c in chars.by_ref() {
            if c == '=' {
                break;
            }
            name.push(c);
        }
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(invalid("missing key name"));
        }

        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }

        let mut value = String::new();
        if chars.peek() == Some(&'\'') {
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                if c == '\'' {
                    if chars.peek() == Some(&'\'') {
                        chars.next();
                        value.push('\'');
                    } else {
                        closed = true;
                        break;
                    }
                } else {
                    value.push(c);
                }
            }
            if !closed {
                return Err(invalid("unterminated quote"));
            }
            while chars.peek().is_some_and(|c| c.is_whitespace()) {
                chars.next();
            }
            match chars.next() {
                None => {
                    keys.push(AlternateKey::new(name, value));
                    break;
                }
                Some(',') => keys.push(AlternateKey::new(name, value)),
                Some(_) => return Err(invalid("unexpected text after quoted value")),
            }
        } else {
            let mut ended = true;
            for c in chars.by_ref() {
                if c == ',' {
                    ended = false;
                    break;
                }
                value.push(c);
            }
            keys.push(AlternateKey::new(name, value.trim()));
            if ended {
                break;
            }
        }
    }

    Ok(keys)
}

/// Collapse `{name, value}` pairs into a record body. Values are not coerced.
pub fn fields_to_object(fields: &[FieldValue]) -> Map<String, Value> {
    fields
        .iter()
        .filter(|f| !f.name.is_empty())
        .map(|f| (f.name.clone(), f.value.clone()))
        .collect()
}

/// `/<entitySet>(<identifier>)`
pub fn record_path(entity_set: &str, identifier: &str) -> String {
    format!("/{}({})", entity_set, identifier)
}
