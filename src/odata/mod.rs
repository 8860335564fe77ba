//! OData module
//!
//! Request builder, error model, metadata resolver and record addressing for the
//! Dataverse Web API

pub mod client;
pub mod error;
pub mod metadata;
pub mod query;

pub use client::{resolve_url, DataverseClient, ODataResponse, QueryOptions, API_PATH};
pub use error::{normalize_error, DataverseError, ProviderError, SqlError};
pub use metadata::{
    AttributeDescriptor, ChoiceOption, ChoiceOptions, ChoiceType, EntityDescriptor, VirtualFields,
};
pub use query::{
    build_record_identifier, fields_to_object, parse_alternate_key, AlternateKey, FieldValue,
    RecordIdType,
};
