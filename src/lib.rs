//! Dataverse Connector Library
//!
//! Request/translation layer for the Microsoft Dataverse Web API (OData v4) and its
//! TDS SQL endpoint, plus a Model Context Protocol server that hosts it.

pub mod auth;
pub mod config;
pub mod host;
pub mod mcp;
pub mod odata;
pub mod operations;

pub use auth::{DataverseCredentials, OAuthSession};
pub use config::{Config, RuntimeConfig};
pub use host::{ExecutionItem, Host, Params};
pub use odata::{DataverseClient, DataverseError, QueryOptions};
pub use operations::{execute, BatchError, Resource};
