//! MCP Server implementation for Dataverse
//!
//! Ships the connector as a Model Context Protocol server over stdio

pub mod load_options;
pub mod protocol;
mod server;

pub use load_options::PropertyOption;
pub use protocol::*;
pub use server::{DataverseMcpServer, ToolCallHost};
