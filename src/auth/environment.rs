//! Per-call environment resolution
//!
//! Decides, for one input item, which environment URL to talk to and how the bearer
//! token gets attached: either a caller-supplied override or the host's stored grant.

use crate::host::{Host, Params};
use crate::odata::DataverseError;
use serde::Deserialize;
use serde_json::{Map, Value};

/// Connection overrides read from the item's `options`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionOptions {
    pub use_custom_auth: bool,
    pub custom_environment_url: String,
    pub access_token: String,
}

impl ConnectionOptions {
    /// Read the connection keys out of an `options` map; other keys are ignored
    pub fn from_options(options: &Map<String, Value>) -> Result<Self, DataverseError> {
        let parsed: Self = serde_json::from_value(Value::Object(options.clone()))
            .map_err(|e| DataverseError::Configuration(format!("Invalid connection options: {}", e)))?;
        Ok(Self {
            use_custom_auth: parsed.use_custom_auth,
            custom_environment_url: parsed.custom_environment_url.trim().to_string(),
            access_token: parsed.access_token.trim().to_string(),
        })
    }
}

/// How requests to the environment are authorized
#[derive(Clone, PartialEq, Eq)]
pub enum EnvironmentAuth {
    /// Caller-supplied override token
    Bearer(String),
    /// The host's credential-injecting transport
    Host,
}

impl std::fmt::Debug for EnvironmentAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvironmentAuth::Bearer(_) => f.write_str("Bearer(<redacted>)"),
            EnvironmentAuth::Host => f.write_str("Host"),
        }
    }
}

/// Resolved target of one logical call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    /// Environment root, without trailing slash
    pub base_url: String,
    pub auth: EnvironmentAuth,
}

impl Environment {
    pub fn new(base_url: &str, auth: EnvironmentAuth) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
        }
    }

    pub fn is_custom(&self) -> bool {
        matches!(self.auth, EnvironmentAuth::Bearer(_))
    }
}

/// Resolve the environment for one input item.
///
/// Re-run for every item; nothing is cached.
pub async fn resolve_environment(host: &dyn Host, item: usize) -> Result<Environment, DataverseError> {
    let options = ConnectionOptions::from_options(&Params::new(host, item).options())?;

    if options.use_custom_auth {
        if options.custom_environment_url.is_empty() {
            return Err(DataverseError::Configuration(
                "Environment URL is required when using custom authentication. Please add it in the Options."
                    .to_string(),
            ));
        }
        if options.access_token.is_empty() {
            return Err(DataverseError::Configuration(
                "Access Token is required when using custom authentication. Please add it in the Options."
                    .to_string(),
            ));
        }
        tracing::debug!("Using custom authentication for {}", options.custom_environment_url);
        return Ok(Environment::new(
            &options.custom_environment_url,
            EnvironmentAuth::Bearer(options.access_token),
        ));
    }

    let credentials = host.credentials().await.ok_or_else(|| {
        DataverseError::Configuration(
            "OAuth2 credentials are required. Please configure Dataverse OAuth2 API credentials."
                .to_string(),
        )
    })?;

    if credentials.environment_url.trim().is_empty() {
        return Err(DataverseError::Configuration(
            "Environment URL is missing from the OAuth2 credentials.".to_string(),
        ));
    }

    Ok(Environment::new(&credentials.environment_url, EnvironmentAuth::Host))
}
