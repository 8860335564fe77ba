//! Configuration
//!
//! TOML file plus environment overrides, validated into a [`RuntimeConfig`].
//!
//! ```toml
//! environment_url = "https://contoso.crm.dynamics.com"
//!
//! [oauth]
//! client_id = "00000000-0000-0000-0000-000000000000"
//! tenant_id = "common"
//!
//! [token]
//! access_token = "..."
//! refresh_token = "..."
//!
//! [settings]
//! max_retries = 3
//! log_level = "warn"
//! ```

use crate::auth::{OAuth2Settings, OAuthTokenData};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const CONFIG_ENV_VAR: &str = "DATAVERSE_MCP_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "dataverse-mcp.toml";
pub const DEFAULT_LOG_LEVEL: &str = "warn";

/// On-disk configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub environment_url: Option<String>,
    pub oauth: OAuthConfig,
    pub token: TokenConfig,
    pub settings: Settings,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub tenant_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    /// Unix timestamp (seconds)
    pub expires_at: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub timeout_secs: u64,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
            timeout_secs: 120,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

/// Validated configuration used at runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// `None` means every call must supply custom auth options
    pub environment_url: Option<String>,
    pub oauth: Option<OAuth2Settings>,
    pub token: Option<OAuthTokenData>,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub timeout_secs: u64,
    pub log_level: String,
}

impl Config {
    /// Load from `$DATAVERSE_MCP_CONFIG`, else `./dataverse-mcp.toml` when present,
    /// then apply environment overrides.
    pub fn load_default() -> Result<Self> {
        let explicit = std::env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from);
        let mut config = match explicit {
            Some(path) => Self::load(&path)?,
            None => {
                let path = Path::new(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    Self::load(path)?
                } else {
                    tracing::debug!("No config file found, using environment only");
                    Self::default()
                }
            }
        };
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Overlay `DATAVERSE_*` variables; empty values are ignored
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("DATAVERSE_ENVIRONMENT_URL") {
            self.environment_url = Some(v);
        }
        if let Some(v) = get("DATAVERSE_CLIENT_ID") {
            self.oauth.client_id = Some(v);
        }
        if let Some(v) = get("DATAVERSE_CLIENT_SECRET") {
            self.oauth.client_secret = Some(v);
        }
        if let Some(v) = get("DATAVERSE_TENANT_ID") {
            self.oauth.tenant_id = Some(v);
        }
        if let Some(v) = get("DATAVERSE_ACCESS_TOKEN") {
            self.token.access_token = Some(v);
        }
        if let Some(v) = get("DATAVERSE_REFRESH_TOKEN") {
            self.token.refresh_token = Some(v);
        }
    }

    pub fn to_runtime(&self) -> Result<RuntimeConfig> {
        let environment_url = match self.environment_url.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(url) => {
                if !url.starts_with("https://") && !url.starts_with("http://") {
                    bail!("environment_url must be an absolute URL, got '{}'", url);
                }
                Some(url.trim_end_matches('/').to_string())
            }
        };

        let oauth = self.oauth.client_id.clone().map(|client_id| {
            OAuth2Settings::new(
                self.oauth.tenant_id.clone(),
                client_id,
                self.oauth.client_secret.clone(),
            )
        });

        let token = self.token.access_token.clone().map(|access_token| OAuthTokenData {
            access_token,
            refresh_token: self.token.refresh_token.clone(),
            expires_at: self.token.expires_at,
        });

        if token.as_ref().is_some_and(|t| t.refresh_token.is_some()) && oauth.is_none() {
            tracing::warn!("A refresh token is configured without oauth.client_id; tokens will not be renewed");
        }

        if self.settings.timeout_secs == 0 {
            bail!("settings.timeout_secs must be greater than zero");
        }

        Ok(RuntimeConfig {
            environment_url,
            oauth,
            token,
            max_retries: self.settings.max_retries,
            retry_delay_ms: self.settings.retry_delay_ms,
            timeout_secs: self.settings.timeout_secs,
            log_level: self.settings.log_level.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_parse_full_config() {
        let config = Config::parse(
            r#"
            environment_url = "https://contoso.crm.dynamics.com/"

            [oauth]
            client_id = "abc"
            tenant_id = "tenant"

            [token]
            access_token = "at"
            refresh_token = "rt"

            [settings]
            max_retries = 5
            "#,
        )
        .unwrap();

        let runtime = config.to_runtime().unwrap();
        assert_eq!(runtime.environment_url.as_deref(), Some("https://contoso.crm.dynamics.com"));
        assert_eq!(runtime.max_retries, 5);
        assert_eq!(runtime.retry_delay_ms, 1000);
        assert_eq!(runtime.oauth.unwrap().tenant, "tenant");
        assert_eq!(runtime.token.unwrap().refresh_token.as_deref(), Some("rt"));
    }

    #[test]
    fn test_empty_config_is_valid() {
        let runtime = Config::parse("").unwrap().to_runtime().unwrap();
        assert!(runtime.environment_url.is_none());
        assert!(runtime.token.is_none());
        assert_eq!(runtime.log_level, "warn");
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("DATAVERSE_ENVIRONMENT_URL", "https://env.crm.dynamics.com"),
            ("DATAVERSE_ACCESS_TOKEN", "token"),
            ("DATAVERSE_CLIENT_ID", ""),
        ]
        .into_iter()
        .collect();

        let mut config = Config::parse("environment_url = \"https://file.crm.dynamics.com\"").unwrap();
        config.apply_env(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.environment_url.as_deref(), Some("https://env.crm.dynamics.com"));
        assert_eq!(config.token.access_token.as_deref(), Some("token"));
        assert!(config.oauth.client_id.is_none());
    }

    #[test]
    fn test_relative_environment_url_rejected() {
        let config = Config::parse("environment_url = \"contoso.crm.dynamics.com\"").unwrap();
        assert!(config.to_runtime().is_err());
    }

    #[test]
    fn test_refresh_token_without_client_warns_at_default_level() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new(DEFAULT_LOG_LEVEL))
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        let config = Config::parse("[token]\naccess_token = \"at\"\nrefresh_token = \"rt\"").unwrap();
        tracing::subscriber::with_default(subscriber, || config.to_runtime().unwrap());

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("refresh token is configured without oauth.client_id"));
    }
}
