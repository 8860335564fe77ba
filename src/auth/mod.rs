//! Azure AD authentication module
//!
//! OAuth2 authorization-code plumbing for Dataverse: endpoint and scope construction,
//! the stored token data, and refresh-token renewal. Per-call environment resolution
//! lives in [`environment`].

pub mod environment;

use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::RwLock;

pub use environment::{resolve_environment, ConnectionOptions, Environment, EnvironmentAuth};

const LOGIN_BASE: &str = "https://login.microsoftonline.com";

/// Authentication errors
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Token request failed: {0}")]
    TokenRequestFailed(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Token parse error: {0}")]
    ParseError(String),

    #[error("Missing credentials: {0}")]
    MissingCredentials(String),
}

/// Token data as stored by the credential store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthTokenData {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Unix timestamp (seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

impl OAuthTokenData {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
        }
    }

    /// A token without a known expiry is assumed valid
    pub fn is_valid(&self) -> bool {
        match self.expires_at {
            // Consider token expired 60 seconds before actual expiry
            Some(expires_at) => expires_at > unix_now() + 60,
            None => true,
        }
    }
}

/// Stored Dataverse OAuth2 credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataverseCredentials {
    pub environment_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_token_data: Option<OAuthTokenData>,
}

impl DataverseCredentials {
    pub fn access_token(&self) -> Option<&str> {
        self.oauth_token_data
            .as_ref()
            .map(|t| t.access_token.as_str())
            .filter(|t| !t.is_empty())
    }
}

/// Token response from Azure AD
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[allow(dead_code)]
    token_type: String,
    expires_in: u64,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// OAuth2 application registration used for the authorization-code grant
#[derive(Debug, Clone)]
pub struct OAuth2Settings {
    /// Tenant id, or `common`
    pub tenant: String,
    pub client_id: String,
    pub client_secret: Option<String>,
}

impl OAuth2Settings {
    pub fn new(tenant: Option<String>, client_id: String, client_secret: Option<String>) -> Self {
        Self {
            tenant: tenant
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| "common".to_string()),
            client_id,
            client_secret,
        }
    }

    pub fn authorize_endpoint(&self) -> String {
        format!("{}/{}/oauth2/v2.0/authorize", LOGIN_BASE, self.tenant)
    }

    pub fn token_endpoint(&self) -> String {
        format!("{}/{}/oauth2/v2.0/token", LOGIN_BASE, self.tenant)
    }

    /// `<environmentUrl>/.default offline_access`
    pub fn scope(environment_url: &str) -> String {
        format!(
            "{}/.default offline_access",
            resource_from_endpoint(environment_url)
        )
    }

    /// Authorization URL the user is sent to for consent
    pub fn authorize_url(
        &self,
        environment_url: &str,
        redirect_uri: &str,
        state: &str,
    ) -> Result<Url, AuthError> {
        let scope = Self::scope(environment_url);
        Url::parse_with_params(
            &self.authorize_endpoint(),
            &[
                ("client_id", self.client_id.as_str()),
                ("response_type", "code"),
                ("redirect_uri", redirect_uri),
                ("response_mode", "query"),
                ("scope", scope.as_str()),
                ("state", state),
            ],
        )
        .map_err(|e| AuthError::ParseError(format!("Invalid authorize URL: {}", e)))
    }
}

/// Holds the current token for one environment and renews it on demand
#[derive(Debug)]
pub struct OAuthSession {
    settings: Option<OAuth2Settings>,
    environment_url: String,
    http_client: Client,
    token: Arc<RwLock<Option<OAuthTokenData>>>,
}

impl OAuthSession {
    pub fn new(
        settings: Option<OAuth2Settings>,
        environment_url: String,
        token: Option<OAuthTokenData>,
    ) -> Self {
        Self {
            settings,
            environment_url,
            http_client: Client::new(),
            token: Arc::new(RwLock::new(token)),
        }
    }

    pub fn environment_url(&self) -> &str {
        &self.environment_url
    }

    /// Current credentials, renewing an expired token when a refresh token is available.
    ///
    /// A failed renewal hands out the stale token; Dataverse then answers 401 and the
    /// caller sees a normal provider error.
    pub async fn credentials(&self) -> DataverseCredentials {
        let current = self.token.read().await.clone();

        let token = match current {
            Some(ref token) if !token.is_valid() && token.refresh_token.is_some() => {
                match self.refresh().await {
                    Ok(renewed) => Some(renewed),
                    Err(e) => {
                        tracing::warn!("Token refresh failed, using stored token: {}", e);
                        current
                    }
                }
            }
            _ => current,
        };

        DataverseCredentials {
            environment_url: self.environment_url.clone(),
            oauth_token_data: token,
        }
    }

    /// Renew the access token with the refresh-token grant
    pub async fn refresh(&self) -> Result<OAuthTokenData, AuthError> {
        let settings = self.settings.as_ref().ok_or_else(|| {
            AuthError::MissingCredentials("client_id is required to refresh tokens".to_string())
        })?;
        let refresh_token = self
            .token
            .read()
            .await
            .as_ref()
            .and_then(|t| t.refresh_token.clone())
            .ok_or_else(|| AuthError::MissingCredentials("no refresh token stored".to_string()))?;

        let scope = OAuth2Settings::scope(&self.environment_url);
        let mut params = vec![
            ("grant_type", "refresh_token".to_string()),
            ("client_id", settings.client_id.clone()),
            ("refresh_token", refresh_token.clone()),
            ("scope", scope),
        ];
        if let Some(ref secret) = settings.client_secret {
            params.push(("client_secret", secret.clone()));
        }

        tracing::info!("Refreshing access token for {}", self.environment_url);

        let response = self
            .http_client
            .post(settings.token_endpoint())
            .form(&params)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::error!("Token request failed: {}", status);
            return Err(AuthError::TokenRequestFailed(format!(
                "Status: {}, Body: {}",
                status, body
            )));
        }

        let token_response: TokenResponse = response.json().await.map_err(|e| {
            AuthError::ParseError(format!("Failed to parse token response: {}", e))
        })?;

        let renewed = OAuthTokenData {
            access_token: token_response.access_token,
            // Azure AD may rotate the refresh token
            refresh_token: token_response.refresh_token.or(Some(refresh_token)),
            expires_at: Some(unix_now() + token_response.expires_in),
        };

        {
            let mut cache = self.token.write().await;
            *cache = Some(renewed.clone());
        }

        tracing::info!(
            "Token refreshed successfully, expires in {} seconds",
            token_response.expires_in
        );

        Ok(renewed)
    }
}

/// Get resource URL (scheme + host) from an endpoint
pub fn resource_from_endpoint(endpoint: &str) -> String {
    if let Ok(url) = Url::parse(endpoint) {
        format!("{}://{}", url.scheme(), url.host_str().unwrap_or(""))
    } else {
        endpoint
            .split('/')
            .take(3)
            .collect::<Vec<_>>()
            .join("/")
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}
