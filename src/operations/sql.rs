//! SQL over the Dataverse TDS endpoint
//!
//! One connection per query, authenticated with the same Azure AD bearer token the Web
//! API uses. The session is closed on every path, including query failures.

use crate::auth::{resolve_environment, EnvironmentAuth};
use crate::host::{ExecutionItem, Params};
use crate::odata::{DataverseError, SqlError};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{Map, Number, Value};
use std::time::Duration;
use tiberius::{AuthMethod, Client, ColumnType, Config, EncryptionLevel, Row};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

/// Dataverse TDS listener port
pub const TDS_PORT: u16 = 5558;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Server and database derived from an environment URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TdsTarget {
    pub server: String,
    pub database: String,
    pub port: u16,
    pub environment_url: String,
}

impl TdsTarget {
    /// `https://contoso.crm.dynamics.com` → server `contoso.crm.dynamics.com`, database `contoso`
    pub fn from_environment_url(environment_url: &str) -> Result<Self, SqlError> {
        let rest = environment_url
            .strip_prefix("https://")
            .or_else(|| environment_url.strip_prefix("http://"))
            .ok_or_else(|| SqlError::InvalidEnvironment(environment_url.to_string()))?;

        let server = rest.split('/').next().unwrap_or_default();
        if server.is_empty() {
            return Err(SqlError::InvalidEnvironment(environment_url.to_string()));
        }

        let database = match server.split_once('.') {
            Some((org, _)) if !org.is_empty() => org,
            _ => server,
        };

        Ok(Self {
            server: server.to_string(),
            database: database.to_string(),
            port: TDS_PORT,
            environment_url: environment_url.trim_end_matches('/').to_string(),
        })
    }
}

/// An open TDS connection
#[async_trait]
pub trait TdsSession: Send {
    async fn query(&mut self, sql: &str) -> anyhow::Result<Vec<Map<String, Value>>>;

    async fn close(self: Box<Self>) -> anyhow::Result<()>;
}

/// Opens TDS sessions; swapped out in tests
#[async_trait]
pub trait TdsConnector: Send + Sync {
    async fn connect(&self, target: &TdsTarget, token: &str) -> anyhow::Result<Box<dyn TdsSession>>;
}

/// The production connector, backed by tiberius
pub struct TiberiusConnector;

#[async_trait]
impl TdsConnector for TiberiusConnector {
    async fn connect(&self, target: &TdsTarget, token: &str) -> anyhow::Result<Box<dyn TdsSession>> {
        tracing::info!(
            "Connecting to Dataverse TDS endpoint at {}:{} database '{}'",
            target.server,
            target.port,
            target.database
        );

        let mut config = Config::new();
        config.host(&target.server);
        config.port(target.port);
        config.database(&target.database);
        config.authentication(AuthMethod::aad_token(token));
        config.encryption(EncryptionLevel::Required);

        let tcp = timeout(CONNECT_TIMEOUT, TcpStream::connect((target.server.as_str(), target.port)))
            .await
            .map_err(|_| anyhow!("Failed to connect: connection timeout after {:?}", CONNECT_TIMEOUT))?
            .map_err(|e| anyhow!("Failed to connect to {}:{}: {}", target.server, target.port, e))?;
        tcp.set_nodelay(true)?;

        let client = timeout(CONNECT_TIMEOUT, Client::connect(config, tcp.compat_write()))
            .await
            .map_err(|_| anyhow!("Failed to connect: login timeout after {:?}", CONNECT_TIMEOUT))?
            .context("Failed to connect")?;

        tracing::debug!("TDS session established");
        Ok(Box::new(TiberiusSession { client }))
    }
}

struct TiberiusSession {
    client: Client<Compat<TcpStream>>,
}

#[async_trait]
impl TdsSession for TiberiusSession {
    async fn query(&mut self, sql: &str) -> anyhow::Result<Vec<Map<String, Value>>> {
        let rows = timeout(REQUEST_TIMEOUT, async {
            self.client.simple_query(sql).await?.into_first_result().await
        })
        .await
        .map_err(|_| anyhow!("Request timeout after {:?}", REQUEST_TIMEOUT))??;

        Ok(rows.iter().map(row_to_json).collect())
    }

    async fn close(self: Box<Self>) -> anyhow::Result<()> {
        self.client.close().await?;
        Ok(())
    }
}

/// Convert one result row into a JSON object keyed by column name
fn row_to_json(row: &Row) -> Map<String, Value> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, column)| {
            (
                column.name().to_string(),
                column_value(row, idx, column.column_type()),
            )
        })
        .collect()
}

fn column_value(row: &Row, idx: usize, column_type: ColumnType) -> Value {
    match column_type {
        ColumnType::Null => Value::Null,
        ColumnType::Bit | ColumnType::Bitn => match row.try_get::<bool, _>(idx) {
            Ok(Some(b)) => Value::Bool(b),
            _ => Value::Null,
        },
        ColumnType::Int1 | ColumnType::Int2 | ColumnType::Int4 | ColumnType::Int8 | ColumnType::Intn => {
            if let Ok(Some(v)) = row.try_get::<i32, _>(idx) {
                Value::from(v)
            } else if let Ok(Some(v)) = row.try_get::<i64, _>(idx) {
                Value::from(v)
            } else if let Ok(Some(v)) = row.try_get::<i16, _>(idx) {
                Value::from(v)
            } else if let Ok(Some(v)) = row.try_get::<u8, _>(idx) {
                Value::from(v)
            } else {
                Value::Null
            }
        }
        ColumnType::Float4 | ColumnType::Float8 | ColumnType::Floatn => {
            let value = if let Ok(Some(v)) = row.try_get::<f32, _>(idx) {
                Some(v as f64)
            } else if let Ok(Some(v)) = row.try_get::<f64, _>(idx) {
                Some(v)
            } else {
                None
            };
            value
                .and_then(Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null)
        }
        ColumnType::Numericn | ColumnType::Decimaln | ColumnType::Money | ColumnType::Money4 => {
            match row.try_get::<tiberius::numeric::Numeric, _>(idx) {
                Ok(Some(n)) => {
                    let text = n.to_string();
                    text.parse::<f64>()
                        .ok()
                        .and_then(Number::from_f64)
                        .map(Value::Number)
                        .unwrap_or(Value::String(text))
                }
                _ => match row.try_get::<f64, _>(idx) {
                    Ok(Some(v)) => Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null),
                    _ => Value::Null,
                },
            }
        }
        ColumnType::Guid => match row.try_get::<uuid::Uuid, _>(idx) {
            Ok(Some(id)) => Value::String(id.to_string()),
            _ => Value::Null,
        },
        ColumnType::Datetime | ColumnType::Datetime2 | ColumnType::Datetime4 | ColumnType::Datetimen => {
            match row.try_get::<chrono::NaiveDateTime, _>(idx) {
                Ok(Some(dt)) => Value::String(dt.and_utc().to_rfc3339()),
                _ => Value::Null,
            }
        }
        ColumnType::DatetimeOffsetn => {
            match row.try_get::<chrono::DateTime<chrono::Utc>, _>(idx) {
                Ok(Some(dt)) => Value::String(dt.to_rfc3339()),
                _ => Value::Null,
            }
        }
        ColumnType::Daten => match row.try_get::<chrono::NaiveDate, _>(idx) {
            Ok(Some(d)) => Value::String(d.to_string()),
            _ => Value::Null,
        },
        ColumnType::Timen => match row.try_get::<chrono::NaiveTime, _>(idx) {
            Ok(Some(t)) => Value::String(t.to_string()),
            _ => Value::Null,
        },
        ColumnType::BigVarBin | ColumnType::BigBinary | ColumnType::Image => {
            match row.try_get::<&[u8], _>(idx) {
                Ok(Some(bytes)) => Value::String(STANDARD.encode(bytes)),
                _ => Value::Null,
            }
        }
        _ => match row.try_get::<&str, _>(idx) {
            Ok(Some(s)) => Value::String(s.to_string()),
            _ => Value::Null,
        },
    }
}

/// Sort a raw failure into a connection problem or an execution failure
pub fn classify_failure(target: &TdsTarget, error: &anyhow::Error) -> SqlError {
    let message = format!("{:#}", error);
    if message.contains("Failed to connect") || message.to_lowercase().contains("timeout") {
        SqlError::Connection {
            server: target.server.clone(),
            port: target.port,
            environment_url: target.environment_url.clone(),
            message,
        }
    } else {
        SqlError::Execution(message)
    }
}

/// Connect, run `sql`, and close; returns the rows of the first result set
pub async fn run_query(
    connector: &dyn TdsConnector,
    target: &TdsTarget,
    token: &str,
    sql: &str,
) -> Result<Vec<Map<String, Value>>, SqlError> {
    let mut session = connector
        .connect(target, token)
        .await
        .map_err(|e| classify_failure(target, &e))?;

    let result = session.query(sql).await;

    if let Err(e) = session.close().await {
        tracing::warn!("Failed to close TDS session: {:#}", e);
    }

    let rows = result.map_err(|e| classify_failure(target, &e))?;
    tracing::debug!("SQL query returned {} row(s)", rows.len());
    Ok(rows)
}

/// `executeQuery`: one output item per result row
pub async fn execute_query(
    params: &Params<'_>,
    connector: &dyn TdsConnector,
) -> Result<Vec<ExecutionItem>, DataverseError> {
    let sql = params.string("sqlQuery")?;
    let environment = resolve_environment(params.host(), params.item()).await?;

    let token = match environment.auth {
        EnvironmentAuth::Bearer(ref token) => token.clone(),
        EnvironmentAuth::Host => params
            .host()
            .credentials()
            .await
            .and_then(|c| c.access_token().map(str::to_string))
            .ok_or_else(|| {
                DataverseError::Configuration(
                    "No access token available. Please authenticate with OAuth2.".to_string(),
                )
            })?,
    };

    let target = TdsTarget::from_environment_url(&environment.base_url)?;
    let rows = run_query(connector, &target, &token, &sql).await?;

    Ok(rows
        .into_iter()
        .map(|row| ExecutionItem::new(Value::Object(row), params.item()))
        .collect())
}
