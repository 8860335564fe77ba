//! Access rights and security principals for share/revoke/assign

use crate::host::Params;
use crate::odata::client::{DataverseClient, QueryOptions};
use crate::odata::query::escape_odata_string;
use crate::odata::DataverseError;
use serde_json::{json, Value};
use std::fmt;
use std::ops::BitOr;

/// Dataverse `AccessRights` flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccessRights(u32);

impl AccessRights {
    pub const NONE: Self = Self(0);
    pub const READ: Self = Self(1);
    pub const WRITE: Self = Self(2);
    pub const APPEND: Self = Self(4);
    pub const APPEND_TO: Self = Self(16);
    pub const CREATE: Self = Self(32);
    pub const DELETE: Self = Self(65536);
    pub const SHARE: Self = Self(262144);
    pub const ASSIGN: Self = Self(524288);

    const NAMED: &'static [(Self, &'static str)] = &[
        (Self::READ, "ReadAccess"),
        (Self::WRITE, "WriteAccess"),
        (Self::APPEND, "AppendAccess"),
        (Self::APPEND_TO, "AppendToAccess"),
        (Self::CREATE, "CreateAccess"),
        (Self::DELETE, "DeleteAccess"),
        (Self::SHARE, "ShareAccess"),
        (Self::ASSIGN, "AssignAccess"),
    ];

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// `ReadAccess` or the short form `Read`
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::NAMED.iter().find_map(|(right, full)| {
            let short = &full[..full.len() - "Access".len()];
            (name.eq_ignore_ascii_case(full) || name.eq_ignore_ascii_case(short)).then_some(*right)
        })
    }

    pub fn parse_list<I, S>(names: I) -> Result<Self, DataverseError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names.into_iter().try_fold(Self::NONE, |acc, name| {
            Self::from_name(name.as_ref())
                .map(|right| acc | right)
                .ok_or_else(|| {
                    DataverseError::InvalidParameter(format!(
                        "Unknown access right '{}'",
                        name.as_ref()
                    ))
                })
        })
    }
}

impl BitOr for AccessRights {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Comma-separated flag names, the form the Web API expects for `AccessMask`
impl fmt::Display for AccessRights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMED
            .iter()
            .filter(|(right, _)| self.contains(*right))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            f.write_str("None")
        } else {
            f.write_str(&names.join(", "))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrincipalKind {
    User,
    Team,
}

impl PrincipalKind {
    pub fn parse(value: &str) -> Result<Self, DataverseError> {
        match value {
            "systemuser" => Ok(PrincipalKind::User),
            "team" => Ok(PrincipalKind::Team),
            other => Err(DataverseError::InvalidParameter(format!(
                "Unknown principal type '{}'",
                other
            ))),
        }
    }

    pub fn logical_name(&self) -> &'static str {
        match self {
            PrincipalKind::User => "systemuser",
            PrincipalKind::Team => "team",
        }
    }

    pub fn entity_set(&self) -> &'static str {
        match self {
            PrincipalKind::User => "systemusers",
            PrincipalKind::Team => "teams",
        }
    }

    pub fn id_attribute(&self) -> &'static str {
        match self {
            PrincipalKind::User => "systemuserid",
            PrincipalKind::Team => "teamid",
        }
    }
}

/// A resolved user or team
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub kind: PrincipalKind,
    pub id: String,
}

impl Principal {
    /// Entity reference used in GrantAccess / RevokeAccess bodies
    pub fn to_entity_reference(&self) -> Value {
        json!({
            self.kind.id_attribute(): self.id,
            "@odata.type": format!("Microsoft.Dynamics.CRM.{}", self.kind.logical_name()),
        })
    }

    /// `/systemusers(<id>)` or `/teams(<id>)`
    pub fn bind_path(&self) -> String {
        format!("/{}({})", self.kind.entity_set(), self.id)
    }
}

/// Resolve the principal named by `principalType` / `principalIdType` /
/// `principalId` / `principalUpn` / `teamName`
pub async fn resolve_principal(
    client: &DataverseClient<'_>,
    params: &Params<'_>,
) -> Result<Principal, DataverseError> {
    let kind = PrincipalKind::parse(
        &params
            .optional_string("principalType")
            .unwrap_or_else(|| "systemuser".to_string()),
    )?;

    match kind {
        PrincipalKind::User => {
            let id_type = params
                .optional_string("principalIdType")
                .unwrap_or_else(|| "upn".to_string());
            match id_type.as_str() {
                "guid" => Ok(Principal {
                    kind,
                    id: params.string("principalId")?,
                }),
                "upn" => {
                    let upn = params.string("principalUpn")?;
                    let id = lookup_id(
                        client,
                        kind,
                        format!("domainname eq '{}'", escape_odata_string(&upn)),
                    )
                    .await?
                    .ok_or_else(|| {
                        DataverseError::NotFound(format!("No user found with UPN: {}", upn))
                    })?;
                    Ok(Principal { kind, id })
                }
                other => Err(DataverseError::InvalidParameter(format!(
                    "Unknown principal ID type '{}'",
                    other
                ))),
            }
        }
        PrincipalKind::Team => {
            if let Some(id) = params
                .optional_string("principalIdType")
                .filter(|t| t == "guid")
                .and_then(|_| params.optional_string("principalId"))
            {
                return Ok(Principal { kind, id });
            }
            let name = params.string("teamName")?;
            let id = lookup_id(
                client,
                kind,
                format!("name eq '{}'", escape_odata_string(&name)),
            )
            .await?
            .ok_or_else(|| DataverseError::NotFound(format!("No team found with name: {}", name)))?;
            Ok(Principal { kind, id })
        }
    }
}

async fn lookup_id(
    client: &DataverseClient<'_>,
    kind: PrincipalKind,
    filter: String,
) -> Result<Option<String>, DataverseError> {
    let query = QueryOptions::new()
        .filter(filter)
        .select([kind.id_attribute()]);
    let rows = client
        .get_collection(&format!("/{}", kind.entity_set()), &query)
        .await?;

    Ok(rows
        .first()
        .and_then(|row| row.get(kind.id_attribute()))
        .and_then(Value::as_str)
        .map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_rights_display() {
        let rights = AccessRights::READ | AccessRights::WRITE;
        assert_eq!(rights.to_string(), "ReadAccess, WriteAccess");
        assert_eq!(rights.bits(), 3);
        assert_eq!(AccessRights::NONE.to_string(), "None");
    }

    #[test]
    fn test_access_rights_parse_names() {
        let rights = AccessRights::parse_list(["ReadAccess", "Share", "assignaccess"]).unwrap();
        assert!(rights.contains(AccessRights::READ));
        assert!(rights.contains(AccessRights::SHARE));
        assert!(rights.contains(AccessRights::ASSIGN));
        assert!(!rights.contains(AccessRights::DELETE));
        assert_eq!(rights.bits(), 1 + 262144 + 524288);
    }

    #[test]
    fn test_access_rights_unknown_name() {
        assert!(AccessRights::parse_list(["ReadAccess", "Everything"]).is_err());
    }

    #[test]
    fn test_principal_reference() {
        let principal = Principal {
            kind: PrincipalKind::Team,
            id: "t-1".to_string(),
        };
        assert_eq!(
            principal.to_entity_reference(),
            json!({"teamid": "t-1", "@odata.type": "Microsoft.Dynamics.CRM.team"})
        );
        assert_eq!(principal.bind_path(), "/teams(t-1)");
    }
}
