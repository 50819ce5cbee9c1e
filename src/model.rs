use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle of a maintainer on a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, sqlx::Type)]
pub enum MaintainerStatus {
    #[default]
    Active,
    Emeritus,
    Retired,
}

impl MaintainerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MaintainerStatus::Active => "Active",
            MaintainerStatus::Emeritus => "Emeritus",
            MaintainerStatus::Retired => "Retired",
        }
    }
}

impl fmt::Display for MaintainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MaintainerStatus {
    type Err = InvalidValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Active" => Ok(MaintainerStatus::Active),
            "Emeritus" => Ok(MaintainerStatus::Emeritus),
            "Retired" => Ok(MaintainerStatus::Retired),
            other => Err(InvalidValue {
                kind: "MaintainerStatus",
                value: other.to_string(),
            }),
        }
    }
}

/// CNCF maturity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
pub enum Maturity {
    Sandbox,
    Incubating,
    Graduated,
    Archived,
}

impl Maturity {
    pub fn as_str(self) -> &'static str {
        match self {
            Maturity::Sandbox => "Sandbox",
            Maturity::Incubating => "Incubating",
            Maturity::Graduated => "Graduated",
            Maturity::Archived => "Archived",
        }
    }
}

impl fmt::Display for Maturity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Maturity {
    type Err = InvalidValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Sandbox" => Ok(Maturity::Sandbox),
            "Incubating" => Ok(Maturity::Incubating),
            "Graduated" => Ok(Maturity::Graduated),
            "Archived" => Ok(Maturity::Archived),
            other => Err(InvalidValue {
                kind: "Maturity",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} {value:?}")]
pub struct InvalidValue {
    pub kind: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Company {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Foundation {
    pub id: i64,
    pub name: String,
}

/// A leader that can speak for a project. `company_name` is joined in by the
/// store so callers never need a second lookup.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Maintainer {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub github_account: String,
    pub github_email: String,
    pub maintainer_status: MaintainerStatus,
    pub import_warnings: String,
    pub registered_at: Option<String>,
    pub company_id: Option<i64>,
    pub company_name: Option<String>,
}

/// A contributor known to an external service who is not a registered maintainer.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Collaborator {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub github_email: Option<String>,
    pub github_account: Option<String>,
    pub last_login: Option<String>,
    pub registered_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub parent_project_id: Option<i64>,
    pub maturity: Option<Maturity>,
    pub maintainer_ref: String,
    pub onboarding_issue: Option<String>,
    pub mailing_list: Option<String>,
    #[sqlx(skip)]
    pub maintainers: Vec<Maintainer>,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Service {
    pub id: i64,
    pub name: String,
    pub description: String,
}

/// A team on a remote service (e.g. a FOSSA team) owned by a project.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct ServiceTeam {
    pub id: i64,
    pub project_id: i64,
    pub service_id: i64,
    /// Team id on the remote service.
    pub service_team_id: i64,
    pub service_team_name: Option<String>,
    pub project_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct ServiceUser {
    pub id: i64,
    pub service_id: i64,
    /// User id on the remote service.
    pub service_user_id: i64,
    pub service_email: String,
    pub service_ref: String,
    pub service_github_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct ServiceUserTeam {
    pub id: i64,
    pub service_id: i64,
    pub service_user_id: i64,
    pub service_team_id: i64,
    pub maintainer_id: Option<i64>,
    pub collaborator_id: Option<i64>,
}

/// A foundation staff member with elevated access to services.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct StaffMember {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub github_account: String,
    pub github_email: String,
    pub registered_at: Option<String>,
    pub foundation_id: Option<i64>,
    pub foundation_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditLog {
    pub project_id: i64,
    pub maintainer_id: Option<i64>,
    pub service_id: Option<i64>,
    /// e.g. `FOSSA_ADD_MEMBER`, `FOSSA_INVITE_SENT`
    pub action: String,
    pub message: String,
    pub metadata: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_maintainer_status_parse() {
        assert_eq!("Active".parse(), Ok(MaintainerStatus::Active));
        assert_eq!(" Emeritus ".parse(), Ok(MaintainerStatus::Emeritus));
        assert!("active".parse::<MaintainerStatus>().is_err());
        assert_eq!(MaintainerStatus::default(), MaintainerStatus::Active);
    }

    #[test]
    fn test_maturity_parse() {
        assert_eq!("Graduated".parse(), Ok(Maturity::Graduated));
        let err = "Emerging".parse::<Maturity>().unwrap_err();
        assert_eq!(err.to_string(), "invalid Maturity \"Emerging\"");
    }
}
