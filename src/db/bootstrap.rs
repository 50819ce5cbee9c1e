//! Populates a fresh database from the maintainer worksheet and the FOSSA
//! user directory.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use sqlx::{Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{SqlStore, StoreError, FOSSA_SERVICE};
use crate::fossa::{FossaApi, FossaError, User};
use crate::model::{Maturity, Project, ServiceTeam, ServiceUser};

pub const STATUS_HDR: &str = "Status";
pub const PROJECT_HDR: &str = "Project";
pub const MAINTAINER_NAME_HDR: &str = "Maintainer Name";
pub const COMPANY_HDR: &str = "Company";
pub const EMAIL_HDR: &str = "Emails";
pub const GITHUB_HDR: &str = "Github Name";
pub const GITHUB_EMAIL_HDR: &str = "GitHub Email";
pub const PARENT_PROJECT_HDR: &str = "Parent Project";
pub const MAINTAINER_REF_HDR: &str = "OWNERS/MAINTAINERS";
pub const MAILING_LIST_HDR: &str = "Mailing List Address";

const SERVICES: [(&str, &str); 4] = [
    (
        FOSSA_SERVICE,
        "Static code check we use to ensure 3rd Party License Policy",
    ),
    ("Service Desk", "Jira"),
    ("cncf.groups.io", "Mailing list channels"),
    (
        "Snyk",
        "Static code checker for 3rd Party License Policy monitoring and compliance",
    ),
];

pub type WorksheetRow = HashMap<String, String>;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("worksheet is empty")]
    EmptyWorksheet,
    #[error("failed to read worksheet {path}: {source}")]
    ReadWorksheet {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse worksheet: {0}")]
    ParseWorksheet(#[from] serde_json::Error),
    #[error("row has no project name")]
    MissingProject,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to fetch FOSSA data: {0}")]
    Fossa(#[from] FossaError),
}

/// Shape of a Sheets `values.get` response saved to disk.
#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorksheetSummary {
    pub rows: usize,
    pub imported: usize,
    pub skipped: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FossaSummary {
    pub users: usize,
    pub maintainers: usize,
    pub collaborators: usize,
    pub links: usize,
}

/// First-or-create the services every deployment knows about.
pub async fn seed_services(store: &SqlStore) -> Result<(), ImportError> {
    let mut tx = store.pool().begin().await?;
    for (name, description) in SERVICES {
        sqlx::query("INSERT INTO services (name, description) VALUES (?, ?) ON CONFLICT(name) DO NOTHING")
            .bind(name)
            .bind(description)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    debug!("seeded services");
    Ok(())
}

/// Loads a worksheet export (`{"values": [[...], ...]}`) from disk.
pub fn read_worksheet_file(path: &Path) -> Result<Vec<WorksheetRow>, ImportError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ImportError::ReadWorksheet {
        path: path.display().to_string(),
        source,
    })?;
    let range: ValueRange = serde_json::from_str(&raw)?;
    read_worksheet_rows(&range.values)
}

fn cell_text(cell: &Value) -> String {
    match cell {
        Value::String(s) => s.trim().to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Turns the header row plus data rows into maps keyed by header. Blank
/// `Project` and `Status` cells inherit the last non-empty value above them.
pub fn read_worksheet_rows(values: &[Vec<Value>]) -> Result<Vec<WorksheetRow>, ImportError> {
    let (header, data) = values.split_first().ok_or(ImportError::EmptyWorksheet)?;
    let headers: Vec<String> = header.iter().map(cell_text).collect();

    let mut last_project = String::new();
    let mut last_status = String::new();
    let mut rows = Vec::with_capacity(data.len());

    for raw in data {
        let mut row = WorksheetRow::with_capacity(headers.len());
        for (i, h) in headers.iter().enumerate() {
            let value = raw.get(i).map(cell_text).unwrap_or_default();
            let value = match h.as_str() {
                PROJECT_HDR => {
                    if !value.is_empty() {
                        last_project = value;
                    }
                    last_project.clone()
                }
                STATUS_HDR => {
                    if !value.is_empty() {
                        last_status = value;
                    }
                    last_status.clone()
                }
                _ => value,
            };
            row.insert(h.clone(), value);
        }
        rows.push(row);
    }
    Ok(rows)
}

fn field<'a>(row: &'a WorksheetRow, header: &str) -> &'a str {
    row.get(header).map(String::as_str).unwrap_or_default()
}

fn missing_fields(row: &WorksheetRow) -> Vec<&'static str> {
    [MAINTAINER_NAME_HDR, COMPANY_HDR, EMAIL_HDR, GITHUB_HDR]
        .into_iter()
        .filter(|h| field(row, h).is_empty())
        .collect()
}

/// Imports each worksheet row in its own transaction. A failing row is
/// logged and skipped.
pub async fn load_maintainers_and_projects(
    store: &SqlStore,
    rows: &[WorksheetRow],
) -> Result<WorksheetSummary, ImportError> {
    let mut summary = WorksheetSummary {
        rows: rows.len(),
        ..Default::default()
    };

    for row in rows {
        let parent = match field(row, PARENT_PROJECT_HDR) {
            "" => None,
            parent_name => {
                let parent = store.get_project_by_name(parent_name).await?;
                if parent.is_none() {
                    warn!(
                        parent = parent_name,
                        project = field(row, PROJECT_HDR),
                        "parent project not found, importing without parent"
                    );
                }
                parent
            }
        };

        match import_row(store.pool(), row, parent.as_ref()).await {
            Ok(()) => summary.imported += 1,
            Err(e) => {
                summary.skipped += 1;
                warn!(
                    project = field(row, PROJECT_HDR),
                    maintainer = field(row, MAINTAINER_NAME_HDR),
                    "row skipped: {e}"
                );
            }
        }
    }

    info!(
        rows = summary.rows,
        imported = summary.imported,
        skipped = summary.skipped,
        "loaded maintainers and projects"
    );
    Ok(summary)
}

async fn import_row(
    pool: &SqlitePool,
    row: &WorksheetRow,
    parent: Option<&Project>,
) -> Result<(), ImportError> {
    let project_name = field(row, PROJECT_HDR);
    if project_name.is_empty() {
        return Err(ImportError::MissingProject);
    }

    let mut warnings: Vec<String> = Vec::new();
    let missing = missing_fields(row);
    if !missing.is_empty() {
        warnings.push(format!("missing: {}", missing.join(", ")));
    }

    let maturity = match parent {
        Some(p) => p.maturity,
        None => match field(row, STATUS_HDR) {
            "" => None,
            status => match status.parse::<Maturity>() {
                Ok(m) => Some(m),
                Err(e) => {
                    warnings.push(e.to_string());
                    None
                }
            },
        },
    };

    let mut tx = pool.begin().await?;
    let project_id = first_or_create_project(
        &mut tx,
        project_name,
        maturity,
        parent.map(|p| p.id),
        field(row, MAINTAINER_REF_HDR),
        field(row, MAILING_LIST_HDR),
    )
    .await?;

    let company_id = match field(row, COMPANY_HDR) {
        "" => None,
        company => Some(first_or_create_company(&mut tx, company).await?),
    };

    let maintainer_id = first_or_create_maintainer(&mut tx, row, company_id, &warnings.join("; ")).await?;

    sqlx::query("INSERT OR IGNORE INTO maintainer_projects (maintainer_id, project_id) VALUES (?, ?)")
        .bind(maintainer_id)
        .bind(project_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

async fn first_or_create_project(
    tx: &mut Transaction<'_, Sqlite>,
    name: &str,
    maturity: Option<Maturity>,
    parent_id: Option<i64>,
    maintainer_ref: &str,
    mailing_list: &str,
) -> Result<i64, sqlx::Error> {
    if let Some(id) = sqlx::query_scalar::<_, i64>("SELECT id FROM projects WHERE name = ?")
        .bind(name)
        .fetch_optional(&mut **tx)
        .await?
    {
        return Ok(id);
    }
    sqlx::query_scalar(
        "INSERT INTO projects (name, maturity, parent_project_id, maintainer_ref, mailing_list)
         VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(name)
    .bind(maturity)
    .bind(parent_id)
    .bind(maintainer_ref)
    .bind(mailing_list)
    .fetch_one(&mut **tx)
    .await
}

async fn first_or_create_company(
    tx: &mut Transaction<'_, Sqlite>,
    name: &str,
) -> Result<i64, sqlx::Error> {
    sqlx::query("INSERT INTO companies (name) VALUES (?) ON CONFLICT(name) DO NOTHING")
        .bind(name)
        .execute(&mut **tx)
        .await?;
    sqlx::query_scalar("SELECT id FROM companies WHERE name = ?")
        .bind(name)
        .fetch_one(&mut **tx)
        .await
}

/// Maintainers are keyed by email, falling back to the GitHub handle and then
/// the name when the worksheet leaves the email blank.
async fn first_or_create_maintainer(
    tx: &mut Transaction<'_, Sqlite>,
    row: &WorksheetRow,
    company_id: Option<i64>,
    warnings: &str,
) -> Result<i64, sqlx::Error> {
    let name = field(row, MAINTAINER_NAME_HDR);
    let email = field(row, EMAIL_HDR);
    let github = field(row, GITHUB_HDR);
    let github_email = field(row, GITHUB_EMAIL_HDR);

    let (column, key) = if !email.is_empty() {
        ("email", email)
    } else if !github.is_empty() {
        ("github_account", github)
    } else {
        ("name", name)
    };
    let lookup = format!("SELECT id FROM maintainers WHERE {column} = ?");
    if let Some(id) = sqlx::query_scalar::<_, i64>(&lookup)
        .bind(key)
        .fetch_optional(&mut **tx)
        .await?
    {
        return Ok(id);
    }

    let or_missing = |value: &str, placeholder: &'static str| -> String {
        if value.is_empty() {
            placeholder.to_string()
        } else {
            value.to_string()
        }
    };
    sqlx::query_scalar(
        "INSERT INTO maintainers (name, email, github_account, github_email, maintainer_status, import_warnings, company_id)
         VALUES (?, ?, ?, ?, 'Active', ?, ?) RETURNING id",
    )
    .bind(name)
    .bind(or_missing(email, "EMAIL_MISSING"))
    .bind(or_missing(github, "GITHUB_MISSING"))
    .bind(or_missing(github_email, "GITHUB_MISSING"))
    .bind(warnings)
    .bind(company_id)
    .fetch_one(&mut **tx)
    .await
}

/// Mirrors the FOSSA user directory into service users, collaborators and
/// team links. Per-user failures are logged and skipped.
pub async fn load_fossa(store: &SqlStore, fossa: &dyn FossaApi) -> Result<FossaSummary, ImportError> {
    let users = fossa.fetch_users().await?;
    let teams = fossa.fetch_teams().await?;
    info!(users = users.len(), teams = teams.len(), "fetched FOSSA data");

    let service = store.get_service_by_name(FOSSA_SERVICE).await?;
    let projects = store.get_project_map_by_name().await?;
    let pool = store.pool();

    let mut summary = FossaSummary {
        users: users.len(),
        ..Default::default()
    };

    for user in &users {
        let service_user = match first_or_create_service_user(pool, service.id, user).await {
            Ok(su) => su,
            Err(e) => {
                warn!(email = %user.email, "failed to create FOSSA service user: {e}");
                continue;
            }
        };

        let maintainer_id = match map_fossa_user_to_maintainer(pool, &user.email, user.github_name()).await {
            Ok(id) => id,
            Err(e) => {
                warn!(email = %user.email, "failed to map FOSSA user to a maintainer: {e}");
                continue;
            }
        };
        let collaborator_id = match maintainer_id {
            Some(_) => {
                summary.maintainers += 1;
                None
            }
            None => match first_or_create_collaborator(pool, user).await {
                Ok(id) => {
                    summary.collaborators += 1;
                    Some(id)
                }
                Err(e) => {
                    warn!(email = %user.email, "failed to map FOSSA user to a collaborator: {e}");
                    None
                }
            },
        };

        let service_teams = create_service_teams_for_user(pool, service.id, user, &projects).await;
        if service_teams.is_empty() {
            debug!(email = %user.email, "FOSSA user is not on any registered project team");
            continue;
        }

        match link_service_user_to_teams(pool, &service_user, &service_teams, maintainer_id, collaborator_id).await {
            Ok(linked) => summary.links += linked,
            Err(e) => warn!(user_id = user.id, email = %user.email, "failed to link FOSSA user to teams: {e}"),
        }
    }

    info!(
        users = summary.users,
        maintainers = summary.maintainers,
        collaborators = summary.collaborators,
        links = summary.links,
        "loaded FOSSA users"
    );
    Ok(summary)
}

async fn first_or_create_service_user(
    pool: &SqlitePool,
    service_id: i64,
    user: &User,
) -> Result<ServiceUser, sqlx::Error> {
    sqlx::query(
        "INSERT INTO service_users (service_id, service_user_id, service_email, service_ref, service_github_name)
         VALUES (?, ?, ?, ?, ?) ON CONFLICT(service_id, service_user_id) DO NOTHING",
    )
    .bind(service_id)
    .bind(user.id)
    .bind(&user.email)
    .bind(&user.username)
    .bind(user.github.name.as_deref())
    .execute(pool)
    .await?;

    sqlx::query_as::<_, ServiceUser>(
        "SELECT id, service_id, service_user_id, service_email, service_ref, service_github_name
         FROM service_users WHERE service_id = ? AND service_user_id = ?",
    )
    .bind(service_id)
    .bind(user.id)
    .fetch_one(pool)
    .await
}

/// Matches by GitHub handle first, then by email against both the maintainer
/// email and GitHub email. All comparisons ignore case.
pub async fn map_fossa_user_to_maintainer(
    pool: &SqlitePool,
    email: &str,
    github: &str,
) -> Result<Option<i64>, sqlx::Error> {
    if !github.is_empty() {
        let by_handle = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM maintainers WHERE LOWER(github_account) = ? ORDER BY id LIMIT 1",
        )
        .bind(github.to_lowercase())
        .fetch_optional(pool)
        .await?;
        if by_handle.is_some() {
            return Ok(by_handle);
        }
    }

    let email = email.to_lowercase();
    sqlx::query_scalar::<_, i64>(
        "SELECT id FROM maintainers WHERE LOWER(email) = ? OR LOWER(github_email) = ? ORDER BY id LIMIT 1",
    )
    .bind(&email)
    .bind(&email)
    .fetch_optional(pool)
    .await
}

async fn first_or_create_collaborator(pool: &SqlitePool, user: &User) -> Result<i64, sqlx::Error> {
    let github = user.github_name();
    let existing = if github.is_empty() {
        sqlx::query_scalar::<_, i64>("SELECT id FROM collaborators WHERE LOWER(email) = ? LIMIT 1")
            .bind(user.email.to_lowercase())
            .fetch_optional(pool)
            .await?
    } else {
        sqlx::query_scalar::<_, i64>(
            "SELECT id FROM collaborators WHERE LOWER(github_account) = ? LIMIT 1",
        )
        .bind(github.to_lowercase())
        .fetch_optional(pool)
        .await?
    };
    if let Some(id) = existing {
        return Ok(id);
    }

    sqlx::query_scalar(
        "INSERT INTO collaborators (name, email, github_email, github_account, last_login, registered_at)
         VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(&user.full_name)
    .bind(&user.email)
    .bind(user.github.email.as_deref())
    .bind(user.github.name.as_deref())
    .bind(user.last_visit.map(|t| t.to_rfc3339()))
    .bind(user.created_at.or(user.joined).map(|t| t.to_rfc3339()))
    .fetch_one(pool)
    .await
}

/// Records the user's FOSSA teams that carry the name of a registered
/// project. Teams for unknown projects are skipped.
async fn create_service_teams_for_user(
    pool: &SqlitePool,
    service_id: i64,
    user: &User,
    projects: &HashMap<String, Project>,
) -> Vec<ServiceTeam> {
    let mut teams = Vec::new();
    for membership in &user.team_users {
        let team = &membership.team;
        let Some(project) = projects.get(&team.name) else {
            debug!(team = %team.name, "FOSSA team is not a registered project");
            continue;
        };
        match first_or_create_service_team(pool, service_id, team.id, &team.name, project).await {
            Ok(st) => teams.push(st),
            Err(e) => warn!(team_id = team.id, team = %team.name, "failed to record FOSSA team: {e}"),
        }
    }
    teams
}

async fn first_or_create_service_team(
    pool: &SqlitePool,
    service_id: i64,
    remote_team_id: i64,
    team_name: &str,
    project: &Project,
) -> Result<ServiceTeam, sqlx::Error> {
    let existing = sqlx::query_as::<_, ServiceTeam>(
        "SELECT id, project_id, service_id, service_team_id, service_team_name, project_name
         FROM service_teams WHERE service_team_id = ? AND service_id = ?",
    )
    .bind(remote_team_id)
    .bind(service_id)
    .fetch_optional(pool)
    .await?;
    if let Some(team) = existing {
        return Ok(team);
    }

    sqlx::query_as::<_, ServiceTeam>(
        "INSERT INTO service_teams (project_id, service_id, service_team_id, service_team_name, project_name)
         VALUES (?, ?, ?, ?, ?)
         RETURNING id, project_id, service_id, service_team_id, service_team_name, project_name",
    )
    .bind(project.id)
    .bind(service_id)
    .bind(remote_team_id)
    .bind(team_name)
    .bind(&project.name)
    .fetch_one(pool)
    .await
}

/// Idempotently links a service user to each team, attributing the link to
/// either the maintainer or the collaborator. Returns the number of links
/// created or updated.
async fn link_service_user_to_teams(
    pool: &SqlitePool,
    service_user: &ServiceUser,
    teams: &[ServiceTeam],
    maintainer_id: Option<i64>,
    collaborator_id: Option<i64>,
) -> Result<usize, sqlx::Error> {
    // Never attribute a link to both.
    let collaborator_id = if maintainer_id.is_some() { None } else { collaborator_id };
    let mut changed = 0;

    for team in teams {
        let existing: Option<(i64, Option<i64>, Option<i64>)> = sqlx::query_as(
            "SELECT id, maintainer_id, collaborator_id FROM service_user_teams
             WHERE service_id = ? AND service_team_id = ? AND service_user_id = ?",
        )
        .bind(service_user.service_id)
        .bind(team.id)
        .bind(service_user.service_user_id)
        .fetch_optional(pool)
        .await?;

        match existing {
            Some((id, current_maintainer, current_collaborator)) => {
                let update = match (maintainer_id, collaborator_id) {
                    (Some(m), _) if current_maintainer.is_none() => Some((Some(m), None)),
                    (None, Some(c)) if current_collaborator.is_none() => Some((None, Some(c))),
                    _ => None,
                };
                if let Some((m, c)) = update {
                    sqlx::query(
                        "UPDATE service_user_teams SET maintainer_id = ?, collaborator_id = ? WHERE id = ?",
                    )
                    .bind(m)
                    .bind(c)
                    .bind(id)
                    .execute(pool)
                    .await?;
                    changed += 1;
                }
            }
            None => {
                sqlx::query(
                    "INSERT INTO service_user_teams (service_id, service_user_id, service_team_id, maintainer_id, collaborator_id)
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(service_user.service_id)
                .bind(service_user.service_user_id)
                .bind(team.id)
                .bind(maintainer_id)
                .bind(collaborator_id)
                .execute(pool)
                .await?;
                changed += 1;
            }
        }
    }
    Ok(changed)
}
