//! Client for the FOSSA REST API.
//!
//! Only the endpoints needed for onboarding and the bootstrap import are
//! covered: users, invitations, teams, team membership and imported projects.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_API_BASE: &str = "https://app.fossa.com/api";
pub const DEFAULT_ORGANIZATION_ID: i64 = 162;

pub const ERR_CODE_USER_ALREADY_MEMBER: i64 = 2001;
pub const ERR_CODE_TEAM_ALREADY_EXISTS: i64 = 2003;
pub const ERR_CODE_INVITE_ALREADY_EXISTS: i64 = 2011;

/// FOSSA role id for a team administrator.
pub const TEAM_ADMIN_ROLE: i64 = 3;

const USERS_PAGE_SIZE: usize = 100;

#[derive(Debug, Error)]
pub enum FossaError {
    #[error("fossa: invitation already exists: {0}")]
    InviteAlreadyExists(String),
    #[error("fossa: user is already a member: {0}")]
    UserAlreadyMember(String),
    #[error("fossa: team {0:?} not found")]
    TeamNotFound(String),
    #[error("fossa: user not found by email: {0}")]
    UserNotFound(String),
    #[error("fossa: {operation} failed (code {code}): {status} {message}")]
    Api {
        operation: &'static str,
        code: i64,
        status: u16,
        message: String,
    },
    #[error("fossa: {operation} failed: {status} {body}")]
    Status {
        operation: &'static str,
        status: u16,
        body: String,
    },
    #[error("fossa: request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("fossa: failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl FossaError {
    /// True for the errors FOSSA uses to signal an operation was already done.
    pub fn is_already_done(&self) -> bool {
        matches!(
            self,
            FossaError::InviteAlreadyExists(_) | FossaError::UserAlreadyMember(_)
        )
    }
}

/// Error body returned by FOSSA for failed requests.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiError {
    pub uuid: String,
    pub code: i64,
    pub message: String,
    pub name: String,
    pub http_status_code: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TeamUser {
    pub user_id: i64,
    pub role_id: i64,
}

/// A team from `GET /api/teams`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Team {
    pub id: i64,
    pub organization_id: i64,
    pub name: String,
    pub default_role_id: Option<i64>,
    pub auto_add_users: bool,
    pub unique_identifier: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub team_users: Vec<TeamUser>,
    pub team_release_groups_count: i64,
    pub team_projects_count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkedAccount {
    pub name: Option<String>,
    pub email: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TeamRef {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserTeam {
    pub role_id: i64,
    pub team: TeamRef,
}

/// A user from `GET /api/users`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub email_verified: bool,
    pub full_name: String,
    pub role: Option<String>,
    #[serde(rename = "organizationId")]
    pub organization_id: i64,
    pub enabled: bool,
    pub joined: Option<DateTime<Utc>>,
    pub last_visit: Option<DateTime<Utc>>,
    #[serde(rename = "createdAt")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(rename = "updatedAt")]
    pub updated_at: Option<DateTime<Utc>>,
    pub github: LinkedAccount,
    #[serde(rename = "bitbucketCloud")]
    pub bitbucket: LinkedAccount,
    #[serde(rename = "teamUsers")]
    pub team_users: Vec<UserTeam>,
}

impl User {
    /// GitHub handle linked to the FOSSA account, empty when none.
    pub fn github_name(&self) -> &str {
        self.github.name.as_deref().unwrap_or_default()
    }

    fn matches_email(&self, target: &str) -> bool {
        let candidates = [
            Some(self.email.as_str()),
            self.github.email.as_deref(),
            self.bitbucket.email.as_deref(),
        ];
        candidates
            .into_iter()
            .flatten()
            .any(|email| normalize_email(email) == target)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TeamMember {
    pub user_id: i64,
    pub role_id: i64,
    pub username: String,
    pub email: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TeamMembers {
    pub results: Vec<TeamMember>,
    pub page_size: i64,
    pub page: i64,
    pub total_count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportedProject {
    pub title: String,
    pub locator: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImportedProjects {
    pub results: Vec<ImportedProject>,
    pub page_size: i64,
    pub page: i64,
    pub total_count: i64,
}

/// Operations the onboarding server and the importer need from FOSSA.
#[async_trait]
pub trait FossaApi: Send + Sync {
    async fn fetch_users(&self) -> Result<Vec<User>, FossaError>;

    /// Raw body of `GET /user-invitations`.
    async fn fetch_user_invitations(&self) -> Result<String, FossaError>;

    /// Case-insensitive search for `email` in the active invitations. Does not
    /// depend on the shape of the invitation listing.
    async fn has_pending_invitation(&self, email: &str) -> Result<bool, FossaError> {
        let body = self.fetch_user_invitations().await?;
        Ok(body.to_lowercase().contains(&email.to_lowercase()))
    }

    async fn send_user_invitation(&self, email: &str) -> Result<(), FossaError>;

    async fn fetch_teams(&self) -> Result<Vec<Team>, FossaError>;

    async fn fetch_team(&self, name: &str) -> Result<Team, FossaError> {
        self.fetch_teams()
            .await?
            .into_iter()
            .find(|t| t.name == name)
            .ok_or_else(|| FossaError::TeamNotFound(name.to_string()))
    }

    async fn fetch_teams_map(&self) -> Result<HashMap<String, Team>, FossaError> {
        Ok(self
            .fetch_teams()
            .await?
            .into_iter()
            .map(|t| (t.name.clone(), t))
            .collect())
    }

    async fn get_team(&self, team_id: i64) -> Result<Team, FossaError>;

    async fn fetch_team_user_emails(&self, team_id: i64) -> Result<Vec<String>, FossaError>;

    async fn add_user_to_team_by_email(
        &self,
        team_id: i64,
        email: &str,
        role_id: i64,
    ) -> Result<(), FossaError>;

    /// Creates the team, or returns the existing one if FOSSA reports it
    /// already exists.
    async fn create_team(&self, name: &str) -> Result<Team, FossaError>;

    /// Total number of imported projects and the first page of them.
    async fn fetch_imported_repos(
        &self,
        team_id: i64,
    ) -> Result<(i64, ImportedProjects), FossaError>;
}

#[derive(Clone)]
pub struct FossaClient {
    client: reqwest::Client,
    token: String,
    api_base: String,
    organization_id: i64,
}

impl FossaClient {
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_base(token, DEFAULT_API_BASE, DEFAULT_ORGANIZATION_ID)
    }

    pub fn with_base(
        token: impl Into<String>,
        api_base: impl Into<String>,
        organization_id: i64,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            token: token.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            organization_id,
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.api_base, path))
            .bearer_auth(&self.token)
            .header("Accept", "application/json")
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        path: &str,
    ) -> Result<T, FossaError> {
        let response = self.request(Method::GET, path).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if status != StatusCode::OK {
            return Err(FossaError::Status {
                operation,
                status: status.as_u16(),
                body,
            });
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn find_user_id_by_email(&self, email: &str) -> Result<i64, FossaError> {
        let target = normalize_email(email);
        if target.is_empty() {
            return Err(FossaError::UserNotFound(email.to_string()));
        }
        self.fetch_users()
            .await?
            .into_iter()
            .find(|u| u.matches_email(&target))
            .map(|u| u.id)
            .ok_or_else(|| FossaError::UserNotFound(email.to_string()))
    }
}

/// Decodes a FOSSA error body, mapping the codes callers treat as idempotent.
fn api_error(operation: &'static str, status: StatusCode, body: &str) -> FossaError {
    match serde_json::from_str::<ApiError>(body) {
        Ok(err) if err.code == ERR_CODE_INVITE_ALREADY_EXISTS => {
            FossaError::InviteAlreadyExists(err.message)
        }
        Ok(err) if err.code == ERR_CODE_USER_ALREADY_MEMBER => {
            FossaError::UserAlreadyMember(err.message)
        }
        Ok(err) if err.code != 0 => FossaError::Api {
            operation,
            code: err.code,
            status: status.as_u16(),
            message: err.message,
        },
        _ => FossaError::Status {
            operation,
            status: status.as_u16(),
            body: body.to_string(),
        },
    }
}

#[async_trait]
impl FossaApi for FossaClient {
    async fn fetch_users(&self) -> Result<Vec<User>, FossaError> {
        let mut all = Vec::new();
        let mut page = 0;
        loop {
            let path = format!("/users?count={USERS_PAGE_SIZE}&page={page}");
            let users: Vec<User> = self.get_json("fetch users", &path).await?;
            let last = users.len() < USERS_PAGE_SIZE;
            all.extend(users);
            if last {
                break;
            }
            page += 1;
        }
        debug!(pages = page + 1, users = all.len(), "fetched FOSSA users");
        Ok(all)
    }

    async fn fetch_user_invitations(&self) -> Result<String, FossaError> {
        let response = self.request(Method::GET, "/user-invitations").send().await?;
        let status = response.status();
        let body = response.text().await?;
        if status != StatusCode::OK {
            return Err(FossaError::Status {
                operation: "fetch user invitations",
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }

    async fn send_user_invitation(&self, email: &str) -> Result<(), FossaError> {
        let path = format!("/organizations/{}/invite", self.organization_id);
        let response = self
            .request(Method::POST, &path)
            .json(&json!({ "email": email }))
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::OK {
            return Ok(());
        }
        let body = response.text().await?;
        Err(api_error("send user invitation", status, &body))
    }

    async fn fetch_teams(&self) -> Result<Vec<Team>, FossaError> {
        self.get_json("list teams", "/teams").await
    }

    async fn get_team(&self, team_id: i64) -> Result<Team, FossaError> {
        self.get_json("get team", &format!("/teams/{team_id}")).await
    }

    async fn fetch_team_user_emails(&self, team_id: i64) -> Result<Vec<String>, FossaError> {
        let members: TeamMembers = self
            .get_json("list team users", &format!("/teams/{team_id}/members"))
            .await?;
        Ok(members.results.into_iter().map(|m| m.email).collect())
    }

    async fn add_user_to_team_by_email(
        &self,
        team_id: i64,
        email: &str,
        role_id: i64,
    ) -> Result<(), FossaError> {
        let user_id = self.find_user_id_by_email(email).await?;
        info!(team_id, user_id, role_id, "adding FOSSA user to team");

        let mut user = json!({ "id": user_id });
        if role_id != 0 {
            user["roleId"] = json!(role_id);
        }
        let response = self
            .request(Method::PUT, &format!("/teams/{team_id}/users"))
            .json(&json!({ "users": [user], "action": "add" }))
            .send()
            .await?;
        let status = response.status();
        if matches!(
            status,
            StatusCode::OK | StatusCode::CREATED | StatusCode::NO_CONTENT
        ) {
            return Ok(());
        }
        let body = response.text().await?;
        Err(api_error("add user to team", status, &body))
    }

    async fn create_team(&self, name: &str) -> Result<Team, FossaError> {
        let response = self
            .request(Method::POST, "/teams")
            .json(&json!({ "name": name }))
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if matches!(status, StatusCode::OK | StatusCode::CREATED) {
            return Ok(serde_json::from_str(&body)?);
        }

        if let Ok(err) = serde_json::from_str::<ApiError>(&body) {
            if err.code == ERR_CODE_TEAM_ALREADY_EXISTS {
                debug!(team = name, "FOSSA team already exists, fetching it");
                return self.fetch_team(name).await;
            }
        }
        Err(api_error("create team", status, &body))
    }

    async fn fetch_imported_repos(
        &self,
        team_id: i64,
    ) -> Result<(i64, ImportedProjects), FossaError> {
        self.get_team(team_id).await?;
        let repos: ImportedProjects = self
            .get_json("list imported projects", &format!("/teams/{team_id}/projects"))
            .await?;
        Ok((repos.total_count, repos))
    }
}

fn normalize_email(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Id of the team called `name`.
pub fn get_team_id(teams: &[Team], name: &str) -> Result<i64, FossaError> {
    teams
        .iter()
        .find(|t| t.name == name)
        .map(|t| t.id)
        .ok_or_else(|| FossaError::TeamNotFound(name.to_string()))
}

/// Markdown bullet list linking each imported project to its repository.
pub fn imported_project_links(projects: &ImportedProjects) -> String {
    let mut out = String::new();
    for project in projects.results.iter().filter(|p| !p.title.is_empty()) {
        let link = format_locator(&project.locator).unwrap_or_else(|| project.locator.clone());
        out.push_str(&format!("- [{}]({})\n", project.title, link));
    }
    out.trim().to_string()
}

/// Turns a FOSSA locator such as `git+github.com/org/repo` into an https URL.
pub fn format_locator(locator: &str) -> Option<String> {
    if locator.is_empty() {
        return None;
    }
    let mut loc = locator.strip_prefix("git+").unwrap_or(locator).to_string();
    if !loc.starts_with("http") && !loc.contains("://") {
        loc = format!("https://{loc}");
    }

    let url = Url::parse(&loc).ok()?;
    url.host_str().filter(|h| !h.is_empty())?;
    Some(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_locator() {
        assert_eq!(
            format_locator("git+github.com/cncf/foo").as_deref(),
            Some("https://github.com/cncf/foo")
        );
        assert_eq!(
            format_locator("https://gitlab.com/org/bar.git").as_deref(),
            Some("https://gitlab.com/org/bar.git")
        );
        assert_eq!(format_locator(""), None);
    }

    #[test]
    fn test_imported_project_links() {
        let projects = ImportedProjects {
            results: vec![
                ImportedProject {
                    title: "cncf/foo".into(),
                    locator: "git+github.com/cncf/foo".into(),
                },
                ImportedProject {
                    title: String::new(),
                    locator: "git+github.com/cncf/skipped".into(),
                },
                ImportedProject {
                    title: "cncf/bar".into(),
                    locator: "git+github.com/cncf/bar".into(),
                },
            ],
            total_count: 3,
            ..Default::default()
        };

        assert_eq!(
            imported_project_links(&projects),
            "- [cncf/foo](https://github.com/cncf/foo)\n- [cncf/bar](https://github.com/cncf/bar)"
        );
        assert_eq!(imported_project_links(&ImportedProjects::default()), "");
    }

    #[test]
    fn test_get_team_id() {
        let teams = vec![
            Team { id: 7, name: "envoy".into(), ..Default::default() },
            Team { id: 9, name: "etcd".into(), ..Default::default() },
        ];
        assert_eq!(get_team_id(&teams, "etcd").unwrap(), 9);
        assert!(matches!(
            get_team_id(&teams, "nats"),
            Err(FossaError::TeamNotFound(name)) if name == "nats"
        ));
    }

    #[test]
    fn test_api_error_codes() {
        let invite = api_error(
            "send user invitation",
            StatusCode::BAD_REQUEST,
            r#"{"code":2011,"message":"pending"}"#,
        );
        assert!(matches!(invite, FossaError::InviteAlreadyExists(_)));
        assert!(invite.is_already_done());

        let member = api_error("add user to team", StatusCode::CONFLICT, r#"{"code":2001,"message":"member"}"#);
        assert!(matches!(member, FossaError::UserAlreadyMember(_)));

        let other = api_error("create team", StatusCode::BAD_REQUEST, r#"{"code":1234,"message":"nope"}"#);
        assert!(matches!(other, FossaError::Api { code: 1234, .. }));

        let raw = api_error("create team", StatusCode::BAD_GATEWAY, "upstream down");
        assert!(matches!(raw, FossaError::Status { status: 502, .. }));
    }

    #[test]
    fn test_user_decoding_and_email_match() {
        let user: User = serde_json::from_str(
            r#"{
                "id": 42,
                "email": "Alice@Example.com",
                "full_name": "Alice",
                "github": {"name": "alice", "email": "alice@users.github.com"},
                "bitbucketCloud": {"name": null, "email": null},
                "teamUsers": [{"roleId": 3, "team": {"id": 7, "name": "envoy"}}],
                "last_visit": "2024-05-01T10:00:00Z"
            }"#,
        )
        .unwrap();

        assert_eq!(user.github_name(), "alice");
        assert_eq!(user.team_users[0].team.name, "envoy");
        assert!(user.matches_email("alice@example.com"));
        assert!(user.matches_email("alice@users.github.com"));
        assert!(!user.matches_email("bob@example.com"));
        assert!(user.last_visit.is_some());
    }
}
