//! In-memory FOSSA and GitHub doubles plus a seeded listener for the
//! onboarding tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use prometheus_client::registry::Registry;

use super::{EventListener, SharedListener};
use crate::db::testing::{seed_project_data, store};
use crate::fossa::{FossaApi, FossaError, ImportedProjects, Team, User};
use crate::github::{
    Account, Comment, GitHubApi, GitHubError, Issue, IssueCommentEvent, IssueRef, IssuesEvent,
    Label, Repository,
};
use crate::metrics::WebhookMetrics;
use crate::model::Project;

pub const SECRET: &[u8] = b"test-secret";

#[derive(Default)]
struct FossaState {
    existing_users: BTreeSet<String>,
    pending: BTreeSet<String>,
    invitations_sent: Vec<String>,
    teams: BTreeMap<i64, String>,
    team_members: BTreeMap<i64, Vec<String>>,
    teams_created: Vec<String>,
    imported: BTreeMap<i64, ImportedProjects>,
    create_team_error: Option<String>,
    next_team_id: i64,
}

#[derive(Default)]
pub struct MockFossa {
    state: Mutex<FossaState>,
}

impl MockFossa {
    fn state(&self) -> std::sync::MutexGuard<'_, FossaState> {
        self.state.lock().unwrap()
    }

    pub fn set_user_exists(&self, email: &str) {
        self.state().existing_users.insert(email.to_string());
    }

    pub fn set_pending(&self, email: &str) {
        self.state().pending.insert(email.to_string());
    }

    pub fn add_team(&self, id: i64, name: &str) -> i64 {
        let mut state = self.state();
        state.teams.insert(id, name.to_string());
        state.team_members.entry(id).or_default();
        id
    }

    pub fn set_imported_repos(&self, team_id: i64, repos: ImportedProjects) {
        self.state().imported.insert(team_id, repos);
    }

    pub fn fail_create_team(&self, message: &str) {
        self.state().create_team_error = Some(message.to_string());
    }

    pub fn teams_created(&self) -> Vec<String> {
        self.state().teams_created.clone()
    }

    pub fn invitations_sent(&self) -> Vec<String> {
        self.state().invitations_sent.clone()
    }

    pub fn members_added(&self, team_id: i64) -> Vec<String> {
        self.state()
            .team_members
            .get(&team_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl FossaApi for MockFossa {
    async fn fetch_users(&self) -> Result<Vec<User>, FossaError> {
        Ok(Vec::new())
    }

    async fn fetch_user_invitations(&self) -> Result<String, FossaError> {
        let state = self.state();
        Ok(state.pending.iter().cloned().collect::<Vec<_>>().join(","))
    }

    async fn has_pending_invitation(&self, email: &str) -> Result<bool, FossaError> {
        Ok(self.state().pending.contains(email))
    }

    async fn send_user_invitation(&self, email: &str) -> Result<(), FossaError> {
        let mut state = self.state();
        state.invitations_sent.push(email.to_string());
        if state.existing_users.contains(email) {
            return Err(FossaError::UserAlreadyMember(email.to_string()));
        }
        if !state.pending.insert(email.to_string()) {
            return Err(FossaError::InviteAlreadyExists(email.to_string()));
        }
        Ok(())
    }

    async fn fetch_teams(&self) -> Result<Vec<Team>, FossaError> {
        Ok(self
            .state()
            .teams
            .iter()
            .map(|(id, name)| Team {
                id: *id,
                name: name.clone(),
                ..Default::default()
            })
            .collect())
    }

    async fn get_team(&self, team_id: i64) -> Result<Team, FossaError> {
        self.state()
            .teams
            .get(&team_id)
            .map(|name| Team {
                id: team_id,
                name: name.clone(),
                ..Default::default()
            })
            .ok_or_else(|| FossaError::TeamNotFound(team_id.to_string()))
    }

    async fn fetch_team_user_emails(&self, team_id: i64) -> Result<Vec<String>, FossaError> {
        self.state()
            .team_members
            .get(&team_id)
            .cloned()
            .ok_or_else(|| FossaError::TeamNotFound(team_id.to_string()))
    }

    async fn add_user_to_team_by_email(
        &self,
        team_id: i64,
        email: &str,
        _role_id: i64,
    ) -> Result<(), FossaError> {
        let mut state = self.state();
        if !state.existing_users.contains(email) {
            return Err(FossaError::UserNotFound(email.to_string()));
        }
        let members = state
            .team_members
            .get_mut(&team_id)
            .ok_or_else(|| FossaError::TeamNotFound(team_id.to_string()))?;
        if members.iter().any(|m| m == email) {
            return Err(FossaError::UserAlreadyMember(email.to_string()));
        }
        members.push(email.to_string());
        Ok(())
    }

    async fn create_team(&self, name: &str) -> Result<Team, FossaError> {
        let mut state = self.state();
        if let Some(message) = &state.create_team_error {
            return Err(FossaError::Status {
                operation: "create team",
                status: 500,
                body: message.clone(),
            });
        }
        let id = 1000 + state.next_team_id;
        state.next_team_id += 1;
        state.teams.insert(id, name.to_string());
        state.team_members.insert(id, Vec::new());
        state.teams_created.push(name.to_string());
        Ok(Team {
            id,
            name: name.to_string(),
            ..Default::default()
        })
    }

    async fn fetch_imported_repos(
        &self,
        team_id: i64,
    ) -> Result<(i64, ImportedProjects), FossaError> {
        Ok(match self.state().imported.get(&team_id) {
            Some(repos) => (repos.results.len() as i64, repos.clone()),
            None => (0, ImportedProjects::default()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedComment {
    pub owner: String,
    pub repo: String,
    pub number: u64,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddedLabels {
    pub owner: String,
    pub repo: String,
    pub number: u64,
    pub labels: Vec<String>,
}

#[derive(Default)]
pub struct MockGitHub {
    comments: Mutex<Vec<PostedComment>>,
    labels: Mutex<Vec<AddedLabels>>,
}

impl MockGitHub {
    pub fn comments(&self) -> Vec<PostedComment> {
        self.comments.lock().unwrap().clone()
    }

    pub fn labels(&self) -> Vec<AddedLabels> {
        self.labels.lock().unwrap().clone()
    }
}

#[async_trait]
impl GitHubApi for MockGitHub {
    async fn create_comment(&self, issue: IssueRef<'_>, body: &str) -> Result<(), GitHubError> {
        self.comments.lock().unwrap().push(PostedComment {
            owner: issue.owner.to_string(),
            repo: issue.repo.to_string(),
            number: issue.number,
            body: body.to_string(),
        });
        Ok(())
    }

    async fn add_labels(&self, issue: IssueRef<'_>, labels: &[&str]) -> Result<(), GitHubError> {
        self.labels.lock().unwrap().push(AddedLabels {
            owner: issue.owner.to_string(),
            repo: issue.repo.to_string(),
            number: issue.number,
            labels: labels.iter().map(|l| l.to_string()).collect(),
        });
        Ok(())
    }
}

pub struct Harness {
    pub listener: SharedListener,
    pub fossa: Arc<MockFossa>,
    pub github: Arc<MockGitHub>,
    pub project: Project,
}

impl Harness {
    /// Listener over a database holding `test-project` with maintainers
    /// alice and bob.
    pub async fn seeded() -> Self {
        let store = store().await;
        let (project, _) = seed_project_data(&store).await;
        let fossa = Arc::new(MockFossa::default());
        let github = Arc::new(MockGitHub::default());
        let mut registry = Registry::default();

        let listener = Arc::new(EventListener {
            store,
            fossa: fossa.clone(),
            github: github.clone(),
            secret: SECRET.to_vec(),
            metrics: WebhookMetrics::new(&mut registry),
        });
        Self {
            listener,
            fossa,
            github,
            project,
        }
    }

    pub async fn add_staff(&self, github_account: &str) {
        sqlx::query("INSERT INTO staff_members (name, github_account) VALUES (?, ?)")
            .bind(github_account)
            .bind(github_account)
            .execute(self.listener.store.pool())
            .await
            .unwrap();
    }

    pub async fn audit_actions(&self) -> Vec<String> {
        sqlx::query_scalar("SELECT action FROM audit_logs ORDER BY id")
            .fetch_all(self.listener.store.pool())
            .await
            .unwrap()
    }
}

fn onboarding_repository() -> Repository {
    Repository {
        name: "onboarding".into(),
        full_name: "cncf/onboarding".into(),
        owner: Account {
            login: "cncf".into(),
        },
    }
}

fn onboarding_issue(project: &str, number: u64, assignees: &[&str]) -> Issue {
    Issue {
        number,
        title: format!("[PROJECT ONBOARDING] {project}"),
        url: format!("https://api.github.com/repos/cncf/onboarding/issues/{number}"),
        html_url: format!("https://github.com/cncf/onboarding/issues/{number}"),
        assignees: assignees
            .iter()
            .map(|login| Account {
                login: login.to_string(),
            })
            .collect(),
        ..Default::default()
    }
}

pub fn issue_labeled_event(project: &str, label: &str, number: u64) -> IssuesEvent {
    let mut issue = onboarding_issue(project, number, &[]);
    issue.labels.push(Label { name: label.into() });
    IssuesEvent {
        action: "labeled".into(),
        issue,
        label: Some(Label { name: label.into() }),
        repository: onboarding_repository(),
        sender: Account {
            login: "cncf-staff".into(),
        },
    }
}

pub fn issue_comment_event(
    project: &str,
    body: &str,
    author: &str,
    number: u64,
    assignees: &[&str],
) -> IssueCommentEvent {
    let user = Account {
        login: author.into(),
    };
    IssueCommentEvent {
        action: "created".into(),
        issue: onboarding_issue(project, number, assignees),
        comment: Comment {
            body: body.into(),
            user: user.clone(),
        },
        repository: onboarding_repository(),
        sender: user,
    }
}
