//! GitHub webhook payloads, signature checks and the issue REST calls the
//! onboarding flow makes.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";
pub const EVENT_HEADER: &str = "X-GitHub-Event";
pub const DEFAULT_API_BASE: &str = "https://api.github.com";

#[derive(Debug, Error)]
pub enum GitHubError {
    #[error("github: request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("github: {operation} failed: {status} {body}")]
    Status {
        operation: &'static str,
        status: u16,
        body: String,
    },
}

/// Checks a `sha256=<hex>` HMAC of `body` in constant time.
pub fn verify_signature(secret: &[u8], header: &str, body: &[u8]) -> bool {
    let Some(signature) = header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// `sha256=<hex>` signature for `body`, as GitHub sends it.
#[cfg(test)]
pub(crate) fn sign(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Account {
    pub login: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Label {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    pub url: String,
    pub html_url: String,
    pub labels: Vec<Label>,
    pub assignee: Option<Account>,
    pub assignees: Vec<Account>,
    pub user: Option<Account>,
}

impl Issue {
    /// GitHub logins are case-insensitive.
    pub fn is_assigned_to(&self, login: &str) -> bool {
        self.assignees.iter().any(|a| a.login.eq_ignore_ascii_case(login))
            || self.assignee.as_ref().is_some_and(|a| a.login.eq_ignore_ascii_case(login))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Repository {
    pub name: String,
    pub full_name: String,
    pub owner: Account,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Comment {
    pub body: String,
    pub user: Account,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuesEvent {
    pub action: String,
    pub issue: Issue,
    #[serde(default)]
    pub label: Option<Label>,
    pub repository: Repository,
    #[serde(default)]
    pub sender: Account,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueCommentEvent {
    pub action: String,
    pub issue: Issue,
    pub comment: Comment,
    pub repository: Repository,
    #[serde(default)]
    pub sender: Account,
}

/// Issue to comment on or label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IssueRef<'a> {
    pub owner: &'a str,
    pub repo: &'a str,
    pub number: u64,
}

impl<'a> IssueRef<'a> {
    pub fn of(repository: &'a Repository, issue: &Issue) -> Self {
        Self {
            owner: &repository.owner.login,
            repo: &repository.name,
            number: issue.number,
        }
    }
}

#[async_trait]
pub trait GitHubApi: Send + Sync {
    async fn create_comment(&self, issue: IssueRef<'_>, body: &str) -> Result<(), GitHubError>;

    async fn add_labels(&self, issue: IssueRef<'_>, labels: &[&str]) -> Result<(), GitHubError>;
}

#[derive(Clone)]
pub struct GitHubClient {
    client: reqwest::Client,
    token: String,
    api_base: String,
}

impl GitHubClient {
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_base(token, DEFAULT_API_BASE)
    }

    pub fn with_base(token: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            token: token.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    async fn post(
        &self,
        operation: &'static str,
        path: String,
        body: serde_json::Value,
    ) -> Result<(), GitHubError> {
        let response = self
            .client
            .post(format!("{}{}", self.api_base, path))
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "maintainerd")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(GitHubError::Status {
                operation,
                status,
                body,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl GitHubApi for GitHubClient {
    async fn create_comment(&self, issue: IssueRef<'_>, body: &str) -> Result<(), GitHubError> {
        let path = format!(
            "/repos/{}/{}/issues/{}/comments",
            issue.owner, issue.repo, issue.number
        );
        self.post("create comment", path, json!({ "body": body }))
            .await
    }

    async fn add_labels(&self, issue: IssueRef<'_>, labels: &[&str]) -> Result<(), GitHubError> {
        let path = format!(
            "/repos/{}/{}/issues/{}/labels",
            issue.owner, issue.repo, issue.number
        );
        self.post("add labels", path, json!({ "labels": labels }))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_roundtrip_and_tamper() {
        let body = br#"{"action":"labeled"}"#;
        let header = sign(b"test-secret", body);
        assert!(header.starts_with("sha256="));
        assert!(verify_signature(b"test-secret", &header, body));
        assert!(!verify_signature(b"test-secret", &header, br#"{"action":"opened"}"#));
        assert!(!verify_signature(b"other-secret", &header, body));
    }

    #[test]
    fn test_signature_rejects_malformed_headers() {
        let body = b"payload";
        assert!(!verify_signature(b"s", "", body));
        assert!(!verify_signature(b"s", "sha1=abcdef", body));
        assert!(!verify_signature(b"s", "sha256=not-hex", body));
    }

    #[test]
    fn test_issue_comment_event_decoding() {
        let event: IssueCommentEvent = serde_json::from_str(
            r#"{
                "action": "created",
                "issue": {
                    "number": 42,
                    "title": "[PROJECT ONBOARDING] kubernetes",
                    "assignees": [{"login": "carol"}],
                    "assignee": {"login": "dave"}
                },
                "comment": {"body": "/fossa-invite accepted", "user": {"login": "alice"}},
                "repository": {"name": "onboarding", "owner": {"login": "cncf"}}
            }"#,
        )
        .unwrap();

        assert_eq!(event.comment.user.login, "alice");
        assert!(event.issue.is_assigned_to("carol"));
        assert!(event.issue.is_assigned_to("dave"));
        assert!(!event.issue.is_assigned_to("alice"));
        assert!(event.issue.is_assigned_to("Carol"));
        assert!(event.issue.is_assigned_to("DAVE"));

        let issue = IssueRef::of(&event.repository, &event.issue);
        assert_eq!(issue, IssueRef { owner: "cncf", repo: "onboarding", number: 42 });
    }
}
