//! GitHub webhook receiver driving project onboarding.
//!
//! Onboarding issues are titled `[PROJECT ONBOARDING] <project>`. Labelling
//! one `fossa` signs the project up for FOSSA; comments on it can confirm
//! accepted invitations or request labels.

mod label;
mod signup;
#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Instant;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use regex::Regex;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::db::{SqlStore, StoreError};
use crate::fossa::{FossaApi, FossaError};
use crate::github::{
    self, GitHubApi, IssueCommentEvent, IssueRef, IssuesEvent, EVENT_HEADER, SIGNATURE_HEADER,
};
use crate::metrics::WebhookMetrics;

pub const FOSSA_INVITE_ACCEPTED: &str = "/fossa-invite accepted";
pub const LABEL_COMMAND: &str = "/label";
const FOSSA_LABEL: &str = "fossa";

static TITLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\[PROJECT ONBOARDING\]\s*(\S.*?)\s*$").expect("valid onboarding title regex")
});

#[derive(Debug, Error)]
pub enum OnboardingError {
    #[error("issue title {0:?} is not a project onboarding title")]
    InvalidTitle(String),
    #[error("maintainers not found for project {project}: {source}")]
    Maintainers {
        project: String,
        #[source]
        source: StoreError,
    },
    #[error("no maintainers found for project {0}")]
    NoMaintainers(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Fossa(#[from] FossaError),
}

/// Extracts `<project>` from `[PROJECT ONBOARDING] <project>`.
pub fn project_name_from_title(title: &str) -> Result<String, OnboardingError> {
    TITLE_RE
        .captures(title)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| OnboardingError::InvalidTitle(title.to_string()))
}

pub struct EventListener {
    pub store: SqlStore,
    pub fossa: Arc<dyn FossaApi>,
    pub github: Arc<dyn GitHubApi>,
    /// Webhook secret. Signature checks are skipped when empty.
    pub secret: Vec<u8>,
    pub metrics: WebhookMetrics,
}

pub type SharedListener = Arc<EventListener>;

pub fn router(listener: SharedListener) -> Router {
    Router::new()
        .route("/webhook", post(handle_webhook))
        .route("/healthz", get(healthz))
        .layer(DefaultBodyLimit::max(5 * 1024 * 1024))
        .with_state(listener)
}

pub async fn healthz(State(listener): State<SharedListener>) -> impl IntoResponse {
    match listener.store.ping().await {
        Ok(()) => (StatusCode::OK, axum::Json(json!({ "status": "ok" }))).into_response(),
        Err(e) => {
            error!("database ping failed: {e}");
            (StatusCode::SERVICE_UNAVAILABLE, "unhealthy").into_response()
        }
    }
}

fn known_event(event: &str) -> &'static str {
    match event {
        "issues" => "issues",
        "issue_comment" => "issue_comment",
        "ping" => "ping",
        _ => "other",
    }
}

pub async fn handle_webhook(
    State(listener): State<SharedListener>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let start = Instant::now();
    let event = headers
        .get(EVENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let label = known_event(&event);

    if listener.secret.is_empty() {
        warn!("webhook secret is not configured, skipping signature validation");
    } else {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !github::verify_signature(&listener.secret, signature, &body) {
            warn!(event = %event, "webhook signature verification failed");
            listener.metrics.event(label, "rejected");
            return StatusCode::UNAUTHORIZED;
        }
    }

    let status = match label {
        "issues" => match serde_json::from_slice::<IssuesEvent>(&body) {
            Ok(e) => {
                listener.on_issues_event(&e).await;
                StatusCode::OK
            }
            Err(e) => {
                warn!("could not parse issues event: {e}");
                StatusCode::BAD_REQUEST
            }
        },
        "issue_comment" => match serde_json::from_slice::<IssueCommentEvent>(&body) {
            Ok(e) => {
                listener.on_issue_comment_event(&e).await;
                StatusCode::OK
            }
            Err(e) => {
                warn!("could not parse issue_comment event: {e}");
                StatusCode::BAD_REQUEST
            }
        },
        _ => {
            debug!(event = %event, "ignoring webhook event");
            StatusCode::OK
        }
    };

    let outcome = if status.is_success() { "handled" } else { "invalid" };
    listener.metrics.event(label, outcome);
    listener
        .metrics
        .event_duration_seconds
        .observe(start.elapsed().as_secs_f64());
    status
}

impl EventListener {
    async fn on_issues_event(&self, event: &IssuesEvent) {
        if event.action != "labeled" {
            return;
        }
        let Some(label) = &event.label else {
            return;
        };
        if label.name != FOSSA_LABEL {
            debug!(label = %label.name, issue = event.issue.number, "ignoring label");
            return;
        }

        match project_name_from_title(&event.issue.title) {
            Ok(project) => {
                debug!(project = %project, url = %event.issue.url, "fossa label applied");
                self.fossa_chosen(&project, event).await;
            }
            Err(e) => warn!(url = %event.issue.url, "could not parse project name: {e}"),
        }
    }

    async fn on_issue_comment_event(&self, event: &IssueCommentEvent) {
        if event.action != "created" {
            return;
        }
        let body = event.comment.body.trim();
        if body == FOSSA_INVITE_ACCEPTED {
            self.handle_fossa_invite_accepted(event).await;
        } else if body == LABEL_COMMAND || body.starts_with(&format!("{LABEL_COMMAND} ")) {
            self.handle_label_command(event).await;
        } else {
            debug!(issue = event.issue.number, "comment does not carry a command");
        }
    }

    /// Posts `body` on the issue. Failures are logged; the webhook still
    /// succeeds.
    async fn update_issue(&self, issue: IssueRef<'_>, body: &str) {
        match self.github.create_comment(issue, body).await {
            Ok(()) => info!(
                owner = issue.owner,
                repo = issue.repo,
                issue = issue.number,
                "posted issue comment"
            ),
            Err(e) => warn!(issue = issue.number, "failed to update GitHub issue: {e}"),
        }
    }

    /// Project maintainers and issue assignees may run onboarding commands.
    async fn is_maintainer_or_assignee(
        &self,
        project_id: i64,
        actor: &str,
        issue: &github::Issue,
    ) -> bool {
        match self.store.get_maintainers_by_project(project_id).await {
            Ok(maintainers) => {
                if maintainers
                    .iter()
                    .any(|m| m.github_account.eq_ignore_ascii_case(actor))
                {
                    return true;
                }
            }
            Err(e) => warn!(project_id, "could not load maintainers: {e}"),
        }
        issue.is_assigned_to(actor)
    }
}
