use tracing::{error, info, warn};

use super::{project_name_from_title, EventListener};
use crate::github::{IssueCommentEvent, IssueRef};

/// Labels that may be requested with `/label <name>`, with the service each
/// one onboards the project to.
pub const ALLOWED_LABELS: [(&str, &str); 2] = [("fossa", "CNCF FOSSA"), ("snyk", "CNCF Snyk")];

fn service_for_label(label: &str) -> Option<&'static str> {
    ALLOWED_LABELS
        .iter()
        .find(|(name, _)| *name == label)
        .map(|(_, service)| *service)
}

impl EventListener {
    /// `/label <name>` lets maintainers, assignees and foundation staff choose
    /// the services a project is onboarded to.
    pub(super) async fn handle_label_command(&self, event: &IssueCommentEvent) {
        let issue = IssueRef::of(&event.repository, &event.issue);
        let actor = event.comment.user.login.as_str();

        let args: Vec<&str> = event.comment.body.split_whitespace().collect();
        let [_, requested] = args.as_slice() else {
            let msg = format!(
                "@{actor}, Invalid command format. Use `/label fossa` or `/label snyk`."
            );
            self.update_issue(issue, &msg).await;
            self.metrics.command("label", "invalid");
            return;
        };

        let label = requested.to_lowercase();
        let Some(service) = service_for_label(&label) else {
            let msg = format!(
                "@{actor}, Invalid label `{requested}`. Allowed labels are `fossa` and `snyk`."
            );
            self.update_issue(issue, &msg).await;
            self.metrics.command("label", "invalid");
            return;
        };

        let project = match project_name_from_title(&event.issue.title) {
            Ok(name) => match self.store.get_project_by_name(&name).await {
                Ok(Some(project)) => project,
                Ok(None) => {
                    let msg = format!(
                        "@{actor}, project `{name}` was not found in the maintainer-d database."
                    );
                    self.update_issue(issue, &msg).await;
                    self.metrics.command("label", "not_found");
                    return;
                }
                Err(e) => {
                    error!(project = %name, "failed to load project: {e}");
                    self.metrics.command("label", "error");
                    return;
                }
            },
            Err(e) => {
                warn!("could not parse project name from issue title: {e}");
                let msg = format!(
                    "@{actor}, the project for this issue was not found: the title should read `[PROJECT ONBOARDING] <project>` as registered in the maintainer-d database."
                );
                self.update_issue(issue, &msg).await;
                self.metrics.command("label", "not_found");
                return;
            }
        };

        let authorized = self
            .is_maintainer_or_assignee(project.id, actor, &event.issue)
            .await
            || self
                .store
                .is_staff_github_account(actor)
                .await
                .unwrap_or_else(|e| {
                    warn!(actor, "staff lookup failed: {e}");
                    false
                });
        if !authorized {
            let msg = format!(
                "@{actor}, you have not yet been registered as a maintainer of {} in the maintainer-d database, so you cannot add labels to this issue. Please contact @cncf-projects-team.",
                project.name
            );
            self.update_issue(issue, &msg).await;
            self.metrics.command("label", "unauthorized");
            return;
        }

        if let Err(e) = self.github.add_labels(issue, &[label.as_str()]).await {
            error!(label = %label, issue = issue.number, "failed to add label: {e}");
            let msg = format!(
                "@{actor}, the `{label}` label could not be added to this issue. Please retry or contact @cncf-projects-team."
            );
            self.update_issue(issue, &msg).await;
            self.metrics.command("label", "error");
            return;
        }

        info!(actor, label = %label, project = %project.name, "label added");
        let msg = format!(
            "@{actor}, the `{label}` label has been added. {} onboarding for {} will start shortly.",
            service, project.name
        );
        self.update_issue(issue, &msg).await;
        self.metrics.command("label", "ok");
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;

    async fn run(harness: &Harness, project: &str, body: &str, actor: &str, number: u64) {
        let event = issue_comment_event(project, body, actor, number, &[]);
        harness.listener.handle_label_command(&event).await;
    }

    #[tokio::test]
    async fn test_label_fossa() {
        let harness = Harness::seeded().await;
        run(&harness, "test-project", "/label fossa", "alice", 100).await;

        let labels = harness.github.labels();
        assert_eq!(labels.len(), 1);
        assert_eq!(labels[0].owner, "cncf");
        assert_eq!(labels[0].repo, "onboarding");
        assert_eq!(labels[0].number, 100);
        assert_eq!(labels[0].labels, vec!["fossa"]);

        let comments = harness.github.comments();
        assert_eq!(comments.len(), 1);
        assert!(comments[0].body.contains("@alice"));
        assert!(comments[0].body.contains("`fossa`"));
        assert!(comments[0].body.contains("CNCF FOSSA"));
    }

    #[tokio::test]
    async fn test_label_snyk() {
        let harness = Harness::seeded().await;
        run(&harness, "test-project", "/label snyk", "bob", 101).await;

        assert_eq!(harness.github.labels()[0].labels, vec!["snyk"]);
        let body = &harness.github.comments()[0].body;
        assert!(body.contains("@bob"));
        assert!(body.contains("CNCF Snyk"));
    }

    #[tokio::test]
    async fn test_label_unauthorized() {
        let harness = Harness::seeded().await;
        run(&harness, "test-project", "/label fossa", "unauthorized-user", 102).await;

        assert!(harness.github.labels().is_empty());
        let body = &harness.github.comments()[0].body;
        assert!(body.contains("@unauthorized-user"));
        assert!(body.contains("not yet been registered"));
    }

    #[tokio::test]
    async fn test_label_allowed_for_staff_and_assignees() {
        let harness = Harness::seeded().await;
        harness.add_staff("cncf-staffer").await;
        run(&harness, "test-project", "/label fossa", "CNCF-Staffer", 110).await;

        let event = issue_comment_event("test-project", "/label snyk", "carol", 111, &["carol"]);
        harness.listener.handle_label_command(&event).await;

        let labels = harness.github.labels();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels[1].labels, vec!["snyk"]);
    }

    #[tokio::test]
    async fn test_label_invalid_name() {
        let harness = Harness::seeded().await;
        run(&harness, "test-project", "/label invalid", "alice", 103).await;

        assert!(harness.github.labels().is_empty());
        let body = &harness.github.comments()[0].body;
        assert!(body.contains("Invalid label"));
        assert!(body.contains("invalid"));
        assert!(body.contains("fossa"));
        assert!(body.contains("snyk"));
    }

    #[tokio::test]
    async fn test_label_invalid_format() {
        let harness = Harness::seeded().await;
        run(&harness, "test-project", "/label", "alice", 104).await;
        run(&harness, "test-project", "/label fossa snyk", "alice", 104).await;

        assert!(harness.github.labels().is_empty());
        for comment in harness.github.comments() {
            assert!(comment.body.contains("Invalid"));
            assert!(comment.body.contains("/label fossa"));
            assert!(comment.body.contains("/label snyk"));
        }
    }

    #[tokio::test]
    async fn test_label_project_not_found() {
        let harness = Harness::seeded().await;
        run(&harness, "non-existent-project", "/label fossa", "alice", 105).await;

        assert!(harness.github.labels().is_empty());
        let body = &harness.github.comments()[0].body;
        assert!(body.contains("not found"));
        assert!(body.contains("maintainer-d database"));
    }

    #[tokio::test]
    async fn test_label_case_insensitive() {
        let harness = Harness::seeded().await;
        run(&harness, "test-project", "/label FOSSA", "alice", 106).await;

        assert_eq!(harness.github.labels()[0].labels, vec!["fossa"]);
        let body = &harness.github.comments()[0].body;
        assert!(body.contains("@alice"));
        assert!(body.contains("fossa"));
    }
}
