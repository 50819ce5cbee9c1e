use std::fmt::Write as _;

use tracing::{debug, error, info, warn};

use super::{project_name_from_title, EventListener, OnboardingError};
use crate::db::FOSSA_SERVICE;
use crate::fossa::{imported_project_links, FossaError, TEAM_ADMIN_ROLE};
use crate::github::{IssueCommentEvent, IssueRef, IssuesEvent};
use crate::model::{AuditLog, Maintainer, Project};

const FOSSA_TEAMS_URL: &str = "https://app.fossa.com/account/settings/organization/teams";

fn handles(maintainers: &[&Maintainer]) -> String {
    maintainers
        .iter()
        .map(|m| format!("@{}", m.github_account))
        .collect::<Vec<_>>()
        .join(" ")
}

impl EventListener {
    /// Signs `project_name` up for FOSSA and reports what happened on the
    /// onboarding issue.
    pub(super) async fn fossa_chosen(&self, project_name: &str, event: &IssuesEvent) {
        let issue = IssueRef::of(&event.repository, &event.issue);
        let project = match self.store.get_project_by_name(project_name).await {
            Ok(Some(project)) => project,
            Ok(None) => {
                warn!(project = project_name, "onboarding project not found");
                let msg = format!(
                    "Project `{project_name}` was not found in the maintainer-d database, @cncf-projects-team please register it before onboarding."
                );
                self.update_issue(issue, &msg).await;
                self.metrics.command("fossa_onboarding", "not_found");
                return;
            }
            Err(e) => {
                error!(project = project_name, "failed to load project: {e}");
                self.metrics.command("fossa_onboarding", "error");
                return;
            }
        };

        let mut actions = Vec::new();
        let result = self.sign_project_up_for_fossa(&project, &mut actions).await;

        let mut comment = String::from(
            "### maintainer-d CNCF FOSSA onboarding - Report\n\n\
             #### :spiral_notepad: Actions taken during onboarding...\n\n",
        );
        for action in &actions {
            let _ = writeln!(comment, "- {action}");
        }
        match &result {
            Err(e) => {
                error!(project = %project.name, "FOSSA onboarding failed: {e}");
                let _ = write!(comment, "\n❌ Onboarding encountered some problems: `{e}`\n");
                self.metrics.command("fossa_onboarding", "error");
            }
            Ok(()) => {
                comment.push_str(
                    "---\n\n\
                     When you have accepted your invitation to join CNCF FOSSA :\n\n\
                     - Add a comment _/fossa-invite accepted_ to this issue, the maintainer-d onboarding process will add you to your team as a **Team Admin** ([FOSSA RBAC](https://docs.fossa.com/docs/role-based-access-control#team-roles)).\n\n\
                     - then, _and only then_, can you start importing your code and documentation repositories into FOSSA: [Getting Started Guide](https://docs.fossa.com/docs/getting-started#importing-a-project).\n\n",
                );
                self.metrics.command("fossa_onboarding", "ok");
            }
        }
        self.update_issue(issue, &comment).await;
    }

    /// Ensures the project has a FOSSA team, invites its maintainers, and
    /// adds the ones already on FOSSA as Team Admins. Every step is recorded
    /// in `actions` using GitHub handles only.
    pub(super) async fn sign_project_up_for_fossa(
        &self,
        project: &Project,
        actions: &mut Vec<String>,
    ) -> Result<(), OnboardingError> {
        let maintainers = match self.store.get_maintainers_by_project(project.id).await {
            Ok(m) => m,
            Err(source) => {
                actions.push(format!(
                    ":x: {} maintainers not present in db, @cncf-projects-team check maintainer-d db",
                    project.name
                ));
                return Err(OnboardingError::Maintainers {
                    project: project.name.clone(),
                    source,
                });
            }
        };
        actions.push(format!(
            "✅ {} has {} maintainers registered in maintainer-d",
            project.name,
            maintainers.len()
        ));

        let team_id = self.ensure_fossa_team(project, actions).await;

        if maintainers.is_empty() {
            actions.push(format!(
                "Maintainers not yet registered, for project {}",
                project.name
            ));
            return Err(OnboardingError::NoMaintainers(project.name.clone()));
        }

        let fossa_service_id = self
            .store
            .get_service_by_name(FOSSA_SERVICE)
            .await
            .ok()
            .map(|s| s.id);

        let mut invited = Vec::new();
        let mut existing = Vec::new();
        for maintainer in &maintainers {
            match self.fossa.send_user_invitation(&maintainer.email).await {
                Ok(()) => {
                    invited.push(maintainer);
                    self.store
                        .log_audit_event(AuditLog {
                            project_id: project.id,
                            maintainer_id: Some(maintainer.id),
                            service_id: fossa_service_id,
                            action: "FOSSA_INVITE_SENT".to_string(),
                            message: format!("Invited @{} to CNCF FOSSA", maintainer.github_account),
                            ..Default::default()
                        })
                        .await;
                }
                Err(FossaError::InviteAlreadyExists(_)) => actions.push(format!(
                    "@{} : you have a pending invitation to join CNCF FOSSA. Please check your registered email and accept the invitation within 48 hours.",
                    maintainer.github_account
                )),
                Err(FossaError::UserAlreadyMember(_)) => existing.push(maintainer),
                Err(e) => {
                    warn!(maintainer = %maintainer.github_account, "error sending FOSSA invite: {e}");
                    actions.push(format!(
                        "@{} : there was a problem sending out a CNCF FOSSA invitation to you, a CNCF Staff member will contact you.",
                        maintainer.github_account
                    ));
                }
            }
        }
        if !invited.is_empty() {
            actions.push(format!(
                "✅ Invitation(s) to join CNCF FOSSA sent to {}",
                handles(&invited)
            ));
        }

        // Team Admin adds and the imported repo report need a team.
        let Some(team_id) = team_id else {
            return Ok(());
        };

        let mut added = Vec::new();
        for maintainer in existing {
            match self
                .fossa
                .add_user_to_team_by_email(team_id, &maintainer.email, TEAM_ADMIN_ROLE)
                .await
            {
                Ok(()) | Err(FossaError::UserAlreadyMember(_)) => {
                    added.push(maintainer);
                    self.audit_member_added(project, maintainer, fossa_service_id).await;
                }
                Err(e) => {
                    warn!(maintainer = %maintainer.github_account, team_id, "failed to add FOSSA user to team: {e}");
                    actions.push(format!(
                        "@{} : you are a CNCF FOSSA User but could not be added to the {} team, a CNCF Staff member will follow up.",
                        maintainer.github_account, project.name
                    ));
                }
            }
        }
        if !added.is_empty() {
            actions.push(format!(
                "✅ Existing CNCF FOSSA Users added to the team as Team Admins: {}",
                handles(&added)
            ));
        }

        // A project set up by hand earlier may already have imported repos.
        match self.fossa.fetch_imported_repos(team_id).await {
            Ok((0, _)) => actions.push(format!(
                "The {} project has not yet imported repos",
                project.name
            )),
            Ok((count, repos)) => actions.push(format!(
                "The {} project team have imported {} repo(s)<BR>{}",
                project.name,
                count,
                imported_project_links(&repos)
            )),
            Err(e) => {
                error!(team_id, "failed to fetch imported repos: {e}");
                actions.push(format!("Error occurred during FetchImportedRepos {e}"));
            }
        }

        Ok(())
    }

    /// Remote id of the project's FOSSA team, creating and recording the team
    /// when it does not exist yet. `None` when the team could not be created.
    async fn ensure_fossa_team(&self, project: &Project, actions: &mut Vec<String>) -> Option<i64> {
        match self.store.get_project_service_team_map(FOSSA_SERVICE).await {
            Ok(teams) => {
                if let Some(st) = teams.get(&project.id) {
                    actions.push(format!(
                        "👥 [{} team]({FOSSA_TEAMS_URL}/{}) was already in FOSSA",
                        project.name, st.service_team_id
                    ));
                    return Some(st.service_team_id);
                }
            }
            Err(e) => actions.push(format!(":warning: Problem retrieving serviceTeams. {e}")),
        }

        let team = match self.fossa.create_team(&project.name).await {
            Ok(team) => team,
            Err(e) => {
                error!(project = %project.name, "failed to create FOSSA team: {e}");
                actions.push(format!(
                    ":x: Problem creating team on FOSSA for {}: {e}",
                    project.name
                ));
                return None;
            }
        };
        info!(team = %team.name, team_id = team.id, "FOSSA team created");
        actions.push(format!(
            "👥 [{} team]({FOSSA_TEAMS_URL}/{}) has been created in FOSSA",
            team.name, team.id
        ));

        match self
            .store
            .create_service_team(project.id, &project.name, team.id, &team.name)
            .await
        {
            Ok(st) => {
                self.store
                    .log_audit_event(AuditLog {
                        project_id: project.id,
                        service_id: Some(st.service_id),
                        action: "FOSSA_CREATE_TEAM".to_string(),
                        message: format!("Created FOSSA team {} ({})", team.name, team.id),
                        ..Default::default()
                    })
                    .await;
            }
            Err(e) => warn!(project = %project.name, "failed to record FOSSA service team: {e}"),
        }
        Some(team.id)
    }

    async fn audit_member_added(
        &self,
        project: &Project,
        maintainer: &Maintainer,
        service_id: Option<i64>,
    ) {
        self.store
            .log_audit_event(AuditLog {
                project_id: project.id,
                maintainer_id: Some(maintainer.id),
                service_id,
                action: "FOSSA_ADD_MEMBER".to_string(),
                message: format!(
                    "Added @{} to FOSSA team {}",
                    maintainer.github_account, project.name
                ),
                ..Default::default()
            })
            .await;
    }

    /// `/fossa-invite accepted`: adds the project's maintainers who have
    /// accepted their invitation to the FOSSA team.
    pub(super) async fn handle_fossa_invite_accepted(&self, event: &IssueCommentEvent) {
        let issue = IssueRef::of(&event.repository, &event.issue);
        let project_name = match project_name_from_title(&event.issue.title) {
            Ok(name) => name,
            Err(e) => {
                warn!("could not parse project name from issue title: {e}");
                return;
            }
        };
        let project = match self.store.get_project_by_name(&project_name).await {
            Ok(Some(project)) => project,
            Ok(None) => {
                warn!(project = %project_name, "project not found");
                return;
            }
            Err(e) => {
                error!(project = %project_name, "failed to load project: {e}");
                return;
            }
        };

        let actor = &event.comment.user.login;
        if !self
            .is_maintainer_or_assignee(project.id, actor, &event.issue)
            .await
        {
            self.update_issue(issue, "You are not authorized to perform this action.")
                .await;
            self.metrics.command("fossa_invite_accepted", "unauthorized");
            return;
        }
        info!(actor = %actor, project = %project.name, "/fossa-invite accepted");

        let team_id = match self.store.get_project_service_team_map(FOSSA_SERVICE).await {
            Ok(teams) => teams
                .get(&project.id)
                .map(|st| st.service_team_id)
                .filter(|id| *id != 0),
            Err(e) => {
                error!("could not get FOSSA team map: {e}");
                self.metrics.command("fossa_invite_accepted", "error");
                return;
            }
        };
        let Some(team_id) = team_id else {
            let msg = format!(
                "FOSSA team for project {:?} was not found. Please add the 'fossa' label to the onboarding issue to create the team, then re-run this command.",
                project.name
            );
            self.update_issue(issue, &msg).await;
            self.metrics.command("fossa_invite_accepted", "no_team");
            return;
        };

        let mut actions = Vec::new();
        let result = self
            .add_project_maintainers_to_fossa_team(&project, team_id, &mut actions)
            .await;

        let mut comment = format!(
            "### maintainer-d - CNCF FOSSA Team Membership Update\n\nProject: {}\n\n",
            project.name
        );
        for action in &actions {
            let _ = writeln!(comment, "- {action}");
        }
        match result {
            Ok(()) => self.metrics.command("fossa_invite_accepted", "ok"),
            Err(e) => {
                error!(project = %project.name, "adding maintainers to FOSSA team failed: {e}");
                let _ = write!(comment, "\nNote: encountered some errors: {e}\n");
                self.metrics.command("fossa_invite_accepted", "error");
            }
        }
        self.update_issue(issue, &comment).await;
    }

    /// Adds every registered maintainer without a pending invitation, who is
    /// not a member yet, to the team as Team Admin.
    pub(super) async fn add_project_maintainers_to_fossa_team(
        &self,
        project: &Project,
        team_id: i64,
        actions: &mut Vec<String>,
    ) -> Result<(), OnboardingError> {
        debug!(project = %project.name, project_id = project.id, team_id, "adding maintainers to FOSSA team");

        let maintainers = self.store.get_maintainers_by_project(project.id).await?;
        if maintainers.is_empty() {
            actions.push("No registered maintainers found for this project".to_string());
            return Ok(());
        }

        let mut members = self.fossa.fetch_team_user_emails(team_id).await?;
        let fossa_service_id = self
            .store
            .get_service_by_name(FOSSA_SERVICE)
            .await
            .ok()
            .map(|s| s.id);

        for m in &maintainers {
            let handle = &m.github_account;
            let pending = self
                .fossa
                .has_pending_invitation(&m.email)
                .await
                .unwrap_or_else(|e| {
                    warn!(maintainer = %handle, "checking pending invite failed: {e}");
                    false
                });
            if pending {
                actions.push(format!("@{handle}: invitation still pending; skipped"));
                continue;
            }
            if members.iter().any(|e| e == &m.email) {
                actions.push(format!("@{handle}: already a member; no action"));
                continue;
            }

            match self
                .fossa
                .add_user_to_team_by_email(team_id, &m.email, TEAM_ADMIN_ROLE)
                .await
            {
                Ok(()) => {}
                Err(FossaError::UserAlreadyMember(_)) => {
                    actions.push(format!("@{handle}: already a member; no action"));
                    continue;
                }
                Err(e) => {
                    error!(maintainer = %handle, "failed to add user to FOSSA team: {e}");
                    actions.push(format!(
                        "@{handle}: error adding to team; please retry or contact support"
                    ));
                    continue;
                }
            }

            actions.push(format!(
                "@{handle}: added to FOSSA team {} as Team Admin",
                project.name
            ));
            self.audit_member_added(project, m, fossa_service_id).await;
            members.push(m.email.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use crate::fossa::{ImportedProject, ImportedProjects};

    #[tokio::test]
    async fn test_fossa_chosen_new_team() {
        let harness = Harness::seeded().await;
        let event = issue_labeled_event("test-project", "fossa", 42);

        harness.listener.fossa_chosen("test-project", &event).await;

        assert_eq!(harness.fossa.teams_created(), vec!["test-project"]);
        let sent = harness.fossa.invitations_sent();
        assert_eq!(sent, vec!["alice@example.com", "bob@example.com"]);

        let comments = harness.github.comments();
        assert_eq!(comments.len(), 1);
        let comment = &comments[0];
        assert_eq!(comment.owner, "cncf");
        assert_eq!(comment.repo, "onboarding");
        assert_eq!(comment.number, 42);
        assert!(comment.body.contains("maintainer-d CNCF FOSSA onboarding"));
        assert!(comment.body.contains("test-project has 2 maintainers"));
        assert!(comment.body.contains("has been created in FOSSA"));
        assert!(comment.body.contains("/fossa-invite accepted"));
        assert!(comment.body.contains("sent to @alice @bob"));
        assert!(!comment.body.contains("example.com"));

        let team = harness
            .listener
            .store
            .get_project_service_team_map(crate::db::FOSSA_SERVICE)
            .await
            .unwrap();
        assert_eq!(team[&harness.project.id].service_team_id, 1000);
        assert_eq!(
            harness.audit_actions().await,
            vec!["FOSSA_CREATE_TEAM", "FOSSA_INVITE_SENT", "FOSSA_INVITE_SENT"]
        );
    }

    #[tokio::test]
    async fn test_fossa_chosen_pending_invitation() {
        let harness = Harness::seeded().await;
        harness.fossa.set_pending("alice@example.com");

        harness
            .listener
            .fossa_chosen("test-project", &issue_labeled_event("test-project", "fossa", 42))
            .await;

        let body = &harness.github.comments()[0].body;
        assert!(body.contains("@alice : you have a pending invitation"));
        assert!(body.contains("Invitation(s) to join CNCF FOSSA sent to @bob"));
    }

    #[tokio::test]
    async fn test_fossa_chosen_existing_fossa_user() {
        let harness = Harness::seeded().await;
        harness.fossa.set_user_exists("alice@example.com");

        harness
            .listener
            .fossa_chosen("test-project", &issue_labeled_event("test-project", "fossa", 42))
            .await;

        let body = &harness.github.comments()[0].body;
        assert!(body.contains("Existing CNCF FOSSA Users added to the team as Team Admins: @alice"));
        assert_eq!(harness.fossa.members_added(1000), vec!["alice@example.com"]);
        assert!(harness.audit_actions().await.contains(&"FOSSA_ADD_MEMBER".to_string()));
    }

    #[tokio::test]
    async fn test_fossa_chosen_existing_team_reports_repos() {
        let harness = Harness::seeded().await;
        harness
            .listener
            .store
            .create_service_team(harness.project.id, "test-project", 77, "test-project")
            .await
            .unwrap();
        harness.fossa.add_team(77, "test-project");
        harness.fossa.set_imported_repos(
            77,
            ImportedProjects {
                results: vec![ImportedProject {
                    title: "cncf/test".into(),
                    locator: "git+github.com/cncf/test".into(),
                }],
                total_count: 1,
                ..Default::default()
            },
        );

        harness
            .listener
            .fossa_chosen("test-project", &issue_labeled_event("test-project", "fossa", 42))
            .await;

        assert!(harness.fossa.teams_created().is_empty());
        let body = &harness.github.comments()[0].body;
        assert!(body.contains("was already in FOSSA"));
        assert!(body.contains("have imported 1 repo(s)<BR>- [cncf/test](https://github.com/cncf/test)"));
    }

    #[tokio::test]
    async fn test_fossa_chosen_unknown_project() {
        let harness = Harness::seeded().await;
        harness
            .listener
            .fossa_chosen("ghost", &issue_labeled_event("ghost", "fossa", 5))
            .await;

        assert!(harness.fossa.teams_created().is_empty());
        let body = &harness.github.comments()[0].body;
        assert!(body.contains("not found in the maintainer-d database"));
    }

    #[tokio::test]
    async fn test_sign_up_create_team_failure() {
        let harness = Harness::seeded().await;
        harness.fossa.fail_create_team("boom");

        let mut actions = Vec::new();
        harness
            .listener
            .sign_project_up_for_fossa(&harness.project, &mut actions)
            .await
            .unwrap();

        assert!(actions.iter().any(|a| a.contains("Problem creating team on FOSSA")));
        let mut invited = harness.fossa.invitations_sent();
        invited.sort();
        assert_eq!(invited, vec!["alice@example.com", "bob@example.com"]);
        assert!(actions.iter().any(|a| a.contains("Invitation(s) to join CNCF FOSSA sent to")));
        assert!(!actions.iter().any(|a| a.contains("imported")));
        assert!(harness.fossa.teams_created().is_empty());
    }

    #[tokio::test]
    async fn test_invite_accepted_adds_maintainers() {
        let harness = Harness::seeded().await;
        let team = harness.fossa.add_team(1000, "test-project");
        harness
            .listener
            .store
            .create_service_team(harness.project.id, "test-project", team, "test-project")
            .await
            .unwrap();
        harness.fossa.set_user_exists("alice@example.com");
        harness.fossa.set_pending("bob@example.com");

        let event = issue_comment_event("test-project", "/fossa-invite accepted", "alice", 9, &[]);
        harness.listener.handle_fossa_invite_accepted(&event).await;

        assert_eq!(harness.fossa.members_added(team), vec!["alice@example.com"]);
        let body = &harness.github.comments()[0].body;
        assert!(body.contains("CNCF FOSSA Team Membership Update"));
        assert!(body.contains("@alice: added to FOSSA team test-project as Team Admin"));
        assert!(body.contains("@bob: invitation still pending; skipped"));

        // Running again is a no-op for members.
        harness.listener.handle_fossa_invite_accepted(&event).await;
        let body = &harness.github.comments()[1].body;
        assert!(body.contains("@alice: already a member; no action"));
        assert_eq!(harness.fossa.members_added(team).len(), 1);
    }

    #[tokio::test]
    async fn test_invite_accepted_authorization() {
        let harness = Harness::seeded().await;

        let stranger = issue_comment_event("test-project", "/fossa-invite accepted", "mallory", 9, &[]);
        harness.listener.handle_fossa_invite_accepted(&stranger).await;
        assert_eq!(
            harness.github.comments()[0].body,
            "You are not authorized to perform this action."
        );

        // Assignees are allowed; no team yet, so they are told to label the issue.
        let assignee = issue_comment_event("test-project", "/fossa-invite accepted", "carol", 9, &["carol"]);
        harness.listener.handle_fossa_invite_accepted(&assignee).await;
        let body = &harness.github.comments()[1].body;
        assert!(body.contains("FOSSA team for project \"test-project\" was not found"));
    }
}
