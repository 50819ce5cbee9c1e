use std::collections::HashMap;
use std::time::Duration;

use sqlx::{FromRow, SqlitePool};
use thiserror::Error;
use tracing::error;

use crate::model::{
    AuditLog, Company, Maintainer, Project, Service, ServiceTeam, StaffMember,
};

/// Name of the FOSSA row in `services`.
pub const FOSSA_SERVICE: &str = "FOSSA";

const PING_TIMEOUT: Duration = Duration::from_secs(2);

const MAINTAINER_SELECT: &str = "SELECT m.id, m.name, m.email, m.github_account, m.github_email, \
     m.maintainer_status, m.import_warnings, m.registered_at, m.company_id, c.name AS company_name \
     FROM maintainers m LEFT JOIN companies c ON c.id = m.company_id";

const PROJECT_SELECT: &str = "SELECT p.id, p.name, p.parent_project_id, p.maturity, \
     p.maintainer_ref, p.onboarding_issue, p.mailing_list FROM projects p";

const SERVICE_TEAM_SELECT: &str = "SELECT id, project_id, service_id, service_team_id, \
     service_team_name, project_name FROM service_teams";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("project not found")]
    ProjectNotFound,
    #[error("service {0:?} not found")]
    ServiceNotFound(String),
    #[error("database ping timed out after {0:?}")]
    PingTimeout(Duration),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(FromRow)]
struct ProjectMaintainerRow {
    project_id: i64,
    #[sqlx(flatten)]
    maintainer: Maintainer,
}

#[derive(Clone)]
pub struct SqlStore {
    pool: SqlitePool,
}

impl SqlStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        let query = sqlx::query("SELECT 1").execute(&self.pool);
        match tokio::time::timeout(PING_TIMEOUT, query).await {
            Ok(result) => result.map(|_| ()).map_err(StoreError::from),
            Err(_) => Err(StoreError::PingTimeout(PING_TIMEOUT)),
        }
    }

    pub async fn get_service_by_name(&self, name: &str) -> Result<Service, StoreError> {
        sqlx::query_as::<_, Service>("SELECT id, name, description FROM services WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::ServiceNotFound(name.to_string()))
    }

    /// Fills `maintainers` on every project with a single join query.
    async fn attach_maintainers(&self, projects: &mut [Project]) -> Result<(), StoreError> {
        if projects.is_empty() {
            return Ok(());
        }
        let sql = "SELECT mp.project_id, m.id, m.name, m.email, m.github_account, m.github_email, \
             m.maintainer_status, m.import_warnings, m.registered_at, m.company_id, \
             c.name AS company_name \
             FROM maintainer_projects mp \
             JOIN maintainers m ON m.id = mp.maintainer_id \
             LEFT JOIN companies c ON c.id = m.company_id \
             ORDER BY m.id";
        let rows = sqlx::query_as::<_, ProjectMaintainerRow>(sql)
            .fetch_all(&self.pool)
            .await?;

        let mut by_project: HashMap<i64, Vec<Maintainer>> = HashMap::new();
        for row in rows {
            by_project.entry(row.project_id).or_default().push(row.maintainer);
        }
        for project in projects.iter_mut() {
            project.maintainers = by_project.remove(&project.id).unwrap_or_default();
        }
        Ok(())
    }

    pub async fn get_projects_using_service(
        &self,
        service_id: i64,
    ) -> Result<Vec<Project>, StoreError> {
        let sql = format!(
            "{PROJECT_SELECT} WHERE p.id IN \
             (SELECT st.project_id FROM service_teams st WHERE st.service_id = ?) ORDER BY p.id"
        );
        let mut projects = sqlx::query_as::<_, Project>(&sql)
            .bind(service_id)
            .fetch_all(&self.pool)
            .await?;
        self.attach_maintainers(&mut projects).await?;
        Ok(projects)
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
        let sql = format!("{PROJECT_SELECT} ORDER BY p.id");
        let mut projects = sqlx::query_as::<_, Project>(&sql)
            .fetch_all(&self.pool)
            .await?;
        self.attach_maintainers(&mut projects).await?;
        Ok(projects)
    }

    pub async fn get_project_map_by_name(&self) -> Result<HashMap<String, Project>, StoreError> {
        Ok(self
            .list_projects()
            .await?
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect())
    }

    pub async fn get_project_by_name(&self, name: &str) -> Result<Option<Project>, StoreError> {
        let sql = format!("{PROJECT_SELECT} WHERE p.name = ?");
        let Some(project) = sqlx::query_as::<_, Project>(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };
        let mut projects = [project];
        self.attach_maintainers(&mut projects).await?;
        let [project] = projects;
        Ok(Some(project))
    }

    pub async fn get_maintainers_by_project(
        &self,
        project_id: i64,
    ) -> Result<Vec<Maintainer>, StoreError> {
        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM projects WHERE id = ?")
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Err(StoreError::ProjectNotFound);
        }

        let sql = format!(
            "{MAINTAINER_SELECT} JOIN maintainer_projects mp ON mp.maintainer_id = m.id \
             WHERE mp.project_id = ? ORDER BY m.id"
        );
        Ok(sqlx::query_as::<_, Maintainer>(&sql)
            .bind(project_id)
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn list_maintainers(&self) -> Result<Vec<Maintainer>, StoreError> {
        let sql = format!("{MAINTAINER_SELECT} ORDER BY m.id");
        Ok(sqlx::query_as::<_, Maintainer>(&sql)
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn get_maintainer_map_by_email(
        &self,
    ) -> Result<HashMap<String, Maintainer>, StoreError> {
        Ok(self
            .list_maintainers()
            .await?
            .into_iter()
            .map(|m| (m.email.clone(), m))
            .collect())
    }

    pub async fn get_maintainer_map_by_github_account(
        &self,
    ) -> Result<HashMap<String, Maintainer>, StoreError> {
        Ok(self
            .list_maintainers()
            .await?
            .into_iter()
            .map(|m| (m.github_account.clone(), m))
            .collect())
    }

    /// Maps project id to its team on the service called `service_name`.
    pub async fn get_project_service_team_map(
        &self,
        service_name: &str,
    ) -> Result<HashMap<i64, ServiceTeam>, StoreError> {
        let service = self.get_service_by_name(service_name).await?;
        let sql = format!("{SERVICE_TEAM_SELECT} WHERE service_id = ? ORDER BY id");
        let teams = sqlx::query_as::<_, ServiceTeam>(&sql)
            .bind(service.id)
            .fetch_all(&self.pool)
            .await?;
        Ok(teams.into_iter().map(|st| (st.project_id, st)).collect())
    }

    pub async fn get_service_team_by_project(
        &self,
        project_id: i64,
        service_id: i64,
    ) -> Result<Option<ServiceTeam>, StoreError> {
        let sql = format!("{SERVICE_TEAM_SELECT} WHERE project_id = ? AND service_id = ?");
        Ok(sqlx::query_as::<_, ServiceTeam>(&sql)
            .bind(project_id)
            .bind(service_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Writes an audit row. Failures are logged and swallowed.
    pub async fn log_audit_event(&self, mut event: AuditLog) {
        if event.message.is_empty() {
            event.message = event.action.clone();
        }
        let result = sqlx::query(
            "INSERT INTO audit_logs (project_id, maintainer_id, service_id, action, message, metadata)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(event.project_id)
        .bind(event.maintainer_id)
        .bind(event.service_id)
        .bind(&event.action)
        .bind(&event.message)
        .bind(&event.metadata)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            error!(action = %event.action, project_id = event.project_id, "failed to write audit log: {e}");
        }
    }

    /// Returns the FOSSA team row for `remote_team_id`, creating it for the
    /// project when it does not exist yet.
    pub async fn create_service_team(
        &self,
        project_id: i64,
        project_name: &str,
        remote_team_id: i64,
        team_name: &str,
    ) -> Result<ServiceTeam, StoreError> {
        let fossa = self.get_service_by_name(FOSSA_SERVICE).await?;
        let sql = format!("{SERVICE_TEAM_SELECT} WHERE service_team_id = ? AND service_id = ?");
        if let Some(existing) = sqlx::query_as::<_, ServiceTeam>(&sql)
            .bind(remote_team_id)
            .bind(fossa.id)
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok(existing);
        }

        Ok(sqlx::query_as::<_, ServiceTeam>(
            "INSERT INTO service_teams (project_id, service_id, service_team_id, service_team_name, project_name)
             VALUES (?, ?, ?, ?, ?)
             RETURNING id, project_id, service_id, service_team_id, service_team_name, project_name",
        )
        .bind(project_id)
        .bind(fossa.id)
        .bind(remote_team_id)
        .bind(team_name)
        .bind(project_name)
        .fetch_one(&self.pool)
        .await?)
    }

    pub async fn list_companies(&self) -> Result<Vec<Company>, StoreError> {
        Ok(
            sqlx::query_as::<_, Company>("SELECT id, name FROM companies ORDER BY id")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn list_staff_members(&self) -> Result<Vec<StaffMember>, StoreError> {
        Ok(sqlx::query_as::<_, StaffMember>(
            "SELECT s.id, s.name, s.email, s.github_account, s.github_email, s.registered_at, \
             s.foundation_id, f.name AS foundation_name \
             FROM staff_members s LEFT JOIN foundations f ON f.id = s.foundation_id ORDER BY s.id",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn is_staff_github_account(&self, github_account: &str) -> Result<bool, StoreError> {
        if github_account.is_empty() {
            return Ok(false);
        }
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM staff_members WHERE LOWER(github_account) = ?",
        )
        .bind(github_account.to_lowercase())
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::*;
    use crate::model::{Maturity, MaintainerStatus};

    struct Fixture {
        store: SqlStore,
        company: i64,
        kubernetes: i64,
        prometheus: i64,
        alice: i64,
        bob: i64,
        charlie: i64,
    }

    async fn fixture() -> Fixture {
        let store = store().await;
        let company = insert_company(&store, "Test Company").await;
        let kubernetes = insert_project(&store, "kubernetes", "Graduated").await;
        let prometheus = insert_project(&store, "prometheus", "Graduated").await;
        let alice = insert_maintainer(&store, "Alice Developer", "alice@example.com", "alice", "Active", Some(company)).await;
        let bob = insert_maintainer(&store, "Bob Engineer", "bob@example.com", "bob", "Active", Some(company)).await;
        let charlie = insert_maintainer(&store, "Charlie Contributor", "charlie@example.com", "charlie", "Emeritus", Some(company)).await;
        link(&store, alice, kubernetes).await;
        link(&store, bob, kubernetes).await;
        link(&store, bob, prometheus).await;
        link(&store, charlie, prometheus).await;
        Fixture { store, company, kubernetes, prometheus, alice, bob, charlie }
    }

    #[tokio::test]
    async fn test_maintainers_by_project() {
        let f = fixture().await;

        let maintainers = f.store.get_maintainers_by_project(f.kubernetes).await.unwrap();
        let ids: Vec<i64> = maintainers.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![f.alice, f.bob]);
        for m in &maintainers {
            assert_eq!(m.company_id, Some(f.company));
            assert_eq!(m.company_name.as_deref(), Some("Test Company"));
        }

        let maintainers = f.store.get_maintainers_by_project(f.prometheus).await.unwrap();
        let ids: Vec<i64> = maintainers.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![f.bob, f.charlie]);
        assert_eq!(maintainers[1].maintainer_status, MaintainerStatus::Emeritus);
    }

    #[tokio::test]
    async fn test_maintainers_by_project_empty_and_missing() {
        let f = fixture().await;
        let empty = insert_project(&f.store, "empty-project", "Sandbox").await;

        assert!(f.store.get_maintainers_by_project(empty).await.unwrap().is_empty());
        assert!(matches!(
            f.store.get_maintainers_by_project(99_999).await,
            Err(StoreError::ProjectNotFound)
        ));
    }

    #[tokio::test]
    async fn test_project_map_carries_maintainers() {
        let f = fixture().await;
        let projects = f.store.get_project_map_by_name().await.unwrap();

        assert_eq!(projects.len(), 2);
        let k8s = &projects["kubernetes"];
        assert_eq!(k8s.maturity, Some(Maturity::Graduated));
        assert_eq!(k8s.maintainers.len(), 2);
        assert_eq!(k8s.maintainers[0].github_account, "alice");
        assert_eq!(k8s.maintainers[0].company_name.as_deref(), Some("Test Company"));

        assert!(f.store.get_project_by_name("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_projects_using_service() {
        let f = fixture().await;
        let fossa = insert_service(&f.store, FOSSA_SERVICE).await;
        insert_service_team(&f.store, f.prometheus, fossa, 42, "prometheus").await;

        let projects = f.store.get_projects_using_service(fossa).await.unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].name, "prometheus");
        assert_eq!(projects[0].maintainers.len(), 2);

        let team = f.store.get_service_team_by_project(f.prometheus, fossa).await.unwrap();
        assert_eq!(team.map(|t| t.service_team_id), Some(42));
        assert!(f.store.get_service_team_by_project(f.kubernetes, fossa).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_service_team_map_and_create() {
        let f = fixture().await;
        assert!(matches!(
            f.store.get_project_service_team_map(FOSSA_SERVICE).await,
            Err(StoreError::ServiceNotFound(_))
        ));

        insert_service(&f.store, FOSSA_SERVICE).await;
        let created = f.store.create_service_team(f.kubernetes, "kubernetes", 1001, "kubernetes").await.unwrap();
        let again = f.store.create_service_team(f.kubernetes, "kubernetes", 1001, "kubernetes").await.unwrap();
        assert_eq!(created, again);

        let map = f.store.get_project_service_team_map(FOSSA_SERVICE).await.unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map[&f.kubernetes].service_team_id, 1001);
        assert_eq!(map[&f.kubernetes].project_name.as_deref(), Some("kubernetes"));
    }

    #[tokio::test]
    async fn test_maintainer_maps() {
        let f = fixture().await;
        let by_email = f.store.get_maintainer_map_by_email().await.unwrap();
        assert_eq!(by_email["bob@example.com"].id, f.bob);
        let by_handle = f.store.get_maintainer_map_by_github_account().await.unwrap();
        assert_eq!(by_handle["charlie"].email, "charlie@example.com");
    }

    #[tokio::test]
    async fn test_audit_event_defaults_message() {
        let f = fixture().await;
        f.store
            .log_audit_event(AuditLog {
                project_id: f.kubernetes,
                maintainer_id: Some(f.alice),
                action: "FOSSA_ADD_MEMBER".to_string(),
                ..Default::default()
            })
            .await;

        let (action, message): (String, String) =
            sqlx::query_as("SELECT action, message FROM audit_logs")
                .fetch_one(f.store.pool())
                .await
                .unwrap();
        assert_eq!(action, "FOSSA_ADD_MEMBER");
        assert_eq!(message, "FOSSA_ADD_MEMBER");
    }

    #[tokio::test]
    async fn test_staff_lookup() {
        let f = fixture().await;
        let foundation: i64 = sqlx::query_scalar("INSERT INTO foundations (name) VALUES ('CNCF') RETURNING id")
            .fetch_one(f.store.pool())
            .await
            .unwrap();
        sqlx::query("INSERT INTO staff_members (name, email, github_account, foundation_id) VALUES ('Dana', 'dana@cncf.io', 'DanaStaff', ?)")
            .bind(foundation)
            .execute(f.store.pool())
            .await
            .unwrap();

        assert!(f.store.is_staff_github_account("danastaff").await.unwrap());
        assert!(!f.store.is_staff_github_account("alice").await.unwrap());
        assert!(!f.store.is_staff_github_account("").await.unwrap());

        let staff = f.store.list_staff_members().await.unwrap();
        assert_eq!(staff[0].foundation_name.as_deref(), Some("CNCF"));
        assert_eq!(f.store.list_companies().await.unwrap().len(), 1);
        f.store.ping().await.unwrap();
    }
}
