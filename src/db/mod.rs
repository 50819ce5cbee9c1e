pub mod backup;
pub mod bootstrap;
mod store;

pub use store::{SqlStore, StoreError, FOSSA_SERVICE};

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info};

/// Execute a migration file statement by statement, skipping comment lines.
async fn execute_sql(pool: &SqlitePool, sql: &str) -> Result<(), sqlx::Error> {
    for statement in sql.split(';') {
        let cleaned: String = statement
            .lines()
            .filter(|line| !line.trim().starts_with("--"))
            .collect::<Vec<_>>()
            .join("\n");
        let trimmed = cleaned.trim();
        if !trimmed.is_empty() {
            sqlx::query(trimmed).execute(pool).await?;
        }
    }
    Ok(())
}

async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    debug!("running database migrations");
    execute_sql(pool, include_str!("../../migrations/001_initial.sql")).await
}

/// Opens (creating if needed) the SQLite database at `path` and migrates it.
pub async fn open(path: impl AsRef<Path>) -> Result<SqlStore, StoreError> {
    let path = path.as_ref();
    info!(path = %path.display(), "opening database");

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;
    Ok(SqlStore::new(pool))
}

/// A private in-memory database. The pool is pinned to one connection that
/// never expires, since every SQLite memory connection is its own database.
pub async fn open_in_memory() -> Result<SqlStore, StoreError> {
    let options = SqliteConnectOptions::new()
        .in_memory(true)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None::<Duration>)
        .max_lifetime(None::<Duration>)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;
    Ok(SqlStore::new(pool))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::model::{Maintainer, Project};

    pub async fn store() -> SqlStore {
        open_in_memory().await.expect("in-memory database")
    }

    pub async fn insert_company(store: &SqlStore, name: &str) -> i64 {
        sqlx::query_scalar("INSERT INTO companies (name) VALUES (?) RETURNING id")
            .bind(name)
            .fetch_one(store.pool())
            .await
            .unwrap()
    }

    pub async fn insert_service(store: &SqlStore, name: &str) -> i64 {
        sqlx::query_scalar("INSERT INTO services (name) VALUES (?) RETURNING id")
            .bind(name)
            .fetch_one(store.pool())
            .await
            .unwrap()
    }

    pub async fn insert_project(store: &SqlStore, name: &str, maturity: &str) -> i64 {
        sqlx::query_scalar("INSERT INTO projects (name, maturity) VALUES (?, ?) RETURNING id")
            .bind(name)
            .bind(maturity)
            .fetch_one(store.pool())
            .await
            .unwrap()
    }

    pub async fn insert_maintainer(
        store: &SqlStore,
        name: &str,
        email: &str,
        github: &str,
        status: &str,
        company_id: Option<i64>,
    ) -> i64 {
        sqlx::query_scalar(
            "INSERT INTO maintainers (name, email, github_account, maintainer_status, company_id)
             VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(name)
        .bind(email)
        .bind(github)
        .bind(status)
        .bind(company_id)
        .fetch_one(store.pool())
        .await
        .unwrap()
    }

    pub async fn link(store: &SqlStore, maintainer_id: i64, project_id: i64) {
        sqlx::query("INSERT INTO maintainer_projects (maintainer_id, project_id) VALUES (?, ?)")
            .bind(maintainer_id)
            .bind(project_id)
            .execute(store.pool())
            .await
            .unwrap();
    }

    pub async fn insert_service_team(
        store: &SqlStore,
        project_id: i64,
        service_id: i64,
        remote_id: i64,
        name: &str,
    ) {
        sqlx::query(
            "INSERT INTO service_teams (project_id, service_id, service_team_id, service_team_name, project_name)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(project_id)
        .bind(service_id)
        .bind(remote_id)
        .bind(name)
        .bind(name)
        .execute(store.pool())
        .await
        .unwrap();
    }

    /// `test-project` (Graduated) with maintainers alice and bob of "Test
    /// Company", plus the FOSSA service row.
    pub async fn seed_project_data(store: &SqlStore) -> (Project, Vec<Maintainer>) {
        insert_service(store, FOSSA_SERVICE).await;
        let company = insert_company(store, "Test Company").await;
        let project_id = insert_project(store, "test-project", "Graduated").await;
        let alice = insert_maintainer(
            store,
            "Alice Developer",
            "alice@example.com",
            "alice",
            "Active",
            Some(company),
        )
        .await;
        let bob = insert_maintainer(
            store,
            "Bob Engineer",
            "bob@example.com",
            "bob",
            "Active",
            Some(company),
        )
        .await;
        link(store, alice, project_id).await;
        link(store, bob, project_id).await;

        let project = store
            .get_project_by_name("test-project")
            .await
            .unwrap()
            .expect("seeded project");
        let maintainers = project.maintainers.clone();
        (project, maintainers)
    }
}
