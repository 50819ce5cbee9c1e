//! One-way sync of the maintainer database into namespaced Custom Resources.
//!
//! Objects are keyed by a DNS-1123 name derived from the row. Missing
//! objects are created and objects whose spec drifted are replaced. Nothing
//! is ever deleted.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Debug;
use std::sync::LazyLock;

use async_trait::async_trait;
use kube::api::{Api, PostParams};
use kube::core::NamespaceResourceScope;
use kube::core::object::HasSpec;
use kube::{Client, Resource, ResourceExt};
use regex::Regex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info};

use crate::apis::{
    Company, CompanySpec, Maintainer, MaintainerSpec, Project, ProjectMembership,
    ProjectMembershipSpec, ProjectSpec, ResourceReference, StaffMember, StaffMemberSpec,
};
use crate::db::{SqlStore, StoreError};
use crate::metrics::SyncMetrics;
use crate::model;

const MAX_NAME_LEN: usize = 63;
const FALLBACK_NAME: &str = "unnamed";

static DNS1123_INVALID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9.-]+").expect("valid DNS-1123 regex"));

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{kind}: {source}")]
    Store {
        kind: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("{kind}: {action} {name}: {source}")]
    Write {
        kind: &'static str,
        action: &'static str,
        name: String,
        #[source]
        source: kube::Error,
    },
}

/// Maps `s` to a valid object name: lowercased, runs of invalid characters
/// replaced with `-`, trimmed of `-` and `.`, at most 63 characters.
pub fn sanitize_name(s: &str) -> String {
    let lowered = s.trim().to_lowercase();
    let replaced = DNS1123_INVALID.replace_all(&lowered, "-");
    let mut name = replaced.trim_matches(|c| c == '-' || c == '.');
    if name.len() > MAX_NAME_LEN {
        // Only ASCII survives the replacement, so byte slicing is safe.
        name = name[..MAX_NAME_LEN].trim_matches(|c| c == '-' || c == '.');
    }
    if name.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        name.to_string()
    }
}

/// Custom Resources the sync writes.
pub trait Mirrored:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + HasSpec<Spec: Clone + Send + Sync>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> Mirrored for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + HasSpec<Spec: Clone + Send + Sync>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Get/create/replace by name in the sync namespace.
#[async_trait]
pub trait ObjectWriter: Send + Sync {
    async fn get<K: Mirrored>(&self, name: &str) -> Result<Option<K>, kube::Error>;

    async fn create<K: Mirrored>(&self, obj: &K) -> Result<(), kube::Error>;

    async fn replace<K: Mirrored>(&self, obj: &K) -> Result<(), kube::Error>;
}

pub struct KubeWriter {
    client: Client,
    namespace: String,
}

impl KubeWriter {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn api<K: Mirrored>(&self) -> Api<K> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

#[async_trait]
impl ObjectWriter for KubeWriter {
    async fn get<K: Mirrored>(&self, name: &str) -> Result<Option<K>, kube::Error> {
        self.api::<K>().get_opt(name).await
    }

    async fn create<K: Mirrored>(&self, obj: &K) -> Result<(), kube::Error> {
        self.api::<K>()
            .create(&PostParams::default(), obj)
            .await
            .map(|_| ())
    }

    async fn replace<K: Mirrored>(&self, obj: &K) -> Result<(), kube::Error> {
        self.api::<K>()
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await
            .map(|_| ())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Updated,
    Unchanged,
}

impl Outcome {
    fn as_str(self) -> &'static str {
        match self {
            Outcome::Created => "created",
            Outcome::Updated => "updated",
            Outcome::Unchanged => "unchanged",
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncSummary {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl SyncSummary {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Created => self.created += 1,
            Outcome::Updated => self.updated += 1,
            Outcome::Unchanged => self.unchanged += 1,
        }
    }
}

pub struct Syncer<'a, W> {
    store: &'a SqlStore,
    writer: &'a W,
    metrics: Option<&'a SyncMetrics>,
    summary: SyncSummary,
}

impl<'a, W: ObjectWriter> Syncer<'a, W> {
    pub fn new(store: &'a SqlStore, writer: &'a W) -> Self {
        Self {
            store,
            writer,
            metrics: None,
            summary: SyncSummary::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: &'a SyncMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Companies, staff, maintainers, projects, then memberships. Stops at the
    /// first failure.
    pub async fn sync_all(mut self) -> Result<SyncSummary, SyncError> {
        self.sync_companies().await?;
        self.sync_staff().await?;
        self.sync_maintainers().await?;
        self.sync_projects().await?;
        self.sync_memberships().await?;
        info!(
            created = self.summary.created,
            updated = self.summary.updated,
            unchanged = self.summary.unchanged,
            "sync completed"
        );
        Ok(self.summary)
    }

    /// Creates `desired` when absent, replaces its spec when `same` says it
    /// drifted.
    async fn upsert<K: Mirrored>(
        &mut self,
        kind: &'static str,
        desired: K,
        same: fn(&K::Spec, &K::Spec) -> bool,
    ) -> Result<Outcome, SyncError> {
        let name = desired.name_any();
        let write_err = |action, source| SyncError::Write {
            kind,
            action,
            name: name.clone(),
            source,
        };

        let outcome = match self
            .writer
            .get::<K>(&name)
            .await
            .map_err(|e| write_err("get", e))?
        {
            None => {
                self.writer
                    .create(&desired)
                    .await
                    .map_err(|e| write_err("create", e))?;
                Outcome::Created
            }
            Some(existing) if same(existing.spec(), desired.spec()) => Outcome::Unchanged,
            Some(mut existing) => {
                *existing.spec_mut() = desired.spec().clone();
                self.writer
                    .replace(&existing)
                    .await
                    .map_err(|e| write_err("update", e))?;
                Outcome::Updated
            }
        };

        debug!(kind, name = %name, outcome = outcome.as_str(), "synced object");
        if let Some(metrics) = self.metrics {
            metrics.write(kind, outcome.as_str());
        }
        self.summary.record(outcome);
        Ok(outcome)
    }

    async fn sync_companies(&mut self) -> Result<(), SyncError> {
        let store_err = |source| SyncError::Store {
            kind: "companies",
            source,
        };
        for company in self.store.list_companies().await.map_err(store_err)? {
            let obj = Company::new(&sanitize_name(&company.name), company_spec(&company));
            self.upsert("Company", obj, |a, b| a.display_name == b.display_name)
                .await?;
        }
        Ok(())
    }

    async fn sync_staff(&mut self) -> Result<(), SyncError> {
        let store_err = |source| SyncError::Store {
            kind: "staffmembers",
            source,
        };
        for staff in self.store.list_staff_members().await.map_err(store_err)? {
            let obj = StaffMember::new(&staff_object_name(&staff), staff_spec(&staff));
            self.upsert("StaffMember", obj, staff_spec_equal).await?;
        }
        Ok(())
    }

    async fn sync_maintainers(&mut self) -> Result<(), SyncError> {
        let store_err = |source| SyncError::Store {
            kind: "maintainers",
            source,
        };
        let by_email: BTreeMap<_, _> = self
            .store
            .get_maintainer_map_by_email()
            .await
            .map_err(store_err)?
            .into_iter()
            .collect();
        for (email, maintainer) in by_email {
            let obj = Maintainer::new(&sanitize_name(&email), maintainer_spec(&maintainer));
            self.upsert("Maintainer", obj, maintainer_spec_equal).await?;
        }
        Ok(())
    }

    async fn sync_projects(&mut self) -> Result<(), SyncError> {
        let projects = self.sorted_projects("projects").await?;
        let names_by_id: BTreeMap<i64, String> =
            projects.iter().map(|p| (p.id, p.name.clone())).collect();
        for project in &projects {
            let obj = Project::new(
                &sanitize_name(&project.name),
                project_spec(project, &names_by_id),
            );
            self.upsert("Project", obj, project_spec_equal).await?;
        }
        Ok(())
    }

    async fn sync_memberships(&mut self) -> Result<(), SyncError> {
        for project in self.sorted_projects("projectmemberships").await? {
            for maintainer in &project.maintainers {
                let name = sanitize_name(&format!("{}-{}", project.name, maintainer.email));
                let obj = ProjectMembership::new(&name, membership_spec(&project, maintainer));
                self.upsert("ProjectMembership", obj, |a, b| {
                    a.project_ref.name == b.project_ref.name
                        && a.maintainer_ref.name == b.maintainer_ref.name
                })
                .await?;
            }
        }
        Ok(())
    }

    async fn sorted_projects(&self, kind: &'static str) -> Result<Vec<model::Project>, SyncError> {
        let by_name: BTreeMap<_, _> = self
            .store
            .get_project_map_by_name()
            .await
            .map_err(|source| SyncError::Store { kind, source })?
            .into_iter()
            .collect();
        Ok(by_name.into_values().collect())
    }
}

fn company_spec(company: &model::Company) -> CompanySpec {
    CompanySpec {
        display_name: company.name.clone(),
        ..Default::default()
    }
}

/// Email, then GitHub account, then display name.
fn staff_object_name(staff: &model::StaffMember) -> String {
    let source = [&staff.email, &staff.github_account, &staff.name]
        .into_iter()
        .find(|s| !s.is_empty())
        .map(String::as_str)
        .unwrap_or_default();
    sanitize_name(source)
}

fn staff_spec(staff: &model::StaffMember) -> StaffMemberSpec {
    StaffMemberSpec {
        display_name: staff.name.clone(),
        primary_email: staff.email.clone(),
        git_hub_account: staff.github_account.clone(),
        git_hub_email: staff.github_email.clone(),
        foundation_ref: staff
            .foundation_name
            .as_deref()
            .filter(|n| staff.foundation_id.is_some() && !n.is_empty())
            .map(|n| ResourceReference::named(sanitize_name(n))),
        registered_at: staff.registered_at.clone(),
        ..Default::default()
    }
}

fn maintainer_spec(m: &model::Maintainer) -> MaintainerSpec {
    MaintainerSpec {
        display_name: m.name.clone(),
        primary_email: m.email.clone(),
        git_hub_account: m.github_account.clone(),
        git_hub_email: m.github_email.clone(),
        status: m.maintainer_status.into(),
        company_ref: m
            .company_name
            .as_deref()
            .filter(|n| m.company_id.is_some() && !n.is_empty())
            .map(|n| ResourceReference::named(sanitize_name(n))),
        registered_at: m.registered_at.clone(),
        ..Default::default()
    }
}

fn project_spec(p: &model::Project, names_by_id: &BTreeMap<i64, String>) -> ProjectSpec {
    ProjectSpec {
        display_name: p.name.clone(),
        maturity: p.maturity.map(Into::into),
        parent_project_ref: p
            .parent_project_id
            .and_then(|id| names_by_id.get(&id))
            .map(|name| ResourceReference::named(sanitize_name(name))),
        maintainer_lead_ref: (!p.maintainer_ref.is_empty())
            .then(|| ResourceReference::named(sanitize_name(&p.maintainer_ref))),
        onboarding_issue: p.onboarding_issue.clone().unwrap_or_default(),
        mailing_list: p.mailing_list.clone().unwrap_or_default(),
        maintainer_refs: p
            .maintainers
            .iter()
            .map(|m| ResourceReference::named(sanitize_name(&m.email)))
            .collect(),
        ..Default::default()
    }
}

fn membership_spec(p: &model::Project, m: &model::Maintainer) -> ProjectMembershipSpec {
    ProjectMembershipSpec {
        project_ref: ResourceReference::named(sanitize_name(&p.name)),
        maintainer_ref: ResourceReference::named(sanitize_name(&m.email)),
        ..Default::default()
    }
}

fn ref_name(r: &Option<ResourceReference>) -> Option<&str> {
    r.as_ref().map(|r| r.name.as_str())
}

fn staff_spec_equal(a: &StaffMemberSpec, b: &StaffMemberSpec) -> bool {
    a.display_name == b.display_name
        && a.primary_email == b.primary_email
        && a.git_hub_account == b.git_hub_account
        && a.git_hub_email == b.git_hub_email
        && a.registered_at == b.registered_at
        && ref_name(&a.foundation_ref) == ref_name(&b.foundation_ref)
}

fn maintainer_spec_equal(a: &MaintainerSpec, b: &MaintainerSpec) -> bool {
    a.display_name == b.display_name
        && a.primary_email == b.primary_email
        && a.git_hub_account == b.git_hub_account
        && a.git_hub_email == b.git_hub_email
        && a.status == b.status
        && a.registered_at == b.registered_at
        && ref_name(&a.company_ref) == ref_name(&b.company_ref)
}

/// Maintainer refs are compared as a set of names.
fn project_spec_equal(a: &ProjectSpec, b: &ProjectSpec) -> bool {
    if a.display_name != b.display_name
        || a.maturity != b.maturity
        || a.mailing_list != b.mailing_list
        || a.onboarding_issue != b.onboarding_issue
        || ref_name(&a.parent_project_ref) != ref_name(&b.parent_project_ref)
        || ref_name(&a.maintainer_lead_ref) != ref_name(&b.maintainer_lead_ref)
        || a.maintainer_refs.len() != b.maintainer_refs.len()
    {
        return false;
    }
    let names: HashSet<&str> = a.maintainer_refs.iter().map(|r| r.name.as_str()).collect();
    b.maintainer_refs.iter().all(|r| names.contains(r.name.as_str()))
}
