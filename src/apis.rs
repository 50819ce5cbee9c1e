//! `maintainer-d.cncf.io/v1alpha1` Custom Resources mirroring the maintainer
//! database.

use std::collections::BTreeMap;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{CustomResource, CustomResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::model::{MaintainerStatus, Maturity};

pub const GROUP: &str = "maintainer-d.cncf.io";
pub const VERSION: &str = "v1alpha1";

/// Loose reference to another resource. `uid` pins a specific instance when
/// set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct ResourceReference {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

impl ResourceReference {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct ProjectReference {
    #[serde(flatten)]
    pub reference: ResourceReference,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum MaintainerLifecycle {
    #[default]
    Active,
    Emeritus,
    Retired,
}

impl From<MaintainerStatus> for MaintainerLifecycle {
    fn from(status: MaintainerStatus) -> Self {
        match status {
            MaintainerStatus::Active => MaintainerLifecycle::Active,
            MaintainerStatus::Emeritus => MaintainerLifecycle::Emeritus,
            MaintainerStatus::Retired => MaintainerLifecycle::Retired,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ProjectMaturity {
    Sandbox,
    Incubating,
    Graduated,
    Archived,
}

impl From<Maturity> for ProjectMaturity {
    fn from(maturity: Maturity) -> Self {
        match maturity {
            Maturity::Sandbox => ProjectMaturity::Sandbox,
            Maturity::Incubating => ProjectMaturity::Incubating,
            Maturity::Graduated => ProjectMaturity::Graduated,
            Maturity::Archived => ProjectMaturity::Archived,
        }
    }
}

/// Status condition with the shape of `metav1.Condition`. Timestamps are
/// RFC 3339 strings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    /// `True`, `False` or `Unknown`.
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "maintainer-d.cncf.io",
    version = "v1alpha1",
    kind = "Maintainer",
    plural = "maintainers",
    shortname = "maint",
    category = "maintainerd",
    namespaced,
    status = "MaintainerStatusView"
)]
#[serde(rename_all = "camelCase")]
pub struct MaintainerSpec {
    pub display_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub primary_email: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub git_hub_account: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub git_hub_email: String,
    #[serde(default)]
    pub status: MaintainerLifecycle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_ref: Option<ResourceReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_at: Option<String>,
    #[serde(default, rename = "externalIDs", skip_serializing_if = "BTreeMap::is_empty")]
    pub external_ids: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MaintainerStatusView {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub project_memberships: Vec<ProjectReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub import_warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced: Option<String>,
}

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "maintainer-d.cncf.io",
    version = "v1alpha1",
    kind = "StaffMember",
    plural = "staffmembers",
    shortname = "staff",
    category = "maintainerd",
    namespaced,
    status = "StaffMemberStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct StaffMemberSpec {
    pub display_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub primary_email: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub git_hub_account: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub git_hub_email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foundation_ref: Option<ResourceReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_at: Option<String>,
    #[serde(default, rename = "externalIDs", skip_serializing_if = "BTreeMap::is_empty")]
    pub external_ids: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StaffMemberStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced: Option<String>,
}

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "maintainer-d.cncf.io",
    version = "v1alpha1",
    kind = "Collaborator",
    plural = "collaborators",
    shortname = "collab",
    category = "maintainerd",
    namespaced,
    status = "CollaboratorStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct CollaboratorSpec {
    pub display_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub primary_email: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub git_hub_account: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub git_hub_email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_login: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_at: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub projects: Vec<ResourceReference>,
    #[serde(default, rename = "externalIDs", skip_serializing_if = "BTreeMap::is_empty")]
    pub external_ids: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CollaboratorStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub observed_projects: Vec<ProjectReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced: Option<String>,
}

/// A CNCF project or subproject.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "maintainer-d.cncf.io",
    version = "v1alpha1",
    kind = "Project",
    plural = "projects",
    shortname = "proj",
    category = "maintainerd",
    namespaced,
    status = "ProjectStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSpec {
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maturity: Option<ProjectMaturity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_project_ref: Option<ResourceReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintainer_lead_ref: Option<ResourceReference>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub onboarding_issue: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mailing_list: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foundation_ref: Option<ResourceReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub maintainer_refs: Vec<ResourceReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub collaborator_refs: Vec<ResourceReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_refs: Vec<ResourceReference>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintainer_count: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collaborator_count: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_count: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced: Option<String>,
}

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "maintainer-d.cncf.io",
    version = "v1alpha1",
    kind = "Company",
    plural = "companies",
    shortname = "comp",
    category = "maintainerd",
    namespaced,
    status = "CompanyStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct CompanySpec {
    pub display_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub website: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub notes: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CompanyStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintainer_count: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collaborator_count: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// A service integration such as FOSSA or Snyk.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "maintainer-d.cncf.io",
    version = "v1alpha1",
    kind = "Service",
    plural = "services",
    shortname = "svc",
    category = "maintainerd",
    namespaced,
    status = "ServiceStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    pub display_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub project_refs: Vec<ResourceReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub team_refs: Vec<ResourceReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Membership of a maintainer in a project.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "maintainer-d.cncf.io",
    version = "v1alpha1",
    kind = "ProjectMembership",
    plural = "projectmemberships",
    shortname = "prjmem",
    category = "maintainerd",
    namespaced,
    status = "ProjectMembershipStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ProjectMembershipSpec {
    pub project_ref: ResourceReference,
    pub maintainer_ref: ResourceReference,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joined_at: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub notes: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProjectMembershipStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_verified: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Conditions and last sync time shared by the service join resources.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncedStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced: Option<String>,
}

/// A team on a remote service owned by a project.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "maintainer-d.cncf.io",
    version = "v1alpha1",
    kind = "ServiceTeam",
    plural = "serviceteams",
    shortname = "svcteam",
    category = "maintainerd",
    namespaced,
    status = "SyncedStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTeamSpec {
    pub service_ref: ResourceReference,
    pub project_ref: ResourceReference,
    #[serde(default, rename = "remoteID", skip_serializing_if = "String::is_empty")]
    pub remote_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub project_name: String,
}

/// An account on an external service.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "maintainer-d.cncf.io",
    version = "v1alpha1",
    kind = "ServiceUser",
    plural = "serviceusers",
    shortname = "svcusr",
    category = "maintainerd",
    namespaced,
    status = "SyncedStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceUserSpec {
    pub service_ref: ResourceReference,
    #[serde(default, rename = "remoteID", skip_serializing_if = "String::is_empty")]
    pub remote_id: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reference: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub git_hub_user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintainer_ref: Option<ResourceReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collaborator_ref: Option<ResourceReference>,
}

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "maintainer-d.cncf.io",
    version = "v1alpha1",
    kind = "ServiceUserTeam",
    plural = "serviceuserteams",
    shortname = "svcutm",
    category = "maintainerd",
    namespaced,
    status = "SyncedStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceUserTeamSpec {
    pub service_user_ref: ResourceReference,
    pub service_team_ref: ResourceReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintainer_ref: Option<ResourceReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collaborator_ref: Option<ResourceReference>,
}

/// Onboarding progress item collected from the onboarding tracker.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "maintainer-d.cncf.io",
    version = "v1alpha1",
    kind = "OnboardingTask",
    plural = "onboardingtasks",
    shortname = "onbtask",
    category = "maintainerd",
    namespaced,
    status = "OnboardingTaskStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct OnboardingTaskSpec {
    pub project_ref: ResourceReference,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub owner: String,
    pub number: i64,
    #[serde(rename = "issueURL")]
    pub issue_url: String,
    pub completed: bool,
    pub collected_at: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OnboardingTaskStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Definitions for every resource in the group.
pub fn crds() -> Vec<CustomResourceDefinition> {
    vec![
        Maintainer::crd(),
        StaffMember::crd(),
        Collaborator::crd(),
        Project::crd(),
        Company::crd(),
        Service::crd(),
        ProjectMembership::crd(),
        ServiceTeam::crd(),
        ServiceUser::crd(),
        ServiceUserTeam::crd(),
        OnboardingTask::crd(),
    ]
}
