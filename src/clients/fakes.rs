//! In-memory stand-ins for the Kubernetes and IAM APIs

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::WatchEvent;
use kube::runtime::events::Event;
use kube::ResourceExt;

use super::iam::{IamApi, IamError, Role};
use super::kubernetes::{KubeApi, Listing, WatchStream};
use crate::resources::cloudserviceaccounts::{CloudServiceAccount, CloudServiceAccountStatus};
use crate::{Error, Result};

pub const ACCOUNT_ID: &str = "123456789012";

pub fn not_found() -> kube::Error {
    kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".into(),
        message: "the server could not find the requested resource".into(),
        reason: "NotFound".into(),
        code: 404,
    })
}

#[derive(Default)]
struct IamState {
    roles: BTreeMap<String, Role>,
    inline_policies: BTreeMap<(String, String), String>,
    attached: BTreeMap<String, BTreeSet<String>>,
    calls: Vec<String>,
    failing: Option<&'static str>,
    create_race: bool,
    detach_race: bool,
}

#[derive(Default)]
struct Concurrency {
    active: HashMap<String, usize>,
    total: usize,
    max_per_role: usize,
    max_total: usize,
}

/// IAM that keeps roles in memory and records every call as `"<Operation> <args>"`
#[derive(Default)]
pub struct FakeIam {
    state: Mutex<IamState>,
    concurrency: Mutex<Concurrency>,
    delay: Option<Duration>,
}

impl FakeIam {
    /// Every GetRole call sleeps for `delay`, to make overlapping reconciliations observable
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn insert_role(&self, name: &str, inline_policy: Option<&str>, attached: &[&str]) {
        let mut state = self.state.lock().unwrap();
        state.roles.insert(name.into(), role(name, "pre-existing", "{}"));
        if let Some(policy) = inline_policy {
            state
                .inline_policies
                .insert((name.into(), name.into()), policy.into());
        }
        state.attached.insert(
            name.into(),
            attached.iter().map(|arn| arn.to_string()).collect(),
        );
    }

    /// Make the named operation fail with an API error
    pub fn fail(&self, operation: &'static str) {
        self.state.lock().unwrap().failing = Some(operation);
    }

    /// The next CreateRole finds that someone else created the role first
    pub fn lose_create_race(&self) {
        self.state.lock().unwrap().create_race = true;
    }

    /// Listed attachments are gone by the time DetachRolePolicy runs
    pub fn lose_detach_race(&self) {
        self.state.lock().unwrap().detach_race = true;
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Calls that change IAM state
    pub fn mutations(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| !c.starts_with("Get") && !c.starts_with("List"))
            .collect()
    }

    pub fn role(&self, name: &str) -> Option<Role> {
        self.state.lock().unwrap().roles.get(name).cloned()
    }

    pub fn inline_policy(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .inline_policies
            .get(&(name.to_string(), name.to_string()))
            .cloned()
    }

    pub fn attached(&self, name: &str) -> BTreeSet<String> {
        self.state
            .lock()
            .unwrap()
            .attached
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn max_concurrency_per_role(&self) -> usize {
        self.concurrency.lock().unwrap().max_per_role
    }

    pub fn max_concurrency(&self) -> usize {
        self.concurrency.lock().unwrap().max_total
    }

    fn record(&self, operation: &'static str, call: String) -> Result<(), IamError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        if state.failing == Some(operation) {
            return Err(IamError::Api {
                operation,
                message: "Throttling: Rate exceeded".into(),
            });
        }
        Ok(())
    }

    async fn track(&self, name: &str) {
        {
            let mut c = self.concurrency.lock().unwrap();
            let active = c.active.entry(name.to_string()).or_default();
            *active += 1;
            let active = *active;
            c.total += 1;
            c.max_per_role = c.max_per_role.max(active);
            c.max_total = c.max_total.max(c.total);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mut c = self.concurrency.lock().unwrap();
        if let Some(active) = c.active.get_mut(name) {
            *active -= 1;
        }
        c.total -= 1;
    }
}

fn role(name: &str, description: &str, trust_policy: &str) -> Role {
    Role {
        name: name.into(),
        arn: format!("arn:aws:iam::{ACCOUNT_ID}:role/{name}"),
        description: Some(description.into()),
        trust_policy_document: Some(trust_policy.into()),
    }
}

#[async_trait]
impl IamApi for FakeIam {
    async fn get_role(&self, name: &str) -> Result<Role, IamError> {
        self.track(name).await;
        self.record("GetRole", format!("GetRole {name}"))?;
        self.role(name).ok_or(IamError::NotFound)
    }

    async fn get_role_policy(
        &self,
        role_name: &str,
        policy_name: &str,
    ) -> Result<String, IamError> {
        self.record("GetRolePolicy", format!("GetRolePolicy {role_name} {policy_name}"))?;
        self.state
            .lock()
            .unwrap()
            .inline_policies
            .get(&(role_name.to_string(), policy_name.to_string()))
            .cloned()
            .ok_or(IamError::NotFound)
    }

    async fn list_attached_role_policies(&self, role_name: &str) -> Result<Vec<String>, IamError> {
        self.record(
            "ListAttachedRolePolicies",
            format!("ListAttachedRolePolicies {role_name}"),
        )?;
        let state = self.state.lock().unwrap();
        if !state.roles.contains_key(role_name) {
            return Err(IamError::NotFound);
        }
        Ok(state
            .attached
            .get(role_name)
            .map(|arns| arns.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn create_role(
        &self,
        name: &str,
        trust_policy_document: &str,
        description: &str,
    ) -> Result<(), IamError> {
        self.record("CreateRole", format!("CreateRole {name}"))?;
        let mut state = self.state.lock().unwrap();
        if std::mem::take(&mut state.create_race) {
            state.roles.insert(name.into(), role(name, "raced", "{}"));
        }
        if state.roles.contains_key(name) {
            return Err(IamError::AlreadyExists);
        }
        state
            .roles
            .insert(name.into(), role(name, description, trust_policy_document));
        Ok(())
    }

    async fn update_role(&self, name: &str, description: &str) -> Result<(), IamError> {
        self.record("UpdateRole", format!("UpdateRole {name}"))?;
        let mut state = self.state.lock().unwrap();
        let role = state.roles.get_mut(name).ok_or(IamError::NotFound)?;
        role.description = Some(description.into());
        Ok(())
    }

    async fn update_assume_role_policy(
        &self,
        name: &str,
        trust_policy_document: &str,
    ) -> Result<(), IamError> {
        self.record(
            "UpdateAssumeRolePolicy",
            format!("UpdateAssumeRolePolicy {name}"),
        )?;
        let mut state = self.state.lock().unwrap();
        let role = state.roles.get_mut(name).ok_or(IamError::NotFound)?;
        role.trust_policy_document = Some(trust_policy_document.into());
        Ok(())
    }

    async fn put_role_policy(
        &self,
        role_name: &str,
        policy_name: &str,
        policy_document: &str,
    ) -> Result<(), IamError> {
        self.record("PutRolePolicy", format!("PutRolePolicy {role_name} {policy_name}"))?;
        let mut state = self.state.lock().unwrap();
        if !state.roles.contains_key(role_name) {
            return Err(IamError::NotFound);
        }
        state
            .inline_policies
            .insert((role_name.into(), policy_name.into()), policy_document.into());
        Ok(())
    }

    async fn delete_role_policy(
        &self,
        role_name: &str,
        policy_name: &str,
    ) -> Result<(), IamError> {
        self.record(
            "DeleteRolePolicy",
            format!("DeleteRolePolicy {role_name} {policy_name}"),
        )?;
        self.state
            .lock()
            .unwrap()
            .inline_policies
            .remove(&(role_name.to_string(), policy_name.to_string()))
            .map(|_| ())
            .ok_or(IamError::NotFound)
    }

    async fn attach_role_policy(&self, role_name: &str, policy_arn: &str) -> Result<(), IamError> {
        self.record(
            "AttachRolePolicy",
            format!("AttachRolePolicy {role_name} {policy_arn}"),
        )?;
        let mut state = self.state.lock().unwrap();
        if !state.roles.contains_key(role_name) {
            return Err(IamError::NotFound);
        }
        state
            .attached
            .entry(role_name.into())
            .or_default()
            .insert(policy_arn.into());
        Ok(())
    }

    async fn detach_role_policy(&self, role_name: &str, policy_arn: &str) -> Result<(), IamError> {
        self.record(
            "DetachRolePolicy",
            format!("DetachRolePolicy {role_name} {policy_arn}"),
        )?;
        let mut state = self.state.lock().unwrap();
        let detach_race = state.detach_race;
        match state
            .attached
            .get_mut(role_name)
            .map(|arns| arns.remove(policy_arn))
        {
            Some(true) if !detach_race => Ok(()),
            _ => Err(IamError::NotFound),
        }
    }

    async fn delete_role(&self, name: &str) -> Result<(), IamError> {
        self.record("DeleteRole", format!("DeleteRole {name}"))?;
        let mut state = self.state.lock().unwrap();
        let has_dependents = state.attached.get(name).is_some_and(|a| !a.is_empty())
            || state.inline_policies.keys().any(|(role, _)| role == name);
        if has_dependents {
            return Err(IamError::Api {
                operation: "DeleteRole",
                message: "DeleteConflict: Cannot delete entity, must detach all policies first."
                    .into(),
            });
        }
        state.attached.remove(name);
        state.roles.remove(name).map(|_| ()).ok_or(IamError::NotFound)
    }
}

#[derive(Default)]
struct KubeState {
    listings: VecDeque<Result<Listing>>,
    sessions: VecDeque<Vec<Result<WatchEvent<CloudServiceAccount>>>>,
    list_calls: usize,
    watched_versions: Vec<String>,
    status_patches: Vec<(String, String, CloudServiceAccountStatus)>,
    applied: Vec<ServiceAccount>,
    deleted: Vec<(String, String)>,
    events: Vec<String>,
    fail_apply: bool,
    panic_on_status_patch: bool,
}

/// Kubernetes API serving scripted list and watch responses.
///
/// Once the scripted listings run out, listing answers 404 as if the CRD were not installed,
/// which ends a watcher under test.
#[derive(Default)]
pub struct FakeKube {
    state: Mutex<KubeState>,
}

impl FakeKube {
    pub fn push_listing(&self, items: Vec<CloudServiceAccount>, resource_version: &str) {
        self.state.lock().unwrap().listings.push_back(Ok(Listing {
            items,
            resource_version: resource_version.into(),
        }));
    }

    pub fn push_list_error(&self, error: Error) {
        self.state.lock().unwrap().listings.push_back(Err(error));
    }

    pub fn push_session(&self, events: Vec<Result<WatchEvent<CloudServiceAccount>>>) {
        self.state.lock().unwrap().sessions.push_back(events);
    }

    pub fn fail_apply(&self) {
        self.state.lock().unwrap().fail_apply = true;
    }

    pub fn panic_on_status_patch(&self) {
        self.state.lock().unwrap().panic_on_status_patch = true;
    }

    pub fn list_calls(&self) -> usize {
        self.state.lock().unwrap().list_calls
    }

    pub fn watched_versions(&self) -> Vec<String> {
        self.state.lock().unwrap().watched_versions.clone()
    }

    pub fn status_patches(&self) -> Vec<(String, String, CloudServiceAccountStatus)> {
        self.state.lock().unwrap().status_patches.clone()
    }

    pub fn applied(&self) -> Vec<ServiceAccount> {
        self.state.lock().unwrap().applied.clone()
    }

    pub fn deleted(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn events(&self) -> Vec<String> {
        self.state.lock().unwrap().events.clone()
    }
}

#[async_trait]
impl KubeApi for FakeKube {
    async fn list_cloud_service_accounts(&self) -> Result<Listing> {
        let mut state = self.state.lock().unwrap();
        state.list_calls += 1;
        state
            .listings
            .pop_front()
            .unwrap_or_else(|| Err(not_found().into()))
    }

    async fn watch_cloud_service_accounts(&self, resource_version: &str) -> Result<WatchStream> {
        let mut state = self.state.lock().unwrap();
        state.watched_versions.push(resource_version.into());
        let events = state.sessions.pop_front().unwrap_or_default();
        Ok(futures::stream::iter(events).boxed())
    }

    async fn patch_cloud_service_account_status(
        &self,
        name: &str,
        namespace: &str,
        status: &CloudServiceAccountStatus,
    ) -> Result<()> {
        if self.state.lock().unwrap().panic_on_status_patch {
            panic!("status patch for {namespace}/{name}");
        }
        self.state.lock().unwrap().status_patches.push((
            namespace.into(),
            name.into(),
            status.clone(),
        ));
        Ok(())
    }

    async fn apply_service_account(
        &self,
        service_account: &ServiceAccount,
        _field_manager: &str,
    ) -> Result<ServiceAccount> {
        let mut state = self.state.lock().unwrap();
        if state.fail_apply {
            return Err(kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".into(),
                message: "admission webhook denied the request".into(),
                reason: "Forbidden".into(),
                code: 403,
            })
            .into());
        }
        state.applied.push(service_account.clone());
        let mut applied = service_account.clone();
        applied.metadata.uid = Some(format!("uid-{}", service_account.name_any()));
        applied.metadata.resource_version = Some(state.applied.len().to_string());
        applied.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
        Ok(applied)
    }

    async fn delete_service_account(&self, name: &str, namespace: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .deleted
            .push((namespace.into(), name.into()));
        Ok(())
    }

    async fn publish_event(&self, _csa: &CloudServiceAccount, event: Event) -> Result<()> {
        self.state.lock().unwrap().events.push(event.reason);
        Ok(())
    }
}
