use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;
use serde_json::json;
use tracing::*;

use super::bounded;
use crate::clients::{IamApi, IamError, Role};
use crate::controllers::Settings;
use crate::digest::digest;
use crate::resources::cloudserviceaccounts::IamRoleStatus;
use crate::Result;

/// The IAM state of a role as read back from the API. Absent parts are empty.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObservedRole {
    pub role: Option<Role>,
    pub inline_policy: Option<String>,
    pub attached: BTreeSet<String>,
}

#[derive(Clone, Debug)]
pub struct ReconciledRole {
    pub name: String,
    pub digest: String,
    pub observed: ObservedRole,
    /// false if the digest matched and nothing was sent to IAM
    pub changed: bool,
}

impl ReconciledRole {
    pub fn status(&self) -> IamRoleStatus {
        IamRoleStatus {
            name: self.name.clone(),
            digest: self.digest.clone(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Composite<'a> {
    role: Option<&'a Role>,
    policy_document: &'a str,
    attached_policies: &'a BTreeSet<String>,
}

/// Converges the IAM role bound to one ServiceAccount
pub struct IamRoleReconciler {
    iam: Arc<dyn IamApi>,
    api_timeout: Duration,
    role_name: String,
    description: String,
    trust_policy: String,
    policy_template: String,
    template_values: BTreeMap<String, String>,
    attachments: BTreeSet<String>,
}

impl IamRoleReconciler {
    pub fn new(
        iam: Arc<dyn IamApi>,
        settings: &Settings,
        namespace: &str,
        service_account: &str,
    ) -> Self {
        let builtins = [
            ("account_id", settings.account_id.as_str()),
            ("cluster_name", settings.cluster_name.as_str()),
            ("namespace", namespace),
            ("service_account", service_account),
        ];
        Self {
            iam,
            api_timeout: settings.api_timeout,
            role_name: format!("{}-sa-{namespace}-{service_account}", settings.cluster_name),
            description: format!("IAM Role for ServiceAccount {namespace}/{service_account}"),
            trust_policy: trust_policy(settings, namespace, service_account),
            policy_template: String::new(),
            template_values: builtins
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            attachments: BTreeSet::new(),
        }
    }

    /// Set the inline policy template. Caller values never replace the built-in ones.
    pub fn with_policy(mut self, template: &str, values: &BTreeMap<String, String>) -> Self {
        self.policy_template = template.to_string();
        for (key, value) in values {
            self.template_values
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        self
    }

    pub fn with_attachments<I, S>(mut self, policy_arns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attachments = policy_arns.into_iter().map(Into::into).collect();
        self
    }

    pub fn role_name(&self) -> &str {
        &self.role_name
    }

    pub fn render_policy(&self) -> Result<String> {
        if self.policy_template.trim().is_empty() {
            return Ok(String::new());
        }
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        Ok(env.render_str(&self.policy_template, &self.template_values)?)
    }

    /// Bring the role, its inline policy and its managed policy attachments in line with the
    /// desired state, unless the state digest still equals `last_digest`
    pub async fn apply(&self, last_digest: Option<&str>) -> Result<ReconciledRole> {
        let policy = self.render_policy()?;
        let observed = self.fetch().await?;
        let current = self.digest(&observed, &policy)?;
        if last_digest == Some(current.as_str()) {
            debug!(role = %self.role_name, "IAM role is up to date");
            return Ok(ReconciledRole {
                name: self.role_name.clone(),
                digest: current,
                observed,
                changed: false,
            });
        }

        if observed.role.is_some() {
            self.update_role().await?;
        } else {
            info!(role = %self.role_name, "Creating IAM role");
            let created = self
                .call(
                    "CreateRole",
                    self.iam
                        .create_role(&self.role_name, &self.trust_policy, &self.description),
                )
                .await;
            match created {
                Ok(()) => {}
                Err(IamError::AlreadyExists) => {
                    debug!(role = %self.role_name, "IAM role appeared concurrently, updating instead");
                    self.update_role().await?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        if !policy.trim().is_empty() {
            self.call(
                "PutRolePolicy",
                self.iam
                    .put_role_policy(&self.role_name, &self.role_name, &policy),
            )
            .await?;
        }

        for arn in observed.attached.difference(&self.attachments) {
            debug!(role = %self.role_name, policy = %arn, "Detaching managed policy");
            ignore_not_found(
                self.call(
                    "DetachRolePolicy",
                    self.iam.detach_role_policy(&self.role_name, arn),
                )
                .await,
            )?;
        }
        for arn in self.attachments.difference(&observed.attached) {
            debug!(role = %self.role_name, policy = %arn, "Attaching managed policy");
            self.call(
                "AttachRolePolicy",
                self.iam.attach_role_policy(&self.role_name, arn),
            )
            .await?;
        }

        let observed = self.fetch().await?;
        Ok(ReconciledRole {
            name: self.role_name.clone(),
            digest: self.digest(&observed, &policy)?,
            observed,
            changed: true,
        })
    }

    /// Remove the role and everything hanging off it. Parts that are already gone are skipped.
    pub async fn delete(&self) -> Result<()> {
        let attached = found(
            self.call(
                "ListAttachedRolePolicies",
                self.iam.list_attached_role_policies(&self.role_name),
            )
            .await,
        )?
        .unwrap_or_default();
        for arn in &attached {
            ignore_not_found(
                self.call(
                    "DetachRolePolicy",
                    self.iam.detach_role_policy(&self.role_name, arn),
                )
                .await,
            )?;
        }
        ignore_not_found(
            self.call(
                "DeleteRolePolicy",
                self.iam
                    .delete_role_policy(&self.role_name, &self.role_name),
            )
            .await,
        )?;
        ignore_not_found(
            self.call("DeleteRole", self.iam.delete_role(&self.role_name))
                .await,
        )?;
        info!(role = %self.role_name, "Deleted IAM role");
        Ok(())
    }

    pub async fn fetch(&self) -> Result<ObservedRole> {
        let Some(role) = found(
            self.call("GetRole", self.iam.get_role(&self.role_name))
                .await,
        )?
        else {
            return Ok(ObservedRole::default());
        };
        let inline_policy = found(
            self.call(
                "GetRolePolicy",
                self.iam.get_role_policy(&self.role_name, &self.role_name),
            )
            .await,
        )?;
        let attached = found(
            self.call(
                "ListAttachedRolePolicies",
                self.iam.list_attached_role_policies(&self.role_name),
            )
            .await,
        )?
        .unwrap_or_default();
        Ok(ObservedRole {
            role: Some(role),
            inline_policy,
            attached: attached.into_iter().collect(),
        })
    }

    async fn update_role(&self) -> Result<(), IamError> {
        debug!(role = %self.role_name, "Updating IAM role");
        self.call(
            "UpdateRole",
            self.iam.update_role(&self.role_name, &self.description),
        )
        .await?;
        self.call(
            "UpdateAssumeRolePolicy",
            self.iam
                .update_assume_role_policy(&self.role_name, &self.trust_policy),
        )
        .await
    }

    /// Only the role itself comes from IAM. The inline policy and attachments are the desired
    /// ones, so edits made to those outside the controller go unnoticed while the digest matches.
    fn digest(&self, observed: &ObservedRole, policy: &str) -> Result<String> {
        digest(&Composite {
            role: observed.role.as_ref(),
            policy_document: policy,
            attached_policies: &self.attachments,
        })
    }

    async fn call<T>(
        &self,
        operation: &'static str,
        call: impl std::future::Future<Output = Result<T, IamError>>,
    ) -> Result<T, IamError> {
        bounded(self.api_timeout, call, || IamError::Timeout { operation }).await
    }
}

fn trust_policy(settings: &Settings, namespace: &str, service_account: &str) -> String {
    let issuer = &settings.oidc_issuer;
    let subject_claim = format!("{issuer}:sub");
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": {
                "Federated": format!("arn:aws:iam::{}:oidc-provider/{issuer}", settings.account_id)
            },
            "Action": "sts:AssumeRoleWithWebIdentity",
            "Condition": {
                "StringEquals": {
                    subject_claim: format!("system:serviceaccount:{namespace}:{service_account}")
                }
            }
        }]
    })
    .to_string()
}

fn found<T>(result: Result<T, IamError>) -> Result<Option<T>, IamError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(IamError::NotFound) => Ok(None),
        Err(e) => Err(e),
    }
}

fn ignore_not_found(result: Result<(), IamError>) -> Result<(), IamError> {
    found(result).map(|_| ())
}
