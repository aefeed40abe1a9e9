use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub static DEFAULT_CLOUD_PROVIDER: &str = "aws";

/// Represents an IAM role bound to a Kubernetes ServiceAccount
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    kind = "CloudServiceAccount",
    group = "k8s.groundstate.io",
    version = "v1alpha1",
    namespaced,
    printcolumn = r#"{"name":"Role", "type":"string", "jsonPath":".status.iamRole.name"}"#,
    printcolumn = r#"{"name":"Observed", "priority": 1, "type":"integer", "jsonPath":".status.observed.generation"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(status = "CloudServiceAccountStatus", shortname = "csa")]
#[serde(rename_all = "camelCase")]
pub struct CloudServiceAccountSpec {
    /// cloudProvider selects the cloud integration. Only "aws" is supported. Defaults to "aws".
    #[serde(default = "default_cloud_provider")]
    pub cloud_provider: String,
    /// rolePolicyTemplate is a templated IAM policy document, rendered into the role's inline policy.
    /// Placeholders use `{{ name }}` syntax.
    #[serde(default)]
    pub role_policy_template: String,
    /// policyTemplateValues are substituted into rolePolicyTemplate. The values account_id,
    /// cluster_name, namespace and service_account are always provided by the controller.
    #[serde(default)]
    pub policy_template_values: BTreeMap<String, String>,
    /// rolePolicyAttachments lists the ARNs of managed policies to attach to the role.
    #[serde(default)]
    pub role_policy_attachments: Vec<String>,
    /// serviceAccountOptions are passed through to the generated ServiceAccount
    pub service_account_options: Option<ServiceAccountOptions>,
}

fn default_cloud_provider() -> String {
    DEFAULT_CLOUD_PROVIDER.into()
}

impl Default for CloudServiceAccountSpec {
    fn default() -> Self {
        Self {
            cloud_provider: default_cloud_provider(),
            role_policy_template: String::new(),
            policy_template_values: BTreeMap::new(),
            role_policy_attachments: Vec::new(),
            service_account_options: None,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccountOptions {
    /// automountServiceAccountToken indicates whether pods running as this service account should have an API token automatically mounted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub automount_service_account_token: Option<bool>,
    /// imagePullSecrets lists the names of secrets in the same namespace to use for pulling images.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_pull_secrets: Option<Vec<String>>,
}

/// Status of the CloudServiceAccount.
/// This is set and managed automatically.
/// Read-only.
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CloudServiceAccountStatus {
    /// The generation and resourceVersion last reconciled successfully
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed: Option<ObservedState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iam_role: Option<IamRoleStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<ServiceAccountStatus>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObservedState {
    pub generation: i64,
    pub resource_version: String,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IamRoleStatus {
    pub name: String,
    /// Content hash of the IAM role, inline policy and attachments as last applied
    pub digest: String,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccountStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

impl CloudServiceAccount {
    /// The generation last reconciled successfully, if any
    pub fn observed_generation(&self) -> Option<i64> {
        self.status
            .as_ref()
            .and_then(|s| s.observed.as_ref())
            .map(|o| o.generation)
    }

    /// Whether the current spec has already been reconciled
    pub fn is_observed(&self) -> bool {
        match (self.metadata.generation, self.observed_generation()) {
            (Some(generation), Some(observed)) => generation == observed,
            _ => false,
        }
    }

    /// The digest recorded for the IAM role on the last reconciliation
    pub fn iam_role_digest(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.iam_role.as_ref())
            .map(|r| r.digest.as_str())
    }
}
