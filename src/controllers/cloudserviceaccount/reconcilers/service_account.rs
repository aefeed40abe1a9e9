use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{LocalObjectReference, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::*;

use super::bounded;
use crate::clients::KubeApi;
use crate::resources::cloudserviceaccounts::{ServiceAccountOptions, ServiceAccountStatus};
use crate::{Error, Result};

pub const FIELD_MANAGER: &str = "cloudsap";

/// Converges the Kubernetes ServiceAccount named after the CloudServiceAccount
pub struct ServiceAccountReconciler {
    kube: Arc<dyn KubeApi>,
    api_timeout: Duration,
    name: String,
    namespace: String,
    options: ServiceAccountOptions,
}

impl ServiceAccountReconciler {
    pub fn new(
        kube: Arc<dyn KubeApi>,
        api_timeout: Duration,
        namespace: &str,
        name: &str,
        options: Option<&ServiceAccountOptions>,
    ) -> Self {
        Self {
            kube,
            api_timeout,
            name: name.into(),
            namespace: namespace.into(),
            options: options.cloned().unwrap_or_default(),
        }
    }

    pub fn desired(&self) -> ServiceAccount {
        ServiceAccount {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                annotations: Some(BTreeMap::new()),
                labels: Some(BTreeMap::new()),
                ..Default::default()
            },
            automount_service_account_token: self.options.automount_service_account_token,
            image_pull_secrets: self.options.image_pull_secrets.as_ref().map(|names| {
                names
                    .iter()
                    .map(|name| LocalObjectReference { name: name.clone() })
                    .collect()
            }),
            ..Default::default()
        }
    }

    pub async fn apply(&self) -> Result<ServiceAccountStatus> {
        let applied = bounded(
            self.api_timeout,
            self.kube
                .apply_service_account(&self.desired(), FIELD_MANAGER),
            || Error::Timeout {
                operation: "ApplyServiceAccount",
            },
        )
        .await?;
        info!(
            "Applied ServiceAccount {} in namespace {}",
            self.name, self.namespace
        );
        let meta = applied.metadata;
        Ok(ServiceAccountStatus {
            name: meta.name,
            creation_timestamp: meta.creation_timestamp.map(|t| t.0.to_rfc3339()),
            resource_version: meta.resource_version,
            uid: meta.uid,
        })
    }

    pub async fn delete(&self) -> Result<()> {
        bounded(
            self.api_timeout,
            self.kube
                .delete_service_account(&self.name, &self.namespace),
            || Error::Timeout {
                operation: "DeleteServiceAccount",
            },
        )
        .await
    }
}
