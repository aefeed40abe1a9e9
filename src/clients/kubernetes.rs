use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, WatchEvent, WatchParams};
use kube::runtime::events::{Event, Recorder};
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use tracing::debug;

use crate::resources::cloudserviceaccounts::{CloudServiceAccount, CloudServiceAccountStatus};
use crate::{Error, Result};

/// Seconds the API server keeps a watch open before ending the stream
const WATCH_TIMEOUT_SECS: u32 = 290;

pub type WatchStream = BoxStream<'static, Result<WatchEvent<CloudServiceAccount>>>;

/// A collection of CloudServiceAccounts and the collection-level resourceVersion it was read at
#[derive(Clone, Debug, Default)]
pub struct Listing {
    pub items: Vec<CloudServiceAccount>,
    pub resource_version: String,
}

/// The Kubernetes API calls the controller makes
#[async_trait]
pub trait KubeApi: Send + Sync {
    async fn list_cloud_service_accounts(&self) -> Result<Listing>;

    async fn watch_cloud_service_accounts(&self, resource_version: &str) -> Result<WatchStream>;

    /// Merge-patch the status subresource
    async fn patch_cloud_service_account_status(
        &self,
        name: &str,
        namespace: &str,
        status: &CloudServiceAccountStatus,
    ) -> Result<()>;

    /// Server-side apply, forcing ownership of conflicting fields
    async fn apply_service_account(
        &self,
        service_account: &ServiceAccount,
        field_manager: &str,
    ) -> Result<ServiceAccount>;

    /// Delete a ServiceAccount; an absent one is not an error
    async fn delete_service_account(&self, name: &str, namespace: &str) -> Result<()>;

    async fn publish_event(&self, csa: &CloudServiceAccount, event: Event) -> Result<()>;
}

/// KubeApi backed by a live cluster
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
    recorder: Recorder,
}

impl KubeClient {
    pub fn new(client: Client, reporter: &str) -> Self {
        Self {
            recorder: Recorder::new(client.clone(), reporter.into()),
            client,
        }
    }
}

#[async_trait]
impl KubeApi for KubeClient {
    async fn list_cloud_service_accounts(&self) -> Result<Listing> {
        let csas: Api<CloudServiceAccount> = Api::all(self.client.clone());
        let list = csas.list(&ListParams::default()).await?;
        Ok(Listing {
            resource_version: list.metadata.resource_version.unwrap_or_default(),
            items: list.items,
        })
    }

    async fn watch_cloud_service_accounts(&self, resource_version: &str) -> Result<WatchStream> {
        let csas: Api<CloudServiceAccount> = Api::all(self.client.clone());
        let params = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        debug!(resource_version, "Opening CloudServiceAccount watch");
        let stream = csas.watch(&params, resource_version).await?;
        Ok(stream.map_err(Error::from).boxed())
    }

    async fn patch_cloud_service_account_status(
        &self,
        name: &str,
        namespace: &str,
        status: &CloudServiceAccountStatus,
    ) -> Result<()> {
        let csas: Api<CloudServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        let patch = Patch::Merge(json!({ "status": status }));
        csas.patch_status(name, &PatchParams::default(), &patch)
            .await?;
        Ok(())
    }

    async fn apply_service_account(
        &self,
        service_account: &ServiceAccount,
        field_manager: &str,
    ) -> Result<ServiceAccount> {
        let namespace = service_account
            .namespace()
            .ok_or(Error::MissingObjectKey("namespace"))?;
        let name = service_account
            .meta()
            .name
            .clone()
            .ok_or(Error::MissingObjectKey("name"))?;
        let sas: Api<ServiceAccount> = Api::namespaced(self.client.clone(), &namespace);
        let params = PatchParams::apply(field_manager).force();
        debug!("Applying ServiceAccount {} in namespace {}", name, namespace);
        Ok(sas
            .patch(&name, &params, &Patch::Apply(service_account))
            .await?)
    }

    async fn delete_service_account(&self, name: &str, namespace: &str) -> Result<()> {
        let sas: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        debug!(
            "Ensuring ServiceAccount {} in namespace {} does not exist",
            name, namespace
        );
        match sas.delete(name, &DeleteParams::default()).await {
            Err(kube::Error::Api(kube::error::ErrorResponse { code: 404, .. })) => Ok(()),
            Err(err) => Err(err.into()),
            Ok(_) => Ok(()),
        }
    }

    async fn publish_event(&self, csa: &CloudServiceAccount, event: Event) -> Result<()> {
        self.recorder
            .publish(&event, &csa.object_ref(&()))
            .await?;
        Ok(())
    }
}
