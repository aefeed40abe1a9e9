use std::convert::Infallible;
use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use kube::api::WatchEvent;
use tokio::task::{JoinError, JoinHandle};
use tracing::*;

use super::controller::{CloudServiceAccountMachine, Context, Event};
use super::reconcilers::bounded;
use super::stack::ReconciliationStack;
use crate::resources::cloudserviceaccounts::CloudServiceAccount;
use crate::{Error, Metrics, Result};

type Tasks = FuturesUnordered<JoinHandle<()>>;

/// Follows the CloudServiceAccount collection and routes every change into the stack
pub struct Watcher {
    ctx: Arc<Context>,
    stack: ReconciliationStack,
}

impl Watcher {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            stack: ReconciliationStack::new(ctx.clone()),
            ctx,
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.ctx.metrics
    }

    pub fn stack(&self) -> &ReconciliationStack {
        &self.stack
    }

    /// List, then watch from the listed resourceVersion, relisting whenever the watch expires
    /// or the stream breaks. Only returns on errors that need a restart or an exit.
    pub async fn watch(&self) -> Result<Infallible> {
        let mut tasks = Tasks::new();
        loop {
            let resource_version = self.sync(&mut tasks).await?;
            let mut stream = bounded(
                self.ctx.settings.api_timeout,
                self.ctx
                    .kube
                    .watch_cloud_service_accounts(&resource_version),
                || Error::Timeout {
                    operation: "WatchCloudServiceAccounts",
                },
            )
            .await?;
            self.ctx.diagnostics.write().await.resource_version = Some(resource_version);

            loop {
                tokio::select! {
                    Some(joined) = tasks.next(), if !tasks.is_empty() => reap(joined),
                    item = stream.next() => match item {
                        None => {
                            debug!("Watch stream ended, resyncing");
                            break;
                        }
                        Some(Err(err)) => {
                            let backoff = self.ctx.settings.restart_backoff;
                            warn!(error = %err, "Watch stream failed, resyncing in {:?}", backoff);
                            tokio::time::sleep(backoff).await;
                            break;
                        }
                        Some(Ok(event)) => {
                            if !self.handle(event, &mut tasks).await? {
                                break;
                            }
                        }
                    },
                }
            }
        }
    }

    /// Returns false when the watch has to be resynced
    async fn handle(&self, event: WatchEvent<CloudServiceAccount>, tasks: &mut Tasks) -> Result<bool> {
        let event = match event {
            WatchEvent::Added(csa) => Event::Added(csa),
            WatchEvent::Modified(csa) => Event::Modified(csa),
            WatchEvent::Deleted(csa) => Event::Deleted(csa),
            WatchEvent::Bookmark(_) => return Ok(true),
            WatchEvent::Error(response)
                if response.status == "Failure" && response.reason == "Expired" =>
            {
                info!("Watch expired ({}), resyncing", response.message);
                return Ok(false);
            }
            WatchEvent::Error(response) => {
                CloudServiceAccountMachine::error(&self.ctx, &response);
                return Err(Error::WatchError(response));
            }
        };
        tasks.extend(self.stack.dispatch(event).await);
        Ok(true)
    }

    /// List every CloudServiceAccount, re-dispatching the ones whose current generation has not
    /// been reconciled, and return the collection's resourceVersion
    async fn sync(&self, tasks: &mut Tasks) -> Result<String> {
        let listing = match bounded(
            self.ctx.settings.api_timeout,
            self.ctx.kube.list_cloud_service_accounts(),
            || Error::Timeout {
                operation: "ListCloudServiceAccounts",
            },
        )
        .await
        {
            Err(Error::KubeError(kube::Error::Api(kube::error::ErrorResponse {
                code: 404, ..
            }))) => return Err(Error::CrdNotInstalled),
            listing => listing?,
        };
        info!(
            resource_version = %listing.resource_version,
            count = listing.items.len(),
            "Listed CloudServiceAccounts"
        );
        for csa in listing.items {
            if !csa.is_observed() {
                tasks.extend(self.stack.dispatch(Event::Modified(csa)).await);
            }
        }
        Ok(listing.resource_version)
    }
}

fn reap(joined: Result<(), JoinError>) {
    if let Err(err) = joined {
        error!(error = %err, "Reconciliation task failed");
    }
}
