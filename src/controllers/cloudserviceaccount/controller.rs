use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::error::ErrorResponse;
use kube::runtime::events::{Event as KubeEvent, EventType};
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;
use tokio::sync::RwLock;
use tracing::*;

use super::reconcilers::bounded;
use super::reconcilers::iam_role::IamRoleReconciler;
use super::reconcilers::service_account::ServiceAccountReconciler;
use super::watcher::Watcher;
use crate::clients::{IamApi, KubeApi};
use crate::controllers::{Diagnostics, Settings, State};
use crate::resources::cloudserviceaccounts::{
    CloudServiceAccount, CloudServiceAccountStatus, ObservedState, DEFAULT_CLOUD_PROVIDER,
};
use crate::{telemetry, Error, Metrics, Result};

// Context for our state machines
pub struct Context {
    pub kube: Arc<dyn KubeApi>,
    pub iam: Arc<dyn IamApi>,
    pub settings: Settings,
    pub metrics: Metrics,
    pub diagnostics: Arc<RwLock<Diagnostics>>,
}

impl Context {
    pub fn new(
        state: &State,
        metrics: Metrics,
        kube: Arc<dyn KubeApi>,
        iam: Arc<dyn IamApi>,
    ) -> Arc<Context> {
        Arc::new(Context {
            kube,
            iam,
            settings: state.settings.clone(),
            metrics,
            diagnostics: state.diagnostics.clone(),
        })
    }
}

/// A change to a CloudServiceAccount, as delivered by the watch
#[derive(Clone, Debug)]
pub enum Event {
    Added(CloudServiceAccount),
    Modified(CloudServiceAccount),
    Deleted(CloudServiceAccount),
}

impl Event {
    pub fn object(&self) -> &CloudServiceAccount {
        match self {
            Event::Added(csa) | Event::Modified(csa) | Event::Deleted(csa) => csa,
        }
    }

    pub fn transition(&self) -> &'static str {
        match self {
            Event::Added(_) => "added",
            Event::Modified(_) => "modified",
            Event::Deleted(_) => "deleted",
        }
    }

    pub fn identity(&self) -> ObjectRef<CloudServiceAccount> {
        ObjectRef::from_obj(self.object())
    }
}

/// Lifecycle of a single CloudServiceAccount.
///
/// A machine holds the newest event for its object and is only ever driven by one task at a
/// time, see [`super::stack::ReconciliationStack`].
pub struct CloudServiceAccountMachine {
    ctx: Arc<Context>,
    event: Event,
}

impl CloudServiceAccountMachine {
    pub fn new(ctx: Arc<Context>, event: Event) -> Self {
        Self { ctx, event }
    }

    pub fn refresh(&mut self, event: Event) {
        self.event = event;
    }

    /// Run the transition for the held event. Returns whether any work was done successfully.
    #[instrument(skip(self), fields(trace_id, csa = %self.event.identity(), transition = self.event.transition()))]
    pub async fn run(&self) -> bool {
        if let Some(trace_id) = telemetry::get_trace_id() {
            Span::current().record("trace_id", field::display(&trace_id));
        }
        self.ctx.diagnostics.write().await.last_event = Utc::now();

        let transition = self.event.transition();
        let csa = self.event.object();
        let result = match &self.event {
            Event::Added(csa) => self.apply(csa).await,
            Event::Modified(csa) if csa.is_observed() => {
                debug!("Generation already observed, nothing to do");
                return false;
            }
            Event::Modified(csa) => self.apply(csa).await,
            Event::Deleted(csa) => self.delete(csa).await,
        };

        match result {
            Ok(()) => {
                let (counter, reason, action) = match &self.event {
                    Event::Added(_) => (&self.ctx.metrics.added, "Reconciled", "Reconcile"),
                    Event::Modified(_) => (&self.ctx.metrics.modified, "Reconciled", "Reconcile"),
                    Event::Deleted(_) => (&self.ctx.metrics.deleted, "Deleted", "Delete"),
                };
                counter.inc();
                info!("Reconciled CloudServiceAccount");
                self.publish(csa, EventType::Normal, reason, action, None)
                    .await;
                true
            }
            Err(err) => {
                error!(
                    namespace = csa.namespace().unwrap_or_default(),
                    name = csa.name_any(),
                    transition,
                    error = %err,
                    "Reconciliation failed"
                );
                self.ctx.metrics.reconcile_failure(transition, &err);
                self.publish(
                    csa,
                    EventType::Warning,
                    "FailedReconcile",
                    "Reconcile",
                    Some(err.to_string()),
                )
                .await;
                false
            }
        }
    }

    /// Record an ERROR event from the watch. There is no object to act on.
    pub fn error(ctx: &Context, response: &ErrorResponse) {
        ctx.metrics.error.inc();
        error!(
            status = %response.status,
            reason = %response.reason,
            code = response.code,
            "Watch returned an error: {}",
            response.message
        );
    }

    async fn apply(&self, csa: &CloudServiceAccount) -> Result<()> {
        let _timer = self.ctx.metrics.measure(self.event.transition());
        let namespace = csa.namespace().ok_or(Error::MissingObjectKey("namespace"))?;
        let name = csa.name_any();

        let mut status = CloudServiceAccountStatus::default();
        let outcome = self.converge(csa, &namespace, &name, &mut status).await;
        if outcome.is_ok() {
            status.observed = Some(ObservedState {
                generation: csa.metadata.generation.unwrap_or_default(),
                resource_version: csa.resource_version().unwrap_or_default(),
            });
        }

        let patched = bounded(
            self.ctx.settings.api_timeout,
            self.ctx
                .kube
                .patch_cloud_service_account_status(&name, &namespace, &status),
            || Error::Timeout {
                operation: "PatchCloudServiceAccountStatus",
            },
        )
        .await;
        if let (Err(_), Err(e)) = (&outcome, &patched) {
            warn!(error = %e, "Failed to record partial status");
        }
        outcome.and(patched)
    }

    /// IAM role first, so the ServiceAccount never points at a role that does not exist yet
    async fn converge(
        &self,
        csa: &CloudServiceAccount,
        namespace: &str,
        name: &str,
        status: &mut CloudServiceAccountStatus,
    ) -> Result<()> {
        if csa.spec.cloud_provider != DEFAULT_CLOUD_PROVIDER {
            return Err(Error::UnsupportedCloudProvider(
                csa.spec.cloud_provider.clone(),
            ));
        }
        let role = self
            .iam_role(csa, namespace, name)
            .apply(csa.iam_role_digest())
            .await?;
        status.iam_role = Some(role.status());
        status.service_account = Some(self.service_account(csa, namespace, name).apply().await?);
        Ok(())
    }

    async fn delete(&self, csa: &CloudServiceAccount) -> Result<()> {
        let _timer = self.ctx.metrics.measure(self.event.transition());
        let namespace = csa.namespace().ok_or(Error::MissingObjectKey("namespace"))?;
        let name = csa.name_any();
        self.iam_role(csa, &namespace, &name).delete().await?;
        self.service_account(csa, &namespace, &name).delete().await
    }

    fn iam_role(&self, csa: &CloudServiceAccount, namespace: &str, name: &str) -> IamRoleReconciler {
        IamRoleReconciler::new(self.ctx.iam.clone(), &self.ctx.settings, namespace, name)
            .with_policy(
                &csa.spec.role_policy_template,
                &csa.spec.policy_template_values,
            )
            .with_attachments(csa.spec.role_policy_attachments.iter().cloned())
    }

    fn service_account(
        &self,
        csa: &CloudServiceAccount,
        namespace: &str,
        name: &str,
    ) -> ServiceAccountReconciler {
        ServiceAccountReconciler::new(
            self.ctx.kube.clone(),
            self.ctx.settings.api_timeout,
            namespace,
            name,
            csa.spec.service_account_options.as_ref(),
        )
    }

    async fn publish(
        &self,
        csa: &CloudServiceAccount,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = KubeEvent {
            type_,
            reason: reason.into(),
            note,
            action: action.into(),
            secondary: None,
        };
        let published = bounded(
            self.ctx.settings.api_timeout,
            self.ctx.kube.publish_event(csa, event),
            || Error::Timeout {
                operation: "PublishEvent",
            },
        )
        .await;
        if let Err(e) = published {
            warn!(error = %e, reason, "Failed to publish event");
        }
    }
}

/// Restart the watcher after `backoff` whenever it fails, until the CRD turns out to be missing
pub async fn supervise(watcher: &Watcher, backoff: Duration) -> Error {
    loop {
        let err = match watcher.watch().await {
            Ok(never) => match never {},
            Err(err) => err,
        };
        if let Error::CrdNotInstalled = err {
            error!("{err}");
            return err;
        }
        error!(error = %err, "Watcher failed, restarting in {:?}", backoff);
        tokio::time::sleep(backoff).await;
        watcher.metrics().restart.inc();
    }
}

// Initialize the controller and shared state. Returns only when the controller cannot continue.
pub async fn run(
    state: State,
    metrics: Metrics,
    kube: Arc<dyn KubeApi>,
    iam: Arc<dyn IamApi>,
) -> Error {
    let ctx = Context::new(&state, metrics, kube, iam);
    info!(
        cluster = %ctx.settings.cluster_name,
        account = %ctx.settings.account_id,
        issuer = %ctx.settings.oidc_issuer,
        "Starting CloudServiceAccount controller"
    );
    let backoff = ctx.settings.restart_backoff;
    supervise(&Watcher::new(ctx), backoff).await
}
