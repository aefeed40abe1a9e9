use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use kube::runtime::reflector::ObjectRef;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::*;

use super::controller::{CloudServiceAccountMachine, Context, Event};
use crate::resources::cloudserviceaccounts::CloudServiceAccount;

/// Live identities, each with the event that arrived while it was being reconciled
type Entries = HashMap<ObjectRef<CloudServiceAccount>, Option<Event>>;

/// Keeps at most one reconciliation in flight per CloudServiceAccount.
///
/// Events for an identity that is already being reconciled are parked, and only the newest
/// parked event is run once the current transition finishes.
#[derive(Clone)]
pub struct ReconciliationStack {
    ctx: Arc<Context>,
    entries: Arc<Mutex<Entries>>,
}

impl ReconciliationStack {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            entries: Default::default(),
        }
    }

    /// Start reconciling `event`, or park it behind the reconciliation already in flight
    pub async fn dispatch(&self, event: Event) -> Option<JoinHandle<()>> {
        let identity = event.identity();
        let mut entries = self.entries.lock().await;
        if let Some(pending) = entries.get_mut(&identity) {
            debug!(csa = %identity, transition = event.transition(), "Reconciliation in flight, parking event");
            *pending = Some(event);
            return None;
        }
        entries.insert(identity.clone(), None);
        drop(entries);

        let machine = CloudServiceAccountMachine::new(self.ctx.clone(), event);
        Some(tokio::spawn(self.clone().drain(identity, machine)))
    }

    /// Number of identities with a reconciliation in flight
    pub async fn in_flight(&self) -> usize {
        self.entries.lock().await.len()
    }

    async fn drain(
        self,
        identity: ObjectRef<CloudServiceAccount>,
        mut machine: CloudServiceAccountMachine,
    ) {
        loop {
            if let Err(panic) = AssertUnwindSafe(machine.run()).catch_unwind().await {
                error!(csa = %identity, "Reconciliation panicked: {}", panic_message(panic.as_ref()));
            }

            let mut entries = self.entries.lock().await;
            match entries.get_mut(&identity).and_then(Option::take) {
                Some(event) => machine.refresh(event),
                None => {
                    entries.remove(&identity);
                    return;
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
