pub mod controller;

pub use controller::{run, supervise, CloudServiceAccountMachine, Context, Event};

mod reconcilers;
pub use reconcilers::iam_role::IamRoleReconciler;

mod stack;
pub use stack::ReconciliationStack;

mod watcher;
pub use watcher::Watcher;
