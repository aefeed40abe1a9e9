use std::future::Future;
use std::time::Duration;

pub mod iam_role;
pub mod service_account;

/// Await `call`, giving up after `limit` with the error produced by `on_timeout`
pub(crate) async fn bounded<T, E, F>(
    limit: Duration,
    call: F,
    on_timeout: impl FnOnce() -> E,
) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or_else(|_| Err(on_timeout()))
}
