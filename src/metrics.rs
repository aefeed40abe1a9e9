use crate::Error;
use prometheus::{histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, Registry};
use tokio::time::Instant;

/// Counters reported by the watcher and the CloudServiceAccount state machines
#[derive(Clone)]
pub struct Metrics {
    pub added: IntCounter,
    pub modified: IntCounter,
    pub deleted: IntCounter,
    pub error: IntCounter,
    pub restart: IntCounter,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "cloudsap_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds"
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &["transition"],
        )?;
        let failures = IntCounterVec::new(
            opts!(
                "cloudsap_reconciliation_errors_total",
                "reconciliation errors",
            ),
            &["transition", "error"],
        )?;
        Ok(Metrics {
            added: IntCounter::new("cloudsap_watcher_added", "CloudServiceAccounts added")?,
            modified: IntCounter::new(
                "cloudsap_watcher_modified",
                "CloudServiceAccounts modified",
            )?,
            deleted: IntCounter::new("cloudsap_watcher_deleted", "CloudServiceAccounts deleted")?,
            error: IntCounter::new("cloudsap_watcher_error", "ERROR events from the watch")?,
            restart: IntCounter::new("cloudsap_watcher_restart", "watcher restarts")?,
            failures,
            reconcile_duration,
        })
    }

    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.added.clone()))?;
        registry.register(Box::new(self.modified.clone()))?;
        registry.register(Box::new(self.deleted.clone()))?;
        registry.register(Box::new(self.error.clone()))?;
        registry.register(Box::new(self.restart.clone()))?;
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure(&self, transition: &str, e: &Error) {
        self.failures
            .with_label_values(&[transition, e.metric_label()])
            .inc()
    }

    pub fn measure(&self, transition: &'static str) -> ReconcileMeasurer {
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.clone(),
            transition,
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    metric: HistogramVec,
    transition: &'static str,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric
            .with_label_values(&[self.transition])
            .observe(duration);
    }
}
