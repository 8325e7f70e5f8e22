use crate::{api::cluster::Cluster, Error};
use chrono::{DateTime, Utc};
use kube::{
    runtime::events::{Recorder, Reporter},
    Client, ResourceExt,
};
use prometheus::{histogram_opts, opts, Histogram, HistogramTimer, IntCounter, IntCounterVec, Registry};
use serde::Serialize;

/// Reconciler metrics exposed on `/metrics`
#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounter,
    pub failures: IntCounterVec,
    pub reconcile_duration: Histogram,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let reconcile_duration = Histogram::with_opts(
            histogram_opts!(
                "kaas_cluster_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds"
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
        )?;
        let failures = IntCounterVec::new(
            opts!(
                "kaas_cluster_reconciliation_errors_total",
                "reconciliation errors"
            ),
            &["instance", "error"],
        )?;
        let reconciliations =
            IntCounter::new("kaas_cluster_reconciliations_total", "reconciliations")?;

        Ok(Metrics {
            reconciliations,
            failures,
            reconcile_duration,
        })
    }

    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> prometheus::Result<Self> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure(&self, cluster: &Cluster, e: &Error) {
        self.failures
            .with_label_values(&[cluster.name_any().as_str(), e.metric_label().as_str()])
            .inc()
    }

    /// Count a reconcile and time it until the returned timer is dropped.
    pub fn count_and_measure(&self) -> HistogramTimer {
        self.reconciliations.inc();
        self.reconcile_duration.start_timer()
    }
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "kaas-operator".into(),
        }
    }
}

impl Diagnostics {
    pub fn recorder(&self, client: Client) -> Recorder {
        Recorder::new(client, self.reporter.clone())
    }
}
