//! Chaos harness: submit bounded fault-injection experiments that
//! auto-abort the moment cluster-wide metrics breach a safety threshold.
//! A semaphore bounds how many experiments run at once, and the whole
//! surface is gated behind an explicit configuration switch.

pub mod experiment;
pub mod safety;

pub use experiment::{
    ChaosError, Experiment, ExperimentRunner, FaultInjector, ImpactAssessment, MetricsSource, Outcome, Scenario,
    SuccessCriterion, ValidationReport,
};
pub use safety::{Sample, SafetyMonitor, SafetyThresholds, Violation};

use crate::config::ChaosConfig;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::time::sleep;
use tracing::{info, instrument};
use uuid::Uuid;

/// Owns the harness's concurrency bound and default safety thresholds;
/// hands out `ExperimentRunner`s to actually execute submitted experiments.
pub struct ChaosHarness {
    runner: Arc<ExperimentRunner>,
    permits: Arc<Semaphore>,
    enabled: bool,
    continuous_enabled: bool,
    experiment_interval: std::time::Duration,
    /// Cancel switches for in-flight experiments, keyed by experiment id.
    running: DashMap<Uuid, watch::Sender<bool>>,
    /// Past experiments and their validation reports, oldest first.
    history: Mutex<Vec<(Experiment, ValidationReport)>>,
}

impl ChaosHarness {
    /// Build a harness. Allocation only; `run_continuous` must be spawned
    /// separately to start the randomized-experiment loop, if enabled.
    pub fn new(
        injector: Arc<dyn FaultInjector>,
        metrics: Arc<dyn MetricsSource>,
        config: &ChaosConfig,
    ) -> Self {
        let thresholds = SafetyThresholds {
            max_error_rate: config.max_error_rate,
            max_latency_increase: config.max_latency_increase,
            max_throughput_drop: config.max_throughput_drop,
        };
        let runner = Arc::new(ExperimentRunner::new(
            injector,
            metrics,
            thresholds,
            config.monitoring_window,
            config.auto_rollback,
        ));
        Self {
            runner,
            permits: Arc::new(Semaphore::new(config.max_concurrent_experiments)),
            enabled: config.enabled,
            continuous_enabled: config.continuous_enabled,
            experiment_interval: config.experiment_interval,
            running: DashMap::new(),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Submit one experiment, blocking until a concurrency permit is free.
    /// Returns `ChaosError::Disabled` if the harness is turned off.
    #[instrument(skip(self, experiment), fields(experiment_id = %experiment.id))]
    pub async fn submit(&self, experiment: Experiment) -> Result<ValidationReport, ChaosError> {
        if !self.enabled {
            return Err(ChaosError::Disabled);
        }
        let Ok(_permit) = self.permits.clone().try_acquire_owned() else {
            return Err(ChaosError::Saturated(self.permits.available_permits()));
        };
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.running.insert(experiment.id, cancel_tx);
        let result = self.runner.run(&experiment, cancel_rx).await;
        self.running.remove(&experiment.id);
        let report = result?;
        info!(outcome = ?report.outcome, "experiment finished");
        self.history.lock().push((experiment, report.clone()));
        Ok(report)
    }

    /// Cancel an in-flight experiment, triggering rollback of its fault.
    /// Returns `true` if `id` was actually running; `false` if it had
    /// already finished or was never submitted.
    pub fn abort(&self, id: Uuid) -> bool {
        match self.running.get(&id) {
            Some(tx) => {
                let _ = tx.send(true);
                true
            }
            None => false,
        }
    }

    /// Past experiments and their validation reports, oldest first.
    pub fn history(&self) -> Vec<(Experiment, ValidationReport)> {
        self.history.lock().clone()
    }

    /// Run a self-driving loop that submits a caller-supplied experiment
    /// generator at `experiment_interval`, until `shutdown` fires. A no-op
    /// if continuous mode isn't enabled in configuration.
    pub async fn run_continuous(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        next_experiment: impl Fn() -> Experiment + Send + Sync + 'static,
    ) {
        if !self.enabled || !self.continuous_enabled {
            return;
        }
        loop {
            tokio::select! {
                _ = sleep(self.experiment_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
            if *shutdown.borrow() {
                return;
            }
            let experiment = next_experiment();
            if let Err(e) = self.submit(experiment).await {
                info!(error = %e, "continuous chaos cycle skipped");
            }
        }
    }
}
