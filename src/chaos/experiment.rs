//! Chaos experiments: declared faults, a duration, and the thresholds the
//! `safety` monitor enforces while they run. The runner's shape is
//! declare-inject-watch-reverse: every injected fault has a rollback, and
//! a safety breach or operator abort triggers it immediately.

use crate::chaos::safety::{Sample, SafetyMonitor, SafetyThresholds, Violation};
use crate::identity::NodeId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{info, warn};

/// Errors running a chaos experiment.
#[derive(Debug, Error)]
pub enum ChaosError {
    /// The chaos harness is disabled in configuration.
    #[error("chaos harness is disabled")]
    Disabled,
    /// Too many experiments are already running concurrently.
    #[error("max concurrent experiments ({0}) already running")]
    Saturated(usize),
    /// Injecting the fault failed outright.
    #[error("fault injection failed: {0}")]
    InjectionFailed(String),
}

impl ChaosError {
    /// Fold into the crate-wide taxonomy.
    pub fn kind(&self) -> crate::error::ErrorKind {
        match self {
            ChaosError::Disabled => crate::error::ErrorKind::PermissionDenied,
            ChaosError::Saturated(_) => crate::error::ErrorKind::Overloaded,
            ChaosError::InjectionFailed(_) => crate::error::ErrorKind::Unavailable,
        }
    }
}

/// A declared fault. Each variant is both injectable and reversible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Scenario {
    /// Simulate a node crash: the node stops responding entirely.
    KillNode(NodeId),
    /// Simulate a network partition between two groups of nodes.
    Partition { group_a: Vec<NodeId>, group_b: Vec<NodeId> },
    /// Inject artificial latency on every request a node handles.
    InjectLatency { node_id: NodeId, added_ms: u64 },
}

/// One experiment: which faults to inject together, for how long, under
/// what safety bounds, and what the operator expects to observe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    /// Unique id, assigned at submission.
    pub id: uuid::Uuid,
    /// The faults to inject, applied in order and reversed in reverse
    /// order on rollback.
    pub scenarios: Vec<Scenario>,
    /// How long to hold the faults before rolling them back, absent a
    /// breach.
    pub duration: Duration,
    /// The operator's stated expectation, echoed into the validation
    /// report (e.g. "the scheduler fails requests over to the surviving
    /// replica within one retry").
    pub hypothesis: Option<String>,
    /// Safety thresholds for this experiment; overrides the harness's
    /// configured defaults when present.
    pub thresholds: Option<SafetyThresholds>,
}

/// The terminal outcome of a completed or aborted experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Outcome {
    /// Ran for the full duration with no safety breach.
    Completed,
    /// Aborted early; the fault was rolled back (or rollback was disabled).
    Aborted { violation: Violation, rolled_back: bool },
}

/// A named pass/fail check against the declared goal of running the
/// experiment at all: did the fault actually get injected, did the cluster
/// stay within its safety bounds, and was the fault reversed if it didn't.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessCriterion {
    pub description: String,
    pub met: bool,
}

/// Qualitative fallout from one experiment, written for the three audiences
/// an incident review cares about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImpactAssessment {
    pub service: String,
    pub user: String,
    pub business: String,
}

/// The full validation output of one experiment: the raw outcome, which
/// success criteria held, the metrics at the point the experiment ended, an
/// impact assessment, and recommendations derived from what happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub experiment_id: uuid::Uuid,
    /// The hypothesis the experiment was declared with, if any.
    pub hypothesis: Option<String>,
    pub outcome: Outcome,
    pub success_criteria: Vec<SuccessCriterion>,
    pub metrics_snapshot: Sample,
    pub impact: ImpactAssessment,
    pub recommendations: Vec<String>,
}

fn build_report(experiment: &Experiment, outcome: Outcome, metrics_snapshot: Sample) -> ValidationReport {
    let (fault_injected, no_violation, rolled_back_if_needed) = match &outcome {
        Outcome::Completed => (true, true, true),
        Outcome::Aborted { rolled_back, .. } => (true, false, *rolled_back),
    };
    let success_criteria = vec![
        SuccessCriterion { description: "fault was injected".to_string(), met: fault_injected },
        SuccessCriterion { description: "no safety threshold was breached".to_string(), met: no_violation },
        SuccessCriterion {
            description: "fault was rolled back if the experiment aborted".to_string(),
            met: rolled_back_if_needed,
        },
    ];

    let impact = match &outcome {
        Outcome::Completed => ImpactAssessment {
            service: "no measurable degradation".to_string(),
            user: "no user-visible impact expected".to_string(),
            business: "none".to_string(),
        },
        Outcome::Aborted { violation, .. } => impact_of(violation),
    };

    let recommendations = match &outcome {
        Outcome::Completed => vec![format!(
            "{:?} tolerated for the full {:?}; consider a wider blast radius or a longer duration next time",
            experiment.scenarios, experiment.duration
        )],
        Outcome::Aborted { violation, rolled_back } => {
            let mut recs = vec![recommendation_for(violation)];
            if !rolled_back {
                recs.push("auto_rollback was disabled; confirm the fault was reversed manually before the next run".to_string());
            }
            recs
        }
    };

    ValidationReport {
        experiment_id: experiment.id,
        hypothesis: experiment.hypothesis.clone(),
        outcome,
        success_criteria,
        metrics_snapshot,
        impact,
        recommendations,
    }
}

fn impact_of(violation: &Violation) -> ImpactAssessment {
    match violation {
        Violation::ErrorRate { observed, limit } => ImpactAssessment {
            service: format!("error rate reached {:.1}%, above the {:.1}% limit", observed * 100.0, limit * 100.0),
            user: "a fraction of requests during the experiment likely failed".to_string(),
            business: if observed > &(limit * 2.0) {
                "severe: user-facing failures at scale".to_string()
            } else {
                "moderate: elevated failure rate".to_string()
            },
        },
        Violation::LatencyIncrease { ratio, limit } => ImpactAssessment {
            service: format!("latency rose to {:.1}x baseline, above the {:.1}x limit", ratio, limit),
            user: "requests during the experiment were noticeably slower".to_string(),
            business: if ratio > &(limit * 2.0) {
                "severe: latency degraded well past the tolerated bound".to_string()
            } else {
                "moderate: latency exceeded the tolerated bound".to_string()
            },
        },
        Violation::ThroughputDrop { ratio, limit } => ImpactAssessment {
            service: format!("throughput dropped {:.1}%, above the {:.1}% limit", ratio * 100.0, limit * 100.0),
            user: "some requests during the experiment may have been delayed or dropped".to_string(),
            business: if ratio > &(limit * 1.5) {
                "severe: meaningful capacity loss".to_string()
            } else {
                "moderate: reduced capacity".to_string()
            },
        },
        Violation::Cancelled => ImpactAssessment {
            service: "experiment stopped before any safety threshold was reached".to_string(),
            user: "no violation-driven impact; any impact was the injected fault's own blast radius".to_string(),
            business: "none beyond the fault's own blast radius".to_string(),
        },
    }
}

fn recommendation_for(violation: &Violation) -> String {
    match violation {
        Violation::ErrorRate { .. } => {
            "investigate the failure path exercised by this scenario and consider a smaller blast radius before retrying".to_string()
        }
        Violation::LatencyIncrease { .. } => {
            "investigate retry/backoff behavior under this fault and consider a shorter duration before retrying".to_string()
        }
        Violation::ThroughputDrop { .. } => {
            "investigate capacity headroom for this scenario before retrying at this scale".to_string()
        }
        Violation::Cancelled => "re-run uninterrupted to get a real safety verdict for this scenario".to_string(),
    }
}

/// Implemented by whatever can actually inject and reverse a `Scenario` —
/// the real implementation reaches into `membership`/`api::peer_api` to
/// simulate node death or network partition; tests use in-process fakes.
#[async_trait]
pub trait FaultInjector: Send + Sync {
    /// Apply the fault described by `scenario`.
    async fn inject(&self, scenario: &Scenario) -> Result<(), ChaosError>;
    /// Reverse a previously injected fault.
    async fn rollback(&self, scenario: &Scenario);
}

/// Implemented by whatever can report current cluster-wide request metrics
/// — `scheduler::StatsTable` aggregated across nodes in production.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// A fresh sample of current error rate / latency / throughput.
    async fn sample(&self) -> Sample;
}

/// Runs one experiment to completion, sampling at `monitoring_window`
/// intervals and aborting on the first safety violation.
pub struct ExperimentRunner {
    injector: Arc<dyn FaultInjector>,
    metrics: Arc<dyn MetricsSource>,
    default_thresholds: SafetyThresholds,
    monitoring_window: Duration,
    auto_rollback: bool,
}

impl ExperimentRunner {
    /// Build a runner against the given fault injector and metrics source.
    pub fn new(
        injector: Arc<dyn FaultInjector>,
        metrics: Arc<dyn MetricsSource>,
        default_thresholds: SafetyThresholds,
        monitoring_window: Duration,
        auto_rollback: bool,
    ) -> Self {
        Self {
            injector,
            metrics,
            default_thresholds,
            monitoring_window,
            auto_rollback,
        }
    }

    /// Reverse `scenarios` in reverse injection order.
    async fn rollback_all(&self, scenarios: &[Scenario]) {
        for scenario in scenarios.iter().rev() {
            self.injector.rollback(scenario).await;
        }
    }

    /// Run `experiment`: sample a baseline, inject every declared fault,
    /// then poll safety at `monitoring_window` intervals until the duration
    /// elapses, a violation fires, or `cancel` is signaled by an operator
    /// abort. A failure injecting any scenario reverses the ones already
    /// applied before surfacing the error.
    pub async fn run(
        &self,
        experiment: &Experiment,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<ValidationReport, ChaosError> {
        let baseline = self.metrics.sample().await;
        let thresholds = experiment.thresholds.unwrap_or(self.default_thresholds);
        let mut monitor = SafetyMonitor::new(baseline, thresholds, 16);
        let mut last_sample = baseline;

        for (position, scenario) in experiment.scenarios.iter().enumerate() {
            if let Err(e) = self.injector.inject(scenario).await {
                self.rollback_all(&experiment.scenarios[..position]).await;
                return Err(e);
            }
        }
        info!(experiment_id = %experiment.id, scenarios = experiment.scenarios.len(), "faults injected");

        let deadline = tokio::time::Instant::now() + experiment.duration;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                self.rollback_all(&experiment.scenarios).await;
                info!(experiment_id = %experiment.id, "experiment completed without violation");
                return Ok(build_report(experiment, Outcome::Completed, last_sample));
            }

            tokio::select! {
                _ = sleep(self.monitoring_window.min(remaining)) => {}
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        warn!(experiment_id = %experiment.id, "experiment aborted by operator");
                        self.rollback_all(&experiment.scenarios).await;
                        let outcome = Outcome::Aborted { violation: Violation::Cancelled, rolled_back: true };
                        return Ok(build_report(experiment, outcome, last_sample));
                    }
                    continue;
                }
            }

            let sample = self.metrics.sample().await;
            last_sample = sample;
            if let Some(violation) = monitor.observe(sample) {
                warn!(experiment_id = %experiment.id, ?violation, "safety violation, aborting experiment");
                let rolled_back = self.auto_rollback;
                if rolled_back {
                    self.rollback_all(&experiment.scenarios).await;
                }
                return Ok(build_report(experiment, Outcome::Aborted { violation, rolled_back }, last_sample));
            }
        }
    }
}
