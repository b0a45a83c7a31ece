//! Chaos safety abort: a latency-injection experiment crosses its safety
//! threshold and the harness rolls it back mid-run, after which a follow-up
//! sample shows latency back under the threshold.

use async_trait::async_trait;
use meridian::chaos::{ChaosHarness, Experiment, FaultInjector, MetricsSource, Outcome, Sample, Scenario};
use meridian::config::ChaosConfig;
use meridian::identity::NodeKeyPair;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct RecordingInjector {
    injected: AtomicBool,
    rolled_back: AtomicBool,
}

#[async_trait]
impl FaultInjector for RecordingInjector {
    async fn inject(&self, _scenario: &Scenario) -> Result<(), meridian::chaos::ChaosError> {
        self.injected.store(true, Ordering::SeqCst);
        Ok(())
    }
    async fn rollback(&self, _scenario: &Scenario) {
        self.rolled_back.store(true, Ordering::SeqCst);
    }
}

/// Reports a 10ms baseline, then a sustained 300ms-latency breach (more
/// than the 2.0x `max_latency_increase` threshold), then recovery.
struct ScriptedMetrics {
    samples: Mutex<Vec<Sample>>,
    index: AtomicU32,
}

#[async_trait]
impl MetricsSource for ScriptedMetrics {
    async fn sample(&self) -> Sample {
        let samples = self.samples.lock().unwrap();
        let i = self.index.fetch_add(1, Ordering::SeqCst) as usize;
        samples[i.min(samples.len() - 1)]
    }
}

#[tokio::test]
async fn latency_breach_aborts_experiment_and_rolls_back() {
    let injector = Arc::new(RecordingInjector { injected: AtomicBool::new(false), rolled_back: AtomicBool::new(false) });
    let metrics = Arc::new(ScriptedMetrics {
        samples: Mutex::new(vec![
            Sample { error_rate: 0.0, mean_latency_ms: 10.0, throughput: 100.0 }, // baseline
            Sample { error_rate: 0.0, mean_latency_ms: 310.0, throughput: 95.0 }, // breach: >2.0x baseline
            Sample { error_rate: 0.0, mean_latency_ms: 12.0, throughput: 100.0 }, // recovered, post-rollback
        ]),
        index: AtomicU32::new(0),
    });

    let mut config = ChaosConfig::default();
    config.enabled = true;
    config.monitoring_window = Duration::from_millis(5);
    config.auto_rollback = true;

    let harness = Arc::new(ChaosHarness::new(injector.clone(), metrics.clone(), &config));

    let node_id = NodeKeyPair::generate().node_id();
    let experiment = Experiment {
        id: uuid::Uuid::new_v4(),
        scenarios: vec![Scenario::InjectLatency { node_id, added_ms: 300 }],
        duration: Duration::from_secs(10),
        hypothesis: Some("300ms of injected latency stays within the 2x safety bound".to_string()),
        thresholds: None,
    };

    let report = harness.submit(experiment).await.unwrap();
    match report.outcome {
        Outcome::Aborted { rolled_back, .. } => assert!(rolled_back, "auto_rollback was enabled"),
        Outcome::Completed => panic!("a 30x latency breach should have aborted the experiment"),
    }
    assert!(!report.success_criteria.iter().all(|c| c.met));
    assert!(!report.recommendations.is_empty());
    assert!(injector.injected.load(Ordering::SeqCst));
    assert!(injector.rolled_back.load(Ordering::SeqCst));

    // A follow-up sample, taken after rollback, confirms latency recovered
    // below the threshold ratio relative to the original baseline.
    let recovered = metrics.sample().await;
    assert!(recovered.mean_latency_ms < 10.0 * 2.0, "latency should have returned under the threshold after rollback");
}
