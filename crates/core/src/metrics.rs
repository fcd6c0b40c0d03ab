use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::circuit_breaker::{CircuitSnapshot, CircuitState};

const LOW_SUCCESS_RATE: f64 = 0.8;
const MIN_SAMPLE_FOR_RATE: u64 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryOrigin {
    Agent,
    Database,
    Api,
    Saga,
}

impl RecoveryOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Database => "database",
            Self::Api => "api",
            Self::Saga => "saga",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryMetrics {
    pub total_recoveries: u64,
    pub successful_recoveries: u64,
    pub failed_recoveries: u64,
    pub degraded_recoveries: u64,
    pub circuit_breaker_rejections: u64,
    pub manual_interventions: u64,
    pub by_origin: BTreeMap<String, u64>,
    /// Keyed by recovery method: an escalation rung, an executor action, or
    /// `rollback`/`saga`.
    pub by_method: BTreeMap<String, u64>,
}

impl RecoveryMetrics {
    pub fn success_rate(&self) -> Option<f64> {
        (self.total_recoveries > 0)
            .then(|| self.successful_recoveries as f64 / self.total_recoveries as f64)
    }
}

/// Process-wide counters behind one lock.
#[derive(Debug, Default)]
pub struct MetricsRecorder {
    inner: Mutex<RecoveryMetrics>,
}

impl MetricsRecorder {
    pub fn record_success(&self, origin: RecoveryOrigin, method: &str, degraded: bool) {
        self.update(|metrics| {
            count(metrics, origin, method);
            metrics.successful_recoveries += 1;
            if degraded {
                metrics.degraded_recoveries += 1;
            }
        });
    }

    pub fn record_failure(&self, origin: RecoveryOrigin, method: &str) {
        self.update(|metrics| {
            count(metrics, origin, method);
            metrics.failed_recoveries += 1;
        });
    }

    pub fn record_circuit_rejection(&self, origin: RecoveryOrigin) {
        self.update(|metrics| {
            count(metrics, origin, "circuit_open");
            metrics.failed_recoveries += 1;
            metrics.circuit_breaker_rejections += 1;
        });
    }

    pub fn record_manual_intervention(&self) {
        self.update(|metrics| metrics.manual_interventions += 1);
    }

    pub fn snapshot(&self) -> RecoveryMetrics {
        match self.inner.lock() {
            Ok(metrics) => metrics.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn update(&self, apply: impl FnOnce(&mut RecoveryMetrics)) {
        let mut metrics = match self.inner.lock() {
            Ok(metrics) => metrics,
            Err(poisoned) => poisoned.into_inner(),
        };
        apply(&mut metrics);
    }
}

fn count(metrics: &mut RecoveryMetrics, origin: RecoveryOrigin, method: &str) {
    metrics.total_recoveries += 1;
    *metrics.by_origin.entry(origin.as_str().to_owned()).or_default() += 1;
    *metrics.by_method.entry(method.to_owned()).or_default() += 1;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub generated_at: DateTime<Utc>,
    pub metrics: RecoveryMetrics,
    pub success_rate: Option<f64>,
    pub circuit_breakers: Vec<CircuitSnapshot>,
    pub active_transactions: usize,
    pub active_rollback_sessions: usize,
    pub active_sagas: usize,
    pub recommendations: Vec<String>,
}

impl RecoveryReport {
    pub fn build(
        metrics: RecoveryMetrics,
        circuit_breakers: Vec<CircuitSnapshot>,
        active_transactions: usize,
        active_rollback_sessions: usize,
        active_sagas: usize,
    ) -> Self {
        let success_rate = metrics.success_rate();
        let recommendations = recommendations(&metrics, &circuit_breakers);
        Self {
            generated_at: Utc::now(),
            metrics,
            success_rate,
            circuit_breakers,
            active_transactions,
            active_rollback_sessions,
            active_sagas,
            recommendations,
        }
    }
}

fn recommendations(metrics: &RecoveryMetrics, circuits: &[CircuitSnapshot]) -> Vec<String> {
    let mut out = Vec::new();

    for circuit in circuits.iter().filter(|circuit| circuit.state != CircuitState::Closed) {
        out.push(format!(
            "circuit for `{}` is {} after {} failures; check the dependency before it reopens in {}s",
            circuit.resource, circuit.state, circuit.failure_count, circuit.retry_after_secs
        ));
    }

    if let Some(rate) = metrics.success_rate() {
        if metrics.total_recoveries >= MIN_SAMPLE_FOR_RATE && rate < LOW_SUCCESS_RATE {
            out.push(format!(
                "recovery success rate is {:.0}%; review the failing origins: {}",
                rate * 100.0,
                summarize(&metrics.by_origin)
            ));
        }
    }

    if metrics.degraded_recoveries > 0 {
        out.push(format!(
            "{} recoveries fell back to degraded mode; their results need manual review",
            metrics.degraded_recoveries
        ));
    }

    if metrics.manual_interventions > 0 {
        out.push(format!(
            "{} failures are waiting for manual intervention",
            metrics.manual_interventions
        ));
    }

    out
}

fn summarize(counts: &BTreeMap<String, u64>) -> String {
    counts.iter().map(|(key, count)| format!("{key}={count}")).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::{MetricsRecorder, RecoveryOrigin, RecoveryReport};
    use crate::circuit_breaker::{CircuitSnapshot, CircuitState};

    #[test]
    fn counters_track_origin_and_method() {
        let recorder = MetricsRecorder::default();
        recorder.record_success(RecoveryOrigin::Agent, "primary", false);
        recorder.record_success(RecoveryOrigin::Agent, "degraded", true);
        recorder.record_failure(RecoveryOrigin::Api, "abort");
        recorder.record_circuit_rejection(RecoveryOrigin::Api);

        let metrics = recorder.snapshot();
        assert_eq!(metrics.total_recoveries, 4);
        assert_eq!(metrics.successful_recoveries, 2);
        assert_eq!(metrics.failed_recoveries, 2);
        assert_eq!(metrics.degraded_recoveries, 1);
        assert_eq!(metrics.circuit_breaker_rejections, 1);
        assert_eq!(metrics.by_origin.get("api"), Some(&2));
        assert_eq!(metrics.by_method.get("circuit_open"), Some(&1));
        assert_eq!(metrics.success_rate(), Some(0.5));
    }

    #[test]
    fn empty_metrics_have_no_rate_and_no_recommendations() {
        let report = RecoveryReport::build(MetricsRecorder::default().snapshot(), Vec::new(), 0, 0, 0);

        assert_eq!(report.success_rate, None);
        assert!(report.recommendations.is_empty());
    }

    #[test]
    fn report_recommends_on_open_circuits_and_low_success() {
        let recorder = MetricsRecorder::default();
        for _ in 0..3 {
            recorder.record_success(RecoveryOrigin::Database, "rollback", false);
        }
        for _ in 0..7 {
            recorder.record_failure(RecoveryOrigin::Api, "abort");
        }
        recorder.record_manual_intervention();
        let circuits = vec![CircuitSnapshot {
            resource: "GET /v1/usage".to_owned(),
            state: CircuitState::Open,
            failure_count: 5,
            last_failure_time: None,
            retry_after_secs: 42,
        }];

        let report = RecoveryReport::build(recorder.snapshot(), circuits, 1, 0, 2);

        assert_eq!(report.recommendations.len(), 3);
        assert!(report.recommendations[0].contains("GET /v1/usage"));
        assert!(report.recommendations[1].contains("30%"));
        assert!(report.recommendations[2].contains("manual intervention"));
        assert_eq!(report.active_sagas, 2);
    }
}
