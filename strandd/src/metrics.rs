//! Prometheus exposition of projection status.

use crate::error::DaemonResult;
use prometheus::{Encoder, IntGaugeVec, Opts, Registry, TextEncoder};
use strand_projector::ProjectionStatus;

/// Gauges refreshed from engine status on every scrape.
pub struct Metrics {
    registry: Registry,
    applied: IntGaugeVec,
    retried: IntGaugeVec,
    skipped: IntGaugeVec,
    failed: IntGaugeVec,
    position: IntGaugeVec,
    running: IntGaugeVec,
    faulted: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> DaemonResult<Self> {
        let registry = Registry::new_custom(Some("strand".to_string()), None)?;

        let gauge = |name: &str, help: &str| -> DaemonResult<IntGaugeVec> {
            let gauge = IntGaugeVec::new(Opts::new(name, help), &["projection"])?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };

        Ok(Self {
            applied: gauge("projection_events_applied", "Events applied successfully")?,
            retried: gauge("projection_events_retried", "Re-attempts after a handler failure")?,
            skipped: gauge("projection_events_skipped", "Events skipped by the failure policy")?,
            failed: gauge("projection_handler_failures", "Handler invocations that failed")?,
            position: gauge("projection_position", "Position up to which every event is processed, -1 if none")?,
            running: gauge("projection_running", "1 while a processing run is active")?,
            faulted: gauge("projection_faulted", "1 when the last run halted on a fault")?,
            registry,
        })
    }

    /// Render the text exposition for the given statuses.
    pub fn render(&self, statuses: &[ProjectionStatus]) -> DaemonResult<String> {
        for status in statuses {
            let labels = [status.name.as_str()];
            let as_gauge = |value: u64| i64::try_from(value).unwrap_or(i64::MAX);

            self.applied.with_label_values(&labels).set(as_gauge(status.counters.applied));
            self.retried.with_label_values(&labels).set(as_gauge(status.counters.retried));
            self.skipped.with_label_values(&labels).set(as_gauge(status.counters.skipped));
            self.failed.with_label_values(&labels).set(as_gauge(status.counters.failed));
            self.position.with_label_values(&labels).set(status.position.unwrap_or(-1));
            self.running.with_label_values(&labels).set(i64::from(status.state.is_running()));
            self.faulted.with_label_values(&labels).set(i64::from(status.state.is_faulted()));
        }

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))?)
    }
}
