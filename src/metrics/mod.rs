//! Prometheus metrics for uabridge
//!
//! Exposes metrics at /metrics endpoint for monitoring and observability.
//! Per-transfer series are labelled with the transfer-process id and removed
//! when the session ends.

use std::time::Duration;

use prometheus::{
    Histogram, HistogramOpts, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};

mod server;

pub use server::MetricsServer;

use crate::bridge::Status;
use crate::leg::Leg;

/// All uabridge metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Session metrics
    pub sessions_active: IntGauge,
    pub session_status: IntGaugeVec,

    // Data flow metrics
    pub events_received_total: IntCounterVec,
    pub messages_published_total: IntCounterVec,
    pub publish_rejected_total: IntCounterVec,
    pub untranslatable_total: IntCounterVec,
    pub backpressure_total: IntCounterVec,
    pub notifications_dropped_total: IntCounterVec,

    // Leg health
    pub reconnects_total: IntCounterVec,

    // Performance metrics
    pub publish_latency: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        // Session metrics
        let sessions_active = IntGauge::with_opts(Opts::new(
            "uabridge_sessions_active",
            "Bridge sessions currently registered",
        ))
        .unwrap();

        let session_status = IntGaugeVec::new(
            Opts::new(
                "uabridge_session_status",
                "Session status (0 starting, 1 running, 2 degraded, 3 suspended, 4 completing, 5 completed, 6 failed)",
            ),
            &["transfer"],
        )
        .unwrap();

        // Data flow metrics
        let events_received_total = IntCounterVec::new(
            Opts::new(
                "uabridge_events_received_total",
                "Value changes received from the OPC UA source",
            ),
            &["transfer"],
        )
        .unwrap();

        let messages_published_total = IntCounterVec::new(
            Opts::new(
                "uabridge_messages_published_total",
                "Messages delivered to the MQTT broker",
            ),
            &["transfer"],
        )
        .unwrap();

        let publish_rejected_total = IntCounterVec::new(
            Opts::new(
                "uabridge_publish_rejected_total",
                "Publishes rejected by the MQTT broker",
            ),
            &["transfer"],
        )
        .unwrap();

        let untranslatable_total = IntCounterVec::new(
            Opts::new(
                "uabridge_untranslatable_total",
                "Value changes dropped because they have no message form",
            ),
            &["transfer"],
        )
        .unwrap();

        let backpressure_total = IntCounterVec::new(
            Opts::new(
                "uabridge_backpressure_total",
                "Publishes refused because the sink buffer was full",
            ),
            &["transfer"],
        )
        .unwrap();

        let notifications_dropped_total = IntCounterVec::new(
            Opts::new(
                "uabridge_notifications_dropped_total",
                "OPC UA notifications dropped because the session queue was full",
            ),
            &["transfer"],
        )
        .unwrap();

        let reconnects_total = IntCounterVec::new(
            Opts::new(
                "uabridge_reconnects_total",
                "Connection losses that triggered a reconnect",
            ),
            &["transfer", "leg"],
        )
        .unwrap();

        // Performance metrics
        let publish_latency = Histogram::with_opts(
            HistogramOpts::new(
                "uabridge_publish_latency_seconds",
                "Time from publish submission to broker acknowledgement",
            )
            .buckets(vec![
                0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0,
            ]),
        )
        .unwrap();

        // Register all metrics
        registry
            .register(Box::new(sessions_active.clone()))
            .unwrap();
        registry
            .register(Box::new(session_status.clone()))
            .unwrap();
        registry
            .register(Box::new(events_received_total.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_published_total.clone()))
            .unwrap();
        registry
            .register(Box::new(publish_rejected_total.clone()))
            .unwrap();
        registry
            .register(Box::new(untranslatable_total.clone()))
            .unwrap();
        registry
            .register(Box::new(backpressure_total.clone()))
            .unwrap();
        registry
            .register(Box::new(notifications_dropped_total.clone()))
            .unwrap();
        registry
            .register(Box::new(reconnects_total.clone()))
            .unwrap();
        registry
            .register(Box::new(publish_latency.clone()))
            .unwrap();

        Metrics {
            registry,
            sessions_active,
            session_status,
            events_received_total,
            messages_published_total,
            publish_rejected_total,
            untranslatable_total,
            backpressure_total,
            notifications_dropped_total,
            reconnects_total,
            publish_latency,
        }
    }

    // Session helpers

    pub fn session_started(&self) {
        self.sessions_active.inc();
    }

    /// Drop the per-transfer series of a finished session
    pub fn session_ended(&self, transfer: &str) {
        self.sessions_active.dec();
        let _ = self.session_status.remove_label_values(&[transfer]);
        for counter in [
            &self.events_received_total,
            &self.messages_published_total,
            &self.publish_rejected_total,
            &self.untranslatable_total,
            &self.backpressure_total,
            &self.notifications_dropped_total,
        ] {
            let _ = counter.remove_label_values(&[transfer]);
        }
        for leg in [Leg::Source, Leg::Sink] {
            let _ = self
                .reconnects_total
                .remove_label_values(&[transfer, leg.as_str()]);
        }
    }

    pub fn status_changed(&self, transfer: &str, status: Status) {
        self.session_status
            .with_label_values(&[transfer])
            .set(status.code());
    }

    // Data flow helpers

    pub fn event_received(&self, transfer: &str) {
        self.events_received_total
            .with_label_values(&[transfer])
            .inc();
    }

    pub fn message_published(&self, transfer: &str, latency: Duration) {
        self.messages_published_total
            .with_label_values(&[transfer])
            .inc();
        self.publish_latency.observe(latency.as_secs_f64());
    }

    pub fn publish_rejected(&self, transfer: &str) {
        self.publish_rejected_total
            .with_label_values(&[transfer])
            .inc();
    }

    pub fn untranslatable(&self, transfer: &str) {
        self.untranslatable_total
            .with_label_values(&[transfer])
            .inc();
    }

    pub fn backpressure(&self, transfer: &str) {
        self.backpressure_total
            .with_label_values(&[transfer])
            .inc();
    }

    pub fn notifications_dropped(&self, transfer: &str, count: u64) {
        self.notifications_dropped_total
            .with_label_values(&[transfer])
            .inc_by(count);
    }

    pub fn reconnect(&self, transfer: &str, leg: Leg) {
        self.reconnects_total
            .with_label_values(&[transfer, leg.as_str()])
            .inc();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_transfer_series_are_removed_on_session_end() {
        let metrics = Metrics::new();
        metrics.session_started();
        metrics.event_received("tp-1");
        metrics.reconnect("tp-1", Leg::Sink);
        metrics.notifications_dropped("tp-1", 3);
        metrics.status_changed("tp-1", Status::Degraded);

        assert_eq!(metrics.sessions_active.get(), 1);
        assert_eq!(
            metrics.events_received_total.with_label_values(&["tp-1"]).get(),
            1
        );
        assert_eq!(
            metrics
                .notifications_dropped_total
                .with_label_values(&["tp-1"])
                .get(),
            3
        );
        assert_eq!(
            metrics.session_status.with_label_values(&["tp-1"]).get(),
            Status::Degraded.code()
        );

        metrics.session_ended("tp-1");
        assert_eq!(metrics.sessions_active.get(), 0);
        let families = metrics.registry.gather();
        assert!(families
            .iter()
            .filter(|f| f.get_name() != "uabridge_sessions_active"
                && f.get_name() != "uabridge_publish_latency_seconds")
            .all(|f| f.get_metric().is_empty()));
    }
}
