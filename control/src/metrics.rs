//! Controller metrics.

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

lazy_static! {
    /// Registry for all controller metrics.
    pub static ref CONTROLLER_METRICS_REGISTRY: Registry = Registry::new();

    static ref RECONCILIATIONS_TOTAL: IntCounterVec = {
        let counter = IntCounterVec::new(
            Opts::new(
                "reconciliations_total",
                "Reconciliation passes by resource kind and outcome",
            ),
            &["resource", "result"],
        )
        .expect("metric can be created");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("collector can be registered");
        counter
    };

    static ref CONFIG_WRITES_TOTAL: IntCounterVec = {
        let counter = IntCounterVec::new(
            Opts::new("config_writes_total", "Config document writes by outcome"),
            &["result"],
        )
        .expect("metric can be created");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("collector can be registered");
        counter
    };

    static ref ACTIVE_VIRTUAL_SERVERS: IntGauge = {
        let gauge = IntGauge::new(
            "active_virtual_servers",
            "Virtual servers present in the last emitted document",
        )
        .expect("metric can be created");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(gauge.clone()))
            .expect("collector can be registered");
        gauge
    };
}

pub fn record_reconciliation(resource: &str, changed: bool) {
    let result = if changed { "changed" } else { "unchanged" };
    RECONCILIATIONS_TOTAL
        .with_label_values(&[resource, result])
        .inc();
}

pub fn record_config_write(result: &str, active: usize) {
    CONFIG_WRITES_TOTAL.with_label_values(&[result]).inc();
    ACTIVE_VIRTUAL_SERVERS.set(active as i64);
}

/// Renders all controller metrics in Prometheus exposition format.
pub fn gather_controller_metrics() -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&CONTROLLER_METRICS_REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_gatherable() {
        record_reconciliation("configmap", true);
        record_reconciliation("service", false);
        record_config_write("success", 3);

        let metrics = gather_controller_metrics().expect("should gather metrics");
        assert!(metrics.contains("reconciliations_total"));
        assert!(metrics.contains("config_writes_total"));
        assert!(metrics.contains("active_virtual_servers"));
    }
}
