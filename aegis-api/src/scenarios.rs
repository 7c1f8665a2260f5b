//! Canned telemetry batches for the demo-scenario trigger endpoint.

use std::collections::BTreeMap;

use chrono::Utc;
use uuid::Uuid;

use aegis_agents::TelemetrySignal;
use aegis_events::Severity;

fn signal(
    source: &str,
    hint: Severity,
    metrics: &[(&str, f64)],
    tags: &[(&str, &str)],
) -> TelemetrySignal {
    TelemetrySignal {
        signal_id: format!("demo-{}", Uuid::new_v4()),
        timestamp: Utc::now(),
        source: source.to_string(),
        severity_hint: Some(hint),
        metrics: metrics.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        tags: tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>(),
    }
}

/// Telemetry batch for a named demo scenario, or `None` for an unknown id.
pub fn demo_batch(scenario_id: &str) -> Option<Vec<TelemetrySignal>> {
    match scenario_id {
        "database-cascade" => Some(vec![signal(
            "db-proxy",
            Severity::High,
            &[
                ("connection_pool_util", 1.0),
                ("error_rate", 0.47),
                ("p99_latency_ms", 8500.0),
            ],
            &[("component", "db-primary")],
        )]),
        "latency-spike" => Some(vec![signal(
            "api-gateway",
            Severity::Medium,
            &[("p99_latency_ms", 2600.0), ("error_rate", 0.08)],
            &[("component", "checkout")],
        )]),
        "disk-pressure" => Some(vec![signal(
            "storage-agent",
            Severity::High,
            &[("disk_util", 0.93), ("error_rate", 0.12)],
            &[("component", "storage-volume")],
        )]),
        _ => None,
    }
}
