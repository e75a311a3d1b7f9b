//! Rule-based insight fallback.
//!
//! When the LLM or vector store fails, the incident still gets a usable
//! narrative: a parameterized root-cause sentence keyed on
//! `(incident_type, severity)` and the ordered remediation runbook from the
//! policy. Fallback insights always carry low confidence so the console can
//! flag them.

use crate::policy::Policy;
use crate::types::{AiInsight, IncidentCreated, Severity};

pub fn fallback_insight(incident: &IncidentCreated, policy: &Policy) -> AiInsight {
    AiInsight {
        root_cause: root_cause_sentence(incident),
        remediation_steps: policy.remediate.steps_for(&incident.incident_type),
        similar_incidents: Vec::new(),
    }
}

fn root_cause_sentence(incident: &IncidentCreated) -> String {
    let members = incident.member_anomaly_ids.len();
    let urgency = match incident.severity {
        Severity::Crit => "requires immediate attention",
        Severity::High => "needs investigation this watch",
        Severity::Med => "should be reviewed during routine checks",
        Severity::Low => "is informational",
    };

    let cause = match incident.incident_type.as_str() {
        "cpu_pressure" => "sustained compute load on the affected host, commonly a runaway process or an undersized workload placement",
        "oom" => "memory exhaustion on the affected host, typically a leaking or misconfigured service",
        "disk_failure" => "storage degradation on the affected volume, consistent with a failing disk or a full filesystem",
        "link_flap" => "an unstable uplink, usually antenna blockage, weather fade or a failing modem",
        "gps_signal_loss" => "loss of GNSS reception, usually antenna obstruction or receiver fault",
        "auth_failure" => "repeated authentication failures, consistent with credential misuse or a brute-force attempt",
        _ => "a recurring abnormal condition in the affected service",
    };

    format!(
        "{count} correlated {severity} anomalies on {ship} point to {cause}; this incident {urgency}.",
        count = members,
        severity = incident.severity,
        ship = incident.ship_id,
        cause = cause,
        urgency = urgency,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IncidentStatus, ScopeEntry, SuppressKey, TrackingId};

    fn incident(incident_type: &str, severity: Severity) -> IncidentCreated {
        IncidentCreated {
            incident_id: uuid::Uuid::new_v4(),
            created_at: "2026-03-01T12:00:00Z".parse().unwrap(),
            ship_id: "mv-aurora".to_string(),
            incident_type: incident_type.to_string(),
            severity,
            scope: vec![ScopeEntry {
                device_id: None,
                service: "cpu-monitor".to_string(),
            }],
            correlation_keys: Vec::new(),
            suppress_key: SuppressKey::derive(
                "mv-aurora", "system", "cpu-monitor", incident_type, None, severity.as_str(),
            ),
            member_anomaly_ids: vec![
                TrackingId::from_wire("a-1").unwrap(),
                TrackingId::from_wire("a-2").unwrap(),
                TrackingId::from_wire("a-3").unwrap(),
            ],
            evidence_refs: Vec::new(),
            timeline: Vec::new(),
            status: IncidentStatus::Open,
            tracking_id: TrackingId::from_wire("a-3").unwrap(),
            extensions: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_known_type_gets_specific_narrative() {
        let policy = Policy::default();
        let insight = fallback_insight(&incident("cpu_pressure", Severity::High), &policy);

        assert!(insight.root_cause.contains("mv-aurora"));
        assert!(insight.root_cause.contains("compute load"));
        assert!(insight.root_cause.contains("high"));
        assert_eq!(insight.remediation_steps, policy.remediate.steps_for("cpu_pressure"));
        assert!(insight.similar_incidents.is_empty());
    }

    #[test]
    fn test_unknown_type_uses_generic_narrative_and_default_runbook() {
        let policy = Policy::default();
        let insight = fallback_insight(&incident("ballast_pump_stall", Severity::Crit), &policy);

        assert!(insight.root_cause.contains("recurring abnormal condition"));
        assert!(insight.root_cause.contains("immediate attention"));
        assert_eq!(insight.remediation_steps, policy.remediate.steps_for("default"));
    }

    #[test]
    fn test_severity_changes_urgency_clause() {
        let policy = Policy::default();
        let crit = fallback_insight(&incident("oom", Severity::Crit), &policy);
        let low = fallback_insight(&incident("oom", Severity::Low), &policy);
        assert_ne!(crit.root_cause, low.root_cause);
    }
}
