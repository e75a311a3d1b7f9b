//! Severity-tag detector: emits when the parsed severity word matches a
//! configured rule (`error`, `critical`, `emergency` by default) with
//! `score = 0.6 + 0.1 * rank`.

use crate::policy::SeverityTagRule;
use crate::types::{AnomalyDetected, Domain};

use super::{base_anomaly, ValidatedRecord};

pub fn detect(record: &ValidatedRecord, rules: &[SeverityTagRule]) -> Option<AnomalyDetected> {
    let word = parsed_severity(record)?;
    let rule = rules.iter().find(|r| r.severity.eq_ignore_ascii_case(&word))?;
    let domain = Domain::parse(&rule.domain).unwrap_or(Domain::System);
    Some(base_anomaly(
        record,
        domain,
        &rule.anomaly_type,
        "severity_tag",
        rule.score(),
    ))
}

/// Severity word: the explicit hint wins, else a `severity` parsed field.
fn parsed_severity(record: &ValidatedRecord) -> Option<String> {
    if let Some(hint) = &record.severity_hint {
        if !hint.is_empty() {
            return Some(hint.to_lowercase());
        }
    }
    record
        .parsed_fields
        .get("severity")
        .and_then(|v| v.as_str())
        .map(str::to_lowercase)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Policy;
    use crate::types::TrackingId;
    use std::collections::BTreeMap;

    fn record(hint: Option<&str>) -> ValidatedRecord {
        ValidatedRecord {
            tracking_id: TrackingId::from_wire("t-1").unwrap(),
            synthetic: false,
            ts: "2026-03-01T12:00:00Z".parse().unwrap(),
            ship_id: "mv-aurora".to_string(),
            service: "nav".to_string(),
            severity_hint: hint.map(str::to_string),
            device_id: None,
            raw_message: "engine room alarm".to_string(),
            parsed_fields: BTreeMap::new(),
            evidence_ref: "log:mv-aurora:0:t-1".to_string(),
        }
    }

    #[test]
    fn test_score_follows_rank() {
        let rules = Policy::default().detect.severity_tags;

        let anomaly = detect(&record(Some("error")), &rules).unwrap();
        assert!((anomaly.score - 0.6).abs() < 1e-9);

        let anomaly = detect(&record(Some("critical")), &rules).unwrap();
        assert!((anomaly.score - 0.7).abs() < 1e-9);

        let anomaly = detect(&record(Some("emergency")), &rules).unwrap();
        assert!((anomaly.score - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_non_matching_severity_is_silent() {
        let rules = Policy::default().detect.severity_tags;
        assert!(detect(&record(Some("info")), &rules).is_none());
        assert!(detect(&record(None), &rules).is_none());
    }

    #[test]
    fn test_severity_from_parsed_fields() {
        let rules = Policy::default().detect.severity_tags;
        let mut rec = record(None);
        rec.parsed_fields
            .insert("severity".to_string(), serde_json::json!("CRITICAL"));

        let anomaly = detect(&rec, &rules).unwrap();
        assert_eq!(anomaly.anomaly_type, "log_critical");
        assert_eq!(anomaly.detector, "severity_tag");
    }
}
