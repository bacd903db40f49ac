//! Anomaly detection rules over the audit stream.
//!
//! Each rule inspects a trailing window ending at `now` and yields alert
//! candidates. Deduplication against existing alerts happens in the detector
//! service.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use crate::config::DetectorPolicy;
use crate::models::{
    action, AlertCandidate, AlertSeverity, AlertType, AuditCategory, AuditEvent, SYSTEM_ACTOR,
};

fn in_window(e: &AuditEvent, window_secs: i64, now: DateTime<Utc>) -> bool {
    e.occurred_at > now - Duration::seconds(window_secs) && e.occurred_at <= now
}

fn bounds<'a>(events: impl Iterator<Item = &'a AuditEvent>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    events.fold(None, |acc, e| match acc {
        None => Some((e.occurred_at, e.occurred_at)),
        Some((lo, hi)) => Some((lo.min(e.occurred_at), hi.max(e.occurred_at))),
    })
}

/// ≥ threshold `login_failed` events for one actor → BRUTE_FORCE / HIGH.
pub fn brute_force(
    events: &[AuditEvent],
    policy: &DetectorPolicy,
    now: DateTime<Utc>,
) -> Vec<AlertCandidate> {
    let mut by_actor: BTreeMap<(&str, &str), Vec<&AuditEvent>> = BTreeMap::new();
    for e in events.iter().filter(|e| {
        e.action.as_str() == action::LOGIN_FAILED
            && in_window(e, policy.brute_force_window_secs, now)
    }) {
        by_actor
            .entry((e.tenant_id.as_str(), e.actor_id.as_str()))
            .or_default()
            .push(e);
    }

    by_actor
        .into_iter()
        .filter(|(_, failures)| failures.len() >= policy.brute_force_threshold)
        .filter_map(|((tenant, actor), failures)| {
            let (first, last) = bounds(failures.iter().copied())?;
            let origins: BTreeSet<&str> =
                failures.iter().filter_map(|e| e.origin.as_deref()).collect();
            Some(AlertCandidate {
                alert_type: AlertType::BruteForce,
                severity: AlertSeverity::High,
                tenant_id: tenant.to_string(),
                actor_id: Some(actor.to_string()),
                evidence: json!({
                    "rule": "failed_authentication_burst",
                    "failed_attempts": failures.len(),
                    "threshold": policy.brute_force_threshold,
                    "window_secs": policy.brute_force_window_secs,
                    "origins": origins,
                    "event_ids": failures.iter().map(|e| e.id).collect::<Vec<_>>(),
                }),
                evidence_count: failures.len() as i64,
                first_occurrence: first,
                last_occurrence: last,
                window_secs: policy.brute_force_window_secs,
            })
        })
        .collect()
}

/// ≥ threshold distinct origins (or devices) for one actor → ANOMALY / MEDIUM.
pub fn origin_churn(
    events: &[AuditEvent],
    policy: &DetectorPolicy,
    now: DateTime<Utc>,
) -> Vec<AlertCandidate> {
    let mut by_actor: BTreeMap<(&str, &str), Vec<&AuditEvent>> = BTreeMap::new();
    for e in events.iter().filter(|e| {
        e.actor_id != SYSTEM_ACTOR
            && (e.origin.is_some() || e.device.is_some())
            && in_window(e, policy.origin_window_secs, now)
    }) {
        by_actor
            .entry((e.tenant_id.as_str(), e.actor_id.as_str()))
            .or_default()
            .push(e);
    }

    by_actor
        .into_iter()
        .filter_map(|((tenant, actor), seen)| {
            let origins: BTreeSet<&str> = seen.iter().filter_map(|e| e.origin.as_deref()).collect();
            let devices: BTreeSet<&str> = seen.iter().filter_map(|e| e.device.as_deref()).collect();
            let churn = origins.len().max(devices.len());
            if churn < policy.origin_threshold {
                return None;
            }
            let (first, last) = bounds(seen.iter().copied())?;
            Some(AlertCandidate {
                alert_type: AlertType::Anomaly,
                severity: AlertSeverity::Medium,
                tenant_id: tenant.to_string(),
                actor_id: Some(actor.to_string()),
                evidence: json!({
                    "rule": "origin_device_churn",
                    "distinct_origins": origins,
                    "distinct_devices": devices,
                    "threshold": policy.origin_threshold,
                    "window_secs": policy.origin_window_secs,
                }),
                evidence_count: churn as i64,
                first_occurrence: first,
                last_occurrence: last,
                window_secs: policy.origin_window_secs,
            })
        })
        .collect()
}

/// Outcome of one job attempt as recorded in the audit stream.
fn attempt_outcome(e: &AuditEvent) -> Option<bool> {
    if e.category != AuditCategory::Job {
        return None;
    }
    let transition = e.metadata.as_ref()?.get("transition")?.as_str()?;
    match transition {
        "complete" => Some(true),
        "fail" | "retry" | "reclaim" => Some(false),
        _ => None,
    }
}

/// Pipeline-wide failure rate above threshold → PROCESSING_FAILURE_RATE / HIGH.
///
/// Every finished attempt counts: completions are successes; failures,
/// retries and reclaimed leases are failures. Cancellations are ignored.
pub fn failure_rate(
    events: &[AuditEvent],
    policy: &DetectorPolicy,
    now: DateTime<Utc>,
) -> Vec<AlertCandidate> {
    let attempts: Vec<(&AuditEvent, bool)> = events
        .iter()
        .filter(|e| in_window(e, policy.failure_rate_window_secs, now))
        .filter_map(|e| attempt_outcome(e).map(|ok| (e, ok)))
        .collect();

    if attempts.len() < policy.failure_rate_min_samples {
        return Vec::new();
    }
    let failures = attempts.iter().filter(|(_, ok)| !ok).count();
    let rate = failures as f64 / attempts.len() as f64;
    if rate <= policy.failure_rate_threshold {
        return Vec::new();
    }

    let mut per_tenant: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
    for (e, ok) in &attempts {
        let slot = per_tenant.entry(e.tenant_id.as_str()).or_default();
        if *ok {
            slot.0 += 1;
        } else {
            slot.1 += 1;
        }
    }
    let breakdown: BTreeMap<&str, serde_json::Value> = per_tenant
        .into_iter()
        .map(|(t, (ok, failed))| (t, json!({"succeeded": ok, "failed": failed})))
        .collect();

    let Some((first, last)) = bounds(attempts.iter().filter(|(_, ok)| !ok).map(|(e, _)| *e))
    else {
        return Vec::new();
    };

    vec![AlertCandidate {
        alert_type: AlertType::ProcessingFailureRate,
        severity: AlertSeverity::High,
        tenant_id: SYSTEM_ACTOR.to_string(),
        actor_id: None,
        evidence: json!({
            "rule": "pipeline_failure_rate",
            "attempts": attempts.len(),
            "failures": failures,
            "failure_rate": rate,
            "threshold": policy.failure_rate_threshold,
            "window_secs": policy.failure_rate_window_secs,
            "tenants": breakdown,
        }),
        evidence_count: failures as i64,
        first_occurrence: first,
        last_occurrence: last,
        window_secs: policy.failure_rate_window_secs,
    }]
}

/// Run every rule.
pub fn evaluate_all(
    events: &[AuditEvent],
    policy: &DetectorPolicy,
    now: DateTime<Utc>,
) -> Vec<AlertCandidate> {
    let mut out = brute_force(events, policy, now);
    out.extend(origin_churn(events, policy, now));
    out.extend(failure_rate(events, policy, now));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{entity, AuditAction, NewAuditEvent};
    use uuid::Uuid;

    fn login_failed(actor: &str, origin: &str, at: DateTime<Utc>, seq: i64) -> AuditEvent {
        NewAuditEvent::new(
            "acme",
            actor,
            entity::AUTH,
            actor,
            AuditAction::custom(action::LOGIN_FAILED),
            AuditCategory::Authentication,
        )
        .with_origin(Some(origin.to_string()))
        .into_event(Uuid::now_v7(), seq, at)
    }

    fn job_attempt(transition: &str, at: DateTime<Utc>, seq: i64) -> AuditEvent {
        NewAuditEvent::new(
            "acme",
            "w1",
            entity::JOB,
            "j",
            AuditAction::Update,
            AuditCategory::Job,
        )
        .with_metadata(json!({ "transition": transition }))
        .into_event(Uuid::now_v7(), seq, at)
    }

    #[test]
    fn test_brute_force_threshold() {
        let now = Utc::now();
        let policy = DetectorPolicy::default();
        let events: Vec<_> = (0..4)
            .map(|i| login_failed("mallory", "10.0.0.1", now - Duration::minutes(i), i))
            .collect();
        assert!(brute_force(&events, &policy, now).is_empty());

        let events: Vec<_> = (0..6)
            .map(|i| login_failed("mallory", "10.0.0.1", now - Duration::minutes(i), i))
            .collect();
        let alerts = brute_force(&events, &policy, now);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].evidence_count, 6);
        assert_eq!(alerts[0].severity, AlertSeverity::High);
        assert_eq!(alerts[0].last_occurrence, now);
    }

    #[test]
    fn test_brute_force_ignores_old_failures() {
        let now = Utc::now();
        let policy = DetectorPolicy::default();
        let events: Vec<_> = (0..6)
            .map(|i| login_failed("mallory", "10.0.0.1", now - Duration::minutes(20 + i), i))
            .collect();
        assert!(brute_force(&events, &policy, now).is_empty());
    }

    #[test]
    fn test_origin_churn() {
        let now = Utc::now();
        let policy = DetectorPolicy::default();
        let events: Vec<_> = ["1.1.1.1", "2.2.2.2", "3.3.3.3"]
            .iter()
            .enumerate()
            .map(|(i, o)| login_failed("alice", o, now - Duration::minutes(i as i64 * 10), i as i64))
            .collect();
        let alerts = origin_churn(&events, &policy, now);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::Anomaly);
        assert_eq!(alerts[0].severity, AlertSeverity::Medium);
        assert_eq!(alerts[0].evidence_count, 3);
    }

    #[test]
    fn test_failure_rate_requires_samples() {
        let now = Utc::now();
        let policy = DetectorPolicy::default();
        let few: Vec<_> = (0..5).map(|i| job_attempt("fail", now, i)).collect();
        assert!(failure_rate(&few, &policy, now).is_empty());
    }

    #[test]
    fn test_failure_rate_alert_is_operational() {
        let now = Utc::now();
        let policy = DetectorPolicy::default();
        let mut events: Vec<_> = (0..7).map(|i| job_attempt("retry", now, i)).collect();
        events.extend((7..10).map(|i| job_attempt("complete", now, i)));
        events.push(job_attempt("cancel", now, 11));
        let alerts = failure_rate(&events, &policy, now);
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].alert_type.is_operational());
        assert_eq!(alerts[0].evidence["attempts"], 10);
        assert_eq!(alerts[0].evidence["failures"], 7);
    }

    #[test]
    fn test_failure_rate_below_threshold() {
        let now = Utc::now();
        let policy = DetectorPolicy::default();
        let mut events: Vec<_> = (0..5).map(|i| job_attempt("fail", now, i)).collect();
        events.extend((5..10).map(|i| job_attempt("complete", now, i)));
        assert!(failure_rate(&events, &policy, now).is_empty());
    }
}
