//! Connector contract and shared behaviors
//!
//! Every provider integration implements [`CloudConnector`]; the retry
//! helper and error logging live here as free functions so connectors
//! depend on capabilities, not a concrete superclass.

use crate::{CloudProvider, ComplianceData, ComplianceFinding, ConnectorError, ConnectorResult};
use async_trait::async_trait;
use chrono::Utc;
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

/// Capability contract shared by all provider connectors.
///
/// Construction is provider-specific; everything after construction is
/// uniform: a cheap connectivity probe, two finding collectors, and a
/// snapshot assembler that joins them.
#[async_trait]
pub trait CloudConnector: Send + Sync {
    fn provider(&self) -> CloudProvider;

    fn environment_id(&self) -> &str;

    fn tenant_id(&self) -> Uuid;

    /// Cheapest possible vendor call that validates credentials and
    /// reachability. Expected failures (bad credentials, unreachable
    /// endpoint) are logged and surface as `false`, never as an error.
    async fn test_connection(&self) -> bool;

    /// Provider-native security-posture findings, normalized into the
    /// canonical shape. Runs under the retry helper; exhaustion
    /// propagates the last error to the caller.
    async fn get_security_findings(&self) -> ConnectorResult<Vec<ComplianceFinding>>;

    /// Provider-native configuration/policy-compliance findings, same
    /// contract as [`Self::get_security_findings`].
    async fn get_configuration_compliance(&self) -> ConnectorResult<Vec<ComplianceFinding>>;

    /// Opaque provider payload retained on the snapshot for audit.
    ///
    /// Reads the payload recorded by the two finding collectors; it
    /// never issues a vendor call of its own, so the audit record
    /// always describes the data the findings were normalized from.
    fn raw_snapshot(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    /// Collect one full snapshot: both finding collectors run
    /// concurrently and are joined. A one-sided failure is logged and
    /// absorbed as an empty side (partial data beats total failure);
    /// when both sides fail the call fails, so an empty snapshot is
    /// never mistaken for "fully compliant".
    async fn collect_compliance_data(&self) -> ConnectorResult<ComplianceData> {
        let provider = self.provider();
        let environment_id = self.environment_id().to_string();

        let (security, configuration) = tokio::join!(
            self.get_security_findings(),
            self.get_configuration_compliance()
        );

        let (security, configuration) = match (security, configuration) {
            (Err(sec_err), Err(cfg_err)) => {
                log_operation_error(provider, "get_security_findings", &sec_err);
                log_operation_error(provider, "get_configuration_compliance", &cfg_err);
                return Err(ConnectorError::CollectionFailed {
                    provider,
                    environment_id,
                });
            }
            (Err(sec_err), Ok(cfg)) => {
                log_operation_error(provider, "get_security_findings", &sec_err);
                (Vec::new(), cfg)
            }
            (Ok(sec), Err(cfg_err)) => {
                log_operation_error(provider, "get_configuration_compliance", &cfg_err);
                (sec, Vec::new())
            }
            (Ok(sec), Ok(cfg)) => (sec, cfg),
        };

        let mut findings = security;
        findings.extend(configuration);

        tracing::info!(
            provider = provider.as_str(),
            environment_id = %environment_id,
            findings = findings.len(),
            "compliance snapshot collected"
        );

        Ok(ComplianceData {
            id: ComplianceData::snapshot_id(provider, &environment_id),
            tenant_id: self.tenant_id(),
            environment_id,
            provider,
            collected_at: Utc::now(),
            raw_data: self.raw_snapshot(),
            findings,
        })
    }
}

// =============================================================================
// Retry with exponential backoff
// =============================================================================

/// Backoff policy for retried vendor calls
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Delay before the attempt after `attempt` (1-based):
    /// `base_delay * 2^(attempt-1)`
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Attempt `op` up to `policy.max_attempts` times with exponential
/// backoff between attempts. On exhaustion the last error is returned
/// to the caller, which decides whether to surface or swallow it.
pub async fn retry_with_backoff<T, E, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_attempts => {
                tracing::warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %err,
                    "operation failed, retrying after backoff"
                );
                tokio::time::sleep(policy.delay_after(attempt)).await;
                attempt += 1;
            }
            Err(err) => {
                tracing::warn!(
                    attempt,
                    error = %err,
                    "operation failed, retries exhausted"
                );
                return Err(err);
            }
        }
    }
}

/// Record one section of a connector's audit payload under `key`,
/// overwriting whatever a previous collection left there. Connectors
/// call this from their finding collectors with the raw data they just
/// fetched (or `Null` on a failed fetch), so [`CloudConnector::raw_snapshot`]
/// is a pure read and stays consistent with the findings of the same run.
pub(crate) fn record_raw_section<T: serde::Serialize>(
    slot: &parking_lot::RwLock<serde_json::Value>,
    key: &str,
    value: &T,
) {
    let mut raw = slot.write();
    if !raw.is_object() {
        *raw = serde_json::json!({});
    }
    raw[key] = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
}

/// Structured error logging applied before any fallback behavior, so
/// failures stay diagnosable even when swallowed.
pub fn log_operation_error(
    provider: CloudProvider,
    operation: &str,
    err: &dyn std::fmt::Display,
) {
    tracing::error!(
        provider = provider.as_str(),
        operation,
        error = %err,
        "cloud operation failed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FindingStatus, Severity};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    struct HalfBrokenConnector {
        security_ok: bool,
        configuration_ok: bool,
    }

    impl HalfBrokenConnector {
        fn finding(suffix: &str) -> ComplianceFinding {
            let now = Utc::now();
            ComplianceFinding {
                id: format!("aws-{suffix}"),
                provider: CloudProvider::Aws,
                severity: Severity::Low,
                status: FindingStatus::Pass,
                mapped_controls: vec!["SC-1".to_string()],
                resource_id: "r".to_string(),
                rule_name: "rule".to_string(),
                description: "d".to_string(),
                remediation: None,
                discovered_at: now,
                last_checked: now,
            }
        }
    }

    #[async_trait]
    impl CloudConnector for HalfBrokenConnector {
        fn provider(&self) -> CloudProvider {
            CloudProvider::Aws
        }

        fn environment_id(&self) -> &str {
            "env-test"
        }

        fn tenant_id(&self) -> Uuid {
            Uuid::nil()
        }

        async fn test_connection(&self) -> bool {
            true
        }

        async fn get_security_findings(&self) -> ConnectorResult<Vec<ComplianceFinding>> {
            if self.security_ok {
                Ok(vec![Self::finding("sec-1"), Self::finding("sec-2")])
            } else {
                Err(ConnectorError::Connectivity("security side down".into()))
            }
        }

        async fn get_configuration_compliance(&self) -> ConnectorResult<Vec<ComplianceFinding>> {
            if self.configuration_ok {
                Ok(vec![Self::finding("cfg-1")])
            } else {
                Err(ConnectorError::Connectivity("config side down".into()))
            }
        }
    }

    #[tokio::test]
    async fn test_collect_fails_when_both_sides_fail() {
        let connector = HalfBrokenConnector {
            security_ok: false,
            configuration_ok: false,
        };
        let err = connector.collect_compliance_data().await.unwrap_err();
        assert!(matches!(err, ConnectorError::CollectionFailed { .. }));
    }

    #[tokio::test]
    async fn test_collect_absorbs_one_sided_failure() {
        let connector = HalfBrokenConnector {
            security_ok: true,
            configuration_ok: false,
        };
        let snapshot = connector.collect_compliance_data().await.unwrap();
        // Partial data beats total failure: security findings survive
        assert_eq!(snapshot.findings.len(), 2);

        let connector = HalfBrokenConnector {
            security_ok: false,
            configuration_ok: true,
        };
        let snapshot = connector.collect_compliance_data().await.unwrap();
        assert_eq!(snapshot.findings.len(), 1);
    }

    #[test]
    fn test_record_raw_section_overwrites_per_run() {
        let slot = parking_lot::RwLock::new(serde_json::Value::Null);
        record_raw_section(&slot, "assessments", &vec!["a", "b"]);
        assert_eq!(slot.read()["assessments"], serde_json::json!(["a", "b"]));
        record_raw_section(&slot, "evaluations", &vec!["c"]);
        assert_eq!(slot.read()["evaluations"], serde_json::json!(["c"]));

        // A failed fetch on the next run nulls its section out instead
        // of leaving a stale payload behind
        record_raw_section(&slot, "assessments", &serde_json::Value::Null);
        assert!(slot.read()["assessments"].is_null());
        assert_eq!(slot.read()["evaluations"], serde_json::json!(["c"]));
    }

    #[tokio::test]
    async fn test_collect_orders_security_before_configuration() {
        let connector = HalfBrokenConnector {
            security_ok: true,
            configuration_ok: true,
        };
        let snapshot = connector.collect_compliance_data().await.unwrap();
        let ids: Vec<&str> = snapshot.findings.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["aws-sec-1", "aws-sec-2", "aws-cfg-1"]);
    }

    fn policy_ms(max_attempts: u32, base_ms: u64) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(base_ms))
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_two_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let start = Instant::now();

        let result: Result<u32, String> = retry_with_backoff(policy_ms(3, 20), move || {
            let calls = calls_clone.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(format!("transient failure {n}"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Waits approximate base_delay then 2x base_delay
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_retry_exhaustion_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result: Result<(), String> = retry_with_backoff(policy_ms(3, 1), move || {
            let calls = calls_clone.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Err(format!("failure {n}"))
            }
        })
        .await;

        assert_eq!(result.unwrap_err(), "failure 3");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_first_try_success_skips_backoff() {
        let start = Instant::now();
        let result: Result<&str, String> =
            retry_with_backoff(policy_ms(3, 500), || async { Ok("ok") }).await;
        assert_eq!(result.unwrap(), "ok");
        assert!(start.elapsed() < Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_delays_double() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_after(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_after(3), Duration::from_millis(4000));
    }
}
