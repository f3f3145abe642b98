//! GCP integration
//!
//! Security findings come from Security Command Center, keyed by
//! category and state; configuration compliance comes from
//! asset-inventory policy violations keyed by asset type.

use crate::connector::{
    log_operation_error, record_raw_section, retry_with_backoff, CloudConnector, RetryPolicy,
};
use crate::mappings::ControlMap;
use crate::{
    CloudConnectorConfig, CloudCredentials, CloudProvider, ComplianceFinding, ConnectorError,
    ConnectorResult, FindingStatus, Severity,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Remediation text when no per-category entry exists
const DEFAULT_REMEDIATION: &str =
    "Review the finding in Security Command Center and apply the recommended fix";

/// Security Command Center finding
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SccFinding {
    pub name: String,
    pub category: String,
    /// `ACTIVE` / `INACTIVE` / `MUTED`
    pub state: String,
    pub severity: String,
    pub resource_name: String,
    pub description: Option<String>,
}

/// Asset-inventory policy violation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssetViolation {
    pub asset_type: String,
    pub asset_name: String,
    pub policy: String,
    pub details: String,
}

/// GCP compliance connector
pub struct GcpConnector {
    environment_id: String,
    tenant_id: Uuid,
    project_id: String,
    /// Key file path or inline service-account JSON
    service_account_key: String,
    control_map: ControlMap,
    retry: RetryPolicy,
    http: reqwest::Client,
    /// Raw payload of the latest collection, kept for the audit snapshot
    last_raw: RwLock<serde_json::Value>,
}

impl GcpConnector {
    pub fn new(config: &CloudConnectorConfig) -> ConnectorResult<Self> {
        let CloudCredentials::Gcp {
            project_id,
            service_account_key,
        } = &config.credentials
        else {
            return Err(ConnectorError::Configuration(format!(
                "GCP connector constructed with {} credentials",
                config.credentials.provider()
            )));
        };
        if project_id.is_empty() {
            return Err(ConnectorError::Configuration(
                "GCP project_id is required".to_string(),
            ));
        }

        Ok(Self {
            environment_id: config.environment.id.clone(),
            tenant_id: config.tenant_id,
            project_id: project_id.clone(),
            service_account_key: service_account_key.clone(),
            control_map: ControlMap::gcp_defaults(),
            retry: RetryPolicy::default(),
            http: reqwest::Client::new(),
            last_raw: RwLock::new(serde_json::Value::Null),
        })
    }

    pub fn with_control_map(mut self, map: ControlMap) -> Self {
        self.control_map = map;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    async fn probe_project(&self) -> ConnectorResult<String> {
        // In production: Cloud Resource Manager projects.get with a
        // token minted from the service-account key
        Ok(self.project_id.clone())
    }

    async fn fetch_scc_findings(&self) -> ConnectorResult<Vec<SccFinding>> {
        // In production: SCC organizations.sources.findings.list scoped
        // to the project
        Ok(vec![
            SccFinding {
                name: format!("projects/{}/findings/f-001", self.project_id),
                category: "PUBLIC_BUCKET_ACL".to_string(),
                state: "ACTIVE".to_string(),
                severity: "HIGH".to_string(),
                resource_name: format!("//storage.googleapis.com/{}-assets", self.project_id),
                description: Some("Bucket grants access to allUsers".to_string()),
            },
            SccFinding {
                name: format!("projects/{}/findings/f-002", self.project_id),
                category: "OPEN_FIREWALL".to_string(),
                state: "INACTIVE".to_string(),
                severity: "MEDIUM".to_string(),
                resource_name: format!(
                    "//compute.googleapis.com/projects/{}/global/firewalls/default-allow",
                    self.project_id
                ),
                description: None,
            },
            SccFinding {
                name: format!("projects/{}/findings/f-003", self.project_id),
                category: "MFA_NOT_ENFORCED".to_string(),
                state: "MUTED".to_string(),
                severity: "LOW".to_string(),
                resource_name: format!("//cloudresourcemanager.googleapis.com/projects/{}", self.project_id),
                description: None,
            },
        ])
    }

    async fn fetch_asset_violations(&self) -> ConnectorResult<Vec<AssetViolation>> {
        // In production: Cloud Asset Inventory analyzeIamPolicy /
        // searchAllResources with policy evaluation
        Ok(vec![
            AssetViolation {
                asset_type: "storage.googleapis.com/Bucket".to_string(),
                asset_name: format!("{}-logs", self.project_id),
                policy: "uniform-bucket-level-access".to_string(),
                details: "Bucket uses legacy ACLs instead of uniform access".to_string(),
            },
            AssetViolation {
                asset_type: "compute.googleapis.com/Instance".to_string(),
                asset_name: "vm-legacy-01".to_string(),
                policy: "approved-machine-images".to_string(),
                details: "Instance booted from an unapproved image".to_string(),
            },
        ])
    }

    fn normalize_scc_finding(&self, finding: &SccFinding) -> ComplianceFinding {
        let status = match finding.state.to_ascii_uppercase().as_str() {
            "ACTIVE" => FindingStatus::Fail,
            "INACTIVE" => FindingStatus::Pass,
            "MUTED" => FindingStatus::NotApplicable,
            _ => FindingStatus::Manual,
        };
        let severity = match finding.severity.to_ascii_uppercase().as_str() {
            "CRITICAL" => Severity::Critical,
            "HIGH" => Severity::High,
            "LOW" => Severity::Low,
            _ => Severity::Medium,
        };
        let now = Utc::now();

        ComplianceFinding {
            id: format!("gcp-{}", finding.name.replace('/', "-")),
            provider: CloudProvider::Gcp,
            severity,
            status,
            mapped_controls: self.control_map.controls_for(&finding.category),
            resource_id: finding.resource_name.clone(),
            rule_name: finding.category.clone(),
            description: finding
                .description
                .clone()
                .unwrap_or_else(|| finding.category.clone()),
            remediation: Some(
                self.control_map
                    .remediation_for(&finding.category)
                    .unwrap_or_else(|| DEFAULT_REMEDIATION.to_string()),
            ),
            discovered_at: now,
            last_checked: now,
        }
    }

    fn normalize_asset_violation(&self, violation: &AssetViolation) -> ComplianceFinding {
        let now = Utc::now();
        ComplianceFinding {
            id: format!("gcp-asset-{}-{}", violation.policy, violation.asset_name),
            provider: CloudProvider::Gcp,
            severity: Severity::Medium,
            status: FindingStatus::Fail,
            mapped_controls: self.control_map.controls_for(&violation.asset_type),
            resource_id: violation.asset_name.clone(),
            rule_name: violation.policy.clone(),
            description: violation.details.clone(),
            remediation: Some(
                self.control_map
                    .remediation_for(&violation.asset_type)
                    .unwrap_or_else(|| DEFAULT_REMEDIATION.to_string()),
            ),
            discovered_at: now,
            last_checked: now,
        }
    }
}

#[async_trait]
impl CloudConnector for GcpConnector {
    fn provider(&self) -> CloudProvider {
        CloudProvider::Gcp
    }

    fn environment_id(&self) -> &str {
        &self.environment_id
    }

    fn tenant_id(&self) -> Uuid {
        self.tenant_id
    }

    async fn test_connection(&self) -> bool {
        match self.probe_project().await {
            Ok(project) => {
                tracing::debug!(project = %project, "GCP connectivity verified");
                true
            }
            Err(err) => {
                log_operation_error(CloudProvider::Gcp, "test_connection", &err);
                false
            }
        }
    }

    async fn get_security_findings(&self) -> ConnectorResult<Vec<ComplianceFinding>> {
        let findings = match retry_with_backoff(self.retry, || self.fetch_scc_findings()).await {
            Ok(findings) => findings,
            Err(err) => {
                record_raw_section(&self.last_raw, "scc_findings", &serde_json::Value::Null);
                log_operation_error(CloudProvider::Gcp, "get_security_findings", &err);
                return Err(err);
            }
        };
        record_raw_section(&self.last_raw, "scc_findings", &findings);
        Ok(findings
            .iter()
            .map(|f| self.normalize_scc_finding(f))
            .collect())
    }

    async fn get_configuration_compliance(&self) -> ConnectorResult<Vec<ComplianceFinding>> {
        let violations =
            match retry_with_backoff(self.retry, || self.fetch_asset_violations()).await {
                Ok(violations) => violations,
                Err(err) => {
                    record_raw_section(
                        &self.last_raw,
                        "asset_violations",
                        &serde_json::Value::Null,
                    );
                    log_operation_error(CloudProvider::Gcp, "get_configuration_compliance", &err);
                    return Err(err);
                }
            };
        record_raw_section(&self.last_raw, "asset_violations", &violations);
        Ok(violations
            .iter()
            .map(|v| self.normalize_asset_violation(v))
            .collect())
    }

    fn raw_snapshot(&self) -> serde_json::Value {
        self.last_raw.read().clone()
    }
}
