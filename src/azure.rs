//! Azure integration
//!
//! Security findings come from Defender for Cloud security assessments;
//! configuration compliance is a required-tag policy check over the
//! subscription's resource groups.

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
use std::collections::HashMap;
use uuid::Uuid;

/// Tags every resource group must carry
const REQUIRED_TAGS: &[&str] = &["environment", "owner", "cost-center"];

/// Defender for Cloud assessment status
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AzureAssessmentStatus {
    pub code: String,
    pub cause: Option<String>,
    pub description: Option<String>,
}

/// Defender for Cloud security assessment
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AzureAssessment {
    pub id: String,
    pub display_name: String,
    pub status: AzureAssessmentStatus,
    pub severity: String,
    pub resource_id: String,
}

/// Resource group with its tag set
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AzureResourceGroup {
    pub name: String,
    pub location: String,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

/// Azure compliance connector.
///
/// Constructed with a subscription id and an identity chain; no static
/// secret is stored when a managed identity resolves the chain.
pub struct AzureConnector {
    environment_id: String,
    tenant_id: Uuid,
    subscription_id: String,
    directory_tenant: String,
    client_id: String,
    client_secret: Option<String>,
    control_map: ControlMap,
    retry: RetryPolicy,
    http: reqwest::Client,
    /// Raw payload of the latest collection, kept for the audit snapshot
    last_raw: RwLock<serde_json::Value>,
}

impl AzureConnector {
    pub fn new(config: &CloudConnectorConfig) -> ConnectorResult<Self> {
        let CloudCredentials::Azure {
            subscription_id,
            tenant_id: directory_tenant,
            client_id,
            client_secret,
        } = &config.credentials
        else {
            return Err(ConnectorError::Configuration(format!(
                "Azure connector constructed with {} credentials",
                config.credentials.provider()
            )));
        };
        if subscription_id.is_empty() {
            return Err(ConnectorError::Configuration(
                "Azure subscription_id is required".to_string(),
            ));
        }

        Ok(Self {
            environment_id: config.environment.id.clone(),
            tenant_id: config.tenant_id,
            subscription_id: subscription_id.clone(),
            directory_tenant: directory_tenant.clone(),
            client_id: client_id.clone(),
            client_secret: client_secret.clone(),
            control_map: ControlMap::azure_defaults(),
            retry: RetryPolicy::default(),
            http: reqwest::Client::new(),
            last_raw: RwLock::new(serde_json::Value::Null),
        })
    }

    /// Replace the built-in control table with an operator-supplied one
    pub fn with_control_map(mut self, map: ControlMap) -> Self {
        self.control_map = map;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// List resource groups (one page), the cheapest reachability probe
    async fn fetch_resource_groups(&self) -> ConnectorResult<Vec<AzureResourceGroup>> {
        // In production: GET https://management.azure.com/subscriptions/
        // {subscription_id}/resourcegroups?api-version=2021-04-01 with a
        // token from the identity chain, via self.http
        Ok(vec![
            AzureResourceGroup {
                name: "rg-production".to_string(),
                location: "eastus".to_string(),
                tags: REQUIRED_TAGS
                    .iter()
                    .map(|t| (t.to_string(), "set".to_string()))
                    .collect(),
            },
            AzureResourceGroup {
                name: "rg-sandbox".to_string(),
                location: "westeurope".to_string(),
                tags: HashMap::from([("environment".to_string(), "sandbox".to_string())]),
            },
        ])
    }

    async fn fetch_assessments(&self) -> ConnectorResult<Vec<AzureAssessment>> {
        // In production: GET .../providers/Microsoft.Security/assessments
        Ok(vec![
            AzureAssessment {
                id: "8e2b96ff-3de2-fe1e-d87d-5161a8c0c802".to_string(),
                display_name: "MFA should be enabled on accounts with owner permissions"
                    .to_string(),
                status: AzureAssessmentStatus {
                    code: "Unhealthy".to_string(),
                    cause: None,
                    description: Some("3 accounts with owner permissions lack MFA".to_string()),
                },
                severity: "High".to_string(),
                resource_id: format!("/subscriptions/{}", self.subscription_id),
            },
            AzureAssessment {
                id: "d57a4221-a804-52ca-3dea-768284f06bb7".to_string(),
                display_name: "Disk encryption should be applied on virtual machines".to_string(),
                status: AzureAssessmentStatus {
                    code: "Healthy".to_string(),
                    cause: None,
                    description: None,
                },
                severity: "Medium".to_string(),
                resource_id: format!(
                    "/subscriptions/{}/resourceGroups/rg-production",
                    self.subscription_id
                ),
            },
            AzureAssessment {
                id: "94208a8b-16e8-4e5b-a1c2-f1d2de4e302f".to_string(),
                display_name: "Auditing on SQL server should be enabled".to_string(),
                status: AzureAssessmentStatus {
                    code: "NotApplicable".to_string(),
                    cause: Some("No SQL servers in subscription".to_string()),
                    description: None,
                },
                severity: "Low".to_string(),
                resource_id: format!("/subscriptions/{}", self.subscription_id),
            },
        ])
    }

    fn normalize_assessment(&self, assessment: &AzureAssessment) -> ComplianceFinding {
        let status = match assessment.status.code.to_ascii_lowercase().as_str() {
            "healthy" => FindingStatus::Pass,
            "unhealthy" => FindingStatus::Fail,
            "notapplicable" => FindingStatus::NotApplicable,
            _ => FindingStatus::Manual,
        };
        let severity = match assessment.severity.to_ascii_lowercase().as_str() {
            "critical" => Severity::Critical,
            "high" => Severity::High,
            "low" => Severity::Low,
            _ => Severity::Medium,
        };
        let now = Utc::now();

        ComplianceFinding {
            id: format!("azure-{}", assessment.id),
            provider: CloudProvider::Azure,
            severity,
            status,
            mapped_controls: self.control_map.controls_for(&assessment.display_name),
            resource_id: assessment.resource_id.clone(),
            rule_name: assessment.display_name.clone(),
            description: assessment
                .status
                .description
                .clone()
                .unwrap_or_else(|| assessment.display_name.clone()),
            remediation: self.control_map.remediation_for(&assessment.display_name),
            discovered_at: now,
            last_checked: now,
        }
    }

    fn tag_policy_finding(
        &self,
        group: &AzureResourceGroup,
        missing: &[&str],
    ) -> ComplianceFinding {
        let now = Utc::now();
        ComplianceFinding {
            id: format!("azure-tags-{}", group.name),
            provider: CloudProvider::Azure,
            severity: Severity::Medium,
            status: FindingStatus::Fail,
            mapped_controls: self.control_map.controls_for("required-tags"),
            resource_id: group.name.clone(),
            rule_name: "required-tags".to_string(),
            description: format!(
                "Resource group {} is missing required tags: {}",
                group.name,
                missing.join(", ")
            ),
            remediation: self.control_map.remediation_for("required-tags"),
            discovered_at: now,
            last_checked: now,
        }
    }
}

#[async_trait]
impl CloudConnector for AzureConnector {
    fn provider(&self) -> CloudProvider {
        CloudProvider::Azure
    }

    fn environment_id(&self) -> &str {
        &self.environment_id
    }

    fn tenant_id(&self) -> Uuid {
        self.tenant_id
    }

    async fn test_connection(&self) -> bool {
        match self.fetch_resource_groups().await {
            Ok(groups) => {
                tracing::debug!(
                    subscription = %self.subscription_id,
                    resource_groups = groups.len(),
                    "Azure connectivity verified"
                );
                true
            }
            Err(err) => {
                log_operation_error(CloudProvider::Azure, "test_connection", &err);
                false
            }
        }
    }

    async fn get_security_findings(&self) -> ConnectorResult<Vec<ComplianceFinding>> {
        let assessments = match retry_with_backoff(self.retry, || self.fetch_assessments()).await {
            Ok(assessments) => assessments,
            Err(err) => {
                record_raw_section(&self.last_raw, "assessments", &serde_json::Value::Null);
                log_operation_error(CloudProvider::Azure, "get_security_findings", &err);
                return Err(err);
            }
        };
        record_raw_section(&self.last_raw, "assessments", &assessments);
        Ok(assessments
            .iter()
            .map(|a| self.normalize_assessment(a))
            .collect())
    }

    async fn get_configuration_compliance(&self) -> ConnectorResult<Vec<ComplianceFinding>> {
        let groups = match retry_with_backoff(self.retry, || self.fetch_resource_groups()).await {
            Ok(groups) => groups,
            Err(err) => {
                record_raw_section(&self.last_raw, "resource_groups", &serde_json::Value::Null);
                log_operation_error(CloudProvider::Azure, "get_configuration_compliance", &err);
                return Err(err);
            }
        };
        record_raw_section(&self.last_raw, "resource_groups", &groups);

        let mut findings = Vec::new();
        for group in &groups {
            let missing: Vec<&str> = REQUIRED_TAGS
                .iter()
                .copied()
                .filter(|tag| !group.tags.contains_key(*tag))
                .collect();
            if !missing.is_empty() {
                findings.push(self.tag_policy_finding(group, &missing));
            }
        }
        Ok(findings)
    }

    fn raw_snapshot(&self) -> serde_json::Value {
        self.last_raw.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CloudEnvironment;

    fn test_config() -> CloudConnectorConfig {
        CloudConnectorConfig {
            environment: CloudEnvironment {
                id: "env-azure-1".to_string(),
                provider: CloudProvider::Azure,
                name: "prod subscription".to_string(),
                region: "eastus".to_string(),
            },
            tenant_id: Uuid::new_v4(),
            credentials: CloudCredentials::Azure {
                subscription_id: "0000-1111".to_string(),
                tenant_id: "dir-tenant".to_string(),
                client_id: "client".to_string(),
                client_secret: None,
            },
        }
    }

    fn assessment(code: &str, severity: &str) -> AzureAssessment {
        AzureAssessment {
            id: "a1".to_string(),
            display_name: "MFA should be enabled on accounts with owner permissions".to_string(),
            status: AzureAssessmentStatus {
                code: code.to_string(),
                cause: None,
                description: None,
            },
            severity: severity.to_string(),
            resource_id: "/subscriptions/0000-1111".to_string(),
        }
    }

    #[test]
    fn test_rejects_mismatched_credentials() {
        let mut config = test_config();
        config.credentials = CloudCredentials::Gcp {
            project_id: "p".to_string(),
            service_account_key: "{}".to_string(),
        };
        assert!(AzureConnector::new(&config).is_err());
    }

    #[test]
    fn test_status_code_mapping() {
        let connector = AzureConnector::new(&test_config()).unwrap();
        let cases = [
            ("Healthy", FindingStatus::Pass),
            ("Unhealthy", FindingStatus::Fail),
            ("NotApplicable", FindingStatus::NotApplicable),
            ("Unknown", FindingStatus::Manual),
        ];
        for (code, expected) in cases {
            let finding = connector.normalize_assessment(&assessment(code, "High"));
            assert_eq!(finding.status, expected, "status code {code}");
            assert!(finding.id.starts_with("azure-"));
            assert!(!finding.mapped_controls.is_empty());
        }
    }

    #[test]
    fn test_unmapped_rule_gets_fallback_control() {
        let connector = AzureConnector::new(&test_config()).unwrap();
        let mut raw = assessment("Unhealthy", "High");
        raw.display_name = "Some brand new assessment".to_string();
        let finding = connector.normalize_assessment(&raw);
        assert_eq!(finding.mapped_controls, vec!["SC-1".to_string()]);
    }

    #[tokio::test]
    async fn test_tag_policy_flags_incomplete_groups() {
        let connector = AzureConnector::new(&test_config()).unwrap();
        let findings = connector.get_configuration_compliance().await.unwrap();
        // rg-sandbox lacks owner and cost-center; rg-production is complete
        assert_eq!(findings.len(), 1);
        let finding = &findings[0];
        assert_eq!(finding.status, FindingStatus::Fail);
        assert_eq!(finding.severity, Severity::Medium);
        assert_eq!(
            finding.mapped_controls,
            vec!["CM-8".to_string(), "AC-2".to_string()]
        );
        assert!(finding.description.contains("owner"));
    }

    #[tokio::test]
    async fn test_collect_concatenates_sub_collections() {
        let connector = AzureConnector::new(&test_config()).unwrap();
        let security = connector.get_security_findings().await.unwrap();
        let configuration = connector.get_configuration_compliance().await.unwrap();
        let snapshot = connector.collect_compliance_data().await.unwrap();
        assert_eq!(snapshot.findings.len(), security.len() + configuration.len());
        assert_eq!(snapshot.provider, CloudProvider::Azure);
        assert!(snapshot.id.starts_with("azure-env-azure-1-"));
        assert!(!snapshot.raw_data.is_null());
    }

    #[tokio::test]
    async fn test_raw_snapshot_reflects_collected_run() {
        let connector = AzureConnector::new(&test_config()).unwrap();
        // No collection yet, so no vendor data to audit
        assert!(connector.raw_snapshot().is_null());

        let snapshot = connector.collect_compliance_data().await.unwrap();
        let security_count = snapshot
            .findings
            .iter()
            .filter(|f| f.rule_name != "required-tags")
            .count();
        // The audit payload is the same data the findings came from
        assert_eq!(
            snapshot.raw_data["assessments"].as_array().unwrap().len(),
            security_count
        );
        assert_eq!(
            snapshot.raw_data["resource_groups"].as_array().unwrap().len(),
            2
        );
    }
}
