//! AWS integration
//!
//! Security findings come from Security Hub; configuration compliance
//! comes from Config rule evaluations.

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

/// Security Hub finding
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SecurityHubFinding {
    pub id: String,
    pub title: String,
    pub description: String,
    pub generator_id: String,
    /// `CRITICAL` / `HIGH` / `MEDIUM` / `LOW` / `INFORMATIONAL`
    pub severity_label: String,
    /// `PASSED` / `FAILED` / `WARNING` / `NOT_AVAILABLE`
    pub compliance_status: String,
    pub resource_id: String,
}

/// Config rule evaluation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigEvaluation {
    pub config_rule_name: String,
    /// `COMPLIANT` / `NON_COMPLIANT` / `NOT_APPLICABLE` / `INSUFFICIENT_DATA`
    pub compliance_type: String,
    pub resource_type: String,
    pub resource_id: String,
    pub annotation: Option<String>,
}

/// AWS compliance connector
pub struct AwsConnector {
    environment_id: String,
    tenant_id: Uuid,
    access_key_id: String,
    secret_access_key: String,
    region: String,
    session_token: Option<String>,
    control_map: ControlMap,
    retry: RetryPolicy,
    http: reqwest::Client,
    /// Raw payload of the latest collection, kept for the audit snapshot
    last_raw: RwLock<serde_json::Value>,
}

impl AwsConnector {
    pub fn new(config: &CloudConnectorConfig) -> ConnectorResult<Self> {
        let CloudCredentials::Aws {
            access_key_id,
            secret_access_key,
            region,
            session_token,
        } = &config.credentials
        else {
            return Err(ConnectorError::Configuration(format!(
                "AWS connector constructed with {} credentials",
                config.credentials.provider()
            )));
        };
        if access_key_id.is_empty() || secret_access_key.is_empty() {
            return Err(ConnectorError::Configuration(
                "AWS access_key_id and secret_access_key are required".to_string(),
            ));
        }

        Ok(Self {
            environment_id: config.environment.id.clone(),
            tenant_id: config.tenant_id,
            access_key_id: access_key_id.clone(),
            secret_access_key: secret_access_key.clone(),
            region: region.clone(),
            session_token: session_token.clone(),
            control_map: ControlMap::aws_defaults(),
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

    async fn caller_identity(&self) -> ConnectorResult<String> {
        // In production: STS GetCallerIdentity, the cheapest signed call
        Ok(format!("arn:aws:iam::123456789012:user/{}", self.access_key_id))
    }

    async fn fetch_security_hub_findings(&self) -> ConnectorResult<Vec<SecurityHubFinding>> {
        // In production: SecurityHub GetFindings with self.http against
        // the regional endpoint
        Ok(vec![
            SecurityHubFinding {
                id: "sh-0001".to_string(),
                title: "IAM.1 IAM root user access key should not exist".to_string(),
                description: "Root account has an active access key".to_string(),
                generator_id: "aws-foundational-security-best-practices/v/1.0.0/IAM.1"
                    .to_string(),
                severity_label: "CRITICAL".to_string(),
                compliance_status: "FAILED".to_string(),
                resource_id: "arn:aws:iam::123456789012:root".to_string(),
            },
            SecurityHubFinding {
                id: "sh-0002".to_string(),
                title: "S3.1 S3 buckets should prohibit public access".to_string(),
                description: "Block public access is enabled account-wide".to_string(),
                generator_id: "aws-foundational-security-best-practices/v/1.0.0/S3.1".to_string(),
                severity_label: "MEDIUM".to_string(),
                compliance_status: "PASSED".to_string(),
                resource_id: "arn:aws:s3:::all-buckets".to_string(),
            },
            SecurityHubFinding {
                id: "sh-0003".to_string(),
                title: "CloudTrail.1 CloudTrail should be enabled".to_string(),
                description: "Multi-region trail status could not be determined".to_string(),
                generator_id: "aws-foundational-security-best-practices/v/1.0.0/CloudTrail.1"
                    .to_string(),
                severity_label: "HIGH".to_string(),
                compliance_status: "NOT_AVAILABLE".to_string(),
                resource_id: "arn:aws:cloudtrail:us-east-1:123456789012:trail/main".to_string(),
            },
        ])
    }

    async fn fetch_config_evaluations(&self) -> ConnectorResult<Vec<ConfigEvaluation>> {
        // In production: Config DescribeComplianceByConfigRule +
        // GetComplianceDetailsByConfigRule
        Ok(vec![
            ConfigEvaluation {
                config_rule_name: "encrypted-volumes".to_string(),
                compliance_type: "NON_COMPLIANT".to_string(),
                resource_type: "AWS::EC2::Volume".to_string(),
                resource_id: "vol-0a1b2c3d".to_string(),
                annotation: Some("Volume is not encrypted".to_string()),
            },
            ConfigEvaluation {
                config_rule_name: "required-tags".to_string(),
                compliance_type: "COMPLIANT".to_string(),
                resource_type: "AWS::EC2::Instance".to_string(),
                resource_id: "i-0f9e8d7c".to_string(),
                annotation: None,
            },
            ConfigEvaluation {
                config_rule_name: "restricted-ssh".to_string(),
                compliance_type: "INSUFFICIENT_DATA".to_string(),
                resource_type: "AWS::EC2::SecurityGroup".to_string(),
                resource_id: "sg-012345".to_string(),
                annotation: None,
            },
        ])
    }

    fn normalize_hub_finding(&self, finding: &SecurityHubFinding) -> ComplianceFinding {
        let severity = match finding.severity_label.to_ascii_uppercase().as_str() {
            "CRITICAL" => Severity::Critical,
            "HIGH" => Severity::High,
            "LOW" | "INFORMATIONAL" => Severity::Low,
            _ => Severity::Medium,
        };
        let status = match finding.compliance_status.to_ascii_uppercase().as_str() {
            "PASSED" => FindingStatus::Pass,
            "FAILED" => FindingStatus::Fail,
            "NOT_AVAILABLE" => FindingStatus::NotApplicable,
            // WARNING and anything unrecognized needs human review
            _ => FindingStatus::Manual,
        };
        let now = Utc::now();

        ComplianceFinding {
            id: format!("aws-{}", finding.id),
            provider: CloudProvider::Aws,
            severity,
            status,
            mapped_controls: self.control_map.controls_for(&finding.title),
            resource_id: finding.resource_id.clone(),
            rule_name: finding.title.clone(),
            description: finding.description.clone(),
            remediation: self.control_map.remediation_for(&finding.title),
            discovered_at: now,
            last_checked: now,
        }
    }

    fn normalize_config_evaluation(&self, evaluation: &ConfigEvaluation) -> ComplianceFinding {
        let (status, severity) = match evaluation.compliance_type.to_ascii_uppercase().as_str() {
            "COMPLIANT" => (FindingStatus::Pass, Severity::Low),
            // Non-compliance against a Config rule is always high
            // severity, regardless of the rule
            "NON_COMPLIANT" => (FindingStatus::Fail, Severity::High),
            "NOT_APPLICABLE" => (FindingStatus::NotApplicable, Severity::Low),
            _ => (FindingStatus::Manual, Severity::Medium),
        };
        let now = Utc::now();

        ComplianceFinding {
            id: format!(
                "aws-config-{}-{}",
                evaluation.config_rule_name, evaluation.resource_id
            ),
            provider: CloudProvider::Aws,
            severity,
            status,
            mapped_controls: self.control_map.controls_for(&evaluation.config_rule_name),
            resource_id: evaluation.resource_id.clone(),
            rule_name: evaluation.config_rule_name.clone(),
            description: evaluation.annotation.clone().unwrap_or_else(|| {
                format!(
                    "{} evaluated {} for {}",
                    evaluation.config_rule_name, evaluation.compliance_type, evaluation.resource_id
                )
            }),
            remediation: self
                .control_map
                .remediation_for(&evaluation.config_rule_name),
            discovered_at: now,
            last_checked: now,
        }
    }
}

#[async_trait]
impl CloudConnector for AwsConnector {
    fn provider(&self) -> CloudProvider {
        CloudProvider::Aws
    }

    fn environment_id(&self) -> &str {
        &self.environment_id
    }

    fn tenant_id(&self) -> Uuid {
        self.tenant_id
    }

    async fn test_connection(&self) -> bool {
        match self.caller_identity().await {
            Ok(arn) => {
                tracing::debug!(region = %self.region, caller = %arn, "AWS connectivity verified");
                true
            }
            Err(err) => {
                log_operation_error(CloudProvider::Aws, "test_connection", &err);
                false
            }
        }
    }

    async fn get_security_findings(&self) -> ConnectorResult<Vec<ComplianceFinding>> {
        let findings =
            match retry_with_backoff(self.retry, || self.fetch_security_hub_findings()).await {
                Ok(findings) => findings,
                Err(err) => {
                    record_raw_section(&self.last_raw, "security_hub", &serde_json::Value::Null);
                    log_operation_error(CloudProvider::Aws, "get_security_findings", &err);
                    return Err(err);
                }
            };
        record_raw_section(&self.last_raw, "security_hub", &findings);
        Ok(findings
            .iter()
            .map(|f| self.normalize_hub_finding(f))
            .collect())
    }

    async fn get_configuration_compliance(&self) -> ConnectorResult<Vec<ComplianceFinding>> {
        let evaluations =
            match retry_with_backoff(self.retry, || self.fetch_config_evaluations()).await {
                Ok(evaluations) => evaluations,
                Err(err) => {
                    record_raw_section(
                        &self.last_raw,
                        "config_evaluations",
                        &serde_json::Value::Null,
                    );
                    log_operation_error(CloudProvider::Aws, "get_configuration_compliance", &err);
                    return Err(err);
                }
            };
        record_raw_section(&self.last_raw, "config_evaluations", &evaluations);
        Ok(evaluations
            .iter()
            .map(|e| self.normalize_config_evaluation(e))
            .collect())
    }

    fn raw_snapshot(&self) -> serde_json::Value {
        self.last_raw.read().clone()
    }
}
