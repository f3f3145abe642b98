//! NIST 800-53 control-mapping tables
//!
//! Mapping from provider-specific rule/category names to control
//! identifiers is data, not logic: each provider ships a built-in
//! table, and operators can replace or extend it from a JSON document
//! without a redeploy. Loaded once, immutable afterwards.
//!
//! JSON shape:
//!
//! ```json
//! {
//!   "fallback_control": "SC-1",
//!   "entries": {
//!     "mfa should be enabled": {
//!       "controls": ["IA-2", "AC-6"],
//!       "remediation": "Enable multi-factor authentication"
//!     }
//!   }
//! }
//! ```

use crate::ConnectorResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Baseline control applied when no specific mapping exists, so
/// `mapped_controls` is never empty.
pub const FALLBACK_CONTROL: &str = "SC-1";

fn default_fallback_control() -> String {
    FALLBACK_CONTROL.to_string()
}

/// One mapping table row
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MappingEntry {
    pub controls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

/// Immutable lookup from rule/category key to NIST control ids and
/// advisory remediation text. Keys are matched case-insensitively.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ControlMap {
    #[serde(default = "default_fallback_control")]
    fallback_control: String,
    entries: HashMap<String, MappingEntry>,
}

impl ControlMap {
    /// Empty map; every lookup resolves to the fallback control
    pub fn empty() -> Self {
        Self {
            fallback_control: default_fallback_control(),
            entries: HashMap::new(),
        }
    }

    /// Load from an operator-supplied JSON document
    pub fn from_json_str(json: &str) -> ConnectorResult<Self> {
        let map: Self = serde_json::from_str(json)?;
        Ok(map.normalized())
    }

    /// Load from an already-parsed JSON value
    pub fn from_json_value(value: serde_json::Value) -> ConnectorResult<Self> {
        let map: Self = serde_json::from_value(value)?;
        Ok(map.normalized())
    }

    fn from_table(rows: &[(&str, &[&str], Option<&str>)]) -> Self {
        let entries = rows
            .iter()
            .map(|(key, controls, remediation)| {
                (
                    key.to_ascii_lowercase(),
                    MappingEntry {
                        controls: controls.iter().map(|c| c.to_string()).collect(),
                        remediation: remediation.map(|r| r.to_string()),
                    },
                )
            })
            .collect();
        Self {
            fallback_control: default_fallback_control(),
            entries,
        }
    }

    fn normalized(mut self) -> Self {
        self.entries = self
            .entries
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        self
    }

    /// Controls mapped to `key`; never empty (fallback applied)
    pub fn controls_for(&self, key: &str) -> Vec<String> {
        match self.entries.get(&key.to_ascii_lowercase()) {
            Some(entry) if !entry.controls.is_empty() => entry.controls.clone(),
            _ => vec![self.fallback_control.clone()],
        }
    }

    /// Advisory remediation text for `key`, if the table carries any
    pub fn remediation_for(&self, key: &str) -> Option<String> {
        self.entries
            .get(&key.to_ascii_lowercase())
            .and_then(|entry| entry.remediation.clone())
    }

    pub fn fallback_control(&self) -> &str {
        &self.fallback_control
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // =========================================================================
    // Built-in per-provider tables
    // =========================================================================

    /// Defender for Cloud assessment names and tag-policy rules
    pub fn azure_defaults() -> Self {
        Self::from_table(&[
            (
                "mfa should be enabled on accounts with owner permissions",
                &["IA-2", "AC-6"],
                Some("Enable multi-factor authentication for all accounts with owner permissions"),
            ),
            (
                "storage accounts should restrict network access",
                &["SC-7", "AC-4"],
                Some("Configure storage account firewall rules to restrict network access"),
            ),
            (
                "disk encryption should be applied on virtual machines",
                &["SC-28"],
                Some("Enable Azure Disk Encryption on all virtual machine disks"),
            ),
            (
                "auditing on sql server should be enabled",
                &["AU-2", "AU-12"],
                Some("Enable auditing on all SQL servers"),
            ),
            (
                "management ports should be closed on your virtual machines",
                &["SC-7", "CM-7"],
                Some("Close management ports or restrict them with just-in-time access"),
            ),
            (
                "vulnerabilities should be remediated",
                &["RA-5", "SI-2"],
                Some("Apply the vendor-recommended remediation for each reported vulnerability"),
            ),
            ("required-tags", &["CM-8", "AC-2"], Some("Apply the required tag set to the resource group")),
        ])
    }

    /// Security Hub generator ids and Config rule names
    pub fn aws_defaults() -> Self {
        Self::from_table(&[
            (
                "iam.1 iam root user access key should not exist",
                &["AC-6", "IA-2"],
                Some("Delete root user access keys and use IAM roles instead"),
            ),
            (
                "s3.1 s3 buckets should prohibit public access",
                &["AC-3", "SC-7"],
                Some("Enable S3 Block Public Access at the account and bucket level"),
            ),
            (
                "ec2.2 security groups should not allow unrestricted ingress",
                &["SC-7", "AC-4"],
                Some("Remove 0.0.0.0/0 ingress rules from security groups"),
            ),
            (
                "cloudtrail.1 cloudtrail should be enabled",
                &["AU-2", "AU-12"],
                Some("Enable CloudTrail in all regions with log file validation"),
            ),
            (
                "kms.1 customer managed keys should be rotated",
                &["SC-12", "SC-28"],
                Some("Enable annual rotation for customer managed KMS keys"),
            ),
            (
                "encrypted-volumes",
                &["SC-28"],
                Some("Enable EBS encryption by default and re-create unencrypted volumes"),
            ),
            (
                "required-tags",
                &["CM-8"],
                Some("Apply the required tag set to all resources in scope"),
            ),
            (
                "restricted-ssh",
                &["SC-7", "AC-17"],
                Some("Restrict SSH ingress to known administrative CIDR ranges"),
            ),
        ])
    }

    /// Security Command Center categories and asset policy rules
    pub fn gcp_defaults() -> Self {
        Self::from_table(&[
            (
                "public_bucket_acl",
                &["AC-3", "SC-7"],
                Some("Remove allUsers and allAuthenticatedUsers bindings from the bucket"),
            ),
            (
                "open_firewall",
                &["SC-7", "AC-4"],
                Some("Restrict the firewall rule source ranges to known networks"),
            ),
            (
                "mfa_not_enforced",
                &["IA-2"],
                Some("Enforce 2-step verification for all users in the organization"),
            ),
            (
                "sql_public_ip",
                &["SC-7"],
                Some("Disable public IP on the Cloud SQL instance and use private services access"),
            ),
            (
                "audit_logging_disabled",
                &["AU-2", "AU-12"],
                Some("Enable Data Access audit logs for the affected service"),
            ),
            (
                "compute.googleapis.com/instance",
                &["CM-8"],
                Some("Bring the instance configuration in line with the asset policy"),
            ),
            (
                "storage.googleapis.com/bucket",
                &["CM-8", "SC-28"],
                Some("Enable uniform bucket-level access and default encryption"),
            ),
        ])
    }

    /// Cloud Guard detector rules and policy rule names
    pub fn oci_defaults() -> Self {
        Self::from_table(&[
            (
                "public_bucket",
                &["AC-3", "SC-7"],
                Some("Set the Object Storage bucket visibility to private"),
            ),
            (
                "instance_public_ip",
                &["SC-7"],
                Some("Remove the public IP and access the instance through a bastion"),
            ),
            (
                "password_policy_weak",
                &["IA-5"],
                Some("Strengthen the IAM password policy to the CIS recommended baseline"),
            ),
            (
                "security_list_open",
                &["SC-7", "AC-4"],
                Some("Restrict the security list ingress rules to known CIDR ranges"),
            ),
            (
                "audit_log_retention",
                &["AU-11"],
                Some("Increase audit log retention to at least 365 days"),
            ),
            (
                "kms_key_rotation",
                &["SC-12"],
                Some("Enable automatic rotation for the affected vault key"),
            ),
        ])
    }
}

impl Default for ControlMap {
    fn default() -> Self {
        Self::empty()
    }
}
