//! Connector manager
//!
//! Owns the set of live connectors keyed by environment id, gates
//! registration on a connectivity probe, and fans collection out
//! concurrently with "wait for all, tolerate individual failure"
//! semantics: one unreachable cloud account must not block compliance
//! reporting for the others.

use crate::aws::AwsConnector;
use crate::azure::AzureConnector;
use crate::connector::CloudConnector;
use crate::gcp::GcpConnector;
use crate::oci::OciConnector;
use crate::{
    CloudConnectorConfig, CloudCredentials, CloudEnvironment, CloudProvider, ComplianceData,
    ConnectorResult,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Outcome of a targeted sync: callers need to know which ids to retry
#[derive(Clone, Debug, Default, Serialize)]
pub struct SyncOutcome {
    pub success: Vec<ComplianceData>,
    pub failed: Vec<String>,
}

/// Health-check partition over the registered environments
#[derive(Clone, Debug, Default, Serialize)]
pub struct HealthReport {
    pub healthy: Vec<String>,
    pub unhealthy: Vec<String>,
    pub total: usize,
}

/// Manager-level status for the reporting collaborator
#[derive(Clone, Debug, Serialize)]
pub struct ConnectorStats {
    pub total: usize,
    pub by_provider: HashMap<String, usize>,
    pub last_sync: Option<DateTime<Utc>>,
}

/// Construct the provider connector matching `config.environment.provider`.
///
/// A provider/credential mismatch or missing required field is a caller
/// bug and errors synchronously here.
pub fn build_connector(config: &CloudConnectorConfig) -> ConnectorResult<Arc<dyn CloudConnector>> {
    Ok(match config.environment.provider {
        CloudProvider::Azure => Arc::new(AzureConnector::new(config)?),
        CloudProvider::Aws => Arc::new(AwsConnector::new(config)?),
        CloudProvider::Gcp => Arc::new(GcpConnector::new(config)?),
        CloudProvider::Oracle => Arc::new(OciConnector::new(config)?),
    })
}

/// Multi-cloud connector registry and collection orchestrator.
///
/// The registry is the only shared mutable state; it is mutated only by
/// [`initialize_connector`](Self::initialize_connector),
/// [`remove_connector`](Self::remove_connector) and
/// [`dispose`](Self::dispose). Collection fan-outs only read it.
pub struct ConnectorManager {
    connectors: DashMap<String, Arc<dyn CloudConnector>>,
    last_sync: RwLock<Option<DateTime<Utc>>>,
}

impl ConnectorManager {
    pub fn new() -> Self {
        Self {
            connectors: DashMap::new(),
            last_sync: RwLock::new(None),
        }
    }

    /// Construct and connectivity-test a connector for `environment`;
    /// register it only on success. On failure any prior connector for
    /// the same environment id is left untouched.
    pub async fn initialize_connector(
        &self,
        environment: &CloudEnvironment,
        tenant_id: Uuid,
        credentials: CloudCredentials,
    ) -> bool {
        let config = CloudConnectorConfig {
            environment: environment.clone(),
            tenant_id,
            credentials,
        };

        let connector = match build_connector(&config) {
            Ok(connector) => connector,
            Err(err) => {
                tracing::error!(
                    environment_id = %environment.id,
                    provider = environment.provider.as_str(),
                    error = %err,
                    "connector construction failed"
                );
                return false;
            }
        };

        self.register_if_reachable(&environment.id, connector).await
    }

    /// Connectivity gate for registration: the connector is inserted
    /// only after its probe succeeds, so a failed probe leaves any
    /// prior entry for the same environment id untouched.
    pub(crate) async fn register_if_reachable(
        &self,
        environment_id: &str,
        connector: Arc<dyn CloudConnector>,
    ) -> bool {
        let provider = connector.provider();
        if !connector.test_connection().await {
            tracing::warn!(
                environment_id,
                provider = provider.as_str(),
                "connectivity test failed, connector not registered"
            );
            return false;
        }

        self.connectors.insert(environment_id.to_string(), connector);
        tracing::info!(
            environment_id,
            provider = provider.as_str(),
            "connector registered"
        );
        true
    }

    /// Unconditional, idempotent removal
    pub fn remove_connector(&self, environment_id: &str) {
        if self.connectors.remove(environment_id).is_some() {
            tracing::info!(environment_id, "connector removed");
        }
    }

    pub fn is_registered(&self, environment_id: &str) -> bool {
        self.connectors.contains_key(environment_id)
    }

    pub fn environment_ids(&self) -> Vec<String> {
        self.connectors.iter().map(|e| e.key().clone()).collect()
    }

    /// Delegates to the registered connector; `false` for unknown ids
    pub async fn test_connection(&self, environment_id: &str) -> bool {
        let connector = match self.get(environment_id) {
            Some(connector) => connector,
            None => return false,
        };
        connector.test_connection().await
    }

    /// Collect one environment's snapshot. Any error is logged and
    /// surfaced as `None` so a caller iterating over many environments
    /// is never aborted by one failure.
    pub async fn collect_compliance_data(&self, environment_id: &str) -> Option<ComplianceData> {
        let connector = match self.get(environment_id) {
            Some(connector) => connector,
            None => {
                tracing::warn!(environment_id, "no connector registered");
                return None;
            }
        };
        match connector.collect_compliance_data().await {
            Ok(data) => Some(data),
            Err(err) => {
                tracing::error!(
                    environment_id,
                    provider = connector.provider().as_str(),
                    error = %err,
                    "compliance collection failed"
                );
                None
            }
        }
    }

    /// Fan out collection across every registered environment, wait for
    /// all to settle, and return only the successes. Failures are
    /// logged and dropped.
    pub async fn collect_all_compliance_data(&self) -> Vec<ComplianceData> {
        let outcome = self.sync_environments(&self.environment_ids()).await;
        outcome.success
    }

    /// Same fan-out discipline scoped to a caller-supplied subset, with
    /// outcomes explicitly partitioned. Unknown ids land in `failed`.
    pub async fn sync_environments(&self, environment_ids: &[String]) -> SyncOutcome {
        let mut handles = Vec::with_capacity(environment_ids.len());
        for id in environment_ids {
            let id = id.clone();
            let connector = self.get(&id);
            handles.push((
                id,
                connector.map(|c| tokio::spawn(async move { c.collect_compliance_data().await })),
            ));
        }

        let mut outcome = SyncOutcome::default();
        for (id, handle) in handles {
            let result = match handle {
                Some(handle) => handle.await,
                None => {
                    tracing::warn!(environment_id = %id, "no connector registered");
                    outcome.failed.push(id);
                    continue;
                }
            };
            match result {
                Ok(Ok(data)) => outcome.success.push(data),
                Ok(Err(err)) => {
                    tracing::error!(environment_id = %id, error = %err, "sync failed");
                    outcome.failed.push(id);
                }
                Err(join_err) => {
                    tracing::error!(environment_id = %id, error = %join_err, "sync task panicked");
                    outcome.failed.push(id);
                }
            }
        }

        *self.last_sync.write() = Some(Utc::now());
        tracing::info!(
            success = outcome.success.len(),
            failed = outcome.failed.len(),
            "environment sync settled"
        );
        outcome
    }

    /// Concurrently probe every registered connector and partition the
    /// environment ids by result.
    pub async fn health_check(&self) -> HealthReport {
        let mut handles = Vec::new();
        for entry in self.connectors.iter() {
            let id = entry.key().clone();
            let connector = entry.value().clone();
            handles.push((
                id,
                tokio::spawn(async move { connector.test_connection().await }),
            ));
        }

        let mut report = HealthReport::default();
        for (id, handle) in handles {
            report.total += 1;
            match handle.await {
                Ok(true) => report.healthy.push(id),
                _ => report.unhealthy.push(id),
            }
        }
        report
    }

    /// Registry counts for the reporting collaborator
    pub fn connector_stats(&self) -> ConnectorStats {
        let mut by_provider: HashMap<String, usize> = HashMap::new();
        for entry in self.connectors.iter() {
            *by_provider
                .entry(entry.value().provider().as_str().to_string())
                .or_default() += 1;
        }
        ConnectorStats {
            total: self.connectors.len(),
            by_provider,
            last_sync: *self.last_sync.read(),
        }
    }

    /// Clear all registered connectors; terminal operation
    pub fn dispose(&self) {
        let count = self.connectors.len();
        self.connectors.clear();
        tracing::info!(disposed = count, "connector manager disposed");
    }

    fn get(&self, environment_id: &str) -> Option<Arc<dyn CloudConnector>> {
        self.connectors.get(environment_id).map(|e| e.value().clone())
    }
}

impl Default for ConnectorManager {
    fn default() -> Self {
        Self::new()
    }
}
