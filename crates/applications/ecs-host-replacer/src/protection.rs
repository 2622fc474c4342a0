//! Scale-in protection for the host being replaced

use crate::cloud::CapacityApi;
use crate::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// What `clear_scale_in_protection` had to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtectionChange {
    /// The host was already unprotected, nothing was sent
    AlreadyUnprotected,
    /// Protection was removed
    Cleared,
}

/// Reads and clears scale-in protection on a single group member
pub struct ProtectionController {
    capacity_api: Arc<dyn CapacityApi>,
}

impl ProtectionController {
    /// Create a protection controller
    pub fn new(capacity_api: Arc<dyn CapacityApi>) -> Self {
        Self { capacity_api }
    }

    /// Current scale-in protection flag of `host_id`
    pub async fn is_protected(&self, host_id: &str) -> Result<bool> {
        let membership = self
            .capacity_api
            .describe_membership(host_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotInAutoScalingGroup {
                host: host_id.to_string(),
            })?;
        Ok(membership.protected_from_scale_in)
    }

    /// Make `host_id` eligible for scale-in
    ///
    /// Idempotent: a host that is already unprotected costs one read and no write.
    pub async fn clear_scale_in_protection(
        &self,
        host_id: &str,
        group_name: &str,
    ) -> Result<ProtectionChange> {
        if !self.is_protected(host_id).await? {
            info!(
                instance_id = %host_id,
                group = %group_name,
                "Instance does not have scale-in protection, nothing to do"
            );
            return Ok(ProtectionChange::AlreadyUnprotected);
        }

        info!(
            instance_id = %host_id,
            group = %group_name,
            "Removing scale-in protection"
        );
        self.capacity_api
            .set_scale_in_protection(host_id, group_name, false)
            .await?;

        Ok(ProtectionChange::Cleared)
    }
}
