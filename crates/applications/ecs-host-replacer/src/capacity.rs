//! Auto scaling group resizing
//!
//! Size changes are requests: the group converges on its own schedule and
//! callers must poll cluster state to observe the result.

use crate::cloud::{CapacityApi, CapacityRequest};
use crate::error::Result;
use std::sync::Arc;
use tracing::info;

/// Mutates auto scaling group sizes
pub struct CapacityController {
    capacity_api: Arc<dyn CapacityApi>,
}

impl CapacityController {
    /// Create a capacity controller
    pub fn new(capacity_api: Arc<dyn CapacityApi>) -> Self {
        Self { capacity_api }
    }

    /// Ask `group_name` to move to the requested sizes
    ///
    /// Requests with `min > desired` or `desired > max` are rejected before
    /// anything is sent. Remote rejections are returned as-is; nothing is retried.
    pub async fn resize(&self, group_name: &str, request: &CapacityRequest) -> Result<()> {
        request.validate()?;

        info!(
            group = %group_name,
            min = request.min_size,
            max = request.max_size,
            desired = request.desired_capacity,
            protect_new_instances = ?request.protect_new_instances,
            "Updating auto scaling group capacity"
        );

        self.capacity_api.update_capacity(group_name, request).await
    }

    /// Pin the group to `size` so a replacement host launches, born protected
    pub async fn expand_for_replacement(
        &self,
        group_name: &str,
        size: u32,
    ) -> Result<CapacityRequest> {
        let request = CapacityRequest::fixed(size).with_new_instance_protection(true);
        self.resize(group_name, &request).await?;
        Ok(request)
    }

    /// Pin the group back to `size`, leaving new-instance protection as is
    pub async fn restore_single(&self, group_name: &str, size: u32) -> Result<CapacityRequest> {
        let request = CapacityRequest::fixed(size);
        self.resize(group_name, &request).await?;
        Ok(request)
    }
}
