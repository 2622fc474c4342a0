//! AWS-backed collaborators
//!
//! [`EcsClusterApi`] and [`AutoScalingCapacityApi`] implement the traits in
//! [`crate::cloud`] over the official SDK clients.
//!
//! ## Prerequisites
//!
//! - Credentials and region resolvable by the default provider chain (or
//!   `--profile` / `--region`)
//! - IAM permissions for `ecs:ListContainerInstances`,
//!   `ecs:DescribeContainerInstances`, `ecs:UpdateContainerInstancesState`,
//!   `autoscaling:DescribeAutoScalingInstances`,
//!   `autoscaling:SetInstanceProtection` and
//!   `autoscaling:UpdateAutoScalingGroup`

use crate::cloud::{
    CapacityApi, CapacityRequest, ClusterApi, ContainerInstance, GroupMembership, InstanceQuery,
    InstanceStatus,
};
use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, SdkConfig};
use aws_sdk_autoscaling::Client as AutoScalingClient;
use aws_sdk_ecs::Client as EcsClient;
use aws_sdk_ecs::types::ContainerInstanceStatus;
use aws_types::region::Region;
use tracing::{debug, info, warn};

/// DescribeContainerInstances accepts at most this many ARNs per call
const DESCRIBE_BATCH_SIZE: usize = 100;

/// Load SDK configuration from the default chain, with optional overrides
pub async fn load_sdk_config(profile: Option<&str>, region: Option<&str>) -> SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());

    if let Some(profile) = profile {
        loader = loader.profile_name(profile);
    }
    if let Some(region) = region {
        loader = loader.region(Region::new(region.to_string()));
    }

    loader.load().await
}

fn task_count(raw: i32) -> u32 {
    u32::try_from(raw).unwrap_or(0)
}

fn size(value: u32, request: &CapacityRequest) -> Result<i32> {
    i32::try_from(value).map_err(|_| OrchestratorError::InvalidCapacity {
        min: request.min_size,
        desired: request.desired_capacity,
        max: request.max_size,
    })
}

/// Convert an SDK container instance record
pub fn container_instance(raw: &aws_sdk_ecs::types::ContainerInstance) -> Result<ContainerInstance> {
    let arn = raw
        .container_instance_arn()
        .ok_or(OrchestratorError::MissingField("containerInstanceArn"))?;
    let host_id = raw
        .ec2_instance_id()
        .ok_or(OrchestratorError::MissingField("ec2InstanceId"))?;
    let status = raw
        .status()
        .ok_or(OrchestratorError::MissingField("status"))?
        .parse::<InstanceStatus>()?;

    Ok(ContainerInstance {
        arn: arn.to_string(),
        host_id: host_id.to_string(),
        status,
        pending_task_count: task_count(raw.pending_tasks_count()),
        running_task_count: task_count(raw.running_tasks_count()),
    })
}

/// ECS container instance queries and status changes
#[derive(Clone)]
pub struct EcsClusterApi {
    client: EcsClient,
}

impl EcsClusterApi {
    /// Create from an existing client
    pub fn new(client: EcsClient) -> Self {
        Self { client }
    }

    /// Create from AWS config
    pub fn from_config(config: &SdkConfig) -> Self {
        Self::new(EcsClient::new(config))
    }
}

#[async_trait]
impl ClusterApi for EcsClusterApi {
    async fn list_container_instances(
        &self,
        cluster: &str,
        query: &InstanceQuery,
    ) -> Result<Vec<String>> {
        let status = query
            .status
            .map(|s| ContainerInstanceStatus::from(s.as_str()));
        let filter = query.filter_expression();

        let mut arns = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let output = self
                .client
                .list_container_instances()
                .cluster(cluster)
                .set_status(status.clone())
                .set_filter(filter.clone())
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(OrchestratorError::from_ecs)?;

            arns.extend(output.container_instance_arns().iter().cloned());

            match output.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }

        debug!(cluster = %cluster, query = %query, count = arns.len(), "Listed container instances");
        Ok(arns)
    }

    async fn describe_container_instances(
        &self,
        cluster: &str,
        arns: &[String],
    ) -> Result<Vec<ContainerInstance>> {
        let mut instances = Vec::with_capacity(arns.len());

        for chunk in arns.chunks(DESCRIBE_BATCH_SIZE) {
            let output = self
                .client
                .describe_container_instances()
                .cluster(cluster)
                .set_container_instances(Some(chunk.to_vec()))
                .send()
                .await
                .map_err(OrchestratorError::from_ecs)?;

            for failure in output.failures() {
                warn!(
                    cluster = %cluster,
                    arn = failure.arn().unwrap_or_default(),
                    reason = failure.reason().unwrap_or_default(),
                    "Container instance could not be described"
                );
            }

            for raw in output.container_instances() {
                instances.push(container_instance(raw)?);
            }
        }

        Ok(instances)
    }

    async fn update_instance_status(
        &self,
        cluster: &str,
        arn: &str,
        status: InstanceStatus,
    ) -> Result<()> {
        let output = self
            .client
            .update_container_instances_state()
            .cluster(cluster)
            .container_instances(arn)
            .status(ContainerInstanceStatus::from(status.as_str()))
            .send()
            .await
            .map_err(OrchestratorError::from_ecs)?;

        if let Some(failure) = output.failures().first() {
            return Err(OrchestratorError::AwsService(format!(
                "Failed to set {} to {}: {}",
                arn,
                status,
                failure.reason().unwrap_or("unknown reason")
            )));
        }

        info!(cluster = %cluster, arn = %arn, status = %status, "Container instance status updated");
        Ok(())
    }
}

/// Auto Scaling group membership, protection and sizes
#[derive(Clone)]
pub struct AutoScalingCapacityApi {
    client: AutoScalingClient,
}

impl AutoScalingCapacityApi {
    /// Create from an existing client
    pub fn new(client: AutoScalingClient) -> Self {
        Self { client }
    }

    /// Create from AWS config
    pub fn from_config(config: &SdkConfig) -> Self {
        Self::new(AutoScalingClient::new(config))
    }
}

#[async_trait]
impl CapacityApi for AutoScalingCapacityApi {
    async fn describe_membership(&self, host_id: &str) -> Result<Option<GroupMembership>> {
        let output = self
            .client
            .describe_auto_scaling_instances()
            .instance_ids(host_id)
            .send()
            .await
            .map_err(OrchestratorError::from_autoscaling)?;

        let membership = output.auto_scaling_instances().first().and_then(|details| {
            details.auto_scaling_group_name().map(|group| GroupMembership {
                host_id: host_id.to_string(),
                group_name: group.to_string(),
                protected_from_scale_in: details.protected_from_scale_in().unwrap_or(false),
            })
        });

        Ok(membership)
    }

    async fn set_scale_in_protection(
        &self,
        host_id: &str,
        group_name: &str,
        protected: bool,
    ) -> Result<()> {
        self.client
            .set_instance_protection()
            .instance_ids(host_id)
            .auto_scaling_group_name(group_name)
            .protected_from_scale_in(protected)
            .send()
            .await
            .map_err(OrchestratorError::from_autoscaling)?;

        Ok(())
    }

    async fn update_capacity(&self, group_name: &str, request: &CapacityRequest) -> Result<()> {
        self.client
            .update_auto_scaling_group()
            .auto_scaling_group_name(group_name)
            .min_size(size(request.min_size, request)?)
            .max_size(size(request.max_size, request)?)
            .desired_capacity(size(request.desired_capacity, request)?)
            .set_new_instances_protected_from_scale_in(request.protect_new_instances)
            .send()
            .await
            .map_err(OrchestratorError::from_autoscaling)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_ecs::types::ContainerInstance as RawInstance;

    #[test]
    fn test_container_instance_conversion() {
        let raw = RawInstance::builder()
            .container_instance_arn("arn:aws:ecs:eu-west-1:123456789012:container-instance/c1/abc")
            .ec2_instance_id("i-old")
            .status("DRAINING")
            .running_tasks_count(3)
            .pending_tasks_count(0)
            .build();

        let instance = container_instance(&raw).unwrap();
        assert_eq!(instance.host_id, "i-old");
        assert_eq!(instance.status, InstanceStatus::Draining);
        assert_eq!(instance.running_task_count, 3);
    }

    #[test]
    fn test_container_instance_missing_host() {
        let raw = RawInstance::builder()
            .container_instance_arn("arn:aws:ecs:eu-west-1:123456789012:container-instance/c1/abc")
            .status("ACTIVE")
            .build();

        let err = container_instance(&raw).unwrap_err();
        assert!(matches!(err, OrchestratorError::MissingField("ec2InstanceId")));
    }

    #[test]
    fn test_negative_counts_clamped() {
        assert_eq!(task_count(-1), 0);
        assert_eq!(task_count(7), 7);
    }

    #[test]
    fn test_oversized_capacity_rejected() {
        let request = CapacityRequest::fixed(u32::MAX);
        assert!(matches!(
            size(request.desired_capacity, &request),
            Err(OrchestratorError::InvalidCapacity { .. })
        ));
        assert_eq!(size(2, &CapacityRequest::fixed(2)).unwrap(), 2);
    }
}
