//! Cloud collaborator interfaces
//!
//! The orchestrator talks to two remote services, each behind a narrow trait:
//!
//! - [`ClusterApi`]: ECS container instance queries and status transitions
//! - [`CapacityApi`]: Auto Scaling membership, scale-in protection and group sizes
//!
//! The orchestrator works through these traits ONLY. Production wiring lives in
//! [`crate::aws`]; tests use [`crate::memory::InMemoryCloud`].

use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of an ECS container instance
///
/// Normal progression is `Active -> Draining -> Inactive`. The control plane
/// owns this field; callers only request transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    /// Instance is registering with the cluster
    Registering,
    /// Instance accepts new tasks
    Active,
    /// Instance is shedding its tasks
    Draining,
    /// Instance is deregistering from the cluster
    Deregistering,
    /// Instance has been deregistered
    Inactive,
    /// Registration did not complete
    RegistrationFailed,
}

impl InstanceStatus {
    /// Status string as ECS reports it
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registering => "REGISTERING",
            Self::Active => "ACTIVE",
            Self::Draining => "DRAINING",
            Self::Deregistering => "DEREGISTERING",
            Self::Inactive => "INACTIVE",
            Self::RegistrationFailed => "REGISTRATION_FAILED",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "REGISTERING" => Ok(Self::Registering),
            "ACTIVE" => Ok(Self::Active),
            "DRAINING" => Ok(Self::Draining),
            "DEREGISTERING" => Ok(Self::Deregistering),
            "INACTIVE" => Ok(Self::Inactive),
            "REGISTRATION_FAILED" => Ok(Self::RegistrationFailed),
            other => Err(OrchestratorError::UnknownInstanceStatus(other.to_string())),
        }
    }
}

/// One compute node registered to a cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInstance {
    /// Container instance ARN
    pub arn: String,

    /// EC2 instance ID backing this container instance
    pub host_id: String,

    /// Current lifecycle status
    pub status: InstanceStatus,

    /// Tasks scheduled but not yet started
    pub pending_task_count: u32,

    /// Tasks currently running
    pub running_task_count: u32,
}

/// Host selector for container instance listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostFilter {
    /// Only the given EC2 instance
    Is(String),
    /// Every EC2 instance except the given one
    IsNot(String),
}

/// Filter for [`ClusterApi::list_container_instances`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceQuery {
    /// Restrict to a status (ECS default excludes INACTIVE when unset)
    pub status: Option<InstanceStatus>,

    /// Restrict by host
    pub host: Option<HostFilter>,
}

impl InstanceQuery {
    /// Every ACTIVE instance in the cluster
    pub fn active() -> Self {
        Self {
            status: Some(InstanceStatus::Active),
            host: None,
        }
    }

    /// Instances backed by `host`
    pub fn host(host: impl Into<String>) -> Self {
        Self {
            status: None,
            host: Some(HostFilter::Is(host.into())),
        }
    }

    /// Instances backed by anything other than `host`
    pub fn other_than(host: impl Into<String>) -> Self {
        Self {
            status: None,
            host: Some(HostFilter::IsNot(host.into())),
        }
    }

    /// ECS cluster query language expression for the host filter
    pub fn filter_expression(&self) -> Option<String> {
        self.host.as_ref().map(|filter| match filter {
            HostFilter::Is(host) => format!("ec2InstanceId == {}", host),
            HostFilter::IsNot(host) => format!("ec2InstanceId != {}", host),
        })
    }

    /// Whether an instance passes this filter
    pub fn matches(&self, instance: &ContainerInstance) -> bool {
        let status_ok = match self.status {
            Some(status) => instance.status == status,
            None => instance.status != InstanceStatus::Inactive,
        };
        let host_ok = match &self.host {
            Some(HostFilter::Is(host)) => &instance.host_id == host,
            Some(HostFilter::IsNot(host)) => &instance.host_id != host,
            None => true,
        };
        status_ok && host_ok
    }
}

impl fmt::Display for InstanceQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.filter_expression(), self.status) {
            (Some(expr), Some(status)) => write!(f, "{} and status {}", expr, status),
            (Some(expr), None) => f.write_str(&expr),
            (None, Some(status)) => write!(f, "status {}", status),
            (None, None) => f.write_str("all instances"),
        }
    }
}

/// Auto scaling group membership of one EC2 instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMembership {
    /// EC2 instance ID
    pub host_id: String,

    /// Owning auto scaling group
    pub group_name: String,

    /// Whether scale-in may remove this instance
    pub protected_from_scale_in: bool,
}

/// Requested auto scaling group sizes
///
/// A request, not a fact: the group converges asynchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityRequest {
    /// Minimum group size
    pub min_size: u32,

    /// Maximum group size
    pub max_size: u32,

    /// Desired group size
    pub desired_capacity: u32,

    /// Protect instances launched by this change from scale-in (`None` leaves the flag as is)
    pub protect_new_instances: Option<bool>,
}

impl CapacityRequest {
    /// Pin min, max and desired to the same size
    pub fn fixed(size: u32) -> Self {
        Self {
            min_size: size,
            max_size: size,
            desired_capacity: size,
            protect_new_instances: None,
        }
    }

    /// Set new-instance scale-in protection
    pub fn with_new_instance_protection(mut self, protect: bool) -> Self {
        self.protect_new_instances = Some(protect);
        self
    }

    /// Check `min <= desired <= max`
    pub fn validate(&self) -> Result<()> {
        if self.min_size <= self.desired_capacity && self.desired_capacity <= self.max_size {
            Ok(())
        } else {
            Err(OrchestratorError::InvalidCapacity {
                min: self.min_size,
                desired: self.desired_capacity,
                max: self.max_size,
            })
        }
    }
}

/// ECS cluster query/control service
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// List container instance ARNs matching `query`
    async fn list_container_instances(
        &self,
        cluster: &str,
        query: &InstanceQuery,
    ) -> Result<Vec<String>>;

    /// Fetch full records for the given ARNs
    async fn describe_container_instances(
        &self,
        cluster: &str,
        arns: &[String],
    ) -> Result<Vec<ContainerInstance>>;

    /// Request a status transition for one container instance
    async fn update_instance_status(
        &self,
        cluster: &str,
        arn: &str,
        status: InstanceStatus,
    ) -> Result<()>;
}

/// Auto Scaling group capacity service
#[async_trait]
pub trait CapacityApi: Send + Sync {
    /// Group membership for an EC2 instance, `None` when it belongs to no group
    async fn describe_membership(&self, host_id: &str) -> Result<Option<GroupMembership>>;

    /// Set scale-in protection for one group member
    async fn set_scale_in_protection(
        &self,
        host_id: &str,
        group_name: &str,
        protected: bool,
    ) -> Result<()>;

    /// Update group sizes
    async fn update_capacity(&self, group_name: &str, request: &CapacityRequest) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(host: &str, status: InstanceStatus) -> ContainerInstance {
        ContainerInstance {
            arn: format!("arn:aws:ecs:eu-west-1:123456789012:container-instance/c1/{}", host),
            host_id: host.to_string(),
            status,
            pending_task_count: 0,
            running_task_count: 0,
        }
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("ACTIVE".parse::<InstanceStatus>().unwrap(), InstanceStatus::Active);
        assert_eq!(
            "REGISTRATION_FAILED".parse::<InstanceStatus>().unwrap(),
            InstanceStatus::RegistrationFailed
        );
        assert!("active".parse::<InstanceStatus>().is_err());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&InstanceStatus::Draining).unwrap();
        assert_eq!(json, "\"DRAINING\"");
    }

    #[test]
    fn test_filter_expression() {
        assert_eq!(InstanceQuery::active().filter_expression(), None);
        assert_eq!(
            InstanceQuery::host("i-old").filter_expression().as_deref(),
            Some("ec2InstanceId == i-old")
        );
        assert_eq!(
            InstanceQuery::other_than("i-old").filter_expression().as_deref(),
            Some("ec2InstanceId != i-old")
        );
    }

    #[test]
    fn test_query_matches() {
        let old = instance("i-old", InstanceStatus::Draining);
        let new = instance("i-new", InstanceStatus::Active);
        let gone = instance("i-gone", InstanceStatus::Inactive);

        assert!(!InstanceQuery::active().matches(&old));
        assert!(InstanceQuery::active().matches(&new));
        assert!(InstanceQuery::host("i-old").matches(&old));
        assert!(!InstanceQuery::other_than("i-old").matches(&old));
        assert!(InstanceQuery::other_than("i-old").matches(&new));
        assert!(!InstanceQuery::other_than("i-old").matches(&gone));
    }

    #[test]
    fn test_capacity_validation() {
        assert!(CapacityRequest::fixed(2).validate().is_ok());
        assert!(CapacityRequest::fixed(0).validate().is_ok());

        let bad = CapacityRequest {
            min_size: 2,
            max_size: 1,
            desired_capacity: 1,
            protect_new_instances: None,
        };
        assert!(matches!(
            bad.validate(),
            Err(OrchestratorError::InvalidCapacity { min: 2, desired: 1, max: 1 })
        ));
    }

    #[test]
    fn test_capacity_builder() {
        let request = CapacityRequest::fixed(2).with_new_instance_protection(true);
        assert_eq!(request.desired_capacity, 2);
        assert_eq!(request.protect_new_instances, Some(true));
        assert_eq!(CapacityRequest::fixed(1).protect_new_instances, None);
    }
}
