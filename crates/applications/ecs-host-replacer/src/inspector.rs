//! Container instance lookup
//!
//! Resolves the sole ACTIVE container instance of a cluster and the auto
//! scaling group behind it, and evaluates the convergence conditions the
//! orchestrator waits on.

use crate::cloud::{
    CapacityApi, ClusterApi, ContainerInstance, GroupMembership, InstanceQuery, InstanceStatus,
};
use crate::error::{OrchestratorError, Result};
use crate::waiter::{ConditionWaiter, PollOutcome, WaitReport};
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// A state some container instance must reach
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    /// Which instances to look at
    pub query: InstanceQuery,

    /// Status the instance must be in
    pub status: InstanceStatus,

    /// Exact running task count, if any
    pub running_tasks: Option<u32>,
}

impl Condition {
    /// A host other than `old_host` is ACTIVE
    pub fn replacement_active(old_host: &str) -> Self {
        Self {
            query: InstanceQuery::other_than(old_host),
            status: InstanceStatus::Active,
            running_tasks: None,
        }
    }

    /// `host` is DRAINING with no running tasks
    pub fn drained(host: &str) -> Self {
        Self {
            query: InstanceQuery::host(host),
            status: InstanceStatus::Draining,
            running_tasks: Some(0),
        }
    }

    /// A host other than `old_host` is ACTIVE and running exactly `running_tasks`
    pub fn workload_absorbed(old_host: &str, running_tasks: u32) -> Self {
        Self {
            query: InstanceQuery::other_than(old_host),
            status: InstanceStatus::Active,
            running_tasks: Some(running_tasks),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "container matching \"{}\" reaches \"{}\"", self.query, self.status)?;
        if let Some(count) = self.running_tasks {
            write!(f, " with {} running tasks", count)?;
        }
        Ok(())
    }
}

/// Result of evaluating a [`Condition`] once
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// The condition holds for this instance
    Matched(ContainerInstance),
    /// The condition does not hold yet
    NotYet(String),
}

/// An instance that satisfied a [`Condition`], and how long it took
#[derive(Debug, Clone)]
pub struct Converged {
    /// The matching instance as last observed
    pub instance: ContainerInstance,

    /// Wait statistics
    pub report: WaitReport,
}

/// Read-only view of the cluster and its auto scaling group
#[derive(Clone)]
pub struct InstanceInspector {
    cluster_api: Arc<dyn ClusterApi>,
    capacity_api: Arc<dyn CapacityApi>,
}

impl InstanceInspector {
    /// Create an inspector over the given collaborators
    pub fn new(cluster_api: Arc<dyn ClusterApi>, capacity_api: Arc<dyn CapacityApi>) -> Self {
        Self {
            cluster_api,
            capacity_api,
        }
    }

    async fn describe_matching(
        &self,
        cluster: &str,
        query: &InstanceQuery,
    ) -> Result<Vec<ContainerInstance>> {
        let arns = self
            .cluster_api
            .list_container_instances(cluster, query)
            .await?;

        if arns.is_empty() {
            return Ok(Vec::new());
        }

        self.cluster_api
            .describe_container_instances(cluster, &arns)
            .await
    }

    /// Find the one ACTIVE container instance of `cluster`
    ///
    /// Fails with [`OrchestratorError::MultipleInstancesUnsupported`] or
    /// [`OrchestratorError::NoInstancesFound`] otherwise. The count comes from
    /// the listing, so an instance that cannot be described still counts.
    pub async fn find_sole_active_instance(&self, cluster: &str) -> Result<ContainerInstance> {
        let arns = self
            .cluster_api
            .list_container_instances(cluster, &InstanceQuery::active())
            .await?;

        debug!(cluster = %cluster, count = arns.len(), "Listed active container instances");

        match arns.len() {
            0 => {
                return Err(OrchestratorError::NoInstancesFound {
                    cluster: cluster.to_string(),
                });
            }
            1 => {}
            count => return Err(OrchestratorError::MultipleInstancesUnsupported { count }),
        }

        self.cluster_api
            .describe_container_instances(cluster, &arns)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                OrchestratorError::AwsService(format!(
                    "Container instance {} was listed but could not be described",
                    arns[0]
                ))
            })
    }

    /// Find the auto scaling group that owns `host_id`
    pub async fn locate_group(&self, host_id: &str) -> Result<GroupMembership> {
        self.capacity_api
            .describe_membership(host_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotInAutoScalingGroup {
                host: host_id.to_string(),
            })
    }

    /// Evaluate `condition` once
    pub async fn probe(&self, cluster: &str, condition: &Condition) -> Result<Observation> {
        let instances = self.describe_matching(cluster, &condition.query).await?;

        let Some(first) = instances.first() else {
            return Ok(Observation::NotYet(format!(
                "No container instance matching \"{}\" yet",
                condition.query
            )));
        };

        let Some(instance) = instances.iter().find(|i| i.status == condition.status) else {
            return Ok(Observation::NotYet(format!(
                "Instance \"{}\" still in \"{}\" state, wanting \"{}\"",
                first.host_id, first.status, condition.status
            )));
        };

        if let Some(target) = condition.running_tasks {
            if instance.running_task_count != target {
                return Ok(Observation::NotYet(format!(
                    "Instance \"{}\" has {} of a targeted {} running tasks",
                    instance.host_id, instance.running_task_count, target
                )));
            }
        }

        Ok(Observation::Matched(instance.clone()))
    }

    /// Poll until `condition` holds and return the instance that satisfied it
    pub async fn wait_for(
        &self,
        waiter: &ConditionWaiter,
        cluster: &str,
        condition: &Condition,
        wait_before_first_poll: bool,
    ) -> Result<Converged> {
        let matched = OnceLock::new();
        let slot = &matched;
        let description = condition.to_string();

        let report = waiter
            .wait_until(&description, wait_before_first_poll, move || async move {
                match self.probe(cluster, condition).await? {
                    Observation::Matched(instance) => {
                        let _ = slot.set(instance);
                        Ok(PollOutcome::Satisfied)
                    }
                    Observation::NotYet(reason) => Ok(PollOutcome::pending(reason)),
                }
            })
            .await?;

        let instance = matched
            .into_inner()
            .ok_or(OrchestratorError::MissingField("matched container instance"))?;

        Ok(Converged { instance, report })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::CapacityRequest;
    use crate::memory::{active_instance, InMemoryCloud};
    use crate::waiter::RetryPolicy;
    use std::time::Duration;

    fn inspector(cloud: &InMemoryCloud) -> InstanceInspector {
        InstanceInspector::new(Arc::new(cloud.clone()), Arc::new(cloud.clone()))
    }

    fn cloud_with(instances: &[(&str, u32)]) -> InMemoryCloud {
        let mut cloud = InMemoryCloud::new().with_group("asg1", "c1", CapacityRequest::fixed(1));
        for (host, running) in instances {
            cloud = cloud
                .with_instance("c1", active_instance("c1", host, *running))
                .with_member("asg1", host, true);
        }
        cloud
    }

    #[tokio::test]
    async fn test_sole_instance_found() {
        let cloud = cloud_with(&[("i-old", 3)]);
        let instance = inspector(&cloud).find_sole_active_instance("c1").await.unwrap();
        assert_eq!(instance.host_id, "i-old");
        assert_eq!(instance.running_task_count, 3);
    }

    #[tokio::test]
    async fn test_multiple_instances_rejected() {
        let cloud = cloud_with(&[("i-a", 1), ("i-b", 1), ("i-c", 0)]);
        let err = inspector(&cloud).find_sole_active_instance("c1").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::MultipleInstancesUnsupported { count: 3 }));
    }

    #[tokio::test]
    async fn test_empty_cluster_rejected() {
        let cloud = cloud_with(&[]);
        let err = inspector(&cloud).find_sole_active_instance("c1").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NoInstancesFound { .. }));
    }

    /// Lists normally but describes at most `limit` instances
    struct PartialDescribe {
        cloud: InMemoryCloud,
        limit: usize,
    }

    #[async_trait::async_trait]
    impl ClusterApi for PartialDescribe {
        async fn list_container_instances(
            &self,
            cluster: &str,
            query: &InstanceQuery,
        ) -> Result<Vec<String>> {
            self.cloud.list_container_instances(cluster, query).await
        }

        async fn describe_container_instances(
            &self,
            cluster: &str,
            arns: &[String],
        ) -> Result<Vec<ContainerInstance>> {
            let mut described = self.cloud.describe_container_instances(cluster, arns).await?;
            described.truncate(self.limit);
            Ok(described)
        }

        async fn update_instance_status(
            &self,
            cluster: &str,
            arn: &str,
            status: InstanceStatus,
        ) -> Result<()> {
            self.cloud.update_instance_status(cluster, arn, status).await
        }
    }

    fn partial_inspector(cloud: &InMemoryCloud, limit: usize) -> InstanceInspector {
        let cluster_api = PartialDescribe {
            cloud: cloud.clone(),
            limit,
        };
        InstanceInspector::new(Arc::new(cluster_api), Arc::new(cloud.clone()))
    }

    #[tokio::test]
    async fn test_undescribed_instance_still_counts() {
        let cloud = cloud_with(&[("i-old", 3), ("i-other", 1)]);

        let err = partial_inspector(&cloud, 1)
            .find_sole_active_instance("c1")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::MultipleInstancesUnsupported { count: 2 }));
    }

    #[tokio::test]
    async fn test_listed_but_undescribed_sole_instance() {
        let cloud = cloud_with(&[("i-old", 3)]);

        let err = partial_inspector(&cloud, 0)
            .find_sole_active_instance("c1")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::AwsService(ref m) if m.contains("could not be described")));
        assert!(!err.is_precondition());
    }

    #[tokio::test]
    async fn test_locate_group() {
        let cloud = cloud_with(&[("i-old", 3)]);
        let membership = inspector(&cloud).locate_group("i-old").await.unwrap();
        assert_eq!(membership.group_name, "asg1");

        let err = inspector(&cloud).locate_group("i-stray").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotInAutoScalingGroup { .. }));
    }

    #[tokio::test]
    async fn test_probe_reports_reasons() {
        let cloud = cloud_with(&[("i-old", 3)]);
        let inspector = inspector(&cloud);

        let observation = inspector
            .probe("c1", &Condition::replacement_active("i-old"))
            .await
            .unwrap();
        assert!(matches!(observation, Observation::NotYet(ref r) if r.contains("No container instance")));

        let observation = inspector.probe("c1", &Condition::drained("i-old")).await.unwrap();
        assert!(matches!(observation, Observation::NotYet(ref r) if r.contains("still in \"ACTIVE\"")));

        let observation = inspector
            .probe("c1", &Condition::workload_absorbed("i-other", 2))
            .await
            .unwrap();
        assert!(matches!(observation, Observation::NotYet(ref r) if r.contains("3 of a targeted 2")));

        let observation = inspector
            .probe("c1", &Condition::workload_absorbed("i-other", 3))
            .await
            .unwrap();
        assert!(matches!(observation, Observation::Matched(ref i) if i.host_id == "i-old"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_survives_failing_queries() {
        let cloud = cloud_with(&[("i-old", 3)]).with_failing_queries(2);
        let waiter = ConditionWaiter::new(RetryPolicy::unbounded(Duration::from_secs(60)));

        let converged = inspector(&cloud)
            .wait_for(&waiter, "c1", &Condition::workload_absorbed("i-new", 3), false)
            .await
            .unwrap();

        assert_eq!(converged.instance.host_id, "i-old");
        assert_eq!(converged.report.attempts, 3);
        assert_eq!(cloud.list_calls(), 3);
    }

    #[test]
    fn test_condition_display() {
        let condition = Condition::workload_absorbed("i-old", 3);
        assert_eq!(
            condition.to_string(),
            "container matching \"ec2InstanceId != i-old\" reaches \"ACTIVE\" with 3 running tasks"
        );
    }
}
