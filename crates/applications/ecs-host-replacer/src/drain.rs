//! Container instance draining
//!
//! Setting a container instance to DRAINING tells ECS to stop placing tasks on
//! it and to reschedule its service tasks elsewhere:
//! 1. Request the DRAINING transition
//! 2. Wait until the instance reports zero running tasks
//!
//! The transition is owned by ECS; this module only asks for it and watches.

use crate::cloud::{ClusterApi, ContainerInstance, InstanceStatus};
use crate::error::Result;
use crate::inspector::{Condition, InstanceInspector};
use crate::waiter::ConditionWaiter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Result of a completed drain wait
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainResult {
    /// EC2 instance that was drained
    pub instance_id: String,

    /// Polls it took to observe zero running tasks
    pub polls: u32,

    /// Time spent waiting (seconds)
    pub drain_time_secs: f64,
}

/// Moves a container instance to DRAINING and waits for it to empty
pub struct DrainController {
    cluster_api: Arc<dyn ClusterApi>,
}

impl DrainController {
    /// Create a drain controller
    pub fn new(cluster_api: Arc<dyn ClusterApi>) -> Self {
        Self { cluster_api }
    }

    /// Request the DRAINING transition for one container instance
    pub async fn begin_draining(&self, cluster: &str, instance: &ContainerInstance) -> Result<()> {
        info!(
            cluster = %cluster,
            instance_id = %instance.host_id,
            "Setting container instance to DRAINING"
        );

        self.cluster_api
            .update_instance_status(cluster, &instance.arn, InstanceStatus::Draining)
            .await
    }

    /// Wait until `host_id` is DRAINING with no running tasks
    ///
    /// Sleeps one poll interval before the first check so ECS can start
    /// rescheduling after the transition request.
    pub async fn wait_until_drained(
        &self,
        waiter: &ConditionWaiter,
        inspector: &InstanceInspector,
        cluster: &str,
        host_id: &str,
    ) -> Result<DrainResult> {
        let converged = inspector
            .wait_for(waiter, cluster, &Condition::drained(host_id), true)
            .await?;

        let result = DrainResult {
            instance_id: converged.instance.host_id,
            polls: converged.report.attempts,
            drain_time_secs: converged.report.elapsed.as_secs_f64(),
        };

        info!(
            instance_id = %result.instance_id,
            polls = result.polls,
            drain_time_secs = result.drain_time_secs,
            "All tasks drained"
        );

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::CapacityRequest;
    use crate::memory::{active_instance, InMemoryCloud};
    use crate::waiter::RetryPolicy;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_drain_until_empty() {
        let cloud = InMemoryCloud::new()
            .with_registration_ticks(0)
            .with_group("asg1", "c1", CapacityRequest::fixed(2))
            .with_instance("c1", active_instance("c1", "i-old", 3))
            .with_instance("c1", active_instance("c1", "i-new", 0))
            .with_member("asg1", "i-old", false)
            .with_member("asg1", "i-new", true);

        let inspector = InstanceInspector::new(Arc::new(cloud.clone()), Arc::new(cloud.clone()));
        let waiter = ConditionWaiter::new(RetryPolicy::unbounded(Duration::from_secs(60)));
        let drain = DrainController::new(Arc::new(cloud.clone()));

        let old = cloud.instance("i-old").unwrap();
        drain.begin_draining("c1", &old).await.unwrap();
        assert_eq!(cloud.instance("i-old").unwrap().status, InstanceStatus::Draining);

        let result = drain
            .wait_until_drained(&waiter, &inspector, "c1", "i-old")
            .await
            .unwrap();

        // One task moves per describe: 3 -> 2 -> 1 -> 0
        assert_eq!(result.instance_id, "i-old");
        assert_eq!(result.polls, 3);
        assert_eq!(result.drain_time_secs, 180.0);
        assert_eq!(cloud.instance("i-new").unwrap().running_task_count, 3);
    }

    #[test]
    fn test_drain_result_serialization() {
        let result = DrainResult {
            instance_id: "i-1234567890abcdef0".to_string(),
            polls: 4,
            drain_time_secs: 240.0,
        };

        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"polls\":4"));
        assert!(json.contains("\"drain_time_secs\":240.0"));
    }
}
