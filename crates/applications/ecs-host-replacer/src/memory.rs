//! In-memory ECS cluster and auto scaling group for testing.
//!
//! [`InMemoryCloud`] implements both [`ClusterApi`] and [`CapacityApi`] over a
//! single simulated control plane, so one value can be handed to the
//! orchestrator as both collaborators.
//!
//! ## Simulation Model
//!
//! Time advances one tick per `describe_container_instances` call:
//!
//! - Raising a group's desired capacity launches new hosts that start
//!   `REGISTERING` and turn `ACTIVE` after `registration_ticks` ticks
//! - Each tick moves up to `tasks_per_tick` running tasks from every
//!   `DRAINING` instance onto the first `ACTIVE` instance of the same cluster
//! - Lowering capacity only records the new sizes; container instances are
//!   never removed
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: no persistence, single process
//! - Scale-in is not simulated

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::cloud::{
    CapacityApi, CapacityRequest, ClusterApi, ContainerInstance, GroupMembership, InstanceQuery,
    InstanceStatus,
};
use crate::error::{OrchestratorError, Result};

/// A mutating call received by the simulated control plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// `set_scale_in_protection`
    SetProtection {
        /// EC2 instance ID
        host_id: String,
        /// Group name
        group_name: String,
        /// Requested flag
        protected: bool,
    },
    /// `update_capacity`
    UpdateCapacity {
        /// Group name
        group_name: String,
        /// Requested sizes
        request: CapacityRequest,
    },
    /// `update_instance_status`
    UpdateStatus {
        /// Cluster name
        cluster: String,
        /// Container instance ARN
        arn: String,
        /// Requested status
        status: InstanceStatus,
    },
}

/// Current sizes of a simulated group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupSnapshot {
    /// Minimum size
    pub min_size: u32,
    /// Maximum size
    pub max_size: u32,
    /// Desired size
    pub desired_capacity: u32,
    /// Default protection for newly launched members
    pub new_instances_protected: bool,
}

#[derive(Debug)]
struct SimGroup {
    cluster: String,
    sizes: GroupSnapshot,
    members: BTreeMap<String, bool>,
}

#[derive(Debug)]
struct SimInstance {
    cluster: String,
    record: ContainerInstance,
    registering_ticks: u32,
}

#[derive(Debug, Default)]
struct CloudState {
    instances: Vec<SimInstance>,
    groups: HashMap<String, SimGroup>,
    mutations: Vec<Mutation>,
    failing_queries: u32,
    list_calls: u32,
    launched: u32,
}

/// Simulated ECS + Auto Scaling control plane
#[derive(Debug, Clone)]
pub struct InMemoryCloud {
    state: Arc<Mutex<CloudState>>,
    registration_ticks: u32,
    tasks_per_tick: u32,
}

impl Default for InMemoryCloud {
    fn default() -> Self {
        Self::new()
    }
}

fn poison_err<T>(_: PoisonError<T>) -> OrchestratorError {
    OrchestratorError::config("in-memory cloud lock poisoned")
}

/// Container instance ARN used by the simulation
pub fn container_instance_arn(cluster: &str, host_id: &str) -> String {
    format!(
        "arn:aws:ecs:us-east-1:000000000000:container-instance/{}/{}",
        cluster, host_id
    )
}

/// An `ACTIVE` container instance with no pending tasks
pub fn active_instance(cluster: &str, host_id: &str, running_task_count: u32) -> ContainerInstance {
    ContainerInstance {
        arn: container_instance_arn(cluster, host_id),
        host_id: host_id.to_string(),
        status: InstanceStatus::Active,
        pending_task_count: 0,
        running_task_count,
    }
}

impl InMemoryCloud {
    /// Create an empty control plane
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(CloudState::default())),
            registration_ticks: 1,
            tasks_per_tick: 1,
        }
    }

    /// Ticks a launched host spends `REGISTERING`
    pub fn with_registration_ticks(mut self, ticks: u32) -> Self {
        self.registration_ticks = ticks;
        self
    }

    /// Tasks moved off each draining instance per tick
    pub fn with_tasks_per_tick(mut self, tasks: u32) -> Self {
        self.tasks_per_tick = tasks.max(1);
        self
    }

    /// Add an auto scaling group backing `cluster`
    pub fn with_group(self, group_name: &str, cluster: &str, sizes: CapacityRequest) -> Self {
        self.locked().groups.insert(
            group_name.to_string(),
            SimGroup {
                cluster: cluster.to_string(),
                sizes: GroupSnapshot {
                    min_size: sizes.min_size,
                    max_size: sizes.max_size,
                    desired_capacity: sizes.desired_capacity,
                    new_instances_protected: sizes.protect_new_instances.unwrap_or(false),
                },
                members: BTreeMap::new(),
            },
        );
        self
    }

    /// Register a container instance with `cluster`
    pub fn with_instance(self, cluster: &str, record: ContainerInstance) -> Self {
        self.locked().instances.push(SimInstance {
            cluster: cluster.to_string(),
            record,
            registering_ticks: 0,
        });
        self
    }

    /// Make `host_id` a member of `group_name`
    pub fn with_member(self, group_name: &str, host_id: &str, protected: bool) -> Self {
        if let Some(group) = self.locked().groups.get_mut(group_name) {
            group.members.insert(host_id.to_string(), protected);
        }
        self
    }

    /// Fail the next `count` list calls with a transient error
    pub fn with_failing_queries(self, count: u32) -> Self {
        self.fail_next_queries(count);
        self
    }

    /// Fail the next `count` list calls from now on, replacing any pending count
    pub fn fail_next_queries(&self, count: u32) {
        self.locked().failing_queries = count;
    }

    /// Every mutating call received so far, in order
    pub fn mutations(&self) -> Vec<Mutation> {
        self.locked().mutations.clone()
    }

    /// Number of list calls received so far
    pub fn list_calls(&self) -> u32 {
        self.locked().list_calls
    }

    /// Current record for the container instance backed by `host_id`
    pub fn instance(&self, host_id: &str) -> Option<ContainerInstance> {
        self.locked()
            .instances
            .iter()
            .find(|i| i.record.host_id == host_id)
            .map(|i| i.record.clone())
    }

    /// Every container instance registered with `cluster`
    pub fn instances(&self, cluster: &str) -> Vec<ContainerInstance> {
        self.locked()
            .instances
            .iter()
            .filter(|i| i.cluster == cluster)
            .map(|i| i.record.clone())
            .collect()
    }

    /// Current sizes of `group_name`
    pub fn group(&self, group_name: &str) -> Option<GroupSnapshot> {
        self.locked().groups.get(group_name).map(|g| g.sizes)
    }

    /// Scale-in protection of `host_id`, if it belongs to a group
    pub fn is_protected(&self, host_id: &str) -> Option<bool> {
        self.locked()
            .groups
            .values()
            .find_map(|g| g.members.get(host_id).copied())
    }

    fn locked(&self) -> MutexGuard<'_, CloudState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_lock(&self) -> Result<MutexGuard<'_, CloudState>> {
        self.state.lock().map_err(poison_err)
    }

    fn tick(&self, state: &mut CloudState) {
        for instance in state.instances.iter_mut() {
            if instance.record.status == InstanceStatus::Registering {
                instance.registering_ticks = instance.registering_ticks.saturating_sub(1);
                if instance.registering_ticks == 0 {
                    instance.record.status = InstanceStatus::Active;
                }
            }
        }

        let draining: Vec<usize> = state
            .instances
            .iter()
            .enumerate()
            .filter(|(_, i)| i.record.status == InstanceStatus::Draining && i.record.running_task_count > 0)
            .map(|(idx, _)| idx)
            .collect();

        for from in draining {
            let cluster = state.instances[from].cluster.clone();
            let Some(to) = state
                .instances
                .iter()
                .position(|i| i.cluster == cluster && i.record.status == InstanceStatus::Active)
            else {
                continue;
            };

            let moved = self.tasks_per_tick.min(state.instances[from].record.running_task_count);
            state.instances[from].record.running_task_count -= moved;
            state.instances[to].record.running_task_count += moved;
        }
    }

    fn launch(&self, state: &mut CloudState, group_name: &str, count: u32) {
        for _ in 0..count {
            state.launched += 1;
            let host_id = format!("i-sim{:04}", state.launched);

            let Some(group) = state.groups.get_mut(group_name) else {
                return;
            };
            group
                .members
                .insert(host_id.clone(), group.sizes.new_instances_protected);
            let cluster = group.cluster.clone();

            let (status, registering_ticks) = if self.registration_ticks == 0 {
                (InstanceStatus::Active, 0)
            } else {
                (InstanceStatus::Registering, self.registration_ticks)
            };

            state.instances.push(SimInstance {
                record: ContainerInstance {
                    arn: container_instance_arn(&cluster, &host_id),
                    host_id,
                    status,
                    pending_task_count: 0,
                    running_task_count: 0,
                },
                cluster,
                registering_ticks,
            });
        }
    }
}

#[async_trait]
impl ClusterApi for InMemoryCloud {
    async fn list_container_instances(
        &self,
        cluster: &str,
        query: &InstanceQuery,
    ) -> Result<Vec<String>> {
        let mut state = self.try_lock()?;
        state.list_calls += 1;

        if state.failing_queries > 0 {
            state.failing_queries -= 1;
            return Err(OrchestratorError::from_aws("ThrottlingException: Rate exceeded"));
        }

        Ok(state
            .instances
            .iter()
            .filter(|i| i.cluster == cluster && query.matches(&i.record))
            .map(|i| i.record.arn.clone())
            .collect())
    }

    async fn describe_container_instances(
        &self,
        cluster: &str,
        arns: &[String],
    ) -> Result<Vec<ContainerInstance>> {
        let mut state = self.try_lock()?;
        self.tick(&mut state);

        Ok(arns
            .iter()
            .filter_map(|arn| {
                state
                    .instances
                    .iter()
                    .find(|i| i.cluster == cluster && &i.record.arn == arn)
                    .map(|i| i.record.clone())
            })
            .collect())
    }

    async fn update_instance_status(
        &self,
        cluster: &str,
        arn: &str,
        status: InstanceStatus,
    ) -> Result<()> {
        let mut state = self.try_lock()?;
        state.mutations.push(Mutation::UpdateStatus {
            cluster: cluster.to_string(),
            arn: arn.to_string(),
            status,
        });

        let instance = state
            .instances
            .iter_mut()
            .find(|i| i.cluster == cluster && i.record.arn == arn)
            .ok_or_else(|| {
                OrchestratorError::from_aws(format!("InvalidParameterException: unknown container instance {}", arn))
            })?;
        instance.record.status = status;
        Ok(())
    }
}

#[async_trait]
impl CapacityApi for InMemoryCloud {
    async fn describe_membership(&self, host_id: &str) -> Result<Option<GroupMembership>> {
        let state = self.try_lock()?;
        Ok(state.groups.iter().find_map(|(name, group)| {
            group.members.get(host_id).map(|protected| GroupMembership {
                host_id: host_id.to_string(),
                group_name: name.clone(),
                protected_from_scale_in: *protected,
            })
        }))
    }

    async fn set_scale_in_protection(
        &self,
        host_id: &str,
        group_name: &str,
        protected: bool,
    ) -> Result<()> {
        let mut state = self.try_lock()?;
        state.mutations.push(Mutation::SetProtection {
            host_id: host_id.to_string(),
            group_name: group_name.to_string(),
            protected,
        });

        let flag = state
            .groups
            .get_mut(group_name)
            .and_then(|g| g.members.get_mut(host_id))
            .ok_or_else(|| {
                OrchestratorError::from_aws(format!(
                    "ValidationError: instance {} is not in group {}",
                    host_id, group_name
                ))
            })?;
        *flag = protected;
        Ok(())
    }

    async fn update_capacity(&self, group_name: &str, request: &CapacityRequest) -> Result<()> {
        let mut state = self.try_lock()?;
        state.mutations.push(Mutation::UpdateCapacity {
            group_name: group_name.to_string(),
            request: *request,
        });

        request
            .validate()
            .map_err(|e| OrchestratorError::from_aws(format!("ValidationError: {}", e)))?;

        let group = state.groups.get_mut(group_name).ok_or_else(|| {
            OrchestratorError::from_aws(format!("ValidationError: group {} not found", group_name))
        })?;

        group.sizes.min_size = request.min_size;
        group.sizes.max_size = request.max_size;
        group.sizes.desired_capacity = request.desired_capacity;
        if let Some(protect) = request.protect_new_instances {
            group.sizes.new_instances_protected = protect;
        }

        let members = group.members.len() as u32;
        let missing = request.desired_capacity.saturating_sub(members);
        if missing > 0 {
            self.launch(&mut state, group_name, missing);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_host_cloud() -> InMemoryCloud {
        InMemoryCloud::new()
            .with_group("asg1", "c1", CapacityRequest::fixed(1))
            .with_instance("c1", active_instance("c1", "i-old", 3))
            .with_member("asg1", "i-old", true)
    }

    #[tokio::test]
    async fn test_expanding_launches_protected_host() {
        let cloud = single_host_cloud();
        cloud
            .update_capacity("asg1", &CapacityRequest::fixed(2).with_new_instance_protection(true))
            .await
            .unwrap();

        let instances = cloud.instances("c1");
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[1].status, InstanceStatus::Registering);
        assert_eq!(cloud.is_protected(&instances[1].host_id), Some(true));

        let arns = vec![instances[1].arn.clone()];
        let described = cloud.describe_container_instances("c1", &arns).await.unwrap();
        assert_eq!(described[0].status, InstanceStatus::Active);
    }

    #[tokio::test]
    async fn test_draining_moves_tasks_to_active_instance() {
        let cloud = single_host_cloud()
            .with_registration_ticks(0)
            .with_tasks_per_tick(2);
        cloud
            .update_capacity("asg1", &CapacityRequest::fixed(2))
            .await
            .unwrap();

        let old = cloud.instance("i-old").unwrap();
        cloud
            .update_instance_status("c1", &old.arn, InstanceStatus::Draining)
            .await
            .unwrap();

        let arns = vec![old.arn.clone()];
        cloud.describe_container_instances("c1", &arns).await.unwrap();
        assert_eq!(cloud.instance("i-old").unwrap().running_task_count, 1);
        cloud.describe_container_instances("c1", &arns).await.unwrap();
        assert_eq!(cloud.instance("i-old").unwrap().running_task_count, 0);
        assert_eq!(cloud.instance("i-sim0001").unwrap().running_task_count, 3);
    }

    #[tokio::test]
    async fn test_failing_queries_then_recovery() {
        let cloud = single_host_cloud().with_failing_queries(2);
        let query = InstanceQuery::active();

        assert!(cloud.list_container_instances("c1", &query).await.is_err());
        assert!(cloud.list_container_instances("c1", &query).await.is_err());
        assert_eq!(cloud.list_container_instances("c1", &query).await.unwrap().len(), 1);
        assert_eq!(cloud.list_calls(), 3);
    }

    #[tokio::test]
    async fn test_failures_injected_through_shared_handle() {
        let cloud = single_host_cloud();
        let handle = cloud.clone();
        let query = InstanceQuery::active();

        assert!(cloud.list_container_instances("c1", &query).await.is_ok());
        handle.fail_next_queries(1);
        assert!(cloud.list_container_instances("c1", &query).await.is_err());
        assert!(cloud.list_container_instances("c1", &query).await.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_capacity_rejected() {
        let cloud = single_host_cloud();
        let bad = CapacityRequest {
            min_size: 3,
            max_size: 1,
            desired_capacity: 2,
            protect_new_instances: None,
        };
        assert!(cloud.update_capacity("asg1", &bad).await.is_err());
        assert_eq!(cloud.group("asg1").unwrap().desired_capacity, 1);
    }

    #[test]
    fn test_membership_lookup() {
        let cloud = single_host_cloud();
        let membership = tokio_test::block_on(cloud.describe_membership("i-old"))
            .unwrap()
            .unwrap();
        assert_eq!(membership.group_name, "asg1");
        assert!(membership.protected_from_scale_in);

        let missing = tokio_test::block_on(cloud.describe_membership("i-nope")).unwrap();
        assert!(missing.is_none());
    }
}
