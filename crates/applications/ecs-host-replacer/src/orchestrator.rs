//! Host replacement orchestration
//!
//! Replaces the single EC2 host behind an ECS cluster by growing its auto
//! scaling group, moving the tasks, and shrinking the group again:
//!
//! ```text
//! Inspect ─┬─> ClearProtection ─> ExpandCapacity ─> AwaitReplacement
//!          │                                              │
//!          └─> Aborted                                    v
//!                            Declined <─ no ── ConfirmReplacement
//!                                                         │ yes
//!                                                         v
//!        AwaitNewActive <─ AwaitDrained <─────────── DrainOld
//!             │
//!             v
//!       ConfirmRemoval ── no ─> Declined
//!             │ yes
//!             v
//!       ShrinkCapacity ─> Done
//! ```
//!
//! ## Key Design Decisions
//!
//! - **Refuse early**: zero or several ACTIVE instances, pending tasks, or a
//!   host outside any auto scaling group end the run before any mutation
//! - **Forward only**: aborts and declines never undo earlier steps
//! - **Literal task count**: the replacement must run exactly as many tasks as
//!   the old host did at inspection time
//! - **One session per cluster**: nothing prevents two concurrent runs against
//!   the same cluster; doing so is unsupported
//!
//! If the process is killed mid-run the cluster stays in whatever state the
//! last completed step left it; check ECS and the group before retrying.

use crate::capacity::CapacityController;
use crate::cloud::{CapacityApi, ClusterApi, ContainerInstance, GroupMembership};
use crate::confirm::ConfirmationGate;
use crate::drain::DrainController;
use crate::error::{OrchestratorError, Result};
use crate::inspector::{Condition, InstanceInspector};
use crate::notify::{Notifier, TracingNotifier};
use crate::protection::{ProtectionChange, ProtectionController};
use crate::waiter::{ConditionWaiter, RetryPolicy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, info_span};
use uuid::Uuid;

/// Group size while old and new hosts overlap
pub const EXPANDED_GROUP_SIZE: u32 = 2;

/// Group size once the old host is released
pub const RESTORED_GROUP_SIZE: u32 = 1;

/// Configuration for the orchestrator
#[derive(Debug, Clone)]
pub struct ReplacementConfig {
    /// Polling behavior for every wait
    pub retry_policy: RetryPolicy,

    /// min/max/desired while both hosts run
    pub expanded_size: u32,

    /// min/max/desired after the old host is released
    pub restored_size: u32,
}

impl Default for ReplacementConfig {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            expanded_size: EXPANDED_GROUP_SIZE,
            restored_size: RESTORED_GROUP_SIZE,
        }
    }
}

impl ReplacementConfig {
    /// Set retry policy
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set the base poll interval, keeping the rest of the retry policy
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.retry_policy.interval = interval;
        self
    }
}

/// Why a run refused to start mutating
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbortReason {
    /// Cluster has no ACTIVE container instance
    NoInstances,
    /// Cluster has more than one ACTIVE container instance
    MultipleInstances {
        /// Number found
        count: usize,
    },
    /// The host still has tasks waiting to start
    PendingTasks {
        /// EC2 instance ID
        host: String,
        /// Pending task count
        count: u32,
    },
    /// The host does not belong to an auto scaling group
    NotInAutoScalingGroup {
        /// EC2 instance ID
        host: String,
    },
}

impl AbortReason {
    /// Map a precondition error to its abort reason
    pub fn from_error(err: &OrchestratorError) -> Option<Self> {
        match err {
            OrchestratorError::NoInstancesFound { .. } => Some(Self::NoInstances),
            OrchestratorError::MultipleInstancesUnsupported { count } => {
                Some(Self::MultipleInstances { count: *count })
            }
            OrchestratorError::NotInAutoScalingGroup { host } => {
                Some(Self::NotInAutoScalingGroup { host: host.clone() })
            }
            _ => None,
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoInstances => write!(f, "no active container instance found"),
            Self::MultipleInstances { count } => write!(
                f,
                "found {} active container instances, only single-instance clusters are handled",
                count
            ),
            Self::PendingTasks { host, count } => {
                write!(f, "instance \"{}\" has {} pending tasks", host, count)
            }
            Self::NotInAutoScalingGroup { host } => {
                write!(f, "instance \"{}\" is not in an auto scaling group", host)
            }
        }
    }
}

/// Operator approval points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Checkpoint {
    /// Group expanded, replacement host is ACTIVE
    ReplacementReady,
    /// Old host drained, replacement carries the workload
    RemoveOldInstance,
}

impl Checkpoint {
    /// Question put to the operator
    pub fn question(&self) -> &'static str {
        match self {
            Self::ReplacementReady => "asg updated - new instance should exist. Proceed?",
            Self::RemoveOldInstance => {
                "new instance active, all tasks drained from old. Remove old instance?"
            }
        }
    }
}

/// Replacement state machine phases
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    /// Resolve the sole ACTIVE instance and its group
    Inspect,
    /// Drop scale-in protection from the old host
    ClearProtection,
    /// Grow the group so a replacement launches
    ExpandCapacity,
    /// Wait for another host to turn ACTIVE
    AwaitReplacement,
    /// First operator checkpoint
    ConfirmReplacement,
    /// Request DRAINING for the old host
    DrainOld,
    /// Wait for the old host to run zero tasks
    AwaitDrained,
    /// Wait for the replacement to run the original task count
    AwaitNewActive,
    /// Second operator checkpoint
    ConfirmRemoval,
    /// Shrink the group back
    ShrinkCapacity,
    /// Replacement finished
    Done,
    /// Refused before any mutation
    Aborted(AbortReason),
    /// Operator said no
    Declined(Checkpoint),
}

impl Phase {
    /// Whether the machine stops here
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Aborted(_) | Self::Declined(_))
    }

    /// Short phase name for logs and reports
    pub fn name(&self) -> &'static str {
        match self {
            Self::Inspect => "inspect",
            Self::ClearProtection => "clear_protection",
            Self::ExpandCapacity => "expand_capacity",
            Self::AwaitReplacement => "await_replacement",
            Self::ConfirmReplacement => "confirm_replacement",
            Self::DrainOld => "drain_old",
            Self::AwaitDrained => "await_drained",
            Self::AwaitNewActive => "await_new_active",
            Self::ConfirmRemoval => "confirm_removal",
            Self::ShrinkCapacity => "shrink_capacity",
            Self::Done => "done",
            Self::Aborted(_) => "aborted",
            Self::Declined(_) => "declined",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Working state of one replacement run
#[derive(Debug, Clone)]
pub struct ReplacementSession {
    /// Session ID, attached to every log line of the run
    pub id: Uuid,

    /// Cluster being worked on
    pub cluster_name: String,

    /// Container instance being replaced, once inspected
    pub target: Option<ContainerInstance>,

    /// Auto scaling group owning the target host, once inspected
    pub group_name: Option<String>,

    /// Running tasks on the target at inspection; the replacement must reach it
    pub original_running_task_count: u32,

    /// Host ID of the replacement once observed
    pub replacement_host: Option<String>,

    /// Current phase
    pub phase: Phase,

    /// Time spent in each completed phase
    pub phase_times: Vec<PhaseTime>,

    /// When the run started
    pub started_at: DateTime<Utc>,
}

impl ReplacementSession {
    /// Fresh session about to inspect `cluster_name`
    pub fn new(id: Uuid, cluster_name: impl Into<String>) -> Self {
        Self {
            id,
            cluster_name: cluster_name.into(),
            target: None,
            group_name: None,
            original_running_task_count: 0,
            replacement_host: None,
            phase: Phase::Inspect,
            phase_times: Vec::new(),
            started_at: Utc::now(),
        }
    }

    /// Inspected target instance
    pub fn target(&self) -> Result<&ContainerInstance> {
        self.target
            .as_ref()
            .ok_or(OrchestratorError::MissingField("inspected target instance"))
    }

    /// Inspected auto scaling group name
    pub fn group_name(&self) -> Result<&str> {
        self.group_name
            .as_deref()
            .ok_or(OrchestratorError::MissingField("inspected group name"))
    }
}

/// Time spent in one phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTime {
    /// Phase name
    pub phase: String,

    /// Duration (seconds)
    pub secs: f64,
}

/// Terminal result of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReplacementOutcome {
    /// Old host drained, group back to its single-host size
    Completed {
        /// Host now carrying the workload
        replacement_host: String,
    },
    /// Refused before any mutation
    Aborted {
        /// Why
        reason: AbortReason,
    },
    /// Operator declined at a checkpoint
    Declined {
        /// Where
        checkpoint: Checkpoint,
    },
}

/// Summary of a finished run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplacementReport {
    /// Session ID
    pub session_id: Uuid,

    /// Cluster name
    pub cluster_name: String,

    /// When the run started
    pub started_at: DateTime<Utc>,

    /// Host that was (or would have been) replaced
    pub target_host: Option<String>,

    /// Group owning the target host
    pub group_name: Option<String>,

    /// How the run ended
    pub outcome: ReplacementOutcome,

    /// Terminal phase name
    pub final_phase: String,

    /// Time spent in each phase
    pub phase_times: Vec<PhaseTime>,

    /// Total run time in seconds
    pub total_time_secs: f64,
}

/// Read-only look at what a run would act on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplacementPlan {
    /// Cluster name
    pub cluster_name: String,

    /// The sole ACTIVE container instance, when there is exactly one
    pub target: Option<ContainerInstance>,

    /// Its auto scaling group membership
    pub membership: Option<GroupMembership>,

    /// Reason a run would refuse, if any
    pub blocked_by: Option<AbortReason>,
}

impl ReplacementPlan {
    /// Whether a run would get past inspection
    pub fn is_ready(&self) -> bool {
        self.blocked_by.is_none()
    }
}

enum Inspection {
    Ready {
        target: ContainerInstance,
        membership: GroupMembership,
    },
    Refused {
        reason: AbortReason,
        target: Option<ContainerInstance>,
        membership: Option<GroupMembership>,
    },
}

/// Drives one cluster through the replacement protocol
///
/// Collaborators are injected so the same machine runs against AWS or
/// against [`crate::memory::InMemoryCloud`].
pub struct Orchestrator {
    config: ReplacementConfig,
    inspector: InstanceInspector,
    protection: ProtectionController,
    capacity: CapacityController,
    drain: DrainController,
    waiter: ConditionWaiter,
    gate: Arc<dyn ConfirmationGate>,
    notifier: Arc<dyn Notifier>,
}

impl Orchestrator {
    /// Create an orchestrator with default configuration
    pub fn new(
        cluster_api: Arc<dyn ClusterApi>,
        capacity_api: Arc<dyn CapacityApi>,
        gate: Arc<dyn ConfirmationGate>,
    ) -> Self {
        let config = ReplacementConfig::default();

        Self {
            waiter: ConditionWaiter::new(config.retry_policy),
            inspector: InstanceInspector::new(cluster_api.clone(), capacity_api.clone()),
            protection: ProtectionController::new(capacity_api.clone()),
            capacity: CapacityController::new(capacity_api),
            drain: DrainController::new(cluster_api),
            gate,
            notifier: Arc::new(TracingNotifier),
            config,
        }
    }

    /// Use a custom configuration
    pub fn with_config(mut self, config: ReplacementConfig) -> Self {
        self.waiter = ConditionWaiter::new(config.retry_policy);
        self.config = config;
        self
    }

    /// Send progress narration somewhere other than `tracing`
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Get the current configuration
    pub fn config(&self) -> &ReplacementConfig {
        &self.config
    }

    /// Inspect `cluster` without changing anything
    pub async fn plan(&self, cluster: &str) -> Result<ReplacementPlan> {
        let plan = match self.inspect(cluster).await? {
            Inspection::Ready { target, membership } => ReplacementPlan {
                cluster_name: cluster.to_string(),
                target: Some(target),
                membership: Some(membership),
                blocked_by: None,
            },
            Inspection::Refused {
                reason,
                target,
                membership,
            } => ReplacementPlan {
                cluster_name: cluster.to_string(),
                target,
                membership,
                blocked_by: Some(reason),
            },
        };
        Ok(plan)
    }

    /// Replace the sole host of `cluster`
    ///
    /// Returns `Ok` for every terminal phase (done, aborted, declined). Remote
    /// failures outside the polling loops end the run with `Err`; nothing is
    /// rolled back.
    pub async fn run(&self, cluster: &str) -> Result<ReplacementReport> {
        let session_id = Uuid::new_v4();
        let span = info_span!("replacement", session_id = %session_id, cluster = %cluster);

        self.run_session(session_id, cluster).instrument(span).await
    }

    async fn run_session(&self, session_id: Uuid, cluster: &str) -> Result<ReplacementReport> {
        let start = Instant::now();
        let mut session = ReplacementSession::new(session_id, cluster);

        info!("Starting host replacement");

        while !session.phase.is_terminal() {
            let phase_start = Instant::now();
            let current = session.phase.clone();

            let next = match self.advance(&mut session).await {
                Ok(next) => next,
                Err(e) => {
                    error!(phase = %current, error = %e, "Replacement stopped");
                    self.notifier.notify(&format!(
                        "Replacement stopped during {}: {}. Check the cluster and group before retrying.",
                        current, e
                    ));
                    return Err(e);
                }
            };

            session.phase_times.push(PhaseTime {
                phase: current.name().to_string(),
                secs: phase_start.elapsed().as_secs_f64(),
            });
            debug!(from = %current, to = %next, "Phase transition");
            session.phase = next;
        }

        let outcome = match &session.phase {
            Phase::Declined(checkpoint) => {
                self.notifier.notify(&format!(
                    "Stopped at operator request; nothing was undone (checkpoint: {:?})",
                    checkpoint
                ));
                ReplacementOutcome::Declined {
                    checkpoint: *checkpoint,
                }
            }
            Phase::Aborted(reason) => ReplacementOutcome::Aborted {
                reason: reason.clone(),
            },
            _ => {
                let replacement_host = session
                    .replacement_host
                    .clone()
                    .ok_or(OrchestratorError::MissingField("replacement host"))?;
                self.notifier.notify(&format!(
                    "Host \"{}\" replaced by \"{}\" in cluster {}",
                    session.target()?.host_id,
                    replacement_host,
                    session.cluster_name
                ));
                ReplacementOutcome::Completed { replacement_host }
            }
        };

        let report = ReplacementReport {
            session_id: session.id,
            cluster_name: session.cluster_name,
            started_at: session.started_at,
            target_host: session.target.map(|t| t.host_id),
            group_name: session.group_name,
            outcome,
            final_phase: session.phase.name().to_string(),
            phase_times: session.phase_times,
            total_time_secs: start.elapsed().as_secs_f64(),
        };

        info!(
            outcome = ?report.outcome,
            total_time_secs = report.total_time_secs,
            "Host replacement finished"
        );

        Ok(report)
    }

    /// Run the transition for the session's current phase
    async fn advance(&self, session: &mut ReplacementSession) -> Result<Phase> {
        match session.phase.clone() {
            Phase::Inspect => self.inspect_cluster(session).await,
            Phase::ClearProtection => self.clear_protection(session).await,
            Phase::ExpandCapacity => self.expand_capacity(session).await,
            Phase::AwaitReplacement => self.await_replacement(session).await,
            Phase::ConfirmReplacement => {
                self.checkpoint(Checkpoint::ReplacementReady, Phase::DrainOld)
                    .await
            }
            Phase::DrainOld => self.drain_old(session).await,
            Phase::AwaitDrained => self.await_drained(session).await,
            Phase::AwaitNewActive => self.await_new_active(session).await,
            Phase::ConfirmRemoval => {
                self.checkpoint(Checkpoint::RemoveOldInstance, Phase::ShrinkCapacity)
                    .await
            }
            Phase::ShrinkCapacity => self.shrink_capacity(session).await,
            terminal => Ok(terminal),
        }
    }

    async fn inspect(&self, cluster: &str) -> Result<Inspection> {
        let target = match self.inspector.find_sole_active_instance(cluster).await {
            Ok(target) => target,
            Err(e) => return refuse(e, None),
        };

        info!(
            instance_id = %target.host_id,
            running_tasks = target.running_task_count,
            pending_tasks = target.pending_task_count,
            "Found sole active container instance"
        );

        if target.pending_task_count > 0 {
            return Ok(Inspection::Refused {
                reason: AbortReason::PendingTasks {
                    host: target.host_id.clone(),
                    count: target.pending_task_count,
                },
                target: Some(target),
                membership: None,
            });
        }

        let membership = match self.inspector.locate_group(&target.host_id).await {
            Ok(membership) => membership,
            Err(e) => return refuse(e, Some(target)),
        };

        Ok(Inspection::Ready { target, membership })
    }

    async fn inspect_cluster(&self, session: &mut ReplacementSession) -> Result<Phase> {
        match self.inspect(&session.cluster_name).await? {
            Inspection::Ready { target, membership } => {
                session.original_running_task_count = target.running_task_count;
                session.target = Some(target);
                session.group_name = Some(membership.group_name);
                Ok(Phase::ClearProtection)
            }
            Inspection::Refused {
                reason,
                target,
                membership,
            } => {
                self.notifier.notify(&format!(
                    "Not replacing host in cluster {}: {}",
                    session.cluster_name, reason
                ));
                session.target = target;
                session.group_name = membership.map(|m| m.group_name);
                Ok(Phase::Aborted(reason))
            }
        }
    }

    async fn clear_protection(&self, session: &ReplacementSession) -> Result<Phase> {
        let host = &session.target()?.host_id;
        let group = session.group_name()?;

        match self
            .protection
            .clear_scale_in_protection(host, group)
            .await?
        {
            ProtectionChange::AlreadyUnprotected => self.notifier.notify(&format!(
                "Instance \"{}\" in asg \"{}\" does not have scale-in protection, nothing to do..",
                host, group
            )),
            ProtectionChange::Cleared => self.notifier.notify(&format!(
                "Removed instance protection from instance \"{}\" in asg \"{}\"",
                host, group
            )),
        }

        Ok(Phase::ExpandCapacity)
    }

    async fn expand_capacity(&self, session: &ReplacementSession) -> Result<Phase> {
        self.notifier.notify(&format!(
            "Updating asg \"{}\" to have min/max/desired counts of {}..",
            session.group_name()?,
            self.config.expanded_size
        ));

        self.capacity
            .expand_for_replacement(session.group_name()?, self.config.expanded_size)
            .await?;
        Ok(Phase::AwaitReplacement)
    }

    async fn await_replacement(&self, session: &mut ReplacementSession) -> Result<Phase> {
        let condition = Condition::replacement_active(&session.target()?.host_id);
        self.notifier
            .notify(&format!("Waiting until {}", condition));

        let converged = self
            .inspector
            .wait_for(&self.waiter, &session.cluster_name, &condition, true)
            .await?;

        self.notifier.notify(&format!(
            "Replacement instance \"{}\" is ACTIVE",
            converged.instance.host_id
        ));
        session.replacement_host = Some(converged.instance.host_id);

        Ok(Phase::ConfirmReplacement)
    }

    async fn checkpoint(&self, checkpoint: Checkpoint, next: Phase) -> Result<Phase> {
        if self.gate.confirm(checkpoint.question()).await? {
            Ok(next)
        } else {
            info!(checkpoint = ?checkpoint, "Operator declined");
            Ok(Phase::Declined(checkpoint))
        }
    }

    async fn drain_old(&self, session: &ReplacementSession) -> Result<Phase> {
        self.notifier.notify(&format!(
            "Setting instance \"{}\" in cluster {} to DRAINING..",
            session.target()?.host_id,
            session.cluster_name
        ));

        self.drain
            .begin_draining(&session.cluster_name, session.target()?)
            .await?;
        Ok(Phase::AwaitDrained)
    }

    async fn await_drained(&self, session: &ReplacementSession) -> Result<Phase> {
        self.notifier.notify(&format!(
            "Waiting for instance \"{}\" to drain all tasks",
            session.target()?.host_id
        ));

        self.drain
            .wait_until_drained(
                &self.waiter,
                &self.inspector,
                &session.cluster_name,
                &session.target()?.host_id,
            )
            .await?;
        Ok(Phase::AwaitNewActive)
    }

    async fn await_new_active(&self, session: &mut ReplacementSession) -> Result<Phase> {
        let condition = Condition::workload_absorbed(
            &session.target()?.host_id,
            session.original_running_task_count,
        );
        self.notifier
            .notify(&format!("Waiting until {}", condition));

        // The drain wait already gave ECS time to reschedule
        let converged = self
            .inspector
            .wait_for(&self.waiter, &session.cluster_name, &condition, false)
            .await?;

        self.notifier.notify(&format!(
            "Instance \"{}\" has the targeted {} running tasks",
            converged.instance.host_id, session.original_running_task_count
        ));
        session.replacement_host = Some(converged.instance.host_id);

        Ok(Phase::ConfirmRemoval)
    }

    async fn shrink_capacity(&self, session: &ReplacementSession) -> Result<Phase> {
        self.notifier.notify(&format!(
            "Updating asg \"{}\" to have min/max/desired counts of {}..",
            session.group_name()?,
            self.config.restored_size
        ));

        self.capacity
            .restore_single(session.group_name()?, self.config.restored_size)
            .await?;
        Ok(Phase::Done)
    }
}

fn refuse(err: OrchestratorError, target: Option<ContainerInstance>) -> Result<Inspection> {
    match AbortReason::from_error(&err) {
        Some(reason) => Ok(Inspection::Refused {
            reason,
            target,
            membership: None,
        }),
        None => Err(err),
    }
}
