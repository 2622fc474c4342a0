//! # ECS Host Replacer
//!
//! Replaces the single EC2 host behind an ECS cluster without dropping its
//! tasks.
//!
//! ## Architecture
//!
//! ```text
//! Orchestrator (state machine)
//! ├── InstanceInspector    ──┐
//! ├── ProtectionController   │    ClusterApi  ── ECS
//! ├── CapacityController     ├──> CapacityApi ── Auto Scaling
//! ├── DrainController      ──┘
//! ├── ConditionWaiter        (poll + sleep)
//! ├── ConfirmationGate       (operator y/n)
//! └── Notifier               (progress narration)
//! ```
//!
//! ## Replacement Flow
//!
//! 1. **Inspect**: require exactly one ACTIVE instance, no pending tasks, and
//!    a backing auto scaling group
//! 2. **Expand**: clear scale-in protection on the old host, grow the group to
//!    two with new hosts born protected
//! 3. **Confirm**: operator approves once the replacement is ACTIVE
//! 4. **Drain**: move the old host to DRAINING and wait for its tasks to land
//!    on the replacement
//! 5. **Confirm**: operator approves removal
//! 6. **Shrink**: pin the group back to one; Auto Scaling removes the
//!    unprotected old host
//!
//! See [`orchestrator`] for the state machine.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aws;
pub mod capacity;
pub mod cloud;
pub mod confirm;
pub mod drain;
pub mod error;
pub mod inspector;
pub mod memory;
pub mod notify;
pub mod orchestrator;
pub mod protection;
pub mod waiter;

// ============================================================================
// Public exports - Orchestration
// ============================================================================

pub use orchestrator::{
    AbortReason, Checkpoint, Orchestrator, Phase, PhaseTime, ReplacementConfig,
    ReplacementOutcome, ReplacementPlan, ReplacementReport, ReplacementSession,
    EXPANDED_GROUP_SIZE, RESTORED_GROUP_SIZE,
};

// Polling
pub use waiter::{Backoff, ConditionWaiter, PollOutcome, RetryPolicy, WaitReport};

// Operator interaction
pub use confirm::{ConfirmationGate, PromptGate, ScriptedGate};
pub use notify::{Notifier, RecordingNotifier, TracingNotifier};

// ============================================================================
// Public exports - Cloud collaborators
// ============================================================================

pub use cloud::{
    CapacityApi, CapacityRequest, ClusterApi, ContainerInstance, GroupMembership, HostFilter,
    InstanceQuery, InstanceStatus,
};

pub use aws::{load_sdk_config, AutoScalingCapacityApi, EcsClusterApi};
pub use memory::{InMemoryCloud, Mutation};

// Error handling
pub use error::{OrchestratorError, Result};
