//! Lifecycle state machines of acquisition tasks and acquisitions
//!
//! Task states:
//!
//! ```text
//! created ──start──▶ started ──complete──▶ completed
//!    │                  │
//!    └──────fail────────┴──────fail──────▶ failed
//! ```
//!
//! Acquisition phases follow `start_time`/`end_time`:
//! `planned ──begin──▶ imaging ──finish──▶ finished`, and a finished
//! acquisition may be relabelled by QC review.
//!
//! Transitions are applied read-fresh / apply / compare-and-swap on the
//! record's revision. A lost swap re-reads and re-evaluates, so a concurrent
//! terminal transition turns into `IllegalTransition` rather than being
//! overwritten.

use crate::clock::Clock;
use crate::config::LifecycleConfig;
use crate::error::{ErrorKind, IntegrityError, Result, Violation};
use crate::resolver::Resolver;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use temdb_model::{
    Acquisition, AcquisitionPhase, AcquisitionStatus, AcquisitionTask, Entity, EntityId,
    EntityKind, ScopeKey, TaskStatus,
};
use temdb_store::{DocumentStore, StoreError, StoredEntity};
use tracing::{debug, info, warn};

/// Event driving an acquisition task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    /// `created → started`
    Start,
    /// `started → completed`
    Complete,
    /// `created | started → failed`
    Fail {
        /// Why the task failed; must not be blank
        error_message: String,
    },
}

impl TaskEvent {
    /// State the event moves to
    #[must_use]
    pub fn target(&self) -> TaskStatus {
        match self {
            Self::Start => TaskStatus::Started,
            Self::Complete => TaskStatus::Completed,
            Self::Fail { .. } => TaskStatus::Failed,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Complete => "complete",
            Self::Fail { .. } => "fail",
        }
    }
}

/// Event driving an acquisition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AcquisitionEvent {
    /// `planned → imaging`, stamps `start_time`
    Begin,
    /// `imaging → finished`, stamps `end_time` and records the outcome
    Finish {
        /// Outcome; anything but `imaging`
        status: AcquisitionStatus,
    },
    /// Relabel a finished acquisition after QC
    Review {
        /// New label; anything but `imaging`
        status: AcquisitionStatus,
    },
}

impl AcquisitionEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Begin => "begin",
            Self::Finish { .. } => "finish",
            Self::Review { .. } => "review",
        }
    }
}

/// Event for either lifecycle kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// Event for an acquisition task
    Task(TaskEvent),
    /// Event for an acquisition
    Acquisition(AcquisitionEvent),
}

impl LifecycleEvent {
    /// Kind of entity the event applies to
    #[must_use]
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Task(_) => EntityKind::AcquisitionTask,
            Self::Acquisition(_) => EntityKind::Acquisition,
        }
    }
}

impl From<TaskEvent> for LifecycleEvent {
    fn from(event: TaskEvent) -> Self {
        Self::Task(event)
    }
}

impl From<AcquisitionEvent> for LifecycleEvent {
    fn from(event: AcquisitionEvent) -> Self {
        Self::Acquisition(event)
    }
}

/// State after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Status of a task
    Task(TaskStatus),
    /// Phase and status of an acquisition
    Acquisition {
        /// Phase derived from the timestamps
        phase: AcquisitionPhase,
        /// Recorded outcome
        status: AcquisitionStatus,
    },
}

impl Display for LifecycleState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Task(status) => write!(f, "{status}"),
            Self::Acquisition { phase, status } => write!(f, "{phase} ({status})"),
        }
    }
}

/// A committed transition
#[derive(Debug, Clone)]
pub struct Transition {
    /// Record as written
    pub stored: StoredEntity,
    /// New state
    pub state: LifecycleState,
}

/// Task transition not in the table
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal task transition {from} -> {to}")]
pub struct TransitionError {
    /// Current state
    pub from: TaskStatus,
    /// Requested state
    pub to: TaskStatus,
}

/// States reachable from `from` in one step
#[must_use]
pub fn allowed_task_transitions(from: TaskStatus) -> Vec<TaskStatus> {
    use TaskStatus::*;
    match from {
        Created => vec![Started, Failed],
        Started => vec![Completed, Failed],
        Completed | Failed => vec![],
    }
}

/// Check one task transition
///
/// # Errors
/// [`TransitionError`] if `to` is not reachable from `from`.
pub fn validate_task_transition(from: TaskStatus, to: TaskStatus) -> Result<(), TransitionError> {
    if allowed_task_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(TransitionError { from, to })
    }
}

/// Apply `event` to `task`, stamping timestamps no earlier than the
/// previous stamp and moving to the next version
///
/// # Errors
/// [`IntegrityError::IllegalTransition`] or
/// [`IntegrityError::MissingErrorMessage`]; `task` is unchanged on error.
pub fn apply_task_event(
    task: &mut AcquisitionTask,
    event: &TaskEvent,
    now: DateTime<Utc>,
) -> Result<TaskStatus> {
    let from = task.status;
    let to = event.target();
    validate_task_transition(from, to).map_err(|_| IntegrityError::IllegalTransition {
        kind: EntityKind::AcquisitionTask,
        id: task.task_id.clone(),
        state: from.to_string(),
        event: event.name().to_string(),
    })?;

    let floor = task.started_at.unwrap_or(task.created_at);
    let stamp = now.max(floor);
    match event {
        TaskEvent::Start => task.started_at = Some(stamp),
        TaskEvent::Complete => task.completed_at = Some(stamp),
        TaskEvent::Fail { error_message } => {
            if error_message.trim().is_empty() {
                return Err(IntegrityError::MissingErrorMessage {
                    id: task.task_id.clone(),
                });
            }
            task.error_message = Some(error_message.clone());
            task.completed_at = Some(stamp);
        }
    }
    task.status = to;
    task.version = task.version.saturating_add(1);
    task.updated_at = stamp.max(task.updated_at);
    Ok(to)
}

/// Apply `event` to `acquisition`
///
/// # Errors
/// [`IntegrityError::IllegalTransition`] for out-of-order events or an
/// `imaging` outcome; `acquisition` is unchanged on error.
pub fn apply_acquisition_event(
    acquisition: &mut Acquisition,
    event: &AcquisitionEvent,
    now: DateTime<Utc>,
) -> Result<AcquisitionPhase> {
    let phase = acquisition.phase();
    let illegal = || IntegrityError::IllegalTransition {
        kind: EntityKind::Acquisition,
        id: acquisition.acquisition_id.clone(),
        state: phase.to_string(),
        event: event.name().to_string(),
    };

    match (phase, event) {
        (AcquisitionPhase::Planned, AcquisitionEvent::Begin) => {
            let stamp = now.max(acquisition.created_at);
            acquisition.start_time = Some(stamp);
            acquisition.status = AcquisitionStatus::Imaging;
            acquisition.updated_at = stamp.max(acquisition.updated_at);
        }
        (AcquisitionPhase::Imaging, AcquisitionEvent::Finish { status })
            if *status != AcquisitionStatus::Imaging =>
        {
            let floor = acquisition.start_time.unwrap_or(acquisition.created_at);
            let stamp = now.max(floor);
            acquisition.end_time = Some(stamp);
            acquisition.status = *status;
            acquisition.updated_at = stamp.max(acquisition.updated_at);
        }
        (AcquisitionPhase::Finished, AcquisitionEvent::Review { status })
            if *status != AcquisitionStatus::Imaging =>
        {
            acquisition.status = *status;
            acquisition.updated_at = now.max(acquisition.updated_at);
        }
        _ => return Err(illegal()),
    }
    Ok(acquisition.phase())
}

/// Consistency of a task record's status and timestamps
#[must_use]
pub fn task_record_violations(task: &AcquisitionTask) -> Vec<Violation> {
    let mut violations = Vec::new();
    let mut out_of_order = |field: &'static str, message: String| {
        violations.push(Violation::on(ErrorKind::IllegalTransition, field, message));
    };

    if let Some(started) = task.started_at {
        if started < task.created_at {
            out_of_order("started_at", "precedes created_at".into());
        }
    }
    if let Some(completed) = task.completed_at {
        let floor = task.started_at.unwrap_or(task.created_at);
        if completed < floor {
            out_of_order("completed_at", "precedes started_at".into());
        }
    }

    let stamps = (task.started_at.is_some(), task.completed_at.is_some());
    match (task.status, stamps) {
        (TaskStatus::Created, (false, false))
        | (TaskStatus::Started, (true, false))
        | (TaskStatus::Completed, (true, true))
        | (TaskStatus::Failed, (_, true)) => {}
        (status, _) => out_of_order(
            "status",
            format!("{status} is inconsistent with the recorded timestamps"),
        ),
    }

    if task.status == TaskStatus::Failed
        && task
            .error_message
            .as_deref()
            .map_or(true, |m| m.trim().is_empty())
    {
        violations.push(Violation::on(
            ErrorKind::MissingErrorMessage,
            "error_message",
            "failed task has no error message",
        ));
    }
    violations
}

/// Consistency of an acquisition record's status and timestamps
#[must_use]
pub fn acquisition_record_violations(acquisition: &Acquisition) -> Vec<Violation> {
    let mut violations = Vec::new();
    match (acquisition.start_time, acquisition.end_time) {
        (None, Some(_)) => violations.push(Violation::on(
            ErrorKind::IllegalTransition,
            "end_time",
            "set without start_time",
        )),
        (Some(start), Some(end)) if end < start => violations.push(Violation::on(
            ErrorKind::IllegalTransition,
            "end_time",
            "precedes start_time",
        )),
        _ => {}
    }
    let finished = acquisition.phase() == AcquisitionPhase::Finished;
    if finished == (acquisition.status == AcquisitionStatus::Imaging) {
        violations.push(Violation::on(
            ErrorKind::IllegalTransition,
            "status",
            format!(
                "{} is inconsistent with phase {}",
                acquisition.status,
                acquisition.phase()
            ),
        ));
    }
    violations
}

/// Reject replacing an acquisition that has not finished
///
/// # Errors
/// [`IntegrityError::ReplacementTargetActive`].
pub fn check_replacement_target(target: &Acquisition) -> Result<()> {
    match target.phase() {
        AcquisitionPhase::Finished => Ok(()),
        phase => Err(IntegrityError::ReplacementTargetActive {
            target: target.acquisition_id.clone(),
            phase,
        }),
    }
}

/// Drives lifecycle transitions against the store
#[derive(Clone)]
pub struct Lifecycle {
    store: Arc<dyn DocumentStore>,
    resolver: Resolver,
    clock: Arc<dyn Clock>,
    config: LifecycleConfig,
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("clock", &self.clock)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Lifecycle {
    /// Create a lifecycle driver
    #[must_use]
    pub fn new(
        store: Arc<dyn DocumentStore>,
        resolver: Resolver,
        clock: Arc<dyn Clock>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            store,
            resolver,
            clock,
            config,
        }
    }

    /// Apply `event` to the task or acquisition `id`
    ///
    /// # Errors
    /// [`IntegrityError::ReferenceNotFound`] if the record is absent,
    /// transition errors from the state machine, or
    /// [`IntegrityError::ConcurrentModification`] once the swap budget is
    /// spent.
    pub async fn transition(
        &self,
        id: &EntityId,
        event: impl Into<LifecycleEvent>,
    ) -> Result<Transition> {
        let event = event.into();
        let kind = event.kind();

        for attempt in 0..self.config.max_update_attempts {
            let Some(fresh) = self.resolver.fetch_fresh(kind, id).await? else {
                return Err(IntegrityError::ReferenceNotFound {
                    kind,
                    id: id.clone(),
                });
            };

            let mut entity = fresh.entity;
            let now = self.clock.now();
            let state = match (&mut entity, &event) {
                (Entity::AcquisitionTask(task), LifecycleEvent::Task(e)) => {
                    LifecycleState::Task(apply_task_event(task, e, now)?)
                }
                (Entity::Acquisition(acq), LifecycleEvent::Acquisition(e)) => {
                    let phase = apply_acquisition_event(acq, e, now)?;
                    LifecycleState::Acquisition {
                        phase,
                        status: acq.status,
                    }
                }
                _ => {
                    return Err(IntegrityError::ReferenceNotFound {
                        kind,
                        id: id.clone(),
                    })
                }
            };

            match self.store.update(entity.clone(), fresh.revision).await {
                Ok(revision) => {
                    self.resolver.invalidate(kind, id).await;
                    info!(%kind, %id, %state, "transition committed");
                    return Ok(Transition {
                        stored: StoredEntity { entity, revision },
                        state,
                    });
                }
                Err(StoreError::RevisionConflict { .. }) => {
                    debug!(%kind, %id, attempt, "revision conflict, re-reading");
                }
                Err(StoreError::NotFound { .. }) => {
                    self.resolver.invalidate(kind, id).await;
                    return Err(IntegrityError::ReferenceNotFound {
                        kind,
                        id: id.clone(),
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(%kind, %id, "transition gave up after repeated conflicts");
        Err(IntegrityError::ConcurrentModification {
            kind,
            id: id.clone(),
            attempts: self.config.max_update_attempts,
        })
    }

    /// Take the single successor slot of `target`
    ///
    /// A held slot with no live successor behind it was left behind by an
    /// interrupted delete or insert and is taken over.
    ///
    /// # Errors
    /// [`IntegrityError::ReplacementConflict`] if another acquisition holds it.
    pub async fn claim_successor_slot(&self, target: &EntityId) -> Result<()> {
        let slot = ScopeKey::successor_slot(target.clone());
        for _ in 0..self.config.max_update_attempts {
            if self.store.compare_and_swap_counter(&slot, 0, 1).await? {
                debug!(%target, "successor slot claimed");
                return Ok(());
            }
            if !self.live_successors(target).await?.is_empty() {
                break;
            }
            // Fails only if the slot was released meanwhile; claim it fresh
            if self.store.compare_and_swap_counter(&slot, 1, 1).await? {
                warn!(%target, "reclaimed successor slot with no live successor");
                return Ok(());
            }
        }
        Err(IntegrityError::ReplacementConflict {
            target: target.clone(),
        })
    }

    /// Check that `successor` is the only acquisition replacing `target`
    ///
    /// Run after inserting a successor, since a reclaimed slot can be
    /// taken by two writers at once.
    ///
    /// # Errors
    /// [`IntegrityError::ReplacementConflict`] if another successor exists.
    pub async fn confirm_successor(&self, target: &EntityId, successor: &EntityId) -> Result<()> {
        let rivals = self
            .live_successors(target)
            .await?
            .into_iter()
            .filter(|s| s.id() != successor)
            .count();
        if rivals == 0 {
            Ok(())
        } else {
            warn!(%target, %successor, rivals, "successor raced another writer");
            Err(IntegrityError::ReplacementConflict {
                target: target.clone(),
            })
        }
    }

    /// Free the successor slot of `target`
    ///
    /// # Errors
    /// Store errors only; an already free slot is not an error.
    pub async fn release_successor_slot(&self, target: &EntityId) -> Result<()> {
        let slot = ScopeKey::successor_slot(target.clone());
        if self.store.compare_and_swap_counter(&slot, 1, 0).await? {
            debug!(%target, "successor slot released");
        }
        Ok(())
    }

    async fn live_successors(&self, target: &EntityId) -> Result<Vec<StoredEntity>> {
        Ok(self
            .store
            .find_by_reference(
                EntityKind::Acquisition,
                "replaces_acquisition_id",
                Some(target),
            )
            .await?)
    }
}
