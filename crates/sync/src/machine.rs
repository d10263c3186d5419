//! Per-task synchronization state machine.
//!
//! [`step`] is the pure transition function: given a state and the event
//! produced by that state's action, it returns the next state. [`SyncMachine`]
//! performs the actions (store probes, copies, dispatch) and feeds their
//! events back through [`step`] until the task completes, fails, or suspends
//! to wait for dependencies.

use crate::coordinator::{CopyCoordinator, DispatchOutcome};
use crate::error::{FailureClass, SyncError, SyncResult};
use crate::metrics;
use crate::replicas::ReplicaSet;
use crate::resolver;
use crate::retry::RetryPolicy;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use twinstore_core::config::SyncConfig;
use twinstore_core::{ContentHash, CopyPlan, ObjectKind, SyncTask, plan};
use twinstore_storage::ObjectStore;
use uuid::Uuid;

/// How a task reached `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The destination already held the object.
    AlreadyPresent,
    /// Copied in one piece.
    Copied { bytes: u64 },
    /// Handed to the chunked copy coordinator.
    Dispatched { job_id: Uuid, parts: u32 },
    /// A chunked copy of the same object was already in progress.
    AlreadyInFlight,
}

impl Completion {
    pub fn label(&self) -> &'static str {
        match self {
            Self::AlreadyPresent => "already_present",
            Self::Copied { .. } => "copied",
            Self::Dispatched { .. } => "dispatched",
            Self::AlreadyInFlight => "already_in_flight",
        }
    }
}

/// Task states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    Dispatch,
    CheckDeps,
    WaitForDeps,
    /// Copy decision: size the object and plan the copy.
    Plan,
    OneshotCopy { size: u64 },
    ChunkedCopy { plan: CopyPlan },
    Done(Completion),
    Failed { class: FailureClass, reason: String },
}

impl SyncState {
    /// Where a task starts: tasks resumed from a dependency wait go straight
    /// back to waiting, everything else starts at dispatch.
    pub fn initial(task: &SyncTask) -> Self {
        if task.waiting_since.is_some() {
            Self::WaitForDeps
        } else {
            Self::Dispatch
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done(_) | Self::Failed { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Dispatch => "dispatch",
            Self::CheckDeps => "check_deps",
            Self::WaitForDeps => "wait_for_deps",
            Self::Plan => "plan",
            Self::OneshotCopy { .. } => "oneshot_copy",
            Self::ChunkedCopy { .. } => "chunked_copy",
            Self::Done(_) => "done",
            Self::Failed { .. } => "failed",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The result of a state's action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    DestinationProbed { present: bool },
    DependenciesProbed { ready: bool },
    /// A suspended wait has elapsed.
    WaitElapsed,
    DeadlineExceeded { waited: Duration },
    Planned(CopyPlan),
    Copied { bytes: u64 },
    Dispatched(DispatchOutcome),
    Error { class: FailureClass, reason: String },
}

impl Event {
    fn from_error(error: &SyncError) -> Self {
        Self::Error {
            class: error.class(),
            reason: error.to_string(),
        }
    }
}

/// Transition function.
///
/// Terminal states absorb every event. An event a state cannot produce is a
/// bug and fails the task permanently.
pub fn step(state: SyncState, kind: ObjectKind, event: Event) -> SyncState {
    use SyncState as S;

    if state.is_terminal() {
        return state;
    }

    match (state, event) {
        (_, Event::Error { class, reason }) => S::Failed { class, reason },

        (S::Dispatch, Event::DestinationProbed { present: true }) => {
            S::Done(Completion::AlreadyPresent)
        }
        (S::Dispatch, Event::DestinationProbed { present: false }) => {
            if kind == ObjectKind::Blob {
                S::Plan
            } else {
                S::CheckDeps
            }
        }

        (S::CheckDeps, Event::DestinationProbed { present: true }) => {
            S::Done(Completion::AlreadyPresent)
        }
        (S::CheckDeps, Event::DependenciesProbed { ready: true }) => S::Plan,
        (S::CheckDeps, Event::DependenciesProbed { ready: false }) => S::WaitForDeps,

        (S::WaitForDeps, Event::WaitElapsed) => S::CheckDeps,
        (S::WaitForDeps, Event::DeadlineExceeded { waited }) => S::Failed {
            class: FailureClass::DependencyStalled,
            reason: format!("dependencies still missing after {}s", waited.as_secs()),
        },

        (S::Plan, Event::Planned(plan)) => {
            if plan.one_shot {
                S::OneshotCopy {
                    size: plan.total_size(),
                }
            } else {
                S::ChunkedCopy { plan }
            }
        }

        (S::OneshotCopy { .. }, Event::Copied { bytes }) => S::Done(Completion::Copied { bytes }),

        (S::ChunkedCopy { .. }, Event::Dispatched(outcome)) => match outcome {
            DispatchOutcome::Started { job_id, parts } => {
                S::Done(Completion::Dispatched { job_id, parts })
            }
            DispatchOutcome::AlreadyActive { .. } => S::Done(Completion::AlreadyInFlight),
        },

        (state, event) => S::Failed {
            class: FailureClass::Permanent,
            reason: format!("unexpected event {event:?} in state {state}"),
        },
    }
}

/// What the driver should do with a task after running it.
#[derive(Debug)]
pub enum Outcome {
    Completed(Completion),
    /// Re-enqueue `task` to resume at `resume_at`.
    Suspended {
        task: SyncTask,
        resume_at: OffsetDateTime,
    },
    /// Dead-letter `task`.
    Failed {
        task: SyncTask,
        class: FailureClass,
        reason: String,
        attempts: u32,
    },
}

/// Tuning the machine needs from the sync configuration.
#[derive(Clone, Debug)]
pub struct MachineSettings {
    pub part_size: u64,
    pub poll_interval: Duration,
    pub deadline: Duration,
    pub probe_timeout: Duration,
}

impl From<&SyncConfig> for MachineSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            part_size: config.part_size,
            poll_interval: config.dependency_poll_interval(),
            deadline: config.dependency_deadline(),
            probe_timeout: config.operation_timeout(),
        }
    }
}

/// Drives tasks through the state machine.
pub struct SyncMachine {
    replicas: Arc<ReplicaSet>,
    coordinator: Arc<CopyCoordinator>,
    retry: RetryPolicy,
    settings: MachineSettings,
}

impl SyncMachine {
    pub fn new(
        replicas: Arc<ReplicaSet>,
        coordinator: Arc<CopyCoordinator>,
        retry: RetryPolicy,
        settings: MachineSettings,
    ) -> Self {
        Self {
            replicas,
            coordinator,
            retry,
            settings,
        }
    }

    /// Run `task` until it reaches a terminal state or suspends.
    pub async fn run(&self, mut task: SyncTask, now: OffsetDateTime) -> Outcome {
        let mut state = SyncState::initial(&task);
        let mut resuming = state == SyncState::WaitForDeps;
        let mut attempts = 1;

        tracing::debug!(
            task_id = %task.task_id,
            object = %task.source_ref(),
            source_kind = task.source_kind.as_str(),
            state = %state,
            "Running sync task"
        );

        while !state.is_terminal() {
            let event = match &state {
                SyncState::WaitForDeps => {
                    let since = *task.waiting_since.get_or_insert(now);
                    let waited: Duration = (now - since).try_into().unwrap_or_default();
                    if std::mem::take(&mut resuming) {
                        Event::WaitElapsed
                    } else if waited >= self.settings.deadline {
                        Event::DeadlineExceeded { waited }
                    } else {
                        let resume_at = now + self.settings.poll_interval;
                        tracing::info!(
                            task_id = %task.task_id,
                            object = %task.source_ref(),
                            resume_at = %resume_at,
                            "Waiting for dependencies at destination"
                        );
                        return Outcome::Suspended { task, resume_at };
                    }
                }
                state => match self.act(state, &task, now).await {
                    Ok(event) => event,
                    Err(e) => {
                        attempts = e.attempts_consumed();
                        Event::from_error(&e)
                    }
                },
            };

            let next = step(state.clone(), task.kind, event);
            tracing::debug!(
                task_id = %task.task_id,
                from = %state,
                to = %next,
                "State transition"
            );
            state = next;
        }

        match state {
            SyncState::Done(completion) => {
                tracing::info!(
                    task_id = %task.task_id,
                    object = %task.source_ref(),
                    destination = %task.destination,
                    completion = completion.label(),
                    "Sync task done"
                );
                Outcome::Completed(completion)
            }
            SyncState::Failed { class, reason } => {
                let attempts = if class == FailureClass::Transient {
                    attempts
                } else {
                    1
                };
                Outcome::Failed {
                    task,
                    class,
                    reason,
                    attempts,
                }
            }
            // The loop only exits on a terminal state.
            other => Outcome::Failed {
                task,
                class: FailureClass::Permanent,
                reason: format!("stopped in non-terminal state {other}"),
                attempts: 1,
            },
        }
    }

    async fn probe_destination(
        &self,
        dest: &dyn ObjectStore,
        dest_name: &str,
        dest_key: &str,
    ) -> SyncResult<bool> {
        self.retry
            .run("probe_destination", || async move {
                dest.exists(dest_key)
                    .await
                    .map_err(|e| SyncError::storage(dest_name, e))
            })
            .await
    }

    /// Perform the action of a non-waiting state.
    async fn act(&self, state: &SyncState, task: &SyncTask, now: OffsetDateTime) -> SyncResult<Event> {
        let source = self.replicas.get(&task.source)?.as_ref();
        let dest = self.replicas.get(&task.destination)?.as_ref();
        let (source_name, dest_name) = (task.source.as_str(), task.destination.as_str());
        let source_key = task.source_ref().storage_key();
        let dest_key = task.dest_ref().storage_key();
        let (source_key, dest_key) = (source_key.as_str(), dest_key.as_str());

        match state {
            SyncState::Dispatch => {
                let present = self.probe_destination(dest, dest_name, dest_key).await?;
                Ok(Event::DestinationProbed { present })
            }
            SyncState::CheckDeps => {
                // A duplicate notification may have copied the object while this task waited.
                if task.waiting_since.is_some()
                    && self.probe_destination(dest, dest_name, dest_key).await?
                {
                    return Ok(Event::DestinationProbed { present: true });
                }
                let object = task.source_ref();
                let object = &object;
                let deps = self
                    .retry
                    .run("read_dependencies", || async move {
                        resolver::dependencies(source, source_name, object).await
                    })
                    .await?;
                let ready = resolver::ready(dest, &deps, self.settings.probe_timeout).await;
                Ok(Event::DependenciesProbed { ready })
            }
            SyncState::Plan => {
                let size = self
                    .retry
                    .run("size_source", || async move {
                        source
                            .head(source_key)
                            .await
                            .map(|meta| meta.size)
                            .map_err(|e| SyncError::source_read(source_name, source_key, e))
                    })
                    .await?;
                if let Some(reported) = task.size
                    && reported != size
                {
                    tracing::warn!(
                        task_id = %task.task_id,
                        object = %task.source_ref(),
                        reported,
                        actual = size,
                        "Notified size disagrees with source; using source size"
                    );
                }
                Ok(Event::Planned(plan(size, self.settings.part_size)?))
            }
            SyncState::OneshotCopy { .. } => {
                let expected = match task.kind {
                    ObjectKind::Blob => Some(ContentHash::from_hex(task.source_ref().key.as_str())?),
                    _ => None,
                };
                let bytes = self
                    .retry
                    .run("oneshot_copy", || async move {
                        let data = source
                            .get(source_key)
                            .await
                            .map_err(|e| SyncError::source_read(source_name, source_key, e))?;
                        if let Some(expected) = expected {
                            expected.verify(&data)?;
                        }
                        let len = data.len() as u64;
                        dest.put(dest_key, data)
                            .await
                            .map_err(|e| SyncError::storage(dest_name, e))?;
                        Ok(len)
                    })
                    .await?;
                metrics::BYTES_COPIED.inc_by(bytes);
                Ok(Event::Copied { bytes })
            }
            SyncState::ChunkedCopy { plan } => {
                let outcome = self.coordinator.dispatch(plan, task, now).await?;
                Ok(Event::Dispatched(outcome))
            }
            SyncState::WaitForDeps | SyncState::Done(_) | SyncState::Failed { .. } => {
                Ok(Event::Error {
                    class: FailureClass::Permanent,
                    reason: format!("no action for state {state}"),
                })
            }
        }
    }
}
