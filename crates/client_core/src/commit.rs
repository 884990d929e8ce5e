use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use shared::{
    domain::{DeviceId, OutputId, Pin, Sensor, SensorId},
    protocol::TerminalStatus,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    api::DeviceApi,
    config::ClientSettings,
    draft::{SensorDefinition, SensorDraft},
    error::{CommitError, DraftError, FetchError},
    task::TaskHandle,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitStatus {
    Idle,
    Submitting,
    /// `last_status` is the most recent non-terminal job status seen, if any.
    Polling { last_status: Option<String> },
    Succeeded,
    Failed { reason: String },
}

impl CommitStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CommitStatus::Succeeded | CommitStatus::Failed { .. })
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, CommitStatus::Submitting | CommitStatus::Polling { .. })
    }
}

#[derive(Debug, Clone)]
pub enum CommitEvent {
    StatusChanged(CommitStatus),
    /// The commit landed; local state must be replaced from the server.
    ReloadRequested,
    Failed(CommitError),
}

struct CommitJob {
    submitted_config: Vec<Sensor>,
    poll: Option<TaskHandle>,
}

struct CommitState {
    generation: u64,
    shut_down: bool,
    draft: SensorDraft,
    status: CommitStatus,
    job: Option<CommitJob>,
}

impl CommitState {
    /// Ends the current job. The poll task may be the caller, so its handle is
    /// detached rather than aborted.
    fn finish(&mut self, status: CommitStatus) {
        if let Some(job) = self.job.take() {
            if let Some(poll) = job.poll {
                poll.detach();
            }
        }
        self.status = status;
    }
}

fn lock_state(state: &Mutex<CommitState>) -> MutexGuard<'_, CommitState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

enum PollStep {
    Continue(CommitStatus),
    Done(CommitStatus, Option<CommitError>),
}

async fn poll_until_terminal(
    api: Arc<dyn DeviceApi>,
    device_id: DeviceId,
    state: Arc<Mutex<CommitState>>,
    events: broadcast::Sender<CommitEvent>,
    generation: u64,
    interval: Duration,
) {
    loop {
        tokio::time::sleep(interval).await;
        let response = api.fetch_commit_status(&device_id).await;

        let step = {
            let mut guard = lock_state(&state);
            if guard.generation != generation {
                debug!(%device_id, "commit: dropping status response for stale job");
                return;
            }
            match response {
                Err(err) => {
                    let err = CommitError::PollTransport(format!("{err:#}"));
                    let status = CommitStatus::Failed {
                        reason: err.reason().to_string(),
                    };
                    guard.finish(status.clone());
                    PollStep::Done(status, Some(err))
                }
                Ok(body) => match TerminalStatus::classify(&body.status) {
                    None => {
                        let status = CommitStatus::Polling {
                            last_status: Some(body.status),
                        };
                        guard.status = status.clone();
                        PollStep::Continue(status)
                    }
                    Some(terminal) if terminal.is_success() => {
                        guard.finish(CommitStatus::Succeeded);
                        PollStep::Done(CommitStatus::Succeeded, None)
                    }
                    Some(terminal) => {
                        let err = CommitError::JobFailed {
                            reason: terminal.as_str().to_string(),
                        };
                        let status = CommitStatus::Failed {
                            reason: terminal.as_str().to_string(),
                        };
                        guard.finish(status.clone());
                        PollStep::Done(status, Some(err))
                    }
                },
            }
        };

        match step {
            PollStep::Continue(status) => {
                debug!(%device_id, ?status, "commit: job still running");
                let _ = events.send(CommitEvent::StatusChanged(status));
            }
            PollStep::Done(status, failure) => {
                let _ = events.send(CommitEvent::StatusChanged(status));
                match failure {
                    Some(err) => {
                        warn!(%device_id, reason = err.reason(), "commit: {err}");
                        let _ = events.send(CommitEvent::Failed(err));
                    }
                    None => {
                        info!(%device_id, "commit: reconfiguration done");
                        let _ = events.send(CommitEvent::ReloadRequested);
                    }
                }
                return;
            }
        }
    }
}

pub struct ConfigCommitController {
    api: Arc<dyn DeviceApi>,
    device_id: DeviceId,
    poll_interval: Duration,
    state: Arc<Mutex<CommitState>>,
    events: broadcast::Sender<CommitEvent>,
}

impl ConfigCommitController {
    pub fn new(api: Arc<dyn DeviceApi>, device_id: DeviceId, settings: &ClientSettings) -> Self {
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        Self {
            api,
            poll_interval: settings.poll_interval(),
            state: Arc::new(Mutex::new(CommitState {
                generation: 0,
                shut_down: false,
                draft: SensorDraft::new(device_id.clone(), Vec::new()),
                status: CommitStatus::Idle,
                job: None,
            })),
            device_id,
            events,
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CommitEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> CommitStatus {
        lock_state(&self.state).status.clone()
    }

    pub fn draft(&self) -> SensorDraft {
        lock_state(&self.state).draft.clone()
    }

    /// Effective configuration captured by the commit currently in flight.
    pub fn submitted_config(&self) -> Option<Vec<Sensor>> {
        lock_state(&self.state)
            .job
            .as_ref()
            .map(|job| job.submitted_config.clone())
    }

    /// Replaces the draft with the server's authoritative sensor list.
    pub async fn load(&self) -> Result<(), CommitError> {
        let generation = {
            let guard = lock_state(&self.state);
            if guard.shut_down {
                return Err(CommitError::Cancelled);
            }
            if guard.status.is_in_flight() {
                return Err(CommitError::InFlight);
            }
            guard.generation
        };

        let result = self.api.fetch_sensors(&self.device_id).await;

        let status = {
            let mut guard = lock_state(&self.state);
            if guard.shut_down || guard.generation != generation {
                return Err(CommitError::Cancelled);
            }
            let sensors =
                result.map_err(|err| FetchError::new("device sensors", &err))?;
            info!(
                device_id = %self.device_id,
                sensors = sensors.len(),
                "commit: sensor configuration loaded"
            );
            guard.draft = SensorDraft::new(self.device_id.clone(), sensors);
            guard.status = CommitStatus::Idle;
            guard.status.clone()
        };
        let _ = self.events.send(CommitEvent::StatusChanged(status));
        Ok(())
    }

    /// Full reload after a successful commit.
    pub async fn reload(&self) -> Result<(), CommitError> {
        debug!(device_id = %self.device_id, "commit: reloading authoritative state");
        self.load().await
    }

    fn mutate<T>(
        &self,
        edit: impl FnOnce(&mut SensorDraft) -> Result<T, DraftError>,
    ) -> Result<T, CommitError> {
        let (value, reset) = {
            let mut guard = lock_state(&self.state);
            if guard.shut_down {
                return Err(CommitError::Cancelled);
            }
            if guard.status.is_in_flight() {
                return Err(CommitError::InFlight);
            }
            let value = edit(&mut guard.draft)?;
            let reset = guard.status.is_terminal();
            if reset {
                guard.status = CommitStatus::Idle;
            }
            (value, reset)
        };
        if reset {
            let _ = self
                .events
                .send(CommitEvent::StatusChanged(CommitStatus::Idle));
        }
        Ok(value)
    }

    pub fn set_pin(&self, sensor_id: SensorId, pin: Pin) -> Result<(), CommitError> {
        self.mutate(|draft| draft.set_pin(sensor_id, pin))
    }

    pub fn toggle_output(
        &self,
        sensor_id: SensorId,
        output_id: OutputId,
    ) -> Result<bool, CommitError> {
        self.mutate(|draft| draft.toggle_output(sensor_id, output_id))
    }

    pub fn remove_sensor(&self, sensor_id: SensorId) -> Result<(), CommitError> {
        self.mutate(|draft| draft.remove_sensor(sensor_id))
    }

    pub fn add_sensor(&self, definition: SensorDefinition) -> Result<(), CommitError> {
        self.mutate(|draft| draft.add_sensor(definition))
    }

    /// Submits the draft. Returns once the submit response is handled: either
    /// `Succeeded` or `Polling`, in which case the outcome arrives as events.
    pub async fn commit(&self) -> Result<CommitStatus, CommitError> {
        let (generation, submission) = {
            let mut guard = lock_state(&self.state);
            if guard.shut_down {
                return Err(CommitError::Cancelled);
            }
            if guard.status.is_in_flight() {
                return Err(CommitError::InFlight);
            }
            let submitted_config = guard.draft.effective_configuration();
            guard.generation += 1;
            guard.status = CommitStatus::Submitting;
            guard.job = Some(CommitJob {
                submitted_config,
                poll: None,
            });
            (guard.generation, guard.draft.submission())
        };
        let _ = self
            .events
            .send(CommitEvent::StatusChanged(CommitStatus::Submitting));
        info!(
            device_id = %self.device_id,
            sensors = submission.len(),
            "commit: submitting sensor configuration"
        );

        let response = self.api.submit_sensors(&self.device_id, &submission).await;

        let (status, failure) = {
            let mut guard = lock_state(&self.state);
            if guard.generation != generation {
                return Err(CommitError::Cancelled);
            }
            match response {
                Err(err) => {
                    let err = CommitError::Submit(format!("{err:#}"));
                    guard.finish(CommitStatus::Failed {
                        reason: err.reason().to_string(),
                    });
                    (guard.status.clone(), Some(err))
                }
                Ok(body) if body.is_immediate_success() => {
                    guard.finish(CommitStatus::Succeeded);
                    (CommitStatus::Succeeded, None)
                }
                Ok(_) => {
                    let poll = TaskHandle::spawn(poll_until_terminal(
                        Arc::clone(&self.api),
                        self.device_id.clone(),
                        Arc::clone(&self.state),
                        self.events.clone(),
                        generation,
                        self.poll_interval,
                    ));
                    if let Some(job) = guard.job.as_mut() {
                        job.poll = Some(poll);
                    }
                    guard.status = CommitStatus::Polling { last_status: None };
                    (guard.status.clone(), None)
                }
            }
        };

        let _ = self.events.send(CommitEvent::StatusChanged(status.clone()));
        if let Some(err) = failure {
            warn!(device_id = %self.device_id, "commit: {err}");
            let _ = self.events.send(CommitEvent::Failed(err.clone()));
            return Err(err);
        }
        match status {
            CommitStatus::Succeeded => {
                info!(device_id = %self.device_id, "commit: applied immediately");
                let _ = self.events.send(CommitEvent::ReloadRequested);
            }
            _ => info!(device_id = %self.device_id, "commit: job queued, polling status"),
        }
        Ok(status)
    }

    /// Teardown: cancels any poll and makes every in-flight response a no-op.
    pub fn shutdown(&self) {
        let mut guard = lock_state(&self.state);
        if guard.shut_down {
            return;
        }
        guard.shut_down = true;
        guard.generation += 1;
        if let Some(mut poll) = guard.job.take().and_then(|job| job.poll) {
            poll.cancel();
        }
        if guard.status.is_in_flight() {
            guard.status = CommitStatus::Idle;
        }
        debug!(device_id = %self.device_id, "commit: controller shut down");
    }
}

impl Drop for ConfigCommitController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
#[path = "tests/commit_tests.rs"]
mod tests;
