use super::errors::{invalid_transition, StateMachineResult};
use super::events::WorkerEvent;
use super::states::WorkerState;
use crate::models::Worker;

/// Transition table for the worker lifecycle
pub struct WorkerStateMachine;

impl WorkerStateMachine {
    /// Determine the target state based on current state and event
    pub fn determine_target_state(
        current_state: WorkerState,
        event: &WorkerEvent,
    ) -> StateMachineResult<WorkerState> {
        let target = match (current_state, event) {
            (WorkerState::Idle | WorkerState::Error, WorkerEvent::Start) => WorkerState::Starting,

            (WorkerState::Starting, WorkerEvent::TabsInitialized { ready, requested }) => {
                if *ready == 0 {
                    WorkerState::Error
                } else if ready < requested {
                    WorkerState::Partial
                } else {
                    WorkerState::Running
                }
            }

            (
                WorkerState::Starting
                | WorkerState::Running
                | WorkerState::Partial
                | WorkerState::Stopping,
                WorkerEvent::Fail(_),
            ) => WorkerState::Error,

            (
                WorkerState::Starting
                | WorkerState::Running
                | WorkerState::Partial
                | WorkerState::Error,
                WorkerEvent::Stop,
            ) => WorkerState::Stopping,
            (WorkerState::Stopping, WorkerEvent::Stopped) => WorkerState::Idle,

            (from_state, event) => {
                return Err(invalid_transition("worker", from_state, event.event_type()))
            }
        };

        Ok(target)
    }

    /// Apply an event to a worker record
    ///
    /// `Stopped` clears the target, tabs and playback snapshot. A `TabsInitialized`
    /// event with no ready tabs records a failure message.
    pub fn apply(worker: &mut Worker, event: &WorkerEvent) -> StateMachineResult<WorkerState> {
        let target = Self::determine_target_state(worker.status, event)?;

        match event {
            WorkerEvent::Start => {
                worker.error_message = None;
                worker.start_attempt += 1;
            }
            WorkerEvent::TabsInitialized { ready, requested } => {
                if *ready == 0 {
                    worker.error_message =
                        Some(format!("none of {requested} requested tabs initialised"));
                }
            }
            WorkerEvent::Fail(message) => {
                worker.error_message = Some(message.clone());
            }
            WorkerEvent::Stop => {}
            WorkerEvent::Stopped => {
                worker.clear_session_state();
                worker.target = None;
            }
        }

        worker.status = target;
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tabs(ready: u32, requested: u32) -> WorkerEvent {
        WorkerEvent::TabsInitialized { ready, requested }
    }

    #[test]
    fn test_start_outcomes_follow_tab_counts() {
        let sm = WorkerStateMachine::determine_target_state;
        assert_eq!(sm(WorkerState::Starting, &tabs(3, 3)).unwrap(), WorkerState::Running);
        assert_eq!(sm(WorkerState::Starting, &tabs(2, 3)).unwrap(), WorkerState::Partial);
        assert_eq!(sm(WorkerState::Starting, &tabs(0, 3)).unwrap(), WorkerState::Error);
    }

    #[test]
    fn test_restart_from_error_only() {
        let sm = WorkerStateMachine::determine_target_state;
        assert_eq!(sm(WorkerState::Error, &WorkerEvent::Start).unwrap(), WorkerState::Starting);
        assert!(sm(WorkerState::Running, &WorkerEvent::Start).is_err());
        assert!(sm(WorkerState::Stopping, &WorkerEvent::Start).is_err());
    }

    #[test]
    fn test_stop_refused_when_idle_or_stopping() {
        let sm = WorkerStateMachine::determine_target_state;
        assert!(sm(WorkerState::Idle, &WorkerEvent::Stop).is_err());
        assert!(sm(WorkerState::Stopping, &WorkerEvent::Stop).is_err());
        assert_eq!(sm(WorkerState::Partial, &WorkerEvent::Stop).unwrap(), WorkerState::Stopping);
    }

    #[test]
    fn test_stopped_clears_transient_fields() {
        let mut worker = Worker::new("box-1", false);
        worker.target = Some("stream-a".into());
        WorkerStateMachine::apply(&mut worker, &WorkerEvent::Start).unwrap();
        worker.ensure_tabs(2);
        WorkerStateMachine::apply(&mut worker, &tabs(2, 2)).unwrap();
        WorkerStateMachine::apply(&mut worker, &WorkerEvent::Stop).unwrap();
        WorkerStateMachine::apply(&mut worker, &WorkerEvent::Stopped).unwrap();

        assert_eq!(worker.status, WorkerState::Idle);
        assert!(worker.target.is_none());
        assert!(worker.tabs.is_empty());
        assert!(worker.playback.is_none());
        assert_eq!(worker.start_attempt, 1);
    }
}
