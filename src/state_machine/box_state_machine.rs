use super::errors::{invalid_transition, StateMachineResult};
use super::events::BoxEvent;
use super::states::BoxState;
use crate::models::FleetBox;
use chrono::Utc;

/// Transition table for the box lifecycle
///
/// `idle|error → starting → running|error`, `running|starting|error → stopping → idle|error`.
pub struct BoxStateMachine;

impl BoxStateMachine {
    /// Determine the target state based on current state and event
    pub fn determine_target_state(
        current_state: BoxState,
        event: &BoxEvent,
    ) -> StateMachineResult<BoxState> {
        let target = match (current_state, event) {
            (BoxState::Idle | BoxState::Error, BoxEvent::Start) => BoxState::Starting,
            (BoxState::Starting, BoxEvent::EgressReady) => BoxState::Running,

            (BoxState::Starting | BoxState::Running | BoxState::Stopping, BoxEvent::Fail(_)) => {
                BoxState::Error
            }

            (BoxState::Starting | BoxState::Running | BoxState::Error, BoxEvent::Stop) => {
                BoxState::Stopping
            }
            (BoxState::Stopping, BoxEvent::Stopped) => BoxState::Idle,

            (from_state, event) => {
                return Err(invalid_transition("box", from_state, event.event_type()))
            }
        };

        Ok(target)
    }

    /// Apply an event to a box record, keeping the state-dependent fields consistent
    ///
    /// Address and location are only cleared here; they are assigned by the box
    /// lifecycle manager together with `EgressReady`.
    pub fn apply(fleet_box: &mut FleetBox, event: &BoxEvent) -> StateMachineResult<BoxState> {
        let target = Self::determine_target_state(fleet_box.status, event)?;

        match event {
            BoxEvent::Start => {
                fleet_box.error_message = None;
            }
            BoxEvent::EgressReady => {
                fleet_box.started_at = Some(Utc::now());
            }
            BoxEvent::Fail(message) => {
                fleet_box.error_message = Some(message.clone());
                fleet_box.clear_egress();
            }
            BoxEvent::Stop => {}
            BoxEvent::Stopped => {
                fleet_box.clear_egress();
                fleet_box.error_message = None;
            }
        }

        fleet_box.status = target;
        Ok(target)
    }
}
