use crate::action::ExecutionResult;
use crate::types::ArmState;
use serde::{Deserialize, Serialize};

/// Why a state transition happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransitionCause {
    Arm,
    AutoArm { reason: String },
    PowerLoss,
    GraceCancelled,
    GraceExpired,
    ExecutionFinished,
    Disarm,
    ForceDisarm,
}

/// Notifications published by the state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GuardEvent {
    StateChanged {
        from: ArmState,
        to: ArmState,
        cause: TransitionCause,
    },
    /// Once when the countdown starts, then every second until it ends.
    GracePeriodTick { remaining_seconds: u64 },
    ExecutionFinished { result: ExecutionResult },
}

impl GuardEvent {
    pub fn name(&self) -> &'static str {
        match self {
            GuardEvent::StateChanged { .. } => "state_changed",
            GuardEvent::GracePeriodTick { .. } => "grace_period_tick",
            GuardEvent::ExecutionFinished { .. } => "execution_finished",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_changed_json_shape() {
        let event = GuardEvent::StateChanged {
            from: ArmState::Armed,
            to: ArmState::GracePeriod,
            cause: TransitionCause::PowerLoss,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "state_changed");
        assert_eq!(json["to"], "grace_period");
        assert_eq!(json["cause"]["type"], "power_loss");
    }

    #[test]
    fn name_matches_serialized_tag() {
        let events = [
            GuardEvent::GracePeriodTick {
                remaining_seconds: 4,
            },
            GuardEvent::ExecutionFinished {
                result: ExecutionResult::all_failed(
                    &crate::action::ActionConfiguration::default(),
                    crate::error::ActionError::Unavailable("busy".into()),
                ),
            },
        ];
        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["event"], event.name());
        }
    }

    #[test]
    fn auto_arm_cause_carries_reason() {
        let cause = TransitionCause::AutoArm {
            reason: "left trusted location 'home'".into(),
        };
        let json = serde_json::to_string(&cause).unwrap();
        assert!(json.contains("\"type\":\"auto_arm\""));
        assert!(json.contains("home"));
    }
}
