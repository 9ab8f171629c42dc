use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// ArmState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArmState {
    Disarmed,
    Armed,
    GracePeriod,
    ActionsExecuting,
}

impl ArmState {
    pub fn all() -> &'static [ArmState] {
        &[
            ArmState::Disarmed,
            ArmState::Armed,
            ArmState::GracePeriod,
            ArmState::ActionsExecuting,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ArmState::Disarmed => "disarmed",
            ArmState::Armed => "armed",
            ArmState::GracePeriod => "grace_period",
            ArmState::ActionsExecuting => "actions_executing",
        }
    }

    /// Any state other than `Disarmed` is protected.
    pub fn is_protected(self) -> bool {
        !matches!(self, ArmState::Disarmed)
    }
}

impl fmt::Display for ArmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ActionKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    LockSession,
    SoundAlarm,
    StopAlarm,
    ForceLogout,
    ScheduleShutdown,
    RunCustomScript,
}

impl ActionKind {
    pub fn all() -> &'static [ActionKind] {
        &[
            ActionKind::LockSession,
            ActionKind::SoundAlarm,
            ActionKind::StopAlarm,
            ActionKind::ForceLogout,
            ActionKind::ScheduleShutdown,
            ActionKind::RunCustomScript,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::LockSession => "lock_session",
            ActionKind::SoundAlarm => "sound_alarm",
            ActionKind::StopAlarm => "stop_alarm",
            ActionKind::ForceLogout => "force_logout",
            ActionKind::ScheduleShutdown => "schedule_shutdown",
            ActionKind::RunCustomScript => "run_custom_script",
        }
    }

    /// Locking the session is the least destructive action and always runs
    /// first, regardless of configured priorities.
    pub fn is_always_first(self) -> bool {
        matches!(self, ActionKind::LockSession)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ExecutionMode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Parallel,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Sequential => f.write_str("sequential"),
            ExecutionMode::Parallel => f.write_str("parallel"),
        }
    }
}

// ---------------------------------------------------------------------------
// AfterTrigger
// ---------------------------------------------------------------------------

/// Where the state machine lands once a triggered run has finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AfterTrigger {
    /// Stay armed; leaving protection still requires an authenticated disarm.
    #[default]
    ReArm,
    Disarm,
}

impl AfterTrigger {
    pub fn landing_state(self) -> ArmState {
        match self {
            AfterTrigger::ReArm => ArmState::Armed,
            AfterTrigger::Disarm => ArmState::Disarmed,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
