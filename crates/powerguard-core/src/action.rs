use crate::error::ActionError;
use crate::types::{ActionKind, ExecutionMode};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// ActionParams
// ---------------------------------------------------------------------------

/// Kind-specific parameters. The tag doubles as the action kind, so a spec
/// can never carry parameters for a different kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionParams {
    LockSession,
    SoundAlarm {
        /// Percent, 0-100.
        #[serde(default = "default_volume")]
        volume: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sound: Option<PathBuf>,
    },
    StopAlarm,
    ForceLogout,
    ScheduleShutdown {
        #[serde(default)]
        delay_seconds: u64,
    },
    RunCustomScript {
        path: PathBuf,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        #[serde(default = "default_script_timeout")]
        timeout_seconds: u64,
    },
}

fn default_volume() -> u8 {
    100
}

fn default_script_timeout() -> u64 {
    30
}

impl ActionParams {
    pub fn kind(&self) -> ActionKind {
        match self {
            ActionParams::LockSession => ActionKind::LockSession,
            ActionParams::SoundAlarm { .. } => ActionKind::SoundAlarm,
            ActionParams::StopAlarm => ActionKind::StopAlarm,
            ActionParams::ForceLogout => ActionKind::ForceLogout,
            ActionParams::ScheduleShutdown { .. } => ActionKind::ScheduleShutdown,
            ActionParams::RunCustomScript { .. } => ActionKind::RunCustomScript,
        }
    }

    /// Parameters for kinds that need none, or sensible defaults otherwise.
    /// Returns `None` for kinds that cannot be defaulted (custom scripts).
    pub fn default_for(kind: ActionKind) -> Option<Self> {
        match kind {
            ActionKind::LockSession => Some(ActionParams::LockSession),
            ActionKind::SoundAlarm => Some(ActionParams::SoundAlarm {
                volume: default_volume(),
                sound: None,
            }),
            ActionKind::StopAlarm => Some(ActionParams::StopAlarm),
            ActionKind::ForceLogout => Some(ActionParams::ForceLogout),
            ActionKind::ScheduleShutdown => Some(ActionParams::ScheduleShutdown { delay_seconds: 0 }),
            ActionKind::RunCustomScript => None,
        }
    }
}

// ---------------------------------------------------------------------------
// ActionSpec / ActionConfiguration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Secondary ordering key; lower runs earlier. Lock always runs first.
    #[serde(default)]
    pub priority: u32,
    #[serde(flatten)]
    pub params: ActionParams,
}

fn default_enabled() -> bool {
    true
}

impl ActionSpec {
    pub fn new(params: ActionParams, priority: u32) -> Self {
        Self {
            enabled: true,
            priority,
            params,
        }
    }

    pub fn kind(&self) -> ActionKind {
        self.params.kind()
    }
}

/// Immutable per-run snapshot of what to do when a trigger fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionConfiguration {
    #[serde(default)]
    pub mode: ExecutionMode,
    /// Wait before the first action; a last chance before destructive steps.
    #[serde(default)]
    pub pre_delay_seconds: u64,
    #[serde(default = "default_items")]
    pub items: Vec<ActionSpec>,
}

fn default_items() -> Vec<ActionSpec> {
    vec![
        ActionSpec::new(ActionParams::LockSession, 0),
        ActionSpec::new(
            ActionParams::SoundAlarm {
                volume: default_volume(),
                sound: None,
            },
            10,
        ),
    ]
}

impl Default for ActionConfiguration {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            pre_delay_seconds: 0,
            items: default_items(),
        }
    }
}

impl ActionConfiguration {
    pub fn pre_delay(&self) -> Duration {
        Duration::from_secs(self.pre_delay_seconds)
    }

    /// Enabled actions in execution order.
    ///
    /// Lock runs first; the rest follow by `priority`, ties keeping their
    /// configured order (the sort is stable).
    pub fn plan(&self) -> Vec<&ActionSpec> {
        let mut plan: Vec<&ActionSpec> = self.items.iter().filter(|a| a.enabled).collect();
        plan.sort_by_key(|a| (!a.kind().is_always_first(), a.priority));
        plan
    }

    pub fn enabled_kinds(&self) -> Vec<ActionKind> {
        self.plan().iter().map(|a| a.kind()).collect()
    }

    pub fn is_enabled(&self, kind: ActionKind) -> bool {
        self.items.iter().any(|a| a.enabled && a.kind() == kind)
    }
}

// ---------------------------------------------------------------------------
// ExecutionResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedAction {
    pub kind: ActionKind,
    pub error: ActionError,
}

/// Summary of one run; produced once and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub run_id: Uuid,
    pub mode: ExecutionMode,
    pub executed: Vec<ActionKind>,
    pub failed: Vec<FailedAction>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionResult {
    pub(crate) fn new(mode: ExecutionMode) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            mode,
            executed: Vec::new(),
            failed: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub(crate) fn record(&mut self, kind: ActionKind, outcome: Result<(), ActionError>) {
        match outcome {
            Ok(()) => self.executed.push(kind),
            Err(error) => self.failed.push(FailedAction { kind, error }),
        }
    }

    /// Result for a run that never reached the executor: every enabled
    /// action is reported failed with the same error.
    pub fn all_failed(config: &ActionConfiguration, error: ActionError) -> Self {
        let mut result = Self::new(config.mode);
        for kind in config.enabled_kinds() {
            result.record(kind, Err(error.clone()));
        }
        result
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn attempted(&self) -> usize {
        self.executed.len() + self.failed.len()
    }

    pub fn failed_kinds(&self) -> Vec<ActionKind> {
        self.failed.iter().map(|f| f.kind).collect()
    }
}

// ---------------------------------------------------------------------------
// ActionExecutor
// ---------------------------------------------------------------------------

/// Performs the concrete mechanics of a single action.
///
/// Implementations must tolerate concurrent calls for different kinds.
pub trait ActionExecutor: Send + Sync {
    fn perform<'a>(
        &'a self,
        kind: ActionKind,
        params: &'a ActionParams,
    ) -> BoxFuture<'a, Result<(), ActionError>>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
