use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

// ---------------------------------------------------------------------------
// AuthError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("authentication is not available on this device")]
    Unavailable,

    #[error("no biometric identity is enrolled")]
    NotEnrolled,

    #[error("biometry is locked out by the system; use your password")]
    LockedOut,

    #[error("authentication was cancelled")]
    UserCancelled,

    #[error("password fallback was chosen but is not allowed here")]
    UserFallbackChosen,

    #[error("authentication was cancelled by the system")]
    SystemCancelled,

    #[error("no passcode is set on this device")]
    NoPasscode,

    #[error("authentication failed")]
    Failed,

    #[error("too many failed attempts; try again in {}s", .retry_after.as_secs().max(1))]
    RateLimited { retry_after: Duration },

    #[error("invalid authentication reason: {0}")]
    InvalidReason(String),

    #[error("another authentication is already in progress")]
    InProgress,

    #[error("unknown authentication error: {0}")]
    Unknown(String),
}

impl AuthError {
    /// Whether this outcome counts against the failure window.
    ///
    /// Dismissals and environment problems are not failed attempts.
    pub fn counts_as_failure(&self) -> bool {
        matches!(
            self,
            AuthError::Failed | AuthError::LockedOut | AuthError::Unknown(_)
        )
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            AuthError::UserCancelled | AuthError::SystemCancelled | AuthError::UserFallbackChosen
        )
    }
}

// ---------------------------------------------------------------------------
// ActionError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "error", content = "detail", rename_all = "snake_case")]
pub enum ActionError {
    #[error("failed to lock session: {0}")]
    LockFailed(String),

    #[error("failed to sound alarm: {0}")]
    AlarmFailed(String),

    #[error("failed to force logout: {0}")]
    LogoutFailed(String),

    #[error("failed to schedule shutdown: {0}")]
    ShutdownFailed(String),

    #[error("custom script not found: {}", .0.display())]
    ScriptNotFound(PathBuf),

    #[error("custom script exited with code {0}")]
    ScriptFailed(i32),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("action engine unavailable: {0}")]
    Unavailable(String),

    #[error("action crashed: {0}")]
    Crashed(String),
}

// ---------------------------------------------------------------------------
// CoordinationError
// ---------------------------------------------------------------------------

/// Confirmation a caller must give explicitly before a risky transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confirmation {
    /// Arming while the machine is already running on battery.
    NoPower,
    /// Disarming while dispatched actions cannot be recalled.
    ForceDisarm,
}

impl fmt::Display for Confirmation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Confirmation::NoPower => f.write_str("power is disconnected; arm anyway?"),
            Confirmation::ForceDisarm => {
                f.write_str("actions are executing and cannot be recalled; disarm anyway?")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinationError {
    #[error("actions are already executing")]
    AlreadyExecuting,

    #[error("protection is already armed")]
    AlreadyArmed,

    #[error("protection is already disarmed")]
    AlreadyDisarmed,

    #[error("no pending trigger to cancel")]
    NoPendingTrigger,

    #[error("too late: the grace period already expired")]
    TooLate,

    #[error("confirmation required: {0}")]
    ConfirmationRequired(Confirmation),
}

// ---------------------------------------------------------------------------
// GuardError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum GuardError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    #[error(transparent)]
    Action(#[from] ActionError),

    #[error("config not found at {}: run 'powerguard config init'", .0.display())]
    ConfigNotFound(PathBuf),

    #[error("home directory not found: set HOME environment variable")]
    HomeNotFound,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, GuardError>;
