use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, trace, warn};

use crate::action::{
    ActionConfiguration, ActionExecutor, ActionParams, ExecutionResult,
};
use crate::auth::{AuthChallenge, AuthGate, AuthPolicy};
use crate::auto_arm::ArmTarget;
use crate::config::Config;
use crate::engine::ActionEngine;
use crate::error::{ActionError, Confirmation, CoordinationError, GuardError, Result};
use crate::event::{GuardEvent, TransitionCause};
use crate::{deadline_after, lock};
use crate::signal::{PowerSource, PowerStatus};
use crate::types::{ActionKind, AfterTrigger, ArmState};

const TICK: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// GuardSettings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardSettings {
    /// Countdown between power loss and the trigger. Zero fires immediately.
    pub grace_period: Duration,
    /// Power loss within this long after a trigger is ignored.
    pub post_trigger_cooldown: Duration,
    pub after_trigger: AfterTrigger,
    pub require_auth_for_arm: bool,
    pub biometric_only: bool,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(10),
            post_trigger_cooldown: Duration::from_secs(30),
            after_trigger: AfterTrigger::default(),
            require_auth_for_arm: true,
            biometric_only: false,
        }
    }
}

// ---------------------------------------------------------------------------
// PowerResponse
// ---------------------------------------------------------------------------

/// What the state machine did with a power reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerResponse {
    /// Not armed, or power came back.
    Ignored,
    /// A grace period or run is already underway.
    Absorbed,
    /// Inside the post-trigger cooldown.
    CoolingDown,
    GraceStarted { deadline: Instant },
    /// Zero grace period: actions were dispatched straight away.
    Triggered,
}

// ---------------------------------------------------------------------------
// Core state
// ---------------------------------------------------------------------------

/// The single live grace period. Dropping it cancels the timer task.
struct GraceTimer {
    id: u64,
    deadline: Instant,
    _cancel: oneshot::Sender<()>,
}

struct Core {
    state: ArmState,
    grace: Option<GraceTimer>,
    next_timer_id: u64,
    last_trigger: Option<Instant>,
    trigger_count: u64,
    alarm_sounding: bool,
    settings: GuardSettings,
}

struct Inner {
    core: Mutex<Core>,
    auth: AuthGate,
    engine: ActionEngine,
    power: Arc<dyn PowerSource>,
    events: broadcast::Sender<GuardEvent>,
}

// ---------------------------------------------------------------------------
// Guard
// ---------------------------------------------------------------------------

/// Arm/disarm state machine and owner of the grace-period timer.
///
/// Cheap to clone; every clone shares one state. All transitions go through
/// a single lock that is never held across an `.await`, so authentication
/// prompts, the countdown, and action runs never block each other's
/// bookkeeping.
///
/// ```text
/// Disarmed --arm--> Armed --power loss--> GracePeriod --deadline--> ActionsExecuting
///                     ^                        |                          |
///                     +-------- cancel --------+                          |
///                     +------------------- result (re-arm policy) -------+
/// any protected state --disarm--> Disarmed
/// ```
#[derive(Clone)]
pub struct Guard {
    inner: Arc<Inner>,
}

impl Guard {
    pub fn new(
        settings: GuardSettings,
        auth: AuthGate,
        engine: ActionEngine,
        power: Arc<dyn PowerSource>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                core: Mutex::new(Core {
                    state: ArmState::Disarmed,
                    grace: None,
                    next_timer_id: 0,
                    last_trigger: None,
                    trigger_count: 0,
                    alarm_sounding: false,
                    settings,
                }),
                auth,
                engine,
                power,
                events,
            }),
        }
    }

    /// Wire a guard from a loaded config and the platform collaborators.
    pub fn from_config(
        config: &Config,
        challenge: Arc<dyn AuthChallenge>,
        executor: Arc<dyn ActionExecutor>,
        power: Arc<dyn PowerSource>,
    ) -> Self {
        Self::new(
            config.guard_settings(),
            AuthGate::new(challenge, config.auth.limits()),
            ActionEngine::new(executor, config.actions.clone()),
            power,
        )
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn state(&self) -> ArmState {
        lock(&self.inner.core).state
    }

    pub fn grace_deadline(&self) -> Option<Instant> {
        lock(&self.inner.core).grace.as_ref().map(|g| g.deadline)
    }

    pub fn settings(&self) -> GuardSettings {
        lock(&self.inner.core).settings.clone()
    }

    /// New settings apply from the next grace period; a running countdown
    /// keeps its deadline.
    pub fn update_settings(&self, settings: GuardSettings) {
        lock(&self.inner.core).settings = settings;
    }

    pub fn action_configuration(&self) -> ActionConfiguration {
        self.inner.engine.configuration()
    }

    pub fn update_action_configuration(&self, config: ActionConfiguration) {
        self.inner.engine.update_configuration(config);
    }

    pub fn auth(&self) -> &AuthGate {
        &self.inner.auth
    }

    pub fn engine(&self) -> &ActionEngine {
        &self.inner.engine
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GuardEvent> {
        self.inner.events.subscribe()
    }

    pub fn events(&self) -> BroadcastStream<GuardEvent> {
        BroadcastStream::new(self.subscribe())
    }

    // -----------------------------------------------------------------------
    // User requests
    // -----------------------------------------------------------------------

    /// Disarmed -> Armed. Arming while on battery needs `confirm_no_power`.
    pub async fn request_arm(&self, confirm_no_power: bool) -> Result<()> {
        let (state, settings) = {
            let core = lock(&self.inner.core);
            (core.state, core.settings.clone())
        };
        if state != ArmState::Disarmed {
            return Err(CoordinationError::AlreadyArmed.into());
        }
        if self.inner.power.current() == PowerStatus::Disconnected && !confirm_no_power {
            return Err(CoordinationError::ConfirmationRequired(Confirmation::NoPower).into());
        }
        if settings.require_auth_for_arm {
            self.authenticate("Arm theft protection", AuthPolicy::standard())
                .await?;
        }
        self.arm(TransitionCause::Arm)
            .map_err(GuardError::from)
    }

    /// Any protected state -> Disarmed. While actions execute this needs
    /// `force`, since dispatched actions cannot be recalled.
    pub async fn request_disarm(&self, force: bool) -> Result<()> {
        check_disarm(self.state(), force)?;
        self.authenticate("Disarm theft protection", AuthPolicy::fresh())
            .await?;

        let (from, stop_alarm) = {
            let mut core = lock(&self.inner.core);
            // State may have moved while the prompt was up.
            check_disarm(core.state, force)?;
            let from = core.state;
            core.state = ArmState::Disarmed;
            core.grace = None;
            (from, std::mem::take(&mut core.alarm_sounding))
        };

        let cause = if from == ArmState::ActionsExecuting {
            warn!("force disarm: dispatched actions were not recalled");
            TransitionCause::ForceDisarm
        } else {
            TransitionCause::Disarm
        };
        info!(%from, "disarmed");
        self.emit_transition(from, ArmState::Disarmed, cause);

        if stop_alarm {
            self.silence().await;
        }
        Ok(())
    }

    /// GracePeriod -> Armed, if the deadline has not passed yet.
    pub async fn cancel_pending_trigger(&self) -> Result<()> {
        let observed_triggers = {
            let core = lock(&self.inner.core);
            match core.state {
                ArmState::GracePeriod => core.trigger_count,
                ArmState::ActionsExecuting => return Err(CoordinationError::TooLate.into()),
                _ => return Err(CoordinationError::NoPendingTrigger.into()),
            }
        };

        self.authenticate("Cancel the pending theft response", AuthPolicy::fresh())
            .await?;

        {
            let mut core = lock(&self.inner.core);
            if core.trigger_count != observed_triggers {
                warn!("cancel arrived after the grace period expired");
                return Err(CoordinationError::TooLate.into());
            }
            if core.state != ArmState::GracePeriod {
                return Err(CoordinationError::NoPendingTrigger.into());
            }
            core.grace = None;
            core.state = ArmState::Armed;
        }

        info!("pending trigger cancelled");
        self.emit_transition(
            ArmState::GracePeriod,
            ArmState::Armed,
            TransitionCause::GraceCancelled,
        );
        Ok(())
    }

    /// Stop a sounding alarm without changing protection state.
    pub async fn stop_alarm(&self) -> Result<()> {
        self.authenticate("Stop the alarm", AuthPolicy::fresh())
            .await?;
        lock(&self.inner.core).alarm_sounding = false;
        self.inner
            .engine
            .perform_single(&ActionParams::StopAlarm)
            .await
            .map_err(GuardError::from)
    }

    // -----------------------------------------------------------------------
    // Power
    // -----------------------------------------------------------------------

    pub fn handle_power(&self, status: PowerStatus) -> PowerResponse {
        if status == PowerStatus::Connected {
            debug!("external power connected");
            return PowerResponse::Ignored;
        }

        let now = Instant::now();
        let (id, deadline, duration) = {
            let mut core = lock(&self.inner.core);
            match core.state {
                ArmState::Disarmed => {
                    debug!("power lost while disarmed");
                    return PowerResponse::Ignored;
                }
                ArmState::GracePeriod | ArmState::ActionsExecuting => {
                    debug!(state = %core.state, "duplicate power loss absorbed");
                    return PowerResponse::Absorbed;
                }
                ArmState::Armed => {}
            }
            if let Some(last) = core.last_trigger {
                if now.duration_since(last) < core.settings.post_trigger_cooldown {
                    info!("power loss within post-trigger cooldown ignored");
                    return PowerResponse::CoolingDown;
                }
            }

            let duration = core.settings.grace_period;
            let deadline = deadline_after(now, duration);
            let id = core.next_timer_id;
            core.next_timer_id += 1;
            let (cancel_tx, cancel_rx) = oneshot::channel();
            core.grace = Some(GraceTimer {
                id,
                deadline,
                _cancel: cancel_tx,
            });
            core.state = ArmState::GracePeriod;
            if !duration.is_zero() {
                self.spawn_grace_timer(id, deadline, cancel_rx);
            }
            (id, deadline, duration)
        };

        warn!(seconds = duration.as_secs(), "power lost while armed; grace period started");
        self.emit_transition(
            ArmState::Armed,
            ArmState::GracePeriod,
            TransitionCause::PowerLoss,
        );

        if duration.is_zero() {
            self.fire(id);
            return PowerResponse::Triggered;
        }
        self.emit(GuardEvent::GracePeriodTick {
            remaining_seconds: ceil_secs(duration),
        });
        PowerResponse::GraceStarted { deadline }
    }

    /// Drain power readings from an adapter channel until it closes.
    pub fn attach_power(&self, mut rx: mpsc::Receiver<PowerStatus>) -> JoinHandle<()> {
        let guard = self.clone();
        tokio::spawn(async move {
            while let Some(status) = rx.recv().await {
                guard.handle_power(status);
            }
            debug!("power channel closed");
        })
    }

    // -----------------------------------------------------------------------
    // Internal
    // -----------------------------------------------------------------------

    fn policy(&self, base: AuthPolicy) -> AuthPolicy {
        if lock(&self.inner.core).settings.biometric_only {
            base.without_fallback()
        } else {
            base
        }
    }

    async fn authenticate(&self, reason: &str, base: AuthPolicy) -> Result<()> {
        let policy = self.policy(base);
        self.inner
            .auth
            .authenticate(reason, policy)
            .await
            .map_err(GuardError::from)
    }

    fn arm(&self, cause: TransitionCause) -> std::result::Result<(), CoordinationError> {
        {
            let mut core = lock(&self.inner.core);
            if core.state != ArmState::Disarmed {
                return Err(CoordinationError::AlreadyArmed);
            }
            core.state = ArmState::Armed;
        }
        info!(?cause, "armed");
        self.emit_transition(ArmState::Disarmed, ArmState::Armed, cause);
        Ok(())
    }

    fn spawn_grace_timer(&self, id: u64, deadline: Instant, mut cancel: oneshot::Receiver<()>) {
        let guard = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + TICK, TICK);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut cancel => {
                        debug!(id, "grace timer cancelled");
                        return;
                    }
                    _ = tokio::time::sleep_until(deadline) => {
                        guard.fire(id);
                        return;
                    }
                    _ = ticker.tick() => {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        guard.emit(GuardEvent::GracePeriodTick {
                            remaining_seconds: ceil_secs(remaining),
                        });
                    }
                }
            }
        });
    }

    /// Deadline reached. Only the live timer can fire; a stale id is a no-op.
    fn fire(&self, id: u64) {
        let trigger = {
            let mut core = lock(&self.inner.core);
            let live = core.state == ArmState::GracePeriod
                && core.grace.as_ref().map(|g| g.id) == Some(id);
            if !live {
                debug!(id, "stale grace timer ignored");
                return;
            }
            core.grace = None;
            core.state = ArmState::ActionsExecuting;
            core.last_trigger = Some(Instant::now());
            core.trigger_count += 1;
            core.trigger_count
        };

        error!("grace period expired; executing protective actions");
        self.emit_transition(
            ArmState::GracePeriod,
            ArmState::ActionsExecuting,
            TransitionCause::GraceExpired,
        );

        let guard = self.clone();
        tokio::spawn(async move {
            let result = guard.run_actions().await;
            guard.finish_run(trigger, result).await;
        });
    }

    async fn run_actions(&self) -> ExecutionResult {
        let config = self.inner.engine.configuration();
        match self.inner.engine.execute_snapshot(config.clone()).await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "action engine unavailable; reporting all actions failed");
                ExecutionResult::all_failed(&config, ActionError::Unavailable(e.to_string()))
            }
        }
    }

    /// Land the run started by `trigger`. A run that was force-disarmed, and
    /// possibly superseded by a later trigger, leaves the state alone.
    async fn finish_run(&self, trigger: u64, result: ExecutionResult) {
        let alarm = result.executed.contains(&ActionKind::SoundAlarm);
        let (landed, superseded) = {
            let mut core = lock(&self.inner.core);
            let current = core.trigger_count == trigger;
            if core.state == ArmState::ActionsExecuting && current {
                let to = core.settings.after_trigger.landing_state();
                core.state = to;
                core.alarm_sounding |= alarm;
                (Some(to), false)
            } else {
                (None, !current)
            }
        };

        if !result.is_success() {
            warn!(
                failed = ?result.failed_kinds(),
                "some protective actions failed"
            );
        }
        self.emit(GuardEvent::ExecutionFinished { result });
        match landed {
            Some(to) => self.emit_transition(
                ArmState::ActionsExecuting,
                to,
                TransitionCause::ExecutionFinished,
            ),
            // A later trigger owns the alarm now.
            None if alarm && !superseded => self.silence().await,
            None => {}
        }
    }

    async fn silence(&self) {
        if let Err(e) = self
            .inner
            .engine
            .perform_single(&ActionParams::StopAlarm)
            .await
        {
            warn!(error = %e, "failed to stop alarm after disarm");
        }
    }

    fn emit(&self, event: GuardEvent) {
        trace!(event = event.name(), "guard event");
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    fn emit_transition(&self, from: ArmState, to: ArmState, cause: TransitionCause) {
        self.emit(GuardEvent::StateChanged { from, to, cause });
    }
}

impl ArmTarget for Guard {
    fn arm_state(&self) -> ArmState {
        self.state()
    }

    /// Arming is the safe direction, so environmental triggers skip the
    /// prompt. Disarming never does.
    fn arm_automatically(&self, reason: &str) -> std::result::Result<(), CoordinationError> {
        if self.inner.power.current() == PowerStatus::Disconnected {
            warn!(reason, "auto-arming while on battery");
        }
        self.arm(TransitionCause::AutoArm {
            reason: reason.to_string(),
        })
    }
}

fn check_disarm(state: ArmState, force: bool) -> std::result::Result<(), CoordinationError> {
    match state {
        ArmState::Disarmed => Err(CoordinationError::AlreadyDisarmed),
        ArmState::ActionsExecuting if !force => {
            Err(CoordinationError::ConfirmationRequired(Confirmation::ForceDisarm))
        }
        _ => Ok(()),
    }
}

fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs();
    if d.subsec_nanos() > 0 {
        secs.saturating_add(1)
    } else {
        secs
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
