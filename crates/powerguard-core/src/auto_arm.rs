use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::AutoArmConfig;
use crate::error::CoordinationError;
use crate::{deadline_after, lock};
use crate::signal::{AutoArmSignal, SignalKind};
use crate::types::ArmState;

/// What the coordinator arms. Implemented by [`crate::Guard`].
pub trait ArmTarget: Send + Sync {
    fn arm_state(&self) -> ArmState;
    /// Privileged transition Disarmed -> Armed; no authentication.
    fn arm_automatically(&self, reason: &str) -> Result<(), CoordinationError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    Disabled,
    NotQualifying,
    AlreadyProtected,
    Suspended,
    CoolingDown,
    AlreadyPending,
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IgnoreReason::Disabled => "auto-arm disabled",
            IgnoreReason::NotQualifying => "signal does not qualify",
            IgnoreReason::AlreadyProtected => "already protected",
            IgnoreReason::Suspended => "auto-arm suspended",
            IgnoreReason::CoolingDown => "inside auto-arm cooldown",
            IgnoreReason::AlreadyPending => "an auto-arm is already pending",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoArmDecision {
    /// Arming will happen after the warning delay unless cancelled.
    Scheduled { reason: String },
    Ignored(IgnoreReason),
}

struct CoordinatorState {
    config: AutoArmConfig,
    last_trigger: Option<Instant>,
    suspended_until: Option<Instant>,
    pending: Option<u64>,
    next_id: u64,
}

impl CoordinatorState {
    fn is_suspended(&self, now: Instant) -> bool {
        self.suspended_until.is_some_and(|until| now < until)
    }
}

struct CoordinatorInner {
    target: Arc<dyn ArmTarget>,
    state: Mutex<CoordinatorState>,
}

/// Debounces environmental signals into automatic arm requests.
///
/// Never disarms. The target's state is read before this coordinator's own
/// lock is taken, so the two are never held together.
#[derive(Clone)]
pub struct AutoArmCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl AutoArmCoordinator {
    pub fn new(target: Arc<dyn ArmTarget>, config: AutoArmConfig) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                target,
                state: Mutex::new(CoordinatorState {
                    config,
                    last_trigger: None,
                    suspended_until: None,
                    pending: None,
                    next_id: 0,
                }),
            }),
        }
    }

    pub fn config(&self) -> AutoArmConfig {
        lock(&self.inner.state).config.clone()
    }

    pub fn update_config(&self, config: AutoArmConfig) {
        lock(&self.inner.state).config = config;
    }

    pub fn handle_signal(&self, signal: &AutoArmSignal) -> AutoArmDecision {
        {
            let state = lock(&self.inner.state);
            if !state.config.enabled {
                return self.ignore(signal, IgnoreReason::Disabled);
            }
            if !qualifies(&state.config, signal) {
                return self.ignore(signal, IgnoreReason::NotQualifying);
            }
        }

        if self.inner.target.arm_state().is_protected() {
            return self.ignore(signal, IgnoreReason::AlreadyProtected);
        }

        let now = Instant::now();
        let (id, delay) = {
            let mut state = lock(&self.inner.state);
            if state.is_suspended(now) {
                return self.ignore(signal, IgnoreReason::Suspended);
            }
            if let Some(last) = state.last_trigger {
                if now.duration_since(last) < state.config.cooldown() {
                    return self.ignore(signal, IgnoreReason::CoolingDown);
                }
            }
            if state.pending.is_some() {
                return self.ignore(signal, IgnoreReason::AlreadyPending);
            }
            let id = state.next_id;
            state.next_id += 1;
            state.last_trigger = Some(now);
            state.pending = Some(id);
            (id, state.config.warning_delay())
        };

        let reason = signal.describe();
        info!(%reason, seconds = delay.as_secs(), "auto-arm scheduled");
        self.spawn_arm(id, delay, reason.clone());
        AutoArmDecision::Scheduled { reason }
    }

    /// Ignore signals for `duration` and drop any pending arm.
    pub fn suspend(&self, duration: Duration) {
        let mut state = lock(&self.inner.state);
        state.suspended_until = Some(deadline_after(Instant::now(), duration));
        if state.pending.take().is_some() {
            debug!("pending auto-arm dropped by suspend");
        }
        info!(seconds = duration.as_secs(), "auto-arm suspended");
    }

    pub fn resume(&self) {
        lock(&self.inner.state).suspended_until = None;
        info!("auto-arm resumed");
    }

    pub fn is_suspended(&self) -> bool {
        lock(&self.inner.state).is_suspended(Instant::now())
    }

    pub fn has_pending(&self) -> bool {
        lock(&self.inner.state).pending.is_some()
    }

    /// Abort an arm still inside its warning delay. Returns whether one was
    /// pending.
    pub fn cancel_pending(&self) -> bool {
        let cancelled = lock(&self.inner.state).pending.take().is_some();
        if cancelled {
            info!("pending auto-arm cancelled");
        }
        cancelled
    }

    /// Drain signals from an adapter channel until it closes.
    pub fn attach(&self, mut rx: mpsc::Receiver<AutoArmSignal>) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                coordinator.handle_signal(&signal);
            }
            debug!("auto-arm signal channel closed");
        })
    }

    fn spawn_arm(&self, id: u64, delay: Duration, reason: String) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut state = lock(&inner.state);
                if state.pending != Some(id) {
                    debug!("auto-arm was cancelled during warning delay");
                    return;
                }
                state.pending = None;
                if state.is_suspended(Instant::now()) {
                    return;
                }
            }
            match inner.target.arm_automatically(&reason) {
                Ok(()) => info!(%reason, "auto-armed"),
                Err(e) => debug!(error = %e, "auto-arm skipped"),
            }
        });
    }

    fn ignore(&self, signal: &AutoArmSignal, reason: IgnoreReason) -> AutoArmDecision {
        if reason == IgnoreReason::NotQualifying || reason == IgnoreReason::Disabled {
            debug!(kind = ?signal.kind, label = %signal.label, %reason, "auto-arm signal ignored");
        } else {
            warn!(kind = ?signal.kind, label = %signal.label, %reason, "auto-arm signal ignored");
        }
        AutoArmDecision::Ignored(reason)
    }
}

fn qualifies(config: &AutoArmConfig, signal: &AutoArmSignal) -> bool {
    match signal.kind {
        SignalKind::LeftTrustedLocation => config.on_location_exit,
        SignalKind::JoinedUntrustedNetwork => {
            config.on_untrusted_network && !config.trusted_networks.contains(&signal.label)
        }
        SignalKind::EnteredTrustedLocation
        | SignalKind::JoinedTrustedNetwork
        | SignalKind::NetworkLost => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::TrustedNetworks;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Target {
        state: Mutex<ArmState>,
        arms: AtomicUsize,
    }

    impl Target {
        fn new(state: ArmState) -> Arc<Self> {
            Arc::new(Self {
                state: Mutex::new(state),
                arms: AtomicUsize::new(0),
            })
        }

        fn arms(&self) -> usize {
            self.arms.load(Ordering::SeqCst)
        }
    }

    impl ArmTarget for Target {
        fn arm_state(&self) -> ArmState {
            *self.state.lock().unwrap()
        }

        fn arm_automatically(&self, _reason: &str) -> Result<(), CoordinationError> {
            let mut state = self.state.lock().unwrap();
            if *state != ArmState::Disarmed {
                return Err(CoordinationError::AlreadyArmed);
            }
            *state = ArmState::Armed;
            self.arms.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn enabled() -> AutoArmConfig {
        AutoArmConfig {
            enabled: true,
            trusted_networks: TrustedNetworks::new(vec!["HomeNet".into()]),
            ..AutoArmConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn left_location_arms_after_warning_delay() {
        let target = Target::new(ArmState::Disarmed);
        let coordinator = AutoArmCoordinator::new(target.clone(), enabled());

        let decision = coordinator.handle_signal(&AutoArmSignal::left_location("home"));
        assert!(matches!(decision, AutoArmDecision::Scheduled { .. }));
        assert_eq!(target.arms(), 0);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(target.arms(), 1);
        assert_eq!(target.arm_state(), ArmState::Armed);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_signals_arms_once() {
        let target = Target::new(ArmState::Disarmed);
        let coordinator = AutoArmCoordinator::new(target.clone(), enabled());

        coordinator.handle_signal(&AutoArmSignal::left_location("home"));
        tokio::time::advance(Duration::from_secs(1)).await;
        let second = coordinator.handle_signal(&AutoArmSignal::network(
            SignalKind::JoinedUntrustedNetwork,
            "CafeFreeWifi",
        ));
        assert!(matches!(second, AutoArmDecision::Ignored(_)));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(target.arms(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn already_armed_ignores_signals() {
        let target = Target::new(ArmState::Armed);
        let coordinator = AutoArmCoordinator::new(target.clone(), enabled());
        assert_eq!(
            coordinator.handle_signal(&AutoArmSignal::left_location("home")),
            AutoArmDecision::Ignored(IgnoreReason::AlreadyProtected)
        );
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(target.arms(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_suspension_holds_until_resumed() {
        let target = Target::new(ArmState::Disarmed);
        let coordinator = AutoArmCoordinator::new(target.clone(), enabled());
        coordinator.suspend(Duration::from_secs(u64::MAX));
        assert!(coordinator.is_suspended());
        assert_eq!(
            coordinator.handle_signal(&AutoArmSignal::left_location("home")),
            AutoArmDecision::Ignored(IgnoreReason::Suspended)
        );

        coordinator.resume();
        assert!(matches!(
            coordinator.handle_signal(&AutoArmSignal::left_location("home")),
            AutoArmDecision::Scheduled { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn updated_config_applies_to_next_signal() {
        let target = Target::new(ArmState::Disarmed);
        let coordinator = AutoArmCoordinator::new(target.clone(), enabled());
        assert!(coordinator.config().enabled);

        coordinator.update_config(AutoArmConfig {
            enabled: false,
            ..enabled()
        });
        assert!(!coordinator.config().enabled);
        assert_eq!(
            coordinator.handle_signal(&AutoArmSignal::left_location("home")),
            AutoArmDecision::Ignored(IgnoreReason::Disabled)
        );
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(target.arms(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_blocks_repeat_until_elapsed() {
        let target = Target::new(ArmState::Disarmed);
        let coordinator = AutoArmCoordinator::new(target.clone(), enabled());
        coordinator.handle_signal(&AutoArmSignal::left_location("home"));
        tokio::time::sleep(Duration::from_secs(3)).await;
        *target.state.lock().unwrap() = ArmState::Disarmed;

        assert_eq!(
            coordinator.handle_signal(&AutoArmSignal::left_location("office")),
            AutoArmDecision::Ignored(IgnoreReason::CoolingDown)
        );
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(matches!(
            coordinator.handle_signal(&AutoArmSignal::left_location("office")),
            AutoArmDecision::Scheduled { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn trusted_and_non_qualifying_signals_ignored() {
        let target = Target::new(ArmState::Disarmed);
        let coordinator = AutoArmCoordinator::new(target.clone(), enabled());
        for signal in [
            AutoArmSignal::network(SignalKind::JoinedTrustedNetwork, "HomeNet"),
            AutoArmSignal::network(SignalKind::JoinedUntrustedNetwork, "HomeNet"),
            AutoArmSignal::network(SignalKind::NetworkLost, ""),
            AutoArmSignal::entered_location("home"),
        ] {
            assert_eq!(
                coordinator.handle_signal(&signal),
                AutoArmDecision::Ignored(IgnoreReason::NotQualifying)
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_coordinator_does_nothing() {
        let target = Target::new(ArmState::Disarmed);
        let coordinator = AutoArmCoordinator::new(target.clone(), AutoArmConfig::default());
        assert_eq!(
            coordinator.handle_signal(&AutoArmSignal::left_location("home")),
            AutoArmDecision::Ignored(IgnoreReason::Disabled)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn suspend_drops_pending_and_blocks_new_signals() {
        let target = Target::new(ArmState::Disarmed);
        let coordinator = AutoArmCoordinator::new(target.clone(), enabled());
        coordinator.handle_signal(&AutoArmSignal::left_location("home"));
        coordinator.suspend(Duration::from_secs(60));
        assert!(!coordinator.has_pending());

        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(
            coordinator.handle_signal(&AutoArmSignal::left_location("home")),
            AutoArmDecision::Ignored(IgnoreReason::Suspended)
        );
        assert_eq!(target.arms(), 0);

        coordinator.resume();
        assert!(matches!(
            coordinator.handle_signal(&AutoArmSignal::left_location("home")),
            AutoArmDecision::Scheduled { .. }
        ));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(target.arms(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn suspension_expires() {
        let target = Target::new(ArmState::Disarmed);
        let coordinator = AutoArmCoordinator::new(target.clone(), enabled());
        coordinator.suspend(Duration::from_secs(10));
        assert!(coordinator.is_suspended());
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!coordinator.is_suspended());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_pending_aborts_arm() {
        let target = Target::new(ArmState::Disarmed);
        let coordinator = AutoArmCoordinator::new(target.clone(), enabled());
        coordinator.handle_signal(&AutoArmSignal::left_location("home"));
        assert!(coordinator.cancel_pending());
        assert!(!coordinator.cancel_pending());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(target.arms(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn attached_channel_feeds_signals() {
        let target = Target::new(ArmState::Disarmed);
        let coordinator = AutoArmCoordinator::new(target.clone(), enabled());
        let (tx, rx) = mpsc::channel(8);
        let handle = coordinator.attach(rx);
        tx.send(AutoArmSignal::left_location("home")).await.unwrap();
        drop(tx);
        handle.await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(target.arms(), 1);
    }
}
