mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::{rig, rig_with, settle, TestChallenge, TestExecutor};
use powerguard_core::action::{ActionConfiguration, ActionParams, ActionSpec};
use powerguard_core::auth::{AuthGate, AuthLimits, AuthPolicy};
use powerguard_core::auto_arm::AutoArmCoordinator;
use powerguard_core::config::AutoArmConfig;
use powerguard_core::error::{
    ActionError, AuthError, Confirmation, CoordinationError, GuardError,
};
use powerguard_core::event::{GuardEvent, TransitionCause};
use powerguard_core::machine::PowerResponse;
use powerguard_core::signal::{AutoArmSignal, PowerStatus};
use powerguard_core::types::{ActionKind, ArmState, ExecutionMode};
use powerguard_core::GuardSettings;
use tokio::sync::broadcast;

fn lock_alarm_shutdown(mode: ExecutionMode) -> ActionConfiguration {
    ActionConfiguration {
        mode,
        pre_delay_seconds: 0,
        items: vec![
            ActionSpec::new(ActionParams::ScheduleShutdown { delay_seconds: 0 }, 20),
            ActionSpec::new(
                ActionParams::SoundAlarm {
                    volume: 100,
                    sound: None,
                },
                10,
            ),
            ActionSpec::new(ActionParams::LockSession, 50),
        ],
    }
}

fn drain(rx: &mut broadcast::Receiver<GuardEvent>) -> Vec<GuardEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn transitions(events: &[GuardEvent]) -> Vec<(ArmState, ArmState)> {
    events
        .iter()
        .filter_map(|e| match e {
            GuardEvent::StateChanged { from, to, .. } => Some((*from, *to)),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn full_lifecycle_follows_transition_table() {
    let r = rig();
    let mut rx = r.guard.subscribe();

    r.guard.request_arm(false).await.unwrap();
    r.guard.handle_power(PowerStatus::Disconnected);
    r.guard.cancel_pending_trigger().await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    r.guard.handle_power(PowerStatus::Disconnected);
    tokio::time::sleep(Duration::from_secs(11)).await;
    settle().await;
    r.guard.request_disarm(false).await.unwrap();

    use ArmState::*;
    assert_eq!(
        transitions(&drain(&mut rx)),
        vec![
            (Disarmed, Armed),
            (Armed, GracePeriod),
            (GracePeriod, Armed),
            (Armed, GracePeriod),
            (GracePeriod, ActionsExecuting),
            (ActionsExecuting, Armed),
            (Armed, Disarmed),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn power_loss_during_grace_keeps_single_timer() {
    let r = rig();
    let mut rx = r.guard.subscribe();
    r.guard.request_arm(false).await.unwrap();

    let deadline = match r.guard.handle_power(PowerStatus::Disconnected) {
        PowerResponse::GraceStarted { deadline } => deadline,
        other => panic!("expected grace period, got {other:?}"),
    };
    for _ in 0..5 {
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(
            r.guard.handle_power(PowerStatus::Disconnected),
            PowerResponse::Absorbed
        );
        assert_eq!(r.guard.grace_deadline(), Some(deadline));
    }

    tokio::time::sleep(Duration::from_secs(10)).await;
    settle().await;
    assert_eq!(
        r.executor.calls(),
        vec![ActionKind::LockSession, ActionKind::SoundAlarm]
    );
    let finished = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, GuardEvent::ExecutionFinished { .. }))
        .count();
    assert_eq!(finished, 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_strictly_before_deadline_runs_nothing() {
    let r = rig();
    r.guard.request_arm(false).await.unwrap();
    r.guard.handle_power(PowerStatus::Disconnected);
    tokio::time::sleep(Duration::from_millis(9_900)).await;

    r.guard.cancel_pending_trigger().await.unwrap();
    assert_eq!(r.guard.state(), ArmState::Armed);
    tokio::time::sleep(Duration::from_secs(60)).await;
    settle().await;
    assert!(r.executor.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancel_after_deadline_is_too_late_and_actions_run_once() {
    let executor = TestExecutor {
        delays: HashMap::from([(ActionKind::SoundAlarm, Duration::from_secs(5))]),
        ..TestExecutor::default()
    };
    let r = rig_with(
        GuardSettings::default(),
        ActionConfiguration::default(),
        TestChallenge::accepting(),
        executor,
    );
    r.guard.request_arm(false).await.unwrap();
    r.guard.handle_power(PowerStatus::Disconnected);
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(r.guard.state(), ArmState::ActionsExecuting);

    let err = r.guard.cancel_pending_trigger().await.unwrap_err();
    assert!(matches!(
        err,
        GuardError::Coordination(CoordinationError::TooLate)
    ));

    tokio::time::sleep(Duration::from_secs(10)).await;
    settle().await;
    assert_eq!(
        r.executor.calls(),
        vec![ActionKind::LockSession, ActionKind::SoundAlarm]
    );
    assert_eq!(r.guard.state(), ArmState::Armed);
}

#[tokio::test(start_paused = true)]
async fn fourth_failure_inside_window_fails_fast() {
    let challenge = TestChallenge::accepting();
    challenge.set(Err(AuthError::Failed));
    let gate = AuthGate::new(challenge.clone(), AuthLimits::default());

    for _ in 0..3 {
        let err = gate
            .authenticate("Disarm theft protection", AuthPolicy::fresh())
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::Failed);
        tokio::time::advance(Duration::from_secs(1)).await;
    }
    let err = gate
        .authenticate("Disarm theft protection", AuthPolicy::fresh())
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::RateLimited { .. }));
    assert_eq!(challenge.calls(), 3);

    tokio::time::advance(Duration::from_secs(31)).await;
    challenge.set(Ok(()));
    gate.authenticate("Disarm theft protection", AuthPolicy::fresh())
        .await
        .unwrap();
    assert_eq!(challenge.calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn failed_auth_leaves_state_unchanged() {
    let r = rig();
    r.guard.request_arm(false).await.unwrap();
    r.challenge.set(Err(AuthError::UserCancelled));
    let err = r.guard.request_disarm(false).await.unwrap_err();
    assert!(matches!(err, GuardError::Auth(AuthError::UserCancelled)));
    assert_eq!(r.guard.state(), ArmState::Armed);
    assert!(r.guard.auth().attempts().iter().all(|a| a.success));
}

#[tokio::test(start_paused = true)]
async fn sequential_run_continues_past_failed_alarm() {
    let executor = TestExecutor {
        failures: HashMap::from([(
            ActionKind::SoundAlarm,
            ActionError::AlarmFailed("no audio device".into()),
        )]),
        ..TestExecutor::default()
    };
    let r = rig_with(
        GuardSettings::default(),
        lock_alarm_shutdown(ExecutionMode::Sequential),
        TestChallenge::accepting(),
        executor,
    );
    let mut rx = r.guard.subscribe();
    r.guard.request_arm(false).await.unwrap();
    r.guard.handle_power(PowerStatus::Disconnected);
    tokio::time::sleep(Duration::from_secs(11)).await;
    settle().await;

    let result = drain(&mut rx)
        .into_iter()
        .find_map(|e| match e {
            GuardEvent::ExecutionFinished { result } => Some(result),
            _ => None,
        })
        .expect("execution result published");
    assert_eq!(
        result.executed,
        vec![ActionKind::LockSession, ActionKind::ScheduleShutdown]
    );
    assert_eq!(result.failed_kinds(), vec![ActionKind::SoundAlarm]);
    assert_eq!(
        result.failed[0].error,
        ActionError::AlarmFailed("no audio device".into())
    );
}

#[tokio::test(start_paused = true)]
async fn parallel_run_waits_for_slow_action() {
    let executor = TestExecutor {
        failures: HashMap::from([(
            ActionKind::SoundAlarm,
            ActionError::AlarmFailed("no audio device".into()),
        )]),
        delays: HashMap::from([(ActionKind::ScheduleShutdown, Duration::from_secs(3))]),
        ..TestExecutor::default()
    };
    let r = rig_with(
        GuardSettings {
            grace_period: Duration::ZERO,
            ..GuardSettings::default()
        },
        lock_alarm_shutdown(ExecutionMode::Parallel),
        TestChallenge::accepting(),
        executor,
    );
    let mut rx = r.guard.subscribe();
    r.guard.request_arm(false).await.unwrap();
    assert_eq!(
        r.guard.handle_power(PowerStatus::Disconnected),
        PowerResponse::Triggered
    );

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(r.guard.state(), ArmState::ActionsExecuting);
    assert!(drain(&mut rx)
        .iter()
        .all(|e| !matches!(e, GuardEvent::ExecutionFinished { .. })));

    tokio::time::sleep(Duration::from_secs(3)).await;
    settle().await;
    let result = drain(&mut rx)
        .into_iter()
        .find_map(|e| match e {
            GuardEvent::ExecutionFinished { result } => Some(result),
            _ => None,
        })
        .expect("execution result published");
    let mut executed = result.executed.clone();
    executed.sort_by_key(|k| k.as_str());
    assert_eq!(
        executed,
        vec![ActionKind::LockSession, ActionKind::ScheduleShutdown]
    );
    assert_eq!(result.failed_kinds(), vec![ActionKind::SoundAlarm]);
    assert_eq!(r.guard.state(), ArmState::Armed);
}

#[tokio::test(start_paused = true)]
async fn busy_engine_at_fire_time_reports_all_failed() {
    let executor = TestExecutor {
        delays: HashMap::from([(ActionKind::LockSession, Duration::from_secs(60))]),
        ..TestExecutor::default()
    };
    let r = rig_with(
        GuardSettings {
            grace_period: Duration::ZERO,
            ..GuardSettings::default()
        },
        ActionConfiguration::default(),
        TestChallenge::accepting(),
        executor,
    );
    let mut rx = r.guard.subscribe();

    let guard = r.guard.clone();
    let manual = tokio::spawn(async move { guard.engine().execute().await });
    settle().await;
    assert!(r.guard.engine().is_executing());

    r.guard.request_arm(false).await.unwrap();
    r.guard.handle_power(PowerStatus::Disconnected);
    settle().await;

    let result = drain(&mut rx)
        .into_iter()
        .find_map(|e| match e {
            GuardEvent::ExecutionFinished { result } => Some(result),
            _ => None,
        })
        .expect("execution result published");
    assert!(result.executed.is_empty());
    assert_eq!(
        result.failed_kinds(),
        vec![ActionKind::LockSession, ActionKind::SoundAlarm]
    );
    assert!(result
        .failed
        .iter()
        .all(|f| matches!(f.error, ActionError::Unavailable(_))));
    assert_eq!(r.guard.state(), ArmState::Armed);

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert!(manual.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn force_disarm_while_executing() {
    let executor = TestExecutor {
        delays: HashMap::from([(ActionKind::LockSession, Duration::from_secs(5))]),
        ..TestExecutor::default()
    };
    let r = rig_with(
        GuardSettings {
            grace_period: Duration::ZERO,
            ..GuardSettings::default()
        },
        ActionConfiguration::default(),
        TestChallenge::accepting(),
        executor,
    );
    let mut rx = r.guard.subscribe();
    r.guard.request_arm(false).await.unwrap();
    r.guard.handle_power(PowerStatus::Disconnected);
    settle().await;

    let err = r.guard.request_disarm(false).await.unwrap_err();
    assert!(matches!(
        err,
        GuardError::Coordination(CoordinationError::ConfirmationRequired(
            Confirmation::ForceDisarm
        ))
    ));
    r.guard.request_disarm(true).await.unwrap();
    assert_eq!(r.guard.state(), ArmState::Disarmed);

    // The dispatched run still completes but no longer moves the state.
    tokio::time::sleep(Duration::from_secs(6)).await;
    settle().await;
    assert_eq!(r.guard.state(), ArmState::Disarmed);
    let causes: Vec<TransitionCause> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            GuardEvent::StateChanged { cause, .. } => Some(cause),
            _ => None,
        })
        .collect();
    assert!(causes.contains(&TransitionCause::ForceDisarm));
    assert!(!causes.contains(&TransitionCause::ExecutionFinished));
    assert_eq!(r.executor.calls().last(), Some(&ActionKind::StopAlarm));
}

fn auto_arm_enabled() -> AutoArmConfig {
    AutoArmConfig {
        enabled: true,
        cooldown_seconds: 30,
        warning_delay_seconds: 2,
        ..AutoArmConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn location_signals_while_armed_do_not_arm_again() {
    let r = rig();
    r.guard.request_arm(false).await.unwrap();
    let mut rx = r.guard.subscribe();
    let coordinator = AutoArmCoordinator::new(Arc::new(r.guard.clone()), auto_arm_enabled());

    coordinator.handle_signal(&AutoArmSignal::left_location("home"));
    tokio::time::advance(Duration::from_secs(1)).await;
    coordinator.handle_signal(&AutoArmSignal::left_location("home"));
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(transitions(&drain(&mut rx)).is_empty());
    assert_eq!(r.guard.state(), ArmState::Armed);
}

#[tokio::test(start_paused = true)]
async fn location_signals_while_disarmed_arm_exactly_once() {
    let r = rig();
    let mut rx = r.guard.subscribe();
    let coordinator = AutoArmCoordinator::new(Arc::new(r.guard.clone()), auto_arm_enabled());

    coordinator.handle_signal(&AutoArmSignal::left_location("home"));
    tokio::time::advance(Duration::from_secs(1)).await;
    coordinator.handle_signal(&AutoArmSignal::left_location("home"));
    tokio::time::sleep(Duration::from_secs(5)).await;

    let events = drain(&mut rx);
    let auto_arms = events
        .iter()
        .filter(|e| {
            matches!(
                e,
                GuardEvent::StateChanged {
                    cause: TransitionCause::AutoArm { .. },
                    ..
                }
            )
        })
        .count();
    assert_eq!(auto_arms, 1);
    assert_eq!(r.guard.state(), ArmState::Armed);
    assert_eq!(r.challenge.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn attached_power_channel_drives_the_machine() {
    let r = rig();
    r.guard.request_arm(false).await.unwrap();
    let (tx, rx) = tokio::sync::mpsc::channel(8);
    let handle = r.guard.attach_power(rx);

    tx.send(PowerStatus::Disconnected).await.unwrap();
    settle().await;
    assert_eq!(r.guard.state(), ArmState::GracePeriod);

    drop(tx);
    handle.await.unwrap();
}
