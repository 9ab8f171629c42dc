mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{rig_with, TestChallenge, TestExecutor};
use powerguard_core::action::ActionConfiguration;
use powerguard_core::auto_arm::AutoArmCoordinator;
use powerguard_core::config::AutoArmConfig;
use powerguard_core::signal::{AutoArmSignal, PowerStatus};
use powerguard_core::types::ArmState;
use powerguard_core::GuardSettings;
use tokio::task::JoinSet;

const ROUNDS: usize = 25;
const WORKERS: usize = 8;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_power_loss_and_suspend_stay_consistent() {
    for round in 0..ROUNDS {
        let r = rig_with(
            GuardSettings {
                grace_period: Duration::ZERO,
                post_trigger_cooldown: Duration::ZERO,
                ..GuardSettings::default()
            },
            ActionConfiguration::default(),
            TestChallenge::alternating(),
            TestExecutor::default(),
        );
        let coordinator = AutoArmCoordinator::new(
            Arc::new(r.guard.clone()),
            AutoArmConfig {
                enabled: true,
                cooldown_seconds: 0,
                warning_delay_seconds: 0,
                ..AutoArmConfig::default()
            },
        );

        let mut tasks = JoinSet::new();
        for _ in 0..WORKERS {
            let guard = r.guard.clone();
            tasks.spawn(async move {
                for _ in 0..10 {
                    guard.handle_power(PowerStatus::Disconnected);
                    tokio::task::yield_now().await;
                }
            });

            let c = coordinator.clone();
            tasks.spawn(async move {
                for _ in 0..10 {
                    c.suspend(Duration::from_millis(5));
                    c.handle_signal(&AutoArmSignal::left_location("home"));
                    c.resume();
                    c.handle_signal(&AutoArmSignal::left_location("home"));
                    tokio::task::yield_now().await;
                }
            });

            let guard = r.guard.clone();
            tasks.spawn(async move {
                let _ = guard.request_arm(true).await;
                let _ = guard.cancel_pending_trigger().await;
                let _ = guard.request_disarm(true).await;
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while r.guard.engine().is_executing()
                || r.guard.state() == ArmState::ActionsExecuting
            {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("round {round}: action run never finished"));

        assert!(!r.guard.engine().is_executing(), "round {round}");
        assert!(!r.guard.auth().is_in_flight(), "round {round}");
        assert_ne!(r.guard.state(), ArmState::GracePeriod, "round {round}");
        assert!(r.guard.grace_deadline().is_none(), "round {round}");

        let attempts = r.guard.auth().attempts();
        assert!(
            attempts.windows(2).all(|w| w[0].at <= w[1].at),
            "round {round}: attempt log out of order"
        );
        let failures = attempts.iter().filter(|a| !a.success).count();
        let successes = attempts.len() - failures;
        let challenge_failures = r.challenge.failures.load(Ordering::SeqCst);
        assert_eq!(failures, challenge_failures, "round {round}");
        assert_eq!(
            successes,
            r.challenge.calls() - challenge_failures,
            "round {round}"
        );
    }
}
