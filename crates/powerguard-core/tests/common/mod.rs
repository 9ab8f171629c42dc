#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use powerguard_core::action::{ActionConfiguration, ActionExecutor, ActionParams};
use powerguard_core::auth::{AuthChallenge, AuthGate, AuthLimits};
use powerguard_core::engine::ActionEngine;
use powerguard_core::error::{ActionError, AuthError};
use powerguard_core::signal::{LatestPower, PowerStatus};
use powerguard_core::types::ActionKind;
use powerguard_core::{Guard, GuardSettings};

/// Challenge whose answer the test flips at will. Optionally alternates
/// between success and failure on every call.
pub struct TestChallenge {
    outcome: Mutex<Result<(), AuthError>>,
    alternate: bool,
    pub calls: AtomicUsize,
    pub failures: AtomicUsize,
}

impl TestChallenge {
    pub fn accepting() -> Arc<Self> {
        Arc::new(Self {
            outcome: Mutex::new(Ok(())),
            alternate: false,
            calls: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        })
    }

    pub fn alternating() -> Arc<Self> {
        Arc::new(Self {
            outcome: Mutex::new(Ok(())),
            alternate: true,
            calls: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        })
    }

    pub fn set(&self, outcome: Result<(), AuthError>) {
        *self.outcome.lock().unwrap() = outcome;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl AuthChallenge for TestChallenge {
    fn evaluate<'a>(
        &'a self,
        _reason: &'a str,
        _allow_fallback: bool,
    ) -> BoxFuture<'a, Result<(), AuthError>> {
        Box::pin(async move {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            let outcome = if self.alternate && n % 2 == 1 {
                Err(AuthError::Failed)
            } else {
                self.outcome.lock().unwrap().clone()
            };
            if outcome.is_err() {
                self.failures.fetch_add(1, Ordering::SeqCst);
            }
            outcome
        })
    }
}

/// Executor that records every call, can fail or stall chosen kinds.
#[derive(Default)]
pub struct TestExecutor {
    pub calls: Mutex<Vec<ActionKind>>,
    pub failures: HashMap<ActionKind, ActionError>,
    pub delays: HashMap<ActionKind, Duration>,
}

impl TestExecutor {
    pub fn calls(&self) -> Vec<ActionKind> {
        self.calls.lock().unwrap().clone()
    }
}

impl ActionExecutor for TestExecutor {
    fn perform<'a>(
        &'a self,
        kind: ActionKind,
        _params: &'a ActionParams,
    ) -> BoxFuture<'a, Result<(), ActionError>> {
        Box::pin(async move {
            if let Some(delay) = self.delays.get(&kind) {
                tokio::time::sleep(*delay).await;
            }
            self.calls.lock().unwrap().push(kind);
            match self.failures.get(&kind) {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            }
        })
    }
}

pub struct Rig {
    pub guard: Guard,
    pub challenge: Arc<TestChallenge>,
    pub executor: Arc<TestExecutor>,
    pub power: Arc<LatestPower>,
}

pub fn rig_with(
    settings: GuardSettings,
    actions: ActionConfiguration,
    challenge: Arc<TestChallenge>,
    executor: TestExecutor,
) -> Rig {
    let executor = Arc::new(executor);
    let power = Arc::new(LatestPower::new(PowerStatus::Connected));
    let guard = Guard::new(
        settings,
        AuthGate::new(challenge.clone(), AuthLimits::default()),
        ActionEngine::new(executor.clone(), actions),
        power.clone(),
    );
    Rig {
        guard,
        challenge,
        executor,
        power,
    }
}

pub fn rig() -> Rig {
    rig_with(
        GuardSettings::default(),
        ActionConfiguration::default(),
        TestChallenge::accepting(),
        TestExecutor::default(),
    )
}

pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
