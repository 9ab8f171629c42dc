use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::action::{ActionConfiguration, ActionExecutor, ActionParams, ExecutionResult};
use crate::error::{ActionError, CoordinationError};
use crate::lock;
use crate::types::ExecutionMode;

// ─── ActionEngine ─────────────────────────────────────────────────────────

/// Runs the configured actions when a trigger fires.
///
/// Every run works on a snapshot of the configuration taken when it starts;
/// `update_configuration` only affects later runs. Runs never overlap: a
/// second `execute` while one is in flight is rejected, not queued.
///
/// Failures are recorded per action and the run carries on. Nothing is
/// retried, since most actions cannot safely happen twice.
pub struct ActionEngine {
    executor: Arc<dyn ActionExecutor>,
    config: Mutex<ActionConfiguration>,
    executing: AtomicBool,
}

/// Clears the executing flag when a run ends, including by panic.
struct ExecutingFlag<'a>(&'a AtomicBool);

impl Drop for ExecutingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ActionEngine {
    pub fn new(executor: Arc<dyn ActionExecutor>, config: ActionConfiguration) -> Self {
        Self {
            executor,
            config: Mutex::new(config),
            executing: AtomicBool::new(false),
        }
    }

    pub fn configuration(&self) -> ActionConfiguration {
        lock(&self.config).clone()
    }

    pub fn update_configuration(&self, config: ActionConfiguration) {
        info!(
            mode = %config.mode,
            enabled = config.plan().len(),
            "action configuration updated"
        );
        *lock(&self.config) = config;
    }

    pub fn is_executing(&self) -> bool {
        self.executing.load(Ordering::Acquire)
    }

    /// Run the current configuration.
    pub async fn execute(&self) -> Result<ExecutionResult, CoordinationError> {
        let snapshot = self.configuration();
        self.execute_snapshot(snapshot).await
    }

    /// Run an explicit configuration snapshot.
    pub async fn execute_snapshot(
        &self,
        config: ActionConfiguration,
    ) -> Result<ExecutionResult, CoordinationError> {
        if self
            .executing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("trigger dropped: an action run is already in progress");
            return Err(CoordinationError::AlreadyExecuting);
        }
        let _flag = ExecutingFlag(&self.executing);

        let pre_delay = config.pre_delay();
        if !pre_delay.is_zero() {
            info!(seconds = pre_delay.as_secs(), "waiting before executing actions");
            tokio::time::sleep(pre_delay).await;
        }

        let result = match config.mode {
            ExecutionMode::Sequential => self.run_sequential(&config).await,
            ExecutionMode::Parallel => self.run_parallel(&config).await,
        };

        info!(
            run_id = %result.run_id,
            executed = result.executed.len(),
            failed = result.failed.len(),
            "action run finished"
        );
        Ok(result)
    }

    /// Perform one action outside of a triggered run (e.g. stopping the
    /// alarm after disarm). Does not touch the executing flag.
    pub async fn perform_single(&self, params: &ActionParams) -> Result<(), ActionError> {
        perform_caught(self.executor.as_ref(), params).await
    }

    async fn run_sequential(&self, config: &ActionConfiguration) -> ExecutionResult {
        let mut result = ExecutionResult::new(config.mode);
        for spec in config.plan() {
            let kind = spec.kind();
            let outcome = perform_caught(self.executor.as_ref(), &spec.params).await;
            log_outcome(kind, &outcome);
            result.record(kind, outcome);
        }
        result
    }

    async fn run_parallel(&self, config: &ActionConfiguration) -> ExecutionResult {
        let plan = config.plan();
        let mut result = ExecutionResult::new(config.mode);
        let (tx, mut rx) = mpsc::channel(plan.len().max(1));

        for spec in plan {
            let executor = Arc::clone(&self.executor);
            let params = spec.params.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let outcome = perform_caught(executor.as_ref(), &params).await;
                let _ = tx.send((params.kind(), outcome)).await;
            });
        }
        // The collector finishes once every task has reported and dropped its sender.
        drop(tx);

        while let Some((kind, outcome)) = rx.recv().await {
            log_outcome(kind, &outcome);
            result.record(kind, outcome);
        }
        result
    }
}

// ─── Internal ─────────────────────────────────────────────────────────────

async fn perform_caught(
    executor: &dyn ActionExecutor,
    params: &ActionParams,
) -> Result<(), ActionError> {
    let kind = params.kind();
    let call = async move { executor.perform(kind, params).await };
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(payload) => Err(ActionError::Crashed(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "executor panicked".to_string()
    }
}

fn log_outcome(kind: crate::types::ActionKind, outcome: &Result<(), ActionError>) {
    match outcome {
        Ok(()) => info!(%kind, "action executed"),
        Err(e) => warn!(%kind, error = %e, "action failed"),
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────
