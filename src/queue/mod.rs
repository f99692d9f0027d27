//! The serial action queue.
//!
//! Hooks append [`Action`]s; a dedicated worker task executes them strictly
//! one at a time, in append order. Appending never runs an action on the
//! caller's stack - the channel hop onto the worker task is the scheduling
//! point, so a hook handler can append from inside request dispatch without
//! re-entrancy concerns.
//!
//! # Timeout escalation
//!
//! A running external process gets `timeout` to finish. On expiry it is
//! sent SIGTERM; if it still has not exited one second later it is sent
//! SIGKILL. Either way the action is recorded as failed and the queue
//! advances - a hanging command can delay the queue by at most
//! `timeout + 2s`.
//!
//! # Shutdown
//!
//! Dropping every [`ActionQueue`] handle closes the channel; the worker
//! finishes the running action and everything queued behind it, then
//! exits. This drain is the teardown path for shutdown and reload alike.
//! Cancelling the shutdown token aborts immediately instead, killing the
//! in-flight child if there is one; it is reserved for callers that need
//! a hard abort.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::process::{self, ExitKind, ProcessError, ProcessSpec};
use crate::stats::Stats;

/// Grace period between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(1);

/// Per-action timeout applied when a hook does not configure one.
pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(10);

/// An in-process function action. Errors count as action failures.
pub type ActionFn =
    Box<dyn FnOnce() -> Result<(), Box<dyn std::error::Error + Send + Sync>> + Send>;

/// What a queued action does when it reaches the head of the queue.
pub enum ActionPayload {
    /// Launch an external process.
    Exec(ProcessSpec),

    /// Invoke a function on the worker task.
    Call(ActionFn),
}

impl fmt::Debug for ActionPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionPayload::Exec(spec) => f.debug_tuple("Exec").field(&spec.program).finish(),
            ActionPayload::Call(_) => f.debug_tuple("Call").finish(),
        }
    }
}

/// A queued unit of work.
#[derive(Debug)]
pub struct Action {
    /// Human-readable name (the hook name), used in log messages.
    pub name: String,

    /// The work itself.
    pub payload: ActionPayload,

    /// Budget before SIGTERM/SIGKILL escalation begins.
    pub timeout: Duration,
}

/// Why an action failed.
#[derive(Debug, Error)]
pub enum ActionError {
    /// Spawn or identity resolution failed.
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// Waiting on the child failed at the OS level.
    #[error("failed to wait for child process: {0}")]
    Wait(io::Error),

    /// The process exited with a non-zero code.
    #[error("exited with code {0}")]
    NonZeroExit(i32),

    /// The process died from a signal it was not sent by the queue.
    #[error("process killed by signal {0}")]
    ProcessKilled(i32),

    /// The process outlived its budget and was escalated.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// A function action returned an error.
    #[error("{0}")]
    Call(Box<dyn std::error::Error + Send + Sync>),
}

/// Handle for appending actions to the queue.
///
/// Cloning is cheap; all clones feed the same worker. There is one queue
/// per daemon context, enforced by construction in [`spawn`].
#[derive(Debug, Clone)]
pub struct ActionQueue {
    tx: mpsc::UnboundedSender<Action>,
}

impl ActionQueue {
    /// Appends an action; it runs after everything queued before it.
    ///
    /// Returns `false` if the worker is gone (daemon shutting down), in
    /// which case the action is dropped.
    pub fn append(&self, action: Action) -> bool {
        debug!(action = %action.name, "queueing action");
        self.tx.send(action).is_ok()
    }
}

/// Starts the queue worker and returns the append handle plus the worker's
/// join handle.
///
/// The worker drains queued actions when every [`ActionQueue`] clone is
/// dropped; cancelling `shutdown` aborts it immediately instead.
pub fn spawn(stats: Arc<Stats>, shutdown: CancellationToken) -> (ActionQueue, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Action>();

    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("action queue shutting down");
                    break;
                }
                action = rx.recv() => {
                    let Some(action) = action else {
                        debug!("action queue drained");
                        break;
                    };
                    // A cancelled in-flight action is dropped; its child is
                    // killed through kill_on_drop.
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => {
                            debug!("action queue shutting down");
                            break;
                        }
                        _ = run_action(action, &stats) => {}
                    }
                }
            }
        }
    });

    (ActionQueue { tx }, handle)
}

/// Executes one action to completion and updates the counters.
async fn run_action(action: Action, stats: &Stats) {
    info!(action = %action.name, "executing hook '{}'", action.name);

    let result = match action.payload {
        ActionPayload::Exec(spec) => run_process(&spec, action.timeout).await,
        ActionPayload::Call(function) => function().map_err(ActionError::Call),
    };

    stats.action_executed();
    match result {
        Ok(()) => info!(action = %action.name, "action executed successfully"),
        Err(err) => {
            stats.action_failed();
            error!(action = %action.name, "action failed: {err}");
        }
    }
}

/// Runs an external process under the escalation state machine.
async fn run_process(spec: &ProcessSpec, limit: Duration) -> Result<(), ActionError> {
    let mut child = process::spawn(spec)?;

    match timeout(limit, child.wait()).await {
        Ok(status) => exit_result(status.map_err(ActionError::Wait)?),
        Err(_) => {
            warn!(program = %spec.program, "action exceeded {limit:?}, terminating");
            process::terminate(&child);

            match timeout(KILL_GRACE, child.wait()).await {
                // Exited between SIGTERM and the kill timer.
                Ok(_) => Err(ActionError::Timeout(limit)),
                Err(_) => {
                    warn!(program = %spec.program, "termination ignored, killing");
                    if let Err(err) = child.start_kill() {
                        error!(program = %spec.program, "failed to kill child process: {err}");
                    }
                    // SIGKILL is not maskable; reap so no zombie outlives the action.
                    let _ = child.wait().await;
                    Err(ActionError::Timeout(limit))
                }
            }
        }
    }
}

fn exit_result(status: std::process::ExitStatus) -> Result<(), ActionError> {
    match ExitKind::from_status(status) {
        ExitKind::Exited(0) => Ok(()),
        ExitKind::Exited(code) => Err(ActionError::NonZeroExit(code)),
        ExitKind::Killed(signo) => Err(ActionError::ProcessKilled(signo)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::Environment;
    use std::sync::Mutex;
    use std::time::Instant;

    fn shell_action(name: &str, script: &str, timeout: Duration) -> Action {
        Action {
            name: name.to_string(),
            payload: ActionPayload::Exec(ProcessSpec {
                program: "/bin/sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
                env: Environment::new(),
                run_as: None,
            }),
            timeout,
        }
    }

    fn call_action(
        name: &str,
        function: impl FnOnce() -> Result<(), Box<dyn std::error::Error + Send + Sync>>
        + Send
        + 'static,
    ) -> Action {
        Action {
            name: name.to_string(),
            payload: ActionPayload::Call(Box::new(function)),
            timeout: DEFAULT_ACTION_TIMEOUT,
        }
    }

    /// Appends all actions, closes the queue, and waits for the drain.
    async fn run_to_completion(actions: Vec<Action>) -> Arc<Stats> {
        let stats = Arc::new(Stats::new());
        let (queue, worker) = spawn(Arc::clone(&stats), CancellationToken::new());

        for action in actions {
            assert!(queue.append(action));
        }

        drop(queue);
        worker.await.expect("worker completes");
        stats
    }

    #[tokio::test]
    async fn successful_process_counts_executed_not_failed() {
        let stats = run_to_completion(vec![shell_action("ok", "exit 0", DEFAULT_ACTION_TIMEOUT)])
            .await;

        let snap = stats.snapshot();
        assert_eq!(snap.actions_executed, 1);
        assert_eq!(snap.actions_failed, 0);
    }

    #[tokio::test]
    async fn nonzero_exit_counts_as_failure() {
        let stats = run_to_completion(vec![shell_action("bad", "exit 7", DEFAULT_ACTION_TIMEOUT)])
            .await;

        let snap = stats.snapshot();
        assert_eq!(snap.actions_executed, 1);
        assert_eq!(snap.actions_failed, 1);
        assert!(snap.last_failure.is_some());
    }

    #[tokio::test]
    async fn spawn_failure_counts_as_failure_and_queue_advances() {
        let missing = Action {
            name: "missing".to_string(),
            payload: ActionPayload::Exec(ProcessSpec {
                program: "/nonexistent/program".to_string(),
                args: Vec::new(),
                env: Environment::new(),
                run_as: None,
            }),
            timeout: DEFAULT_ACTION_TIMEOUT,
        };

        let stats =
            run_to_completion(vec![missing, shell_action("ok", "exit 0", DEFAULT_ACTION_TIMEOUT)])
                .await;

        let snap = stats.snapshot();
        assert_eq!(snap.actions_executed, 2);
        assert_eq!(snap.actions_failed, 1);
    }

    #[tokio::test]
    async fn function_error_counts_as_failure() {
        let stats = run_to_completion(vec![
            call_action("boom", || Err("deliberate".into())),
            call_action("fine", || Ok(())),
        ])
        .await;

        let snap = stats.snapshot();
        assert_eq!(snap.actions_executed, 2);
        assert_eq!(snap.actions_failed, 1);
    }

    #[tokio::test]
    async fn actions_run_in_append_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut actions = Vec::new();
        for i in 0..5 {
            let order = Arc::clone(&order);
            actions.push(call_action(&format!("a{i}"), move || {
                order.lock().unwrap().push(i);
                Ok(())
            }));
        }

        run_to_completion(actions).await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn queued_process_starts_only_after_predecessor_finishes() {
        // The first action sleeps; the second records when it ran. If the
        // queue overlapped executions the second timestamp would land
        // before the first action's deadline.
        let started = Instant::now();
        let second_ran_at = Arc::new(Mutex::new(None));
        let recorded = Arc::clone(&second_ran_at);

        let stats = run_to_completion(vec![
            shell_action("sleep", "sleep 0.3", DEFAULT_ACTION_TIMEOUT),
            call_action("probe", move || {
                *recorded.lock().unwrap() = Some(started.elapsed());
                Ok(())
            }),
        ])
        .await;

        let elapsed = second_ran_at.lock().unwrap().expect("probe ran");
        assert!(elapsed >= Duration::from_millis(300), "ran at {elapsed:?}");
        assert_eq!(stats.snapshot().actions_failed, 0);
    }

    #[tokio::test]
    async fn timeout_sends_sigterm() {
        // A plain sleep dies on the SIGTERM, well before the kill timer.
        let started = Instant::now();
        let stats =
            run_to_completion(vec![shell_action("hang", "sleep 30", Duration::from_millis(300))])
                .await;

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300), "finished at {elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "finished at {elapsed:?}");

        let snap = stats.snapshot();
        assert_eq!(snap.actions_executed, 1);
        assert_eq!(snap.actions_failed, 1);
    }

    #[tokio::test]
    async fn sigterm_immune_process_is_killed_within_grace() {
        // Ignoring SIGTERM forces the second stage; SIGKILL cannot be
        // ignored. Total time stays under timeout + 2s.
        let started = Instant::now();
        let stats = run_to_completion(vec![shell_action(
            "stubborn",
            "trap '' TERM; sleep 30",
            Duration::from_millis(300),
        )])
        .await;

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(1300), "finished at {elapsed:?}");
        assert!(elapsed < Duration::from_millis(2300), "finished at {elapsed:?}");

        let snap = stats.snapshot();
        assert_eq!(snap.actions_failed, 1);
    }

    #[tokio::test]
    async fn queue_advances_after_timeout() {
        let ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ran);

        run_to_completion(vec![
            shell_action("hang", "sleep 30", Duration::from_millis(200)),
            call_action("next", move || {
                *flag.lock().unwrap() = true;
                Ok(())
            }),
        ])
        .await;

        assert!(*ran.lock().unwrap(), "queue did not advance past timeout");
    }

    #[tokio::test]
    async fn cancellation_stops_worker_without_draining() {
        let stats = Arc::new(Stats::new());
        let shutdown = CancellationToken::new();
        let (queue, worker) = spawn(Arc::clone(&stats), shutdown.clone());

        shutdown.cancel();
        worker.await.expect("worker exits");

        // The worker is gone; appends fail once the channel closes with it.
        // (The send may still succeed into the closed-but-alive channel, so
        // only assert nothing executed.)
        let _ = queue.append(call_action("late", || Ok(())));
        assert_eq!(stats.snapshot().actions_executed, 0);
    }
}
