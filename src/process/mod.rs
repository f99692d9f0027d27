//! Child-process supervision for hook actions.
//!
//! A [`ProcessSpec`] describes an external command: program path, argument
//! vector, a fully materialized [`Environment`], and an optional [`RunAs`]
//! identity to drop into after the fork. [`spawn`] turns the spec into a
//! running [`tokio::process::Child`]; the runtime owns SIGCHLD reaping and
//! delivers the exit status through [`Child::wait`], so completion is
//! reported exactly once per spawned child.
//!
//! # Child setup
//!
//! The child starts with a cleared environment (only the realized overlay is
//! passed to exec), unblocks all signals so the exec'd program begins with a
//! clean mask, and performs the uid/gid drop (initgroups, setgid, setuid, in
//! that order) when a `RunAs` identity is configured. The program path is
//! used verbatim as argv[0]; no PATH lookup takes place.

use std::ffi::CString;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use nix::sys::signal::{self, SigSet, SigmaskHow, Signal};
use nix::unistd::{self, Gid, Pid, Uid};
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::error;

/// Errors from building or supervising a child process.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The configured user does not exist.
    #[error("failed to find user '{0}'")]
    UnknownUser(String),

    /// The configured group does not exist.
    #[error("failed to find group '{0}'")]
    UnknownGroup(String),

    /// User or group lookup failed at the system level.
    #[error("failed to read user database entry for '{name}': {source}")]
    Lookup {
        name: String,
        source: nix::errno::Errno,
    },

    /// A user name contained an interior NUL byte.
    #[error("invalid user name '{0}'")]
    InvalidUserName(String),

    /// fork/exec failed.
    #[error("failed to execute '{program}': {source}")]
    Spawn { program: String, source: io::Error },
}

/// How a child process finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Normal exit with the given code.
    Exited(i32),

    /// Terminated by the given signal (includes core dumps).
    Killed(i32),
}

impl ExitKind {
    /// Classifies a wait status into exit code or fatal signal.
    pub fn from_status(status: ExitStatus) -> Self {
        match status.signal() {
            Some(signo) => ExitKind::Killed(signo),
            None => ExitKind::Exited(status.code().unwrap_or(0)),
        }
    }

    /// True for a clean zero exit.
    pub fn is_success(self) -> bool {
        self == ExitKind::Exited(0)
    }
}

/// An ordered environment overlay of `KEY=VALUE` entries.
///
/// Entries are appended in call order; [`Environment::realize`] resolves
/// duplicate keys last-wins, so later `set` calls override earlier ones
/// without the overlay having to know about prior entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    entries: Vec<String>,
}

impl Environment {
    /// Creates an empty overlay.
    pub fn new() -> Self {
        Environment::default()
    }

    /// Appends `VAR=value`.
    pub fn set(&mut self, var: &str, value: impl AsRef<str>) {
        let value = value.as_ref();
        let mut entry = String::with_capacity(var.len() + 1 + value.len());
        entry.push_str(var);
        entry.push('=');
        entry.push_str(value);
        self.entries.push(entry);
    }

    /// Appends a raw `KEY=VALUE` entry, e.g. from configuration.
    pub fn set_entry(&mut self, entry: impl Into<String>) {
        self.entries.push(entry.into());
    }

    /// Appends `VAR=v1 v2 …` with the values space-joined.
    pub fn set_list<I>(&mut self, var: &str, values: I)
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut entry = String::from(var);
        let mut sep = '=';
        for value in values {
            entry.push(sep);
            entry.push_str(value.as_ref());
            sep = ' ';
        }
        if sep == '=' {
            // No values at all; still bind the variable, empty.
            entry.push('=');
        }
        self.entries.push(entry);
    }

    /// Number of raw entries (before duplicate resolution).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no entries have been added.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolves the overlay into key/value pairs, last-wins per key.
    ///
    /// The first occurrence of a key determines its position; later entries
    /// for the same key only replace the value. An entry without `=` binds
    /// the whole string as a key with an empty value.
    pub fn realize(&self) -> Vec<(String, String)> {
        let mut resolved: Vec<(String, String)> = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let (key, value) = match entry.split_once('=') {
                Some((key, value)) => (key, value),
                None => (entry.as_str(), ""),
            };
            match resolved.iter_mut().find(|(k, _)| k == key) {
                Some((_, v)) => *v = value.to_string(),
                None => resolved.push((key.to_string(), value.to_string())),
            }
        }
        resolved
    }
}

/// A resolved identity to impersonate in the child before exec.
#[derive(Debug, Clone)]
pub struct RunAs {
    user: CString,
    uid: Uid,
    gid: Gid,
}

impl RunAs {
    /// Resolves a user name (and optional group name) against the system
    /// user database. Without an explicit group the user's primary group is
    /// used.
    pub fn resolve(user: &str, group: Option<&str>) -> Result<Self, ProcessError> {
        let entry = unistd::User::from_name(user)
            .map_err(|source| ProcessError::Lookup {
                name: user.to_string(),
                source,
            })?
            .ok_or_else(|| ProcessError::UnknownUser(user.to_string()))?;

        let gid = match group {
            Some(group_name) => unistd::Group::from_name(group_name)
                .map_err(|source| ProcessError::Lookup {
                    name: group_name.to_string(),
                    source,
                })?
                .ok_or_else(|| ProcessError::UnknownGroup(group_name.to_string()))?
                .gid,
            None => entry.gid,
        };

        let user = CString::new(user.as_bytes())
            .map_err(|_| ProcessError::InvalidUserName(user.to_string()))?;

        Ok(RunAs {
            user,
            uid: entry.uid,
            gid,
        })
    }

    /// The uid the child will drop to.
    pub fn uid(&self) -> Uid {
        self.uid
    }

    /// The gid the child will drop to.
    pub fn gid(&self) -> Gid {
        self.gid
    }
}

/// A prepared external-process description.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Absolute path of the program; also used as argv[0].
    pub program: String,

    /// Arguments after argv[0].
    pub args: Vec<String>,

    /// Environment overlay; the child sees nothing else.
    pub env: Environment,

    /// Identity to drop into, mandatory when the daemon runs as root.
    pub run_as: Option<RunAs>,
}

impl ProcessSpec {
    /// Builds the command for this spec.
    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command.env_clear();
        command.envs(self.env.realize());
        command.kill_on_drop(true);

        let run_as = self.run_as.clone();
        // Only async-signal-safe work below; argv/envp were built above.
        unsafe {
            command.pre_exec(move || {
                signal::sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&SigSet::all()), None)
                    .map_err(io::Error::from)?;
                if let Some(run_as) = &run_as {
                    unistd::initgroups(&run_as.user, run_as.gid).map_err(io::Error::from)?;
                    unistd::setgid(run_as.gid).map_err(io::Error::from)?;
                    unistd::setuid(run_as.uid).map_err(io::Error::from)?;
                }
                Ok(())
            });
        }

        command
    }
}

/// Spawns the child described by `spec`.
///
/// The returned [`Child`] is tracked by the runtime; await
/// [`Child::wait`] for its exit status. A spec whose program cannot be
/// executed fails here with [`ProcessError::Spawn`].
pub fn spawn(spec: &ProcessSpec) -> Result<Child, ProcessError> {
    spec.command().spawn().map_err(|source| ProcessError::Spawn {
        program: spec.program.clone(),
        source,
    })
}

/// Sends SIGTERM to a running child.
///
/// Failure to deliver the signal is logged but not propagated; the caller's
/// kill timer still guarantees forward progress.
pub fn terminate(child: &Child) {
    let Some(pid) = child.id() else {
        return;
    };
    if let Err(err) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        error!(pid, error = %err, "failed to send termination signal to child process");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // ─── Environment overlay ───

    #[test]
    fn set_appends_key_value() {
        let mut env = Environment::new();
        env.set("CI_PROJECT_ID", "17");

        assert_eq!(env.realize(), vec![("CI_PROJECT_ID".into(), "17".into())]);
    }

    #[test]
    fn set_list_joins_with_spaces() {
        let mut env = Environment::new();
        env.set_list("CI_JOB_NAMES", ["build", "test", "deploy"]);

        assert_eq!(
            env.realize(),
            vec![("CI_JOB_NAMES".into(), "build test deploy".into())]
        );
    }

    #[test]
    fn set_list_single_value_has_no_trailing_space() {
        let mut env = Environment::new();
        env.set_list("CI_JOB_NAMES", ["build"]);

        assert_eq!(env.realize(), vec![("CI_JOB_NAMES".into(), "build".into())]);
    }

    #[test]
    fn set_list_empty_binds_empty_value() {
        let mut env = Environment::new();
        env.set_list("CI_JOB_NAMES", std::iter::empty::<&str>());

        assert_eq!(env.realize(), vec![("CI_JOB_NAMES".into(), String::new())]);
    }

    #[test]
    fn later_entries_win() {
        let mut env = Environment::new();
        env.set("DEPLOY_ENV", "staging");
        env.set("OTHER", "x");
        env.set("DEPLOY_ENV", "production");

        assert_eq!(
            env.realize(),
            vec![
                ("DEPLOY_ENV".into(), "production".into()),
                ("OTHER".into(), "x".into()),
            ]
        );
    }

    #[test]
    fn raw_entry_without_equals_binds_empty_value() {
        let mut env = Environment::new();
        env.set_entry("JUST_A_KEY");

        assert_eq!(env.realize(), vec![("JUST_A_KEY".into(), String::new())]);
    }

    #[test]
    fn value_may_contain_equals() {
        let mut env = Environment::new();
        env.set_entry("OPTS=--level=3");

        assert_eq!(env.realize(), vec![("OPTS".into(), "--level=3".into())]);
    }

    proptest! {
        /// Realization never yields duplicate keys, whatever the entry order.
        #[test]
        fn prop_realize_has_unique_keys(
            entries in proptest::collection::vec("[A-Z]{1,4}=[a-z]{0,4}", 0..16)
        ) {
            let mut env = Environment::new();
            for entry in &entries {
                env.set_entry(entry.clone());
            }

            let realized = env.realize();
            let mut keys: Vec<_> = realized.iter().map(|(k, _)| k.clone()).collect();
            keys.sort();
            keys.dedup();
            prop_assert_eq!(keys.len(), realized.len());
        }

        /// The realized value of a key equals the last entry set for it.
        #[test]
        fn prop_last_entry_wins(
            values in proptest::collection::vec("[a-z]{0,6}", 1..8)
        ) {
            let mut env = Environment::new();
            for value in &values {
                env.set("KEY", value);
            }

            let realized = env.realize();
            prop_assert_eq!(&realized[0].1, values.last().unwrap());
        }
    }

    // ─── Exit classification ───

    #[test]
    fn classify_normal_exit() {
        let status = ExitStatus::from_raw(3 << 8);
        assert_eq!(ExitKind::from_status(status), ExitKind::Exited(3));
    }

    #[test]
    fn classify_zero_exit_is_success() {
        let status = ExitStatus::from_raw(0);
        let kind = ExitKind::from_status(status);
        assert_eq!(kind, ExitKind::Exited(0));
        assert!(kind.is_success());
    }

    #[test]
    fn classify_signal_death() {
        // Raw wait status for "killed by SIGKILL".
        let status = ExitStatus::from_raw(9);
        assert_eq!(ExitKind::from_status(status), ExitKind::Killed(9));
    }

    #[test]
    fn nonzero_exit_is_not_success() {
        assert!(!ExitKind::Exited(1).is_success());
        assert!(!ExitKind::Killed(15).is_success());
    }

    // ─── Spawning ───

    #[tokio::test]
    async fn spawn_runs_program_with_overlay_environment() {
        let mut env = Environment::new();
        env.set("MARKER", "overlay-only");

        let spec = ProcessSpec {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "test \"$MARKER\" = overlay-only".to_string()],
            env,
            run_as: None,
        };

        let mut child = spawn(&spec).expect("spawn /bin/sh");
        let status = child.wait().await.expect("wait");
        assert!(ExitKind::from_status(status).is_success());
    }

    #[tokio::test]
    async fn spawn_clears_inherited_environment() {
        // SAFETY: test-only; no other thread reads the environment here.
        unsafe { std::env::set_var("GITLAB_HOOKD_LEAK_CHECK", "leaked") };

        let spec = ProcessSpec {
            program: "/bin/sh".to_string(),
            args: vec![
                "-c".to_string(),
                "test -z \"$GITLAB_HOOKD_LEAK_CHECK\"".to_string(),
            ],
            env: Environment::new(),
            run_as: None,
        };

        let mut child = spawn(&spec).expect("spawn /bin/sh");
        let status = child.wait().await.expect("wait");
        assert!(ExitKind::from_status(status).is_success());
    }

    #[tokio::test]
    async fn spawn_missing_program_is_spawn_error() {
        let spec = ProcessSpec {
            program: "/nonexistent/program".to_string(),
            args: Vec::new(),
            env: Environment::new(),
            run_as: None,
        };

        let result = spawn(&spec);
        assert!(matches!(result, Err(ProcessError::Spawn { .. })));
    }

    #[test]
    fn resolve_unknown_user_fails() {
        let result = RunAs::resolve("no-such-user-gitlab-hookd", None);
        assert!(matches!(result, Err(ProcessError::UnknownUser(_))));
    }
}
