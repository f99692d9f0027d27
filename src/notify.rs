//! Minimal `sd_notify(3)` protocol implementation.
//!
//! Communicates service readiness and watchdog liveness to the service
//! manager over the Unix datagram socket named by `$NOTIFY_SOCKET`. Every
//! send is best-effort: outside a systemd unit the socket is absent and
//! all of this is a no-op, and a failed send never affects the daemon.

use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Environment variable naming the notification socket.
const NOTIFY_SOCKET_ENV: &str = "NOTIFY_SOCKET";

/// Environment variable carrying the watchdog interval in microseconds.
const WATCHDOG_USEC_ENV: &str = "WATCHDOG_USEC";

/// Environment variable naming the PID the watchdog is armed for.
const WATCHDOG_PID_ENV: &str = "WATCHDOG_PID";

/// Sends one state string to the notification socket.
///
/// Returns `true` when the message went out. The path must be absolute or
/// an abstract socket (leading `@`); anything else is ignored.
fn notify(state: &str) -> bool {
    let Ok(socket_path) = std::env::var(NOTIFY_SOCKET_ENV) else {
        trace!("NOTIFY_SOCKET not set, skipping sd_notify");
        return false;
    };

    if !socket_path.starts_with('/') && !socket_path.starts_with('@') {
        debug!("NOTIFY_SOCKET is neither absolute nor abstract, skipping sd_notify");
        return false;
    }

    // Abstract sockets replace the leading '@' with a NUL byte.
    let resolved = socket_path
        .strip_prefix('@')
        .map_or_else(|| socket_path.clone(), |suffix| format!("\0{suffix}"));

    let Ok(socket) = UnixDatagram::unbound() else {
        debug!("failed to create datagram socket for sd_notify");
        return false;
    };

    match socket.send_to(state.as_bytes(), Path::new(&resolved)) {
        Ok(_) => true,
        Err(err) => {
            debug!("failed to send sd_notify message: {err}");
            false
        }
    }
}

/// Announces readiness with a status line.
pub fn ready(status: &str) {
    notify(&format!("READY=1\nSTATUS={status}\n"));
}

/// Updates the status line (used for fatal errors before exit).
pub fn status(message: &str) {
    notify(&format!("STATUS={message}\n"));
}

/// Announces the beginning of shutdown.
pub fn stopping() {
    notify("STOPPING=1\n");
}

/// The watchdog ping interval requested by the service manager, if any.
///
/// Half the advertised `WATCHDOG_USEC`, per the sd_watchdog_enabled
/// convention. `None` when no watchdog is armed or it is armed for a
/// different PID.
fn watchdog_interval() -> Option<Duration> {
    let usec: u64 = std::env::var(WATCHDOG_USEC_ENV).ok()?.parse().ok()?;
    if usec == 0 {
        return None;
    }

    if let Ok(pid) = std::env::var(WATCHDOG_PID_ENV)
        && pid.parse::<u32>() != Ok(std::process::id())
    {
        debug!("WATCHDOG_PID is for another process, not arming the watchdog");
        return None;
    }

    Some(Duration::from_micros(usec / 2))
}

/// Starts the periodic `WATCHDOG=1` ping when the service manager asked
/// for one. The returned task runs for the life of the process.
pub fn spawn_watchdog() -> Option<JoinHandle<()>> {
    let interval = watchdog_interval()?;
    debug!(?interval, "arming service manager watchdog");

    Some(tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        // The first tick fires immediately, which doubles as the initial ping.
        loop {
            timer.tick().await;
            notify("WATCHDOG=1\n");
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixDatagram;

    // These tests mutate process-global environment variables; they are
    // combined into one test each per variable set to avoid interference.

    fn with_env<R>(vars: &[(&str, Option<&str>)], body: impl FnOnce() -> R) -> R {
        // SAFETY: tests only; concurrent env readers in this process are
        // other tests in this module, serialized by the lock below.
        static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
        let _guard = LOCK.lock().unwrap();

        let saved: Vec<(String, Option<String>)> = vars
            .iter()
            .map(|(name, _)| ((*name).to_string(), std::env::var(name).ok()))
            .collect();
        for (name, value) in vars {
            unsafe {
                match value {
                    Some(value) => std::env::set_var(name, value),
                    None => std::env::remove_var(name),
                }
            }
        }

        let result = body();

        for (name, value) in saved {
            unsafe {
                match value {
                    Some(value) => std::env::set_var(&name, value),
                    None => std::env::remove_var(&name),
                }
            }
        }
        result
    }

    #[test]
    fn notify_without_socket_is_a_noop() {
        with_env(&[(NOTIFY_SOCKET_ENV, None)], || {
            assert!(!notify("READY=1\n"));
        });
    }

    #[test]
    fn notify_rejects_relative_socket_path() {
        with_env(&[(NOTIFY_SOCKET_ENV, Some("relative/socket"))], || {
            assert!(!notify("READY=1\n"));
        });
    }

    #[test]
    fn notify_delivers_to_a_bound_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notify.sock");
        let receiver = UnixDatagram::bind(&path).unwrap();

        with_env(
            &[(NOTIFY_SOCKET_ENV, Some(path.to_str().unwrap()))],
            || {
                assert!(notify("READY=1\nSTATUS=Normal operation\n"));
            },
        );

        let mut buffer = [0u8; 128];
        let received = receiver.recv(&mut buffer).unwrap();
        assert_eq!(
            &buffer[..received],
            b"READY=1\nSTATUS=Normal operation\n" as &[u8]
        );
    }

    #[test]
    fn watchdog_interval_is_half_the_advertised_period() {
        with_env(
            &[
                (WATCHDOG_USEC_ENV, Some("10000000")),
                (WATCHDOG_PID_ENV, None),
            ],
            || {
                assert_eq!(watchdog_interval(), Some(Duration::from_secs(5)));
            },
        );
    }

    #[test]
    fn watchdog_for_another_pid_is_ignored() {
        with_env(
            &[
                (WATCHDOG_USEC_ENV, Some("10000000")),
                (WATCHDOG_PID_ENV, Some("1")),
            ],
            || {
                assert_eq!(watchdog_interval(), None);
            },
        );
    }

    #[test]
    fn zero_watchdog_usec_disables_the_watchdog() {
        with_env(&[(WATCHDOG_USEC_ENV, Some("0"))], || {
            assert_eq!(watchdog_interval(), None);
        });
    }
}
