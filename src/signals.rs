//! Unix signal handling for the daemon lifecycle.
//!
//! SIGHUP, SIGINT, and SIGTERM all request a graceful stop; SIGUSR1
//! requests a configuration reload. SIGCHLD never shows up here - child
//! reaping is owned by the runtime's process driver.

use tokio::signal::unix::{Signal, SignalKind, signal};

/// What an incoming signal asks the daemon to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonSignal {
    /// Stop serving and exit (SIGHUP, SIGINT, SIGTERM).
    Stop,

    /// Reload the configuration and rebuild (SIGUSR1).
    Reload,
}

/// Subscribed signal streams, created once per process.
pub struct SignalListener {
    sighup: Signal,
    sigint: Signal,
    sigterm: Signal,
    sigusr1: Signal,
}

impl SignalListener {
    /// Registers the daemon's signal set.
    pub fn new() -> std::io::Result<Self> {
        Ok(SignalListener {
            sighup: signal(SignalKind::hangup())?,
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
            sigusr1: signal(SignalKind::user_defined1())?,
        })
    }

    /// Waits for the next lifecycle signal.
    pub async fn wait(&mut self) -> DaemonSignal {
        tokio::select! {
            _ = self.sighup.recv() => DaemonSignal::Stop,
            _ = self.sigint.recv() => DaemonSignal::Stop,
            _ = self.sigterm.recv() => DaemonSignal::Stop,
            _ = self.sigusr1.recv() => DaemonSignal::Reload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::{Signal as NixSignal, kill};
    use nix::unistd::Pid;

    // Signal delivery is process-global: every listener in this test
    // binary observes every raised signal. Each test therefore waits until
    // its own signal shows up instead of asserting on the first wakeup.

    async fn wait_for(listener: &mut SignalListener, expected: DaemonSignal) {
        let deadline = std::time::Duration::from_secs(5);
        tokio::time::timeout(deadline, async {
            loop {
                if listener.wait().await == expected {
                    return;
                }
            }
        })
        .await
        .expect("signal delivered");
    }

    #[tokio::test]
    async fn sigusr1_requests_reload() {
        let mut listener = SignalListener::new().unwrap();

        kill(Pid::this(), NixSignal::SIGUSR1).unwrap();
        wait_for(&mut listener, DaemonSignal::Reload).await;
    }

    #[tokio::test]
    async fn sighup_requests_stop() {
        let mut listener = SignalListener::new().unwrap();

        kill(Pid::this(), NixSignal::SIGHUP).unwrap();
        wait_for(&mut listener, DaemonSignal::Stop).await;
    }
}
