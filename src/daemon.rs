//! Daemon context assembly and the serve/teardown cycle.
//!
//! One [`Daemon`] value is one generation of the running service: its own
//! counters, action queue, hook chains, and bound listener. A SIGUSR1
//! reload reparses the configuration while the current generation is
//! still serving; only a successfully parsed replacement triggers the
//! teardown (drain the action queue, then rebuild). Tests build as many
//! independent generations as they like.
//!
//! Construction order matters: the listener is bound last, so every
//! configuration problem surfaces before the old generation was given up,
//! and first-start failures never half-start a daemon.

use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::config::{Config, ConfigError};
use crate::hooks::{self, HookBuildError};
use crate::queue::{self, ActionQueue};
use crate::server::{AppState, BindError, HttpServer, RouteError, build_app};
use crate::signals::{DaemonSignal, SignalListener};
use crate::stats::Stats;

/// Fatal construction errors; each maps to a service-manager STATUS line.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// The configuration file is unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A hook entry is semantically invalid.
    #[error(transparent)]
    Hooks(#[from] HookBuildError),

    /// The hook paths cannot form a routing table.
    #[error(transparent)]
    Routes(#[from] RouteError),

    /// The listener could not be acquired.
    #[error(transparent)]
    Bind(#[from] BindError),

    /// Signal streams could not be registered.
    #[error("failed to register signal handlers: {0}")]
    Signals(std::io::Error),
}

/// Why [`Daemon::run`] returned.
#[derive(Debug, Clone)]
pub enum Exit {
    /// A stop signal arrived; the process should end.
    Shutdown,

    /// SIGUSR1 arrived and the configuration file reparsed cleanly;
    /// rebuild from this configuration.
    Reload(Config),
}

/// One generation of the running service.
pub struct Daemon {
    server: HttpServer,
    app: axum::Router,
    queue: ActionQueue,
    queue_worker: JoinHandle<()>,
}

impl Daemon {
    /// Builds a daemon generation from a validated configuration.
    pub async fn build(config: &Config) -> Result<Self, DaemonError> {
        let stats = Arc::new(Stats::new());
        let (queue, queue_worker) = queue::spawn(Arc::clone(&stats), CancellationToken::new());

        let running_as_root = nix::unistd::Uid::current().is_root();
        let chains = hooks::build_chains(&config.hooks, running_as_root)?;
        let state = AppState::new(
            chains,
            queue.clone(),
            stats,
            config.httpd.content_size_limit,
        )?;
        let app = build_app(state);

        let server = HttpServer::bind(&config.httpd).await?;

        Ok(Daemon {
            server,
            app,
            queue,
            queue_worker,
        })
    }

    /// The bound listener address.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.server.local_addr()
    }

    /// Serves until a lifecycle signal arrives, then tears down.
    ///
    /// A reload reparses `config_path` while this generation is still
    /// serving: a parse failure leaves it running untouched, and teardown
    /// only starts once a valid replacement configuration is in hand.
    pub async fn run(self, signals: &mut SignalListener, config_path: &Path) -> Exit {
        let decision = async {
            loop {
                match signals.wait().await {
                    DaemonSignal::Stop => return Exit::Shutdown,
                    DaemonSignal::Reload => match Config::load(config_path) {
                        Ok(config) => return Exit::Reload(config),
                        Err(err) => {
                            error!("configuration reload failed, keeping previous: {err}");
                        }
                    },
                }
            }
        };
        self.run_until(decision).await
    }

    /// Serves until `decision` resolves, then tears down: stops accepting,
    /// drains in-flight connections, and lets the action queue finish the
    /// running action and everything queued behind it. The decision future
    /// is where reload validation belongs; while it is pending, this
    /// generation serves undisturbed.
    pub async fn run_until(self, decision: impl Future<Output = Exit>) -> Exit {
        let serve_shutdown = CancellationToken::new();
        let server_task = tokio::spawn(self.server.serve(self.app, serve_shutdown.clone()));

        let exit = decision.await;

        serve_shutdown.cancel();
        if let Err(err) = server_task.await {
            error!("HTTP server task failed: {err}");
        }

        // The server task is gone, so this is the last queue handle;
        // dropping it closes the channel and the worker drains the running
        // action plus everything queued behind it, shutdown and reload
        // alike.
        drop(self.queue);
        if let Err(err) = self.queue_worker.await {
            error!("action queue worker failed: {err}");
        }

        exit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn test_config() -> Config {
        toml::from_str(
            r#"
            [httpd]
            ip = "127.0.0.1"
            port = 0

            [[hooks]]
            type = "debug"
            uri_path = "/debug"
            name = "dump"
            token = "t"
            "#,
        )
        .expect("test config parses")
    }

    #[tokio::test]
    async fn build_then_shutdown_completes() {
        let daemon = Daemon::build(&test_config()).await.expect("daemon builds");
        assert!(daemon.local_addr().is_ok());

        let exit = daemon.run_until(std::future::ready(Exit::Shutdown)).await;
        assert!(matches!(exit, Exit::Shutdown));
    }

    #[tokio::test]
    async fn reload_exit_drains_and_carries_the_new_config() {
        let daemon = Daemon::build(&test_config()).await.expect("daemon builds");

        let exit = daemon
            .run_until(std::future::ready(Exit::Reload(test_config())))
            .await;
        assert!(matches!(exit, Exit::Reload(_)));
    }

    #[tokio::test]
    async fn serves_requests_while_running() {
        let daemon = Daemon::build(&test_config()).await.expect("daemon builds");
        let addr = daemon.local_addr().unwrap();

        let run = tokio::spawn(daemon.run_until(async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Exit::Shutdown
        }));

        let mut stream = TcpStream::connect(addr).await.expect("connects");
        stream
            .write_all(b"GET /status HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");

        assert!(matches!(run.await.unwrap(), Exit::Shutdown));
    }

    #[tokio::test]
    async fn shutdown_waits_for_the_running_action() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("done");
        let script = dir.path().join("slow.sh");
        std::fs::write(&script, "#!/bin/sh\nsleep 0.5\ntouch \"$MARKER\"\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config: Config = toml::from_str(&format!(
            r#"
            [httpd]
            ip = "127.0.0.1"
            port = 0

            [[hooks]]
            type = "debug"
            uri_path = "/hook"
            name = "slow"
            token = "t"
            command = "{}"
            environment = ["MARKER={}"]
            "#,
            script.display(),
            marker.display(),
        ))
        .expect("test config parses");

        let daemon = Daemon::build(&config).await.expect("daemon builds");
        let addr = daemon.local_addr().unwrap();

        // The stop decision lands while the scheduled command still runs;
        // teardown must wait for it rather than kill it.
        let run = tokio::spawn(daemon.run_until(async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Exit::Shutdown
        }));

        let payload = r#"{"project":{"id":1,"name":"x","path_with_namespace":"g/x","web_url":"https://gitlab.example.com/g/x"}}"#;
        let request = format!(
            "POST /hook HTTP/1.1\r\nhost: localhost\r\nx-gitlab-token: t\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            payload.len(),
            payload
        );
        let mut stream = TcpStream::connect(addr).await.expect("connects");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 202"), "got: {response}");

        assert!(matches!(run.await.unwrap(), Exit::Shutdown));
        assert!(marker.exists(), "running action must finish before exit");
    }

    #[tokio::test]
    async fn two_generations_can_coexist() {
        // Independent daemon contexts (spec'd for reload and for tests):
        // nothing is process-global.
        let first = Daemon::build(&test_config()).await.expect("first builds");
        let second = Daemon::build(&test_config()).await.expect("second builds");

        assert_ne!(
            first.local_addr().unwrap().port(),
            second.local_addr().unwrap().port()
        );

        first.run_until(std::future::ready(Exit::Shutdown)).await;
        second.run_until(std::future::ready(Exit::Shutdown)).await;
    }

    #[tokio::test]
    async fn invalid_listen_address_is_a_bind_error() {
        let mut config = test_config();
        config.httpd.ip = "999.999.999.999".to_string();

        let result = Daemon::build(&config).await;
        assert!(matches!(result, Err(DaemonError::Bind(_))));
    }
}
