//! Webhook hooks and hook chains.
//!
//! A [`Hook`] binds a URI path and shared token to a behavior
//! ([`HookKind`]); hooks configured with the same `uri_path` form a
//! [`HookChain`] that dispatch walks in configuration order. Processing a
//! delivery yields an [`Outcome`] per hook, aggregated by the HTTP
//! dispatcher: any `Accepted` → 202, all `Ignored` → 204, `Stop` ends the
//! walk with the hook's own response.
//!
//! The [`Hook::execute`] helper is the bridge to the action queue: it binds
//! the standard `CI_*` environment from the payload, overlays the hook's
//! configured entries, and appends the prepared process to the queue.

pub mod debug;
pub mod pipeline;

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::config::{HookConfig, HookType};
use crate::process::{Environment, ProcessError, ProcessSpec, RunAs};
use crate::queue::{Action, ActionPayload, ActionQueue};
use crate::stats::Stats;

use pipeline::PipelineFilter;

/// Errors turning a [`HookConfig`] into a [`Hook`].
#[derive(Debug, Error)]
pub enum HookBuildError {
    /// `run_as` referenced an unknown user or group.
    #[error("hook '{name}': {source}")]
    RunAs {
        name: String,
        #[source]
        source: ProcessError,
    },

    /// Root must not execute hook commands without dropping privileges.
    #[error("hook '{0}' has a command but no run_as while running as root")]
    RootWithoutRunAs(String),

    /// A pipeline hook selects builds by job name; without any it could
    /// never accept.
    #[error("pipeline hook '{0}' requires job_name")]
    MissingJobNames(String),

    /// `job_name`/`status` have no meaning outside pipeline hooks.
    #[error("hook '{name}': '{key}' is only valid for pipeline hooks")]
    NotAPipelineKey { name: String, key: &'static str },
}

/// Errors while processing a delivery in a hook.
#[derive(Debug, Error)]
pub enum HookError {
    /// The payload lacks a field the hook needs; reported as 400.
    #[error("invalid payload: {0}")]
    Payload(String),

    /// Unexpected failure; reported as 500.
    #[error("{0}")]
    Internal(String),
}

/// A response produced directly by a hook (the `Stop` outcome).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub body: String,
}

/// Per-hook dispatch result.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The hook produced the final response; cease iterating the chain.
    Stop(Reply),

    /// Nothing to do for this delivery; continue with the next hook.
    Ignored,

    /// An action was enqueued; continue and count.
    Accepted,
}

/// Shared collaborators a hook needs while processing.
#[derive(Clone, Copy)]
pub struct HookContext<'a> {
    /// Queue that runs accepted actions.
    pub queue: &'a ActionQueue,

    /// Counters for the status page.
    pub stats: &'a Stats,
}

/// A command line pre-split into program and arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CommandLine {
    program: String,
    args: Vec<String>,
}

/// Splits a command on runs of spaces and tabs; the first word is the
/// program path. Returns `None` for an all-whitespace command.
fn split_command(command: &str) -> Option<CommandLine> {
    let mut words = command.split([' ', '\t']).filter(|word| !word.is_empty());
    let program = words.next()?.to_string();
    Some(CommandLine {
        program,
        args: words.map(str::to_string).collect(),
    })
}

/// A configured webhook handler.
#[derive(Debug)]
pub struct Hook {
    uri_path: String,
    name: String,
    token: String,
    allowed_address: Option<String>,
    command: Option<CommandLine>,
    environment: Vec<String>,
    timeout: Duration,
    run_as: Option<RunAs>,
    kind: HookKind,
}

/// The behavior variants of [`Hook`].
#[derive(Debug)]
enum HookKind {
    Pipeline(PipelineFilter),
    Debug,
}

impl Hook {
    /// Builds a hook from its configuration entry.
    ///
    /// `running_as_root` selects whether hooks with commands must carry
    /// `run_as`; the daemon passes its own uid check, tests pass `false`.
    pub fn from_config(config: &HookConfig, running_as_root: bool) -> Result<Self, HookBuildError> {
        let command = config
            .command
            .as_deref()
            .and_then(|command| split_command(command.trim()));

        let kind = match config.kind {
            HookType::Pipeline => HookKind::Pipeline(PipelineFilter::from_config(config)?),
            HookType::Debug => {
                for (key, present) in [
                    ("job_name", config.job_name.is_some()),
                    ("status", config.status.is_some()),
                ] {
                    if present {
                        return Err(HookBuildError::NotAPipelineKey {
                            name: config.name.clone(),
                            key,
                        });
                    }
                }
                HookKind::Debug
            }
        };

        let run_as = match &config.run_as {
            Some(run_as) => Some(
                RunAs::resolve(&run_as.user, run_as.group.as_deref()).map_err(|source| {
                    HookBuildError::RunAs {
                        name: config.name.clone(),
                        source,
                    }
                })?,
            ),
            None => None,
        };

        if command.is_some() && running_as_root && run_as.is_none() {
            return Err(HookBuildError::RootWithoutRunAs(config.name.clone()));
        }

        Ok(Hook {
            uri_path: config.uri_path.clone(),
            name: config.name.clone(),
            token: config.token.clone(),
            allowed_address: config.peer_address.clone(),
            command,
            environment: config.environment.clone(),
            timeout: config.action_timeout(),
            run_as,
            kind,
        })
    }

    /// The URI path the hook is registered on.
    pub fn uri_path(&self) -> &str {
        &self.uri_path
    }

    /// The hook's human-readable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this hook authorizes a request carrying `token` from
    /// `peer_address`.
    pub fn authorizes(&self, token: &str, peer_address: &str) -> bool {
        self.token == token
            && self
                .allowed_address
                .as_deref()
                .is_none_or(|allowed| allowed == peer_address)
    }

    /// Processes a delivery whose JSON `payload` has been parsed.
    pub fn process(
        &self,
        ctx: HookContext<'_>,
        event: Option<&str>,
        payload: &Value,
    ) -> Result<Outcome, HookError> {
        match &self.kind {
            HookKind::Pipeline(filter) => pipeline::process(self, filter, ctx, event, payload),
            HookKind::Debug => debug::process(self, ctx, event, payload),
        }
    }

    /// Schedules the hook's command with `environment`, amended with the
    /// standard project variables from the payload and the hook's
    /// configured overlay. Without a command this is a no-op (`Ignored`).
    pub fn execute(
        &self,
        ctx: HookContext<'_>,
        payload: &Value,
        mut environment: Environment,
    ) -> Result<Outcome, HookError> {
        let Some(command) = &self.command else {
            return Ok(Outcome::Ignored);
        };

        let project = required(payload, "/project")?;
        let id = required(project, "/id")?
            .as_i64()
            .ok_or_else(|| HookError::Payload("project.id is not an integer".to_string()))?;
        environment.set("CI_PROJECT_ID", id.to_string());
        environment.set(
            "CI_PROJECT_PATH",
            required_str(project, "/path_with_namespace")?,
        );
        environment.set("CI_PROJECT_TITLE", required_str(project, "/name")?);
        let web_url = required_str(project, "/web_url")?;
        environment.set("CI_PROJECT_URL", web_url);
        environment.set("CI_SERVER_URL", gitlab_server_from(web_url)?);

        for entry in &self.environment {
            environment.set_entry(entry.clone());
        }

        let spec = ProcessSpec {
            program: command.program.clone(),
            args: command.args.clone(),
            env: environment,
            run_as: self.run_as.clone(),
        };

        let appended = ctx.queue.append(Action {
            name: self.name.clone(),
            payload: ActionPayload::Exec(spec),
            timeout: self.timeout,
        });
        if !appended {
            return Err(HookError::Internal("action queue is shut down".to_string()));
        }

        ctx.stats.action_scheduled();
        debug!(hook = %self.name, "scheduled hook '{}'", self.name);
        Ok(Outcome::Accepted)
    }
}

/// Looks up a JSON pointer, mapping absence to a payload error.
fn required<'a>(value: &'a Value, pointer: &str) -> Result<&'a Value, HookError> {
    value
        .pointer(pointer)
        .ok_or_else(|| HookError::Payload(format!("missing {} in payload", pointer)))
}

/// Looks up a JSON pointer that must be a string.
fn required_str<'a>(value: &'a Value, pointer: &str) -> Result<&'a str, HookError> {
    required(value, pointer)?
        .as_str()
        .ok_or_else(|| HookError::Payload(format!("{} is not a string", pointer)))
}

/// Extracts `scheme://authority` from the project's `web_url`.
fn gitlab_server_from(web_url: &str) -> Result<&str, HookError> {
    if let Some(scheme_end) = web_url.find("://")
        && let Some(path_start) = web_url[scheme_end + 3..].find('/')
    {
        return Ok(&web_url[..scheme_end + 3 + path_start]);
    }
    Err(HookError::Payload(
        "invalid project.web_url in payload".to_string(),
    ))
}

/// Hooks sharing one URI path, walked in configuration order.
#[derive(Debug)]
pub struct HookChain {
    uri_path: String,
    hooks: Vec<Hook>,
}

impl HookChain {
    /// The path every member is registered on.
    pub fn uri_path(&self) -> &str {
        &self.uri_path
    }

    /// The chain members in dispatch order.
    pub fn hooks(&self) -> &[Hook] {
        &self.hooks
    }

    /// Whether any member authorizes the request.
    pub fn authorizes(&self, token: &str, peer_address: &str) -> bool {
        self.hooks
            .iter()
            .any(|hook| hook.authorizes(token, peer_address))
    }
}

/// Groups hook configurations into chains by `uri_path`, preserving file
/// order both across chains and within each chain.
pub fn build_chains(
    configs: &[HookConfig],
    running_as_root: bool,
) -> Result<Vec<HookChain>, HookBuildError> {
    let mut chains: Vec<HookChain> = Vec::new();

    for config in configs {
        let hook = Hook::from_config(config, running_as_root)?;
        match chains
            .iter_mut()
            .find(|chain| chain.uri_path == hook.uri_path)
        {
            Some(chain) => chain.hooks.push(hook),
            None => chains.push(HookChain {
                uri_path: hook.uri_path.clone(),
                hooks: vec![hook],
            }),
        }
    }

    Ok(chains)
}
