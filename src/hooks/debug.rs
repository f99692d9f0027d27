//! The debug hook: dumps every delivery to stdout.
//!
//! Useful while setting up a new GitLab webhook to see exactly what the
//! server sends. The dump goes to stdout on purpose (not the log), so it
//! can be piped or redirected independently of the daemon's logging.

use serde_json::Value;

use crate::process::Environment;

use super::{Hook, HookContext, HookError, Outcome};

/// Printed between deliveries so consecutive dumps are separable.
const SEPARATOR: &str =
    "--------------------------------------------------------------------------------";

/// Prints the event header and pretty-printed payload, then delegates to
/// [`Hook::execute`] (a no-op `Ignored` when the hook has no command).
pub(super) fn process(
    hook: &Hook,
    ctx: HookContext<'_>,
    event: Option<&str>,
    payload: &Value,
) -> Result<Outcome, HookError> {
    let pretty = serde_json::to_string_pretty(payload)
        .map_err(|err| HookError::Internal(format!("failed to render payload: {err}")))?;

    println!(
        "X-Gitlab-Event: {}\n{}\n{}",
        event.unwrap_or("(unspecified)"),
        pretty,
        SEPARATOR
    );

    hook.execute(ctx, payload, Environment::new())
}
