//! The pipeline hook: reacts to GitLab `Pipeline Hook` events.
//!
//! A delivery is accepted when the pipeline status passes the configured
//! filter and at least one build matches a configured job name with status
//! `success`. The selected builds are exported to the command through
//! `CI_JOB_IDS`/`CI_JOB_NAMES`, alongside the commit and pipeline
//! identifiers.

use std::collections::HashSet;

use serde_json::Value;

use crate::process::Environment;

use super::{Hook, HookBuildError, HookContext, HookError, Outcome, required, required_str};

/// Event header value this hook reacts to.
const PIPELINE_EVENT: &str = "Pipeline Hook";

/// Build status that selects a job.
const SUCCESS: &str = "success";

/// The pipeline hook's configured filters.
#[derive(Debug)]
pub(super) struct PipelineFilter {
    /// Build names that select jobs.
    job_names: HashSet<String>,

    /// Accepted pipeline statuses; `None` accepts any.
    statuses: Option<HashSet<String>>,
}

impl PipelineFilter {
    pub(super) fn from_config(config: &crate::config::HookConfig) -> Result<Self, HookBuildError> {
        let job_names: HashSet<String> = config
            .job_name
            .clone()
            .map(|names| names.into_vec().into_iter().collect())
            .unwrap_or_default();
        if job_names.is_empty() {
            return Err(HookBuildError::MissingJobNames(config.name.clone()));
        }

        let statuses = config
            .status
            .clone()
            .map(|statuses| statuses.into_vec().into_iter().collect());

        Ok(PipelineFilter {
            job_names,
            statuses,
        })
    }
}

/// Filters the delivery and, on a match, binds the pipeline environment and
/// delegates to [`Hook::execute`].
pub(super) fn process(
    hook: &Hook,
    filter: &PipelineFilter,
    ctx: HookContext<'_>,
    event: Option<&str>,
    payload: &Value,
) -> Result<Outcome, HookError> {
    match bind_environment(filter, event, payload)? {
        Some(environment) => hook.execute(ctx, payload, environment),
        None => Ok(Outcome::Ignored),
    }
}

/// Applies the event/status/job filters; on a match returns the pipeline
/// environment overlay, otherwise `None`.
fn bind_environment(
    filter: &PipelineFilter,
    event: Option<&str>,
    payload: &Value,
) -> Result<Option<Environment>, HookError> {
    if event != Some(PIPELINE_EVENT) {
        return Ok(None);
    }

    let attributes = required(payload, "/object_attributes")?;

    if let Some(statuses) = &filter.statuses {
        let status = required_str(attributes, "/status")?;
        if !statuses.contains(status) {
            return Ok(None);
        }
    }

    let builds = required(payload, "/builds")?
        .as_array()
        .ok_or_else(|| HookError::Payload("builds is not an array".to_string()))?;

    let mut job_names = Vec::new();
    let mut job_ids = Vec::new();
    for build in builds {
        let name = required_str(build, "/name")?;
        if filter.job_names.contains(name) && required_str(build, "/status")? == SUCCESS {
            let id = required(build, "/id")?
                .as_i64()
                .ok_or_else(|| HookError::Payload("build id is not an integer".to_string()))?;
            job_names.push(name);
            job_ids.push(id.to_string());
        }
    }

    if job_names.is_empty() {
        return Ok(None);
    }

    let mut environment = Environment::new();
    environment.set_list("CI_JOB_IDS", &job_ids);
    environment.set_list("CI_JOB_NAMES", &job_names);

    let ref_name = required_str(attributes, "/ref")?;
    environment.set("CI_COMMIT_REF_NAME", ref_name);
    environment.set("CI_COMMIT_SHA", required_str(attributes, "/sha")?);
    let pipeline_id = required(attributes, "/id")?
        .as_i64()
        .ok_or_else(|| HookError::Payload("object_attributes.id is not an integer".to_string()))?;
    environment.set("CI_PIPELINE_ID", pipeline_id.to_string());

    // GitLab flags tag pipelines with a boolean; the ref is the tag name.
    if attributes.get("tag").and_then(Value::as_bool) == Some(true) {
        environment.set("CI_COMMIT_TAG", ref_name);
    }

    Ok(Some(environment))
}
