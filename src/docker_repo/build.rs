// `docker build` / `docker compose` invocations

use std::collections::BTreeMap;
use std::path::Path;

use crate::command;
use crate::error::RuntimeError;

pub(super) async fn image(context: &Path, dockerfile: &Path, tag: &str) -> Result<(), RuntimeError> {
    let dockerfile = dockerfile.to_string_lossy();
    let context_arg = context.to_string_lossy();
    command::run(
        "docker",
        &["build", "-t", tag, "-f", &dockerfile, &context_arg],
        Some(context),
        &[],
    )
    .await?;
    tracing::info!(tag, "image built");
    Ok(())
}

pub(super) async fn compose_build(dir: &Path, file: &Path, project: &str) -> Result<(), RuntimeError> {
    let file = file.to_string_lossy();
    command::run(
        "docker",
        &["compose", "-f", &file, "-p", project, "build"],
        Some(dir),
        &[],
    )
    .await?;
    tracing::info!(project, "compose project built");
    Ok(())
}

/// Unit env is exported to the compose process so `${VAR}` interpolation picks it up.
pub(super) async fn compose_up(
    dir: &Path,
    file: &Path,
    project: &str,
    env: &BTreeMap<String, String>,
) -> Result<(), RuntimeError> {
    let file = file.to_string_lossy();
    let envs: Vec<(String, String)> = env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    command::run(
        "docker",
        &["compose", "-f", &file, "-p", project, "up", "-d"],
        Some(dir),
        &envs,
    )
    .await?;
    Ok(())
}

/// Compose project names allow only lowercase alphanumerics, `-` and `_`.
pub(super) fn compose_project_name(tag: &str) -> String {
    let base = tag.split(':').next().unwrap_or(tag);
    base.chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}
