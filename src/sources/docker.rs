use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::{Arc, OnceLock};
use tempfile::TempDir;

use super::Source;
use crate::cancel::CancelSignal;
use crate::error::{Error, Result};
use crate::image::{ConfigSchema, HistoryItem};
use crate::layers::LayerPipeline;
use crate::notifier::Notifier;
use crate::save_archive::SaveArchive;

/// Reads images from the local Docker daemon through the `docker` CLI.
pub struct DaemonSource {
    api_version: OnceLock<Option<String>>,
    notifier: Arc<Notifier>,
}

/// One line of `docker history --format '{{json .}}'`.
#[derive(Debug, Deserialize)]
struct HistoryLine {
    #[serde(rename = "CreatedBy", default)]
    created_by: String,
    #[serde(rename = "CreatedAt", default)]
    created_at: Option<String>,
    #[serde(rename = "Comment", default)]
    comment: Option<String>,
}

impl DaemonSource {
    pub fn new(notifier: Arc<Notifier>) -> Self {
        Self {
            api_version: OnceLock::new(),
            notifier,
        }
    }

    fn run_command(&self, identifier: &str, args: &[&str]) -> Result<String> {
        let output = Command::new("docker").args(args).output().map_err(|e| {
            Error::source_failure(
                self.name(),
                identifier,
                format!("failed to execute docker {:?}: {}", args, e),
            )
        })?;

        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            return Err(Error::source_failure(
                self.name(),
                identifier,
                format!("docker command failed: {}", error.trim()),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Asks the daemon for its API version once and remembers the answer.
    fn negotiate_version(&self) -> Option<&str> {
        self.api_version
            .get_or_init(|| {
                let version = self
                    .run_command("", &["version", "--format", "{{.Server.APIVersion}}"])
                    .ok()
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty());
                match &version {
                    Some(v) => log::debug!("Docker daemon API version {}", v),
                    None => log::debug!("Docker daemon did not report an API version"),
                }
                version
            })
            .as_deref()
    }
}

impl Source for DaemonSource {
    fn name(&self) -> &str {
        "daemon"
    }

    fn supports_image(&self, identifier: &str) -> bool {
        Command::new("docker")
            .args(["image", "inspect", "--format", "{{.Id}}", identifier])
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    fn materialize_filesystem(
        &self,
        identifier: &str,
        dest: &Path,
        cancel: &CancelSignal,
    ) -> Result<()> {
        if self.negotiate_version().is_none() {
            return Err(Error::source_failure(
                self.name(),
                identifier,
                "docker daemon is not reachable",
            ));
        }

        let scratch = TempDir::new()?;
        let tarball = scratch.path().join("image.tar");
        let tarball_arg = tarball.to_string_lossy().to_string();

        self.notifier
            .info(&format!("Exporting image '{}' from the daemon...", identifier));
        self.run_command(identifier, &["save", "-o", &tarball_arg, identifier])?;

        let archive = SaveArchive::stage(&tarball)
            .map_err(|e| Error::source_failure(self.name(), identifier, e))?;
        fs::remove_file(&tarball)?;

        let layers = archive.layers();
        self.notifier
            .info(&format!("Extracting {} layers of '{}'...", layers.len(), identifier));
        let progress = self
            .notifier
            .create_progress_bar(layers.len() as u64, identifier);
        let pipeline =
            LayerPipeline::new(archive.fetcher(), cancel.clone()).with_progress(progress.clone());
        let result = super::block_on(pipeline.materialize(&layers, dest))?;

        if let Some(pb) = progress {
            pb.finish_and_clear();
        }
        result
    }

    fn extract_config(&self, identifier: &str) -> Result<ConfigSchema> {
        let env = self.run_command(
            identifier,
            &["image", "inspect", "--format", "{{json .Config.Env}}", identifier],
        )?;
        let history = self.run_command(
            identifier,
            &["history", "--no-trunc", "--format", "{{json .}}", identifier],
        )?;

        Ok(ConfigSchema {
            env: parse_env(&env, identifier)?,
            history: parse_history(&history, identifier)?,
        })
    }
}

fn parse_env(output: &str, identifier: &str) -> Result<Vec<String>> {
    let env: Option<Vec<String>> =
        serde_json::from_str(output.trim()).map_err(|e| Error::ConfigParse {
            image: identifier.to_string(),
            reason: format!("invalid env from docker inspect: {}", e),
        })?;
    Ok(env.unwrap_or_default())
}

/// Docker lists history newest first; the result is in build order.
fn parse_history(output: &str, identifier: &str) -> Result<Vec<HistoryItem>> {
    let mut items = output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| -> Result<HistoryItem> {
            let parsed: HistoryLine =
                serde_json::from_str(line).map_err(|e| Error::ConfigParse {
                    image: identifier.to_string(),
                    reason: format!("invalid history line from docker: {}", e),
                })?;
            Ok(HistoryItem {
                created_by: parsed.created_by,
                created: parsed.created_at,
                comment: parsed.comment.filter(|c| !c.is_empty()),
                empty_layer: None,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    items.reverse();
    Ok(items)
}
