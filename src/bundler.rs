//! Multi-artifact bundling
//!
//! When a request yields more than one artifact they are packed into a single archive
//! with the external archive tool. Inputs are stored flat (`-j`) so the archive holds
//! bare file names regardless of where the fetch tool put them.

use crate::error::{Error, Result};
use crate::process::{CommandOutcome, CommandRunner};
use crate::utils::remove_path;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Packs several artifacts into one archive
pub struct Bundler {
    tool: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl Bundler {
    /// Create a bundler using the archive tool at `tool`
    pub fn new(tool: PathBuf, runner: Arc<dyn CommandRunner>) -> Self {
        Self { tool, runner }
    }

    /// Bundle `inputs` into a new archive inside `dest_dir`
    ///
    /// Requires at least two inputs. The inputs are never modified. On failure any
    /// partially written archive is removed before the error is returned.
    pub async fn bundle(&self, inputs: &[PathBuf], dest_dir: &Path) -> Result<PathBuf> {
        if inputs.len() < 2 {
            return Err(Error::Bundle(format!(
                "bundling needs at least two artifacts, got {}",
                inputs.len()
            )));
        }

        let archive = dest_dir.join(archive_name());
        let mut args: Vec<OsString> = vec!["-j".into(), "-q".into(), archive.as_os_str().to_owned()];
        args.extend(inputs.iter().map(|p| p.as_os_str().to_owned()));

        let output = self.runner.run(&self.tool, &args).await?;
        match output.into_outcome() {
            CommandOutcome::Succeeded { .. } => {}
            CommandOutcome::Failed { diagnostics, .. } => {
                discard_partial(&archive).await;
                tracing::warn!(archive = %archive.display(), error = %diagnostics, "archive tool failed");
                return Err(Error::Bundle(diagnostics));
            }
        }

        match tokio::fs::metadata(&archive).await {
            Ok(meta) if meta.is_file() => {}
            _ => {
                discard_partial(&archive).await;
                return Err(Error::Bundle(format!(
                    "archive tool reported success but {} was not created",
                    archive.display()
                )));
            }
        }

        tracing::info!(
            archive = %archive.display(),
            inputs = inputs.len(),
            "bundled artifacts"
        );

        Ok(archive)
    }
}

/// Unique archive file name
pub fn archive_name() -> String {
    format!(
        "media-{}-{:08x}.zip",
        chrono::Utc::now().format("%Y%m%d%H%M%S"),
        rand::random::<u32>()
    )
}

async fn discard_partial(archive: &Path) {
    if let Err(e) = remove_path(archive).await {
        tracing::warn!(archive = %archive.display(), error = %e, "failed to remove partial archive");
    }
}
