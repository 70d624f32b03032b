//! Fetch execution via the external media tool
//!
//! One subprocess per request covers every URL. The tool is told to print the final
//! path of each finished item on stdout, so the stdout lines become the artifact list.

use crate::error::{Error, Result};
use crate::estimator::format_selector;
use crate::process::{CommandOutcome, CommandRunner};
use crate::types::{FetchResult, MediaFormat};
use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use url::Url;

/// Codec audio downloads are converted to
pub const AUDIO_CODEC: &str = "mp3";

/// Output filename template handed to the tool
const OUTPUT_TEMPLATE: &str = "%(title)s [%(id)s].%(ext)s";

/// Runs the external fetch tool
pub struct FetchExecutor {
    tool: PathBuf,
    runner: Arc<dyn CommandRunner>,
    workers: usize,
}

impl FetchExecutor {
    /// Create an executor; the worker hint defaults to the available CPU count
    pub fn new(tool: PathBuf, runner: Arc<dyn CommandRunner>) -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            tool,
            runner,
            workers,
        }
    }

    /// Override the concurrent-worker hint passed to the tool
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Fetch every URL into `dir`
    ///
    /// Returns the reported artifact paths in completion order. An empty result is
    /// not an error here; the caller decides whether a deliverable is required.
    pub async fn fetch(&self, urls: &[Url], format: MediaFormat, dir: &Path) -> Result<FetchResult> {
        let args = self.build_args(urls, format, dir);

        tracing::info!(
            urls = urls.len(),
            format = %format,
            dir = %dir.display(),
            workers = self.workers,
            runner = self.runner.name(),
            "starting fetch"
        );

        let output = self.runner.run(&self.tool, &args).await?;
        let lines = match output.into_outcome() {
            CommandOutcome::Succeeded { lines } => lines,
            CommandOutcome::Failed { diagnostics, .. } => {
                tracing::warn!(dir = %dir.display(), error = %diagnostics, "fetch tool failed");
                return Err(Error::Fetch(diagnostics));
            }
        };

        let root = tokio::fs::canonicalize(dir).await?;
        let mut seen = HashSet::new();
        let mut paths = Vec::new();
        for line in lines {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let reported = dir.join(trimmed);
            let path = tokio::fs::canonicalize(&reported).await.map_err(|e| {
                Error::Fetch(format!(
                    "reported artifact {} is not readable: {}",
                    reported.display(),
                    e
                ))
            })?;

            // Everything tracked here is deleted with the request
            if !path.starts_with(&root) {
                return Err(Error::Fetch(format!(
                    "reported artifact is outside the request directory: {}",
                    reported.display()
                )));
            }

            if !seen.insert(path.clone()) {
                continue;
            }

            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => paths.push(path),
                Ok(_) => {
                    return Err(Error::Fetch(format!(
                        "reported artifact is not a regular file: {}",
                        path.display()
                    )));
                }
                Err(e) => {
                    return Err(Error::Fetch(format!(
                        "reported artifact {} is not readable: {}",
                        path.display(),
                        e
                    )));
                }
            }
        }

        tracing::debug!(dir = %dir.display(), artifacts = paths.len(), "fetch finished");

        Ok(FetchResult { paths })
    }

    /// Deterministic argument list for one fetch
    pub fn build_args(&self, urls: &[Url], format: MediaFormat, dir: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-f".into(),
            format_selector(format).into(),
            "-P".into(),
            dir.as_os_str().to_owned(),
            "-o".into(),
            OUTPUT_TEMPLATE.into(),
            "--restrict-filenames".into(),
            "-N".into(),
            self.workers.to_string().into(),
            "--no-progress".into(),
            "--no-simulate".into(),
            "--print".into(),
            "after_move:filepath".into(),
        ];

        if format == MediaFormat::Audio {
            args.push("-x".into());
            args.push("--audio-format".into());
            args.push(AUDIO_CODEC.into());
        }

        args.push("--".into());
        args.extend(urls.iter().map(|u| OsString::from(u.as_str())));
        args
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::CommandOutput;
    use crate::process::testing::{ScriptedRunner, arg_after};
    use tempfile::TempDir;

    fn url(raw: &str) -> Url {
        Url::parse(raw).unwrap()
    }

    fn executor(runner: Arc<ScriptedRunner>) -> FetchExecutor {
        FetchExecutor::new(PathBuf::from("yt-dlp"), runner).with_workers(4)
    }

    #[test]
    fn audio_args_extract_to_fixed_codec() {
        let exec = executor(Arc::new(ScriptedRunner::new()));
        let args = exec.build_args(
            &[url("https://a.example/1"), url("https://b.example/2")],
            MediaFormat::Audio,
            Path::new("/srv/out/req"),
        );

        assert_eq!(arg_after(&args, "-f").as_deref(), Some("bestaudio/best"));
        assert_eq!(arg_after(&args, "-P").as_deref(), Some("/srv/out/req"));
        assert_eq!(arg_after(&args, "-N").as_deref(), Some("4"));
        assert_eq!(arg_after(&args, "--audio-format").as_deref(), Some("mp3"));
        assert!(args.contains(&OsString::from("-x")));
        assert!(args.contains(&OsString::from("--restrict-filenames")));

        let tail: Vec<_> = args.iter().rev().take(2).collect();
        assert_eq!(tail[0], "https://b.example/2");
        assert_eq!(tail[1], "https://a.example/1");
    }

    #[test]
    fn video_args_do_not_extract_audio() {
        let exec = executor(Arc::new(ScriptedRunner::new()));
        let args = exec.build_args(&[url("https://a.example/1")], MediaFormat::Video, Path::new("/o"));

        assert_eq!(
            arg_after(&args, "-f").as_deref(),
            Some("bestvideo*+bestaudio/best")
        );
        assert!(!args.contains(&OsString::from("-x")));
        assert!(!args.contains(&OsString::from("--audio-format")));
    }

    #[test]
    fn args_are_deterministic() {
        let exec = executor(Arc::new(ScriptedRunner::new()));
        let urls = [url("https://a.example/1")];
        assert_eq!(
            exec.build_args(&urls, MediaFormat::Audio, Path::new("/o")),
            exec.build_args(&urls, MediaFormat::Audio, Path::new("/o"))
        );
    }

    #[tokio::test]
    async fn stdout_lines_become_paths_in_completion_order() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().canonicalize().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_with({
            let dir = dir.clone();
            move |_| {
                std::fs::write(dir.join("b.mp3"), b"b").unwrap();
                std::fs::write(dir.join("a.mp3"), b"a").unwrap();
                Ok(CommandOutput::success([
                    format!("  {}  ", dir.join("b.mp3").display()),
                    String::new(),
                    dir.join("a.mp3").display().to_string(),
                    dir.join("b.mp3").display().to_string(),
                ]))
            }
        });

        let result = executor(runner)
            .fetch(&[url("https://a.example/1")], MediaFormat::Audio, &dir)
            .await
            .unwrap();

        assert_eq!(result.paths, vec![dir.join("b.mp3"), dir.join("a.mp3")]);
    }

    #[tokio::test]
    async fn zero_exit_without_output_is_empty_result() {
        let temp = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.push(CommandOutput::success(Vec::<String>::new()));

        let result = executor(runner)
            .fetch(&[url("https://a.example/1")], MediaFormat::Audio, temp.path())
            .await
            .unwrap();

        assert!(result.paths.is_empty());
    }

    #[tokio::test]
    async fn nonzero_exit_carries_stderr() {
        let temp = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.push(CommandOutput::failure(1, "ERROR: Video unavailable"));

        let result = executor(runner)
            .fetch(&[url("https://a.example/1")], MediaFormat::Video, temp.path())
            .await;

        match result {
            Err(Error::Fetch(msg)) => assert!(msg.contains("Video unavailable")),
            other => panic!("expected fetch failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reported_path_that_does_not_exist_is_failure() {
        let temp = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.push(CommandOutput::success([temp
            .path()
            .join("ghost.mp3")
            .display()
            .to_string()]));

        let result = executor(runner)
            .fetch(&[url("https://a.example/1")], MediaFormat::Audio, temp.path())
            .await;

        assert!(matches!(result, Err(Error::Fetch(_))));
    }

    #[tokio::test]
    async fn reported_directory_is_failure() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join("sub")).unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.push(CommandOutput::success(["sub"]));

        let result = executor(runner)
            .fetch(&[url("https://a.example/1")], MediaFormat::Audio, temp.path())
            .await;

        assert!(matches!(result, Err(Error::Fetch(msg)) if msg.contains("not a regular file")));
    }

    #[tokio::test]
    async fn paths_outside_the_request_directory_are_rejected() {
        let outside = TempDir::new().unwrap();
        let victim = outside.path().join("keep.txt");
        std::fs::write(&victim, b"not ours").unwrap();

        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("req");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(temp.path().join("sibling.mp3"), b"x").unwrap();

        for reported in [victim.display().to_string(), "../sibling.mp3".to_string()] {
            let runner = Arc::new(ScriptedRunner::new());
            runner.push(CommandOutput::success([reported.clone()]));

            let result = executor(runner)
                .fetch(&[url("https://a.example/1")], MediaFormat::Audio, &dir)
                .await;

            assert!(
                matches!(&result, Err(Error::Fetch(msg)) if msg.contains("outside the request directory")),
                "{reported}: {result:?}"
            );
        }
        assert!(victim.exists());
    }
}
