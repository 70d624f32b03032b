//! Common test utilities for media-broker E2E tests
//!
//! The external tools are replaced by small shell scripts so the whole pipeline,
//! including process spawning, runs for real.

#![allow(dead_code)]

use media_broker::{Config, Event, FetchBroker};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

/// Stand-in fetch tool.
///
/// Probe mode (no `-P`) prints one metadata line per URL reporting `probe_bytes`.
/// Fetch mode writes `item_N.bin` per URL into the `-P` directory, containing
/// `payload <url>`, and prints each path. Every invocation appends its mode to
/// `calls.log` next to the script.
pub fn fetch_tool_script(probe_bytes: u64, fail_fetch: bool) -> String {
    let fetch_exit = if fail_fetch {
        "echo 'ERROR: unsupported URL' >&2; exit 1"
    } else {
        ""
    };

    format!(
        r#"#!/bin/sh
log="$(dirname "$0")/calls.log"
dir=""
while [ $# -gt 0 ]; do
  case "$1" in
    -P) dir="$2"; shift 2 ;;
    -f|-o|-N|--print|--audio-format) shift 2 ;;
    --) shift; break ;;
    *) shift ;;
  esac
done
if [ -z "$dir" ]; then
  echo probe >> "$log"
  for u in "$@"; do
    printf '%s\t%s\tNA\tNA\tNA\n' "$u" {probe_bytes}
  done
  exit 0
fi
echo fetch >> "$log"
{fetch_exit}
i=0
for u in "$@"; do
  i=$((i+1))
  f="$dir/item_$i.bin"
  printf 'payload %s' "$u" > "$f"
  echo "$f"
done
"#
    )
}

/// Stand-in archive tool: `-j -q <archive> inputs...` concatenates the inputs
pub const ARCHIVE_TOOL_SCRIPT: &str = r#"#!/bin/sh
shift 2
out="$1"
shift
cat "$@" > "$out"
"#;

/// Temporary environment holding the tool scripts and the output directory
pub struct TestEnv {
    pub tools_dir: TempDir,
    pub output_dir: TempDir,
}

impl TestEnv {
    pub fn new(probe_bytes: u64, fail_fetch: bool) -> Self {
        let tools_dir = TempDir::new().unwrap();
        let output_dir = TempDir::new().unwrap();
        write_script(
            &tools_dir.path().join("fake-yt-dlp"),
            &fetch_tool_script(probe_bytes, fail_fetch),
        );
        write_script(&tools_dir.path().join("fake-zip"), ARCHIVE_TOOL_SCRIPT);
        Self {
            tools_dir,
            output_dir,
        }
    }

    /// Configuration pointing at the scripts, with disk-space checks off
    pub fn config(&self) -> Config {
        let mut config = Config::default();
        config.output_dir = self.output_dir.path().to_path_buf();
        config.tools.fetch_tool_path = Some(self.tools_dir.path().join("fake-yt-dlp"));
        config.tools.archive_tool_path = Some(self.tools_dir.path().join("fake-zip"));
        config.tools.search_path = false;
        config.tools.timeout = Some(Duration::from_secs(30));
        config.admission.disk_space.enabled = false;
        config
    }

    pub async fn broker(&self, configure: impl FnOnce(&mut Config)) -> Arc<FetchBroker> {
        let mut config = self.config();
        configure(&mut config);
        Arc::new(FetchBroker::new(config).await.unwrap())
    }

    /// Modes recorded by the fetch tool, in invocation order
    pub fn tool_calls(&self) -> Vec<String> {
        std::fs::read_to_string(self.tools_dir.path().join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn output_entries(&self) -> Vec<PathBuf> {
        std::fs::read_dir(self.output_dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect()
    }
}

fn write_script(path: &Path, body: &str) {
    std::fs::write(path, body).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// Wait for the first event matching `predicate`, failing after `timeout`
pub async fn wait_for_event<F>(
    rx: &mut broadcast::Receiver<Event>,
    timeout: Duration,
    mut predicate: F,
) -> Event
where
    F: FnMut(&Event) -> bool,
{
    tokio::time::timeout(timeout, async {
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
