//! Transfer size estimation
//!
//! The fetch tool is run once in probe mode for the whole batch and prints one
//! tab-separated metadata line per resolved media item. Each line is projected to a
//! byte count independently and the projections are summed.

use crate::error::{Error, Result};
use crate::process::{CommandOutcome, CommandRunner};
use crate::types::{MediaFormat, MediaMetadata, SizeEstimate, UrlEstimate};
use std::collections::HashSet;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use url::Url;

/// Bytes per second for one kilobit per second
pub const KBPS_TO_BYTES_PER_SEC: f64 = 125.0;

/// Bitrate assumed when only the duration is known (kbit/s)
pub const DEFAULT_BITRATE_KBPS: f64 = 1_000.0;

/// Projection for an item with no usable metadata at all
pub const DEFAULT_PROJECTION_BYTES: u64 = 200_000_000;

/// Probe output template: url, size, video kbps, audio kbps, duration
const PROBE_TEMPLATE: &str =
    "%(original_url)s\t%(filesize,filesize_approx)s\t%(vbr)s\t%(abr)s\t%(duration)s";

/// Projects the transfer size of a request before anything is fetched
pub struct SizeEstimator {
    tool: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl SizeEstimator {
    /// Create an estimator that probes with the fetch tool at `tool`
    pub fn new(tool: PathBuf, runner: Arc<dyn CommandRunner>) -> Self {
        Self { tool, runner }
    }

    /// Probe every URL in one invocation and project the aggregate size
    ///
    /// Fails only when the probe exits non-zero. URLs the probe said nothing about
    /// receive the fixed default projection.
    pub async fn estimate(&self, urls: &[Url], format: MediaFormat) -> Result<SizeEstimate> {
        let args = probe_args(urls, format);
        let output = self.runner.run(&self.tool, &args).await?;

        let lines = match output.into_outcome() {
            CommandOutcome::Succeeded { lines } => lines,
            CommandOutcome::Failed { diagnostics, .. } => {
                tracing::warn!(urls = urls.len(), error = %diagnostics, "metadata probe failed");
                return Err(Error::Probe(diagnostics));
            }
        };

        let mut entries: Vec<UrlEstimate> = lines
            .iter()
            .filter_map(|line| parse_probe_line(line))
            .map(|(url, metadata)| UrlEstimate {
                projected_bytes: project_bytes(&metadata),
                url,
                metadata,
            })
            .collect();

        let reported: HashSet<&str> = entries.iter().map(|e| e.url.as_str()).collect();
        let missing: Vec<UrlEstimate> = urls
            .iter()
            .filter(|u| !reported.contains(u.as_str()))
            .map(|u| UrlEstimate {
                url: u.to_string(),
                metadata: MediaMetadata::default(),
                projected_bytes: DEFAULT_PROJECTION_BYTES,
            })
            .collect();
        entries.extend(missing);

        let total_bytes = aggregate(&entries);

        tracing::debug!(
            urls = urls.len(),
            items = entries.len(),
            total_bytes,
            "size estimate complete"
        );

        Ok(SizeEstimate {
            entries,
            total_bytes,
        })
    }
}

/// Arguments for one probe invocation
pub fn probe_args(urls: &[Url], format: MediaFormat) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-f".into(),
        format_selector(format).into(),
        "--no-warnings".into(),
        "--print".into(),
        PROBE_TEMPLATE.into(),
        "--".into(),
    ];
    args.extend(urls.iter().map(|u| OsString::from(u.as_str())));
    args
}

/// Format-selection syntax of the fetch tool for each format
pub fn format_selector(format: MediaFormat) -> &'static str {
    match format {
        MediaFormat::Audio => "bestaudio/best",
        MediaFormat::Video => "bestvideo*+bestaudio/best",
    }
}

/// Project the transfer size of one item
///
/// Priority: exact size, then (video + audio bitrate) × duration, then duration at
/// [`DEFAULT_BITRATE_KBPS`], then [`DEFAULT_PROJECTION_BYTES`].
pub fn project_bytes(metadata: &MediaMetadata) -> u64 {
    if metadata.byte_count > 0 {
        return metadata.byte_count;
    }

    let kbps = metadata.video_kbps + metadata.audio_kbps;
    if kbps > 0.0 && metadata.duration_secs > 0.0 {
        return to_bytes(kbps * metadata.duration_secs * KBPS_TO_BYTES_PER_SEC);
    }

    if metadata.duration_secs > 0.0 {
        return to_bytes(metadata.duration_secs * DEFAULT_BITRATE_KBPS * KBPS_TO_BYTES_PER_SEC);
    }

    DEFAULT_PROJECTION_BYTES
}

fn aggregate(entries: &[UrlEstimate]) -> u64 {
    entries
        .iter()
        .fold(0u64, |sum, e| sum.saturating_add(e.projected_bytes))
}

// float-to-int `as` saturates, so huge values clamp to u64::MAX
fn to_bytes(value: f64) -> u64 {
    value.round() as u64
}

fn parse_probe_line(line: &str) -> Option<(String, MediaMetadata)> {
    let fields: Vec<&str> = line.trim_end_matches(['\r', '\n']).split('\t').collect();
    if fields.len() < 5 {
        tracing::debug!(%line, "ignoring unrecognised probe line");
        return None;
    }

    let size = parse_field(fields[1]);
    let metadata = MediaMetadata {
        byte_count: to_bytes(size),
        video_kbps: parse_field(fields[2]),
        audio_kbps: parse_field(fields[3]),
        duration_secs: parse_field(fields[4]),
    };

    Some((fields[0].trim().to_string(), metadata))
}

/// Unparsable, negative, or non-finite values count as zero
fn parse_field(raw: &str) -> f64 {
    match raw.trim().parse::<f64>() {
        Ok(v) if v.is_finite() && v > 0.0 => v,
        _ => 0.0,
    }
}
