//! Core types and events

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use url::Url;

/// Unique identifier for one admitted request
///
/// Also used as the name of the request's working directory inside the output
/// directory, so it only contains `[0-9a-f-]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    /// Generate a new id from the current UTC time and a random suffix
    pub fn generate() -> Self {
        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
        Self(format!("{}-{:016x}", stamp, rand::random::<u64>()))
    }

    /// The id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Output format requested by the caller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaFormat {
    /// Best audio stream, extracted and converted to a fixed codec
    #[default]
    Audio,
    /// Best video stream merged with best audio stream
    Video,
}

impl MediaFormat {
    /// Name used on the query string
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaFormat::Audio => "audio",
            MediaFormat::Video => "video",
        }
    }
}

impl FromStr for MediaFormat {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "audio" => Ok(MediaFormat::Audio),
            "video" => Ok(MediaFormat::Video),
            other => Err(ValidationError::UnsupportedFormat(other.to_string())),
        }
    }
}

impl fmt::Display for MediaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated fetch request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    urls: Vec<Url>,
    format: MediaFormat,
}

impl FetchRequest {
    /// Validate raw request parameters
    ///
    /// Rules are checked in order: at least one URL, a supported format, then every
    /// URL must parse as an absolute URL. The first violated rule is reported.
    pub fn new<I, S>(urls: I, format: Option<&str>) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let raw: Vec<S> = urls.into_iter().collect();
        if raw.is_empty() {
            return Err(ValidationError::MissingUrl);
        }

        let format = match format {
            Some(name) => name.parse()?,
            None => MediaFormat::default(),
        };

        let urls = raw
            .iter()
            .map(|u| {
                let u = u.as_ref();
                Url::parse(u).map_err(|e| ValidationError::InvalidUrl {
                    url: u.to_string(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { urls, format })
    }

    /// Target URLs in request order
    pub fn urls(&self) -> &[Url] {
        &self.urls
    }

    /// Requested output format
    pub fn format(&self) -> MediaFormat {
        self.format
    }
}

/// Best-effort metadata reported by the fetch tool's probe mode for one URL
///
/// Missing or unparsable fields are zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaMetadata {
    /// Exact or approximate size in bytes (0 = unknown)
    pub byte_count: u64,
    /// Video bitrate in kilobits per second
    pub video_kbps: f64,
    /// Audio bitrate in kilobits per second
    pub audio_kbps: f64,
    /// Duration in seconds
    pub duration_secs: f64,
}

/// Projection for one URL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrlEstimate {
    /// URL as reported by the probe
    pub url: String,
    /// Raw metadata
    pub metadata: MediaMetadata,
    /// Projected bytes for this URL
    pub projected_bytes: u64,
}

/// Size projection for a whole request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SizeEstimate {
    /// Per-URL projections in probe output order
    pub entries: Vec<UrlEstimate>,
    /// Sum of all per-URL projections
    pub total_bytes: u64,
}

/// Paths produced by one successful fetch invocation, in completion order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchResult {
    /// Absolute paths of completed artifacts
    pub paths: Vec<PathBuf>,
}

/// Broker events
///
/// Broadcast to every subscriber; sending with no subscribers is not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Request passed validation and size admission
    RequestAdmitted {
        /// Request id
        id: RequestId,
        /// Number of URLs in the request
        url_count: usize,
        /// Aggregate projection in bytes
        projected_bytes: u64,
    },

    /// Request was turned away before any fetch started
    RequestRejected {
        /// Machine-readable reason (error code)
        reason: String,
    },

    /// Fetch tool exited successfully
    FetchCompleted {
        /// Request id
        id: RequestId,
        /// Number of artifacts produced
        artifact_count: usize,
    },

    /// Several artifacts were bundled into an archive
    BundleCreated {
        /// Request id
        id: RequestId,
        /// Archive path
        archive: PathBuf,
    },

    /// Artifacts of a finished request were removed
    ArtifactsDeleted {
        /// Request id
        id: RequestId,
        /// Number of paths successfully removed
        deleted: usize,
        /// Number of paths that could not be removed
        failed: usize,
    },

    /// One eviction sweep finished
    SweepCompleted {
        /// Entries examined
        scanned: usize,
        /// Entries evicted
        evicted: usize,
        /// Entries skipped because a request still owns them
        in_use: usize,
        /// Entries that could not be inspected or removed
        failed: usize,
    },

    /// The output directory could not be listed; the sweep will run again
    SweepFailed {
        /// Error description
        error: String,
    },

    /// Dynamic DNS record was updated
    HeartbeatPublished {
        /// Newly published address
        address: String,
    },

    /// Public address unchanged, nothing published
    HeartbeatSkipped {
        /// Current address
        address: String,
    },

    /// Heartbeat cycle failed and will back off
    HeartbeatFailed {
        /// Consecutive failures so far
        failures: u32,
        /// Delay before the next cycle in milliseconds
        retry_in_ms: u64,
        /// Error description
        error: String,
    },
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_url_list_is_rejected_regardless_of_format() {
        for format in [None, Some("audio"), Some("video"), Some("flac")] {
            let result = FetchRequest::new(Vec::<String>::new(), format);
            assert_eq!(result, Err(ValidationError::MissingUrl), "format {format:?}");
        }
    }

    #[test]
    fn unknown_format_is_rejected() {
        for format in ["flac", "", "AUDIO", "mp4"] {
            let result = FetchRequest::new(["https://example.com/v"], Some(format));
            assert!(
                matches!(result, Err(ValidationError::UnsupportedFormat(ref f)) if f == format),
                "format {format:?} gave {result:?}"
            );
        }
    }

    #[test]
    fn relative_or_garbage_urls_are_rejected() {
        for bad in ["not a url", "/watch?v=abc", "example.com/video"] {
            let result = FetchRequest::new(["https://ok.example/a", bad], None);
            match result {
                Err(ValidationError::InvalidUrl { url, .. }) => assert_eq!(url, bad),
                other => panic!("expected InvalidUrl for {bad:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn format_defaults_to_audio_and_order_is_kept() {
        let request = FetchRequest::new(
            ["https://example.com/b", "https://example.com/a"],
            None,
        )
        .unwrap();

        assert_eq!(request.format(), MediaFormat::Audio);
        let urls: Vec<&str> = request.urls().iter().map(|u| u.as_str()).collect();
        assert_eq!(urls, ["https://example.com/b", "https://example.com/a"]);
    }

    #[test]
    fn request_ids_are_unique_and_path_safe() {
        let a = RequestId::generate();
        let b = RequestId::generate();
        assert_ne!(a, b);
        assert!(
            a.as_str()
                .chars()
                .all(|c| c.is_ascii_hexdigit() || c == '-')
        );
    }

    #[test]
    fn events_serialize_with_snake_case_tag() {
        let json = serde_json::to_value(Event::SweepCompleted {
            scanned: 3,
            evicted: 1,
            in_use: 1,
            failed: 0,
        })
        .unwrap();

        assert_eq!(json["type"], "sweep_completed");
        assert_eq!(json["evicted"], 1);
    }
}
