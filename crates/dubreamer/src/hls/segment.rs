use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::Duration;
use url::Url;

/// Container format detected by the analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    MpegTs,
    Fmp4,
}

impl ContainerKind {
    pub fn extension(self) -> &'static str {
        match self {
            ContainerKind::MpegTs => "ts",
            ContainerKind::Fmp4 => "m4s",
        }
    }
}

/// Timing and structure extracted from a segment payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentAnalysis {
    pub container: ContainerKind,
    /// Measured duration, when the container carries timestamps.
    pub actual_duration: Option<Duration>,
    /// Lowest PTS of the timing stream (90 kHz).
    pub start_pts: Option<u64>,
    /// `start_pts` plus the measured duration, unwrapped (may exceed 2^33).
    pub end_pts: Option<u64>,
    /// Byte offset of the first random access point.
    pub keyframe_offset: Option<usize>,
}

/// One upstream segment as advertised by a playlist poll.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaylistEntry {
    pub sequence: u64,
    pub uri: Url,
    pub duration: Duration,
    pub discontinuity: bool,
}

/// A downloaded segment travelling through a pipeline.
#[derive(Debug, Clone)]
pub struct Segment {
    pub sequence: u64,
    pub uri: Url,
    /// Duration declared by the upstream playlist.
    pub duration: Duration,
    pub payload: Bytes,
    pub discontinuity: bool,
    pub fetched_at: DateTime<Utc>,
    pub analysis: Option<SegmentAnalysis>,
}

impl Segment {
    pub fn from_entry(entry: &PlaylistEntry, payload: Bytes) -> Self {
        Self {
            sequence: entry.sequence,
            uri: entry.uri.clone(),
            duration: entry.duration,
            payload,
            discontinuity: entry.discontinuity,
            fetched_at: Utc::now(),
            analysis: None,
        }
    }

    /// Measured duration if known, otherwise the declared one.
    pub fn effective_duration(&self) -> Duration {
        self.analysis
            .as_ref()
            .and_then(|a| a.actual_duration)
            .unwrap_or(self.duration)
    }

    /// File extension used in the rewritten playlist URI.
    pub fn extension(&self) -> &'static str {
        if let Some(analysis) = &self.analysis {
            return analysis.container.extension();
        }
        let path = self.uri.path();
        if path.ends_with(".m4s") || path.ends_with(".mp4") {
            "m4s"
        } else {
            "ts"
        }
    }
}

/// Convert a playlist duration in seconds to a millisecond-precision
/// [`Duration`]. Negative and non-finite values are rejected.
pub fn duration_from_secs(secs: f64) -> Option<Duration> {
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    let millis = (secs * 1000.0).round();
    if millis > u64::MAX as f64 {
        return None;
    }
    Some(Duration::from_millis(millis as u64))
}
