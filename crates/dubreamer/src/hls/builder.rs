// Playlist builder: keeps the live sliding window and renders the client
// playlist from it.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::hls::segment::Segment;

#[derive(Debug)]
pub enum AppendOutcome {
    /// Segment added; `evicted` holds whatever fell out of the window.
    Appended { evicted: Vec<Arc<Segment>> },
    /// Sequence number already in the window.
    Duplicate,
    /// Sequence number at or below the newest one already appended.
    Stale,
    /// End of stream was marked; nothing more is accepted.
    Closed,
}

impl AppendOutcome {
    pub fn is_appended(&self) -> bool {
        matches!(self, AppendOutcome::Appended { .. })
    }
}

/// Window contents. Sequence numbers are strictly increasing front to back.
#[derive(Debug, Clone, Default)]
pub struct PlaylistState {
    segments: VecDeque<Arc<Segment>>,
    media_sequence: u64,
    discontinuity_sequence: u64,
    target_duration: Duration,
    end_of_stream: bool,
}

impl PlaylistState {
    pub fn segments(&self) -> impl ExactSizeIterator<Item = &Arc<Segment>> {
        self.segments.iter()
    }

    pub fn sequences(&self) -> Vec<u64> {
        self.segments.iter().map(|s| s.sequence).collect()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn media_sequence(&self) -> u64 {
        self.media_sequence
    }

    pub fn discontinuity_sequence(&self) -> u64 {
        self.discontinuity_sequence
    }

    pub fn end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    /// Whole seconds advertised as `#EXT-X-TARGETDURATION`: the upstream value
    /// or the longest retained segment rounded up, whichever is larger.
    pub fn target_duration_secs(&self) -> u64 {
        let longest = self
            .segments
            .iter()
            .map(|s| ceil_secs(s.effective_duration()))
            .max()
            .unwrap_or(0);
        ceil_secs(self.target_duration).max(longest).max(1)
    }
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

/// Immutable copy of a window published after a complete cycle.
#[derive(Debug, Clone)]
pub struct PlaylistSnapshot {
    pub output: String,
    pub state: PlaylistState,
    pub published_at: DateTime<Utc>,
}

impl PlaylistSnapshot {
    pub fn empty(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            state: PlaylistState::default(),
            published_at: Utc::now(),
        }
    }

    pub fn render(&self) -> String {
        RenderedPlaylist {
            state: &self.state,
            output: &self.output,
        }
        .to_string()
    }
}

struct RenderedPlaylist<'a> {
    state: &'a PlaylistState,
    output: &'a str,
}

impl fmt::Display for RenderedPlaylist<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state;
        writeln!(f, "#EXTM3U")?;
        writeln!(f, "#EXT-X-VERSION:3")?;
        writeln!(f, "#EXT-X-TARGETDURATION:{}", state.target_duration_secs())?;
        writeln!(f, "#EXT-X-MEDIA-SEQUENCE:{}", state.media_sequence)?;
        if state.discontinuity_sequence > 0 {
            writeln!(
                f,
                "#EXT-X-DISCONTINUITY-SEQUENCE:{}",
                state.discontinuity_sequence
            )?;
        }
        for segment in &state.segments {
            if segment.discontinuity {
                writeln!(f, "#EXT-X-DISCONTINUITY")?;
            }
            writeln!(
                f,
                "#EXTINF:{:.3},",
                segment.effective_duration().as_secs_f64()
            )?;
            writeln!(
                f,
                "{}/{}.{}",
                self.output,
                segment.sequence,
                segment.extension()
            )?;
        }
        if state.end_of_stream {
            writeln!(f, "#EXT-X-ENDLIST")?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct PlaylistBuilder {
    output: String,
    max_segments: usize,
    /// Newest sequence ever appended, including ones since evicted.
    highest_appended: Option<u64>,
    state: PlaylistState,
}

impl PlaylistBuilder {
    /// `max_segments` is clamped to at least one.
    pub fn new(output: impl Into<String>, max_segments: usize) -> Self {
        Self {
            output: output.into(),
            max_segments: max_segments.max(1),
            highest_appended: None,
            state: PlaylistState::default(),
        }
    }

    pub fn state(&self) -> &PlaylistState {
        &self.state
    }

    pub fn max_segments(&self) -> usize {
        self.max_segments
    }

    pub fn set_target_duration(&mut self, target: Duration) {
        self.state.target_duration = target;
    }

    pub fn contains(&self, sequence: u64) -> bool {
        self.state
            .segments
            .binary_search_by_key(&sequence, |s| s.sequence)
            .is_ok()
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.highest_appended
    }

    pub fn append_segment(&mut self, segment: Segment) -> AppendOutcome {
        let sequence = segment.sequence;
        if self.state.end_of_stream {
            debug!(msn = sequence, "Ignoring segment after end of stream");
            return AppendOutcome::Closed;
        }
        if self.contains(sequence) {
            debug!(msn = sequence, "Segment already in window");
            return AppendOutcome::Duplicate;
        }
        if let Some(highest) = self.highest_appended
            && sequence <= highest
        {
            warn!(msn = sequence, newest = highest, "Dropping out-of-order segment");
            return AppendOutcome::Stale;
        }

        if self.state.segments.is_empty() {
            self.state.media_sequence = sequence;
        }
        self.state.segments.push_back(Arc::new(segment));
        self.highest_appended = Some(sequence);

        let mut evicted = Vec::new();
        while self.state.segments.len() > self.max_segments {
            match self.evict_oldest() {
                Some(segment) => evicted.push(segment),
                None => break,
            }
        }
        AppendOutcome::Appended { evicted }
    }

    /// Remove the oldest segment, advancing the media sequence and, when the
    /// segment started a discontinuity, the discontinuity sequence.
    pub fn evict_oldest(&mut self) -> Option<Arc<Segment>> {
        let oldest = self.state.segments.pop_front()?;
        if oldest.discontinuity {
            self.state.discontinuity_sequence = self.state.discontinuity_sequence.saturating_add(1);
        }
        self.state.media_sequence = self
            .state
            .segments
            .front()
            .map_or(oldest.sequence.saturating_add(1), |s| s.sequence);
        debug!(msn = oldest.sequence, "Evicted segment");
        Some(oldest)
    }

    pub fn mark_end_of_stream(&mut self) {
        if !self.state.end_of_stream {
            debug!(last = ?self.highest_appended, "Marking end of stream");
            self.state.end_of_stream = true;
        }
    }

    pub fn render(&self) -> String {
        RenderedPlaylist {
            state: &self.state,
            output: &self.output,
        }
        .to_string()
    }

    pub fn snapshot(&self) -> PlaylistSnapshot {
        PlaylistSnapshot {
            output: self.output.clone(),
            state: self.state.clone(),
            published_at: Utc::now(),
        }
    }
}
