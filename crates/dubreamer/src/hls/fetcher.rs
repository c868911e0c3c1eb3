// Segment fetcher: polls the upstream playlist and downloads segments that are
// not yet held by the pipeline.

use bytes::Bytes;
use m3u8_rs::{MasterPlaylist, MediaPlaylist, Playlist, parse_playlist_res};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::config::StreamConfig;
use crate::error::RelayError;
use crate::hls::origin::{FetchKind, Origin};
use crate::hls::retry::{RetryAction, retry_with_backoff};
use crate::hls::segment::{PlaylistEntry, Segment, duration_from_secs};

/// Parsed view of one media playlist poll.
#[derive(Debug, Clone)]
pub struct PlaylistPoll {
    pub playlist_url: Url,
    pub media_sequence: u64,
    pub target_duration: Duration,
    pub end_list: bool,
    pub entries: Vec<PlaylistEntry>,
}

impl PlaylistPoll {
    pub fn last_sequence(&self) -> Option<u64> {
        self.entries.last().map(|e| e.sequence)
    }
}

/// Callback invoked before every retry backoff.
pub type RetryObserver<'a> = &'a mut (dyn FnMut(u32, &RelayError) + Send);

pub struct SegmentFetcher {
    origin: Arc<dyn Origin>,
    config: Arc<StreamConfig>,
    /// Media playlist chosen from a master playlist, once resolved.
    media_url: Option<Url>,
}

impl SegmentFetcher {
    pub fn new(origin: Arc<dyn Origin>, config: Arc<StreamConfig>) -> Self {
        Self {
            origin,
            config,
            media_url: None,
        }
    }

    pub fn media_url(&self) -> &Url {
        self.media_url.as_ref().unwrap_or(&self.config.url)
    }

    /// Fetch with retries. The kill token also aborts an in-flight request.
    async fn fetch(
        &self,
        url: &Url,
        kind: FetchKind,
        token: &CancellationToken,
        on_retry: RetryObserver<'_>,
    ) -> Result<Bytes, RelayError> {
        let origin = &self.origin;
        let timeout = self.config.request_timeout;
        retry_with_backoff(&self.config.retry, token, on_retry, |_| async move {
            tokio::select! {
                _ = token.cancelled() => RetryAction::Fail(RelayError::Cancelled),
                result = origin.fetch(url, kind, timeout) => RetryAction::from_result(result),
            }
        })
        .await
    }

    #[instrument(skip_all, fields(stream = %self.config.name))]
    pub async fn poll_playlist(
        &mut self,
        token: &CancellationToken,
        on_retry: RetryObserver<'_>,
    ) -> Result<PlaylistPoll, RelayError> {
        let url = self.media_url().clone();
        let bytes = self.fetch(&url, FetchKind::Playlist, token, on_retry).await?;

        let media = match parse_playlist_res(&bytes) {
            Ok(Playlist::MediaPlaylist(media)) => media,
            Ok(Playlist::MasterPlaylist(master)) => {
                if self.media_url.is_some() {
                    return Err(RelayError::playlist(format!(
                        "expected a media playlist at {url}, got a master playlist"
                    )));
                }
                let variant_url = select_variant(&master, &url)?;
                info!(variant = %variant_url, "Selected highest-bandwidth variant");
                let bytes = self
                    .fetch(&variant_url, FetchKind::Playlist, token, on_retry)
                    .await?;
                let media = match parse_playlist_res(&bytes) {
                    Ok(Playlist::MediaPlaylist(media)) => media,
                    Ok(Playlist::MasterPlaylist(_)) => {
                        return Err(RelayError::playlist(format!(
                            "variant {variant_url} is itself a master playlist"
                        )));
                    }
                    Err(e) => {
                        return Err(RelayError::playlist(format!(
                            "failed to parse {variant_url}: {e}"
                        )));
                    }
                };
                self.media_url = Some(variant_url);
                media
            }
            Err(e) => {
                return Err(RelayError::playlist(format!("failed to parse {url}: {e}")));
            }
        };

        let poll = build_poll(self.media_url().clone(), &media)?;
        debug!(
            media_sequence = poll.media_sequence,
            entries = poll.entries.len(),
            end_list = poll.end_list,
            "Polled playlist"
        );
        Ok(poll)
    }

    /// Entries after `cursor` that the window does not already hold.
    /// Identity is the sequence number, never the URI.
    pub fn new_entries(
        poll: &PlaylistPoll,
        cursor: Option<u64>,
        in_window: impl Fn(u64) -> bool,
    ) -> Vec<PlaylistEntry> {
        poll.entries
            .iter()
            .filter(|e| cursor.is_none_or(|c| e.sequence > c))
            .filter(|e| !in_window(e.sequence))
            .cloned()
            .collect()
    }

    #[instrument(skip_all, fields(stream = %self.config.name, msn = entry.sequence))]
    pub async fn download(
        &self,
        entry: &PlaylistEntry,
        token: &CancellationToken,
        on_retry: RetryObserver<'_>,
    ) -> Result<Segment, RelayError> {
        let payload = self
            .fetch(&entry.uri, FetchKind::Segment, token, on_retry)
            .await?;
        debug!(bytes = payload.len(), "Downloaded segment");
        Ok(Segment::from_entry(entry, payload))
    }
}

fn select_variant(master: &MasterPlaylist, master_url: &Url) -> Result<Url, RelayError> {
    let variant = master
        .variants
        .iter()
        .filter(|v| !v.is_i_frame && !v.uri.is_empty())
        .max_by_key(|v| v.bandwidth)
        .ok_or_else(|| RelayError::playlist(format!("master playlist {master_url} has no variants")))?;
    master_url
        .join(&variant.uri)
        .map_err(|e| RelayError::invalid_url(&variant.uri, e))
}

fn build_poll(playlist_url: Url, media: &MediaPlaylist) -> Result<PlaylistPoll, RelayError> {
    let mut entries = Vec::with_capacity(media.segments.len());
    for (idx, seg) in media.segments.iter().enumerate() {
        let sequence = media.media_sequence.checked_add(idx as u64).ok_or_else(|| {
            RelayError::playlist(format!(
                "media sequence {} overflows at entry {idx}",
                media.media_sequence
            ))
        })?;
        if seg.uri.is_empty() {
            warn!(msn = sequence, "Skipping playlist entry without URI");
            continue;
        }
        let uri = playlist_url
            .join(&seg.uri)
            .map_err(|e| RelayError::invalid_url(&seg.uri, e))?;
        let duration = duration_from_secs(f64::from(seg.duration)).ok_or_else(|| {
            RelayError::playlist(format!(
                "segment #{sequence} has invalid duration {}",
                seg.duration
            ))
        })?;
        entries.push(PlaylistEntry {
            sequence,
            uri,
            duration,
            discontinuity: seg.discontinuity,
        });
    }

    Ok(PlaylistPoll {
        playlist_url,
        media_sequence: media.media_sequence,
        target_duration: Duration::from_secs(media.target_duration),
        end_list: media.end_list,
        entries,
    })
}
