// Per-stream pipeline: fetch -> analyze -> build, one cycle at a time.
//
// The pipeline task owns its fetcher, analyzer and builder. The outside world
// only sees what it publishes on its watch channels: status at any time, and
// the playlist snapshot after each completed cycle.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::StreamConfig;
use crate::error::RelayError;
use crate::health::{PipelineState, StreamStatus};
use crate::hls::{
    AppendOutcome, ChunkAnalyzer, Origin, PlaylistBuilder, PlaylistEntry, PlaylistSnapshot,
    Segment, SegmentFetcher,
};

/// Interval used when upstream advertises no usable target duration.
const FALLBACK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Sleep for `interval`, then run the next cycle.
    Continue { interval: Duration },
    /// Upstream ended; the playlist is closed.
    EndOfStream,
    /// Fetching stopped until the stream is reloaded.
    Failed,
}

/// Receiving ends of a pipeline's published state.
#[derive(Debug, Clone)]
pub struct PipelineOutputs {
    pub status: watch::Receiver<StreamStatus>,
    pub playlist: watch::Receiver<Arc<PlaylistSnapshot>>,
}

pub struct StreamPipeline {
    config: Arc<StreamConfig>,
    fetcher: SegmentFetcher,
    analyzer: ChunkAnalyzer,
    builder: PlaylistBuilder,
    cursor: Option<u64>,
    idle_polls: u32,
    consecutive_failures: u32,
    last_target: Option<Duration>,
    /// A segment was skipped; the next appended one starts a discontinuity.
    pending_discontinuity: bool,
    status: watch::Sender<StreamStatus>,
    playlist: watch::Sender<Arc<PlaylistSnapshot>>,
}

fn retry_observer(
    status: &watch::Sender<StreamStatus>,
) -> impl FnMut(u32, &RelayError) + Send + '_ {
    move |_attempt, err| {
        status.send_modify(|s| {
            s.retrying = true;
            s.record_error(err);
        });
    }
}

impl StreamPipeline {
    pub fn new(config: Arc<StreamConfig>, origin: Arc<dyn Origin>) -> (Self, PipelineOutputs) {
        let (status_tx, status_rx) = watch::channel(StreamStatus {
            state: PipelineState::Starting,
            ..Default::default()
        });
        let (playlist_tx, playlist_rx) =
            watch::channel(Arc::new(PlaylistSnapshot::empty(config.output.clone())));

        let pipeline = Self {
            fetcher: SegmentFetcher::new(origin, config.clone()),
            analyzer: ChunkAnalyzer::new(config.discontinuity_tolerance),
            builder: PlaylistBuilder::new(config.output.clone(), config.window_size),
            config,
            cursor: None,
            idle_polls: 0,
            consecutive_failures: 0,
            last_target: None,
            pending_discontinuity: false,
            status: status_tx,
            playlist: playlist_tx,
        };
        let outputs = PipelineOutputs {
            status: status_rx,
            playlist: playlist_rx,
        };
        (pipeline, outputs)
    }

    pub fn config(&self) -> &Arc<StreamConfig> {
        &self.config
    }

    fn interval(&self) -> Duration {
        self.config
            .poll_interval
            .or(self.last_target.filter(|d| !d.is_zero()))
            .unwrap_or(FALLBACK_INTERVAL)
    }

    fn fail(&mut self, err: &RelayError) -> CycleOutcome {
        error!(
            stream = %self.config.name,
            error = %err,
            "Stream failed; fetching stopped until reload"
        );
        self.status.send_modify(|s| {
            s.retrying = false;
            s.failed = true;
            s.record_error(err);
        });
        CycleOutcome::Failed
    }

    /// One fetch/analyze/build cycle. Returns `Err` only when the kill token
    /// fired; in that case nothing from the cycle is published.
    pub async fn run_cycle(&mut self, kill: &CancellationToken) -> Result<CycleOutcome, RelayError> {
        let poll_result = self
            .fetcher
            .poll_playlist(kill, &mut retry_observer(&self.status))
            .await;

        let poll = match poll_result {
            Ok(poll) => {
                self.consecutive_failures = 0;
                poll
            }
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) if e.is_retryable() => return Ok(self.fail(&e)),
            Err(e) => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.config.max_consecutive_failures {
                    return Ok(self.fail(&e));
                }
                warn!(
                    stream = %self.config.name,
                    error = %e,
                    failures = self.consecutive_failures,
                    "Playlist poll failed"
                );
                self.status.send_modify(|s| {
                    s.retrying = false;
                    s.last_cycle_degraded = true;
                    s.record_error(&e);
                });
                return Ok(CycleOutcome::Continue {
                    interval: self.interval(),
                });
            }
        };

        self.last_target = Some(poll.target_duration);
        self.builder.set_target_duration(poll.target_duration);

        let builder = &self.builder;
        let mut entries = SegmentFetcher::new_entries(&poll, self.cursor, |seq| builder.contains(seq));
        if self.cursor.is_none() && entries.len() > self.config.window_size {
            // Joining a live stream: only the newest window is worth fetching.
            entries = entries.split_off(entries.len() - self.config.window_size);
        }

        let mut appended = 0usize;
        let mut skipped = 0usize;
        let mut cycle_error: Option<RelayError> = None;

        for entry in &entries {
            match self.fetch_segment(entry, kill).await {
                Ok(mut segment) => {
                    if std::mem::take(&mut self.pending_discontinuity) {
                        segment.discontinuity = true;
                    }
                    match self.builder.append_segment(segment) {
                        AppendOutcome::Appended { evicted } => {
                            appended += 1;
                            if !evicted.is_empty() {
                                debug!(
                                    stream = %self.config.name,
                                    evicted = evicted.len(),
                                    "Window advanced"
                                );
                            }
                        }
                        AppendOutcome::Duplicate | AppendOutcome::Stale => {}
                        AppendOutcome::Closed => break,
                    }
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) if e.is_retryable() => return Ok(self.fail(&e)),
                Err(e) => {
                    warn!(
                        stream = %self.config.name,
                        msn = entry.sequence,
                        error = %e,
                        "Skipping segment"
                    );
                    skipped += 1;
                    self.pending_discontinuity = true;
                    cycle_error = Some(e);
                }
            }
            self.cursor = Some(entry.sequence);
        }

        if appended == 0 && skipped == 0 {
            self.idle_polls += 1;
        } else {
            self.idle_polls = 0;
        }

        let idle_limit = self.config.idle_polls_before_end;
        let ended = poll.end_list || (idle_limit > 0 && self.idle_polls >= idle_limit);
        if ended {
            info!(
                stream = %self.config.name,
                end_list = poll.end_list,
                idle_polls = self.idle_polls,
                "Upstream ended"
            );
            self.builder.mark_end_of_stream();
        }

        // Publish the completed cycle.
        let interval = self.interval();
        let window_len = self.builder.state().len();
        let cursor = self.cursor;
        self.status.send_modify(|s| {
            s.state = PipelineState::Running;
            s.cursor = cursor;
            s.window_len = window_len;
            s.retrying = false;
            s.last_cycle_degraded = cycle_error.is_some();
            if let Some(err) = &cycle_error {
                s.record_error(err);
            }
            s.ended = ended;
            s.cycles += 1;
            s.last_success = Some(chrono::Utc::now());
            s.expected_interval = Some(interval);
        });
        self.playlist.send_replace(Arc::new(self.builder.snapshot()));

        debug!(
            stream = %self.config.name,
            appended,
            skipped,
            window = window_len,
            "Cycle complete"
        );

        Ok(if ended {
            CycleOutcome::EndOfStream
        } else {
            CycleOutcome::Continue { interval }
        })
    }

    /// Download and analyze one entry. A corrupt payload is fetched once more
    /// before giving up on it.
    async fn fetch_segment(
        &mut self,
        entry: &PlaylistEntry,
        kill: &CancellationToken,
    ) -> Result<Segment, RelayError> {
        let mut refetched = false;
        loop {
            let mut segment = self
                .fetcher
                .download(entry, kill, &mut retry_observer(&self.status))
                .await?;
            match self.analyzer.analyze(&mut segment) {
                Ok(()) => return Ok(segment),
                Err(e) if !refetched => {
                    debug!(stream = %self.config.name, error = %e, "Re-fetching corrupt segment");
                    refetched = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run cycles until drained, killed, failed-and-released or ended.
    ///
    /// Drain stops new cycles and cuts the inter-cycle sleep short but lets a
    /// cycle in flight finish. Kill aborts the cycle in flight.
    #[instrument(skip_all, fields(stream = %self.config.name))]
    pub async fn run(mut self, drain: CancellationToken, kill: CancellationToken) {
        info!(url = %self.config.url, window = self.config.window_size, "Pipeline started");
        self.status.send_modify(|s| s.state = PipelineState::Running);

        loop {
            if drain.is_cancelled() || kill.is_cancelled() {
                break;
            }

            match self.run_cycle(&kill).await {
                Ok(CycleOutcome::Continue { interval }) => {
                    tokio::select! {
                        biased;
                        _ = kill.cancelled() => break,
                        _ = drain.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
                Ok(CycleOutcome::EndOfStream) => break,
                Ok(CycleOutcome::Failed) => {
                    // Parked: nothing more is fetched until the supervisor
                    // replaces this pipeline.
                    tokio::select! {
                        _ = kill.cancelled() => {}
                        _ = drain.cancelled() => {}
                    }
                    break;
                }
                Err(_) => {
                    warn!("Pipeline killed mid-cycle");
                    break;
                }
            }
        }

        if drain.is_cancelled() && !kill.is_cancelled() {
            self.status.send_modify(|s| s.state = PipelineState::Draining);
        }
        self.status.send_modify(|s| {
            s.state = PipelineState::Stopped;
            s.retrying = false;
        });
        info!("Pipeline stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthStatus;
    use crate::hls::analyzer::tests::ts_payload;
    use crate::hls::origin::testing::{MemoryOrigin, Reply};
    use reqwest::StatusCode;
    use url::Url;

    const PLAYLIST_URL: &str = "http://origin/live/index.m3u8";

    fn media_playlist(first: u64, count: u64, end_list: bool) -> String {
        let mut out = format!(
            "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:{first}\n"
        );
        for seq in first..first + count {
            out.push_str(&format!("#EXTINF:4.000,\nseg{seq}.ts\n"));
        }
        if end_list {
            out.push_str("#EXT-X-ENDLIST\n");
        }
        out
    }

    fn segment_url(seq: u64) -> String {
        format!("http://origin/live/seg{seq}.ts")
    }

    /// Serve continuous 4-second TS segments for `range`.
    fn serve_segments(origin: &MemoryOrigin, range: std::ops::Range<u64>) {
        for seq in range {
            origin.set_body(&segment_url(seq), ts_payload(seq * 360_000, 100));
        }
    }

    fn stream_config(window: usize) -> StreamConfig {
        let mut config = StreamConfig::new("news", Url::parse(PLAYLIST_URL).unwrap());
        config.window_size = window;
        config.output = "out/news".to_string();
        config.poll_interval = Some(Duration::from_millis(10));
        config.retry.max_retries = 1;
        config.retry.base_delay = Duration::from_millis(1);
        config.retry.max_delay = Duration::from_millis(2);
        config.retry.jitter = false;
        config
    }

    fn build_pipeline(config: StreamConfig, origin: &Arc<MemoryOrigin>) -> (StreamPipeline, PipelineOutputs) {
        StreamPipeline::new(Arc::new(config), origin.clone())
    }

    async fn wait_for_status(
        rx: &mut watch::Receiver<StreamStatus>,
        predicate: impl FnMut(&StreamStatus) -> bool,
    ) -> StreamStatus {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(predicate))
            .await
            .expect("status condition not reached")
            .expect("status sender dropped")
            .clone()
    }

    #[tokio::test]
    async fn first_cycle_fetches_only_newest_window() {
        let origin = MemoryOrigin::new();
        origin.set_body(PLAYLIST_URL, media_playlist(1, 5, false));
        serve_segments(&origin, 1..6);
        let (mut pipeline, outputs) = build_pipeline(stream_config(3), &origin);

        let outcome = pipeline.run_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Continue {
                interval: Duration::from_millis(10)
            }
        );
        assert_eq!(origin.hits(&segment_url(1)), 0);
        assert_eq!(origin.hits(&segment_url(2)), 0);

        let snapshot = outputs.playlist.borrow().clone();
        assert_eq!(snapshot.state.sequences(), vec![3, 4, 5]);
        assert!(snapshot.render().contains("out/news/5.ts"));

        let status = outputs.status.borrow().clone();
        assert_eq!(status.cursor, Some(5));
        assert_eq!(status.window_len, 3);
        assert_eq!(status.health(), HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn held_segments_are_not_downloaded_again() {
        let origin = MemoryOrigin::new();
        origin.set(
            PLAYLIST_URL,
            vec![
                Reply::Body(media_playlist(1, 3, false).into()),
                Reply::Body(media_playlist(2, 3, false).into()),
            ],
        );
        serve_segments(&origin, 1..5);
        let (mut pipeline, outputs) = build_pipeline(stream_config(3), &origin);
        let token = CancellationToken::new();

        pipeline.run_cycle(&token).await.unwrap();
        pipeline.run_cycle(&token).await.unwrap();

        for seq in 1..=4 {
            assert_eq!(origin.hits(&segment_url(seq)), 1, "segment {seq}");
        }
        assert_eq!(outputs.playlist.borrow().state.sequences(), vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_stream_and_stop_fetching() {
        let origin = MemoryOrigin::new();
        origin.set(PLAYLIST_URL, vec![Reply::Status(StatusCode::SERVICE_UNAVAILABLE)]);
        let (pipeline, mut outputs) = build_pipeline(stream_config(3), &origin);
        let drain = CancellationToken::new();
        let kill = CancellationToken::new();
        let task = tokio::spawn(pipeline.run(drain.clone(), kill.clone()));

        let status = wait_for_status(&mut outputs.status, |s| s.failed).await;
        assert_eq!(status.health(), HealthStatus::Failed);
        // Initial attempt plus one retry.
        assert_eq!(origin.hits(PLAYLIST_URL), 2);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(origin.hits(PLAYLIST_URL), 2);
        assert!(!task.is_finished());

        drain.cancel();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert_eq!(outputs.status.borrow().state, PipelineState::Stopped);
    }

    #[tokio::test]
    async fn repeated_permanent_playlist_errors_fail_the_stream() {
        let origin = MemoryOrigin::new();
        origin.set_body(PLAYLIST_URL, "not a playlist");
        let mut config = stream_config(3);
        config.max_consecutive_failures = 2;
        let (mut pipeline, outputs) = build_pipeline(config, &origin);
        let token = CancellationToken::new();

        let first = pipeline.run_cycle(&token).await.unwrap();
        assert!(matches!(first, CycleOutcome::Continue { .. }));
        assert_eq!(outputs.status.borrow().health(), HealthStatus::Degraded);

        let second = pipeline.run_cycle(&token).await.unwrap();
        assert_eq!(second, CycleOutcome::Failed);
        assert_eq!(origin.hits(PLAYLIST_URL), 2);
    }

    #[tokio::test]
    async fn missing_segment_is_skipped_and_degrades() {
        let origin = MemoryOrigin::new();
        origin.set_body(PLAYLIST_URL, media_playlist(1, 3, false));
        serve_segments(&origin, 1..4);
        origin.set(&segment_url(2), vec![Reply::Status(StatusCode::NOT_FOUND)]);
        let (mut pipeline, outputs) = build_pipeline(stream_config(3), &origin);

        pipeline.run_cycle(&CancellationToken::new()).await.unwrap();

        let snapshot = outputs.playlist.borrow().clone();
        assert_eq!(snapshot.state.sequences(), vec![1, 3]);
        let third = snapshot.state.segments().last().unwrap().clone();
        assert!(third.discontinuity);

        let status = outputs.status.borrow().clone();
        assert_eq!(status.cursor, Some(3));
        assert_eq!(status.health(), HealthStatus::Degraded);
        assert!(status.last_error.unwrap().contains("404"));
    }

    #[tokio::test]
    async fn corrupt_segment_is_refetched_once_then_skipped() {
        let origin = MemoryOrigin::new();
        origin.set_body(PLAYLIST_URL, media_playlist(1, 2, false));
        serve_segments(&origin, 1..3);
        origin.set_body(&segment_url(1), &b"\x47truncated"[..]);
        let (mut pipeline, outputs) = build_pipeline(stream_config(3), &origin);

        pipeline.run_cycle(&CancellationToken::new()).await.unwrap();

        assert_eq!(origin.hits(&segment_url(1)), 2);
        assert_eq!(outputs.playlist.borrow().state.sequences(), vec![2]);
    }

    #[tokio::test]
    async fn corrupt_segment_recovered_on_refetch() {
        let origin = MemoryOrigin::new();
        origin.set_body(PLAYLIST_URL, media_playlist(1, 1, false));
        origin.set(
            &segment_url(1),
            vec![
                Reply::Body(bytes::Bytes::from_static(b"garbage")),
                Reply::Body(ts_payload(360_000, 100)),
            ],
        );
        let (mut pipeline, outputs) = build_pipeline(stream_config(3), &origin);

        pipeline.run_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(outputs.playlist.borrow().state.sequences(), vec![1]);
        assert_eq!(outputs.status.borrow().health(), HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn end_list_closes_playlist_and_stops() {
        let origin = MemoryOrigin::new();
        origin.set_body(PLAYLIST_URL, media_playlist(1, 2, true));
        serve_segments(&origin, 1..3);
        let (pipeline, outputs) = build_pipeline(stream_config(3), &origin);

        tokio::time::timeout(
            Duration::from_secs(2),
            pipeline.run(CancellationToken::new(), CancellationToken::new()),
        )
        .await
        .unwrap();

        let snapshot = outputs.playlist.borrow().clone();
        assert!(snapshot.state.end_of_stream());
        assert!(snapshot.render().ends_with("#EXT-X-ENDLIST\n"));
        let status = outputs.status.borrow().clone();
        assert!(status.ended);
        assert_eq!(status.state, PipelineState::Stopped);
    }

    #[tokio::test]
    async fn idle_upstream_ends_stream() {
        let origin = MemoryOrigin::new();
        origin.set_body(PLAYLIST_URL, media_playlist(1, 1, false));
        serve_segments(&origin, 1..2);
        let mut config = stream_config(3);
        config.idle_polls_before_end = 2;
        let (mut pipeline, _outputs) = build_pipeline(config, &origin);
        let token = CancellationToken::new();

        assert!(matches!(pipeline.run_cycle(&token).await.unwrap(), CycleOutcome::Continue { .. }));
        assert!(matches!(pipeline.run_cycle(&token).await.unwrap(), CycleOutcome::Continue { .. }));
        assert_eq!(pipeline.run_cycle(&token).await.unwrap(), CycleOutcome::EndOfStream);
    }

    #[tokio::test]
    async fn drain_lets_inflight_cycle_finish() {
        let origin = MemoryOrigin::new();
        origin.set_body(PLAYLIST_URL, media_playlist(1, 2, false));
        serve_segments(&origin, 1..3);
        let (entered, release) = origin.gate(&segment_url(2));
        let (pipeline, outputs) = build_pipeline(stream_config(3), &origin);
        let drain = CancellationToken::new();
        let kill = CancellationToken::new();
        let task = tokio::spawn(pipeline.run(drain.clone(), kill.clone()));

        entered.notified().await;
        drain.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Segment 1 is built but the cycle has not completed: nothing published.
        assert!(!task.is_finished());
        assert!(outputs.playlist.borrow().state.is_empty());

        release.notify_one();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();

        assert_eq!(outputs.playlist.borrow().state.sequences(), vec![1, 2]);
        assert_eq!(outputs.status.borrow().state, PipelineState::Stopped);
        assert_eq!(origin.hits(PLAYLIST_URL), 1);
    }

    #[tokio::test]
    async fn kill_aborts_inflight_cycle_without_publishing() {
        let origin = MemoryOrigin::new();
        origin.set_body(PLAYLIST_URL, media_playlist(1, 2, false));
        serve_segments(&origin, 1..3);
        let (entered, _release) = origin.gate(&segment_url(2));
        let (pipeline, outputs) = build_pipeline(stream_config(3), &origin);
        let kill = CancellationToken::new();
        let task = tokio::spawn(pipeline.run(CancellationToken::new(), kill.clone()));

        entered.notified().await;
        kill.cancel();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();

        assert!(outputs.playlist.borrow().state.is_empty());
        assert_eq!(outputs.status.borrow().state, PipelineState::Stopped);
    }
}
