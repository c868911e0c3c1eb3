// HLS ingestion: upstream access, segment analysis and playlist rewriting.

pub mod analyzer;
pub mod builder;
pub mod fetcher;
pub mod origin;
pub mod retry;
pub mod segment;

pub use analyzer::ChunkAnalyzer;
pub use builder::{AppendOutcome, PlaylistBuilder, PlaylistSnapshot, PlaylistState};
pub use fetcher::{PlaylistPoll, SegmentFetcher};
pub use origin::{FetchKind, HttpOrigin, Origin};
pub use retry::{RetryAction, RetryPolicy, retry_with_backoff};
pub use segment::{ContainerKind, PlaylistEntry, Segment, SegmentAnalysis};
