// Chunk analyzer: validates segment framing and measures timing.
//
// MPEG-TS payloads are demuxed with `mpeg2ts`; PES headers give presentation
// timestamps and adaptation fields mark random access points. fMP4 payloads
// are only checked for box framing.

use mpeg2ts::ts::{ReadTsPacket, TsPacketReader, TsPayload};
use std::collections::HashMap;
use std::io::Cursor;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::RelayError;
use crate::hls::segment::{ContainerKind, Segment, SegmentAnalysis};

pub const TS_PACKET_SIZE: usize = 188;
const TS_SYNC_BYTE: u8 = 0x47;

/// PTS ticks per second.
const PTS_CLOCK: u64 = 90_000;
/// PTS is a 33-bit counter.
const PTS_MODULUS: u64 = 1 << 33;

/// Top-level ISO-BMFF boxes accepted in a media segment.
const FMP4_BOXES: &[&[u8; 4]] = &[
    b"ftyp", b"styp", b"moof", b"mdat", b"moov", b"sidx", b"emsg", b"prft", b"free", b"skip",
];

/// Stateful per-stream analyzer. Remembers where the previous accepted segment
/// ended so the next one can be checked for continuity.
#[derive(Debug)]
pub struct ChunkAnalyzer {
    tolerance: Duration,
    last_end_pts: Option<u64>,
}

impl ChunkAnalyzer {
    pub fn new(tolerance: Duration) -> Self {
        Self {
            tolerance,
            last_end_pts: None,
        }
    }

    /// Analyze `segment` in place: attaches the analysis, raises the
    /// discontinuity flag when timestamps jump, and advances the continuity
    /// reference. A structural failure leaves the analyzer state untouched.
    pub fn analyze(&mut self, segment: &mut Segment) -> Result<(), RelayError> {
        let analysis = inspect(&segment.payload)
            .map_err(|reason| RelayError::corrupt_segment(segment.sequence, reason))?;

        if let Some(actual) = analysis.actual_duration
            && actual.abs_diff(segment.duration) > self.tolerance
        {
            warn!(
                msn = segment.sequence,
                declared_ms = segment.duration.as_millis() as u64,
                actual_ms = actual.as_millis() as u64,
                "Declared segment duration does not match payload"
            );
        }

        if let (Some(prev_end), Some(start)) = (self.last_end_pts, analysis.start_pts)
            && pts_distance(prev_end, start) > duration_to_ticks(self.tolerance)
        {
            debug!(
                msn = segment.sequence,
                gap_ms = pts_distance(prev_end, start) * 1000 / PTS_CLOCK,
                "Timestamp gap, marking discontinuity"
            );
            segment.discontinuity = true;
        }

        self.last_end_pts = analysis.end_pts;
        segment.analysis = Some(analysis);
        Ok(())
    }

    /// Forget the continuity reference, e.g. after a skipped segment.
    pub fn reset(&mut self) {
        self.last_end_pts = None;
    }
}

/// Detect the container and analyze the payload. Errors describe the first
/// structural problem found.
pub fn inspect(payload: &[u8]) -> Result<SegmentAnalysis, String> {
    if payload.is_empty() {
        return Err("empty payload".to_string());
    }
    if payload[0] == TS_SYNC_BYTE {
        return analyze_ts(payload);
    }
    if payload.len() >= 8 && FMP4_BOXES.iter().any(|b| &payload[4..8] == *b) {
        return analyze_fmp4(payload);
    }
    Err("unrecognized container".to_string())
}

#[derive(Debug)]
struct PesTrack {
    pid: u16,
    stream_id: u8,
    pts: Vec<u64>,
}

fn analyze_ts(payload: &[u8]) -> Result<SegmentAnalysis, String> {
    if payload.len() % TS_PACKET_SIZE != 0 {
        return Err(format!(
            "length {} is not a whole number of {TS_PACKET_SIZE}-byte packets",
            payload.len()
        ));
    }

    let mut reader = TsPacketReader::new(Cursor::new(payload));
    let mut tracks: Vec<PesTrack> = Vec::new();
    let mut random_access: HashMap<u16, usize> = HashMap::new();

    for index in 0usize.. {
        let offset = index * TS_PACKET_SIZE;
        let packet = match reader.read_ts_packet() {
            Ok(Some(packet)) => packet,
            Ok(None) => break,
            Err(e) => return Err(format!("bad packet {index} at offset {offset}: {e}")),
        };
        let pid = packet.header.pid.as_u16();

        if let Some(adaptation) = &packet.adaptation_field
            && adaptation.random_access_indicator
        {
            random_access.entry(pid).or_insert(offset);
        }

        let Some(TsPayload::Pes(pes)) = &packet.payload else {
            continue;
        };
        let Some(pts) = pes.header.pts.as_ref().map(|t| t.as_u64()) else {
            continue;
        };
        match tracks.iter_mut().find(|t| t.pid == pid) {
            Some(track) => track.pts.push(pts),
            None => tracks.push(PesTrack {
                pid,
                stream_id: pes.header.stream_id.as_u8(),
                pts: vec![pts],
            }),
        }
    }

    let timing = tracks
        .iter()
        .find(|t| (0xE0..=0xEF).contains(&t.stream_id))
        .or_else(|| tracks.first())
        .ok_or_else(|| "no presentation timestamps found".to_string())?;

    let (start, span_ticks, frame_ticks) = measure(&timing.pts);
    let total_ticks = span_ticks + frame_ticks;

    Ok(SegmentAnalysis {
        container: ContainerKind::MpegTs,
        actual_duration: Some(ticks_to_duration(total_ticks)),
        start_pts: Some(start),
        end_pts: Some(start + total_ticks),
        keyframe_offset: random_access.get(&timing.pid).copied(),
    })
}

/// Lowest PTS (mod 2^33), span between lowest and highest, and mean interval
/// between distinct timestamps. Offsets are taken relative to the first PTS so
/// a wrap inside the segment does not produce a huge span.
fn measure(pts: &[u64]) -> (u64, u64, u64) {
    let first = pts[0];
    let mut offsets: Vec<i64> = pts
        .iter()
        .map(|&p| {
            let forward = (p + PTS_MODULUS - first) % PTS_MODULUS;
            if forward > PTS_MODULUS / 2 {
                forward as i64 - PTS_MODULUS as i64
            } else {
                forward as i64
            }
        })
        .collect();
    offsets.sort_unstable();
    offsets.dedup();

    let min = offsets[0];
    let max = offsets[offsets.len() - 1];
    let span = (max - min) as u64;
    let frame = if offsets.len() > 1 {
        span / (offsets.len() as u64 - 1)
    } else {
        0
    };
    let start = (first as i64 + min).rem_euclid(PTS_MODULUS as i64) as u64;
    (start, span, frame)
}

/// Absolute distance between two PTS values on the 33-bit circle.
fn pts_distance(a: u64, b: u64) -> u64 {
    let diff = (b % PTS_MODULUS + PTS_MODULUS - a % PTS_MODULUS) % PTS_MODULUS;
    diff.min(PTS_MODULUS - diff)
}

fn ticks_to_duration(ticks: u64) -> Duration {
    Duration::from_nanos(ticks.saturating_mul(100_000) / 9)
}

fn duration_to_ticks(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros() * u128::from(PTS_CLOCK) / 1_000_000).unwrap_or(u64::MAX)
}

fn analyze_fmp4(payload: &[u8]) -> Result<SegmentAnalysis, String> {
    let mut offset = 0usize;
    while offset < payload.len() {
        let remaining = payload.len() - offset;
        if remaining < 8 {
            return Err(format!("truncated box header at offset {offset}"));
        }
        let header = &payload[offset..offset + 8];
        let box_type = &header[4..8];
        if !FMP4_BOXES.iter().any(|b| box_type == *b) {
            return Err(format!(
                "unexpected box `{}` at offset {offset}",
                String::from_utf8_lossy(box_type)
            ));
        }

        let size32 = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let size = match size32 {
            0 => remaining as u64,
            1 => {
                if remaining < 16 {
                    return Err(format!("truncated large box header at offset {offset}"));
                }
                let mut large = [0u8; 8];
                large.copy_from_slice(&payload[offset + 8..offset + 16]);
                let size = u64::from_be_bytes(large);
                if size < 16 {
                    return Err(format!("invalid large box size {size} at offset {offset}"));
                }
                size
            }
            n if n < 8 => return Err(format!("invalid box size {n} at offset {offset}")),
            n => u64::from(n),
        };

        if size > remaining as u64 {
            return Err(format!(
                "box `{}` at offset {offset} overruns payload by {} bytes",
                String::from_utf8_lossy(box_type),
                size - remaining as u64
            ));
        }
        offset += size as usize;
    }

    Ok(SegmentAnalysis {
        container: ContainerKind::Fmp4,
        actual_duration: None,
        start_pts: None,
        end_pts: None,
        keyframe_offset: None,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::hls::segment::PlaylistEntry;
    use bytes::Bytes;
    use url::Url;

    fn encode_pts(pts: u64) -> [u8; 5] {
        [
            0x21 | (((pts >> 30) & 0x07) as u8) << 1,
            ((pts >> 22) & 0xFF) as u8,
            0x01 | (((pts >> 15) & 0x7F) as u8) << 1,
            ((pts >> 7) & 0xFF) as u8,
            0x01 | ((pts & 0x7F) as u8) << 1,
        ]
    }

    const VIDEO_PID: u16 = 0x100;
    const PMT_PID: u16 = 0x1000;

    /// CRC-32/MPEG-2 over a PSI section.
    fn crc32_mpeg2(data: &[u8]) -> u32 {
        let mut crc = 0xFFFF_FFFFu32;
        for &byte in data {
            crc ^= u32::from(byte) << 24;
            for _ in 0..8 {
                crc = if crc & 0x8000_0000 != 0 {
                    (crc << 1) ^ 0x04C1_1DB7
                } else {
                    crc << 1
                };
            }
        }
        crc
    }

    /// One packet carrying a complete PSI section, padded with 0xFF.
    fn psi_packet(pid: u16, table_id: u8, id: u16, body: &[u8]) -> Vec<u8> {
        let section_len = 5 + body.len() + 4;
        let mut section = vec![
            table_id,
            0xB0 | ((section_len >> 8) as u8 & 0x0F),
            (section_len & 0xFF) as u8,
            (id >> 8) as u8,
            (id & 0xFF) as u8,
            0xC1,
            0x00,
            0x00,
        ];
        section.extend_from_slice(body);
        section.extend_from_slice(&crc32_mpeg2(&section).to_be_bytes());

        let mut packet = vec![
            TS_SYNC_BYTE,
            0x40 | ((pid >> 8) as u8 & 0x1F),
            (pid & 0xFF) as u8,
            0x10,
            0x00,
        ];
        packet.extend(section);
        packet.resize(TS_PACKET_SIZE, 0xFF);
        packet
    }

    fn pat_packet() -> Vec<u8> {
        let body = [0x00, 0x01, 0xE0 | (PMT_PID >> 8) as u8, (PMT_PID & 0xFF) as u8];
        psi_packet(0x0000, 0x00, 0x0001, &body)
    }

    /// PMT with a single H.264 stream on `VIDEO_PID`.
    fn pmt_packet() -> Vec<u8> {
        let pid_hi = 0xE0 | (VIDEO_PID >> 8) as u8;
        let pid_lo = (VIDEO_PID & 0xFF) as u8;
        let body = [pid_hi, pid_lo, 0xF0, 0x00, 0x1B, pid_hi, pid_lo, 0xF0, 0x00];
        psi_packet(PMT_PID, 0x02, 0x0001, &body)
    }

    /// One TS packet starting a video PES with the given PTS.
    fn video_packet(pts: u64, keyframe: bool) -> Vec<u8> {
        let mut packet = vec![0xFFu8; TS_PACKET_SIZE];
        packet[0] = TS_SYNC_BYTE;
        packet[1] = 0x40 | ((VIDEO_PID >> 8) as u8 & 0x1F);
        packet[2] = (VIDEO_PID & 0xFF) as u8;
        let mut pos = 4;
        if keyframe {
            packet[3] = 0x30;
            packet[4] = 1;
            packet[5] = 0x40;
            pos = 6;
        } else {
            packet[3] = 0x10;
        }
        let pes = [0x00, 0x00, 0x01, 0xE0, 0x00, 0x00, 0x80, 0x80, 0x05];
        packet[pos..pos + pes.len()].copy_from_slice(&pes);
        packet[pos + 9..pos + 14].copy_from_slice(&encode_pts(pts));
        packet
    }

    fn filler_packet() -> Vec<u8> {
        let mut packet = vec![0xFFu8; TS_PACKET_SIZE];
        packet[0] = TS_SYNC_BYTE;
        packet[1] = 0x1F;
        packet[2] = 0xFF;
        packet[3] = 0x10;
        packet
    }

    /// A TS payload with program tables, a null packet, then `frames` video
    /// frames at 25 fps starting at `start`.
    pub(crate) fn ts_payload(start: u64, frames: u64) -> Bytes {
        let mut out = Vec::new();
        out.extend(pat_packet());
        out.extend(pmt_packet());
        out.extend(filler_packet());
        for i in 0..frames {
            let pts = (start + i * 3600) % PTS_MODULUS;
            out.extend(video_packet(pts, i == 0));
        }
        Bytes::from(out)
    }

    fn segment(sequence: u64, payload: Bytes, declared_ms: u64) -> Segment {
        let entry = PlaylistEntry {
            sequence,
            uri: Url::parse(&format!("http://o/{sequence}.ts")).unwrap(),
            duration: Duration::from_millis(declared_ms),
            discontinuity: false,
        };
        Segment::from_entry(&entry, payload)
    }

    #[test]
    fn measures_ts_duration_and_keyframe() {
        // 100 frames at 25 fps = 4 s.
        let analysis = inspect(&ts_payload(900_000, 100)).unwrap();
        assert_eq!(analysis.container, ContainerKind::MpegTs);
        assert_eq!(analysis.start_pts, Some(900_000));
        assert_eq!(analysis.actual_duration, Some(Duration::from_secs(4)));
        assert_eq!(analysis.end_pts, Some(900_000 + 360_000));
        assert_eq!(analysis.keyframe_offset, Some(3 * TS_PACKET_SIZE));
    }

    #[test]
    fn pts_wrap_inside_segment_is_handled() {
        let start = PTS_MODULUS - 3600 * 10;
        let analysis = inspect(&ts_payload(start, 100)).unwrap();
        assert_eq!(analysis.start_pts, Some(start));
        assert_eq!(analysis.actual_duration, Some(Duration::from_secs(4)));
    }

    #[test]
    fn rejects_truncated_and_unsynced_payloads() {
        let payload = ts_payload(0, 3);
        let err = inspect(&payload[..payload.len() - 10]).unwrap_err();
        assert!(err.contains("whole number"));

        let mut bad = payload.to_vec();
        bad[3 * TS_PACKET_SIZE] = 0x00;
        let err = inspect(&bad).unwrap_err();
        assert!(err.contains("bad packet 3"), "{err}");
    }

    #[test]
    fn ts_without_timestamps_is_corrupt() {
        let mut payload = filler_packet();
        payload.extend(filler_packet());
        assert!(inspect(&payload).unwrap_err().contains("timestamps"));
    }

    #[test]
    fn unknown_container_is_corrupt() {
        assert!(inspect(b"<html>oops</html>").is_err());
        assert!(inspect(b"").is_err());
    }

    fn mp4_box(kind: &[u8; 4], body: usize) -> Vec<u8> {
        let mut out = ((body + 8) as u32).to_be_bytes().to_vec();
        out.extend_from_slice(kind);
        out.extend(std::iter::repeat_n(0u8, body));
        out
    }

    #[test]
    fn fmp4_boxes_must_tile_payload() {
        let mut payload = mp4_box(b"styp", 8);
        payload.extend(mp4_box(b"moof", 32));
        payload.extend(mp4_box(b"mdat", 100));
        let analysis = inspect(&payload).unwrap();
        assert_eq!(analysis.container, ContainerKind::Fmp4);
        assert_eq!(analysis.actual_duration, None);

        payload.truncate(payload.len() - 1);
        assert!(inspect(&payload).unwrap_err().contains("overruns"));
    }

    #[test]
    fn continuous_segments_are_not_flagged() {
        let mut analyzer = ChunkAnalyzer::new(Duration::from_millis(100));
        let mut first = segment(1, ts_payload(0, 100), 4000);
        analyzer.analyze(&mut first).unwrap();
        assert!(!first.discontinuity);

        let mut second = segment(2, ts_payload(360_000, 100), 4000);
        analyzer.analyze(&mut second).unwrap();
        assert!(!second.discontinuity);
    }

    #[test]
    fn gap_beyond_tolerance_is_flagged() {
        let mut analyzer = ChunkAnalyzer::new(Duration::from_millis(100));
        let mut first = segment(1, ts_payload(0, 100), 4000);
        analyzer.analyze(&mut first).unwrap();

        // 50 ms late: within tolerance.
        let mut second = segment(2, ts_payload(360_000 + 4_500, 100), 4000);
        analyzer.analyze(&mut second).unwrap();
        assert!(!second.discontinuity);

        // 500 ms gap after the second segment's end.
        let mut third = segment(3, ts_payload(724_500 + 45_000, 100), 4000);
        analyzer.analyze(&mut third).unwrap();
        assert!(third.discontinuity);
    }

    #[test]
    fn continuity_survives_pts_wrap_between_segments() {
        let mut analyzer = ChunkAnalyzer::new(Duration::from_millis(100));
        let start = PTS_MODULUS - 360_000;
        let mut first = segment(1, ts_payload(start, 100), 4000);
        analyzer.analyze(&mut first).unwrap();

        let mut second = segment(2, ts_payload(0, 100), 4000);
        analyzer.analyze(&mut second).unwrap();
        assert!(!second.discontinuity);
    }

    #[test]
    fn corrupt_segment_keeps_previous_reference() {
        let mut analyzer = ChunkAnalyzer::new(Duration::from_millis(100));
        let mut first = segment(1, ts_payload(0, 100), 4000);
        analyzer.analyze(&mut first).unwrap();

        let mut broken = segment(2, Bytes::from_static(b"garbage"), 4000);
        let err = analyzer.analyze(&mut broken).unwrap_err();
        assert!(matches!(err, RelayError::CorruptSegment { sequence: 2, .. }));

        let mut next = segment(2, ts_payload(360_000, 100), 4000);
        analyzer.analyze(&mut next).unwrap();
        assert!(!next.discontinuity);
    }

    #[test]
    fn playlist_flag_is_preserved() {
        let mut analyzer = ChunkAnalyzer::new(Duration::from_millis(100));
        let mut seg = segment(1, ts_payload(0, 10), 400);
        seg.discontinuity = true;
        analyzer.analyze(&mut seg).unwrap();
        assert!(seg.discontinuity);
    }
}
