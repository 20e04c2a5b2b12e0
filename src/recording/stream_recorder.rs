//! H.264 MP4 recorder
//!
//! Reassembles RTP packets into access units, caches parameter sets, and
//! writes timestamped MP4 segments. Segments rotate on the first keyframe
//! after the configured duration, so every file starts decodable.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use webrtc::media::io::sample_builder::SampleBuilder;
use webrtc::media::Sample;
use webrtc::rtp::codecs::h264::H264Packet;
use webrtc::rtp::packet::Packet;

use crate::media::nal::{
    build_avcc_sample, parse_sprop_parameter_sets, remove_emulation_prevention, split_annex_b,
};
use crate::media::{NalUnitType, SpsInfo};
use crate::recording::mp4::{AvcParams, Mp4SegmentWriter, TIMESCALE};
use crate::recording::Recorder;

/// How many packets the sample builder may buffer while waiting for
/// reordered or lost packets
const SAMPLE_BUILDER_MAX_LATE: u16 = 128;

/// Records an H.264 RTP track to rotating MP4 segments
pub struct StreamRecorder {
    stream_id: String,
    dir: PathBuf,
    segment_duration: Duration,
    inner: Mutex<Inner>,
}

struct Inner {
    builder: SampleBuilder<H264Packet>,
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
    geometry: Option<SpsInfo>,
    writer: Option<Mp4SegmentWriter>,
    segment_opened: Option<Instant>,
    closed: bool,
}

impl StreamRecorder {
    /// Create a recorder for one published track
    ///
    /// Parameter sets found in the SDP `sprop-parameter-sets` attribute are
    /// cached immediately, so recording can start on the first keyframe even
    /// when the encoder never repeats them in-band.
    pub fn new(
        recordings_dir: &Path,
        stream_id: &str,
        clock_rate: u32,
        fmtp: &str,
        segment_duration: Duration,
    ) -> Self {
        let mut inner = Inner {
            builder: SampleBuilder::new(
                SAMPLE_BUILDER_MAX_LATE,
                H264Packet::default(),
                clock_rate,
            ),
            sps: None,
            pps: None,
            geometry: None,
            writer: None,
            segment_opened: None,
            closed: false,
        };
        for nal in parse_sprop_parameter_sets(fmtp) {
            inner.cache_parameter_set(&nal);
        }
        if inner.sps.is_some() {
            tracing::debug!(stream = %stream_id, "Seeded parameter sets from SDP");
        }

        Self {
            stream_id: stream_id.to_string(),
            dir: recordings_dir.join(stream_id),
            segment_duration,
            inner: Mutex::new(inner),
        }
    }

    fn handle_sample(&self, inner: &mut Inner, sample: &Sample) {
        let nals = split_annex_b(&sample.data);
        if nals.is_empty() {
            return;
        }

        let mut frame_nals: Vec<&[u8]> = Vec::with_capacity(nals.len());
        let mut keyframe = false;
        for nal in nals {
            let Some(&header) = nal.first() else {
                continue;
            };
            match NalUnitType::from_header(header) {
                NalUnitType::Sps | NalUnitType::Pps => inner.cache_parameter_set(nal),
                ty => {
                    if ty == NalUnitType::Idr {
                        keyframe = true;
                    }
                    frame_nals.push(nal);
                }
            }
        }
        if frame_nals.is_empty() {
            return;
        }

        if keyframe && self.should_rotate(inner) {
            self.finish_segment(inner);
        }
        if inner.writer.is_none() {
            // A segment may only start on a keyframe with known parameters
            if !keyframe {
                return;
            }
            if !self.open_segment(inner) {
                return;
            }
        }

        let data = build_avcc_sample(&frame_nals);
        let ticks = (sample.duration.as_secs_f64() * f64::from(TIMESCALE)).round() as u32;
        if let Some(writer) = inner.writer.as_mut() {
            if let Err(e) = writer.write_sample(&data, ticks, keyframe) {
                tracing::warn!(stream = %self.stream_id, error = %e, "Failed to write sample, dropping segment");
                inner.writer = None;
                inner.segment_opened = None;
            }
        }
    }

    fn should_rotate(&self, inner: &Inner) -> bool {
        matches!(inner.segment_opened, Some(opened) if opened.elapsed() >= self.segment_duration)
    }

    fn open_segment(&self, inner: &mut Inner) -> bool {
        let (Some(sps), Some(pps), Some(geometry)) =
            (inner.sps.as_ref(), inner.pps.as_ref(), inner.geometry.as_ref())
        else {
            return false;
        };
        let params = AvcParams {
            sps: sps.clone(),
            pps: pps.clone(),
            profile_idc: geometry.profile_idc,
            constraint_flags: geometry.constraint_flags,
            level_idc: geometry.level_idc,
            width: geometry.width,
            height: geometry.height,
        };
        match Mp4SegmentWriter::create(&self.dir, params) {
            Ok(writer) => {
                tracing::info!(
                    stream = %self.stream_id,
                    path = %writer.path().display(),
                    width = geometry.width,
                    height = geometry.height,
                    "Opened MP4 segment"
                );
                inner.writer = Some(writer);
                inner.segment_opened = Some(Instant::now());
                true
            }
            Err(e) => {
                tracing::error!(stream = %self.stream_id, error = %e, "Failed to open MP4 segment");
                false
            }
        }
    }

    fn finish_segment(&self, inner: &mut Inner) {
        let Some(mut writer) = inner.writer.take() else {
            return;
        };
        inner.segment_opened = None;
        let path = writer.path().to_path_buf();
        let samples = writer.sample_count();
        match writer.close() {
            Ok(()) => {
                tracing::info!(stream = %self.stream_id, path = %path.display(), samples, "Finalized MP4 segment")
            }
            Err(e) => {
                tracing::warn!(stream = %self.stream_id, path = %path.display(), error = %e, "Failed to finalize MP4 segment")
            }
        }
    }
}

impl Inner {
    fn cache_parameter_set(&mut self, nal: &[u8]) {
        let Some(&header) = nal.first() else {
            return;
        };
        match NalUnitType::from_header(header) {
            NalUnitType::Sps => {
                let rbsp = remove_emulation_prevention(&nal[1..]);
                match SpsInfo::parse(&rbsp) {
                    Ok(info) => {
                        self.geometry = Some(info);
                        self.sps = Some(nal.to_vec());
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "Ignoring unparseable SPS");
                    }
                }
            }
            NalUnitType::Pps => self.pps = Some(nal.to_vec()),
            _ => {}
        }
    }
}

impl Recorder for StreamRecorder {
    fn push(&self, packet: &Packet) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.closed {
            return;
        }
        inner.builder.push(packet.clone());
        while let Some(sample) = inner.builder.pop() {
            self.handle_sample(&mut inner, &sample);
        }
    }

    fn close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.closed {
            return;
        }
        inner.closed = true;
        self.finish_segment(&mut inner);
    }
}
