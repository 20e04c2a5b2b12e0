//! Track recording
//!
//! Every published video track gets a recorder: H.264 tracks are muxed into
//! rotating MP4 segments, anything else falls back to a raw RTP dump. Both
//! run synchronously on the forwarding path and swallow their own errors so
//! a full disk never takes the live relay down.

pub mod mp4;
pub mod raw;
pub mod stream_recorder;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use webrtc::api::media_engine::MIME_TYPE_H264;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

pub use raw::RawRecorder;
pub use stream_recorder::StreamRecorder;

/// Sink for the RTP packets of one published track
///
/// Implementations are called from the forwarding task and must never block
/// on anything slower than local disk.
pub trait Recorder: Send + Sync {
    fn push(&self, packet: &Packet);
    /// Finalize any open file. Must be idempotent.
    fn close(&self);
}

/// Build the recorder matching a track's negotiated codec
pub fn new_recorder(
    recordings_dir: &Path,
    stream_id: &str,
    codec: &RTCRtpCodecCapability,
    segment_duration: Duration,
) -> Option<Arc<dyn Recorder>> {
    if codec.mime_type.eq_ignore_ascii_case(MIME_TYPE_H264) {
        return Some(Arc::new(StreamRecorder::new(
            recordings_dir,
            stream_id,
            codec.clock_rate,
            &codec.sdp_fmtp_line,
            segment_duration,
        )));
    }
    match RawRecorder::new(
        recordings_dir,
        stream_id,
        &codec.mime_type,
        codec.clock_rate,
        &codec.sdp_fmtp_line,
    ) {
        Ok(rec) => Some(Arc::new(rec)),
        Err(e) => {
            tracing::error!(stream = %stream_id, codec = %codec.mime_type, error = %e, "Failed to open raw recorder");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let h264 = RTCRtpCodecCapability {
            mime_type: "video/H264".to_string(),
            clock_rate: 90_000,
            ..Default::default()
        };
        assert!(new_recorder(dir.path(), "s", &h264, Duration::from_secs(300)).is_some());
        // H.264 defers file creation until the first keyframe
        assert!(!dir.path().join("s").exists());

        let vp8 = RTCRtpCodecCapability {
            mime_type: "video/VP8".to_string(),
            clock_rate: 90_000,
            ..Default::default()
        };
        let rec = new_recorder(dir.path(), "s", &vp8, Duration::from_secs(300)).unwrap();
        assert!(dir.path().join("s").exists());
        rec.close();
    }
}
