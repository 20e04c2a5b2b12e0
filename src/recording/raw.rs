//! Raw RTP fallback recorder
//!
//! Used when the published codec is anything other than H.264. Packets are
//! dumped verbatim so they can be remuxed offline. File layout:
//!
//! ```text
//! # codec=video/VP8\n
//! # clockRate=90000\n
//! # fmtp=...\n
//! <u32 big-endian packet length><marshalled RTP packet>...
//! ```

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use webrtc::rtp::packet::Packet;
use webrtc::util::Marshal;

use crate::error::Result;
use crate::recording::Recorder;

/// Records any RTP track as a length-prefixed packet dump
pub struct RawRecorder {
    stream_id: String,
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl RawRecorder {
    pub fn new(
        recordings_dir: &Path,
        stream_id: &str,
        mime_type: &str,
        clock_rate: u32,
        fmtp: &str,
    ) -> Result<Self> {
        let dir = recordings_dir.join(stream_id);
        std::fs::create_dir_all(&dir)?;
        let name = format!(
            "{}-{}.rtp",
            chrono::Utc::now().format("%Y%m%d-%H%M%S"),
            sanitize_mime(mime_type)
        );
        let path = dir.join(name);
        let mut writer = BufWriter::new(File::create(&path)?);
        writeln!(writer, "# codec={mime_type}")?;
        writeln!(writer, "# clockRate={clock_rate}")?;
        writeln!(writer, "# fmtp={fmtp}")?;

        tracing::info!(stream = %stream_id, path = %path.display(), codec = %mime_type, "Opened raw RTP dump");
        Ok(Self {
            stream_id: stream_id.to_string(),
            path,
            writer: Mutex::new(Some(writer)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Recorder for RawRecorder {
    fn push(&self, packet: &Packet) {
        let mut guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let Some(writer) = guard.as_mut() else {
            return;
        };
        let raw = match packet.marshal() {
            Ok(raw) => raw,
            Err(e) => {
                tracing::debug!(stream = %self.stream_id, error = %e, "Failed to marshal RTP packet");
                return;
            }
        };
        let write = (|| -> std::io::Result<()> {
            writer.write_all(&(raw.len() as u32).to_be_bytes())?;
            writer.write_all(&raw)
        })();
        if let Err(e) = write {
            tracing::warn!(stream = %self.stream_id, error = %e, "Failed to write RTP dump, stopping");
            *guard = None;
        }
    }

    fn close(&self) {
        let mut guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(mut writer) = guard.take() {
            if let Err(e) = writer.flush() {
                tracing::warn!(stream = %self.stream_id, error = %e, "Failed to flush RTP dump");
            } else {
                tracing::info!(stream = %self.stream_id, path = %self.path.display(), "Closed raw RTP dump");
            }
        }
    }
}

/// Turn a MIME type into a filename-safe token: lowercase, anything outside
/// `[a-z0-9-]` replaced with `-`, edges trimmed, `unknown` when nothing
/// usable remains
fn sanitize_mime(mime: &str) -> String {
    let sanitized: String = mime
        .chars()
        .map(|c| match c.to_ascii_lowercase() {
            c if c.is_ascii_lowercase() || c.is_ascii_digit() => c,
            _ => '-',
        })
        .collect();
    let trimmed = sanitized.trim_matches('-');
    if trimmed.is_empty() {
        "unknown".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn test_packet(seq: u16) -> Packet {
        Packet {
            header: webrtc::rtp::header::Header {
                version: 2,
                payload_type: 96,
                sequence_number: seq,
                timestamp: 1000,
                ssrc: 42,
                ..Default::default()
            },
            payload: Bytes::from_static(&[0xDE, 0xAD]),
        }
    }

    #[test]
    fn test_header_and_framing() {
        let dir = tempfile::tempdir().unwrap();
        let rec = RawRecorder::new(dir.path(), "drone-1", "video/VP8", 90_000, "").unwrap();
        rec.push(&test_packet(1));
        rec.push(&test_packet(2));
        let path = rec.path().to_path_buf();
        rec.close();

        let data = std::fs::read(&path).unwrap();
        let text = String::from_utf8_lossy(&data);
        assert!(text.starts_with("# codec=video/VP8\n# clockRate=90000\n# fmtp=\n"));

        // Two length-prefixed packets follow the header
        let body_start = data
            .windows(1)
            .enumerate()
            .filter(|(_, w)| w[0] == b'\n')
            .map(|(i, _)| i)
            .nth(2)
            .unwrap()
            + 1;
        let mut offset = body_start;
        let mut packets = 0;
        while offset < data.len() {
            let len =
                u32::from_be_bytes(data[offset..offset + 4].try_into().unwrap()) as usize;
            // 12-byte RTP header + 2-byte payload
            assert_eq!(len, 14);
            offset += 4 + len;
            packets += 1;
        }
        assert_eq!(packets, 2);
    }

    #[test]
    fn test_filename_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let rec = RawRecorder::new(dir.path(), "s", "video/VP8", 90_000, "x=1").unwrap();
        let name = rec.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with("-video-vp8.rtp"), "{name}");
        rec.close();
    }

    #[test]
    fn test_mime_sanitation() {
        assert_eq!(sanitize_mime("video/VP8"), "video-vp8");
        assert_eq!(sanitize_mime("audio/opus;rate=48000"), "audio-opus-rate-48000");
        assert_eq!(sanitize_mime("/video/"), "video");
        assert_eq!(sanitize_mime(""), "unknown");
        assert_eq!(sanitize_mime("///"), "unknown");
    }

    #[test]
    fn test_push_after_close_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let rec = RawRecorder::new(dir.path(), "s", "audio/opus", 48_000, "").unwrap();
        let path = rec.path().to_path_buf();
        rec.close();
        rec.push(&test_packet(1));
        let len = std::fs::metadata(&path).unwrap().len();
        let header = "# codec=audio/opus\n# clockRate=48000\n# fmtp=\n";
        assert_eq!(len, header.len() as u64);
    }
}
