//! MP4 segment writer
//!
//! Builds a single-track H.264 file box-by-box:
//!
//! ```text
//! ftyp
//! free                      <- reserved header room for an oversized mdat
//! mdat                      <- samples appended as they arrive, size
//!                              patched on close (64-bit header if needed)
//! moov
//!   mvhd
//!   trak
//!     tkhd
//!     mdia
//!       mdhd hdlr
//!       minf
//!         vmhd dinf
//!         stbl
//!           stsd (avc1 + avcC) stts stsc stsz stco stss
//! ```
//!
//! Sample payloads must already be AVCC-framed (length-prefixed NAL units).
//! The sample tables are accumulated in memory and flushed only on close;
//! an unclosed segment has no `moov` and is unplayable.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{MediaError, Result};

/// Fixed media timescale (90 kHz, the RTP video clock)
pub const TIMESCALE: u32 = 90_000;

/// Codec parameters needed to open a segment
#[derive(Debug, Clone)]
pub struct AvcParams {
    pub sps: Vec<u8>,
    pub pps: Vec<u8>,
    pub profile_idc: u8,
    pub constraint_flags: u8,
    pub level_idc: u8,
    pub width: u16,
    pub height: u16,
}

/// An open MP4 segment
pub struct Mp4SegmentWriter {
    file: Option<File>,
    path: PathBuf,
    params: AvcParams,
    durations: Vec<u32>,
    sizes: Vec<u32>,
    chunk_offsets: Vec<u32>,
    /// 1-based indices of keyframe samples
    sync_samples: Vec<u32>,
    last_duration: u32,
    free_pos: u64,
    mdat_pos: u64,
    mdat_size: u64,
}

impl Mp4SegmentWriter {
    /// Create a segment file and write the `ftyp` and placeholder `mdat`
    /// headers
    ///
    /// Refuses to create a file without both parameter sets so no orphaned
    /// segment is ever left on disk.
    pub fn create(dir: &Path, params: AvcParams) -> Result<Self> {
        if params.sps.is_empty() || params.pps.is_empty() {
            return Err(MediaError::MissingParameterSets.into());
        }
        std::fs::create_dir_all(dir)?;
        let name = format!("{}.mp4", chrono::Utc::now().format("%Y%m%d-%H%M%S"));
        let path = dir.join(name);
        let mut file = File::create(&path)?;

        file.write_all(&build_ftyp())?;
        // The free box reserves the 8 bytes needed to rewrite an oversized
        // mdat with a 64-bit header without disturbing sample data
        let free_pos = file.stream_position()?;
        file.write_all(&wrap_box("free", &[]))?;
        let mdat_pos = file.stream_position()?;
        file.write_all(&box_header32("mdat", 0))?;

        Ok(Self {
            file: Some(file),
            path,
            params,
            durations: Vec::new(),
            sizes: Vec::new(),
            chunk_offsets: Vec::new(),
            sync_samples: Vec::new(),
            last_duration: 0,
            free_pos,
            mdat_pos,
            mdat_size: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sample_count(&self) -> u32 {
        self.sizes.len() as u32
    }

    /// Append one AVCC-framed sample
    ///
    /// A zero duration repeats the previous sample's duration (or assumes
    /// 30 fps for the very first sample).
    pub fn write_sample(&mut self, data: &[u8], duration: u32, keyframe: bool) -> Result<()> {
        let file = self.file.as_mut().ok_or(MediaError::SegmentClosed)?;

        let duration = if duration != 0 {
            duration
        } else if self.last_duration != 0 {
            self.last_duration
        } else {
            TIMESCALE / 30
        };

        let offset = file.stream_position()?;
        file.write_all(data)?;

        self.mdat_size += data.len() as u64;
        self.durations.push(duration);
        self.sizes.push(data.len() as u32);
        self.chunk_offsets.push(offset as u32);
        if keyframe {
            self.sync_samples.push(self.sizes.len() as u32);
        }
        self.last_duration = duration;
        Ok(())
    }

    /// Patch the `mdat` size and append the `moov` box
    ///
    /// Idempotent: closing an already-closed segment is a no-op.
    pub fn close(&mut self) -> Result<()> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };

        match u32::try_from(8 + self.mdat_size) {
            Ok(size) => {
                file.seek(SeekFrom::Start(self.mdat_pos))?;
                file.write_all(&box_header32("mdat", size))?;
            }
            Err(_) => {
                // Rewrite the free box and the 32-bit header together as
                // one 64-bit largesize header
                file.seek(SeekFrom::Start(self.free_pos))?;
                file.write_all(&box_header64("mdat", 16 + self.mdat_size))?;
            }
        }
        file.seek(SeekFrom::End(0))?;
        file.write_all(&self.build_moov())?;
        file.sync_all()?;
        Ok(())
    }

    fn build_moov(&self) -> Bytes {
        let duration: u32 = self.durations.iter().sum();
        let p = &self.params;

        let avcc = build_avcc(
            &p.sps,
            &p.pps,
            p.profile_idc,
            p.constraint_flags,
            p.level_idc,
        );
        let stbl = wrap_box(
            "stbl",
            &concat(&[
                build_stsd(p.width, p.height, &avcc),
                build_stts(&self.durations),
                build_stsc(),
                build_stsz(&self.sizes),
                build_stco(&self.chunk_offsets),
                build_stss(&self.sync_samples),
            ]),
        );
        let minf = wrap_box("minf", &concat(&[build_vmhd(), build_dinf(), stbl]));
        let mdia = wrap_box("mdia", &concat(&[build_mdhd(duration), build_hdlr(), minf]));
        let trak = wrap_box(
            "trak",
            &concat(&[build_tkhd(duration, p.width, p.height), mdia]),
        );
        wrap_box("moov", &concat(&[build_mvhd(duration), trak]))
    }
}

impl Drop for Mp4SegmentWriter {
    fn drop(&mut self) {
        if self.file.is_some() {
            if let Err(e) = self.close() {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to finalize MP4 segment");
            }
        }
    }
}

// Box assembly helpers. All multi-byte values are big-endian.

fn box_header32(box_type: &str, size: u32) -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf[..4].copy_from_slice(&size.to_be_bytes());
    buf[4..].copy_from_slice(box_type.as_bytes());
    buf
}

fn box_header64(box_type: &str, size: u64) -> [u8; 16] {
    let mut buf = [0u8; 16];
    buf[..4].copy_from_slice(&1u32.to_be_bytes());
    buf[4..8].copy_from_slice(box_type.as_bytes());
    buf[8..].copy_from_slice(&size.to_be_bytes());
    buf
}

fn wrap_box(box_type: &str, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + payload.len());
    buf.put_u32((payload.len() + 8) as u32);
    buf.put_slice(box_type.as_bytes());
    buf.put_slice(payload);
    buf.freeze()
}

fn concat(boxes: &[Bytes]) -> Vec<u8> {
    let total = boxes.iter().map(Bytes::len).sum();
    let mut out = Vec::with_capacity(total);
    for b in boxes {
        out.extend_from_slice(b);
    }
    out
}

fn full_box_header(buf: &mut BytesMut, version: u8, flags: u32) {
    buf.put_u8(version);
    buf.put_slice(&flags.to_be_bytes()[1..]);
}

fn build_ftyp() -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_slice(b"isom");
    buf.put_u32(0x0000_0200); // minor version
    buf.put_slice(b"isom");
    buf.put_slice(b"iso2");
    buf.put_slice(b"avc1");
    buf.put_slice(b"mp41");
    wrap_box("ftyp", &buf)
}

const UNITY_MATRIX: [u8; 36] = [
    0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x40, 0x00, 0x00, 0x00,
];

fn build_mvhd(duration: u32) -> Bytes {
    let mut buf = BytesMut::new();
    full_box_header(&mut buf, 0, 0);
    buf.put_u32(0); // creation_time
    buf.put_u32(0); // modification_time
    buf.put_u32(TIMESCALE);
    buf.put_u32(duration);
    buf.put_u32(0x0001_0000); // rate 1.0
    buf.put_u16(0x0100); // volume 1.0
    buf.put_u16(0);
    buf.put_u32(0);
    buf.put_u32(0);
    buf.put_slice(&UNITY_MATRIX);
    for _ in 0..6 {
        buf.put_u32(0); // pre_defined
    }
    buf.put_u32(2); // next_track_ID
    wrap_box("mvhd", &buf)
}

fn build_tkhd(duration: u32, width: u16, height: u16) -> Bytes {
    let mut buf = BytesMut::new();
    full_box_header(&mut buf, 0, 0x000007); // enabled | in movie | in preview
    buf.put_u32(0); // creation_time
    buf.put_u32(0); // modification_time
    buf.put_u32(1); // track_ID
    buf.put_u32(0);
    buf.put_u32(duration);
    buf.put_u64(0); // reserved
    buf.put_u16(0); // layer
    buf.put_u16(0); // alternate_group
    buf.put_u16(0); // volume (video track)
    buf.put_u16(0);
    buf.put_slice(&UNITY_MATRIX);
    buf.put_u32(u32::from(width) << 16); // 16.16 fixed point
    buf.put_u32(u32::from(height) << 16);
    wrap_box("tkhd", &buf)
}

fn build_mdhd(duration: u32) -> Bytes {
    let mut buf = BytesMut::new();
    full_box_header(&mut buf, 0, 0);
    buf.put_u32(0);
    buf.put_u32(0);
    buf.put_u32(TIMESCALE);
    buf.put_u32(duration);
    buf.put_u16(0x55C4); // language "und"
    buf.put_u16(0);
    wrap_box("mdhd", &buf)
}

fn build_hdlr() -> Bytes {
    let mut buf = BytesMut::new();
    full_box_header(&mut buf, 0, 0);
    buf.put_u32(0); // pre_defined
    buf.put_slice(b"vide");
    buf.put_u32(0);
    buf.put_u32(0);
    buf.put_u32(0);
    buf.put_slice(b"VideoHandler");
    buf.put_u8(0);
    wrap_box("hdlr", &buf)
}

fn build_vmhd() -> Bytes {
    let mut buf = BytesMut::new();
    full_box_header(&mut buf, 0, 1);
    buf.put_u16(0); // graphicsmode
    buf.put_u16(0); // opcolor
    buf.put_u16(0);
    wrap_box("vmhd", &buf)
}

fn build_dinf() -> Bytes {
    let mut url = BytesMut::new();
    full_box_header(&mut url, 0, 1); // self-contained
    let url_box = wrap_box("url ", &url);

    let mut dref = BytesMut::new();
    full_box_header(&mut dref, 0, 0);
    dref.put_u32(1); // entry_count
    dref.put_slice(&url_box);
    wrap_box("dinf", &wrap_box("dref", &dref))
}

fn build_stsd(width: u16, height: u16, avcc: &[u8]) -> Bytes {
    let mut avc1 = BytesMut::new();
    avc1.put_bytes(0, 6); // reserved
    avc1.put_u16(1); // data_reference_index
    avc1.put_bytes(0, 16); // pre_defined / reserved
    avc1.put_u16(width);
    avc1.put_u16(height);
    avc1.put_u32(0x0048_0000); // horizresolution 72 dpi
    avc1.put_u32(0x0048_0000); // vertresolution
    avc1.put_u32(0);
    avc1.put_u16(1); // frame_count
    avc1.put_bytes(0, 32); // compressorname
    avc1.put_u16(0x18); // depth
    avc1.put_u16(0xFFFF); // pre_defined
    avc1.put_slice(avcc);

    let mut buf = BytesMut::new();
    full_box_header(&mut buf, 0, 0);
    buf.put_u32(1); // entry_count
    buf.put_slice(&wrap_box("avc1", &avc1));
    wrap_box("stsd", &buf)
}

fn build_avcc(sps: &[u8], pps: &[u8], profile: u8, constraint: u8, level: u8) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(1); // configurationVersion
    buf.put_u8(profile);
    buf.put_u8(constraint);
    buf.put_u8(level);
    buf.put_u8(0xFF); // 4-byte NALU lengths
    buf.put_u8(0xE1); // 1 SPS
    buf.put_u16(sps.len() as u16);
    buf.put_slice(sps);
    buf.put_u8(1); // 1 PPS
    buf.put_u16(pps.len() as u16);
    buf.put_slice(pps);
    wrap_box("avcC", &buf)
}

/// Run-length encode consecutive equal durations into `stts` entries
fn stts_entries(durations: &[u32]) -> Vec<(u32, u32)> {
    let mut entries: Vec<(u32, u32)> = Vec::new();
    for &d in durations {
        match entries.last_mut() {
            Some((count, delta)) if *delta == d => *count += 1,
            _ => entries.push((1, d)),
        }
    }
    entries
}

fn build_stts(durations: &[u32]) -> Bytes {
    let entries = stts_entries(durations);
    let mut buf = BytesMut::new();
    full_box_header(&mut buf, 0, 0);
    buf.put_u32(entries.len() as u32);
    for (count, delta) in entries {
        buf.put_u32(count);
        buf.put_u32(delta);
    }
    wrap_box("stts", &buf)
}

fn build_stsc() -> Bytes {
    // One sample per chunk throughout
    let mut buf = BytesMut::new();
    full_box_header(&mut buf, 0, 0);
    buf.put_u32(1); // entry_count
    buf.put_u32(1); // first_chunk
    buf.put_u32(1); // samples_per_chunk
    buf.put_u32(1); // sample_description_index
    wrap_box("stsc", &buf)
}

fn build_stsz(sizes: &[u32]) -> Bytes {
    let mut buf = BytesMut::new();
    full_box_header(&mut buf, 0, 0);
    buf.put_u32(0); // sample_size: per-sample table follows
    buf.put_u32(sizes.len() as u32);
    for &s in sizes {
        buf.put_u32(s);
    }
    wrap_box("stsz", &buf)
}

fn build_stco(offsets: &[u32]) -> Bytes {
    let mut buf = BytesMut::new();
    full_box_header(&mut buf, 0, 0);
    buf.put_u32(offsets.len() as u32);
    for &o in offsets {
        buf.put_u32(o);
    }
    wrap_box("stco", &buf)
}

fn build_stss(sync_samples: &[u32]) -> Bytes {
    let mut buf = BytesMut::new();
    full_box_header(&mut buf, 0, 0);
    buf.put_u32(sync_samples.len() as u32);
    for &s in sync_samples {
        buf.put_u32(s);
    }
    wrap_box("stss", &buf)
}
