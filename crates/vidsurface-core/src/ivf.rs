//! IVF file reader.
//!
//! IVF is the minimal container used for raw VP8/VP9/AV1 streams: a 32-byte
//! file header followed by frames, each prefixed with a 12-byte header.
//!
//! ```text
//! 0   "DKIF"
//! 4   version u16, header length u16
//! 8   fourcc
//! 12  width u16, height u16
//! 16  timebase denominator (rate) u32, numerator (scale) u32
//! 24  frame count u32, unused u32
//! ```
//!
//! All fields are little-endian.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

use bytes::Bytes;

use crate::source::{copy_sample, SourceReader};
use crate::video::{BufferFlags, CompressedSample, MediaFormat, TrackInfo, VideoError};

const SIGNATURE: &[u8; 4] = b"DKIF";
const FILE_HEADER_LEN: usize = 32;
const FRAME_HEADER_LEN: usize = 12;
/// Largest frame payload accepted from a frame header.
pub const MAX_FRAME_LEN: usize = 64 << 20;

/// Parsed IVF file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IvfHeader {
    pub fourcc: [u8; 4],
    pub width: u16,
    pub height: u16,
    /// Timebase denominator
    pub rate: u32,
    /// Timebase numerator
    pub scale: u32,
    pub frame_count: u32,
}

impl IvfHeader {
    pub fn new(fourcc: [u8; 4], width: u16, height: u16, rate: u32, scale: u32) -> Self {
        Self {
            fourcc,
            width,
            height,
            rate,
            scale,
            frame_count: 0,
        }
    }

    /// Parses the 32-byte file header.
    pub fn parse(bytes: &[u8; FILE_HEADER_LEN]) -> Result<Self, VideoError> {
        if &bytes[0..4] != SIGNATURE {
            return Err(VideoError::SourceUnreadable("missing DKIF signature".into()));
        }
        let header_len = u16::from_le_bytes([bytes[6], bytes[7]]);
        if header_len as usize != FILE_HEADER_LEN {
            return Err(VideoError::SourceUnreadable(format!(
                "unexpected IVF header length {header_len}"
            )));
        }
        let header = Self {
            fourcc: [bytes[8], bytes[9], bytes[10], bytes[11]],
            width: u16::from_le_bytes([bytes[12], bytes[13]]),
            height: u16::from_le_bytes([bytes[14], bytes[15]]),
            rate: u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]),
            scale: u32::from_le_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]),
            frame_count: u32::from_le_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]),
        };
        if header.rate == 0 {
            return Err(VideoError::SourceUnreadable("IVF timebase rate is zero".into()));
        }
        Ok(header)
    }

    /// MIME type for the header's fourcc. Unknown fourccs map to a non-video type.
    pub fn mime(&self) -> &'static str {
        match &self.fourcc {
            b"VP80" => "video/x-vnd.on2.vp8",
            b"VP90" => "video/x-vnd.on2.vp9",
            b"AV01" => "video/av01",
            _ => "application/octet-stream",
        }
    }

    /// Converts a timestamp in timebase units to microseconds.
    pub fn timestamp_to_us(&self, ts: u64) -> i64 {
        let us = ts as i128 * self.scale as i128 * 1_000_000 / self.rate.max(1) as i128;
        us.clamp(0, i64::MAX as i128) as i64
    }

    fn to_bytes(self) -> [u8; FILE_HEADER_LEN] {
        let mut out = [0u8; FILE_HEADER_LEN];
        out[0..4].copy_from_slice(SIGNATURE);
        out[6..8].copy_from_slice(&(FILE_HEADER_LEN as u16).to_le_bytes());
        out[8..12].copy_from_slice(&self.fourcc);
        out[12..14].copy_from_slice(&self.width.to_le_bytes());
        out[14..16].copy_from_slice(&self.height.to_le_bytes());
        out[16..20].copy_from_slice(&self.rate.to_le_bytes());
        out[20..24].copy_from_slice(&self.scale.to_le_bytes());
        out[24..28].copy_from_slice(&self.frame_count.to_le_bytes());
        out
    }
}

/// Writes an IVF stream. `frames` are `(timestamp, payload)` pairs in timebase units.
pub fn write_ivf<W: Write>(
    out: &mut W,
    header: IvfHeader,
    frames: &[(u64, &[u8])],
) -> std::io::Result<()> {
    let header = IvfHeader {
        frame_count: frames.len() as u32,
        ..header
    };
    out.write_all(&header.to_bytes())?;
    for (ts, payload) in frames {
        out.write_all(&(payload.len() as u32).to_le_bytes())?;
        out.write_all(&ts.to_le_bytes())?;
        out.write_all(payload)?;
    }
    out.flush()
}

/// Source reader over an IVF file.
///
/// The file is streamed; only the current frame is held in memory.
pub struct IvfSource {
    header: IvfHeader,
    track: TrackInfo,
    reader: Option<BufReader<File>>,
    current: Option<CompressedSample>,
    frames_read: u64,
    /// Bytes left in the file after the current read position.
    remaining: u64,
    /// Set when a frame header is corrupt; reported by `read_sample`.
    fault: Option<VideoError>,
}

impl std::fmt::Debug for IvfSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IvfSource")
            .field("header", &self.header)
            .field("frames_read", &self.frames_read)
            .field("released", &self.reader.is_none())
            .finish()
    }
}

impl IvfSource {
    /// Opens an IVF file and loads its first frame.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, VideoError> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| VideoError::SourceUnreadable(format!("{}: {e}", path.display())))?;
        let file_len = file
            .metadata()
            .map_err(|e| VideoError::SourceUnreadable(format!("{}: {e}", path.display())))?
            .len();
        let mut reader = BufReader::new(file);

        let mut raw = [0u8; FILE_HEADER_LEN];
        reader.read_exact(&mut raw).map_err(|e| {
            VideoError::SourceUnreadable(format!("{}: truncated IVF header: {e}", path.display()))
        })?;
        let header = IvfHeader::parse(&raw)?;

        let format = MediaFormat::video(header.mime(), header.width as u32, header.height as u32);
        let track = crate::source::resolve_video_track(&path.display().to_string(), &[format])?;

        tracing::debug!(
            "IvfSource: {} {} {}x{} timebase {}/{}, {} frames",
            path.display(),
            String::from_utf8_lossy(&header.fourcc),
            header.width,
            header.height,
            header.scale,
            header.rate,
            header.frame_count
        );

        let mut source = Self {
            header,
            track,
            reader: Some(reader),
            current: None,
            frames_read: 0,
            remaining: file_len.saturating_sub(FILE_HEADER_LEN as u64),
            fault: None,
        };
        source.load_next()?;
        Ok(source)
    }

    pub fn header(&self) -> &IvfHeader {
        &self.header
    }

    /// Loads the next frame into `current`. End of file and truncated
    /// trailing frames end the input; a frame above [`MAX_FRAME_LEN`] is an
    /// error. Nothing is allocated beyond what the file still holds.
    fn load_next(&mut self) -> Result<(), VideoError> {
        self.current = None;
        let Some(reader) = self.reader.as_mut() else {
            return Ok(());
        };

        let mut frame_header = [0u8; FRAME_HEADER_LEN];
        if let Err(e) = reader.read_exact(&mut frame_header) {
            if e.kind() != std::io::ErrorKind::UnexpectedEof {
                tracing::warn!("IvfSource: read error after {} frames: {e}", self.frames_read);
            }
            return Ok(());
        }
        self.remaining = self.remaining.saturating_sub(FRAME_HEADER_LEN as u64);
        let size = u32::from_le_bytes([
            frame_header[0],
            frame_header[1],
            frame_header[2],
            frame_header[3],
        ]) as usize;
        if size > MAX_FRAME_LEN {
            return Err(VideoError::SourceUnreadable(format!(
                "IVF frame {} declares {size} bytes, limit is {MAX_FRAME_LEN}",
                self.frames_read
            )));
        }
        if size as u64 > self.remaining {
            tracing::warn!(
                "IvfSource: truncated frame {} ({size} bytes declared, {} left)",
                self.frames_read,
                self.remaining
            );
            return Ok(());
        }
        let mut ts_bytes = [0u8; 8];
        ts_bytes.copy_from_slice(&frame_header[4..12]);
        let ts = u64::from_le_bytes(ts_bytes);

        let mut payload = vec![0u8; size];
        if let Err(e) = reader.read_exact(&mut payload) {
            tracing::warn!(
                "IvfSource: truncated frame {} ({size} bytes declared): {e}",
                self.frames_read
            );
            return Ok(());
        }
        self.remaining -= size as u64;

        let mut flags = BufferFlags::NONE;
        if self.frames_read == 0 || self.is_vp8_key_frame(&payload) {
            flags |= BufferFlags::KEY_FRAME;
        }
        self.current = Some(CompressedSample::new(
            Bytes::from(payload),
            self.header.timestamp_to_us(ts),
            flags,
        ));
        self.frames_read += 1;
        Ok(())
    }

    // VP8 frame tag: bit 0 clear marks a key frame.
    fn is_vp8_key_frame(&self, payload: &[u8]) -> bool {
        &self.header.fourcc == b"VP80" && payload.first().is_some_and(|b| b & 1 == 0)
    }
}

impl SourceReader for IvfSource {
    fn track_info(&self) -> &TrackInfo {
        &self.track
    }

    fn read_sample(&mut self, buf: &mut [u8]) -> Result<Option<usize>, VideoError> {
        if self.reader.is_none() {
            return Err(VideoError::IllegalState("read from released source".into()));
        }
        if let Some(fault) = &self.fault {
            return Err(fault.clone());
        }
        match &self.current {
            Some(sample) => copy_sample(&sample.data, buf).map(Some),
            None => Ok(None),
        }
    }

    fn advance(&mut self) -> bool {
        if self.current.is_some() {
            if let Err(e) = self.load_next() {
                tracing::warn!("IvfSource: {e}");
                self.fault = Some(e);
            }
        }
        self.current.is_some()
    }

    fn sample_time_us(&self) -> i64 {
        self.current.as_ref().map(|s| s.pts_us).unwrap_or(-1)
    }

    fn sample_flags(&self) -> BufferFlags {
        self.current.as_ref().map(|s| s.flags).unwrap_or_default()
    }

    fn release(&mut self) {
        if self.reader.take().is_some() {
            tracing::debug!("IvfSource: released after {} frames", self.frames_read);
        }
        self.current = None;
    }
}
