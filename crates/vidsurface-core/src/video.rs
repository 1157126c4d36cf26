//! Core types shared by every stage of the decode pipeline.
//!
//! These types describe compressed input, decoder output buffers, and the
//! resolved video track. They carry no platform handles, so they can cross
//! thread boundaries freely.

use std::time::Duration;

use bytes::Bytes;

/// Errors that can occur while opening or running a decode session.
#[derive(Debug, Clone, PartialEq)]
pub enum VideoError {
    /// The source has no track whose MIME type starts with `video/`
    NoVideoTrack(String),
    /// The source could not be opened or read
    SourceUnreadable(String),
    /// The decoder could not bind to the track or the output surface
    ConfigureFailure(String),
    /// Unexpected failure while the decode loop was running
    DecodeLoopFault(String),
    /// A session is already live and the registry is full
    AlreadyActive,
    /// A codec or surface call was made in a state that does not allow it
    IllegalState(String),
    /// The consumer surface was released while still in use
    SurfaceAbandoned,
    /// The decode thread could not be spawned
    ThreadSpawn(String),
}

impl std::fmt::Display for VideoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VideoError::NoVideoTrack(msg) => write!(f, "No video track: {msg}"),
            VideoError::SourceUnreadable(msg) => write!(f, "Source unreadable: {msg}"),
            VideoError::ConfigureFailure(msg) => write!(f, "Decoder configuration failed: {msg}"),
            VideoError::DecodeLoopFault(msg) => write!(f, "Decode loop fault: {msg}"),
            VideoError::AlreadyActive => write!(f, "A decode session is already active"),
            VideoError::IllegalState(msg) => write!(f, "Illegal state: {msg}"),
            VideoError::SurfaceAbandoned => write!(f, "Consumer surface was abandoned"),
            VideoError::ThreadSpawn(msg) => write!(f, "Failed to spawn decode thread: {msg}"),
        }
    }
}

impl std::error::Error for VideoError {}

/// Sample and buffer flags.
///
/// The bit values match the platform decoder's so they can be passed through
/// without translation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BufferFlags(u32);

impl BufferFlags {
    /// No flags set
    pub const NONE: BufferFlags = BufferFlags(0);
    /// Sync sample (decodable without earlier samples)
    pub const KEY_FRAME: BufferFlags = BufferFlags(1);
    /// Codec initialization data rather than media data
    pub const CODEC_CONFIG: BufferFlags = BufferFlags(2);
    /// Last buffer on this side of the decoder
    pub const END_OF_STREAM: BufferFlags = BufferFlags(4);

    /// Creates flags from raw bits, keeping unknown bits.
    pub const fn from_bits(bits: u32) -> Self {
        BufferFlags(bits)
    }

    /// Returns the raw bit value.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns true if every bit of `other` is set in `self`.
    pub const fn contains(self, other: BufferFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if the end-of-stream bit is set.
    pub const fn is_end_of_stream(self) -> bool {
        self.contains(BufferFlags::END_OF_STREAM)
    }
}

impl std::ops::BitOr for BufferFlags {
    type Output = BufferFlags;

    fn bitor(self, rhs: BufferFlags) -> BufferFlags {
        BufferFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for BufferFlags {
    fn bitor_assign(&mut self, rhs: BufferFlags) {
        self.0 |= rhs.0;
    }
}

/// Clockwise rotation that must be applied when displaying a frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Rotation {
    #[default]
    R0,
    R90,
    R180,
    R270,
}

impl Rotation {
    /// Maps a rotation in degrees to the nearest supported quarter turn.
    ///
    /// Values that are not multiples of 90 fall back to no rotation.
    pub fn from_degrees(degrees: i32) -> Self {
        match degrees.rem_euclid(360) {
            90 => Rotation::R90,
            180 => Rotation::R180,
            270 => Rotation::R270,
            _ => Rotation::R0,
        }
    }

    /// Returns the rotation in degrees.
    pub fn degrees(self) -> u32 {
        match self {
            Rotation::R0 => 0,
            Rotation::R90 => 90,
            Rotation::R180 => 180,
            Rotation::R270 => 270,
        }
    }
}

/// Visible region of a decoded buffer, in pixels. `right` and `bottom` are exclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CropRect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl CropRect {
    /// A crop covering the whole buffer.
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            left: 0,
            top: 0,
            right: width,
            bottom: height,
        }
    }

    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }

    /// Returns true if the rectangle has no area.
    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }
}

/// Codec family of a video track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    H264,
    Hevc,
    Vp8,
    Vp9,
    Av1,
    Other,
}

impl CodecKind {
    /// Maps a MIME type to a codec family.
    pub fn from_mime(mime: &str) -> Self {
        match mime {
            "video/avc" => CodecKind::H264,
            "video/hevc" => CodecKind::Hevc,
            "video/x-vnd.on2.vp8" => CodecKind::Vp8,
            "video/x-vnd.on2.vp9" => CodecKind::Vp9,
            "video/av01" => CodecKind::Av1,
            _ => CodecKind::Other,
        }
    }
}

/// Format of one track as reported by a source.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaFormat {
    /// MIME type, e.g. `video/avc`
    pub mime: String,
    /// Width in pixels (0 for non-video tracks)
    pub width: u32,
    /// Height in pixels (0 for non-video tracks)
    pub height: u32,
    /// Track duration if known
    pub duration: Option<Duration>,
    /// Nominal frame rate if known
    pub frame_rate: Option<f32>,
    /// Display rotation
    pub rotation: Rotation,
}

impl MediaFormat {
    /// Creates a video format with the given MIME type and dimensions.
    pub fn video(mime: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            mime: mime.into(),
            width,
            height,
            duration: None,
            frame_rate: None,
            rotation: Rotation::R0,
        }
    }

    /// Creates a format for a non-video track.
    pub fn other(mime: impl Into<String>) -> Self {
        Self::video(mime, 0, 0)
    }

    /// Returns true if this is a video track.
    pub fn is_video(&self) -> bool {
        self.mime.starts_with("video/")
    }
}

/// The resolved video track of an opened source. Immutable once resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackInfo {
    /// Index of the track within the source
    pub track_index: usize,
    /// Format of the selected track
    pub format: MediaFormat,
}

impl TrackInfo {
    pub fn codec(&self) -> CodecKind {
        CodecKind::from_mime(&self.format.mime)
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.format.width, self.format.height)
    }
}

/// One compressed access unit, held transiently until it is copied into a
/// decoder input slot.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedSample {
    /// Compressed payload
    pub data: Bytes,
    /// Presentation timestamp in microseconds
    pub pts_us: i64,
    /// Sample flags (key frame, codec config)
    pub flags: BufferFlags,
}

impl CompressedSample {
    pub fn new(data: impl Into<Bytes>, pts_us: i64, flags: BufferFlags) -> Self {
        Self {
            data: data.into(),
            pts_us,
            flags,
        }
    }

    /// Creates a key-frame sample.
    pub fn key(data: impl Into<Bytes>, pts_us: i64) -> Self {
        Self::new(data, pts_us, BufferFlags::KEY_FRAME)
    }
}

/// Metadata of one decoder output buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferInfo {
    pub offset: usize,
    pub size: usize,
    /// Presentation timestamp in microseconds
    pub presentation_time_us: i64,
    pub flags: BufferFlags,
}

impl BufferInfo {
    /// Returns the presentation timestamp as a duration (negative values clamp to zero).
    pub fn pts(&self) -> Duration {
        Duration::from_micros(self.presentation_time_us.max(0) as u64)
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.flags.is_end_of_stream()
    }
}

/// Format of the decoder's output, reported on every format change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputFormat {
    /// Allocated buffer width
    pub width: u32,
    /// Allocated buffer height
    pub height: u32,
    /// Visible region within the buffer
    pub crop: CropRect,
    /// Display rotation
    pub rotation: Rotation,
}

impl OutputFormat {
    /// Output format covering the whole buffer with no rotation.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            crop: CropRect::full(width, height),
            rotation: Rotation::R0,
        }
    }

    /// Display dimensions after crop.
    pub fn display_size(&self) -> (u32, u32) {
        (self.crop.width(), self.crop.height())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_flags_contains() {
        let flags = BufferFlags::KEY_FRAME | BufferFlags::END_OF_STREAM;
        assert!(flags.contains(BufferFlags::KEY_FRAME));
        assert!(flags.is_end_of_stream());
        assert!(!flags.contains(BufferFlags::CODEC_CONFIG));
        assert_eq!(flags.bits(), 5);
        assert!(!BufferFlags::NONE.is_end_of_stream());
    }

    #[test]
    fn test_media_format_is_video() {
        assert!(MediaFormat::video("video/avc", 1920, 1080).is_video());
        assert!(!MediaFormat::other("audio/mp4a-latm").is_video());
        assert!(!MediaFormat::other("application/octet-stream").is_video());
    }

    #[test]
    fn test_codec_from_mime() {
        assert_eq!(CodecKind::from_mime("video/avc"), CodecKind::H264);
        assert_eq!(CodecKind::from_mime("video/x-vnd.on2.vp9"), CodecKind::Vp9);
        assert_eq!(CodecKind::from_mime("video/mp4v-es"), CodecKind::Other);
    }

    #[test]
    fn test_rotation_from_degrees() {
        assert_eq!(Rotation::from_degrees(90), Rotation::R90);
        assert_eq!(Rotation::from_degrees(-90), Rotation::R270);
        assert_eq!(Rotation::from_degrees(45), Rotation::R0);
        assert_eq!(Rotation::R180.degrees(), 180);
    }

    #[test]
    fn test_crop_rect_size() {
        let crop = CropRect {
            left: 0,
            top: 0,
            right: 1920,
            bottom: 1080,
        };
        assert_eq!((crop.width(), crop.height()), (1920, 1080));
        assert!(!crop.is_empty());
        assert!(CropRect::default().is_empty());
    }

    #[test]
    fn test_buffer_info_pts() {
        let info = BufferInfo {
            presentation_time_us: 33_000,
            ..Default::default()
        };
        assert_eq!(info.pts(), Duration::from_millis(33));

        let negative = BufferInfo {
            presentation_time_us: -5,
            ..Default::default()
        };
        assert_eq!(negative.pts(), Duration::ZERO);
    }

    #[test]
    fn test_error_display() {
        let e = VideoError::NoVideoTrack("clip.mp4".into());
        assert_eq!(format!("{e}"), "No video track: clip.mp4");
        assert_eq!(
            format!("{}", VideoError::AlreadyActive),
            "A decode session is already active"
        );
    }
}
