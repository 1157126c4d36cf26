//! Source Reader: pull interface over one compressed video track.
//!
//! A reader resolves the first `video/` track when it is opened and then
//! hands out one sample at a time. The caller controls pacing: nothing is
//! buffered beyond the current sample.

use crate::video::{BufferFlags, CompressedSample, MediaFormat, TrackInfo, VideoError};

/// Pull interface over the compressed samples of the selected video track.
///
/// Readers are moved onto the decode thread and owned exclusively by it.
pub trait SourceReader: Send {
    /// Returns the resolved video track.
    fn track_info(&self) -> &TrackInfo;

    /// Copies the current sample into `buf`.
    ///
    /// Returns `Ok(None)` at end of input. A sample larger than `buf` is an error.
    fn read_sample(&mut self, buf: &mut [u8]) -> Result<Option<usize>, VideoError>;

    /// Moves to the next sample. Returns false once the input is exhausted.
    fn advance(&mut self) -> bool;

    /// Presentation timestamp of the current sample, in microseconds.
    fn sample_time_us(&self) -> i64;

    /// Flags of the current sample.
    fn sample_flags(&self) -> BufferFlags;

    /// Releases the underlying source. Safe to call more than once.
    fn release(&mut self);
}

impl SourceReader for Box<dyn SourceReader> {
    fn track_info(&self) -> &TrackInfo {
        (**self).track_info()
    }

    fn read_sample(&mut self, buf: &mut [u8]) -> Result<Option<usize>, VideoError> {
        (**self).read_sample(buf)
    }

    fn advance(&mut self) -> bool {
        (**self).advance()
    }

    fn sample_time_us(&self) -> i64 {
        (**self).sample_time_us()
    }

    fn sample_flags(&self) -> BufferFlags {
        (**self).sample_flags()
    }

    fn release(&mut self) {
        (**self).release()
    }
}

/// Returns the index of the first track whose MIME type starts with `video/`.
pub fn select_video_track(formats: &[MediaFormat]) -> Option<usize> {
    formats.iter().position(MediaFormat::is_video)
}

/// Resolves the video track of a source or fails with `NoVideoTrack`.
pub fn resolve_video_track(locator: &str, formats: &[MediaFormat]) -> Result<TrackInfo, VideoError> {
    let track_index = select_video_track(formats).ok_or_else(|| {
        VideoError::NoVideoTrack(format!("{locator} has {} track(s), none video", formats.len()))
    })?;
    Ok(TrackInfo {
        track_index,
        format: formats[track_index].clone(),
    })
}

/// Copies `data` into `buf`, failing when the caller's buffer is too small.
pub(crate) fn copy_sample(data: &[u8], buf: &mut [u8]) -> Result<usize, VideoError> {
    if data.len() > buf.len() {
        return Err(VideoError::SourceUnreadable(format!(
            "sample of {} bytes exceeds {} byte input buffer",
            data.len(),
            buf.len()
        )));
    }
    buf[..data.len()].copy_from_slice(data);
    Ok(data.len())
}

/// An in-memory clip: a list of tracks plus the samples of its video track.
#[derive(Debug, Clone, Default)]
pub struct MemoryClip {
    tracks: Vec<MediaFormat>,
    samples: Vec<CompressedSample>,
}

impl MemoryClip {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a single-track clip with one key frame per timestamp.
    ///
    /// Each payload is the sample index as a little-endian `u32`.
    pub fn synthetic(mime: &str, width: u32, height: u32, timestamps_us: &[i64]) -> Self {
        let mut clip = Self::new().with_track(MediaFormat::video(mime, width, height));
        for (i, &pts) in timestamps_us.iter().enumerate() {
            let payload = (i as u32).to_le_bytes().to_vec();
            clip = clip.with_sample(CompressedSample::key(payload, pts));
        }
        clip
    }

    pub fn with_track(mut self, format: MediaFormat) -> Self {
        self.tracks.push(format);
        self
    }

    pub fn with_sample(mut self, sample: CompressedSample) -> Self {
        self.samples.push(sample);
        self
    }

    pub fn tracks(&self) -> &[MediaFormat] {
        &self.tracks
    }

    pub fn samples(&self) -> &[CompressedSample] {
        &self.samples
    }
}

/// Source reader over a [`MemoryClip`].
pub struct MemorySource {
    track: TrackInfo,
    samples: Vec<CompressedSample>,
    position: usize,
    released: bool,
}

impl MemorySource {
    /// Opens a clip, selecting its first video track.
    pub fn open(name: &str, clip: &MemoryClip) -> Result<Self, VideoError> {
        let track = resolve_video_track(name, clip.tracks())?;
        tracing::debug!(
            "MemorySource: {name} track {} ({}x{}, {} samples)",
            track.track_index,
            track.format.width,
            track.format.height,
            clip.samples().len()
        );
        Ok(Self {
            track,
            samples: clip.samples().to_vec(),
            position: 0,
            released: false,
        })
    }

    fn current(&self) -> Option<&CompressedSample> {
        if self.released {
            return None;
        }
        self.samples.get(self.position)
    }
}

impl SourceReader for MemorySource {
    fn track_info(&self) -> &TrackInfo {
        &self.track
    }

    fn read_sample(&mut self, buf: &mut [u8]) -> Result<Option<usize>, VideoError> {
        if self.released {
            return Err(VideoError::IllegalState("read from released source".into()));
        }
        match self.current() {
            Some(sample) => copy_sample(&sample.data, buf).map(Some),
            None => Ok(None),
        }
    }

    fn advance(&mut self) -> bool {
        if self.position < self.samples.len() {
            self.position += 1;
        }
        self.current().is_some()
    }

    fn sample_time_us(&self) -> i64 {
        self.current().map(|s| s.pts_us).unwrap_or(-1)
    }

    fn sample_flags(&self) -> BufferFlags {
        self.current().map(|s| s.flags).unwrap_or_default()
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.samples.clear();
        }
    }
}
