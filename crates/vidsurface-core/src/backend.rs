//! Platform collaborators of a session.
//!
//! A [`MediaBackend`] creates the three parts a session is made of. The
//! platform crates provide hardware-backed implementations; the
//! [`ReferenceBackend`] here runs entirely in-process.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::codec::DecoderEngine;
use crate::config::{DecodeConfig, ReferenceDecoderConfig};
use crate::frame_signal::FrameNotifier;
use crate::ivf::IvfSource;
use crate::reference_decoder::ReferenceDecoder;
use crate::source::{MemoryClip, MemorySource, SourceReader};
use crate::surface::{BufferQueueSurface, ConsumerSurface};
use crate::video::{TrackInfo, VideoError};

/// Locator prefix of clips registered with [`ReferenceBackend::register_clip`].
pub const MEMORY_SCHEME: &str = "mem://";

/// Factory for the source, decoder and surface of a session.
pub trait MediaBackend: Send + Sync + 'static {
    type Source: SourceReader + 'static;
    type Decoder: DecoderEngine + 'static;
    type Surface: ConsumerSurface + 'static;

    /// Creates an unprepared consumer surface that raises `notifier` per frame.
    fn create_surface(
        &self,
        notifier: FrameNotifier,
        config: &DecodeConfig,
    ) -> Result<Self::Surface, VideoError>;

    /// Opens a source and resolves its video track.
    fn open_source(&self, locator: &str) -> Result<Self::Source, VideoError>;

    /// Creates an unconfigured decoder for `track`.
    fn create_decoder(&self, track: &TrackInfo) -> Result<Self::Decoder, VideoError>;
}

/// In-process backend: IVF files or registered in-memory clips, decoded by
/// the [`ReferenceDecoder`] into a [`BufferQueueSurface`].
#[derive(Default)]
pub struct ReferenceBackend {
    clips: RwLock<HashMap<String, MemoryClip>>,
    decoder_config: ReferenceDecoderConfig,
}

impl ReferenceBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_decoder_config(mut self, config: ReferenceDecoderConfig) -> Self {
        self.decoder_config = config;
        self
    }

    /// Registers a clip reachable as `mem://<name>`.
    pub fn register_clip(&self, name: impl Into<String>, clip: MemoryClip) -> String {
        let name = name.into();
        let locator = format!("{MEMORY_SCHEME}{name}");
        self.clips.write().insert(name, clip);
        locator
    }

    pub fn unregister_clip(&self, name: &str) -> bool {
        self.clips.write().remove(name).is_some()
    }
}

impl MediaBackend for ReferenceBackend {
    type Source = Box<dyn SourceReader>;
    type Decoder = ReferenceDecoder;
    type Surface = BufferQueueSurface;

    fn create_surface(
        &self,
        notifier: FrameNotifier,
        config: &DecodeConfig,
    ) -> Result<Self::Surface, VideoError> {
        Ok(BufferQueueSurface::new(notifier, config.buffer_queue_depth))
    }

    fn open_source(&self, locator: &str) -> Result<Self::Source, VideoError> {
        if locator.trim().is_empty() {
            return Err(VideoError::SourceUnreadable("empty locator".into()));
        }
        if let Some(name) = locator.strip_prefix(MEMORY_SCHEME) {
            let clips = self.clips.read();
            let clip = clips
                .get(name)
                .ok_or_else(|| VideoError::SourceUnreadable(format!("no clip named {name}")))?;
            return Ok(Box::new(MemorySource::open(locator, clip)?));
        }
        let path = locator.strip_prefix("file://").unwrap_or(locator);
        Ok(Box::new(IvfSource::open(path)?))
    }

    fn create_decoder(&self, _track: &TrackInfo) -> Result<Self::Decoder, VideoError> {
        Ok(ReferenceDecoder::new(self.decoder_config))
    }
}
