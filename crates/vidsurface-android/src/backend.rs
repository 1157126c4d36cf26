//! [`MediaBackend`] wiring MediaExtractor, MediaCodec and SurfaceTexture.

use jni::objects::GlobalRef;
use parking_lot::RwLock;

use vidsurface_core::{DecodeConfig, FrameNotifier, MediaBackend, TrackInfo, VideoError};

use crate::codec::MediaCodecEngine;
use crate::source::AndroidSource;
use crate::surface::SurfaceTextureSurface;

#[derive(Default)]
pub struct AndroidBackend {
    /// Application context used to resolve `content://` style URIs.
    context: RwLock<Option<GlobalRef>>,
}

impl AndroidBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the context passed with each start request.
    pub fn set_context(&self, context: Option<GlobalRef>) {
        *self.context.write() = context;
    }
}

impl MediaBackend for AndroidBackend {
    type Source = AndroidSource;
    type Decoder = MediaCodecEngine;
    type Surface = SurfaceTextureSurface;

    fn create_surface(
        &self,
        notifier: FrameNotifier,
        _config: &DecodeConfig,
    ) -> Result<Self::Surface, VideoError> {
        Ok(SurfaceTextureSurface::new(notifier))
    }

    fn open_source(&self, locator: &str) -> Result<Self::Source, VideoError> {
        if locator.trim().is_empty() {
            return Err(VideoError::SourceUnreadable("empty locator".into()));
        }
        let context = self.context.read().clone();
        AndroidSource::open(context.as_ref(), locator)
    }

    fn create_decoder(&self, track: &TrackInfo) -> Result<Self::Decoder, VideoError> {
        MediaCodecEngine::create(&track.format.mime)
    }
}
