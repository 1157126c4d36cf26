//! FFI handle types.
//!
//! [`VidsurfaceController`] wraps a [`SessionController`] over the in-process
//! reference backend, paced to presentation time. It is thread-safe; every
//! call goes through the controller's own lock.
//!
//! [`VidsurfaceConsumer`] wraps a [`GpuConsumer`] and must only be used from
//! the thread that created it (the host's GPU thread).

use vidsurface_core::{
    DecodeConfig, FrameRefresh, GpuConsumer, ReferenceBackend, ReferenceDecoderConfig,
    SessionController, SessionId,
};

/// Opaque controller handle exposed via FFI.
pub struct VidsurfaceController {
    pub(crate) controller: SessionController<ReferenceBackend>,
}

impl VidsurfaceController {
    pub(crate) fn new(config: DecodeConfig) -> Self {
        Self {
            controller: SessionController::new(
                ReferenceBackend::new()
                    .with_decoder_config(ReferenceDecoderConfig::default().with_realtime(true)),
                config,
            ),
        }
    }
}

/// Opaque GPU consumer handle exposed via FFI.
pub struct VidsurfaceConsumer {
    pub(crate) consumer: GpuConsumer,
    pub(crate) session: Option<SessionId>,
}

impl VidsurfaceConsumer {
    pub(crate) fn new(controller: &VidsurfaceController) -> Self {
        let controller = &controller.controller;
        Self {
            consumer: GpuConsumer::new(controller.config()),
            session: None,
        }
    }
}

/// Latest refreshed frame, filled by `vidsurface_consumer_update`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C)]
pub struct VidsurfaceFrame {
    /// 1 when a new frame was latched by this call, 0 otherwise
    pub ready: i32,
    pub texture_id: u32,
    pub pts_us: i64,
    pub width: u32,
    pub height: u32,
    /// Column-major 4x4 texture coordinate transform
    pub transform: [f32; 16],
}

impl Default for VidsurfaceFrame {
    fn default() -> Self {
        let mut transform = [0.0; 16];
        transform[0] = 1.0;
        transform[5] = 1.0;
        transform[10] = 1.0;
        transform[15] = 1.0;
        Self {
            ready: 0,
            texture_id: 0,
            pts_us: 0,
            width: 0,
            height: 0,
            transform,
        }
    }
}

impl From<FrameRefresh> for VidsurfaceFrame {
    fn from(refresh: FrameRefresh) -> Self {
        Self {
            ready: 1,
            texture_id: refresh.texture_id.0,
            pts_us: refresh.pts_us,
            width: refresh.width,
            height: refresh.height,
            transform: refresh.transform,
        }
    }
}
