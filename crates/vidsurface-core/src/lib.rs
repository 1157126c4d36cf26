//! vidsurface-core: hardware-style video decode into a GPU-sampleable texture.
//!
//! This crate is platform-free. It contains:
//!
//! - Core types: [`video`], [`config`]
//! - Collaborator contracts: [`source`] (Source Reader), [`codec`] (Decoder
//!   Engine), [`surface`] (GPU Consumer Surface)
//! - In-process implementations: [`ivf`], [`reference_decoder`], the
//!   buffer-queue surface and [`backend::ReferenceBackend`]
//! - The pipeline: [`decode_loop`], [`frame_signal`], [`session`], [`bridge`]
//!
//! Platform decoders live in their own crates and plug in through
//! [`backend::MediaBackend`]. It is consumed by:
//! - `vidsurface-android` (MediaCodec + SurfaceTexture over JNI)
//! - `vidsurface-ffi` (C ABI)
//! - `vidsurface-demo` (command-line host)

pub mod video;
pub mod config;

pub mod source;
pub mod ivf;
pub mod codec;
pub mod reference_decoder;
pub mod surface;
pub mod frame_signal;

pub mod decode_loop;
pub mod backend;
pub mod session;
pub mod bridge;

pub use backend::{MediaBackend, ReferenceBackend};
pub use bridge::{ErrorCode, Request, Response};
pub use codec::{CodecState, DecoderEngine, OutputEvent, ProducerHandle};
pub use config::{DecodeConfig, ReferenceDecoderConfig};
pub use decode_loop::{DecodeStatsSnapshot, LoopExit};
pub use frame_signal::{frame_signal, FrameNotifier, FrameRefresh, FrameWaiter, GpuConsumer};
pub use session::{SessionController, SessionEvent, SessionId, SessionState};
pub use source::{MemoryClip, SourceReader};
pub use surface::{ConsumerSurface, TextureRefresh};
pub use video::{BufferFlags, BufferInfo, MediaFormat, OutputFormat, TrackInfo, VideoError};
