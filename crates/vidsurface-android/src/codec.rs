//! Decoder Engine over `android.media.MediaCodec`.
//!
//! All calls happen on the thread that owns the engine: the caller thread
//! while the session opens, then the decode thread.

use std::sync::Arc;
use std::time::Duration;

use jni::objects::{GlobalRef, JObject, JValue};
use jni::JNIEnv;

use vidsurface_core::codec::{CodecState, DecoderEngine, OutputEvent, ProducerHandle};
use vidsurface_core::video::{BufferFlags, BufferInfo, CropRect, OutputFormat, TrackInfo, VideoError};

use crate::jvm::{self, JniFailure};
use crate::source::format_int;
use crate::surface::SurfaceProducer;

/// `MediaCodec.INFO_TRY_AGAIN_LATER`
const INFO_TRY_AGAIN_LATER: i32 = -1;
/// `MediaCodec.INFO_OUTPUT_FORMAT_CHANGED`
const INFO_OUTPUT_FORMAT_CHANGED: i32 = -2;
/// `MediaCodec.INFO_OUTPUT_BUFFERS_CHANGED`
const INFO_OUTPUT_BUFFERS_CHANGED: i32 = -3;

/// Input buffer handed out by `getInputBuffer` for the current dequeue.
struct InputSlot {
    index: usize,
    _buffer: GlobalRef,
    address: usize,
    capacity: usize,
}

pub struct MediaCodecEngine {
    mime: String,
    codec: GlobalRef,
    buffer_info: Option<GlobalRef>,
    state: CodecState,
    input: Option<InputSlot>,
    format: Option<OutputFormat>,
    track: Option<TrackInfo>,
    // Keeps the output Surface alive while the codec renders into it.
    producer: Option<Arc<SurfaceProducer>>,
}

fn timeout_us(timeout: Duration) -> i64 {
    i64::try_from(timeout.as_micros()).unwrap_or(i64::MAX)
}

impl MediaCodecEngine {
    /// Creates an unconfigured decoder for `mime`.
    pub fn create(mime: &str) -> Result<Self, VideoError> {
        let codec = jvm::call("MediaCodec.createDecoderByType", VideoError::ConfigureFailure, |env| {
            let jmime = env.new_string(mime)?;
            let codec = env
                .call_static_method(
                    "android/media/MediaCodec",
                    "createDecoderByType",
                    "(Ljava/lang/String;)Landroid/media/MediaCodec;",
                    &[JValue::Object(&jmime)],
                )?
                .l()?;
            Ok(env.new_global_ref(codec)?)
        })?;
        tracing::debug!("MediaCodecEngine: created decoder for {mime}");
        Ok(Self {
            mime: mime.to_owned(),
            codec,
            buffer_info: None,
            state: CodecState::Uninitialized,
            input: None,
            format: None,
            track: None,
            producer: None,
        })
    }

    fn read_output_format(&self) -> Result<OutputFormat, VideoError> {
        let codec = &self.codec;
        let (width, height, crop) =
            jvm::call("MediaCodec.getOutputFormat", VideoError::DecodeLoopFault, |env| {
                let format = env
                    .call_method(codec, "getOutputFormat", "()Landroid/media/MediaFormat;", &[])?
                    .l()?;
                let width = format_int(env, &format, "width")?.unwrap_or(0).max(0) as u32;
                let height = format_int(env, &format, "height")?.unwrap_or(0).max(0) as u32;
                let crop = read_crop(env, &format)?;
                Ok((width, height, crop))
            })?;

        let mut output = OutputFormat::new(width, height);
        if let Some(crop) = crop.filter(|c| !c.is_empty()) {
            output.crop = crop;
        }
        if let Some(track) = &self.track {
            output.rotation = track.format.rotation;
        }
        Ok(output)
    }
}

/// Crop keys hold inclusive pixel coordinates.
fn read_crop(env: &mut JNIEnv, format: &JObject) -> Result<Option<CropRect>, JniFailure> {
    let left = format_int(env, format, "crop-left")?;
    let top = format_int(env, format, "crop-top")?;
    let right = format_int(env, format, "crop-right")?;
    let bottom = format_int(env, format, "crop-bottom")?;
    let (Some(left), Some(top), Some(right), Some(bottom)) = (left, top, right, bottom) else {
        return Ok(None);
    };
    Ok(Some(CropRect {
        left: left.max(0) as u32,
        top: top.max(0) as u32,
        right: (right + 1).max(0) as u32,
        bottom: (bottom + 1).max(0) as u32,
    }))
}

impl DecoderEngine for MediaCodecEngine {
    fn configure(&mut self, track: &TrackInfo, producer: &ProducerHandle) -> Result<(), VideoError> {
        if !self.state.can_transition_to(CodecState::Configured) {
            return Err(VideoError::IllegalState(format!(
                "configure not allowed in state {:?}",
                self.state
            )));
        }
        let producer = producer.downcast::<SurfaceProducer>().ok_or_else(|| {
            VideoError::ConfigureFailure("output surface is not a SurfaceTexture producer".into())
        })?;

        let codec = &self.codec;
        let surface = producer.surface();
        let buffer_info = jvm::call("MediaCodec.configure", VideoError::ConfigureFailure, |env| {
            let jmime = env.new_string(&track.format.mime)?;
            let format = env
                .call_static_method(
                    "android/media/MediaFormat",
                    "createVideoFormat",
                    "(Ljava/lang/String;II)Landroid/media/MediaFormat;",
                    &[
                        JValue::Object(&jmime),
                        JValue::Int(track.format.width as i32),
                        JValue::Int(track.format.height as i32),
                    ],
                )?
                .l()?;
            env.call_method(
                codec,
                "configure",
                "(Landroid/media/MediaFormat;Landroid/view/Surface;Landroid/media/MediaCrypto;I)V",
                &[
                    JValue::Object(&format),
                    JValue::Object(surface.as_obj()),
                    JValue::Object(&JObject::null()),
                    JValue::Int(0),
                ],
            )?;
            let info = env.new_object("android/media/MediaCodec$BufferInfo", "()V", &[])?;
            Ok(env.new_global_ref(info)?)
        })?;

        self.buffer_info = Some(buffer_info);
        self.track = Some(track.clone());
        self.producer = Some(producer);
        self.state.transition(CodecState::Configured, "configure")?;
        tracing::debug!(
            "MediaCodecEngine: configured {} {}x{}",
            self.mime,
            track.format.width,
            track.format.height
        );
        Ok(())
    }

    fn start(&mut self) -> Result<(), VideoError> {
        if !self.state.can_transition_to(CodecState::Running) {
            return Err(VideoError::IllegalState(format!(
                "start not allowed in state {:?}",
                self.state
            )));
        }
        let codec = &self.codec;
        jvm::call("MediaCodec.start", VideoError::ConfigureFailure, |env| {
            env.call_method(codec, "start", "()V", &[])?;
            Ok(())
        })?;
        self.state.transition(CodecState::Running, "start")
    }

    fn dequeue_input(&mut self, timeout: Duration) -> Result<Option<usize>, VideoError> {
        self.state.require_executing("dequeue_input")?;
        if self.state == CodecState::Draining {
            return Ok(None);
        }
        let codec = &self.codec;
        let index = jvm::call("MediaCodec.dequeueInputBuffer", VideoError::DecodeLoopFault, |env| {
            Ok(env
                .call_method(codec, "dequeueInputBuffer", "(J)I", &[JValue::Long(timeout_us(timeout))])?
                .i()?)
        })?;
        Ok(usize::try_from(index).ok())
    }

    fn input_buffer(&mut self, index: usize) -> Result<&mut [u8], VideoError> {
        self.state.require_executing("input_buffer")?;
        if self.input.as_ref().map(|slot| slot.index) != Some(index) {
            let codec = &self.codec;
            let slot = jvm::call("MediaCodec.getInputBuffer", VideoError::DecodeLoopFault, |env| {
                let buffer = env
                    .call_method(
                        codec,
                        "getInputBuffer",
                        "(I)Ljava/nio/ByteBuffer;",
                        &[JValue::Int(index as i32)],
                    )?
                    .l()?;
                if buffer.is_null() {
                    return Err(JniFailure(format!("no input buffer at index {index}")));
                }
                let buffer = jni::objects::JByteBuffer::from(buffer);
                let address = env.get_direct_buffer_address(&buffer)? as usize;
                let capacity = env.get_direct_buffer_capacity(&buffer)?;
                Ok(InputSlot {
                    index,
                    _buffer: env.new_global_ref(buffer)?,
                    address,
                    capacity,
                })
            })?;
            self.input = Some(slot);
        }
        let Some(slot) = &self.input else {
            return Err(VideoError::IllegalState(format!(
                "input slot {index} is not dequeued"
            )));
        };
        // The codec owns this memory until the slot is queued; the global
        // reference keeps the ByteBuffer alive until then.
        Ok(unsafe { std::slice::from_raw_parts_mut(slot.address as *mut u8, slot.capacity) })
    }

    fn queue_input(
        &mut self,
        index: usize,
        size: usize,
        pts_us: i64,
        flags: BufferFlags,
    ) -> Result<(), VideoError> {
        if self.state != CodecState::Running {
            return Err(VideoError::IllegalState(format!(
                "queue_input not allowed in state {:?}",
                self.state
            )));
        }
        if self.input.as_ref().is_some_and(|slot| slot.index == index) {
            self.input = None;
        }
        let codec = &self.codec;
        jvm::call("MediaCodec.queueInputBuffer", VideoError::DecodeLoopFault, |env| {
            env.call_method(
                codec,
                "queueInputBuffer",
                "(IIIJI)V",
                &[
                    JValue::Int(index as i32),
                    JValue::Int(0),
                    JValue::Int(size as i32),
                    JValue::Long(pts_us),
                    JValue::Int(flags.bits() as i32),
                ],
            )?;
            Ok(())
        })?;
        if flags.is_end_of_stream() {
            self.state.transition(CodecState::Draining, "queue_input")?;
            tracing::debug!("MediaCodecEngine: input end of stream queued");
        }
        Ok(())
    }

    fn dequeue_output(&mut self, timeout: Duration) -> Result<OutputEvent, VideoError> {
        self.state.require_executing("dequeue_output")?;
        let Some(buffer_info) = &self.buffer_info else {
            return Err(VideoError::IllegalState("decoder is not configured".into()));
        };
        let codec = &self.codec;
        let (index, info) =
            jvm::call("MediaCodec.dequeueOutputBuffer", VideoError::DecodeLoopFault, |env| {
                let index = env
                    .call_method(
                        codec,
                        "dequeueOutputBuffer",
                        "(Landroid/media/MediaCodec$BufferInfo;J)I",
                        &[JValue::Object(buffer_info.as_obj()), JValue::Long(timeout_us(timeout))],
                    )?
                    .i()?;
                if index < 0 {
                    return Ok((index, None));
                }
                let info = BufferInfo {
                    offset: env.get_field(buffer_info, "offset", "I")?.i()?.max(0) as usize,
                    size: env.get_field(buffer_info, "size", "I")?.i()?.max(0) as usize,
                    presentation_time_us: env
                        .get_field(buffer_info, "presentationTimeUs", "J")?
                        .j()?,
                    flags: BufferFlags::from_bits(env.get_field(buffer_info, "flags", "I")?.i()? as u32),
                };
                Ok((index, Some(info)))
            })?;

        match (index, info) {
            (index, Some(info)) if index >= 0 => Ok(OutputEvent::Ready {
                index: index as usize,
                info,
            }),
            (INFO_TRY_AGAIN_LATER, _) => Ok(OutputEvent::TryAgainLater),
            (INFO_OUTPUT_FORMAT_CHANGED, _) => {
                let format = self.read_output_format()?;
                tracing::debug!(
                    "MediaCodecEngine: output format {}x{} crop {:?}",
                    format.width,
                    format.height,
                    format.crop
                );
                self.format = Some(format);
                Ok(OutputEvent::FormatChanged(format))
            }
            (INFO_OUTPUT_BUFFERS_CHANGED, _) => Ok(OutputEvent::BuffersChanged),
            (other, _) => {
                tracing::warn!("MediaCodecEngine: unknown dequeueOutputBuffer result {other}");
                Ok(OutputEvent::TryAgainLater)
            }
        }
    }

    fn output_format(&self) -> Option<OutputFormat> {
        self.format
    }

    fn release_output(&mut self, index: usize, render: bool) -> Result<(), VideoError> {
        self.state.require_executing("release_output")?;
        let codec = &self.codec;
        let released = jvm::call("MediaCodec.releaseOutputBuffer", VideoError::DecodeLoopFault, |env| {
            env.call_method(
                codec,
                "releaseOutputBuffer",
                "(IZ)V",
                &[JValue::Int(index as i32), JValue::Bool(u8::from(render))],
            )?;
            Ok(())
        });
        released.map_err(|e| match &self.producer {
            Some(producer) if producer.is_abandoned() => VideoError::SurfaceAbandoned,
            _ => e,
        })
    }

    fn stop(&mut self) -> Result<(), VideoError> {
        self.state.transition(CodecState::Stopped, "stop")?;
        self.input = None;
        let codec = &self.codec;
        jvm::call("MediaCodec.stop", VideoError::IllegalState, |env| {
            env.call_method(codec, "stop", "()V", &[])?;
            Ok(())
        })
    }

    fn release(&mut self) {
        if self.state == CodecState::Released {
            return;
        }
        self.state = CodecState::Released;
        self.input = None;
        let codec = &self.codec;
        jvm::call_quietly("MediaCodec.release", |env| {
            env.call_method(codec, "release", "()V", &[])?;
            Ok(())
        });
        self.buffer_info = None;
        self.producer = None;
        tracing::debug!("MediaCodecEngine: released {}", self.mime);
    }

    fn state(&self) -> CodecState {
        self.state
    }
}

impl Drop for MediaCodecEngine {
    fn drop(&mut self) {
        self.release();
    }
}
