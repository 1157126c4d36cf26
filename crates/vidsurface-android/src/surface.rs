//! GPU Consumer Surface over `android.graphics.SurfaceTexture`.
//!
//! The SurfaceTexture is created detached from any GL context. Its
//! frame-available listener runs on a dedicated `HandlerThread`
//! (`vidsurface-frame-cb`) and calls back into `nativeOnFrameAvailable`
//! with a handle that maps to the session's [`FrameNotifier`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use jni::objects::{GlobalRef, JObject, JValue};
use jni::JNIEnv;
use parking_lot::RwLock;

use vidsurface_core::codec::ProducerHandle;
use vidsurface_core::surface::{ConsumerSurface, LatchedFrame, SurfaceId, TextureId, TextureRefresh};
use vidsurface_core::video::VideoError;
use vidsurface_core::FrameNotifier;

use crate::jvm::{self, JniFailure};

const CALLBACK_THREAD_NAME: &str = "vidsurface-frame-cb";

static NEXT_LISTENER: AtomicU64 = AtomicU64::new(1);

/// Frame-available handles registered by prepared surfaces.
static LISTENERS: LazyLock<RwLock<HashMap<u64, FrameNotifier>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Raises the signal registered under `handle`. Returns false for unknown
/// handles, which happens when a callback races with `release`.
pub(crate) fn on_frame_available(handle: u64) -> bool {
    match LISTENERS.read().get(&handle) {
        Some(notifier) => {
            notifier.notify();
            true
        }
        None => false,
    }
}

/// Producer endpoint handed to the decoder: the `android.view.Surface`.
pub struct SurfaceProducer {
    surface: GlobalRef,
    abandoned: Arc<AtomicBool>,
}

impl SurfaceProducer {
    pub(crate) fn surface(&self) -> &GlobalRef {
        &self.surface
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }
}

/// Default buffer size packed as `width << 32 | height`.
#[derive(Default)]
struct BufferSize(AtomicU64);

impl BufferSize {
    fn set(&self, width: u32, height: u32) {
        self.0
            .store((u64::from(width) << 32) | u64::from(height), Ordering::Release);
    }

    fn get(&self) -> (u32, u32) {
        let packed = self.0.load(Ordering::Acquire);
        ((packed >> 32) as u32, packed as u32)
    }
}

struct Prepared {
    texture: GlobalRef,
    handler_thread: GlobalRef,
    producer: Arc<SurfaceProducer>,
    listener: u64,
    handle: ProducerHandle,
}

pub struct SurfaceTextureSurface {
    notifier: FrameNotifier,
    surface_id: SurfaceId,
    prepared: Option<Prepared>,
    texture_taken: bool,
    abandoned: Arc<AtomicBool>,
    size: Arc<BufferSize>,
}

impl SurfaceTextureSurface {
    pub fn new(notifier: FrameNotifier) -> Self {
        Self {
            notifier,
            surface_id: SurfaceId::next(),
            prepared: None,
            texture_taken: false,
            abandoned: Arc::new(AtomicBool::new(false)),
            size: Arc::new(BufferSize::default()),
        }
    }
}

impl ConsumerSurface for SurfaceTextureSurface {
    fn prepare(&mut self) -> Result<ProducerHandle, VideoError> {
        if let Some(prepared) = &self.prepared {
            return Ok(prepared.handle.clone());
        }
        if self.abandoned.load(Ordering::Acquire) {
            return Err(VideoError::SurfaceAbandoned);
        }

        let listener = NEXT_LISTENER.fetch_add(1, Ordering::Relaxed);
        LISTENERS.write().insert(listener, self.notifier.clone());

        let created = jvm::call("SurfaceTexture", VideoError::ConfigureFailure, |env| {
            // Detached mode: attached to a GL context later, on the GPU thread.
            let texture = env.new_object("android/graphics/SurfaceTexture", "(Z)V", &[JValue::Bool(0)])?;
            let name = env.new_string(CALLBACK_THREAD_NAME)?;
            let thread = env.new_object(
                "android/os/HandlerThread",
                "(Ljava/lang/String;)V",
                &[JValue::Object(&name)],
            )?;
            env.call_method(&thread, "start", "()V", &[])?;

            let wired = wire_listener(env, &texture, &thread, listener);

            let surface = match wired {
                Ok(surface) => surface,
                Err(e) => {
                    let reason = jvm::take_exception(env).unwrap_or(e.0);
                    env.call_method(&thread, "quitSafely", "()Z", &[])?;
                    env.call_method(&texture, "release", "()V", &[])?;
                    return Err(JniFailure(reason));
                }
            };
            Ok((
                env.new_global_ref(texture)?,
                env.new_global_ref(thread)?,
                env.new_global_ref(surface)?,
            ))
        });

        let (texture, handler_thread, surface) = match created {
            Ok(created) => created,
            Err(e) => {
                LISTENERS.write().remove(&listener);
                return Err(e);
            }
        };

        let producer = Arc::new(SurfaceProducer {
            surface,
            abandoned: Arc::clone(&self.abandoned),
        });
        let handle = ProducerHandle::new(self.surface_id, Arc::clone(&producer));
        tracing::debug!(
            "SurfaceTextureSurface: prepared surface {:?} (listener {listener})",
            self.surface_id
        );
        self.prepared = Some(Prepared {
            texture,
            handler_thread,
            producer,
            listener,
            handle: handle.clone(),
        });
        Ok(handle)
    }

    fn update_default_buffer_size(&mut self, width: u32, height: u32) -> Result<(), VideoError> {
        let Some(prepared) = &self.prepared else {
            return Err(VideoError::IllegalState("surface is not prepared".into()));
        };
        let texture = &prepared.texture;
        jvm::call("SurfaceTexture.setDefaultBufferSize", VideoError::IllegalState, |env| {
            env.call_method(
                texture,
                "setDefaultBufferSize",
                "(II)V",
                &[JValue::Int(width as i32), JValue::Int(height as i32)],
            )?;
            Ok(())
        })?;
        self.size.set(width, height);
        Ok(())
    }

    fn take_texture(&mut self) -> Option<Box<dyn TextureRefresh>> {
        let prepared = self.prepared.as_ref()?;
        if self.texture_taken {
            return None;
        }
        self.texture_taken = true;
        Some(Box::new(SurfaceTextureRefresh {
            texture: prepared.texture.clone(),
            texture_id: TextureId(0),
            attached: false,
            abandoned: Arc::clone(&self.abandoned),
            size: Arc::clone(&self.size),
            timestamp_ns: i64::MIN,
            frame_number: 0,
            transform: IDENTITY,
        }))
    }

    fn release(&mut self) {
        let Some(prepared) = self.prepared.take() else {
            return;
        };
        self.abandoned.store(true, Ordering::Release);
        LISTENERS.write().remove(&prepared.listener);

        let surface = prepared.producer.surface();
        jvm::call_quietly("Surface.release", |env| {
            env.call_method(surface, "release", "()V", &[])?;
            Ok(())
        });
        let texture = &prepared.texture;
        jvm::call_quietly("SurfaceTexture.release", |env| {
            env.call_method(texture, "release", "()V", &[])?;
            Ok(())
        });
        let thread = &prepared.handler_thread;
        jvm::call_quietly("HandlerThread.quitSafely", |env| {
            env.call_method(thread, "quitSafely", "()Z", &[])?;
            Ok(())
        });
        tracing::debug!("SurfaceTextureSurface: released surface {:?}", self.surface_id);
    }

    fn is_prepared(&self) -> bool {
        self.prepared.is_some()
    }
}

/// Routes frame callbacks to `thread` and creates the producer `Surface`.
fn wire_listener<'local>(
    env: &mut JNIEnv<'local>,
    texture: &JObject,
    thread: &JObject,
    listener: u64,
) -> Result<JObject<'local>, JniFailure> {
    let looper = env
        .call_method(thread, "getLooper", "()Landroid/os/Looper;", &[])?
        .l()?;
    let handler = env.new_object(
        "android/os/Handler",
        "(Landroid/os/Looper;)V",
        &[JValue::Object(&looper)],
    )?;
    let callback = env.new_object(
        jvm::frame_listener_class()?,
        "(J)V",
        &[JValue::Long(listener as i64)],
    )?;
    env.call_method(
        texture,
        "setOnFrameAvailableListener",
        "(Landroid/graphics/SurfaceTexture$OnFrameAvailableListener;Landroid/os/Handler;)V",
        &[JValue::Object(&callback), JValue::Object(&handler)],
    )?;
    Ok(env.new_object(
        "android/view/Surface",
        "(Landroid/graphics/SurfaceTexture;)V",
        &[JValue::Object(texture)],
    )?)
}

impl Drop for SurfaceTextureSurface {
    fn drop(&mut self) {
        self.release();
    }
}

const IDENTITY: [f32; 16] = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0,
];

/// GPU-thread side of a [`SurfaceTextureSurface`].
pub struct SurfaceTextureRefresh {
    texture: GlobalRef,
    texture_id: TextureId,
    attached: bool,
    abandoned: Arc<AtomicBool>,
    size: Arc<BufferSize>,
    timestamp_ns: i64,
    frame_number: u64,
    transform: [f32; 16],
}

impl SurfaceTextureRefresh {
    fn check_abandoned(&self) -> Result<(), VideoError> {
        if self.abandoned.load(Ordering::Acquire) {
            return Err(VideoError::SurfaceAbandoned);
        }
        Ok(())
    }
}

impl TextureRefresh for SurfaceTextureRefresh {
    fn texture_id(&self) -> TextureId {
        self.texture_id
    }

    fn update_tex_image(&mut self) -> Result<Option<LatchedFrame>, VideoError> {
        self.check_abandoned()?;
        if !self.attached {
            return Err(VideoError::IllegalState(
                "texture is not attached to a GL context".into(),
            ));
        }
        let texture = &self.texture;
        let latched = jvm::call("SurfaceTexture.updateTexImage", VideoError::IllegalState, |env| {
            env.call_method(texture, "updateTexImage", "()V", &[])?;
            let timestamp = env.call_method(texture, "getTimestamp", "()J", &[])?.j()?;
            let matrix = env.new_float_array(16)?;
            env.call_method(texture, "getTransformMatrix", "([F)V", &[JValue::Object(&matrix)])?;
            let mut transform = [0.0f32; 16];
            env.get_float_array_region(&matrix, 0, &mut transform)?;
            Ok((timestamp, transform))
        });
        let (timestamp_ns, transform) = match latched {
            Ok(latched) => latched,
            // Released by the decode thread while we were refreshing.
            Err(_) if self.abandoned.load(Ordering::Acquire) => {
                return Err(VideoError::SurfaceAbandoned)
            }
            Err(e) => return Err(e),
        };

        if timestamp_ns == self.timestamp_ns {
            return Ok(None);
        }
        self.timestamp_ns = timestamp_ns;
        self.transform = transform;
        self.frame_number += 1;
        let (width, height) = self.size.get();
        Ok(Some(LatchedFrame {
            pts_us: timestamp_ns / 1000,
            width,
            height,
            frame_number: self.frame_number,
        }))
    }

    fn transform_matrix(&self) -> [f32; 16] {
        self.transform
    }

    fn timestamp_us(&self) -> i64 {
        self.timestamp_ns.max(0) / 1000
    }

    fn attach_to_context(&mut self, name: u32) -> Result<(), VideoError> {
        self.check_abandoned()?;
        if self.attached {
            return Err(VideoError::IllegalState(format!(
                "texture already attached as {}",
                self.texture_id.0
            )));
        }
        let texture = &self.texture;
        jvm::call("SurfaceTexture.attachToGLContext", VideoError::IllegalState, |env| {
            env.call_method(texture, "attachToGLContext", "(I)V", &[JValue::Int(name as i32)])?;
            Ok(())
        })?;
        self.texture_id = TextureId(name);
        self.attached = true;
        tracing::debug!("SurfaceTextureRefresh: attached to GL texture {name}");
        Ok(())
    }
}

impl Drop for SurfaceTextureRefresh {
    fn drop(&mut self) {
        if !self.attached || self.abandoned.load(Ordering::Acquire) {
            return;
        }
        let texture = &self.texture;
        jvm::call_quietly("SurfaceTexture.detachFromGLContext", |env| {
            env.call_method(texture, "detachFromGLContext", "()V", &[])?;
            Ok(())
        });
    }
}
