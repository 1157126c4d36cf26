//! vidsurface Android native library
//!
//! Implements the decode pipeline's collaborators on the platform media
//! stack (MediaExtractor, MediaCodec, SurfaceTexture) and exports the JNI
//! entry points of `io.vidsurface.VidSurface`:
//!
//! - control thread: `nativeStartDecoding`, `nativeStopDecoding`,
//!   `nativeSetConsumerBufferSize`
//! - GL thread: `nativeAttachTexture`, `nativeUpdateFrame`
//! - frame callback thread: `FrameListener.nativeOnFrameAvailable`
//!
//! The GL-thread consumer is thread-local: it must be attached and updated
//! from the thread that owns the GL context.

#![cfg(target_os = "android")]

mod backend;
mod codec;
mod jvm;
mod source;
mod surface;

pub use backend::AndroidBackend;
pub use codec::MediaCodecEngine;
pub use source::AndroidSource;
pub use surface::{SurfaceProducer, SurfaceTextureRefresh, SurfaceTextureSurface};

use std::cell::RefCell;
use std::ffi::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::OnceLock;

use jni::objects::{JClass, JFloatArray, JObject, JString};
use jni::sys::{jboolean, jint, jlong, JNI_FALSE, JNI_TRUE, JNI_VERSION_1_6};
use jni::{JNIEnv, JavaVM};
use parking_lot::Mutex;

use vidsurface_core::{
    DecodeConfig, GpuConsumer, Request, Response, SessionController, SessionId,
};

static CONTROLLER: OnceLock<SessionController<AndroidBackend>> = OnceLock::new();

/// Session started by the last successful `nativeStartDecoding`.
static CURRENT_SESSION: Mutex<Option<SessionId>> = Mutex::new(None);

thread_local! {
    static CONSUMER: RefCell<Option<GpuConsumer>> = const { RefCell::new(None) };
}

fn controller() -> &'static SessionController<AndroidBackend> {
    CONTROLLER.get_or_init(|| SessionController::new(AndroidBackend::new(), DecodeConfig::from_env()))
}

/// Runs `f`, turning a panic into `default`. Unwinding into the JVM aborts.
fn jni_boundary<T>(what: &str, default: T, f: impl FnOnce() -> T) -> T {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(_) => {
            tracing::error!("JNI: caught Rust panic in {what}");
            default
        }
    }
}

#[no_mangle]
pub extern "system" fn JNI_OnLoad(vm: JavaVM, _reserved: *mut c_void) -> jint {
    android_logger::init_once(
        android_logger::Config::default()
            .with_max_level(tracing::log::LevelFilter::Debug)
            .with_tag("vidsurface"),
    );
    if let Err(e) = jvm::init(vm) {
        tracing::error!("JNI_OnLoad: {}", e.0);
    }
    tracing::info!("vidsurface native library loaded");
    JNI_VERSION_1_6
}

#[no_mangle]
pub extern "C" fn Java_io_vidsurface_VidSurface_nativeStartDecoding(
    mut env: JNIEnv,
    _class: JClass,
    context: JObject,
    source: JString,
) -> jboolean {
    jni_boundary("nativeStartDecoding", JNI_FALSE, || {
        if source.is_null() {
            tracing::warn!("nativeStartDecoding: null source");
            return JNI_FALSE;
        }
        let locator: String = match env.get_string(&source) {
            Ok(locator) => locator.into(),
            Err(e) => {
                tracing::warn!("nativeStartDecoding: unreadable source string: {e}");
                return JNI_FALSE;
            }
        };
        let context = if context.is_null() {
            None
        } else {
            match env.new_global_ref(&context) {
                Ok(context) => Some(context),
                Err(e) => {
                    tracing::warn!("nativeStartDecoding: {e}");
                    None
                }
            }
        };

        let controller = controller();
        controller.backend().set_context(context);
        match controller.handle(Request::StartDecoding { locator }) {
            Response::Started { session } => {
                *CURRENT_SESSION.lock() = Some(session);
                JNI_TRUE
            }
            other => {
                tracing::warn!("nativeStartDecoding rejected: {:?}", other.code());
                JNI_FALSE
            }
        }
    })
}

#[no_mangle]
pub extern "C" fn Java_io_vidsurface_VidSurface_nativeStopDecoding(_env: JNIEnv, _class: JClass) {
    jni_boundary("nativeStopDecoding", (), || {
        controller().handle(Request::StopDecoding);
        CURRENT_SESSION.lock().take();
    })
}

#[no_mangle]
pub extern "C" fn Java_io_vidsurface_VidSurface_nativeSetConsumerBufferSize(
    _env: JNIEnv,
    _class: JClass,
    width: jint,
    height: jint,
) {
    jni_boundary("nativeSetConsumerBufferSize", (), || {
        if width <= 0 || height <= 0 {
            tracing::warn!("nativeSetConsumerBufferSize: ignoring {width}x{height}");
            return;
        }
        let response = controller().handle(Request::SetConsumerBufferSize {
            width: width as u32,
            height: height as u32,
        });
        if !response.is_ok() {
            tracing::warn!("nativeSetConsumerBufferSize rejected: {:?}", response.code());
        }
    })
}

/// Attaches the current session's texture to GL texture `tex_name`. Must be
/// called on the GL thread.
#[no_mangle]
pub extern "C" fn Java_io_vidsurface_VidSurface_nativeAttachTexture(
    _env: JNIEnv,
    _class: JClass,
    tex_name: jint,
) -> jboolean {
    jni_boundary("nativeAttachTexture", JNI_FALSE, || {
        let Some(session) = *CURRENT_SESSION.lock() else {
            tracing::warn!("nativeAttachTexture: no active session");
            return JNI_FALSE;
        };
        let controller = controller();
        let Some(waiter) = controller.frame_waiter(session) else {
            tracing::warn!(session = %session, "nativeAttachTexture: session is not running");
            return JNI_FALSE;
        };
        let Some(mut texture) = controller.take_texture(session) else {
            tracing::warn!(session = %session, "nativeAttachTexture: texture already taken");
            return JNI_FALSE;
        };
        if let Err(e) = texture.attach_to_context(tex_name as u32) {
            tracing::error!(session = %session, "nativeAttachTexture: {e}");
            return JNI_FALSE;
        }
        CONSUMER.with(|cell| {
            let mut cell = cell.borrow_mut();
            let consumer = cell.get_or_insert_with(|| GpuConsumer::new(controller.config()));
            consumer.attach(texture, waiter);
        });
        JNI_TRUE
    })
}

/// Latches the newest frame if one is signalled and writes its transform
/// matrix into `matrix`. Returns false when nothing new was latched.
#[no_mangle]
pub extern "C" fn Java_io_vidsurface_VidSurface_nativeUpdateFrame(
    mut env: JNIEnv,
    _class: JClass,
    matrix: JFloatArray,
) -> jboolean {
    jni_boundary("nativeUpdateFrame", JNI_FALSE, || {
        let refresh = CONSUMER.with(|cell| cell.borrow_mut().as_mut().and_then(GpuConsumer::update));
        let Some(refresh) = refresh else {
            return JNI_FALSE;
        };
        if !matrix.is_null() {
            if let Err(e) = env.set_float_array_region(&matrix, 0, &refresh.transform) {
                tracing::warn!("nativeUpdateFrame: {e}");
                jvm::take_exception(&mut env);
            }
        }
        JNI_TRUE
    })
}

#[no_mangle]
pub extern "C" fn Java_io_vidsurface_FrameListener_nativeOnFrameAvailable(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
) {
    jni_boundary("nativeOnFrameAvailable", (), || {
        if !surface::on_frame_available(handle as u64) {
            tracing::trace!("nativeOnFrameAvailable: stale listener {handle}");
        }
    })
}

/// Drops the GL-thread consumer. Call on the GL thread before its context
/// is destroyed.
#[no_mangle]
pub extern "C" fn Java_io_vidsurface_VidSurface_nativeReleaseConsumer(_env: JNIEnv, _class: JClass) {
    jni_boundary("nativeReleaseConsumer", (), || {
        CONSUMER.with(|cell| cell.borrow_mut().take());
    })
}
