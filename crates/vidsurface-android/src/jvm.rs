//! Java VM access for native threads.
//!
//! The VM is stored once by `JNI_OnLoad`. Threads that call into Java
//! attach permanently (the decode thread makes every MediaCodec call from
//! its own thread) and run each call inside a local reference frame, so a
//! long-running native thread never accumulates local references.

use std::sync::OnceLock;

use jni::objects::{GlobalRef, JClass, JString};
use jni::{JNIEnv, JavaVM};

use vidsurface_core::VideoError;

/// Java class that forwards `onFrameAvailable` to `nativeOnFrameAvailable`.
pub(crate) const FRAME_LISTENER_CLASS: &str = "io/vidsurface/FrameListener";

const LOCAL_FRAME_CAPACITY: i32 = 32;

static VM: OnceLock<JavaVM> = OnceLock::new();

/// App classes resolved at load time. Native threads cannot look them up
/// through `FindClass` since they run with the system class loader.
static FRAME_LISTENER: OnceLock<GlobalRef> = OnceLock::new();

/// A failed JNI call, with the pending Java exception folded into the text.
#[derive(Debug)]
pub(crate) struct JniFailure(pub(crate) String);

impl From<jni::errors::Error> for JniFailure {
    fn from(e: jni::errors::Error) -> Self {
        JniFailure(e.to_string())
    }
}

/// Stores the VM and resolves app classes. Called from `JNI_OnLoad`, on a
/// thread that can see the app class loader.
pub(crate) fn init(vm: JavaVM) -> Result<(), JniFailure> {
    let vm = VM.get_or_init(|| vm);
    let mut env = vm.get_env()?;
    let listener = match env.find_class(FRAME_LISTENER_CLASS) {
        Ok(class) => class,
        Err(e) => {
            let reason = take_exception(&mut env).unwrap_or_else(|| e.to_string());
            return Err(JniFailure(format!("{FRAME_LISTENER_CLASS}: {reason}")));
        }
    };
    let listener = env.new_global_ref(listener)?;
    let _ = FRAME_LISTENER.set(listener);
    Ok(())
}

pub(crate) fn frame_listener_class() -> Result<&'static JClass<'static>, JniFailure> {
    FRAME_LISTENER
        .get()
        .map(|class| <&JClass>::from(class.as_obj()))
        .ok_or_else(|| JniFailure(format!("{FRAME_LISTENER_CLASS} not resolved")))
}

/// Clears a pending Java exception and returns its `toString()`.
pub(crate) fn take_exception(env: &mut JNIEnv) -> Option<String> {
    if !env.exception_check().unwrap_or(false) {
        return None;
    }
    let throwable = env.exception_occurred().ok()?;
    env.exception_clear().ok()?;
    let text = env
        .call_method(&throwable, "toString", "()Ljava/lang/String;", &[])
        .and_then(|v| v.l())
        .and_then(|s| env.get_string(&JString::from(s)).map(|s| s.into()));
    match text {
        Ok(text) => Some(text),
        Err(_) => {
            let _ = env.exception_clear();
            Some("java exception".into())
        }
    }
}

/// Runs `f` with an attached environment inside a local reference frame.
///
/// Failures, including Java exceptions, are cleared and mapped through `wrap`.
pub(crate) fn call<T, F>(what: &str, wrap: fn(String) -> VideoError, f: F) -> Result<T, VideoError>
where
    F: FnOnce(&mut JNIEnv) -> Result<T, JniFailure>,
{
    let vm = VM
        .get()
        .ok_or_else(|| wrap(format!("{what}: JNI_OnLoad has not run")))?;
    let mut env = vm
        .attach_current_thread_permanently()
        .map_err(|e| wrap(format!("{what}: failed to attach thread: {e}")))?;

    env.with_local_frame(LOCAL_FRAME_CAPACITY, |env| {
        f(env).map_err(|failure| match take_exception(env) {
            Some(exception) => JniFailure(format!("{}: {exception}", failure.0)),
            None => failure,
        })
    })
    .map_err(|failure: JniFailure| wrap(format!("{what}: {}", failure.0)))
}

/// Like [`call`] for cleanup paths: failures are logged, not returned.
pub(crate) fn call_quietly<F>(what: &str, f: F)
where
    F: FnOnce(&mut JNIEnv) -> Result<(), JniFailure>,
{
    if let Err(e) = call(what, VideoError::IllegalState, f) {
        tracing::warn!("{e}");
    }
}
