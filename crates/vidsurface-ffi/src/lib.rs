//! C FFI layer for vidsurface-core.
//!
//! Provides `#[no_mangle] pub extern "C"` entry points over a
//! [`SessionController`](vidsurface_core::SessionController) backed by the
//! in-process reference pipeline. Controller functions are thread-safe.
//! Consumer functions must be called on the thread that created the
//! consumer, which is expected to own the host's GPU context.
//!
//! Every function returns an `i32` status code from
//! [`ErrorCode`](vidsurface_core::ErrorCode) unless documented otherwise.

// FFI functions intentionally take raw pointers without `unsafe` on the fn signature.
// Each body validates its pointers before use and runs inside ffi_boundary().
#![allow(clippy::not_unsafe_ptr_arg_deref)]

pub mod diagnostics;
pub mod handle;
pub mod safety;

use std::ffi::CStr;
use std::os::raw::c_char;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::time::Duration;

use vidsurface_core::{DecodeConfig, ErrorCode, Request, Response, SessionId, SessionState};

pub use crate::diagnostics::VidsurfaceDiagnostics;
use crate::handle::{VidsurfaceConsumer, VidsurfaceController, VidsurfaceFrame};
use crate::safety::{ffi_boundary, ffi_boundary_or};

// =========================================================================
// State constants
// =========================================================================

pub const VIDSURFACE_STATE_CLOSED: i32 = SessionState::Closed as i32;
pub const VIDSURFACE_STATE_OPENED: i32 = SessionState::Opened as i32;
pub const VIDSURFACE_STATE_RUNNING: i32 = SessionState::Running as i32;
pub const VIDSURFACE_STATE_STOPPED: i32 = SessionState::Stopped as i32;
/// Returned by `vidsurface_session_state` for a null controller
pub const VIDSURFACE_STATE_INVALID: i32 = -1;

// =========================================================================
// Controller lifecycle
// =========================================================================

/// Creates a controller configured from `VIDSURFACE_*` environment variables.
///
/// # Safety
/// `out_controller` must be a valid non-null pointer to a `*mut VidsurfaceController`.
#[no_mangle]
pub extern "C" fn vidsurface_controller_create(
    out_controller: *mut *mut VidsurfaceController,
) -> i32 {
    ffi_boundary(|| {
        if out_controller.is_null() {
            return Err(ErrorCode::NullPtr);
        }

        let raw = Box::into_raw(Box::new(VidsurfaceController::new(DecodeConfig::from_env())));
        diagnostics::register_controller(raw as *const u8);
        tracing::debug!("FFI: created controller {:?}", raw);

        unsafe {
            *out_controller = raw;
        }
        Ok(())
    })
}

/// Stops every session of the controller and frees it.
///
/// # Safety
/// - `controller` must be a valid non-null pointer to a `*mut VidsurfaceController`.
/// - After return, `*controller` is NULL.
/// - Consumers attached to its sessions stay valid; their texture reports
///   no further frames.
#[no_mangle]
pub extern "C" fn vidsurface_controller_destroy(
    controller: *mut *mut VidsurfaceController,
) -> i32 {
    ffi_boundary(|| {
        if controller.is_null() {
            return Err(ErrorCode::NullPtr);
        }

        // Read and null in one operation so two racing destroys cannot both
        // reach Box::from_raw.
        let atomic = unsafe { AtomicPtr::from_ptr(controller) };
        let ptr = atomic.swap(std::ptr::null_mut(), Ordering::AcqRel);
        if ptr.is_null() {
            return Ok(());
        }

        if !diagnostics::unregister_controller(ptr as *const u8) {
            tracing::error!(
                "FFI: vidsurface_controller_destroy called with unknown pointer {:?} (possible double-free)",
                ptr
            );
            return Err(ErrorCode::Internal);
        }

        // Drop stops every session.
        let _controller = unsafe { Box::from_raw(ptr) };
        Ok(())
    })
}

/// Resolves a controller argument. Null is `NULL_PTR`; a pointer that is not
/// a live controller (already destroyed, or never created) is `INTERNAL`.
fn live_controller<'a>(
    controller: *const VidsurfaceController,
) -> Result<&'a VidsurfaceController, ErrorCode> {
    if controller.is_null() {
        return Err(ErrorCode::NullPtr);
    }
    if !diagnostics::is_live_controller(controller as *const u8) {
        tracing::error!("FFI: {:?} is not a live controller", controller);
        return Err(ErrorCode::Internal);
    }
    Ok(unsafe { &*controller })
}

// =========================================================================
// Session control
// =========================================================================

/// Starts decoding `locator` (an IVF file path or `file://` URL).
///
/// On success writes the new session id to `out_session` when it is not
/// null. Returns `ALREADY_ACTIVE` when a session is running.
///
/// # Safety
/// - `controller` must be a live controller.
/// - `locator` must be a valid null-terminated C string.
#[no_mangle]
pub extern "C" fn vidsurface_start_decoding(
    controller: *const VidsurfaceController,
    locator: *const c_char,
    out_session: *mut u64,
) -> i32 {
    ffi_boundary(|| {
        let handle = live_controller(controller)?;
        if locator.is_null() {
            return Err(ErrorCode::NullPtr);
        }
        if !out_session.is_null() {
            unsafe {
                *out_session = 0;
            }
        }

        let locator = unsafe { CStr::from_ptr(locator) }
            .to_str()
            .map_err(|_| ErrorCode::InvalidLocator)?;

        let response = handle.controller.handle(Request::StartDecoding {
            locator: locator.to_owned(),
        });
        diagnostics::record_start(response.is_ok());
        match response {
            Response::Started { session } => {
                if !out_session.is_null() {
                    unsafe {
                        *out_session = session.as_u64();
                    }
                }
                Ok(())
            }
            other => Err(other.code()),
        }
    })
}

/// Stops every session. Always succeeds for a live controller.
#[no_mangle]
pub extern "C" fn vidsurface_stop_decoding(controller: *const VidsurfaceController) -> i32 {
    ffi_boundary(|| {
        let handle = live_controller(controller)?;
        match handle.controller.handle(Request::StopDecoding) {
            Response::Rejected { code } => Err(code),
            _ => Ok(()),
        }
    })
}

/// Resizes the consumer surface of the running session.
///
/// Returns `INTERNAL` when no session is running.
#[no_mangle]
pub extern "C" fn vidsurface_set_consumer_buffer_size(
    controller: *const VidsurfaceController,
    width: u32,
    height: u32,
) -> i32 {
    ffi_boundary(|| {
        let handle = live_controller(controller)?;
        match handle
            .controller
            .handle(Request::SetConsumerBufferSize { width, height })
        {
            Response::Rejected { code } => Err(code),
            _ => Ok(()),
        }
    })
}

/// Returns one of the `VIDSURFACE_STATE_*` constants.
///
/// Unknown session ids report `CLOSED`; a null or destroyed controller
/// reports `INVALID`.
#[no_mangle]
pub extern "C" fn vidsurface_session_state(
    controller: *const VidsurfaceController,
    session: u64,
) -> i32 {
    ffi_boundary_or(VIDSURFACE_STATE_INVALID, || {
        let Ok(handle) = live_controller(controller) else {
            return VIDSURFACE_STATE_INVALID;
        };
        handle.controller.state(SessionId::from_raw(session)) as i32
    })
}

// =========================================================================
// GPU consumer
// =========================================================================

/// Creates a GPU consumer for the controller's sessions. It follows the
/// frame-available signal of whichever session is attached.
///
/// The consumer is bound to the calling thread.
#[no_mangle]
pub extern "C" fn vidsurface_consumer_create(
    controller: *const VidsurfaceController,
    out_consumer: *mut *mut VidsurfaceConsumer,
) -> i32 {
    ffi_boundary(|| {
        let handle = live_controller(controller)?;
        if out_consumer.is_null() {
            return Err(ErrorCode::NullPtr);
        }

        let raw = Box::into_raw(Box::new(VidsurfaceConsumer::new(handle)));
        diagnostics::register_consumer(raw as *const u8);
        unsafe {
            *out_consumer = raw;
        }
        Ok(())
    })
}

/// Attaches the texture of `session` to the consumer.
///
/// A session hands out its texture once. Returns `INTERNAL` when the
/// session is not running or its texture was already taken.
#[no_mangle]
pub extern "C" fn vidsurface_consumer_attach(
    consumer: *mut VidsurfaceConsumer,
    controller: *const VidsurfaceController,
    session: u64,
) -> i32 {
    ffi_boundary(|| {
        let consumer = check_not_null_mut!(consumer);
        let handle = live_controller(controller)?;

        let id = SessionId::from_raw(session);
        let Some(waiter) = handle.controller.frame_waiter(id) else {
            tracing::warn!(session = %id, "FFI: session is not running");
            return Err(ErrorCode::Internal);
        };
        let Some(texture) = handle.controller.take_texture(id) else {
            tracing::warn!(session = %id, "FFI: no texture available to attach");
            return Err(ErrorCode::Internal);
        };
        consumer.consumer.attach(texture, waiter);
        consumer.session = Some(id);
        Ok(())
    })
}

/// Id of the session whose texture is attached, or 0.
#[no_mangle]
pub extern "C" fn vidsurface_consumer_session(consumer: *const VidsurfaceConsumer) -> u64 {
    ffi_boundary_or(0, || {
        if consumer.is_null() {
            return 0;
        }
        let consumer = unsafe { &*consumer };
        match consumer.session {
            Some(id) if consumer.consumer.is_attached() => id.as_u64(),
            _ => 0,
        }
    })
}

/// Refreshes the consumer's texture if a frame is available.
///
/// Waits up to `timeout_ms` for the frame-available signal (0 polls).
/// `out_frame` is always written; `ready` is 1 only when a new frame was
/// latched by this call.
#[no_mangle]
pub extern "C" fn vidsurface_consumer_update(
    consumer: *mut VidsurfaceConsumer,
    timeout_ms: u32,
    out_frame: *mut VidsurfaceFrame,
) -> i32 {
    ffi_boundary(|| {
        let consumer = check_not_null_mut!(consumer);
        if out_frame.is_null() {
            return Err(ErrorCode::NullPtr);
        }

        let refresh = if timeout_ms == 0 {
            consumer.consumer.update()
        } else {
            consumer
                .consumer
                .wait_and_update(Duration::from_millis(u64::from(timeout_ms)))
        };

        let frame = match refresh {
            Some(refresh) => {
                diagnostics::record_frame_refreshed();
                VidsurfaceFrame::from(refresh)
            }
            None => {
                let (width, height) = consumer.consumer.size();
                VidsurfaceFrame {
                    width,
                    height,
                    ..VidsurfaceFrame::default()
                }
            }
        };
        unsafe {
            *out_frame = frame;
        }
        Ok(())
    })
}

/// Frees a consumer.
///
/// # Safety
/// - `consumer` must be a valid non-null pointer to a `*mut VidsurfaceConsumer`.
/// - After return, `*consumer` is NULL.
#[no_mangle]
pub extern "C" fn vidsurface_consumer_destroy(consumer: *mut *mut VidsurfaceConsumer) -> i32 {
    ffi_boundary(|| {
        if consumer.is_null() {
            return Err(ErrorCode::NullPtr);
        }

        let atomic = unsafe { AtomicPtr::from_ptr(consumer) };
        let ptr = atomic.swap(std::ptr::null_mut(), Ordering::AcqRel);
        if ptr.is_null() {
            return Ok(());
        }

        if !diagnostics::unregister_consumer(ptr as *const u8) {
            tracing::error!(
                "FFI: vidsurface_consumer_destroy called with unknown pointer {:?} (possible double-free)",
                ptr
            );
            return Err(ErrorCode::Internal);
        }

        let _consumer = unsafe { Box::from_raw(ptr) };
        Ok(())
    })
}

// =========================================================================
// Diagnostics
// =========================================================================

/// Copies the FFI counters into `out`.
#[no_mangle]
pub extern "C" fn vidsurface_diagnostics_snapshot(out: *mut VidsurfaceDiagnostics) -> i32 {
    ffi_boundary(|| {
        if out.is_null() {
            return Err(ErrorCode::NullPtr);
        }
        unsafe {
            *out = diagnostics::snapshot();
        }
        Ok(())
    })
}
