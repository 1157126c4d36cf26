//! FFI conformance tests for vidsurface-ffi.
//!
//! Sessions run on IVF files written to temporary paths, decoded by the
//! paced reference backend.

#![allow(unused_unsafe)]

use std::ffi::CString;
use std::os::raw::c_char;
use std::ptr;

use tempfile::NamedTempFile;
use vidsurface_core::ivf::{write_ivf, IvfHeader};
use vidsurface_core::ErrorCode;
use vidsurface_ffi::handle::{VidsurfaceConsumer, VidsurfaceController, VidsurfaceFrame};
use vidsurface_ffi::{
    VidsurfaceDiagnostics, VIDSURFACE_STATE_CLOSED, VIDSURFACE_STATE_INVALID,
    VIDSURFACE_STATE_STOPPED,
};

extern "C" {
    fn vidsurface_controller_create(out: *mut *mut VidsurfaceController) -> i32;
    fn vidsurface_controller_destroy(controller: *mut *mut VidsurfaceController) -> i32;
    fn vidsurface_start_decoding(
        controller: *const VidsurfaceController,
        locator: *const c_char,
        out_session: *mut u64,
    ) -> i32;
    fn vidsurface_stop_decoding(controller: *const VidsurfaceController) -> i32;
    fn vidsurface_set_consumer_buffer_size(
        controller: *const VidsurfaceController,
        width: u32,
        height: u32,
    ) -> i32;
    fn vidsurface_session_state(controller: *const VidsurfaceController, session: u64) -> i32;
    fn vidsurface_consumer_create(
        controller: *const VidsurfaceController,
        out: *mut *mut VidsurfaceConsumer,
    ) -> i32;
    fn vidsurface_consumer_attach(
        consumer: *mut VidsurfaceConsumer,
        controller: *const VidsurfaceController,
        session: u64,
    ) -> i32;
    fn vidsurface_consumer_session(consumer: *const VidsurfaceConsumer) -> u64;
    fn vidsurface_consumer_update(
        consumer: *mut VidsurfaceConsumer,
        timeout_ms: u32,
        out: *mut VidsurfaceFrame,
    ) -> i32;
    fn vidsurface_consumer_destroy(consumer: *mut *mut VidsurfaceConsumer) -> i32;
    fn vidsurface_diagnostics_snapshot(out: *mut VidsurfaceDiagnostics) -> i32;
}

const OK: i32 = ErrorCode::Ok as i32;
const NULL_PTR: i32 = ErrorCode::NullPtr as i32;
const INVALID_LOCATOR: i32 = ErrorCode::InvalidLocator as i32;
const ALREADY_ACTIVE: i32 = ErrorCode::AlreadyActive as i32;
const SOURCE_UNREADABLE: i32 = ErrorCode::SourceUnreadable as i32;
const INTERNAL: i32 = ErrorCode::Internal as i32;

/// Three seconds of 176x144 VP8 at 30 fps.
fn ivf_clip() -> (NamedTempFile, CString) {
    let mut file = NamedTempFile::new().unwrap();
    let payloads: Vec<Vec<u8>> = (0..90u8).map(|i| vec![u8::from(i > 0), i]).collect();
    let frames: Vec<(u64, &[u8])> = payloads
        .iter()
        .enumerate()
        .map(|(i, p)| (i as u64, p.as_slice()))
        .collect();
    write_ivf(&mut file, IvfHeader::new(*b"VP80", 176, 144, 30, 1), &frames).unwrap();
    let locator = CString::new(file.path().display().to_string()).unwrap();
    (file, locator)
}

fn create_controller() -> *mut VidsurfaceController {
    let mut controller: *mut VidsurfaceController = ptr::null_mut();
    let err = unsafe { vidsurface_controller_create(&mut controller) };
    assert_eq!(err, OK);
    assert!(!controller.is_null());
    controller
}

// =========================================================================
// Lifecycle tests
// =========================================================================

#[test]
fn create_and_destroy() {
    unsafe {
        let mut controller = create_controller();
        let err = vidsurface_controller_destroy(&mut controller);
        assert_eq!(err, OK);
        assert!(controller.is_null());
    }
}

#[test]
fn destroy_null_pointer_to_pointer() {
    unsafe {
        assert_eq!(vidsurface_controller_destroy(ptr::null_mut()), NULL_PTR);
        assert_eq!(vidsurface_consumer_destroy(ptr::null_mut()), NULL_PTR);
    }
}

#[test]
fn double_destroy_is_safe() {
    unsafe {
        let mut controller = create_controller();
        assert_eq!(vidsurface_controller_destroy(&mut controller), OK);
        assert!(controller.is_null());
        // *controller is now NULL, so this is a no-op
        assert_eq!(vidsurface_controller_destroy(&mut controller), OK);
    }
}

// =========================================================================
// NULL and argument checks
// =========================================================================

#[test]
fn start_with_null_arguments() {
    unsafe {
        let (_file, locator) = ivf_clip();
        let mut controller = create_controller();
        let mut session = 77u64;

        assert_eq!(
            vidsurface_start_decoding(ptr::null(), locator.as_ptr(), &mut session),
            NULL_PTR
        );
        assert_eq!(
            vidsurface_start_decoding(controller, ptr::null(), &mut session),
            NULL_PTR
        );
        assert_eq!(session, 77);

        vidsurface_controller_destroy(&mut controller);
    }
}

#[test]
fn start_with_bad_locators() {
    unsafe {
        let mut controller = create_controller();
        let mut session = 77u64;

        let empty = CString::new("").unwrap();
        assert_eq!(
            vidsurface_start_decoding(controller, empty.as_ptr(), &mut session),
            INVALID_LOCATOR
        );
        assert_eq!(session, 0);

        let missing = CString::new("/nonexistent/clip.ivf").unwrap();
        assert_eq!(
            vidsurface_start_decoding(controller, missing.as_ptr(), ptr::null_mut()),
            SOURCE_UNREADABLE
        );

        // Invalid UTF-8
        let bytes = [0xffu8, 0xfe, 0];
        assert_eq!(
            vidsurface_start_decoding(controller, bytes.as_ptr() as *const c_char, ptr::null_mut()),
            INVALID_LOCATOR
        );

        vidsurface_controller_destroy(&mut controller);
    }
}

#[test]
fn null_controller_queries() {
    unsafe {
        assert_eq!(vidsurface_stop_decoding(ptr::null()), NULL_PTR);
        assert_eq!(vidsurface_set_consumer_buffer_size(ptr::null(), 1, 1), NULL_PTR);
        assert_eq!(vidsurface_session_state(ptr::null(), 1), VIDSURFACE_STATE_INVALID);
        assert_eq!(vidsurface_consumer_session(ptr::null()), 0);
        assert_eq!(vidsurface_diagnostics_snapshot(ptr::null_mut()), NULL_PTR);
    }
}

#[test]
fn unknown_controller_is_refused() {
    // Never returned by vidsurface_controller_create; must not be dereferenced.
    let bogus = ptr::NonNull::<VidsurfaceController>::dangling().as_ptr();
    let (_file, locator) = ivf_clip();
    unsafe {
        let mut session = 7u64;
        assert_eq!(
            vidsurface_start_decoding(bogus, locator.as_ptr(), &mut session),
            INTERNAL
        );
        assert_eq!(vidsurface_stop_decoding(bogus), INTERNAL);
        assert_eq!(vidsurface_set_consumer_buffer_size(bogus, 1, 1), INTERNAL);
        assert_eq!(vidsurface_session_state(bogus, 1), VIDSURFACE_STATE_INVALID);

        let mut consumer: *mut VidsurfaceConsumer = ptr::null_mut();
        assert_eq!(vidsurface_consumer_create(bogus, &mut consumer), INTERNAL);
        assert!(consumer.is_null());
    }
}

// =========================================================================
// Session control
// =========================================================================

#[test]
fn second_start_is_rejected_until_stopped() {
    unsafe {
        let (_file, locator) = ivf_clip();
        let mut controller = create_controller();

        let mut first = 0u64;
        assert_eq!(
            vidsurface_start_decoding(controller, locator.as_ptr(), &mut first),
            OK
        );
        assert_ne!(first, 0);

        let mut second = 0u64;
        assert_eq!(
            vidsurface_start_decoding(controller, locator.as_ptr(), &mut second),
            ALREADY_ACTIVE
        );
        assert_eq!(second, 0);

        assert_eq!(vidsurface_set_consumer_buffer_size(controller, 320, 240), OK);

        assert_eq!(vidsurface_stop_decoding(controller), OK);
        assert_eq!(vidsurface_session_state(controller, first), VIDSURFACE_STATE_STOPPED);

        // Stop is idempotent and a new session can start afterwards.
        assert_eq!(vidsurface_stop_decoding(controller), OK);
        assert_eq!(
            vidsurface_start_decoding(controller, locator.as_ptr(), &mut second),
            OK
        );
        assert_ne!(second, first);

        vidsurface_controller_destroy(&mut controller);
    }
}

#[test]
fn buffer_size_without_session_fails() {
    unsafe {
        let mut controller = create_controller();
        assert_eq!(vidsurface_set_consumer_buffer_size(controller, 64, 64), INTERNAL);
        assert_eq!(vidsurface_session_state(controller, 123_456), VIDSURFACE_STATE_CLOSED);
        vidsurface_controller_destroy(&mut controller);
    }
}

// =========================================================================
// GPU consumer
// =========================================================================

#[test]
fn consumer_latches_frames() {
    unsafe {
        let (_file, locator) = ivf_clip();
        let mut controller = create_controller();
        let mut consumer: *mut VidsurfaceConsumer = ptr::null_mut();
        assert_eq!(vidsurface_consumer_create(controller, &mut consumer), OK);

        let mut frame = VidsurfaceFrame::default();
        assert_eq!(vidsurface_consumer_update(consumer, 0, &mut frame), OK);
        assert_eq!(frame.ready, 0);
        assert_eq!((frame.width, frame.height), (640, 360));

        let mut session = 0u64;
        assert_eq!(
            vidsurface_start_decoding(controller, locator.as_ptr(), &mut session),
            OK
        );
        assert_eq!(vidsurface_consumer_attach(consumer, controller, session), OK);
        assert_eq!(vidsurface_consumer_session(consumer), session);
        // The texture is handed out once.
        assert_eq!(vidsurface_consumer_attach(consumer, controller, session), INTERNAL);

        let mut latched = None;
        for _ in 0..50 {
            assert_eq!(vidsurface_consumer_update(consumer, 100, &mut frame), OK);
            if frame.ready == 1 {
                latched = Some(frame);
                break;
            }
        }
        let latched = latched.expect("no frame latched");
        assert_eq!((latched.width, latched.height), (176, 144));
        assert_eq!(latched.transform[15], 1.0);

        assert_eq!(vidsurface_stop_decoding(controller), OK);
        assert_eq!(vidsurface_consumer_destroy(&mut consumer), OK);
        assert!(consumer.is_null());
        vidsurface_controller_destroy(&mut controller);
    }
}

#[test]
fn consumer_update_null_out_frame() {
    unsafe {
        let mut controller = create_controller();
        let mut consumer: *mut VidsurfaceConsumer = ptr::null_mut();
        assert_eq!(vidsurface_consumer_create(controller, &mut consumer), OK);
        assert_eq!(vidsurface_consumer_update(consumer, 0, ptr::null_mut()), NULL_PTR);
        assert_eq!(vidsurface_consumer_update(ptr::null_mut(), 0, ptr::null_mut()), NULL_PTR);
        vidsurface_consumer_destroy(&mut consumer);
        vidsurface_controller_destroy(&mut controller);
    }
}

// =========================================================================
// Diagnostics
// =========================================================================

#[test]
fn diagnostics_count_handles() {
    unsafe {
        let mut controller = create_controller();
        let mut snap = VidsurfaceDiagnostics::default();
        assert_eq!(vidsurface_diagnostics_snapshot(&mut snap), OK);
        assert!(snap.controllers_created >= 1);
        assert!(snap.controllers_live >= 1);
        assert!(snap.ffi_calls >= 2);

        vidsurface_controller_destroy(&mut controller);
        let mut after = VidsurfaceDiagnostics::default();
        assert_eq!(vidsurface_diagnostics_snapshot(&mut after), OK);
        assert!(after.controllers_destroyed >= 1);
    }
}
