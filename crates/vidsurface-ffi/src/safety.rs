//! Panic containment for the C entry points.
//!
//! A panic must never unwind into C. Status-returning entry points run
//! inside [`ffi_boundary`], which folds both `Err` and a caught panic into
//! an [`ErrorCode`]; the rest use [`ffi_boundary_or`] with a fallback value.
//! Both count the call in [`crate::diagnostics`].

use std::panic::{catch_unwind, AssertUnwindSafe};

use vidsurface_core::ErrorCode;

/// Runs a status-returning entry point body. A panic becomes `INTERNAL`.
///
/// Controller and consumer state sits behind `parking_lot` locks, which are
/// released on unwind without poisoning, so asserting unwind safety is sound
/// for every body in this crate.
pub fn ffi_boundary<F>(body: F) -> i32
where
    F: FnOnce() -> Result<(), ErrorCode>,
{
    crate::diagnostics::record_ffi_call();
    let status = match catch_unwind(AssertUnwindSafe(body)) {
        Ok(result) => result.err().unwrap_or(ErrorCode::Ok),
        Err(_) => {
            tracing::error!("FFI: caught Rust panic at FFI boundary");
            ErrorCode::Internal
        }
    };
    status.as_raw()
}

/// Runs an entry point body that returns a plain value, yielding `fallback`
/// if it panics.
pub fn ffi_boundary_or<T, F>(fallback: T, body: F) -> T
where
    F: FnOnce() -> T,
{
    crate::diagnostics::record_ffi_call();
    catch_unwind(AssertUnwindSafe(body)).unwrap_or_else(|_| {
        tracing::error!("FFI: caught Rust panic at FFI boundary");
        fallback
    })
}

/// Turns a consumer pointer into `&mut`, or returns `Err(NullPtr)` from the
/// enclosing function.
///
/// # Safety
/// A non-null pointer must come from `vidsurface_consumer_create`, not yet
/// destroyed, and used by one caller at a time.
#[macro_export]
macro_rules! check_not_null_mut {
    ($ptr:expr) => {
        match $ptr {
            p if p.is_null() => return Err(::vidsurface_core::ErrorCode::NullPtr),
            p => unsafe { &mut *p },
        }
    };
}
