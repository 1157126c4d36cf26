//! FFI safety diagnostics: handle registries and call metrics.
//!
//! **Registries** hold the addresses of live controllers and consumers.
//! Destroy entry points free only registered addresses, so a repeated destroy
//! reports an error code. Controller entry points also check the registry
//! before dereferencing, which refuses handles that were never created or
//! already destroyed.
//!
//! An address reused by the allocator for a newer handle passes the check;
//! the registry cannot tell the two apart.
//!
//! **Metrics** are relaxed atomic counters exposed via [`snapshot`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;

use parking_lot::Mutex;

// =========================================================================
// Registries
// =========================================================================

static CONTROLLER_REGISTRY: LazyLock<Mutex<HashSet<usize>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

static CONSUMER_REGISTRY: LazyLock<Mutex<HashSet<usize>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

/// Registers a controller pointer. Returns `false` if already registered (bug).
pub fn register_controller(ptr: *const u8) -> bool {
    let inserted = CONTROLLER_REGISTRY.lock().insert(ptr as usize);
    if inserted {
        METRICS.controllers_created.fetch_add(1, Ordering::Relaxed);
    }
    inserted
}

/// Unregisters a controller pointer. Returns `false` if unknown (double-free attempt).
pub fn unregister_controller(ptr: *const u8) -> bool {
    let removed = CONTROLLER_REGISTRY.lock().remove(&(ptr as usize));
    if removed {
        METRICS.controllers_destroyed.fetch_add(1, Ordering::Relaxed);
    }
    removed
}

/// Whether `ptr` was created and not yet destroyed.
pub fn is_live_controller(ptr: *const u8) -> bool {
    CONTROLLER_REGISTRY.lock().contains(&(ptr as usize))
}

pub fn register_consumer(ptr: *const u8) -> bool {
    let inserted = CONSUMER_REGISTRY.lock().insert(ptr as usize);
    if inserted {
        METRICS.consumers_created.fetch_add(1, Ordering::Relaxed);
    }
    inserted
}

pub fn unregister_consumer(ptr: *const u8) -> bool {
    let removed = CONSUMER_REGISTRY.lock().remove(&(ptr as usize));
    if removed {
        METRICS.consumers_destroyed.fetch_add(1, Ordering::Relaxed);
    }
    removed
}

// =========================================================================
// Metrics
// =========================================================================

#[derive(Default)]
struct FfiMetrics {
    controllers_created: AtomicU64,
    controllers_destroyed: AtomicU64,
    consumers_created: AtomicU64,
    consumers_destroyed: AtomicU64,
    sessions_started: AtomicU64,
    start_failures: AtomicU64,
    frames_refreshed: AtomicU64,
    ffi_calls: AtomicU64,
}

static METRICS: LazyLock<FfiMetrics> = LazyLock::new(FfiMetrics::default);

pub fn record_ffi_call() {
    METRICS.ffi_calls.fetch_add(1, Ordering::Relaxed);
}

pub fn record_start(ok: bool) {
    let counter = if ok {
        &METRICS.sessions_started
    } else {
        &METRICS.start_failures
    };
    counter.fetch_add(1, Ordering::Relaxed);
}

pub fn record_frame_refreshed() {
    METRICS.frames_refreshed.fetch_add(1, Ordering::Relaxed);
}

/// Snapshot of all counters, layout-compatible with C.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct VidsurfaceDiagnostics {
    pub controllers_created: u64,
    pub controllers_destroyed: u64,
    pub controllers_live: u64,
    pub consumers_created: u64,
    pub consumers_destroyed: u64,
    pub consumers_live: u64,
    pub sessions_started: u64,
    pub start_failures: u64,
    pub frames_refreshed: u64,
    pub ffi_calls: u64,
}

pub fn snapshot() -> VidsurfaceDiagnostics {
    VidsurfaceDiagnostics {
        controllers_created: METRICS.controllers_created.load(Ordering::Relaxed),
        controllers_destroyed: METRICS.controllers_destroyed.load(Ordering::Relaxed),
        controllers_live: CONTROLLER_REGISTRY.lock().len() as u64,
        consumers_created: METRICS.consumers_created.load(Ordering::Relaxed),
        consumers_destroyed: METRICS.consumers_destroyed.load(Ordering::Relaxed),
        consumers_live: CONSUMER_REGISTRY.lock().len() as u64,
        sessions_started: METRICS.sessions_started.load(Ordering::Relaxed),
        start_failures: METRICS.start_failures.load(Ordering::Relaxed),
        frames_refreshed: METRICS.frames_refreshed.load(Ordering::Relaxed),
        ffi_calls: METRICS.ffi_calls.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_rejects_double_unregister() {
        let value = 7u8;
        let ptr = &value as *const u8;
        assert!(register_consumer(ptr));
        assert!(!register_consumer(ptr));
        assert!(unregister_consumer(ptr));
        assert!(!unregister_consumer(ptr));
    }

    #[test]
    fn test_controller_liveness_follows_registry() {
        let value = 9u8;
        let ptr = &value as *const u8;
        assert!(!is_live_controller(ptr));
        assert!(register_controller(ptr));
        assert!(is_live_controller(ptr));
        assert!(unregister_controller(ptr));
        assert!(!is_live_controller(ptr));
    }
}
