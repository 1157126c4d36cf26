//! Tunables for decode sessions.
//!
//! Defaults are chosen for a single full-screen preview. Every field can be
//! overridden from the environment for field diagnostics without a rebuild.

use std::time::Duration;

/// Width used by the GPU consumer before any format is known.
pub const FALLBACK_WIDTH: u32 = 640;
/// Height used by the GPU consumer before any format is known.
pub const FALLBACK_HEIGHT: u32 = 360;

/// Configuration for the session controller and the decode loop.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeConfig {
    /// Timeout for each input/output dequeue on the decoder
    pub dequeue_timeout: Duration,
    /// How long `stop` waits for the decode thread before detaching it
    pub join_timeout: Duration,
    /// Maximum number of concurrently active sessions
    pub max_sessions: usize,
    /// Number of frames the consumer surface holds before dropping the oldest
    pub buffer_queue_depth: usize,
    /// Texture width reported by the GPU consumer until a frame is latched
    pub fallback_width: u32,
    /// Texture height reported by the GPU consumer until a frame is latched
    pub fallback_height: u32,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            dequeue_timeout: Duration::from_millis(10),
            join_timeout: Duration::from_secs(1),
            max_sessions: 1,
            buffer_queue_depth: 3,
            fallback_width: FALLBACK_WIDTH,
            fallback_height: FALLBACK_HEIGHT,
        }
    }
}

impl DecodeConfig {
    pub fn with_dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.dequeue_timeout = timeout;
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// Sets the session limit. Zero is raised to one.
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max.max(1);
        self
    }

    /// Sets the consumer queue depth. Zero is raised to one.
    pub fn with_buffer_queue_depth(mut self, depth: usize) -> Self {
        self.buffer_queue_depth = depth.max(1);
        self
    }

    pub fn with_fallback_size(mut self, width: u32, height: u32) -> Self {
        self.fallback_width = width;
        self.fallback_height = height;
        self
    }

    /// Builds a configuration from defaults plus environment overrides.
    ///
    /// Recognized variables:
    /// - `VIDSURFACE_DEQUEUE_TIMEOUT_MS`
    /// - `VIDSURFACE_JOIN_TIMEOUT_MS`
    /// - `VIDSURFACE_MAX_SESSIONS`
    /// - `VIDSURFACE_QUEUE_DEPTH`
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        Self::default().apply_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary key lookup.
    pub fn apply_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(ms) = parse_var::<u64, _>(&lookup, "VIDSURFACE_DEQUEUE_TIMEOUT_MS") {
            self = self.with_dequeue_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "VIDSURFACE_JOIN_TIMEOUT_MS") {
            self = self.with_join_timeout(Duration::from_millis(ms));
        }
        if let Some(max) = parse_var::<usize, _>(&lookup, "VIDSURFACE_MAX_SESSIONS") {
            self = self.with_max_sessions(max);
        }
        if let Some(depth) = parse_var::<usize, _>(&lookup, "VIDSURFACE_QUEUE_DEPTH") {
            self = self.with_buffer_queue_depth(depth);
        }
        self
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => {
            tracing::info!("{key} override: {raw}");
            Some(value)
        }
        Err(_) => {
            tracing::warn!("Ignoring {key}={raw:?}: not a valid number");
            None
        }
    }
}

/// Slot layout of the in-process reference decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceDecoderConfig {
    /// Number of input slots
    pub input_slots: usize,
    /// Number of output slots
    pub output_slots: usize,
    /// Capacity of each input slot in bytes
    pub input_capacity: usize,
    /// Hold each frame until its presentation time has elapsed
    pub realtime: bool,
}

impl Default for ReferenceDecoderConfig {
    fn default() -> Self {
        Self {
            input_slots: 4,
            output_slots: 4,
            input_capacity: 1024 * 1024,
            realtime: false,
        }
    }
}

impl ReferenceDecoderConfig {
    pub fn with_input_slots(mut self, slots: usize) -> Self {
        self.input_slots = slots.max(1);
        self
    }

    pub fn with_output_slots(mut self, slots: usize) -> Self {
        self.output_slots = slots.max(1);
        self
    }

    pub fn with_input_capacity(mut self, bytes: usize) -> Self {
        self.input_capacity = bytes.max(1);
        self
    }

    pub fn with_realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }
}
