//! Frame-Available Signal and the GPU-thread consumer.
//!
//! The signal is a level, not a queue: any number of notifications raised
//! before the GPU thread consumes one collapse into a single pending flag.
//! The two halves are split by capability. The callback thread can only
//! [`notify`](FrameNotifier::notify); the GPU thread can only take the
//! signal and refresh its texture.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::config::DecodeConfig;
use crate::surface::{TextureId, TextureRefresh};
use crate::video::VideoError;

#[derive(Debug, Default)]
struct SignalStats {
    raised: AtomicU64,
    coalesced: AtomicU64,
    consumed: AtomicU64,
}

/// Snapshot of signal counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalCounters {
    /// Notifications that raised the signal
    pub raised: u64,
    /// Notifications that found the signal already pending
    pub coalesced: u64,
    /// Signals taken by the GPU thread
    pub consumed: u64,
}

impl SignalStats {
    fn snapshot(&self) -> SignalCounters {
        SignalCounters {
            raised: self.raised.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            consumed: self.consumed.load(Ordering::Relaxed),
        }
    }
}

/// Creates a connected notifier/waiter pair.
pub fn frame_signal() -> (FrameNotifier, FrameWaiter) {
    let (tx, rx) = crossbeam_channel::bounded(1);
    let stats = Arc::new(SignalStats::default());
    (
        FrameNotifier {
            tx,
            stats: Arc::clone(&stats),
        },
        FrameWaiter { rx, stats },
    )
}

/// Raising half of the signal, held by surface callback threads.
#[derive(Clone)]
pub struct FrameNotifier {
    tx: Sender<()>,
    stats: Arc<SignalStats>,
}

impl FrameNotifier {
    /// Raises the signal. Returns true if it was not already pending.
    pub fn notify(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => {
                self.stats.raised.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(())) => {
                self.stats.coalesced.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Disconnected(())) => false,
        }
    }

    pub fn counters(&self) -> SignalCounters {
        self.stats.snapshot()
    }
}

/// Consuming half of the signal, held by the GPU thread.
#[derive(Clone)]
pub struct FrameWaiter {
    rx: Receiver<()>,
    stats: Arc<SignalStats>,
}

impl FrameWaiter {
    /// Consumes the pending signal without waiting.
    pub fn take(&self) -> bool {
        let taken = self.rx.try_recv().is_ok();
        if taken {
            self.stats.consumed.fetch_add(1, Ordering::Relaxed);
        }
        taken
    }

    /// Waits up to `timeout` for the signal and consumes it.
    pub fn wait(&self, timeout: Duration) -> bool {
        let taken = self.rx.recv_timeout(timeout).is_ok();
        if taken {
            self.stats.consumed.fetch_add(1, Ordering::Relaxed);
        }
        taken
    }

    pub fn is_pending(&self) -> bool {
        !self.rx.is_empty()
    }

    pub fn counters(&self) -> SignalCounters {
        self.stats.snapshot()
    }
}

/// Result of a texture refresh on the GPU thread.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameRefresh {
    pub texture_id: TextureId,
    pub pts_us: i64,
    /// Column-major transform to apply when sampling
    pub transform: [f32; 16],
    pub width: u32,
    pub height: u32,
}

/// GPU-thread consumer of a session's texture.
///
/// Not `Send`: it lives on the thread that owns the GPU context.
pub struct GpuConsumer {
    waiter: Option<FrameWaiter>,
    texture: Option<Box<dyn TextureRefresh>>,
    size: (u32, u32),
    refreshes: u64,
    last: Option<FrameRefresh>,
    _gpu_thread: PhantomData<*const ()>,
}

impl GpuConsumer {
    pub fn new(config: &DecodeConfig) -> Self {
        Self {
            waiter: None,
            texture: None,
            size: (config.fallback_width, config.fallback_height),
            refreshes: 0,
            last: None,
            _gpu_thread: PhantomData,
        }
    }

    /// Attaches a session's texture capability and its frame signal,
    /// replacing any previous session.
    pub fn attach(&mut self, texture: Box<dyn TextureRefresh>, waiter: FrameWaiter) {
        tracing::debug!("GpuConsumer: attached texture {}", texture.texture_id().0);
        self.texture = Some(texture);
        self.waiter = Some(waiter);
    }

    pub fn detach(&mut self) -> Option<Box<dyn TextureRefresh>> {
        self.waiter = None;
        self.texture.take()
    }

    pub fn is_attached(&self) -> bool {
        self.texture.is_some()
    }

    /// Consumes a pending signal and refreshes the texture.
    ///
    /// The transform matrix is read after the refresh so it matches the
    /// latched frame. Returns `None` if no signal was pending, no texture is
    /// attached, or nothing new was latched.
    pub fn update(&mut self) -> Option<FrameRefresh> {
        if !self.waiter.as_ref().is_some_and(FrameWaiter::take) {
            return None;
        }
        self.refresh()
    }

    /// Like [`update`](Self::update) but waits up to `timeout` for the signal.
    pub fn wait_and_update(&mut self, timeout: Duration) -> Option<FrameRefresh> {
        let Some(waiter) = &self.waiter else {
            std::thread::sleep(timeout);
            return None;
        };
        if !waiter.wait(timeout) {
            return None;
        }
        self.refresh()
    }

    fn refresh(&mut self) -> Option<FrameRefresh> {
        let texture = self.texture.as_mut()?;
        match texture.update_tex_image() {
            Ok(Some(latched)) => {
                let transform = texture.transform_matrix();
                if latched.width > 0 && latched.height > 0 {
                    self.size = (latched.width, latched.height);
                }
                let refresh = FrameRefresh {
                    texture_id: texture.texture_id(),
                    pts_us: latched.pts_us,
                    transform,
                    width: self.size.0,
                    height: self.size.1,
                };
                self.refreshes += 1;
                self.last = Some(refresh);
                tracing::trace!("GpuConsumer: latched pts={}us", latched.pts_us);
                Some(refresh)
            }
            Ok(None) => None,
            Err(VideoError::SurfaceAbandoned) => {
                tracing::debug!("GpuConsumer: surface abandoned, detaching texture");
                self.texture = None;
                None
            }
            Err(e) => {
                tracing::warn!("GpuConsumer: texture refresh failed: {e}");
                None
            }
        }
    }

    /// Texture size: the last latched frame's, or the configured fallback.
    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    pub fn refreshes(&self) -> u64 {
        self.refreshes
    }

    pub fn last_refresh(&self) -> Option<FrameRefresh> {
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::LatchedFrame;

    struct FakeTexture {
        next: Vec<LatchedFrame>,
        abandoned: bool,
    }

    impl TextureRefresh for FakeTexture {
        fn texture_id(&self) -> TextureId {
            TextureId(42)
        }

        fn update_tex_image(&mut self) -> Result<Option<LatchedFrame>, VideoError> {
            if self.abandoned {
                return Err(VideoError::SurfaceAbandoned);
            }
            Ok(self.next.pop())
        }

        fn transform_matrix(&self) -> [f32; 16] {
            [2.0; 16]
        }

        fn timestamp_us(&self) -> i64 {
            0
        }
    }

    #[test]
    fn test_notifications_coalesce() {
        let (notifier, waiter) = frame_signal();
        assert!(notifier.notify());
        assert!(!notifier.notify());
        assert!(!notifier.notify());

        assert!(waiter.take());
        assert!(!waiter.take());

        let counters = waiter.counters();
        assert_eq!(counters.raised, 1);
        assert_eq!(counters.coalesced, 2);
        assert_eq!(counters.consumed, 1);
    }

    #[test]
    fn test_notify_from_other_thread() {
        let (notifier, waiter) = frame_signal();
        let handle = std::thread::spawn(move || notifier.notify());
        assert!(waiter.wait(Duration::from_secs(1)));
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_update_without_signal() {
        let mut consumer = GpuConsumer::new(&DecodeConfig::default());
        assert!(consumer.update().is_none());
        assert_eq!(consumer.size(), (640, 360));
    }

    #[test]
    fn test_update_reads_transform_after_latch() {
        let (notifier, waiter) = frame_signal();
        let mut consumer = GpuConsumer::new(&DecodeConfig::default());
        consumer.attach(
            Box::new(FakeTexture {
                next: vec![LatchedFrame {
                    pts_us: 33_000,
                    width: 1280,
                    height: 720,
                    frame_number: 2,
                }],
                abandoned: false,
            }),
            waiter,
        );

        notifier.notify();
        let refresh = consumer.update().unwrap();
        assert_eq!(refresh.pts_us, 33_000);
        assert_eq!(refresh.transform, [2.0; 16]);
        assert_eq!((refresh.width, refresh.height), (1280, 720));
        assert_eq!(consumer.size(), (1280, 720));
        assert_eq!(consumer.refreshes(), 1);
    }

    #[test]
    fn test_abandoned_texture_is_detached() {
        let (notifier, waiter) = frame_signal();
        let mut consumer = GpuConsumer::new(&DecodeConfig::default());
        consumer.attach(
            Box::new(FakeTexture {
                next: Vec::new(),
                abandoned: true,
            }),
            waiter,
        );

        notifier.notify();
        assert!(consumer.update().is_none());
        assert!(!consumer.is_attached());
    }

    #[test]
    fn test_reattach_follows_new_session_signal() {
        let (old_notifier, old_waiter) = frame_signal();
        let (new_notifier, new_waiter) = frame_signal();
        let frame = LatchedFrame {
            pts_us: 0,
            width: 64,
            height: 64,
            frame_number: 1,
        };
        let mut consumer = GpuConsumer::new(&DecodeConfig::default());
        consumer.attach(
            Box::new(FakeTexture {
                next: vec![frame],
                abandoned: false,
            }),
            old_waiter,
        );
        consumer.attach(
            Box::new(FakeTexture {
                next: vec![frame],
                abandoned: false,
            }),
            new_waiter,
        );

        // A signal left behind by the previous session is not ours.
        old_notifier.notify();
        assert!(consumer.update().is_none());

        new_notifier.notify();
        assert!(consumer.update().is_some());
    }

    #[test]
    fn test_detached_consumer_ignores_signals() {
        let (notifier, waiter) = frame_signal();
        let mut consumer = GpuConsumer::new(&DecodeConfig::default());
        consumer.attach(
            Box::new(FakeTexture {
                next: Vec::new(),
                abandoned: false,
            }),
            waiter,
        );
        assert!(consumer.detach().is_some());
        notifier.notify();
        assert!(consumer.update().is_none());
        assert!(consumer.wait_and_update(Duration::from_millis(1)).is_none());
    }
}
