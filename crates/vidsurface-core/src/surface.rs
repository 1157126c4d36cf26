//! GPU Consumer Surface.
//!
//! A consumer surface is a producer/consumer buffer queue. The decoder
//! renders into its producer end; the GPU thread latches the newest frame
//! into an external texture through the [`TextureRefresh`] capability. The
//! two ends never share anything but the queue, which synchronizes itself.
//!
//! [`BufferQueueSurface`] is the in-process implementation used with the
//! reference decoder.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::codec::ProducerHandle;
use crate::frame_signal::FrameNotifier;
use crate::video::{CropRect, Rotation, VideoError};

static NEXT_SURFACE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_TEXTURE_ID: AtomicU32 = AtomicU32::new(1);

/// Identity of a consumer surface preparation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceId(u64);

impl SurfaceId {
    pub fn next() -> Self {
        SurfaceId(NEXT_SURFACE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Name of an external texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureId(pub u32);

impl TextureId {
    pub fn next() -> Self {
        TextureId(NEXT_TEXTURE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Frame latched into the texture by [`TextureRefresh::update_tex_image`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatchedFrame {
    pub pts_us: i64,
    pub width: u32,
    pub height: u32,
    /// Sequence number of the frame within its surface, starting at 1
    pub frame_number: u64,
}

/// GPU-thread capability of a consumer surface.
///
/// Every method must be called on the thread that owns the GPU context.
pub trait TextureRefresh: Send {
    fn texture_id(&self) -> TextureId;

    /// Latches the newest queued frame into the texture.
    ///
    /// Returns `Ok(None)` when nothing new was queued since the last call.
    fn update_tex_image(&mut self) -> Result<Option<LatchedFrame>, VideoError>;

    /// Column-major texture coordinate transform of the latched frame.
    fn transform_matrix(&self) -> [f32; 16];

    /// Presentation timestamp of the latched frame, in microseconds.
    fn timestamp_us(&self) -> i64;

    /// Binds the texture to the calling thread's GPU context as texture `name`.
    ///
    /// Must be called on the GPU thread before the first refresh when the
    /// platform needs it.
    fn attach_to_context(&mut self, _name: u32) -> Result<(), VideoError> {
        Ok(())
    }
}

/// Decoder-facing side of the GPU consumer surface.
pub trait ConsumerSurface: Send {
    /// Allocates the texture identity and returns the producer handle.
    ///
    /// Calling it again while prepared returns the same producer.
    fn prepare(&mut self) -> Result<ProducerHandle, VideoError>;

    /// Sets the size of buffers allocated for the producer.
    fn update_default_buffer_size(&mut self, width: u32, height: u32) -> Result<(), VideoError>;

    /// Hands out the GPU capability. Returns `Some` once per preparation.
    fn take_texture(&mut self) -> Option<Box<dyn TextureRefresh>>;

    /// Tears down the producer and the texture binding.
    ///
    /// Safe when never prepared and when called more than once.
    fn release(&mut self);

    fn is_prepared(&self) -> bool;
}

/// A frame rendered into the buffer queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedFrame {
    pub pts_us: i64,
    /// Buffer width
    pub width: u32,
    /// Buffer height
    pub height: u32,
    pub crop: CropRect,
    pub rotation: Rotation,
    /// Frame content; stands in for the GPU buffer
    pub payload: Bytes,
}

enum CallbackEvent {
    FrameQueued,
    Shutdown,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<(u64, QueuedFrame)>,
    default_size: (u32, u32),
    abandoned: bool,
    queued: u64,
    dropped: u64,
    latched: u64,
}

/// Shared buffer queue between the producer and the texture.
struct BufferQueue {
    id: SurfaceId,
    depth: usize,
    state: Mutex<QueueState>,
    events: Sender<CallbackEvent>,
}

impl BufferQueue {
    fn abandon(&self) -> bool {
        let mut state = self.state.lock();
        let was_live = !state.abandoned;
        state.abandoned = true;
        state.pending.clear();
        was_live
    }
}

/// Producer end of a [`BufferQueueSurface`].
pub struct BufferQueueProducer {
    queue: Arc<BufferQueue>,
}

impl BufferQueueProducer {
    /// Queues a rendered frame, dropping the oldest pending one if the queue is full.
    ///
    /// Never blocks. Fails with `SurfaceAbandoned` after the surface was released.
    pub fn queue_frame(&self, frame: QueuedFrame) -> Result<(), VideoError> {
        {
            let mut state = self.queue.state.lock();
            if state.abandoned {
                return Err(VideoError::SurfaceAbandoned);
            }
            while state.pending.len() >= self.queue.depth {
                state.pending.pop_front();
                state.dropped += 1;
            }
            state.queued += 1;
            let number = state.queued;
            tracing::trace!(
                "surface {}: queued frame {number} pts={}us",
                self.queue.id.as_u64(),
                frame.pts_us
            );
            state.pending.push_back((number, frame));
        }
        // Signal after the queue lock is dropped.
        let _ = self.queue.events.send(CallbackEvent::FrameQueued);
        Ok(())
    }

    /// Default buffer size requested by the consumer, `(0, 0)` if never set.
    pub fn default_buffer_size(&self) -> (u32, u32) {
        self.queue.state.lock().default_size
    }

    pub fn is_abandoned(&self) -> bool {
        self.queue.state.lock().abandoned
    }

    pub fn surface_id(&self) -> SurfaceId {
        self.queue.id
    }
}

/// Read-only view of a buffer queue, usable from any thread.
#[derive(Clone)]
pub struct QueueObserver {
    queue: Arc<BufferQueue>,
}

impl QueueObserver {
    pub fn surface_id(&self) -> SurfaceId {
        self.queue.id
    }

    pub fn frames_queued(&self) -> u64 {
        self.queue.state.lock().queued
    }

    /// Frames dropped because the queue was full or a newer frame was latched.
    pub fn frames_dropped(&self) -> u64 {
        self.queue.state.lock().dropped
    }

    pub fn frames_latched(&self) -> u64 {
        self.queue.state.lock().latched
    }

    pub fn pending(&self) -> usize {
        self.queue.state.lock().pending.len()
    }

    pub fn default_buffer_size(&self) -> (u32, u32) {
        self.queue.state.lock().default_size
    }

    pub fn is_abandoned(&self) -> bool {
        self.queue.state.lock().abandoned
    }
}

/// Texture end of a [`BufferQueueSurface`].
pub struct BufferQueueTexture {
    queue: Arc<BufferQueue>,
    texture_id: TextureId,
    latched: Option<LatchedFrame>,
    transform: [f32; 16],
}

impl TextureRefresh for BufferQueueTexture {
    fn texture_id(&self) -> TextureId {
        self.texture_id
    }

    fn attach_to_context(&mut self, name: u32) -> Result<(), VideoError> {
        self.texture_id = TextureId(name);
        Ok(())
    }

    fn update_tex_image(&mut self) -> Result<Option<LatchedFrame>, VideoError> {
        let mut state = self.queue.state.lock();
        if state.abandoned {
            return Err(VideoError::SurfaceAbandoned);
        }
        let Some((number, frame)) = state.pending.pop_back() else {
            return Ok(None);
        };
        let skipped = state.pending.len() as u64;
        state.pending.clear();
        state.dropped += skipped;
        state.latched += 1;
        drop(state);

        self.transform = transform_matrix(frame.width, frame.height, frame.crop, frame.rotation);
        let latched = LatchedFrame {
            pts_us: frame.pts_us,
            width: frame.crop.width(),
            height: frame.crop.height(),
            frame_number: number,
        };
        self.latched = Some(latched);
        Ok(Some(latched))
    }

    fn transform_matrix(&self) -> [f32; 16] {
        self.transform
    }

    fn timestamp_us(&self) -> i64 {
        self.latched.map(|f| f.pts_us).unwrap_or(0)
    }
}

struct Prepared {
    queue: Arc<BufferQueue>,
    producer: ProducerHandle,
    texture: Option<BufferQueueTexture>,
    callback: Option<JoinHandle<()>>,
}

/// In-process consumer surface backed by a software buffer queue.
///
/// Each queued frame posts an event to a dedicated callback thread, which
/// raises the frame-available signal. The callback thread never touches
/// the texture.
pub struct BufferQueueSurface {
    notifier: FrameNotifier,
    depth: usize,
    prepared: Option<Prepared>,
    observer: Option<QueueObserver>,
}

impl BufferQueueSurface {
    /// Creates an unprepared surface holding at most `depth` pending frames.
    pub fn new(notifier: FrameNotifier, depth: usize) -> Self {
        Self {
            notifier,
            depth: depth.max(1),
            prepared: None,
            observer: None,
        }
    }

    /// Observer of the current (or last) preparation's queue.
    pub fn observer(&self) -> Option<QueueObserver> {
        self.observer.clone()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    fn spawn_callback_thread(
        &self,
        id: SurfaceId,
        events: Receiver<CallbackEvent>,
    ) -> Result<JoinHandle<()>, VideoError> {
        let notifier = self.notifier.clone();
        thread::Builder::new()
            .name("vidsurface-frame-cb".into())
            .spawn(move || {
                while let Ok(event) = events.recv() {
                    match event {
                        CallbackEvent::FrameQueued => {
                            notifier.notify();
                        }
                        CallbackEvent::Shutdown => break,
                    }
                }
                tracing::trace!("surface {}: callback thread exiting", id.as_u64());
            })
            .map_err(|e| VideoError::ThreadSpawn(e.to_string()))
    }
}

impl ConsumerSurface for BufferQueueSurface {
    fn prepare(&mut self) -> Result<ProducerHandle, VideoError> {
        if let Some(prepared) = &self.prepared {
            return Ok(prepared.producer.clone());
        }

        let id = SurfaceId::next();
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let queue = Arc::new(BufferQueue {
            id,
            depth: self.depth,
            state: Mutex::new(QueueState::default()),
            events: events_tx,
        });
        let callback = self.spawn_callback_thread(id, events_rx)?;

        let producer = ProducerHandle::new(
            id,
            Arc::new(BufferQueueProducer {
                queue: Arc::clone(&queue),
            }),
        );
        let texture = BufferQueueTexture {
            queue: Arc::clone(&queue),
            texture_id: TextureId::next(),
            latched: None,
            transform: transform_matrix(1, 1, CropRect::full(1, 1), Rotation::R0),
        };
        tracing::debug!(
            "surface {}: prepared (texture {}, depth {})",
            id.as_u64(),
            texture.texture_id.0,
            self.depth
        );

        self.observer = Some(QueueObserver {
            queue: Arc::clone(&queue),
        });
        self.prepared = Some(Prepared {
            queue,
            producer: producer.clone(),
            texture: Some(texture),
            callback: Some(callback),
        });
        Ok(producer)
    }

    fn update_default_buffer_size(&mut self, width: u32, height: u32) -> Result<(), VideoError> {
        let Some(prepared) = &self.prepared else {
            return Err(VideoError::IllegalState(
                "default buffer size set on unprepared surface".into(),
            ));
        };
        let mut state = prepared.queue.state.lock();
        if state.abandoned {
            return Err(VideoError::SurfaceAbandoned);
        }
        state.default_size = (width, height);
        tracing::debug!(
            "surface {}: default buffer size {width}x{height}",
            prepared.queue.id.as_u64()
        );
        Ok(())
    }

    fn take_texture(&mut self) -> Option<Box<dyn TextureRefresh>> {
        let texture = self.prepared.as_mut()?.texture.take()?;
        Some(Box::new(texture))
    }

    fn release(&mut self) {
        let Some(mut prepared) = self.prepared.take() else {
            return;
        };
        if prepared.queue.abandon() {
            tracing::debug!("surface {}: released", prepared.queue.id.as_u64());
        }
        let _ = prepared.queue.events.send(CallbackEvent::Shutdown);
        if let Some(handle) = prepared.callback.take() {
            let _ = handle.join();
        }
    }

    fn is_prepared(&self) -> bool {
        self.prepared.is_some()
    }
}

impl Drop for BufferQueueSurface {
    fn drop(&mut self) {
        self.release();
    }
}

/// Multiplies two column-major 4x4 matrices (`a * b`).
fn mat4_mul(a: &[f32; 16], b: &[f32; 16]) -> [f32; 16] {
    let mut out = [0.0f32; 16];
    for col in 0..4 {
        for row in 0..4 {
            out[col * 4 + row] = (0..4).map(|k| a[k * 4 + row] * b[col * 4 + k]).sum();
        }
    }
    out
}

const IDENTITY: [f32; 16] = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0,
];

const FLIP_V: [f32; 16] = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, -1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 1.0, 0.0, 1.0,
];

const ROT_90: [f32; 16] = [
    0.0, 1.0, 0.0, 0.0, //
    -1.0, 0.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    1.0, 0.0, 0.0, 1.0,
];

const ROT_180: [f32; 16] = [
    -1.0, 0.0, 0.0, 0.0, //
    0.0, -1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    1.0, 1.0, 0.0, 1.0,
];

/// Texture coordinate transform for a buffer with the given crop and rotation.
///
/// Composes rotation, then the crop scale/offset relative to the buffer size,
/// then a vertical flip into GL texture space. An empty crop is treated as
/// the full buffer.
pub fn transform_matrix(
    buffer_width: u32,
    buffer_height: u32,
    crop: CropRect,
    rotation: Rotation,
) -> [f32; 16] {
    let rotate = match rotation {
        Rotation::R0 => IDENTITY,
        Rotation::R90 => ROT_90,
        Rotation::R180 => ROT_180,
        Rotation::R270 => mat4_mul(&ROT_180, &ROT_90),
    };

    let (bw, bh) = (buffer_width.max(1) as f32, buffer_height.max(1) as f32);
    let crop = if crop.is_empty() {
        CropRect::full(buffer_width.max(1), buffer_height.max(1))
    } else {
        crop
    };
    let sx = crop.width() as f32 / bw;
    let sy = crop.height() as f32 / bh;
    let tx = crop.left as f32 / bw;
    let ty = (bh - crop.bottom as f32) / bh;
    let crop_matrix = [
        sx, 0.0, 0.0, 0.0, //
        0.0, sy, 0.0, 0.0, //
        0.0, 0.0, 1.0, 0.0, //
        tx, ty, 0.0, 1.0,
    ];

    mat4_mul(&FLIP_V, &mat4_mul(&crop_matrix, &rotate))
}
