//! Decoder Engine contract.
//!
//! A decoder exposes two independent queues. Compressed samples go into
//! input slots; decoded frames come out of output slots and are released
//! either to the consumer surface (render) or discarded. Both dequeue calls
//! are bounded by a timeout and report "nothing available" instead of
//! blocking indefinitely.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use crate::surface::SurfaceId;
use crate::video::{BufferFlags, BufferInfo, CompressedSample, OutputFormat, TrackInfo, VideoError};

/// Lifecycle of a decoder.
///
/// ```text
/// Uninitialized -> Configured -> Running -> Draining -> Stopped -> Released
///                      ^                                  |
///                      +----------- configure ------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecState {
    Uninitialized,
    Configured,
    Running,
    /// End of stream was queued on the input side; output is still flowing
    Draining,
    Stopped,
    Released,
}

impl CodecState {
    /// Returns true if `next` is reachable from `self` in one step.
    pub fn can_transition_to(self, next: CodecState) -> bool {
        use CodecState::*;
        matches!(
            (self, next),
            (Uninitialized | Stopped, Configured)
                | (Configured, Running)
                | (Running, Draining)
                | (Configured | Running | Draining | Stopped, Stopped)
                | (_, Released)
        )
    }

    /// Moves to `next`, or fails with `IllegalState` naming the operation.
    pub fn transition(&mut self, next: CodecState, op: &str) -> Result<(), VideoError> {
        if !self.can_transition_to(next) {
            return Err(VideoError::IllegalState(format!(
                "{op} not allowed in state {self:?}"
            )));
        }
        *self = next;
        Ok(())
    }

    /// Returns true while buffers can be exchanged.
    pub fn is_executing(self) -> bool {
        matches!(self, CodecState::Running | CodecState::Draining)
    }

    /// Fails with `IllegalState` unless the decoder is executing.
    pub fn require_executing(self, op: &str) -> Result<(), VideoError> {
        if self.is_executing() {
            Ok(())
        } else {
            Err(VideoError::IllegalState(format!(
                "{op} not allowed in state {self:?}"
            )))
        }
    }
}

/// Result of polling the output side.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputEvent {
    /// A decoded frame is held in output slot `index`
    Ready { index: usize, info: BufferInfo },
    /// Nothing became available within the timeout
    TryAgainLater,
    /// The output format changed; the consumer must resize
    FormatChanged(OutputFormat),
    /// Legacy notification that the output buffer set was reallocated
    BuffersChanged,
}

/// Result of [`DecoderEngine::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submit {
    Accepted,
    /// No input slot became free within the timeout
    Backpressure,
}

/// Type-erased producer endpoint of a consumer surface.
///
/// Surfaces hand one out from `prepare`; decoders downcast it to the
/// producer type they know how to render into.
#[derive(Clone)]
pub struct ProducerHandle {
    surface_id: SurfaceId,
    producer: Arc<dyn Any + Send + Sync>,
}

impl ProducerHandle {
    pub fn new<T: Any + Send + Sync>(surface_id: SurfaceId, producer: Arc<T>) -> Self {
        Self {
            surface_id,
            producer,
        }
    }

    pub fn surface_id(&self) -> SurfaceId {
        self.surface_id
    }

    /// Returns the producer if it is of type `T`.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.producer).downcast::<T>().ok()
    }
}

impl std::fmt::Debug for ProducerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerHandle")
            .field("surface_id", &self.surface_id)
            .finish_non_exhaustive()
    }
}

/// A dual-queue video decoder bound to a consumer surface.
///
/// Implementations are moved onto the decode thread after `start` and are
/// then used from that thread only.
pub trait DecoderEngine: Send {
    /// Binds the decoder to a track and to the surface it renders into.
    fn configure(&mut self, track: &TrackInfo, producer: &ProducerHandle) -> Result<(), VideoError>;

    /// Moves from Configured to Running.
    fn start(&mut self) -> Result<(), VideoError>;

    /// Acquires a free input slot, waiting at most `timeout`.
    fn dequeue_input(&mut self, timeout: Duration) -> Result<Option<usize>, VideoError>;

    /// Returns the writable memory of a dequeued input slot.
    fn input_buffer(&mut self, index: usize) -> Result<&mut [u8], VideoError>;

    /// Submits `size` bytes of a filled input slot.
    ///
    /// A zero-size submission with `END_OF_STREAM` starts draining.
    fn queue_input(
        &mut self,
        index: usize,
        size: usize,
        pts_us: i64,
        flags: BufferFlags,
    ) -> Result<(), VideoError>;

    /// Polls the output side, waiting at most `timeout`.
    fn dequeue_output(&mut self, timeout: Duration) -> Result<OutputEvent, VideoError>;

    /// The most recently reported output format.
    fn output_format(&self) -> Option<OutputFormat>;

    /// Returns an output slot, rendering it to the surface when `render` is true.
    fn release_output(&mut self, index: usize, render: bool) -> Result<(), VideoError>;

    /// Stops the decoder, invalidating all slots.
    fn stop(&mut self) -> Result<(), VideoError>;

    /// Frees the decoder. Safe to call more than once.
    fn release(&mut self);

    fn state(&self) -> CodecState;

    /// Copies one sample into a free input slot.
    fn submit(&mut self, sample: &CompressedSample, timeout: Duration) -> Result<Submit, VideoError> {
        let Some(index) = self.dequeue_input(timeout)? else {
            return Ok(Submit::Backpressure);
        };
        let buf = self.input_buffer(index)?;
        if sample.data.len() > buf.len() {
            return Err(VideoError::DecodeLoopFault(format!(
                "sample of {} bytes does not fit input slot of {} bytes",
                sample.data.len(),
                buf.len()
            )));
        }
        buf[..sample.data.len()].copy_from_slice(&sample.data);
        self.queue_input(index, sample.data.len(), sample.pts_us, sample.flags)?;
        Ok(Submit::Accepted)
    }
}

impl DecoderEngine for Box<dyn DecoderEngine> {
    fn configure(&mut self, track: &TrackInfo, producer: &ProducerHandle) -> Result<(), VideoError> {
        (**self).configure(track, producer)
    }

    fn start(&mut self) -> Result<(), VideoError> {
        (**self).start()
    }

    fn dequeue_input(&mut self, timeout: Duration) -> Result<Option<usize>, VideoError> {
        (**self).dequeue_input(timeout)
    }

    fn input_buffer(&mut self, index: usize) -> Result<&mut [u8], VideoError> {
        (**self).input_buffer(index)
    }

    fn queue_input(
        &mut self,
        index: usize,
        size: usize,
        pts_us: i64,
        flags: BufferFlags,
    ) -> Result<(), VideoError> {
        (**self).queue_input(index, size, pts_us, flags)
    }

    fn dequeue_output(&mut self, timeout: Duration) -> Result<OutputEvent, VideoError> {
        (**self).dequeue_output(timeout)
    }

    fn output_format(&self) -> Option<OutputFormat> {
        (**self).output_format()
    }

    fn release_output(&mut self, index: usize, render: bool) -> Result<(), VideoError> {
        (**self).release_output(index, render)
    }

    fn stop(&mut self) -> Result<(), VideoError> {
        (**self).stop()
    }

    fn release(&mut self) {
        (**self).release()
    }

    fn state(&self) -> CodecState {
        (**self).state()
    }
}
