//! Software reference decoder.
//!
//! A pass-through [`DecoderEngine`]: every compressed input becomes one
//! output frame carrying the same payload and timestamp. It keeps the
//! hardware decoder's contract (slot ownership, format changes, draining,
//! backpressure) so the decode loop can be exercised without a device.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::codec::{CodecState, DecoderEngine, OutputEvent, ProducerHandle};
use crate::config::ReferenceDecoderConfig;
use crate::surface::{BufferQueueProducer, QueuedFrame};
use crate::video::{BufferFlags, BufferInfo, OutputFormat, TrackInfo, VideoError};

struct PendingInput {
    slot: usize,
    size: usize,
    pts_us: i64,
    flags: BufferFlags,
}

enum OutputSlot {
    Free,
    Dequeued { info: BufferInfo, payload: Bytes },
}

/// Pass-through decoder rendering into a [`BufferQueueSurface`](crate::surface::BufferQueueSurface).
pub struct ReferenceDecoder {
    config: ReferenceDecoderConfig,
    state: CodecState,
    track: Option<TrackInfo>,
    producer: Option<Arc<BufferQueueProducer>>,
    inputs: Vec<Vec<u8>>,
    free_inputs: VecDeque<usize>,
    dequeued_inputs: Vec<bool>,
    pending: VecDeque<PendingInput>,
    outputs: Vec<OutputSlot>,
    format: Option<OutputFormat>,
    format_announced: bool,
    frames_rendered: u64,
    /// Wall-clock instant and pts of the first paced frame
    clock: Option<(Instant, i64)>,
}

impl ReferenceDecoder {
    pub fn new(config: ReferenceDecoderConfig) -> Self {
        Self {
            config,
            state: CodecState::Uninitialized,
            track: None,
            producer: None,
            inputs: Vec::new(),
            free_inputs: VecDeque::new(),
            dequeued_inputs: Vec::new(),
            pending: VecDeque::new(),
            outputs: Vec::new(),
            format: None,
            format_announced: false,
            frames_rendered: 0,
            clock: None,
        }
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    fn reset_slots(&mut self) {
        self.inputs = (0..self.config.input_slots)
            .map(|_| vec![0u8; self.config.input_capacity])
            .collect();
        self.free_inputs = (0..self.config.input_slots).collect();
        self.dequeued_inputs = vec![false; self.config.input_slots];
        self.pending.clear();
        self.outputs = (0..self.config.output_slots).map(|_| OutputSlot::Free).collect();
        self.format_announced = false;
        self.clock = None;
    }

    /// In realtime mode, whether a frame at `pts_us` may be output yet.
    fn is_due(&mut self, pts_us: i64) -> bool {
        if !self.config.realtime {
            return true;
        }
        let now = Instant::now();
        let (anchor, anchor_pts) = *self.clock.get_or_insert((now, pts_us));
        let offset = pts_us.saturating_sub(anchor_pts).max(0) as u64;
        now >= anchor + Duration::from_micros(offset)
    }

    fn free_output_slot(&self) -> Option<usize> {
        self.outputs
            .iter()
            .position(|slot| matches!(slot, OutputSlot::Free))
    }

    /// Converts the next pending input into an output event, if possible.
    fn try_decode(&mut self) -> Option<OutputEvent> {
        loop {
            let front = self.pending.front()?;

            if front.flags.contains(BufferFlags::CODEC_CONFIG) {
                let Some(input) = self.pending.pop_front() else {
                    return None;
                };
                let announced = self.apply_codec_config(&input);
                self.free_inputs.push_back(input.slot);
                if let Some(event) = announced {
                    return Some(event);
                }
                continue;
            }

            if !self.format_announced {
                self.format_announced = true;
                if let Some(format) = self.format {
                    return Some(OutputEvent::FormatChanged(format));
                }
            }

            // Backpressure: every output slot is held by the caller.
            let index = self.free_output_slot()?;
            let (size, pts_us, flags) = (front.size, front.pts_us, front.flags);
            if size > 0 && !flags.is_end_of_stream() && !self.is_due(pts_us) {
                return None;
            }
            let input = self.pending.pop_front()?;
            let payload = Bytes::copy_from_slice(&self.inputs[input.slot][..input.size]);
            self.free_inputs.push_back(input.slot);

            let info = BufferInfo {
                offset: 0,
                size: input.size,
                presentation_time_us: input.pts_us,
                flags: input.flags,
            };
            self.outputs[index] = OutputSlot::Dequeued { info, payload };
            return Some(OutputEvent::Ready { index, info });
        }
    }

    /// Codec config samples carry the new coded size as two little-endian u32s.
    fn apply_codec_config(&mut self, input: &PendingInput) -> Option<OutputEvent> {
        if input.size < 8 {
            return None;
        }
        let data = &self.inputs[input.slot];
        let width = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let height = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        if width == 0 || height == 0 {
            return None;
        }
        if self.format.map(|f| (f.width, f.height)) == Some((width, height)) {
            return None;
        }
        let mut format = OutputFormat::new(width, height);
        if let Some(current) = self.format {
            format.rotation = current.rotation;
        }
        tracing::debug!("ReferenceDecoder: codec config {width}x{height}");
        self.format = Some(format);
        self.format_announced = true;
        Some(OutputEvent::FormatChanged(format))
    }
}

impl Default for ReferenceDecoder {
    fn default() -> Self {
        Self::new(ReferenceDecoderConfig::default())
    }
}

impl DecoderEngine for ReferenceDecoder {
    fn configure(&mut self, track: &TrackInfo, producer: &ProducerHandle) -> Result<(), VideoError> {
        if !self.state.can_transition_to(CodecState::Configured) {
            return Err(VideoError::IllegalState(format!(
                "configure not allowed in state {:?}",
                self.state
            )));
        }
        if !track.format.is_video() {
            return Err(VideoError::ConfigureFailure(format!(
                "unsupported mime {}",
                track.format.mime
            )));
        }
        let producer = producer.downcast::<BufferQueueProducer>().ok_or_else(|| {
            VideoError::ConfigureFailure("output surface is not a buffer queue".into())
        })?;
        if producer.is_abandoned() {
            return Err(VideoError::ConfigureFailure(
                "output surface already released".into(),
            ));
        }

        let mut format = OutputFormat::new(track.format.width, track.format.height);
        format.rotation = track.format.rotation;
        self.format = Some(format);
        self.track = Some(track.clone());
        self.producer = Some(producer);
        self.reset_slots();
        self.state.transition(CodecState::Configured, "configure")?;
        tracing::debug!(
            "ReferenceDecoder: configured {} {}x{}",
            track.format.mime,
            track.format.width,
            track.format.height
        );
        Ok(())
    }

    fn start(&mut self) -> Result<(), VideoError> {
        self.state.transition(CodecState::Running, "start")
    }

    fn dequeue_input(&mut self, timeout: Duration) -> Result<Option<usize>, VideoError> {
        self.state.require_executing("dequeue_input")?;
        if self.state == CodecState::Draining {
            return Ok(None);
        }
        match self.free_inputs.pop_front() {
            Some(index) => {
                self.dequeued_inputs[index] = true;
                Ok(Some(index))
            }
            None => {
                std::thread::sleep(timeout);
                Ok(None)
            }
        }
    }

    fn input_buffer(&mut self, index: usize) -> Result<&mut [u8], VideoError> {
        self.state.require_executing("input_buffer")?;
        if !self.dequeued_inputs.get(index).copied().unwrap_or(false) {
            return Err(VideoError::IllegalState(format!(
                "input slot {index} is not dequeued"
            )));
        }
        Ok(&mut self.inputs[index])
    }

    fn queue_input(
        &mut self,
        index: usize,
        size: usize,
        pts_us: i64,
        flags: BufferFlags,
    ) -> Result<(), VideoError> {
        if self.state != CodecState::Running {
            return Err(VideoError::IllegalState(format!(
                "queue_input not allowed in state {:?}",
                self.state
            )));
        }
        if !self.dequeued_inputs.get(index).copied().unwrap_or(false) {
            return Err(VideoError::IllegalState(format!(
                "input slot {index} is not dequeued"
            )));
        }
        if size > self.config.input_capacity {
            return Err(VideoError::IllegalState(format!(
                "input size {size} exceeds slot capacity {}",
                self.config.input_capacity
            )));
        }

        self.dequeued_inputs[index] = false;
        self.pending.push_back(PendingInput {
            slot: index,
            size,
            pts_us,
            flags,
        });
        if flags.is_end_of_stream() {
            self.state.transition(CodecState::Draining, "queue_input")?;
            tracing::debug!("ReferenceDecoder: input end of stream queued");
        }
        Ok(())
    }

    fn dequeue_output(&mut self, timeout: Duration) -> Result<OutputEvent, VideoError> {
        self.state.require_executing("dequeue_output")?;
        match self.try_decode() {
            Some(event) => Ok(event),
            None => {
                std::thread::sleep(timeout);
                Ok(OutputEvent::TryAgainLater)
            }
        }
    }

    fn output_format(&self) -> Option<OutputFormat> {
        self.format
    }

    fn release_output(&mut self, index: usize, render: bool) -> Result<(), VideoError> {
        self.state.require_executing("release_output")?;
        let slot = self
            .outputs
            .get_mut(index)
            .map(|slot| std::mem::replace(slot, OutputSlot::Free));
        let Some(OutputSlot::Dequeued { info, payload }) = slot else {
            return Err(VideoError::IllegalState(format!(
                "output slot {index} is not dequeued"
            )));
        };

        if !render || info.size == 0 {
            return Ok(());
        }
        let (Some(producer), Some(format)) = (&self.producer, self.format) else {
            return Err(VideoError::IllegalState("decoder has no output surface".into()));
        };
        producer.queue_frame(QueuedFrame {
            pts_us: info.presentation_time_us,
            width: format.width,
            height: format.height,
            crop: format.crop,
            rotation: format.rotation,
            payload,
        })?;
        self.frames_rendered += 1;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), VideoError> {
        self.state.transition(CodecState::Stopped, "stop")?;
        self.pending.clear();
        self.free_inputs.clear();
        self.outputs.clear();
        Ok(())
    }

    fn release(&mut self) {
        if self.state == CodecState::Released {
            return;
        }
        self.state = CodecState::Released;
        self.pending.clear();
        self.inputs.clear();
        self.outputs.clear();
        self.producer = None;
        tracing::debug!(
            "ReferenceDecoder: released after {} rendered frames",
            self.frames_rendered
        );
    }

    fn state(&self) -> CodecState {
        self.state
    }
}
