//! Decode Loop: the per-session background thread.
//!
//! The loop owns the session's source, decoder and surface exclusively.
//! Each iteration feeds at most one input slot and polls the output side
//! once, both with bounded waits, so cancellation is observed at least once
//! per dequeue timeout. Whatever ends the loop (output end of stream,
//! cancellation, an error or a panic), the same teardown runs on the decode
//! thread itself.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use crate::codec::{DecoderEngine, OutputEvent};
use crate::config::DecodeConfig;
use crate::source::SourceReader;
use crate::surface::ConsumerSurface;
use crate::video::{BufferFlags, VideoError};

/// The collaborators a running session owns.
pub struct SessionParts<S, D, F> {
    pub source: S,
    pub decoder: D,
    pub surface: F,
}

/// Commands delivered to a running loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopCommand {
    /// Resize the consumer surface's default buffer
    SetBufferSize { width: u32, height: u32 },
}

/// Why a decode loop ended.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopExit {
    /// The decoder reported end of stream on its output side
    EndOfStream,
    /// The cancellation flag was set
    Cancelled,
    /// An error or panic ended the loop
    Fault(VideoError),
}

/// Counters updated by the decode thread and readable from any thread.
#[derive(Debug, Default)]
pub struct DecodeStats {
    samples_submitted: AtomicU64,
    frames_rendered: AtomicU64,
    frames_discarded: AtomicU64,
    format_changes: AtomicU64,
    buffers_changed: AtomicU64,
}

/// Point-in-time copy of [`DecodeStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeStatsSnapshot {
    pub samples_submitted: u64,
    pub frames_rendered: u64,
    pub frames_discarded: u64,
    pub format_changes: u64,
    pub buffers_changed: u64,
}

impl DecodeStats {
    pub fn snapshot(&self) -> DecodeStatsSnapshot {
        DecodeStatsSnapshot {
            samples_submitted: self.samples_submitted.load(Ordering::Relaxed),
            frames_rendered: self.frames_rendered.load(Ordering::Relaxed),
            frames_discarded: self.frames_discarded.load(Ordering::Relaxed),
            format_changes: self.format_changes.load(Ordering::Relaxed),
            buffers_changed: self.buffers_changed.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// The decode loop of one session.
///
/// Dropping a loop (run or not) releases everything it owns.
pub struct DecodeLoop<S, D, F>
where
    S: SourceReader,
    D: DecoderEngine,
    F: ConsumerSurface,
{
    parts: SessionParts<S, D, F>,
    label: String,
    dequeue_timeout: Duration,
    cancel: Arc<AtomicBool>,
    stats: Arc<DecodeStats>,
    commands: Receiver<LoopCommand>,
    command_tx: Sender<LoopCommand>,
    input_done: bool,
    torn_down: bool,
}

impl<S, D, F> DecodeLoop<S, D, F>
where
    S: SourceReader,
    D: DecoderEngine,
    F: ConsumerSurface,
{
    /// Creates a loop over a configured and started decoder.
    pub fn new(label: impl Into<String>, parts: SessionParts<S, D, F>, config: &DecodeConfig) -> Self {
        let (command_tx, commands) = crossbeam_channel::unbounded();
        Self {
            parts,
            label: label.into(),
            dequeue_timeout: config.dequeue_timeout,
            cancel: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(DecodeStats::default()),
            commands,
            command_tx,
            input_done: false,
            torn_down: false,
        }
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn stats(&self) -> Arc<DecodeStats> {
        Arc::clone(&self.stats)
    }

    /// Sender for commands processed at the start of each iteration.
    pub fn commands(&self) -> Sender<LoopCommand> {
        self.command_tx.clone()
    }

    /// Runs the loop on the current thread until it ends, then tears down.
    pub fn run(mut self) -> LoopExit {
        tracing::debug!("{}: decode loop started", self.label);
        let exit = match catch_unwind(AssertUnwindSafe(|| self.drive())) {
            Ok(Ok(exit)) => exit,
            Ok(Err(e)) => {
                tracing::error!("{}: decode loop fault: {e}", self.label);
                LoopExit::Fault(VideoError::DecodeLoopFault(e.to_string()))
            }
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                tracing::error!("{}: decode loop panicked: {msg}", self.label);
                LoopExit::Fault(VideoError::DecodeLoopFault(format!("panic: {msg}")))
            }
        };
        match &exit {
            LoopExit::EndOfStream => tracing::info!("{}: end of stream", self.label),
            LoopExit::Cancelled => tracing::debug!("{}: cancelled", self.label),
            LoopExit::Fault(_) => {}
        }
        self.teardown();
        exit
    }

    fn drive(&mut self) -> Result<LoopExit, VideoError> {
        loop {
            if self.cancel.load(Ordering::Acquire) {
                return Ok(LoopExit::Cancelled);
            }
            self.apply_commands()?;
            if !self.input_done {
                self.feed_input()?;
            }
            if self.drain_output()? {
                return Ok(LoopExit::EndOfStream);
            }
        }
    }

    fn apply_commands(&mut self) -> Result<(), VideoError> {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                LoopCommand::SetBufferSize { width, height } => {
                    self.parts.surface.update_default_buffer_size(width, height)?;
                }
            }
        }
        Ok(())
    }

    /// Fills and submits at most one input slot.
    fn feed_input(&mut self) -> Result<(), VideoError> {
        let Some(index) = self.parts.decoder.dequeue_input(self.dequeue_timeout)? else {
            return Ok(());
        };
        let buf = self.parts.decoder.input_buffer(index)?;
        match self.parts.source.read_sample(buf)? {
            Some(size) => {
                let pts_us = self.parts.source.sample_time_us();
                let flags = self.parts.source.sample_flags();
                self.parts.decoder.queue_input(index, size, pts_us, flags)?;
                DecodeStats::bump(&self.stats.samples_submitted);
                tracing::trace!("{}: queued sample pts={pts_us}us size={size}", self.label);
                self.parts.source.advance();
            }
            None => {
                self.parts
                    .decoder
                    .queue_input(index, 0, 0, BufferFlags::END_OF_STREAM)?;
                self.input_done = true;
                tracing::debug!("{}: input end of stream", self.label);
            }
        }
        Ok(())
    }

    /// Polls the output side once. Returns true on output end of stream.
    fn drain_output(&mut self) -> Result<bool, VideoError> {
        match self.parts.decoder.dequeue_output(self.dequeue_timeout)? {
            OutputEvent::TryAgainLater => Ok(false),
            OutputEvent::FormatChanged(format) => {
                DecodeStats::bump(&self.stats.format_changes);
                tracing::info!(
                    "{}: output format {}x{} (crop {}x{}, rotation {})",
                    self.label,
                    format.width,
                    format.height,
                    format.crop.width(),
                    format.crop.height(),
                    format.rotation.degrees()
                );
                self.parts
                    .surface
                    .update_default_buffer_size(format.width, format.height)?;
                Ok(false)
            }
            OutputEvent::BuffersChanged => {
                DecodeStats::bump(&self.stats.buffers_changed);
                tracing::debug!("{}: output buffers changed", self.label);
                Ok(false)
            }
            OutputEvent::Ready { index, info } => {
                let render = info.size > 0;
                self.parts.decoder.release_output(index, render)?;
                if render {
                    DecodeStats::bump(&self.stats.frames_rendered);
                    tracing::trace!(
                        "{}: rendered pts={}us",
                        self.label,
                        info.presentation_time_us
                    );
                } else {
                    DecodeStats::bump(&self.stats.frames_discarded);
                }
                Ok(info.is_end_of_stream())
            }
        }
    }

    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        if let Err(e) = self.parts.decoder.stop() {
            tracing::warn!("{}: decoder stop failed: {e}", self.label);
        }
        self.parts.decoder.release();
        self.parts.source.release();
        self.parts.surface.release();
        let stats = self.stats.snapshot();
        tracing::debug!(
            "{}: released (submitted={}, rendered={}, discarded={})",
            self.label,
            stats.samples_submitted,
            stats.frames_rendered,
            stats.frames_discarded
        );
    }
}

impl<S, D, F> Drop for DecodeLoop<S, D, F>
where
    S: SourceReader,
    D: DecoderEngine,
    F: ConsumerSurface,
{
    fn drop(&mut self) {
        self.teardown();
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Handle to a decode loop running on its own thread.
pub struct DecodeThread {
    handle: Option<JoinHandle<()>>,
    cancel: Arc<AtomicBool>,
    stats: Arc<DecodeStats>,
    commands: Sender<LoopCommand>,
    done: Receiver<LoopExit>,
    exit: Option<LoopExit>,
    join_timeout: Duration,
}

impl DecodeThread {
    /// Spawns `decode_loop` on a thread named `name`.
    ///
    /// `on_exit` runs on the decode thread after teardown. If the thread
    /// cannot be spawned the loop is dropped, which releases its resources.
    pub fn spawn<S, D, F, X>(
        name: String,
        decode_loop: DecodeLoop<S, D, F>,
        join_timeout: Duration,
        on_exit: X,
    ) -> Result<Self, VideoError>
    where
        S: SourceReader + 'static,
        D: DecoderEngine + 'static,
        F: ConsumerSurface + 'static,
        X: FnOnce(&LoopExit) + Send + 'static,
    {
        let cancel = decode_loop.cancel_flag();
        let stats = decode_loop.stats();
        let commands = decode_loop.commands();
        let (done_tx, done) = crossbeam_channel::bounded(1);

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let exit = decode_loop.run();
                on_exit(&exit);
                let _ = done_tx.send(exit);
            })
            .map_err(|e| {
                tracing::error!("failed to spawn {name}: {e}");
                VideoError::ThreadSpawn(e.to_string())
            })?;

        Ok(Self {
            handle: Some(handle),
            cancel,
            stats,
            commands,
            done,
            exit: None,
            join_timeout,
        })
    }

    /// Sets the cancellation flag. The loop observes it within one iteration.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub fn stats(&self) -> Arc<DecodeStats> {
        Arc::clone(&self.stats)
    }

    /// Queues a command for the loop. Returns false once the loop has ended.
    pub fn send(&self, command: LoopCommand) -> bool {
        !self.is_finished_peek() && self.commands.send(command).is_ok()
    }

    fn is_finished_peek(&self) -> bool {
        self.exit.is_some() || !self.done.is_empty()
    }

    /// Returns true once the loop has finished and released its resources.
    pub fn is_finished(&mut self) -> bool {
        if self.exit.is_none() {
            if let Ok(exit) = self.done.try_recv() {
                self.exit = Some(exit);
                self.reap();
            }
        }
        self.exit.is_some()
    }

    /// Exit reason, once known.
    pub fn exit(&self) -> Option<&LoopExit> {
        self.exit.as_ref()
    }

    /// Waits up to `timeout` for the loop to finish.
    ///
    /// On timeout the thread is detached; it still releases its own
    /// resources when it next observes cancellation.
    pub fn wait(&mut self, timeout: Duration) -> bool {
        if self.exit.is_none() {
            // Already detached: only check, never block again.
            let received = if self.handle.is_none() {
                self.done.try_recv().ok()
            } else {
                self.done.recv_timeout(timeout).ok()
            };
            match received {
                Some(exit) => self.exit = Some(exit),
                None => {
                    if self.handle.take().is_some() {
                        tracing::warn!(
                            "decode thread did not finish within {timeout:?}, detaching"
                        );
                    }
                    return false;
                }
            }
        }
        self.reap();
        true
    }

    /// Cancels the loop and waits for it with the configured bound.
    pub fn stop(&mut self) -> bool {
        self.cancel();
        self.wait(self.join_timeout)
    }

    fn reap(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("decode thread panicked after reporting exit");
            }
        }
    }
}

impl Drop for DecodeThread {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_signal::frame_signal;
    use crate::reference_decoder::ReferenceDecoder;
    use crate::source::{MemoryClip, MemorySource};
    use crate::surface::BufferQueueSurface;

    fn config() -> DecodeConfig {
        DecodeConfig::default().with_dequeue_timeout(Duration::from_millis(1))
    }

    fn started_parts(
        timestamps: &[i64],
    ) -> SessionParts<MemorySource, ReferenceDecoder, BufferQueueSurface> {
        let (notifier, _waiter) = frame_signal();
        let mut surface = BufferQueueSurface::new(notifier, 3);
        let producer = surface.prepare().unwrap();
        let clip = MemoryClip::synthetic("video/avc", 320, 240, timestamps);
        let source = MemorySource::open("clip", &clip).unwrap();
        let mut decoder = ReferenceDecoder::default();
        decoder.configure(source.track_info(), &producer).unwrap();
        decoder.start().unwrap();
        SessionParts {
            source,
            decoder,
            surface,
        }
    }

    #[test]
    fn test_runs_to_end_of_stream() {
        let decode_loop = DecodeLoop::new("test", started_parts(&[0, 33_000, 66_000]), &config());
        let stats = decode_loop.stats();
        assert_eq!(decode_loop.run(), LoopExit::EndOfStream);

        let stats = stats.snapshot();
        assert_eq!(stats.samples_submitted, 3);
        assert_eq!(stats.frames_rendered, 3);
        assert_eq!(stats.frames_discarded, 1);
        assert_eq!(stats.format_changes, 1);
    }

    #[test]
    fn test_cancelled_before_start() {
        let decode_loop = DecodeLoop::new("test", started_parts(&[0]), &config());
        decode_loop.cancel_flag().store(true, Ordering::Release);
        assert_eq!(decode_loop.run(), LoopExit::Cancelled);
    }

    #[test]
    fn test_thread_reports_exit() {
        let decode_loop = DecodeLoop::new("test", started_parts(&[0, 1, 2]), &config());
        let (seen_tx, seen_rx) = crossbeam_channel::bounded(1);
        let mut thread = DecodeThread::spawn(
            "vidsurface-decode-test".into(),
            decode_loop,
            Duration::from_secs(1),
            move |exit| {
                let _ = seen_tx.send(exit.clone());
            },
        )
        .unwrap();

        assert!(thread.wait(Duration::from_secs(5)));
        assert_eq!(thread.exit(), Some(&LoopExit::EndOfStream));
        assert_eq!(seen_rx.try_recv().unwrap(), LoopExit::EndOfStream);
        assert!(thread.is_finished());
        assert!(!thread.send(LoopCommand::SetBufferSize {
            width: 1,
            height: 1
        }));
    }
}
