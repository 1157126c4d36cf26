//! Session Controller and Registry.
//!
//! A session is a source, a decoder and a consumer surface driven by one
//! decode thread. The controller builds sessions all-or-nothing: any
//! failure while opening releases what was already prepared, in reverse
//! order. Once a session runs, its decode thread is the only thread that
//! touches those parts and the only one that releases them; the controller
//! just raises cancellation and waits a bounded time.
//!
//! `start` and `stop` are serialized by a single controller lock. The frame
//! delivery path never takes it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::backend::MediaBackend;
use crate::codec::DecoderEngine;
use crate::config::DecodeConfig;
use crate::decode_loop::{
    DecodeLoop, DecodeStats, DecodeStatsSnapshot, DecodeThread, LoopCommand, LoopExit,
    SessionParts,
};
use crate::frame_signal::{frame_signal, FrameWaiter};
use crate::source::SourceReader;
use crate::surface::{ConsumerSurface, TextureRefresh};
use crate::video::{TrackInfo, VideoError};

/// Finished sessions kept around for state and statistics queries.
const RETIRED_HISTORY: usize = 16;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Rebuilds an id received across an FFI boundary.
    pub fn from_raw(raw: u64) -> Self {
        SessionId(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Lifecycle of a session: `Closed -> Opened -> Running -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Closed = 0,
    Opened = 1,
    Running = 2,
    Stopped = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => SessionState::Opened,
            2 => SessionState::Running,
            3 => SessionState::Stopped,
            _ => SessionState::Closed,
        }
    }
}

/// Session state shared with the decode thread.
struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: SessionState) -> Self {
        StateCell(AtomicU8::new(state as u8))
    }

    fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves `from -> to`. Returns false if the state was not `from`.
    fn advance(&self, from: SessionState, to: SessionState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Lifecycle notification for subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionEvent {
    pub id: SessionId,
    pub state: SessionState,
}

#[derive(Clone, Default)]
struct EventHub {
    subscribers: Arc<Mutex<Vec<Sender<SessionEvent>>>>,
}

impl EventHub {
    fn subscribe(&self) -> Receiver<SessionEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    fn emit(&self, id: SessionId, state: SessionState) {
        tracing::debug!(session = %id, "state -> {state:?}");
        let event = SessionEvent { id, state };
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event).is_ok());
    }

    /// Advances `cell` to `Stopped` and notifies, once per session.
    fn mark_stopped(&self, id: SessionId, cell: &StateCell) {
        if cell.advance(SessionState::Running, SessionState::Stopped) {
            self.emit(id, SessionState::Stopped);
        }
    }
}

struct Session {
    id: SessionId,
    locator: String,
    track: TrackInfo,
    state: Arc<StateCell>,
    thread: DecodeThread,
    texture: Option<Box<dyn TextureRefresh>>,
    waiter: FrameWaiter,
}

struct Retired {
    id: SessionId,
    state: Arc<StateCell>,
    stats: Arc<DecodeStats>,
}

/// Live sessions, bounded by the configured capacity.
///
/// A stopped session whose decode thread outlived the join timeout stays in
/// `draining` and holds its slot until the thread has released its parts.
pub struct SessionRegistry {
    live: Vec<Session>,
    draining: Vec<Session>,
    retired: VecDeque<Retired>,
    capacity: usize,
}

impl SessionRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            live: Vec::new(),
            draining: Vec::new(),
            retired: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Stopped sessions still releasing their resources.
    pub fn draining(&self) -> usize {
        self.draining.len()
    }

    pub fn is_full(&self) -> bool {
        self.live.len() + self.draining.len() >= self.capacity
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.live.iter().any(|s| s.id == id)
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.live.iter().map(|s| s.id).collect()
    }

    fn insert(&mut self, session: Session) -> Result<(), VideoError> {
        if self.is_full() {
            return Err(VideoError::AlreadyActive);
        }
        self.live.push(session);
        Ok(())
    }

    fn remove(&mut self, id: SessionId) -> Option<Session> {
        let index = self.live.iter().position(|s| s.id == id)?;
        Some(self.live.remove(index))
    }

    fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.live.iter_mut().find(|s| s.id == id)
    }

    /// Moves sessions whose decode thread already finished to the history
    /// and frees the slots of draining sessions that completed.
    fn reap_finished(&mut self) {
        let mut i = 0;
        while i < self.live.len() {
            if self.live[i].thread.is_finished() {
                let session = self.live.remove(i);
                tracing::debug!(session = %session.id, "reaped finished session");
                self.retire(&session);
            } else {
                i += 1;
            }
        }
        self.draining.retain_mut(|session| {
            let finished = session.thread.is_finished();
            if finished {
                tracing::debug!(session = %session.id, "detached decode thread finished");
            }
            !finished
        });
    }

    /// Records a stopped session. Its slot stays taken while its thread runs.
    fn park(&mut self, mut session: Session, finished: bool) {
        self.retire(&session);
        if !finished && !session.thread.is_finished() {
            self.draining.push(session);
        }
    }

    fn retire(&mut self, session: &Session) {
        if self.retired.len() >= RETIRED_HISTORY {
            self.retired.pop_front();
        }
        self.retired.push_back(Retired {
            id: session.id,
            state: Arc::clone(&session.state),
            stats: session.thread.stats(),
        });
    }

    fn state(&self, id: SessionId) -> Option<SessionState> {
        self.live
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.state.get())
            .or_else(|| {
                self.retired
                    .iter()
                    .rev()
                    .find(|r| r.id == id)
                    .map(|r| r.state.get())
            })
    }

    fn stats(&self, id: SessionId) -> Option<DecodeStatsSnapshot> {
        self.live
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.thread.stats().snapshot())
            .or_else(|| {
                self.retired
                    .iter()
                    .rev()
                    .find(|r| r.id == id)
                    .map(|r| r.stats.snapshot())
            })
    }
}

/// The parts of a session between `open` and the decode thread taking over.
struct Opened<B: MediaBackend> {
    source: B::Source,
    decoder: B::Decoder,
    surface: B::Surface,
    texture: Option<Box<dyn TextureRefresh>>,
    waiter: FrameWaiter,
    track: TrackInfo,
}

/// Starts and stops decode sessions.
pub struct SessionController<B: MediaBackend> {
    backend: B,
    config: DecodeConfig,
    registry: Mutex<SessionRegistry>,
    events: EventHub,
}

impl<B: MediaBackend> SessionController<B> {
    pub fn new(backend: B, config: DecodeConfig) -> Self {
        Self {
            backend,
            registry: Mutex::new(SessionRegistry::new(config.max_sessions)),
            config,
            events: EventHub::default(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &DecodeConfig {
        &self.config
    }

    /// Opens a session on `locator` and starts its decode thread.
    ///
    /// Fails with `AlreadyActive` when the registry is full. Any other
    /// failure leaves nothing allocated.
    pub fn start(&self, locator: &str) -> Result<SessionId, VideoError> {
        let mut registry = self.registry.lock();
        registry.reap_finished();
        if registry.is_full() {
            tracing::warn!(
                "start({locator}) rejected: {} session(s) active, {} draining",
                registry.len(),
                registry.draining()
            );
            return Err(VideoError::AlreadyActive);
        }

        let id = SessionId::next();
        let opened = self.open(id, locator).map_err(|e| {
            tracing::warn!(session = %id, "open {locator} failed: {e}");
            e
        })?;
        let state = Arc::new(StateCell::new(SessionState::Opened));
        self.events.emit(id, SessionState::Opened);

        let Opened {
            source,
            decoder,
            surface,
            texture,
            waiter,
            track,
        } = opened;
        let decode_loop = DecodeLoop::new(
            id.to_string(),
            SessionParts {
                source,
                decoder,
                surface,
            },
            &self.config,
        );

        state.advance(SessionState::Opened, SessionState::Running);
        self.events.emit(id, SessionState::Running);

        let events = self.events.clone();
        let exit_state = Arc::clone(&state);
        let spawned = DecodeThread::spawn(
            format!("vidsurface-decode-{}", id.as_u64()),
            decode_loop,
            self.config.join_timeout,
            move |exit: &LoopExit| {
                if let LoopExit::Fault(e) = exit {
                    tracing::error!(session = %id, "session ended by fault: {e}");
                }
                events.mark_stopped(id, &exit_state);
            },
        );
        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                // The loop was dropped with the closure and released its parts.
                self.events.mark_stopped(id, &state);
                return Err(e);
            }
        };

        tracing::info!(
            session = %id,
            "started {locator} ({} {}x{})",
            track.format.mime,
            track.format.width,
            track.format.height
        );
        registry.insert(Session {
            id,
            locator: locator.to_string(),
            track,
            state,
            thread,
            texture,
            waiter,
        })?;
        Ok(id)
    }

    /// Builds the three parts of a session, rolling back on failure.
    fn open(&self, id: SessionId, locator: &str) -> Result<Opened<B>, VideoError> {
        let (notifier, waiter) = frame_signal();
        let mut surface = self.backend.create_surface(notifier, &self.config)?;
        let producer = match surface.prepare() {
            Ok(producer) => producer,
            Err(e) => {
                surface.release();
                return Err(e);
            }
        };

        let mut source = match self.backend.open_source(locator) {
            Ok(source) => source,
            Err(e) => {
                surface.release();
                return Err(e);
            }
        };
        let track = source.track_info().clone();

        let mut decoder = match self.backend.create_decoder(&track) {
            Ok(decoder) => decoder,
            Err(e) => {
                source.release();
                surface.release();
                return Err(e);
            }
        };
        if let Err(e) = decoder
            .configure(&track, &producer)
            .and_then(|()| decoder.start())
        {
            decoder.release();
            source.release();
            surface.release();
            return Err(e);
        }

        let texture = surface.take_texture();
        tracing::debug!(
            session = %id,
            "opened track {} on surface {}",
            track.track_index,
            producer.surface_id().as_u64()
        );
        Ok(Opened {
            source,
            decoder,
            surface,
            texture,
            waiter,
            track,
        })
    }

    /// Boolean form of [`start`](Self::start) for the control surface.
    pub fn start_decoding(&self, locator: &str) -> bool {
        self.start(locator).is_ok()
    }

    /// Stops every session. Safe to call at any time, any number of times.
    pub fn stop(&self) {
        let mut registry = self.registry.lock();
        while let Some(id) = registry.live.first().map(|s| s.id) {
            if let Some(mut session) = registry.remove(id) {
                let finished = self.shutdown(&mut session);
                registry.park(session, finished);
            }
        }
    }

    /// Stops one session. Returns false if it is not live.
    pub fn stop_session(&self, id: SessionId) -> bool {
        let mut registry = self.registry.lock();
        let Some(mut session) = registry.remove(id) else {
            return false;
        };
        let finished = self.shutdown(&mut session);
        registry.park(session, finished);
        true
    }

    /// Control-surface alias of [`stop`](Self::stop).
    pub fn stop_decoding(&self) {
        self.stop();
    }

    /// Cancels a session's loop. Returns false if its thread is still running.
    fn shutdown(&self, session: &mut Session) -> bool {
        session.texture = None;
        let finished = session.thread.stop();
        if !finished {
            tracing::warn!(
                session = %session.id,
                "{} still decoding after {:?}; it releases its resources when it exits",
                session.locator,
                self.config.join_timeout
            );
        }
        self.events.mark_stopped(session.id, &session.state);
        finished
    }

    /// Ids of sessions whose decode thread is still running.
    pub fn active_sessions(&self) -> Vec<SessionId> {
        let mut registry = self.registry.lock();
        registry.reap_finished();
        registry.ids()
    }

    /// State of a session. Unknown ids report `Closed`.
    pub fn state(&self, id: SessionId) -> SessionState {
        self.registry
            .lock()
            .state(id)
            .unwrap_or(SessionState::Closed)
    }

    pub fn stats(&self, id: SessionId) -> Option<DecodeStatsSnapshot> {
        self.registry.lock().stats(id)
    }

    pub fn track_info(&self, id: SessionId) -> Option<TrackInfo> {
        let mut registry = self.registry.lock();
        registry.get_mut(id).map(|s| s.track.clone())
    }

    /// Hands out the GPU capability of a live session, once.
    pub fn take_texture(&self, id: SessionId) -> Option<Box<dyn TextureRefresh>> {
        self.registry.lock().get_mut(id)?.texture.take()
    }

    /// Frame-available waiter of a live session.
    ///
    /// Each session has its own signal, so a consumer only wakes for the
    /// session whose texture it holds.
    pub fn frame_waiter(&self, id: SessionId) -> Option<FrameWaiter> {
        self.registry.lock().get_mut(id).map(|s| s.waiter.clone())
    }

    /// Number of stopped sessions whose decode thread is still releasing.
    pub fn draining_sessions(&self) -> usize {
        let mut registry = self.registry.lock();
        registry.reap_finished();
        registry.draining()
    }

    /// Asks every live session to resize its consumer surface.
    pub fn set_consumer_buffer_size(&self, width: u32, height: u32) -> Result<(), VideoError> {
        let registry = self.registry.lock();
        let command = LoopCommand::SetBufferSize { width, height };
        let delivered = registry
            .live
            .iter()
            .filter(|s| s.thread.send(command))
            .count();
        if delivered == 0 {
            return Err(VideoError::IllegalState("no active session".into()));
        }
        Ok(())
    }

    /// Receives every subsequent lifecycle event.
    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

impl<B: MediaBackend> Drop for SessionController<B> {
    fn drop(&mut self) {
        self.stop();
    }
}
