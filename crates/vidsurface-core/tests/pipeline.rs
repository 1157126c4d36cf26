//! End-to-end tests of the decode pipeline with the reference backend.
//!
//! A recording backend wraps the reference source, decoder and surface and
//! counts every resource operation, so tests can assert what was allocated,
//! rendered and released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use vidsurface_core::backend::{MediaBackend, ReferenceBackend};
use vidsurface_core::codec::{CodecState, DecoderEngine, OutputEvent, ProducerHandle, Submit};
use vidsurface_core::config::{DecodeConfig, ReferenceDecoderConfig};
use vidsurface_core::frame_signal::{FrameNotifier, GpuConsumer};
use vidsurface_core::ivf::{write_ivf, IvfHeader};
use vidsurface_core::reference_decoder::ReferenceDecoder;
use vidsurface_core::session::{SessionController, SessionState};
use vidsurface_core::source::{MemoryClip, SourceReader};
use vidsurface_core::surface::{BufferQueueSurface, ConsumerSurface, QueueObserver, TextureRefresh};
use vidsurface_core::video::{
    BufferFlags, BufferInfo, CompressedSample, MediaFormat, OutputFormat, TrackInfo, VideoError,
};

// =========================================================================
// Recording backend
// =========================================================================

#[derive(Default)]
struct Counters {
    surfaces_created: AtomicUsize,
    surfaces_released: AtomicUsize,
    sources_opened: AtomicUsize,
    sources_released: AtomicUsize,
    decoders_created: AtomicUsize,
    decoders_started: AtomicUsize,
    decoders_released: AtomicUsize,
    rendered: Mutex<Vec<i64>>,
    observers: Mutex<Vec<QueueObserver>>,
}

impl Counters {
    fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn resource_ops(&self) -> usize {
        Self::get(&self.surfaces_created)
            + Self::get(&self.surfaces_released)
            + Self::get(&self.sources_opened)
            + Self::get(&self.sources_released)
            + Self::get(&self.decoders_created)
            + Self::get(&self.decoders_released)
    }
}

#[derive(Clone, Copy, Default)]
enum Fault {
    #[default]
    None,
    /// `dequeue_output` fails after this many rendered frames
    ErrorAfter(usize),
    /// `dequeue_output` panics after this many rendered frames
    PanicAfter(usize),
}

struct RecordingSource {
    inner: Box<dyn SourceReader>,
    counters: Arc<Counters>,
    released: bool,
}

impl SourceReader for RecordingSource {
    fn track_info(&self) -> &TrackInfo {
        self.inner.track_info()
    }

    fn read_sample(&mut self, buf: &mut [u8]) -> Result<Option<usize>, VideoError> {
        self.inner.read_sample(buf)
    }

    fn advance(&mut self) -> bool {
        self.inner.advance()
    }

    fn sample_time_us(&self) -> i64 {
        self.inner.sample_time_us()
    }

    fn sample_flags(&self) -> BufferFlags {
        self.inner.sample_flags()
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            Counters::bump(&self.counters.sources_released);
        }
        self.inner.release();
    }
}

struct RecordingDecoder {
    inner: ReferenceDecoder,
    counters: Arc<Counters>,
    outstanding: HashMap<usize, BufferInfo>,
    fault: Fault,
    throttle: Option<Duration>,
    buffers_changed_once: bool,
    released: bool,
}

impl DecoderEngine for RecordingDecoder {
    fn configure(&mut self, track: &TrackInfo, producer: &ProducerHandle) -> Result<(), VideoError> {
        self.inner.configure(track, producer)
    }

    fn start(&mut self) -> Result<(), VideoError> {
        self.inner.start()?;
        Counters::bump(&self.counters.decoders_started);
        Ok(())
    }

    fn dequeue_input(&mut self, timeout: Duration) -> Result<Option<usize>, VideoError> {
        self.inner.dequeue_input(timeout)
    }

    fn input_buffer(&mut self, index: usize) -> Result<&mut [u8], VideoError> {
        self.inner.input_buffer(index)
    }

    fn queue_input(
        &mut self,
        index: usize,
        size: usize,
        pts_us: i64,
        flags: BufferFlags,
    ) -> Result<(), VideoError> {
        self.inner.queue_input(index, size, pts_us, flags)
    }

    fn dequeue_output(&mut self, timeout: Duration) -> Result<OutputEvent, VideoError> {
        if self.buffers_changed_once {
            self.buffers_changed_once = false;
            return Ok(OutputEvent::BuffersChanged);
        }
        if let Some(delay) = self.throttle {
            std::thread::sleep(delay);
        }
        let rendered = self.counters.rendered.lock().len();
        match self.fault {
            Fault::ErrorAfter(n) if rendered >= n => {
                return Err(VideoError::DecodeLoopFault("injected decoder error".into()));
            }
            Fault::PanicAfter(n) if rendered >= n => panic!("injected decoder panic"),
            _ => {}
        }
        let event = self.inner.dequeue_output(timeout)?;
        if let OutputEvent::Ready { index, info } = &event {
            self.outstanding.insert(*index, *info);
        }
        Ok(event)
    }

    fn output_format(&self) -> Option<OutputFormat> {
        self.inner.output_format()
    }

    fn release_output(&mut self, index: usize, render: bool) -> Result<(), VideoError> {
        self.inner.release_output(index, render)?;
        if let Some(info) = self.outstanding.remove(&index) {
            if render {
                self.counters.rendered.lock().push(info.presentation_time_us);
            }
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), VideoError> {
        self.inner.stop()
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            Counters::bump(&self.counters.decoders_released);
        }
        self.inner.release();
    }

    fn state(&self) -> CodecState {
        self.inner.state()
    }
}

struct RecordingSurface {
    inner: BufferQueueSurface,
    counters: Arc<Counters>,
    released: bool,
}

impl ConsumerSurface for RecordingSurface {
    fn prepare(&mut self) -> Result<ProducerHandle, VideoError> {
        let producer = self.inner.prepare()?;
        if let Some(observer) = self.inner.observer() {
            self.counters.observers.lock().push(observer);
        }
        Ok(producer)
    }

    fn update_default_buffer_size(&mut self, width: u32, height: u32) -> Result<(), VideoError> {
        self.inner.update_default_buffer_size(width, height)
    }

    fn take_texture(&mut self) -> Option<Box<dyn TextureRefresh>> {
        self.inner.take_texture()
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            Counters::bump(&self.counters.surfaces_released);
        }
        self.inner.release();
    }

    fn is_prepared(&self) -> bool {
        self.inner.is_prepared()
    }
}

#[derive(Default)]
struct RecordingBackend {
    reference: ReferenceBackend,
    counters: Arc<Counters>,
    fault: Mutex<Fault>,
    throttle: Option<Duration>,
    buffers_changed: bool,
}

impl RecordingBackend {
    fn with_clip(name: &str, clip: MemoryClip) -> (Self, String) {
        let backend = Self::default();
        let locator = backend.reference.register_clip(name, clip);
        (backend, locator)
    }
}

impl MediaBackend for RecordingBackend {
    type Source = RecordingSource;
    type Decoder = RecordingDecoder;
    type Surface = RecordingSurface;

    fn create_surface(
        &self,
        notifier: FrameNotifier,
        config: &DecodeConfig,
    ) -> Result<Self::Surface, VideoError> {
        Counters::bump(&self.counters.surfaces_created);
        Ok(RecordingSurface {
            inner: self.reference.create_surface(notifier, config)?,
            counters: Arc::clone(&self.counters),
            released: false,
        })
    }

    fn open_source(&self, locator: &str) -> Result<Self::Source, VideoError> {
        let inner = self.reference.open_source(locator)?;
        Counters::bump(&self.counters.sources_opened);
        Ok(RecordingSource {
            inner,
            counters: Arc::clone(&self.counters),
            released: false,
        })
    }

    fn create_decoder(&self, track: &TrackInfo) -> Result<Self::Decoder, VideoError> {
        Counters::bump(&self.counters.decoders_created);
        Ok(RecordingDecoder {
            inner: self.reference.create_decoder(track)?,
            counters: Arc::clone(&self.counters),
            outstanding: HashMap::new(),
            fault: *self.fault.lock(),
            throttle: self.throttle,
            buffers_changed_once: self.buffers_changed,
            released: false,
        })
    }
}

fn fast_config() -> DecodeConfig {
    DecodeConfig::default()
        .with_dequeue_timeout(Duration::from_millis(2))
        .with_join_timeout(Duration::from_secs(5))
}

fn wait_for_state<B: MediaBackend>(
    controller: &SessionController<B>,
    id: vidsurface_core::SessionId,
    state: SessionState,
) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if controller.state(id) == state {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

/// A clip that takes minutes to play, so it is still running when stopped.
fn long_running(name: &str) -> (RecordingBackend, String) {
    let timestamps: Vec<i64> = (0..10_000).map(|i| i * 33_000).collect();
    let clip = MemoryClip::synthetic("video/avc", 16, 16, &timestamps);
    let (mut backend, locator) = RecordingBackend::with_clip(name, clip);
    backend.throttle = Some(Duration::from_millis(10));
    (backend, locator)
}

fn three_sample_clip() -> MemoryClip {
    MemoryClip::synthetic("video/avc", 320, 240, &[0, 33_000, 66_000])
}

// =========================================================================
// Decode loop scenarios
// =========================================================================

#[test]
fn three_sample_clip_renders_in_order_then_releases() {
    let (backend, locator) = RecordingBackend::with_clip("three", three_sample_clip());
    let counters = Arc::clone(&backend.counters);
    let controller = SessionController::new(backend, fast_config());

    let id = controller.start(&locator).unwrap();
    assert!(wait_for_state(&controller, id, SessionState::Stopped));

    assert_eq!(*counters.rendered.lock(), vec![0, 33_000, 66_000]);
    assert_eq!(Counters::get(&counters.decoders_released), 1);
    assert_eq!(Counters::get(&counters.sources_released), 1);
    assert_eq!(Counters::get(&counters.surfaces_released), 1);

    let stats = controller.stats(id).unwrap();
    assert_eq!(stats.samples_submitted, 3);
    assert_eq!(stats.frames_rendered, 3);
    assert!(controller.active_sessions().is_empty());
}

#[test]
fn every_submitted_sample_surfaces_before_end_of_stream() {
    let timestamps: Vec<i64> = (0..40).map(|i| i * 16_666).collect();
    let clip = MemoryClip::synthetic("video/x-vnd.on2.vp9", 64, 64, &timestamps);
    let (backend, locator) = RecordingBackend::with_clip("forty", clip);
    let counters = Arc::clone(&backend.counters);
    let controller = SessionController::new(backend, fast_config());

    let id = controller.start(&locator).unwrap();
    assert!(wait_for_state(&controller, id, SessionState::Stopped));
    assert_eq!(*counters.rendered.lock(), timestamps);
}

#[test]
fn decoder_error_ends_session_and_releases_once() {
    let (backend, locator) = RecordingBackend::with_clip("three", three_sample_clip());
    *backend.fault.lock() = Fault::ErrorAfter(1);
    let counters = Arc::clone(&backend.counters);
    let controller = SessionController::new(backend, fast_config());

    let id = controller.start(&locator).unwrap();
    assert!(wait_for_state(&controller, id, SessionState::Stopped));
    controller.stop();

    assert_eq!(counters.rendered.lock().len(), 1);
    assert_eq!(Counters::get(&counters.decoders_released), 1);
    assert_eq!(Counters::get(&counters.sources_released), 1);
    assert_eq!(Counters::get(&counters.surfaces_released), 1);
}

#[test]
fn decoder_panic_is_contained() {
    let (backend, locator) = RecordingBackend::with_clip("three", three_sample_clip());
    *backend.fault.lock() = Fault::PanicAfter(2);
    let counters = Arc::clone(&backend.counters);
    let controller = SessionController::new(backend, fast_config());

    let id = controller.start(&locator).unwrap();
    assert!(wait_for_state(&controller, id, SessionState::Stopped));
    assert_eq!(Counters::get(&counters.decoders_released), 1);
    assert_eq!(Counters::get(&counters.surfaces_released), 1);

    // The controller is still usable afterwards.
    let id = controller.start(&locator);
    assert!(id.is_ok());
}

#[test]
fn buffers_changed_is_tolerated() {
    let (mut backend, locator) = RecordingBackend::with_clip("three", three_sample_clip());
    backend.buffers_changed = true;
    let counters = Arc::clone(&backend.counters);
    let controller = SessionController::new(backend, fast_config());

    let id = controller.start(&locator).unwrap();
    assert!(wait_for_state(&controller, id, SessionState::Stopped));
    assert_eq!(counters.rendered.lock().len(), 3);
    assert_eq!(controller.stats(id).unwrap().buffers_changed, 1);
}

#[test]
fn codec_config_size_reaches_surface() {
    let mut config = 640u32.to_le_bytes().to_vec();
    config.extend_from_slice(&480u32.to_le_bytes());
    let clip = MemoryClip::new()
        .with_track(MediaFormat::video("video/avc", 320, 240))
        .with_sample(CompressedSample::key(vec![1], 0))
        .with_sample(CompressedSample::new(config, 33_000, BufferFlags::CODEC_CONFIG))
        .with_sample(CompressedSample::key(vec![2], 33_000));
    let (backend, locator) = RecordingBackend::with_clip("resize", clip);
    let counters = Arc::clone(&backend.counters);
    let controller = SessionController::new(backend, fast_config());

    let id = controller.start(&locator).unwrap();
    assert!(wait_for_state(&controller, id, SessionState::Stopped));

    let observer = counters.observers.lock()[0].clone();
    assert_eq!(observer.default_buffer_size(), (640, 480));
    assert_eq!(controller.stats(id).unwrap().format_changes, 2);
    assert_eq!(*counters.rendered.lock(), vec![0, 33_000]);
}

// =========================================================================
// Session controller scenarios
// =========================================================================

#[test]
fn zero_video_tracks_leaves_nothing_allocated() {
    let clip = MemoryClip::new()
        .with_track(MediaFormat::other("audio/mp4a-latm"))
        .with_sample(CompressedSample::key(vec![0], 0));
    let (backend, locator) = RecordingBackend::with_clip("audio", clip);
    let counters = Arc::clone(&backend.counters);
    let controller = SessionController::new(backend, fast_config());

    assert!(!controller.start_decoding(&locator));
    assert_eq!(Counters::get(&counters.decoders_created), 0);
    assert_eq!(
        Counters::get(&counters.surfaces_created),
        Counters::get(&counters.surfaces_released)
    );
    assert!(counters.observers.lock()[0].is_abandoned());
    assert!(controller.active_sessions().is_empty());
}

#[test]
fn double_start_is_rejected_without_second_thread() {
    let (backend, locator) = long_running("long");
    let counters = Arc::clone(&backend.counters);
    let controller = SessionController::new(backend, fast_config());

    assert!(controller.start_decoding(&locator));
    assert!(!controller.start_decoding(&locator));
    assert!(matches!(
        controller.start(&locator),
        Err(VideoError::AlreadyActive)
    ));
    assert_eq!(Counters::get(&counters.decoders_started), 1);
    assert_eq!(controller.active_sessions().len(), 1);

    controller.stop_decoding();
    assert!(controller.active_sessions().is_empty());
    assert_eq!(Counters::get(&counters.decoders_released), 1);
}

#[test]
fn failed_start_does_not_poison_controller() {
    let (backend, locator) = RecordingBackend::with_clip("three", three_sample_clip());
    let controller = SessionController::new(backend, fast_config());

    assert!(!controller.start_decoding("missing/path.mp4"));
    assert!(controller.start_decoding(&locator));
    controller.stop_decoding();
}

#[test]
fn stop_without_session_has_no_side_effects() {
    let backend = RecordingBackend::default();
    let counters = Arc::clone(&backend.counters);
    let controller = SessionController::new(backend, fast_config());
    let events = controller.subscribe();

    controller.stop_decoding();
    controller.stop_decoding();

    assert_eq!(counters.resource_ops(), 0);
    assert!(events.try_recv().is_err());
}

#[test]
fn stop_is_idempotent_after_running_session() {
    let (backend, locator) = long_running("long");
    let counters = Arc::clone(&backend.counters);
    let controller = SessionController::new(backend, fast_config());
    let events = controller.subscribe();

    let id = controller.start(&locator).unwrap();
    controller.stop();
    let after_first = counters.resource_ops();
    controller.stop();

    assert_eq!(counters.resource_ops(), after_first);
    assert_eq!(controller.state(id), SessionState::Stopped);
    let states: Vec<_> = events.try_iter().map(|e| e.state).collect();
    assert_eq!(
        states,
        vec![SessionState::Opened, SessionState::Running, SessionState::Stopped]
    );
}

#[test]
fn finished_session_is_reaped_on_next_start() {
    let (backend, locator) = RecordingBackend::with_clip("three", three_sample_clip());
    let controller = SessionController::new(backend, fast_config());

    let first = controller.start(&locator).unwrap();
    assert!(wait_for_state(&controller, first, SessionState::Stopped));
    let second = controller.start(&locator).unwrap();
    assert_ne!(first, second);
    controller.stop();
}

#[test]
fn concurrent_sessions_when_configured() {
    let (backend, locator) = RecordingBackend::with_clip("three", three_sample_clip());
    let controller = SessionController::new(backend, fast_config().with_max_sessions(2));

    let a = controller.start(&locator).unwrap();
    let b = controller.start(&locator).unwrap();
    assert_ne!(a, b);
    assert!(wait_for_state(&controller, a, SessionState::Stopped));
    assert!(wait_for_state(&controller, b, SessionState::Stopped));
}

#[test]
fn timed_out_stop_keeps_slot_until_thread_releases() {
    let (mut backend, locator) = long_running("slow");
    backend.throttle = Some(Duration::from_millis(300));
    let counters = Arc::clone(&backend.counters);
    let config = fast_config().with_join_timeout(Duration::from_millis(5));
    let controller = SessionController::new(backend, config);

    let first = controller.start(&locator).unwrap();
    let stopping = Instant::now();
    controller.stop();
    assert!(stopping.elapsed() < Duration::from_millis(250));
    assert_eq!(controller.state(first), SessionState::Stopped);

    // The detached thread still owns its decoder: no second one may open.
    if Counters::get(&counters.decoders_released) == 0 {
        assert!(matches!(
            controller.start(&locator),
            Err(VideoError::AlreadyActive)
        ));
        assert_eq!(Counters::get(&counters.decoders_created), 1);
    }

    // The decode thread releases everything itself, exactly once.
    let deadline = Instant::now() + Duration::from_secs(5);
    while controller.draining_sessions() > 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(controller.draining_sessions(), 0);
    assert_eq!(Counters::get(&counters.decoders_released), 1);
    assert_eq!(Counters::get(&counters.sources_released), 1);
    assert_eq!(Counters::get(&counters.surfaces_released), 1);

    // With the slot free again a new session starts normally.
    let second = controller.start(&locator).unwrap();
    assert_ne!(first, second);
    assert_eq!(Counters::get(&counters.decoders_created), 2);
    controller.stop();
    let deadline = Instant::now() + Duration::from_secs(5);
    while controller.draining_sessions() > 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(Counters::get(&counters.decoders_released), 2);
    assert_eq!(Counters::get(&counters.sources_released), 2);
    assert_eq!(Counters::get(&counters.surfaces_released), 2);
}

// =========================================================================
// GPU consumer
// =========================================================================

#[test]
fn texture_of_finished_session_is_abandoned() {
    let timestamps: Vec<i64> = (0..12).map(|i| i * 1_000).collect();
    let clip = MemoryClip::synthetic("video/avc", 320, 240, &timestamps);
    let backend = ReferenceBackend::new();
    let locator = backend.register_clip("burst", clip);
    let config = fast_config().with_buffer_queue_depth(3);
    let controller = SessionController::new(backend, config.clone());

    let id = controller.start(&locator).unwrap();
    let texture = controller.take_texture(id).unwrap();
    let waiter = controller.frame_waiter(id).unwrap();
    assert!(controller.take_texture(id).is_none());

    // Let every frame land before the GPU thread looks.
    assert!(wait_for_state(&controller, id, SessionState::Stopped));

    let mut consumer = GpuConsumer::new(&config);
    assert_eq!(consumer.size(), (640, 360));
    consumer.attach(texture, waiter);

    // The surface was released at end of stream, so the texture is abandoned.
    assert!(consumer.update().is_none());
    assert!(!consumer.is_attached());
}

#[test]
fn gpu_consumer_refreshes_are_bounded_by_queue_depth() {
    let backend = ReferenceBackend::new();
    let (notifier, waiter) = vidsurface_core::frame_signal();
    let config = DecodeConfig::default().with_buffer_queue_depth(3);
    let mut surface = backend.create_surface(notifier, &config).unwrap();
    let producer = surface.prepare().unwrap();
    let texture = surface.take_texture().unwrap();

    let mut decoder = ReferenceDecoder::default();
    let track = TrackInfo {
        track_index: 0,
        format: MediaFormat::video("video/avc", 320, 240),
    };
    decoder.configure(&track, &producer).unwrap();
    decoder.start().unwrap();

    let t = Duration::from_millis(1);
    let mut rendered = 0;
    let mut next_pts = 0;
    while rendered < 10 {
        if next_pts < 10 {
            let sample = CompressedSample::key(vec![7], next_pts * 1_000);
            if decoder.submit(&sample, t).unwrap() == Submit::Accepted {
                next_pts += 1;
            }
        }
        if let OutputEvent::Ready { index, .. } = decoder.dequeue_output(t).unwrap() {
            decoder.release_output(index, true).unwrap();
            rendered += 1;
        }
    }

    let mut consumer = GpuConsumer::new(&config);
    consumer.attach(texture, waiter);

    let mut refreshes = Vec::new();
    while let Some(refresh) = consumer.wait_and_update(Duration::from_millis(200)) {
        refreshes.push(refresh);
    }

    assert!(!refreshes.is_empty());
    assert!(refreshes.len() <= config.buffer_queue_depth);
    assert_eq!(refreshes.last().map(|r| r.pts_us), Some(9_000));
    assert_eq!(consumer.size(), (320, 240));
    surface.release();
}

#[test]
fn each_session_signals_only_its_own_consumer() {
    let backend = ReferenceBackend::new()
        .with_decoder_config(ReferenceDecoderConfig::default().with_realtime(true));
    let burst = backend.register_clip(
        "burst",
        MemoryClip::synthetic("video/avc", 64, 64, &[0, 1_000, 2_000]),
    );
    let timestamps: Vec<i64> = (0..90).map(|i| i * 33_000).collect();
    let paced = backend.register_clip(
        "paced",
        MemoryClip::synthetic("video/avc", 96, 96, &timestamps),
    );
    let config = fast_config().with_max_sessions(2);
    let controller = SessionController::new(backend, config.clone());

    // The first session finishes with a signal nobody consumed.
    let a = controller.start(&burst).unwrap();
    let a_waiter = controller.frame_waiter(a).unwrap();
    assert!(wait_for_state(&controller, a, SessionState::Stopped));
    assert!(a_waiter.is_pending());

    let b = controller.start(&paced).unwrap();
    let texture = controller.take_texture(b).unwrap();
    let mut consumer = GpuConsumer::new(&config);
    consumer.attach(texture, controller.frame_waiter(b).unwrap());

    let refresh = consumer.wait_and_update(Duration::from_secs(2));
    assert_eq!(refresh.map(|r| (r.width, r.height)), Some((96, 96)));
    assert!(a_waiter.is_pending());
    assert_eq!(a_waiter.counters().consumed, 0);

    controller.stop();
}

// =========================================================================
// IVF through the controller
// =========================================================================

#[test]
fn ivf_file_plays_through_reference_backend() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write_ivf(
        &mut file,
        IvfHeader::new(*b"VP80", 176, 144, 30, 1),
        &[(0, b"\x00one"), (1, b"\x01two"), (2, b"\x01three")],
    )
    .unwrap();

    let controller = SessionController::new(ReferenceBackend::new(), fast_config());
    let id = controller
        .start(&file.path().display().to_string())
        .unwrap();
    assert_eq!(
        controller.track_info(id).map(|t| t.dimensions()),
        Some((176, 144))
    );
    assert!(wait_for_state(&controller, id, SessionState::Stopped));
    assert_eq!(controller.stats(id).unwrap().frames_rendered, 3);
}
