//! vidsurface demo host
//!
//! Plays an IVF file through the reference pipeline. The main thread plays
//! the role of a GPU thread: it waits for the frame-available signal,
//! refreshes the texture and logs what it latched.

use std::time::{Duration, Instant};

use clap::Parser;

use vidsurface_core::{
    DecodeConfig, GpuConsumer, ReferenceBackend, ReferenceDecoderConfig, Request, Response,
    SessionController, SessionState,
};

#[derive(Parser, Debug)]
#[command(name = "vidsurface-demo")]
#[command(about = "Decode an IVF file into a consumer texture and report frame timing")]
struct Args {
    /// IVF file to play (path or file:// URL)
    file: String,

    /// How long the render loop waits for a frame signal, in milliseconds
    #[arg(long, default_value = "16")]
    gpu_poll_ms: u64,

    /// Give up after this many seconds
    #[arg(long, default_value = "30")]
    timeout_secs: u64,

    /// Decode as fast as possible instead of pacing to presentation time
    #[arg(long)]
    fast: bool,

    /// Resize the consumer surface once playback starts (WIDTHxHEIGHT)
    #[arg(long)]
    resize: Option<String>,
}

fn parse_size(value: &str) -> Option<(u32, u32)> {
    let (w, h) = value.split_once(['x', 'X'])?;
    Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vidsurface_core=debug".parse()?)
                .add_directive("vidsurface_demo=debug".parse()?),
        )
        .init();

    let args = Args::parse();
    let backend = ReferenceBackend::new()
        .with_decoder_config(ReferenceDecoderConfig::default().with_realtime(!args.fast));
    let controller = SessionController::new(backend, DecodeConfig::from_env());
    let events = controller.subscribe();
    let mut consumer = GpuConsumer::new(controller.config());

    let session = match controller.handle(Request::StartDecoding {
        locator: args.file.clone(),
    }) {
        Response::Started { session } => session,
        other => {
            eprintln!("failed to start {}: {:?}", args.file, other.code());
            std::process::exit(1);
        }
    };
    if let Some(track) = controller.track_info(session) {
        let (width, height) = track.dimensions();
        println!("{session}: {} {width}x{height}", track.format.mime);
    }
    if let (Some(waiter), Some(texture)) =
        (controller.frame_waiter(session), controller.take_texture(session))
    {
        consumer.attach(texture, waiter);
    }
    if let Some((width, height)) = args.resize.as_deref().and_then(parse_size) {
        let response = controller.handle(Request::SetConsumerBufferSize { width, height });
        tracing::info!("resize to {width}x{height}: {:?}", response);
    }

    let started = Instant::now();
    let deadline = started + Duration::from_secs(args.timeout_secs);
    let poll = Duration::from_millis(args.gpu_poll_ms.max(1));
    let mut first_frame = None;

    loop {
        if let Some(refresh) = consumer.wait_and_update(poll) {
            first_frame.get_or_insert(started.elapsed());
            tracing::debug!(
                "latched pts={}us {}x{}",
                refresh.pts_us,
                refresh.width,
                refresh.height
            );
        }

        for event in events.try_iter() {
            tracing::info!("{} -> {:?}", event.id, event.state);
        }
        if controller.state(session) == SessionState::Stopped {
            break;
        }
        if Instant::now() >= deadline {
            tracing::warn!("timed out after {}s, stopping", args.timeout_secs);
            controller.handle(Request::StopDecoding);
            break;
        }
    }

    let stats = controller.stats(session).unwrap_or_default();
    println!(
        "{session}: {} samples submitted, {} frames rendered, {} latched on the consumer in {:.2?}",
        stats.samples_submitted,
        stats.frames_rendered,
        consumer.refreshes(),
        started.elapsed()
    );
    if let Some(delay) = first_frame {
        println!("first frame after {delay:.2?}");
    }
    if let Some(last) = consumer.last_refresh() {
        println!(
            "last frame pts={}us {}x{} texture {}",
            last.pts_us, last.width, last.height, last.texture_id.0
        );
    }
    Ok(())
}
