use std::path::{Path, PathBuf};
use std::process;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use crossbeam_channel::Receiver;

use posecam_core::recording::recording_session::{FrameSink, RecordingSession};
use posecam_core::shared::error::RecorderError;
use posecam_core::shared::frame::Frame;
use posecam_core::shared::pipeline_config::PipelineConfig;
use posecam_core::shared::session_settings::SessionSettings;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tiff", "tif", "webp"];

/// Records composited frames to an MP4 file.
#[derive(Parser)]
#[command(name = "posecam-record")]
struct Cli {
    /// Output MP4 file.
    output: Option<PathBuf>,

    /// Canvas width in pixels (must be even).
    #[arg(long, default_value = "640")]
    width: u32,

    /// Canvas height in pixels (must be even).
    #[arg(long, default_value = "480")]
    height: u32,

    /// Frames per second.
    #[arg(long, default_value = "30")]
    fps: u32,

    /// Number of synthetic frames to generate.
    #[arg(long, default_value = "90")]
    frames: usize,

    /// Directory of images to record instead of synthetic frames.
    #[arg(long)]
    frames_dir: Option<PathBuf>,

    /// JSON file with session tunables.
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Write the default tunables to this file and exit.
    #[arg(long)]
    write_default_settings: Option<PathBuf>,
}

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Some(path) = &cli.write_default_settings {
        SessionSettings::default().save(path)?;
        log::info!("Default settings written to {}", path.display());
        return Ok(());
    }

    let output = cli
        .output
        .clone()
        .ok_or("Output file is required unless --write-default-settings is used")?;
    validate(&cli)?;

    let settings = match &cli.settings {
        Some(path) => SessionSettings::load(path)?,
        None => SessionSettings::default(),
    };
    let config = PipelineConfig::new(cli.width, cli.height, cli.fps, &output);

    let source = match &cli.frames_dir {
        Some(dir) => FrameSource::Images(list_images(dir)?),
        None => FrameSource::Synthetic {
            count: cli.frames,
            width: cli.width,
            height: cli.height,
        },
    };

    let mut session = RecordingSession::ffmpeg(settings);
    let errors = session.errors();
    session.prepare(config)?;

    let sink = session.frame_sink();
    let fps = cli.fps;
    let capture = thread::Builder::new()
        .name("posecam-capture".to_string())
        .spawn(move || capture_frames(source, sink, fps))?;

    let fault = watch_errors(&errors, &capture);
    let submitted = capture.join().map_err(|_| "Capture thread panicked")?;

    let report = session.stop();
    eprintln!();
    if let Some(e) = fault.or_else(|| errors.try_recv().ok()) {
        return Err(e.into());
    }
    if !report.release_failures.is_empty() {
        log::warn!("Teardown steps failed: {}", report.release_failures.join(", "));
    }
    log::info!(
        "Submitted {submitted} frames, wrote {} samples to {}",
        report.stats.samples_written,
        output.display()
    );
    Ok(())
}

enum FrameSource {
    Synthetic { count: usize, width: u32, height: u32 },
    Images(Vec<PathBuf>),
}

impl FrameSource {
    fn len(&self) -> usize {
        match self {
            FrameSource::Synthetic { count, .. } => *count,
            FrameSource::Images(paths) => paths.len(),
        }
    }

    fn frame(&self, index: usize) -> Option<Frame> {
        match self {
            FrameSource::Synthetic { width, height, .. } => {
                Some(Frame::solid(*width, *height, hue_to_rgb(index), index))
            }
            FrameSource::Images(paths) => match load_image(&paths[index], index) {
                Ok(frame) => Some(frame),
                Err(e) => {
                    log::warn!("Skipping {}: {e}", paths[index].display());
                    None
                }
            },
        }
    }
}

/// Submits frames at the target rate. Returns how many were handed over.
fn capture_frames(source: FrameSource, sink: FrameSink, fps: u32) -> usize {
    let period = Duration::from_secs(1) / fps.max(1);
    let total = source.len();
    let started = Instant::now();
    let mut submitted = 0;

    for index in 0..total {
        if !sink.state().accepts_frames() {
            log::debug!("Session no longer accepting frames, capture stops at {index}");
            break;
        }
        if let Some(frame) = source.frame(index) {
            sink.submit_frame(&frame);
            submitted += 1;
        }
        eprint!("\rCapturing frame {}/{total}", index + 1);

        let next = started + period * (index as u32 + 1);
        if let Some(wait) = next.checked_duration_since(Instant::now()) {
            thread::sleep(wait);
        }
    }
    submitted
}

/// Blocks until the capture thread finishes or the session reports a fault.
fn watch_errors(
    errors: &Receiver<RecorderError>,
    capture: &thread::JoinHandle<usize>,
) -> Option<RecorderError> {
    while !capture.is_finished() {
        if let Ok(e) = errors.recv_timeout(Duration::from_millis(50)) {
            log::error!("Recording failed: {e}");
            return Some(e);
        }
    }
    None
}

fn hue_to_rgb(index: usize) -> [u8; 3] {
    let hue = (index * 4 % 360) as f64 / 60.0;
    let x = 1.0 - (hue % 2.0 - 1.0).abs();
    let (r, g, b) = match hue as u32 {
        0 => (1.0, x, 0.0),
        1 => (x, 1.0, 0.0),
        2 => (0.0, 1.0, x),
        3 => (0.0, x, 1.0),
        4 => (x, 0.0, 1.0),
        _ => (1.0, 0.0, x),
    };
    [(r * 255.0) as u8, (g * 255.0) as u8, (b * 255.0) as u8]
}

fn load_image(path: &Path, index: usize) -> Result<Frame, Box<dyn std::error::Error>> {
    let img = image::open(path)?.into_rgb8();
    let (width, height) = img.dimensions();
    Ok(Frame::new(img.into_raw(), width, height, 3, index))
}

fn list_images(dir: &Path) -> Result<Vec<PathBuf>, Box<dyn std::error::Error>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| is_image(path))
        .collect();
    if paths.is_empty() {
        return Err(format!("No images found in {}", dir.display()).into());
    }
    paths.sort();
    Ok(paths)
}

fn validate(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(dir) = &cli.frames_dir {
        if !dir.is_dir() {
            return Err(format!("Frames directory not found: {}", dir.display()).into());
        }
    }
    if let Some(path) = &cli.settings {
        if !path.exists() {
            return Err(format!("Settings file not found: {}", path.display()).into());
        }
    }
    if cli.frames_dir.is_none() && cli.frames == 0 {
        return Err("--frames must be at least 1".into());
    }
    Ok(())
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}
