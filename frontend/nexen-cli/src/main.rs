//! The `nexen` command-line frontend.
//!
//! Video and audio device output live outside the emulation core; this binary drives the core
//! headlessly (the default in this build) for regression runs, movie recording and playback,
//! and state manipulation. Exit code 0 on normal shutdown, non-zero on load failure.

use clap::Parser;
use nexen_common::frontend::{AudioOutput, Color, FrameSize, Renderer};
use nexen_common::timeutils;
use nexen_driver::{NexenEmulator, NexenError};
use std::convert::Infallible;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(name = "nexen", about = "Nexen multi-system emulator", version)]
struct Args {
    /// ROM file to load
    #[arg(long)]
    rom: PathBuf,

    /// Save state to load before running
    #[arg(long)]
    state: Option<PathBuf>,

    /// Movie file to play back
    #[arg(long)]
    movie: Option<PathBuf>,

    /// Record inputs to a movie file, written on exit
    #[arg(long)]
    record: Option<PathBuf>,

    /// Cheat file (per-game JSON) to apply
    #[arg(long)]
    cheats: Option<PathBuf>,

    /// Run without opening a window (the only mode in this build)
    #[arg(long, default_value_t = true)]
    headless: bool,

    /// Start fullscreen (requires a video frontend build)
    #[arg(long)]
    fullscreen: bool,

    /// Lua script to run alongside emulation (requires a scripting build)
    #[arg(long)]
    lua: Option<PathBuf>,

    /// Number of frames to run before exiting (0 = run until the movie ends, or forever)
    #[arg(long, default_value_t = 0)]
    frames: u64,

    /// Run as fast as possible instead of pacing to the console's refresh rate
    #[arg(long)]
    unthrottled: bool,
}

struct HeadlessRenderer;

impl Renderer for HeadlessRenderer {
    type Err = Infallible;

    fn render_frame(
        &mut self,
        _frame_buffer: &[Color],
        _frame_size: FrameSize,
    ) -> Result<(), Self::Err> {
        Ok(())
    }
}

struct HeadlessAudio;

impl AudioOutput for HeadlessAudio {
    type Err = Infallible;

    fn push_sample(&mut self, _sample_l: f64, _sample_r: f64) -> Result<(), Self::Err> {
        Ok(())
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<(), NexenError> {
    if args.fullscreen {
        log::warn!("--fullscreen has no effect in a headless build");
    }
    if args.lua.is_some() {
        log::warn!("--lua is not supported in this build; ignoring");
    }
    if !args.headless {
        log::warn!("this build is headless-only");
    }

    let mut emulator = NexenEmulator::load_rom(&args.rom)?;
    log::info!("System: {}", emulator.system());

    if let Some(state_path) = &args.state {
        emulator.load_state(state_path)?;
    }
    if let Some(cheat_path) = &args.cheats {
        emulator.load_cheats(cheat_path)?;
    }
    if let Some(movie_path) = &args.movie {
        emulator.play_movie(movie_path)?;
    }
    if args.record.is_some() {
        emulator.start_movie_recording();
    }

    let mut renderer = HeadlessRenderer;
    let mut audio = HeadlessAudio;

    let frame_duration_nanos = (1_000_000_000.0 / 60.0) as u128;
    let mut next_frame_time = timeutils::current_time_nanos();

    loop {
        let outcome =
            emulator.run_frame(&mut renderer, &mut audio).map_err(NexenError::Emulation)?;

        if args.frames != 0 && outcome.frame_number >= args.frames {
            break;
        }
        if args.frames == 0 && args.movie.is_some() && !emulator.movie_playing() {
            log::info!("Movie playback finished at frame {}", outcome.frame_number);
            break;
        }

        if !args.unthrottled && !emulator.max_speed() {
            next_frame_time += frame_duration_nanos;
            timeutils::sleep_until(next_frame_time);
        }
    }

    if let Some(record_path) = &args.record {
        emulator.stop_movie_recording(record_path)?;
    }

    emulator.stop();
    Ok(())
}
