//! Renderer host binary.
//!
//! Reads `config.ini`, opens a window (or renders offscreen with
//! `--headless`) and serves UI commands on stdin.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use render_core::app::{run, RunOptions};
use render_core::config::{init_logging, load_config};

/// Render Core scene renderer.
#[derive(Parser, Debug)]
#[command(
    name = "render-core",
    about = "Real-time scene renderer driven by JSON commands on stdin",
    long_about = "Real-time scene renderer driven by JSON commands on stdin.\n\n\
        Each stdin line is one command, e.g. {\"command\":\"UI_RUN\"}.\n\
        Replies are written to stdout in the same form.\n\
        \n\
        EXAMPLES:\n\
          # Render ten offscreen frames and exit\n\
          ./render-core --headless --frames 10\n\
        \n\
          # Override the configured window size\n\
          ./render-core --width 640 --height 480",
    version
)]
struct Args {
    /// Configuration file.
    #[arg(long, default_value = "config.ini")]
    config: PathBuf,

    /// Initial window width in pixels; overrides the config file.
    #[arg(long)]
    width: Option<u32>,

    /// Initial window height in pixels; overrides the config file.
    #[arg(long)]
    height: Option<u32>,

    /// Render offscreen without a window.
    #[arg(long)]
    headless: bool,

    /// Exit after rendering N frames.
    #[arg(long)]
    frames: Option<u64>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let mut config = match load_config(&args.config) {
        Ok(config) => config,
        Err(error) => {
            init_logging(log::LevelFilter::Info);
            log::error!("{}", error);
            return ExitCode::FAILURE;
        }
    };
    init_logging(config.log_level);
    if let Some(width) = args.width {
        config.width = width;
    }
    if let Some(height) = args.height {
        config.height = height;
    }
    if config.width == 0 || config.height == 0 {
        log::error!("Invalid window size {}x{}", config.width, config.height);
        return ExitCode::FAILURE;
    }

    let options = RunOptions {
        headless: args.headless,
        frames: args.frames,
    };
    match run(config, options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}
