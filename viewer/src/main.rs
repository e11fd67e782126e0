// Copyright 2024 Soft KVM Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # camview
//!
//! Live viewer for V4L2 cameras: negotiates a capture format, streams
//! memory-mapped buffers on a worker thread and shows them in a window.

use anyhow::Context;
use camview_capture::*;
use camview_platform::{DisplaySurface, SoftbufferPresenter, V4l2Device};
use clap::{Arg, ArgAction, ArgGroup, ArgMatches, Command};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const KEYS_HELP: &str = "Keys:\n  q, Esc  quit\n  r       restore the startup resolution";

fn cli() -> Command {
    Command::new("camview")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Soft KVM Team")
        .about("Live viewer for V4L2 video capture devices")
        .after_help(KEYS_HELP)
        .arg(
            Arg::new("device")
                .short('d')
                .long("device")
                .value_name("PATH")
                .help("Video device path [default: /dev/video0]")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("width")
                .short('x')
                .long("width")
                .value_name("PIXELS")
                .help("Capture width [default: 640]")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("height")
                .short('y')
                .long("height")
                .value_name("PIXELS")
                .help("Capture height [default: 480]")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("fps")
                .short('f')
                .long("fps")
                .value_name("FPS")
                .help("Frame rate [default: 30]")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("mmap")
                .short('m')
                .long("mmap")
                .help("Use memory mapped buffers (default)")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("read")
                .short('r')
                .long("read")
                .help("Use read() calls")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("userptr")
                .short('u')
                .long("userptr")
                .help("Use application allocated buffers")
                .action(ArgAction::SetTrue),
        )
        .group(ArgGroup::new("io").args(["mmap", "read", "userptr"]).multiple(false))
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("simulate")
                .long("simulate")
                .help("Show a generated test pattern instead of a device")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Debug logging")
                .action(ArgAction::SetTrue),
        )
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Configuration file (explicit, or the default one if present) overlaid with flags.
fn load_config(matches: &ArgMatches) -> anyhow::Result<ViewerConfig> {
    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => ViewerConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => match ViewerConfig::default_path().filter(|p| p.exists()) {
            Some(path) => {
                info!("Using configuration {}", path.display());
                ViewerConfig::load(&path).with_context(|| format!("loading {}", path.display()))?
            }
            None => ViewerConfig::default(),
        },
    };
    apply_overrides(&mut config, matches);
    Ok(config)
}

fn apply_overrides(config: &mut ViewerConfig, matches: &ArgMatches) {
    if let Some(device) = matches.get_one::<PathBuf>("device") {
        config.device = device.clone();
    }
    if let Some(&width) = matches.get_one::<u32>("width") {
        config.width = width;
    }
    if let Some(&height) = matches.get_one::<u32>("height") {
        config.height = height;
    }
    if let Some(&fps) = matches.get_one::<u32>("fps") {
        config.fps = fps;
    }
    if matches.get_flag("mmap") {
        config.io_method = IoMethod::Mmap;
    } else if matches.get_flag("read") {
        config.io_method = IoMethod::Read;
    } else if matches.get_flag("userptr") {
        config.io_method = IoMethod::UserPtr;
    }
}

/// Sets `interrupt` on Ctrl-C.
fn spawn_interrupt_listener(interrupt: StopSignal) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building signal runtime")?;

    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            runtime.block_on(async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        info!("Interrupt received, shutting down");
                        interrupt.stop();
                    }
                    Err(err) => warn!("Unable to listen for interrupt: {}", err),
                }
            })
        })
        .context("starting signal listener")?;
    Ok(())
}

fn open_device(config: &ViewerConfig, simulate: bool) -> anyhow::Result<Arc<dyn CaptureDevice>> {
    if simulate {
        info!("Using simulated camera");
        return Ok(Arc::new(SimulatedDevice::new(SimulatedDeviceConfig::default())));
    }
    Ok(Arc::new(V4l2Device::open(&config.device)?))
}

fn run(matches: &ArgMatches) -> anyhow::Result<()> {
    let config = load_config(matches)?;
    config.validate()?;

    let interrupt = StopSignal::new();
    spawn_interrupt_listener(interrupt.clone())?;

    let device = open_device(&config, matches.get_flag("simulate"))?;
    let mut session = CaptureSession::new(device).with_wait_timeout(config.wait_timeout());
    let format = session.configure(config.frame_size(), config.fourcc()?, config.fps)?;
    let granted = session.allocate(config.buffer_count)?;
    if granted != config.buffer_count as usize {
        info!("Driver granted {} of {} buffers", granted, config.buffer_count);
    }

    let display = DisplaySurface::create(&config.window_title, format.size)?;
    let handoff = session.handoff().context("session has no display state")?;
    session.start_streaming()?;

    let window = display.window();
    let render_state = handoff.clone();
    session.spawn(move || {
        let presenter = SoftbufferPresenter::new(window, format.size, format.fourcc)?;
        Ok(DisplayPipeline::new(presenter, render_state, format.fourcc))
    })?;

    let mut events = DisplayEvents::new(display, ViewerControls::new(handoff));
    let reason = events.run(&session, &interrupt);

    let result = session.shutdown();
    events.into_source().destroy();

    if let Some(stats) = result? {
        info!("Stopped ({:?}) after {} frames", reason, stats.frames);
    }
    Ok(())
}

fn main() -> ExitCode {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("verbose"));

    match run(&matches) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{:#}", err);
            eprintln!("camview: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_is_consistent() {
        cli().debug_assert();
    }

    #[test]
    fn test_flags_override_config() {
        let matches = cli()
            .try_get_matches_from(["camview", "-d", "/dev/video2", "-x", "1280", "-y", "720", "-f", "15", "-r"])
            .unwrap();
        let mut config = ViewerConfig::default();
        apply_overrides(&mut config, &matches);

        assert_eq!(config.device, PathBuf::from("/dev/video2"));
        assert_eq!(config.frame_size(), FrameSize::new(1280, 720));
        assert_eq!(config.fps, 15);
        assert_eq!(config.io_method, IoMethod::Read);
        assert!(matches!(config.validate(), Err(CaptureError::UnsupportedIoMethod(IoMethod::Read))));
    }

    #[test]
    fn test_defaults_survive_without_flags() {
        let matches = cli().try_get_matches_from(["camview"]).unwrap();
        let mut config = ViewerConfig::default();
        apply_overrides(&mut config, &matches);
        assert_eq!(config, ViewerConfig::default());
    }

    #[test]
    fn test_io_methods_are_exclusive() {
        assert!(cli().try_get_matches_from(["camview", "-m", "-u"]).is_err());
    }

    #[test]
    fn test_help_lists_keys() {
        let help = cli().render_long_help().to_string();
        assert!(help.contains("restore the startup resolution"));
    }
}
