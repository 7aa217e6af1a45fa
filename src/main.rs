// Daemon entry point: CLI parsing, logging setup, device listing modes,
// and the daemon run loop.

use std::process::exit;

use colored::*;
use tracing_subscriber::EnvFilter;

use keybridge::cli;
use keybridge::config::Settings;
use keybridge::daemon::Daemon;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn list_input_devices() -> i32 {
    eprintln!(
        "{}",
        format!("{:<24} {}", "Device", "Name").bold().bright_cyan()
    );
    match keybridge::evdev::list_keyboard_devices() {
        Ok(devices) if devices.is_empty() => {
            eprintln!("{}", "No EV_KEY-capable devices found.".yellow());
            1
        }
        Ok(devices) => {
            for (path, name) in devices {
                eprintln!("{:<24} {}", path.display().to_string().bright_white(), name);
            }
            0
        }
        Err(e) => {
            eprintln!("{} {}", "Error listing devices:".red().bold(), e);
            eprintln!(
                "{}",
                "Listing devices requires read access to /dev/input/event*.".yellow()
            );
            2
        }
    }
}

fn list_video_devices() -> i32 {
    eprintln!(
        "{}",
        format!("{:<16} {:<6} {}", "Device", "Index", "Name")
            .bold()
            .bright_cyan()
    );
    let devices = keybridge::cv::device::list_video_devices();
    if devices.is_empty() {
        eprintln!("{}", "No capture-capable video devices found.".yellow());
        return 1;
    }
    for dev in devices {
        eprintln!(
            "{:<16} {:<6} {}",
            dev.path.display().to_string().bright_white(),
            dev.index,
            dev.name
        );
    }
    0
}

fn main() {
    let args = cli::parse_args();

    if args.list_devices {
        exit(list_input_devices());
    }
    if args.list_video_devices {
        exit(list_video_devices());
    }

    init_tracing();
    let settings = Settings::resolve(&args);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{} {}", "Failed to start runtime:".red().bold(), e);
            exit(1);
        }
    };

    let result = runtime.block_on(async {
        let daemon = Daemon::new(settings)?;
        daemon.run().await
    });

    if let Err(e) = result {
        eprintln!("{} {}", "Daemon exited with error:".red().bold(), e);
        exit(1);
    }
}
