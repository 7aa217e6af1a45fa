use std::path::PathBuf;

use clap::Parser;

/// Keyboard macro appliance daemon: bridges a physical keyboard to a USB
/// gadget target, records and replays keystroke sequences, and can drive
/// recorded movement from an HDMI-capture minimap.
#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    about,
    long_about = "Keyboard macro appliance daemon.\n\
Bridges a physical keyboard (evdev) to a USB-gadget HID endpoint, records\n\
keystroke sequences with microsecond timing, and replays them with humanised\n\
jitter and in-band skill injection. A secondary vision pipeline samples an\n\
HDMI capture card and can drive recorded movement along configured waypoints.\n\
\n\
Control is over a local unix socket (newline-delimited JSON); state changes\n\
are appended to a JSON-lines event log.\n\
\n\
EXAMPLES:\n\
  # Run with auto-detected keyboard:\n\
  sudo keybridge\n\
\n\
  # Pin devices and paths:\n\
  sudo keybridge --keyboard /dev/input/event3 --hid /dev/hidg0 \\\n\
                 --socket /run/keybridge.sock\n\
\n\
  # Inspect hardware:\n\
  sudo keybridge --list-devices\n\
  sudo keybridge --list-video-devices"
)]
pub struct Args {
    /// evdev keyboard node to bridge (auto-detected when omitted).
    #[arg(long, value_name = "PATH")]
    pub keyboard: Option<PathBuf>,

    /// USB-gadget HID endpoint.
    #[arg(long, default_value = "/dev/hidg0", value_name = "PATH")]
    pub hid: PathBuf,

    /// Control socket path.
    #[arg(long, value_name = "PATH")]
    pub socket: Option<PathBuf>,

    /// Directory holding recordings.
    #[arg(long, value_name = "DIR")]
    pub record_dir: Option<PathBuf>,

    /// Directory holding skill configurations.
    #[arg(long, value_name = "DIR")]
    pub skills_dir: Option<PathBuf>,

    /// Stop hotkey chord.
    #[arg(long, default_value = "LCTRL+Q", value_name = "MOD+KEY")]
    pub stop_hotkey: String,

    /// Record hotkey chord.
    #[arg(long, default_value = "LCTRL+R", value_name = "MOD+KEY")]
    pub record_hotkey: String,

    /// List EV_KEY-capable input devices and exit (requires read access to
    /// /dev/input/event*).
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub list_devices: bool,

    /// List capture-capable V4L2 video devices and exit.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub list_video_devices: bool,
}

pub fn parse_args() -> Args {
    Args::parse()
}
