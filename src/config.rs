//! Runtime settings resolved from CLI flags, environment variables, and
//! platform defaults.
//!
//! Environment overrides: `KEYBRIDGE_RECDIR`, `KEYBRIDGE_SKILLSDIR`,
//! `KEYBRIDGE_CONFIG_DIR`, `KEYBRIDGE_SOCKET`, `KEYBRIDGE_EVENTS`,
//! `KEYBRIDGE_CV_DEVICE`.

use std::path::PathBuf;

use crate::cli::Args;

#[derive(Debug, Clone)]
pub struct Settings {
    pub keyboard: Option<PathBuf>,
    pub hid_path: PathBuf,
    pub record_dir: PathBuf,
    pub skills_dir: PathBuf,
    /// Map configs, CV items and detector config live here.
    pub config_dir: PathBuf,
    pub socket_path: PathBuf,
    pub events_path: PathBuf,
    pub stop_hotkey: String,
    pub record_hotkey: String,
    pub min_hold_s: f64,
    pub min_repeat_same_key_s: f64,
    pub jpeg_quality: u8,
    /// Preferred capture device (index, /dev path, or name substring).
    pub cv_device: Option<String>,
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/root"))
}

fn data_dir() -> PathBuf {
    home_dir().join(".local/share/keybridge")
}

fn env_path(var: &str, default: PathBuf) -> PathBuf {
    std::env::var_os(var).map(PathBuf::from).unwrap_or(default)
}

impl Settings {
    pub fn resolve(args: &Args) -> Self {
        let data = data_dir();
        let record_dir = match &args.record_dir {
            Some(dir) => dir.clone(),
            None => env_path("KEYBRIDGE_RECDIR", data.join("records")),
        };
        Settings {
            keyboard: args.keyboard.clone(),
            hid_path: args.hid.clone(),
            record_dir,
            skills_dir: args
                .skills_dir
                .clone()
                .unwrap_or_else(|| env_path("KEYBRIDGE_SKILLSDIR", data.join("skills"))),
            config_dir: env_path("KEYBRIDGE_CONFIG_DIR", data.clone()),
            socket_path: args.socket.clone().unwrap_or_else(|| {
                env_path("KEYBRIDGE_SOCKET", PathBuf::from("/run/keybridge.sock"))
            }),
            events_path: env_path("KEYBRIDGE_EVENTS", PathBuf::from("/run/keybridge.events")),
            stop_hotkey: args.stop_hotkey.clone(),
            record_hotkey: args.record_hotkey.clone(),
            min_hold_s: 0.083,
            min_repeat_same_key_s: 0.09,
            jpeg_quality: 70,
            cv_device: std::env::var("KEYBRIDGE_CV_DEVICE")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
        }
    }

    pub fn map_configs_path(&self) -> PathBuf {
        self.config_dir.join("map_configs.json")
    }

    pub fn cv_items_path(&self) -> PathBuf {
        self.config_dir.join("cv_items.json")
    }

    pub fn detector_config_path(&self) -> PathBuf {
        self.config_dir.join("object_detection_config.json")
    }
}
