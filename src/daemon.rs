//! The daemon: mode state machine, exclusive device ownership, and the glue
//! between the bridge, recorder, player, skill injector, CV subsystem and
//! the IPC plane.
//!
//! Mode flow: BRIDGE ↔ RECORDING → POSTRECORD {save, preview, discard} →
//! BRIDGE; BRIDGE → PLAYING → BRIDGE; BRIDGE → CV_AUTO → BRIDGE. Only one
//! of RECORDING/PLAYING/CV_AUTO is active at a time. The main loop is the
//! sole owner of the keyboard device; IPC commands that need a mode change
//! post a [`Control`] message here instead of touching devices themselves.

pub mod commands;

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::bridge::{self, Bridge, BridgeAction};
use crate::cancel::CancelFlag;
use crate::config::Settings;
use crate::cv::auto::{self, AutoStatus, CvAutoInputs, DetectorPosition};
use crate::cv::capture::CvCapture;
use crate::cv::detect::MinimapDetector;
use crate::cv::item::CvItemStore;
use crate::cv::map::MapStore;
use crate::error::{Error, Result};
use crate::events::EventLog;
use crate::evdev::InputDevice;
use crate::hid::HidWriter;
use crate::injector::SkillInjector;
use crate::ipc;
use crate::keymap::{parse_hotkey, Hotkey};
use crate::player::{PlayOptions, Player};
use crate::recorder::{Action, Recording};
use crate::skills::SkillManager;

/// Postrecord choice window length.
const CHOICE_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Bridge,
    Recording,
    Postrecord,
    Playing,
    CvAuto,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Bridge => "BRIDGE",
            Mode::Recording => "RECORDING",
            Mode::Postrecord => "POSTRECORD",
            Mode::Playing => "PLAYING",
            Mode::CvAuto => "CV_AUTO",
        }
    }
}

/// Requests from the IPC dispatcher to the device-owning main loop.
pub enum Control {
    StartRecord,
    Play {
        paths: Vec<PathBuf>,
        opts: PlayOptions,
        injector: Option<SkillInjector>,
    },
    PreviewLast {
        opts: PlayOptions,
    },
    CvAutoStart {
        inputs: CvAutoInputs,
        crop: Option<(u32, u32, u32, u32)>,
    },
}

/// State shared between the main loop and the IPC dispatcher.
pub struct DaemonShared {
    pub settings: Settings,
    pub events: EventLog,
    pub mode: Mutex<Mode>,
    pub last_actions: Mutex<Option<Vec<Action>>>,
    pub current_playing: Mutex<Option<String>>,
    pub keyboard_path: Mutex<Option<PathBuf>>,
    /// Cancels the active playback / recording / CV-AUTO run.
    pub run_cancel: CancelFlag,
    pub skills: SkillManager,
    pub maps: Mutex<MapStore>,
    pub items: Mutex<CvItemStore>,
    pub detector: Arc<Mutex<MinimapDetector>>,
    pub detection_enabled: AtomicBool,
    pub capture: CvCapture,
    pub auto_status: Arc<Mutex<AutoStatus>>,
    pub ctrl_tx: mpsc::Sender<Control>,
}

impl DaemonShared {
    pub fn mode(&self) -> Mode {
        *self.mode.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_mode(&self, mode: Mode) {
        {
            let mut guard = self.mode.lock().unwrap_or_else(|p| p.into_inner());
            *guard = mode;
        }
        self.events.emit("MODE", json!({"mode": mode.as_str()}));
    }

    /// Save the retained recording under `name`; first writer wins.
    pub fn save_last(&self, name: &str) -> Result<PathBuf> {
        let actions = {
            let mut guard = self.last_actions.lock().unwrap_or_else(|p| p.into_inner());
            guard.take().ok_or_else(|| Error::state("no last recording"))?
        };
        let path = crate::recorder::resolve_record_path(&self.settings.record_dir, name)?;
        Recording::from_actions(actions).save(&path)?;
        self.events
            .emit("SAVED", json!({"path": path.to_string_lossy()}));
        Ok(path)
    }

    pub fn discard_last(&self) -> bool {
        let had = {
            let mut guard = self.last_actions.lock().unwrap_or_else(|p| p.into_inner());
            guard.take().is_some()
        };
        if had {
            self.events.emit("DISCARDED", json!({}));
        }
        had
    }
}

pub struct Daemon {
    shared: Arc<DaemonShared>,
    ctrl_rx: Option<mpsc::Receiver<Control>>,
    stop_hotkey: Hotkey,
    record_hotkey: Hotkey,
}

impl Daemon {
    pub fn new(settings: Settings) -> Result<Self> {
        let stop_hotkey = parse_hotkey(&settings.stop_hotkey)?;
        let record_hotkey = parse_hotkey(&settings.record_hotkey)?;
        let events = EventLog::new(&settings.events_path);
        let skills = SkillManager::new(&settings.skills_dir)?;
        let maps = MapStore::load(settings.map_configs_path());
        let items = CvItemStore::load(settings.cv_items_path());
        let detector_config = crate::cv::config::load_config(&settings.detector_config_path());
        let detector = Arc::new(Mutex::new(MinimapDetector::new(detector_config)));
        let capture = CvCapture::new(settings.jpeg_quality, settings.cv_device.clone());

        let (ctrl_tx, ctrl_rx) = mpsc::channel(8);
        let shared = Arc::new(DaemonShared {
            events,
            mode: Mutex::new(Mode::Bridge),
            last_actions: Mutex::new(None),
            current_playing: Mutex::new(None),
            keyboard_path: Mutex::new(settings.keyboard.clone()),
            run_cancel: CancelFlag::new(),
            skills,
            maps: Mutex::new(maps),
            items: Mutex::new(items),
            detector,
            detection_enabled: AtomicBool::new(false),
            capture,
            auto_status: Arc::new(Mutex::new(AutoStatus::default())),
            ctrl_tx,
            settings,
        });
        Ok(Daemon {
            shared,
            ctrl_rx: Some(ctrl_rx),
            stop_hotkey,
            record_hotkey,
        })
    }

    pub fn shared(&self) -> Arc<DaemonShared> {
        Arc::clone(&self.shared)
    }

    /// Bind the control socket, start the dispatcher, and run the main loop
    /// until the process is signalled.
    pub async fn run(mut self) -> Result<()> {
        std::fs::create_dir_all(&self.shared.settings.record_dir)?;

        let (ipc_tx, mut ipc_rx) = mpsc::channel::<ipc::IpcRequest>(32);
        let socket_path = self.shared.settings.socket_path.clone();
        info!(socket = %socket_path.display(), "daemon starting");

        let ipc_task = tokio::spawn(async move { ipc::serve(&socket_path, ipc_tx).await });

        let dispatch_shared = Arc::clone(&self.shared);
        let dispatcher = tokio::spawn(async move {
            while let Some(req) = ipc_rx.recv().await {
                let reply = commands::dispatch(&dispatch_shared, req.msg).await;
                if let Err(e) = &reply {
                    warn!(error = %e, kind = e.kind(), "command failed");
                }
                let _ = req.respond.send(reply);
            }
        });

        let mut ctrl_rx = self
            .ctrl_rx
            .take()
            .ok_or_else(|| Error::FatalInit("daemon already ran".into()))?;
        let main = self.main_loop(&mut ctrl_rx);
        tokio::select! {
            result = main => {
                if let Err(e) = &result {
                    error!(error = %e, kind = e.kind(), "main loop terminated");
                }
                result?
            }
            result = ipc_task => {
                match result {
                    Ok(Err(e)) => return Err(e),
                    _ => return Err(Error::FatalInit("IPC server exited".into())),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
            }
        }

        dispatcher.abort();
        self.shared.capture.stop().await;
        Ok(())
    }

    async fn main_loop(&mut self, ctrl_rx: &mut mpsc::Receiver<Control>) -> Result<()> {
        loop {
            self.shared.set_mode(Mode::Bridge);
            let kb = bridge::wait_for_keyboard(
                self.shared.settings.keyboard.as_deref(),
            )
            .await;
            {
                let mut guard = self
                    .shared
                    .keyboard_path
                    .lock()
                    .unwrap_or_else(|p| p.into_inner());
                *guard = Some(kb.clone());
            }

            let mut writer = match HidWriter::open(&self.shared.settings.hid_path) {
                Ok(w) => w,
                Err(e) => {
                    warn!(error = %e, "HID endpoint unavailable, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            let mut bridge = match self.open_bridge(&kb, Vec::new()) {
                Ok(b) => b,
                Err(e) => {
                    warn!(error = %e, "keyboard unavailable, retrying");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                }
            };

            tokio::select! {
                result = bridge.run(Some(&mut writer)) => {
                    drop(bridge);
                    match result {
                        Ok(BridgeAction::Record) => {
                            if let Err(e) = self.record_flow(&kb, &mut writer).await {
                                warn!(error = %e, kind = e.kind(), "record flow failed");
                            }
                        }
                        Ok(_) => {} // STOP in bridge mode: stay bridging.
                        Err(e) => {
                            warn!(error = %e, "bridge error, reopening devices");
                            tokio::time::sleep(Duration::from_millis(500)).await;
                        }
                    }
                }
                ctrl = ctrl_rx.recv() => {
                    drop(bridge);
                    let Some(ctrl) = ctrl else {
                        return Err(Error::FatalInit("control channel closed".into()));
                    };
                    if let Err(e) = self.handle_control(ctrl, &kb, &mut writer).await {
                        warn!(error = %e, kind = e.kind(), "control request failed");
                    }
                }
            }
        }
    }

    fn open_bridge(&self, kb: &std::path::Path, extras: Vec<(Hotkey, String)>) -> Result<Bridge> {
        let mut dev = InputDevice::open(kb)?;
        dev.grab()?;
        Bridge::new(dev, self.stop_hotkey, Some(self.record_hotkey), extras)
    }

    /// RECORDING and the POSTRECORD choice window.
    async fn record_flow(&mut self, kb: &PathBuf, writer: &mut HidWriter) -> Result<()> {
        self.shared.set_mode(Mode::Recording);
        self.shared.events.emit("RECORD_START", json!({}));
        self.shared.run_cancel.reset();

        let mut bridge = self.open_bridge(kb, Vec::new())?;
        let cancel = self.shared.run_cancel.clone();
        let actions = tokio::select! {
            result = bridge.run_record(writer) => result?,
            _ = watch_cancel(cancel) => {
                info!("recording cancelled by request");
                Vec::new()
            }
        };
        drop(bridge);

        let count = actions.len();
        {
            let mut guard = self
                .shared
                .last_actions
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            *guard = Some(actions);
        }
        self.shared
            .events
            .emit("RECORD_STOP", json!({"count": count}));

        self.choice_window(kb, writer).await
    }

    /// POSTRECORD: extra hotkeys pick save / preview / discard, with an
    /// 8-second timeout that keeps the recording in memory.
    async fn choice_window(&mut self, kb: &PathBuf, writer: &mut HidWriter) -> Result<()> {
        let choices = [
            ("LCTL+S", "CHOICE_SAVE"),
            ("LCTL+P", "CHOICE_PLAY"),
            ("LCTL+D", "CHOICE_DISCARD"),
        ];
        loop {
            self.shared.set_mode(Mode::Postrecord);
            self.shared.events.emit(
                "CHOICE_MENU",
                json!({"keys": choices.iter().map(|(k, _)| *k).collect::<Vec<_>>()}),
            );

            let extras: Vec<(Hotkey, String)> = choices
                .iter()
                .filter_map(|&(spec, label)| {
                    parse_hotkey(spec).ok().map(|hk| (hk, label.to_string()))
                })
                .collect();
            let mut bridge = self.open_bridge(kb, extras)?;

            let outcome = tokio::time::timeout(CHOICE_TIMEOUT, bridge.run(Some(writer))).await;
            drop(bridge);

            match outcome {
                Err(_elapsed) => {
                    // Timeout: back to bridge, recording stays in memory.
                    self.shared.events.emit("CHOICE_TIMEOUT", json!({}));
                    return Ok(());
                }
                Ok(Err(e)) => return Err(e),
                Ok(Ok(BridgeAction::Extra(label))) => {
                    self.shared
                        .events
                        .emit("CHOICE_SELECTED", json!({"label": label}));
                    match label.as_str() {
                        "CHOICE_SAVE" => {
                            let name =
                                chrono::Utc::now().format("rec_%Y%m%d_%H%M%S").to_string();
                            match self.shared.save_last(&name) {
                                Ok(path) => info!(path = %path.display(), "recording saved by hotkey"),
                                // A socket save may have won the race.
                                Err(e) => warn!(error = %e, "hotkey save rejected"),
                            }
                            return Ok(());
                        }
                        "CHOICE_PLAY" => {
                            let opts = PlayOptions {
                                min_hold_s: self.shared.settings.min_hold_s,
                                min_repeat_same_key_s: self
                                    .shared
                                    .settings
                                    .min_repeat_same_key_s,
                                ..PlayOptions::default()
                            };
                            if let Err(e) = self.preview_last(kb, writer, &opts).await {
                                // A socket discard may have emptied the slot.
                                warn!(error = %e, "preview rejected");
                                return Ok(());
                            }
                            continue;
                        }
                        "CHOICE_DISCARD" => {
                            self.shared.discard_last();
                            return Ok(());
                        }
                        _ => return Ok(()),
                    }
                }
                // Stop or a fresh record chord closes the window, keeping
                // the recording in memory.
                Ok(Ok(_)) => return Ok(()),
            }
        }
    }

    async fn preview_last(
        &self,
        kb: &PathBuf,
        writer: &mut HidWriter,
        opts: &PlayOptions,
    ) -> Result<()> {
        let actions = {
            let guard = self
                .shared
                .last_actions
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            guard.clone()
        };
        let Some(actions) = actions else {
            return Err(Error::state("no last recording"));
        };

        self.shared.set_mode(Mode::Playing);
        self.shared
            .events
            .emit("PLAY_START", json!({"file": "<preview>"}));
        self.shared.run_cancel.reset();
        let watcher = self.spawn_stop_watcher(kb);

        let result = {
            let mut player = Player::new(&mut *writer);
            player
                .play_actions(&actions, opts, &self.shared.run_cancel, None)
                .await
        };
        watcher.abort();
        self.shared.events.emit("PLAY_STOP", json!({}));
        result.map(|_| ())
    }

    /// Watch the grabbed keyboard for the stop chord during playback and
    /// trip the shared cancel flag.
    fn spawn_stop_watcher(&self, kb: &PathBuf) -> tokio::task::JoinHandle<()> {
        let kb = kb.clone();
        let hotkey = self.stop_hotkey;
        let cancel = self.shared.run_cancel.clone();
        tokio::spawn(async move {
            match InputDevice::open(&kb) {
                Ok(dev) => {
                    if bridge::wait_hotkey_release(dev, hotkey).await.is_ok() {
                        info!("stop hotkey fired during playback");
                        cancel.cancel();
                    }
                }
                Err(e) => warn!(error = %e, "stop watcher could not open keyboard"),
            }
        })
    }

    async fn handle_control(
        &mut self,
        ctrl: Control,
        kb: &PathBuf,
        writer: &mut HidWriter,
    ) -> Result<()> {
        match ctrl {
            Control::StartRecord => self.record_flow(kb, writer).await,
            Control::PreviewLast { opts } => self.preview_last(kb, writer, &opts).await,
            Control::Play {
                paths,
                opts,
                mut injector,
            } => {
                self.shared.set_mode(Mode::Playing);
                let display = paths
                    .first()
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_default();
                {
                    let mut guard = self
                        .shared
                        .current_playing
                        .lock()
                        .unwrap_or_else(|p| p.into_inner());
                    *guard = Some(display.clone());
                }
                self.shared
                    .events
                    .emit("PLAY_START", json!({"file": display}));
                self.shared.run_cancel.reset();
                let watcher = self.spawn_stop_watcher(kb);

                let result = {
                    let mut player = Player::new(&mut *writer);
                    if paths.len() == 1 {
                        player
                            .play(
                                &paths[0],
                                &opts,
                                &self.shared.run_cancel,
                                injector.as_mut(),
                            )
                            .await
                    } else {
                        player
                            .play_playlist(
                                &paths,
                                &opts,
                                &self.shared.run_cancel,
                                injector.as_mut(),
                            )
                            .await
                    }
                };
                watcher.abort();
                {
                    let mut guard = self
                        .shared
                        .current_playing
                        .lock()
                        .unwrap_or_else(|p| p.into_inner());
                    *guard = None;
                }
                self.shared.events.emit("PLAY_STOP", json!({}));
                result.map(|_| ())
            }
            Control::CvAutoStart { inputs, crop } => {
                self.shared.set_mode(Mode::CvAuto);
                self.shared.run_cancel.reset();
                {
                    let mut status = self
                        .shared
                        .auto_status
                        .lock()
                        .unwrap_or_else(|p| p.into_inner());
                    *status = AutoStatus {
                        enabled: true,
                        ..AutoStatus::default()
                    };
                }
                let watcher = self.spawn_stop_watcher(kb);
                let position = DetectorPosition::new(
                    self.shared.capture.slot(),
                    Arc::clone(&self.shared.detector),
                    crop,
                );
                let result = auto::run(
                    inputs,
                    position,
                    self.shared.events.clone(),
                    self.shared.run_cancel.clone(),
                    Arc::clone(&self.shared.auto_status),
                )
                .await;
                watcher.abort();
                result
            }
        }
    }
}

async fn watch_cancel(cancel: CancelFlag) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
