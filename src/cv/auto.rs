//! CV-AUTO: the supervisor that watches the detected player position and
//! drives rotations and navigation along the configured departure points.
//!
//! One pass of the loop: detect → port check → hit check → (rotation →
//! advance → cycle accounting) or navigate → status. The loop exits on
//! cancellation, after the configured number of cycles, on sustained
//! detection loss, or when port-flow navigation fails.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::detect::{DetectionResult, MinimapDetector, Point};
use super::frame::FrameSlot;
use super::map::DeparturePoint;
use super::navigator::{NavigationState, PointNavigator};
use super::pathfind::PathfindingController;
use super::port::{PortDetector, PortFlow};
use super::PositionSource;
use crate::cancel::CancelFlag;
use crate::error::Result;
use crate::events::EventLog;
use crate::hid::{HidWriter, KeyPad};
use crate::keymap;
use crate::player::{PlayOptions, Player};
use crate::recorder;
use crate::util;

/// Sustained detection loss that stops the mode.
const DETECTION_LOSS_TIMEOUT_S: f64 = 10.0;
/// Pause between loop passes.
const LOOP_PAUSE_S: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct CvAutoSettings {
    /// Full cycles through the point list; `<= 0` runs until stopped.
    pub loop_count: i64,
    pub speed: f64,
    pub jitter_time: f64,
    pub jitter_hold: f64,
    pub jump_key: String,
    pub min_hold_s: f64,
    pub min_repeat_same_key_s: f64,
}

impl Default for CvAutoSettings {
    fn default() -> Self {
        CvAutoSettings {
            loop_count: 1,
            speed: 1.0,
            jitter_time: 0.05,
            jitter_hold: 0.02,
            jump_key: "SPACE".to_string(),
            min_hold_s: 0.001,
            min_repeat_same_key_s: 0.010,
        }
    }
}

/// Status shared with the IPC plane while the mode runs.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AutoStatus {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub navigation: Option<NavigationState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player_position: Option<Point>,
}

/// Detector-backed position source: latest JPEG → minimap crop → pipeline.
pub struct DetectorPosition {
    slot: Arc<FrameSlot>,
    detector: Arc<Mutex<MinimapDetector>>,
    /// Minimap rectangle within the full frame (tl_x, tl_y, w, h).
    crop: Option<(u32, u32, u32, u32)>,
}

impl DetectorPosition {
    pub fn new(
        slot: Arc<FrameSlot>,
        detector: Arc<Mutex<MinimapDetector>>,
        crop: Option<(u32, u32, u32, u32)>,
    ) -> Self {
        DetectorPosition {
            slot,
            detector,
            crop,
        }
    }

    /// Full detection on the latest frame.
    pub fn detect(&self) -> Option<DetectionResult> {
        let (jpeg, _meta) = self.slot.latest()?;
        let decoded = image::load_from_memory(&jpeg).ok()?.to_rgb8();
        let frame = match self.crop {
            Some((x, y, w, h)) => {
                if x >= decoded.width() || y >= decoded.height() {
                    return None;
                }
                let w = w.min(decoded.width() - x);
                let h = h.min(decoded.height() - y);
                image::imageops::crop_imm(&decoded, x, y, w, h).to_image()
            }
            None => decoded,
        };
        let mut detector = self.detector.lock().unwrap_or_else(|p| p.into_inner());
        Some(detector.detect(&frame))
    }
}

impl PositionSource for DetectorPosition {
    fn position(&self) -> Option<(i32, i32)> {
        self.detect()
            .filter(|r| r.player.detected)
            .map(|r| (r.player.x, r.player.y))
    }
}

pub struct CvAutoInputs {
    pub settings: CvAutoSettings,
    pub points: Vec<DeparturePoint>,
    pub map_name: String,
    pub pathfinding_config: Value,
    pub hid_path: PathBuf,
    pub record_dir: PathBuf,
}

/// Run the CV-AUTO loop to completion. The caller owns mode transitions and
/// spawning; this only reports through `status` and the event log.
pub async fn run(
    inputs: CvAutoInputs,
    position: DetectorPosition,
    events: EventLog,
    cancel: CancelFlag,
    status: Arc<Mutex<AutoStatus>>,
) -> Result<()> {
    let CvAutoInputs {
        settings,
        points,
        map_name,
        pathfinding_config,
        hid_path,
        record_dir,
    } = inputs;

    let total_points = points.len();
    let mut navigator = PointNavigator::new(points, map_name.clone(), true)?;
    let jump_key = match keymap::name_to_usage(&settings.jump_key) {
        0 => {
            warn!(jump_key = %settings.jump_key, "unknown jump key, using SPACE");
            keymap::USAGE_SPACE
        }
        usage => usage,
    };
    let controller = PathfindingController::new(&pathfinding_config, jump_key);
    let mut port_detector = PortDetector::new();
    let mut pad = KeyPad::new(HidWriter::open(&hid_path)?);

    events.emit(
        "CV_AUTO_STARTED",
        json!({"map_name": map_name, "total_points": total_points}),
    );
    info!(map = %map_name, points = total_points, loops = settings.loop_count, "CV-AUTO running");

    let play_opts = PlayOptions {
        speed: settings.speed,
        jitter_time: settings.jitter_time,
        jitter_hold: settings.jitter_hold,
        min_hold_s: settings.min_hold_s,
        min_repeat_same_key_s: settings.min_repeat_same_key_s,
        loop_count: 1,
        ..PlayOptions::default()
    };

    let mut loop_counter: i64 = 0;
    let mut last_detection = util::now_secs();
    let mut stop_reason: Option<String> = None;

    while !cancel.is_cancelled() {
        let now = util::now_secs();
        let Some(pos) = position.position() else {
            if now - last_detection > DETECTION_LOSS_TIMEOUT_S {
                stop_reason = Some("player detection lost".to_string());
                break;
            }
            if cancel.sleep_cancellable(LOOP_PAUSE_S).await {
                break;
            }
            continue;
        };
        last_detection = now;

        if port_detector.check_port(Some(pos), now) {
            warn!("port detected, resetting navigator");
            navigator.reset();
            port_detector.reset();
            events.emit("CV_AUTO_PORT_DETECTED", json!({}));
            if cancel.sleep_cancellable(1.0).await {
                break;
            }
            continue;
        }
        port_detector.update_position(pos, now);

        let current_point = navigator.current_point().clone();
        if current_point.check_hit(pos.0, pos.1) {
            info!(point = %current_point.name, "departure point hit");
            let rotation = navigator.select_rotation(&current_point);

            if let Some(rotation) = rotation.filter(|_| current_point.auto_play) {
                events.emit(
                    "CV_AUTO_ROTATION_START",
                    json!({"point": current_point.name, "rotation": rotation}),
                );
                let path = recorder::resolve_record_path(&record_dir, &rotation)
                    .unwrap_or_else(|_| record_dir.join(&rotation));
                let outcome = {
                    let mut player = Player::new(pad.sink_mut());
                    player.play(&path, &play_opts, &cancel, None).await
                };
                match outcome {
                    Ok(true) => {
                        events.emit(
                            "CV_AUTO_ROTATION_END",
                            json!({"point": current_point.name, "rotation": rotation}),
                        );
                    }
                    Ok(false) => {
                        // Cancelled mid-rotation; the outer loop exits next.
                    }
                    Err(e) => {
                        warn!(rotation = %rotation, error = %e, "rotation playback failed");
                    }
                }
                pad.all_up()?;
            }

            let prev_index = navigator.state().current_point_index;
            navigator.advance();
            let new_index = navigator.state().current_point_index;
            if new_index == 0 && prev_index > 0 {
                loop_counter += 1;
                info!(completed = loop_counter, target = settings.loop_count, "cycle complete");
                if settings.loop_count > 0 && loop_counter >= settings.loop_count {
                    stop_reason = Some(format!("completed {loop_counter} loop cycles"));
                    break;
                }
            }

            if cancel.sleep_cancellable(LOOP_PAUSE_S).await {
                break;
            }
            let next_point = navigator.current_point().clone();
            if !navigate_to(&controller, &mut pad, &position, &record_dir, &next_point, &events)
                .await?
            {
                stop_reason = Some("port flow navigation failed".to_string());
                break;
            }
        } else if !navigate_to(
            &controller,
            &mut pad,
            &position,
            &record_dir,
            &current_point,
            &events,
        )
        .await?
        {
            stop_reason = Some("port flow navigation failed".to_string());
            break;
        }

        {
            let state = navigator.state();
            let mut s = status.lock().unwrap_or_else(|p| p.into_inner());
            s.enabled = true;
            s.player_position = Some(Point { x: pos.0, y: pos.1 });
            s.navigation = Some(state.clone());
            events.emit(
                "CV_AUTO_STATUS",
                json!({
                    "current_index": state.current_point_index,
                    "current_point": state.current_point_name,
                    "total_points": state.total_points,
                    "player_position": {"x": pos.0, "y": pos.1},
                }),
            );
        }

        if cancel.sleep_cancellable(LOOP_PAUSE_S).await {
            break;
        }
    }

    pad.all_up()?;
    {
        let mut s = status.lock().unwrap_or_else(|p| p.into_inner());
        s.enabled = false;
    }
    match stop_reason {
        Some(reason) => {
            warn!(reason = %reason, "CV-AUTO stopped");
            events.emit("CV_AUTO_ERROR", json!({"reason": reason}));
        }
        None => info!("CV-AUTO stopped by request"),
    }
    events.emit("CV_AUTO_STOPPED", json!({}));
    Ok(())
}

/// Route one navigation step. Returns false only for the fatal case
/// (port-flow failure); pathfinding misses are retried by the outer loop.
async fn navigate_to(
    controller: &PathfindingController,
    pad: &mut KeyPad<HidWriter>,
    position: &DetectorPosition,
    record_dir: &std::path::Path,
    target: &DeparturePoint,
    events: &EventLog,
) -> Result<bool> {
    let Some(current) = position.position() else {
        return Ok(true);
    };
    if target.check_hit(current.0, current.1) {
        return Ok(true);
    }

    if target.is_teleport_point {
        let ok = PortFlow::execute(pad, position, current, target).await?;
        if !ok {
            events.emit("CV_AUTO_ERROR", json!({"reason": "port flow failed", "point": target.name}));
            return Ok(false);
        }
        return Ok(true);
    }

    let reached = controller
        .navigate_to(pad, position, record_dir, current, target)
        .await?;
    if !reached {
        warn!(point = %target.name, "pathfinding did not reach the point, will retry");
    }
    Ok(true)
}
