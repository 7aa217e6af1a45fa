//! IPC command dispatch.
//!
//! Every request is `{cmd, ...}`; the reply value lands in `{ok, result}`.
//! Mode-gated commands post a [`Control`](super::Control) message to the
//! device-owning main loop instead of acting on devices here.

use std::sync::atomic::Ordering;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};

use super::{Control, DaemonShared, Mode};
use crate::cv::auto::{CvAutoInputs, CvAutoSettings, DetectorPosition};
use crate::cv::config as detcfg;
use crate::error::{Error, Result};
use crate::injector::SkillInjector;
use crate::player::PlayOptions;
use crate::recorder::{self, Recording};
use crate::skills::SkillConfig;

pub async fn dispatch(shared: &DaemonShared, msg: Value) -> Result<Value> {
    let cmd = msg
        .get("cmd")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::protocol("missing cmd"))?;

    match cmd {
        "status" => status(shared),
        "combined_status" => combined_status(shared),
        "list" => list(shared),
        "list_recursive" => Ok(json!({
            "files": recorder::list_recordings_recursive(&shared.settings.record_dir),
        })),
        "rename_recording" => rename_recording(shared, &msg),
        "record_start" => {
            require_mode(shared, &[Mode::Bridge], "record")?;
            send_control(shared, Control::StartRecord).await?;
            Ok(json!({"recording": true}))
        }
        "save_last" => {
            let name = str_field(&msg, "name")?;
            let path = shared.save_last(name)?;
            Ok(json!({"saved": path.to_string_lossy()}))
        }
        "discard_last" => {
            shared.discard_last();
            Ok(json!({"discarded": true}))
        }
        "preview_last" => {
            require_mode(shared, &[Mode::Bridge], "preview")?;
            let opts = play_options(shared, &msg);
            send_control(shared, Control::PreviewLast { opts }).await?;
            Ok(json!({"previewed": true}))
        }
        "play" => play(shared, &msg).await,
        "play_selection" => play_selection(shared, &msg).await,
        "stop" => stop(shared),
        "list_skills" => Ok(serde_json::to_value(shared.skills.list())?),
        "save_skill" => {
            let skill: SkillConfig = serde_json::from_value(
                msg.get("skill")
                    .cloned()
                    .ok_or_else(|| Error::protocol("missing skill"))?,
            )?;
            Ok(serde_json::to_value(shared.skills.save(skill)?)?)
        }
        "update_skill" => {
            let id = str_field(&msg, "id")?;
            let updates = msg
                .get("updates")
                .cloned()
                .ok_or_else(|| Error::protocol("missing updates"))?;
            Ok(serde_json::to_value(shared.skills.update(id, &updates)?)?)
        }
        "delete_skill" => {
            let id = str_field(&msg, "id")?;
            Ok(json!({"deleted": shared.skills.delete(id)?}))
        }
        "get_selected_skills" => Ok(serde_json::to_value(shared.skills.selected())?),
        "reorder_skills" => {
            let ids: Vec<String> = serde_json::from_value(
                msg.get("ids")
                    .cloned()
                    .ok_or_else(|| Error::protocol("missing ids"))?,
            )?;
            Ok(serde_json::to_value(shared.skills.reorder(&ids)?)?)
        }
        "cv_status" => Ok(serde_json::to_value(shared.capture.status())?),
        "cv_start" => {
            shared.capture.start().await?;
            shared.events.emit("CV_STARTED", json!({}));
            Ok(json!({"started": true}))
        }
        "cv_stop" => {
            shared.capture.stop().await;
            shared
                .detection_enabled
                .store(false, Ordering::SeqCst);
            shared.events.emit("CV_STOPPED", json!({}));
            Ok(json!({"stopped": true}))
        }
        "cv_get_frame" => cv_get_frame(shared),
        "cv_get_raw_minimap" => cv_get_raw_minimap(shared),
        "cv_reload_config" => cv_reload_config(shared),
        "object_detection_status" => {
            let detector = shared.detector.lock().unwrap_or_else(|p| p.into_inner());
            Ok(json!({
                "enabled": shared.detection_enabled.load(Ordering::SeqCst),
                "config": detcfg::export_config(detector.config()),
                "performance": serde_json::to_value(detector.perf_stats())?,
            }))
        }
        "object_detection_start" => {
            if !shared.capture.is_running() {
                return Err(Error::state("CV capture must be started first"));
            }
            shared.detection_enabled.store(true, Ordering::SeqCst);
            Ok(json!({"enabled": true}))
        }
        "object_detection_stop" => {
            shared.detection_enabled.store(false, Ordering::SeqCst);
            Ok(json!({"enabled": false}))
        }
        "object_detection_config" => object_detection_config(shared, &msg),
        "object_detection_config_save" => {
            let config = {
                let detector = shared.detector.lock().unwrap_or_else(|p| p.into_inner());
                detector.config().clone()
            };
            detcfg::save_config(&shared.settings.detector_config_path(), &config)?;
            Ok(json!({"saved": true}))
        }
        "object_detection_config_export" => {
            let detector = shared.detector.lock().unwrap_or_else(|p| p.into_inner());
            Ok(detcfg::export_config(detector.config()))
        }
        "object_detection_performance" => {
            let mut detector = shared.detector.lock().unwrap_or_else(|p| p.into_inner());
            let stats = detector.perf_stats();
            if msg.get("reset").and_then(Value::as_bool) == Some(true) {
                detector.reset_perf_stats();
            }
            Ok(serde_json::to_value(stats)?)
        }
        "object_detection_calibrate" => object_detection_calibrate(shared, &msg),
        "cv_auto_start" => cv_auto_start(shared, &msg).await,
        "cv_auto_stop" => {
            if shared.mode() == Mode::CvAuto {
                shared.run_cancel.cancel();
                Ok(json!({"stopping": true}))
            } else {
                Ok(json!({"stopping": false, "message": "CV-AUTO not running"}))
            }
        }
        "cv_auto_status" => {
            let status = shared
                .auto_status
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .clone();
            Ok(serde_json::to_value(status)?)
        }
        "system_stats" => system_stats(),
        other => Err(Error::protocol(format!("unknown cmd: {other}"))),
    }
}

fn str_field<'a>(msg: &'a Value, field: &str) -> Result<&'a str> {
    msg.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| Error::protocol(format!("missing {field}")))
}

fn f64_field(msg: &Value, field: &str, default: f64) -> f64 {
    msg.get(field).and_then(Value::as_f64).unwrap_or(default)
}

fn require_mode(shared: &DaemonShared, allowed: &[Mode], what: &str) -> Result<()> {
    let mode = shared.mode();
    if allowed.contains(&mode) {
        Ok(())
    } else {
        Err(Error::state(format!(
            "cannot {what} from mode {}",
            mode.as_str()
        )))
    }
}

async fn send_control(shared: &DaemonShared, ctrl: Control) -> Result<()> {
    shared
        .ctrl_tx
        .send(ctrl)
        .await
        .map_err(|_| Error::state("daemon main loop unavailable"))
}

fn play_options(shared: &DaemonShared, msg: &Value) -> PlayOptions {
    PlayOptions {
        speed: f64_field(msg, "speed", 1.0),
        jitter_time: f64_field(msg, "jitter_time", 0.0),
        jitter_hold: f64_field(msg, "jitter_hold", 0.0),
        min_hold_s: shared.settings.min_hold_s,
        min_repeat_same_key_s: shared.settings.min_repeat_same_key_s,
        loop_count: msg.get("loop").and_then(Value::as_i64).unwrap_or(1),
        ignore_keys: msg
            .get("ignore_keys")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        ignore_tolerance: f64_field(msg, "ignore_tolerance", 0.0),
        seed: None,
    }
}

/// Skill injector from explicitly passed skills, or from the selected set
/// when `use_skills` is requested.
fn build_injector(shared: &DaemonShared, msg: &Value) -> Result<Option<SkillInjector>> {
    let skills: Vec<SkillConfig> = match msg.get("active_skills").and_then(Value::as_array) {
        Some(list) if !list.is_empty() => list
            .iter()
            .map(|v| serde_json::from_value(v.clone()).map_err(Error::from))
            .collect::<Result<Vec<_>>>()?,
        _ if msg.get("use_skills").and_then(Value::as_bool) == Some(true) => {
            shared.skills.selected()
        }
        _ => Vec::new(),
    };
    let selected: Vec<SkillConfig> = skills.into_iter().filter(|s| s.is_selected).collect();
    Ok(if selected.is_empty() {
        None
    } else {
        Some(SkillInjector::new(selected))
    })
}

fn top_level_files(shared: &DaemonShared) -> Vec<Value> {
    let mut names: Vec<String> = std::fs::read_dir(&shared.settings.record_dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter_map(|e| {
                    let name = e.file_name().to_string_lossy().into_owned();
                    name.ends_with(".json").then_some(name)
                })
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
        .into_iter()
        .map(|name| {
            let path = shared.settings.record_dir.join(&name);
            let (size, mtime) = std::fs::metadata(&path)
                .map(|m| {
                    let mtime = m
                        .modified()
                        .ok()
                        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                        .map(|d| d.as_secs() as i64)
                        .unwrap_or(0);
                    (m.len(), mtime)
                })
                .unwrap_or((0, 0));
            json!({"name": name, "path": path.to_string_lossy(), "size": size, "mtime": mtime})
        })
        .collect()
}

fn status(shared: &DaemonShared) -> Result<Value> {
    let keyboard = shared
        .keyboard_path
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .as_ref()
        .map(|p| p.to_string_lossy().into_owned());
    let have_last = shared
        .last_actions
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .is_some();
    let current = shared
        .current_playing
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .clone();
    Ok(json!({
        "mode": shared.mode().as_str(),
        "record_dir": shared.settings.record_dir.to_string_lossy(),
        "socket": shared.settings.socket_path.to_string_lossy(),
        "keyboard": keyboard,
        "have_last_actions": have_last,
        "files": top_level_files(shared),
        "current_playing_file": current,
    }))
}

fn combined_status(shared: &DaemonShared) -> Result<Value> {
    let auto = shared
        .auto_status
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .clone();
    Ok(json!({
        "daemon": status(shared)?,
        "cv": serde_json::to_value(shared.capture.status())?,
        "cv_auto": serde_json::to_value(auto)?,
    }))
}

fn list(shared: &DaemonShared) -> Result<Value> {
    let files: Vec<String> = top_level_files(shared)
        .into_iter()
        .filter_map(|v| v.get("name").and_then(Value::as_str).map(str::to_string))
        .collect();
    Ok(json!({"files": files}))
}

fn rename_recording(shared: &DaemonShared, msg: &Value) -> Result<Value> {
    let from = str_field(msg, "from")?;
    let to = str_field(msg, "to")?;
    let src = recorder::resolve_record_path(&shared.settings.record_dir, from)?;
    let dst = recorder::resolve_record_path(&shared.settings.record_dir, to)?;
    if !src.exists() {
        return Err(Error::NotFound(from.to_string()));
    }
    if dst.exists() {
        return Err(Error::state(format!("target already exists: {to}")));
    }
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::rename(&src, &dst)?;
    Ok(json!({"renamed": dst.to_string_lossy()}))
}

async fn play(shared: &DaemonShared, msg: &Value) -> Result<Value> {
    require_mode(shared, &[Mode::Bridge], "play")?;
    let name = str_field(msg, "file")?;
    let path = recorder::resolve_record_path(&shared.settings.record_dir, name)?;
    if !path.exists() {
        return Err(Error::NotFound(name.to_string()));
    }
    // Parse now so a corrupt file is a protocol error, not a playback one.
    Recording::load(&path)?;
    let opts = play_options(shared, msg);
    let injector = build_injector(shared, msg)?;
    let reply = json!({
        "playing": path.to_string_lossy(),
        "speed": opts.speed,
        "loop": opts.loop_count,
    });
    send_control(
        shared,
        Control::Play {
            paths: vec![path],
            opts,
            injector,
        },
    )
    .await?;
    Ok(reply)
}

async fn play_selection(shared: &DaemonShared, msg: &Value) -> Result<Value> {
    require_mode(shared, &[Mode::Bridge], "play")?;
    let names: Vec<String> = serde_json::from_value(
        msg.get("names")
            .cloned()
            .ok_or_else(|| Error::protocol("empty selection"))?,
    )?;
    if names.is_empty() {
        return Err(Error::protocol("empty selection"));
    }
    let mut paths = Vec::new();
    for name in &names {
        let path = recorder::resolve_record_path(&shared.settings.record_dir, name)?;
        if path.exists() {
            paths.push(path);
        }
    }
    if paths.is_empty() {
        return Err(Error::NotFound("no valid files in selection".to_string()));
    }
    let opts = play_options(shared, msg);
    let injector = build_injector(shared, msg)?;
    let reply = json!({
        "playlist": paths.iter().map(|p| p.to_string_lossy()).collect::<Vec<_>>(),
        "loop": opts.loop_count,
    });
    send_control(shared, Control::Play { paths, opts, injector }).await?;
    Ok(reply)
}

fn stop(shared: &DaemonShared) -> Result<Value> {
    let mode = shared.mode();
    match mode {
        Mode::Playing | Mode::CvAuto | Mode::Recording => {
            shared.run_cancel.cancel();
            Ok(json!({"stopping": mode.as_str(), "mode": mode.as_str()}))
        }
        _ => Ok(json!({"mode": mode.as_str(), "nothing_to_stop": true})),
    }
}

fn cv_get_frame(shared: &DaemonShared) -> Result<Value> {
    let (jpeg, meta) = shared
        .capture
        .slot()
        .latest()
        .ok_or_else(|| Error::state("no frame available"))?;
    Ok(json!({
        "frame": BASE64.encode(&jpeg),
        "metadata": serde_json::to_value(meta)?,
    }))
}

/// Crop the active map region out of the latest frame and return it as a
/// base64 JPEG.
fn cv_get_raw_minimap(shared: &DaemonShared) -> Result<Value> {
    let (jpeg, _meta) = shared
        .capture
        .slot()
        .latest()
        .ok_or_else(|| Error::state("no frame available"))?;
    let crop = active_crop(shared).ok_or_else(|| Error::state("no active map config"))?;

    let decoded = image::load_from_memory(&jpeg)
        .map_err(|e| Error::state(format!("frame decode failed: {e}")))?
        .to_rgb8();
    let (x, y, w, h) = crop;
    if x >= decoded.width() || y >= decoded.height() {
        return Err(Error::state("map region lies outside the frame"));
    }
    let w = w.min(decoded.width() - x);
    let h = h.min(decoded.height() - y);
    let region = image::imageops::crop_imm(&decoded, x, y, w, h).to_image();
    let encoded = crate::cv::capture::encode_jpeg(&region, shared.settings.jpeg_quality)?;
    Ok(json!({
        "minimap": BASE64.encode(&encoded),
        "width": w,
        "height": h,
    }))
}

fn active_crop(shared: &DaemonShared) -> Option<(u32, u32, u32, u32)> {
    let maps = shared.maps.lock().unwrap_or_else(|p| p.into_inner());
    maps.active().map(|m| {
        (
            m.tl_x.max(0) as u32,
            m.tl_y.max(0) as u32,
            m.width.max(0) as u32,
            m.height.max(0) as u32,
        )
    })
}

fn cv_reload_config(shared: &DaemonShared) -> Result<Value> {
    {
        let mut maps = shared.maps.lock().unwrap_or_else(|p| p.into_inner());
        maps.reload();
    }
    {
        let mut items = shared.items.lock().unwrap_or_else(|p| p.into_inner());
        items.reload();
    }
    {
        let config = detcfg::load_config(&shared.settings.detector_config_path());
        let mut detector = shared.detector.lock().unwrap_or_else(|p| p.into_inner());
        detector.set_config(config);
    }
    Ok(json!({"reloaded": true}))
}

fn object_detection_config(shared: &DaemonShared, msg: &Value) -> Result<Value> {
    let mut detector = shared.detector.lock().unwrap_or_else(|p| p.into_inner());
    if let Some(patch) = msg.get("config") {
        let mut config = detector.config().clone();
        detcfg::apply_patch(&mut config, patch);
        detector.set_config(config);
    }
    Ok(detcfg::export_config(detector.config()))
}

/// Run a handful of detections against the live frame and report what the
/// pipeline sees, for threshold tuning.
fn object_detection_calibrate(shared: &DaemonShared, msg: &Value) -> Result<Value> {
    if !shared.detection_enabled.load(Ordering::SeqCst) {
        return Err(Error::state("object detection is not enabled"));
    }
    let samples = msg
        .get("samples")
        .and_then(Value::as_u64)
        .unwrap_or(5)
        .clamp(1, 25);
    let position = DetectorPosition::new(
        shared.capture.slot(),
        std::sync::Arc::clone(&shared.detector),
        active_crop(shared),
    );
    let mut results = Vec::new();
    for _ in 0..samples {
        match position.detect() {
            Some(result) => results.push(serde_json::to_value(result)?),
            None => break,
        }
    }
    if results.is_empty() {
        return Err(Error::state("no frame available for calibration"));
    }
    let perf = {
        let detector = shared.detector.lock().unwrap_or_else(|p| p.into_inner());
        serde_json::to_value(detector.perf_stats())?
    };
    Ok(json!({"samples": results, "performance": perf}))
}

async fn cv_auto_start(shared: &DaemonShared, msg: &Value) -> Result<Value> {
    require_mode(shared, &[Mode::Bridge], "start CV-AUTO")?;
    if !shared.detection_enabled.load(Ordering::SeqCst) {
        return Err(Error::state("object detection must be enabled first"));
    }

    let (item, map_name, crop) = {
        let items = shared.items.lock().unwrap_or_else(|p| p.into_inner());
        let item = items
            .active()
            .ok_or_else(|| Error::state("no active CV item"))?
            .clone();
        let maps = shared.maps.lock().unwrap_or_else(|p| p.into_inner());
        let map = maps
            .active()
            .ok_or_else(|| Error::state("CV item is active but its map config is not loaded"))?;
        let crop = (
            map.tl_x.max(0) as u32,
            map.tl_y.max(0) as u32,
            map.width.max(0) as u32,
            map.height.max(0) as u32,
        );
        (item, map.name.clone(), crop)
    };
    if item.departure_points.is_empty() {
        return Err(Error::state("no departure points configured"));
    }

    let settings = CvAutoSettings {
        loop_count: msg.get("loop").and_then(Value::as_i64).unwrap_or(1),
        speed: f64_field(msg, "speed", 1.0),
        jitter_time: f64_field(msg, "jitter_time", 0.05),
        jitter_hold: f64_field(msg, "jitter_hold", 0.02),
        jump_key: msg
            .get("jump_key")
            .and_then(Value::as_str)
            .unwrap_or("SPACE")
            .to_string(),
        min_hold_s: shared.settings.min_hold_s,
        min_repeat_same_key_s: shared.settings.min_repeat_same_key_s,
    };
    let reply = json!({
        "started": true,
        "map_name": map_name,
        "total_points": item.departure_points.len(),
        "loop": settings.loop_count,
    });
    let inputs = CvAutoInputs {
        settings,
        points: item.departure_points,
        map_name,
        pathfinding_config: item.pathfinding_config,
        hid_path: shared.settings.hid_path.clone(),
        record_dir: shared.settings.record_dir.clone(),
    };
    send_control(
        shared,
        Control::CvAutoStart {
            inputs,
            crop: Some(crop),
        },
    )
    .await?;
    Ok(reply)
}

fn system_stats() -> Result<Value> {
    let loadavg = std::fs::read_to_string("/proc/loadavg")
        .ok()
        .and_then(|s| {
            let mut parts = s.split_whitespace();
            Some(json!([
                parts.next()?.parse::<f64>().ok()?,
                parts.next()?.parse::<f64>().ok()?,
                parts.next()?.parse::<f64>().ok()?,
            ]))
        })
        .unwrap_or(Value::Null);

    let (mem_total_kb, mem_available_kb) = std::fs::read_to_string("/proc/meminfo")
        .map(|text| {
            let grab = |key: &str| {
                text.lines()
                    .find(|l| l.starts_with(key))
                    .and_then(|l| l.split_whitespace().nth(1))
                    .and_then(|v| v.parse::<u64>().ok())
            };
            (grab("MemTotal:"), grab("MemAvailable:"))
        })
        .unwrap_or((None, None));

    let uptime_seconds = std::fs::read_to_string("/proc/uptime")
        .ok()
        .and_then(|s| s.split_whitespace().next()?.parse::<f64>().ok())
        .map(|v| v as u64);

    let temperature = std::fs::read_to_string("/sys/class/thermal/thermal_zone0/temp")
        .ok()
        .and_then(|s| s.trim().parse::<f64>().ok())
        .map(|milli| milli / 1000.0);

    Ok(json!({
        "loadavg": loadavg,
        "memory_total_mb": mem_total_kb.map(|kb| kb as f64 / 1024.0),
        "memory_available_mb": mem_available_kb.map(|kb| kb as f64 / 1024.0),
        "uptime_seconds": uptime_seconds,
        "temperature": temperature,
    }))
}
