//! Detector configuration persistence.
//!
//! The on-disk document is nested (`player.color_range.hsv_lower`, …);
//! environment variables override the file; defaults fill the rest.
//!
//! Recognised variables: `KEYBRIDGE_PLAYER_COLOR_H_MIN`,
//! `KEYBRIDGE_PLAYER_COLOR_H_MAX`, `KEYBRIDGE_PLAYER_COLOR_S_MIN`,
//! `KEYBRIDGE_PLAYER_COLOR_V_MIN`, `KEYBRIDGE_OTHER_PLAYER_COLOR_RANGES`
//! (semicolon-separated six-tuples), `KEYBRIDGE_BLOB_MIN_SIZE`,
//! `KEYBRIDGE_BLOB_MAX_SIZE`, `KEYBRIDGE_BLOB_MIN_CIRCULARITY`.

use std::fs;
use std::path::Path;

use serde_json::{json, Value};
use tracing::{info, warn};

use super::detect::DetectorConfig;
use crate::error::Result;

fn u8_triple(v: &Value) -> Option<[u8; 3]> {
    let arr = v.as_array()?;
    if arr.len() != 3 {
        return None;
    }
    let mut out = [0u8; 3];
    for (i, item) in arr.iter().enumerate() {
        out[i] = item.as_u64()?.min(255) as u8;
    }
    Some(out)
}

/// Merge a nested config document onto `config` (missing fields keep
/// their current values).
pub fn apply_patch(config: &mut DetectorConfig, doc: &Value) {
    if let Some(player) = doc.get("player") {
        if let Some(cr) = player.get("color_range") {
            if let Some(lo) = cr.get("hsv_lower").and_then(u8_triple) {
                config.player_hsv_lower = lo;
            }
            if let Some(hi) = cr.get("hsv_upper").and_then(u8_triple) {
                config.player_hsv_upper = hi;
            }
        }
        if let Some(v) = player.get("blob_size_min").and_then(Value::as_f64) {
            config.min_blob_size = v;
        }
        if let Some(v) = player.get("blob_size_max").and_then(Value::as_f64) {
            config.max_blob_size = v;
        }
        if let Some(v) = player.get("circularity_min").and_then(Value::as_f64) {
            config.min_circularity = v;
        }
    }
    if let Some(other) = doc.get("other_players") {
        if let Some(ranges) = other.get("color_ranges").and_then(Value::as_array) {
            let parsed: Vec<([u8; 3], [u8; 3])> = ranges
                .iter()
                .filter_map(|r| {
                    Some((
                        r.get("hsv_lower").and_then(u8_triple)?,
                        r.get("hsv_upper").and_then(u8_triple)?,
                    ))
                })
                .collect();
            if !parsed.is_empty() {
                config.other_player_hsv_ranges = parsed;
            }
        }
        if let Some(v) = other.get("circularity_min").and_then(Value::as_f64) {
            config.min_circularity_other = v;
        }
    }
    if let Some(ts) = doc.get("temporal_smoothing") {
        if let Some(v) = ts.get("enabled").and_then(Value::as_bool) {
            config.temporal_smoothing = v;
        }
        if let Some(v) = ts.get("alpha").and_then(Value::as_f64) {
            config.smoothing_alpha = v;
        }
    }
}

fn apply_env(config: &mut DetectorConfig) {
    let get = |name: &str| std::env::var(name).ok();
    let parse_u8 = |s: String| s.trim().parse::<u8>().ok();
    let parse_f64 = |s: String| s.trim().parse::<f64>().ok();

    if let Some(h_min) = get("KEYBRIDGE_PLAYER_COLOR_H_MIN").and_then(parse_u8) {
        let h_max = get("KEYBRIDGE_PLAYER_COLOR_H_MAX")
            .and_then(parse_u8)
            .unwrap_or(30);
        let s_min = get("KEYBRIDGE_PLAYER_COLOR_S_MIN")
            .and_then(parse_u8)
            .unwrap_or(100);
        let v_min = get("KEYBRIDGE_PLAYER_COLOR_V_MIN")
            .and_then(parse_u8)
            .unwrap_or(100);
        config.player_hsv_lower = [h_min, s_min, v_min];
        config.player_hsv_upper = [h_max, 255, 255];
    }

    if let Some(spec) = get("KEYBRIDGE_OTHER_PLAYER_COLOR_RANGES") {
        let mut ranges = Vec::new();
        for chunk in spec.split(';') {
            let nums: Vec<u8> = chunk
                .split(',')
                .filter_map(|p| p.trim().parse::<u8>().ok())
                .collect();
            if nums.len() == 6 {
                ranges.push(([nums[0], nums[1], nums[2]], [nums[3], nums[4], nums[5]]));
            }
        }
        if !ranges.is_empty() {
            config.other_player_hsv_ranges = ranges;
        }
    }

    if let Some(v) = get("KEYBRIDGE_BLOB_MIN_SIZE").and_then(parse_f64) {
        config.min_blob_size = v;
    }
    if let Some(v) = get("KEYBRIDGE_BLOB_MAX_SIZE").and_then(parse_f64) {
        config.max_blob_size = v;
    }
    if let Some(v) = get("KEYBRIDGE_BLOB_MIN_CIRCULARITY").and_then(parse_f64) {
        config.min_circularity = v;
    }
}

/// File (if present) then environment, over defaults.
pub fn load_config(path: &Path) -> DetectorConfig {
    let mut config = DetectorConfig::default();
    if path.exists() {
        match fs::read_to_string(path)
            .map_err(crate::error::Error::from)
            .and_then(|t| serde_json::from_str::<Value>(&t).map_err(Into::into))
        {
            Ok(doc) => {
                apply_patch(&mut config, &doc);
                info!(path = %path.display(), "detector config loaded");
            }
            Err(e) => warn!(path = %path.display(), error = %e, "detector config unreadable, using defaults"),
        }
    }
    apply_env(&mut config);
    config
}

/// Nested export document for the config file and `config_export`.
pub fn export_config(config: &DetectorConfig) -> Value {
    json!({
        "enabled": true,
        "player": {
            "color_range": {
                "hsv_lower": config.player_hsv_lower.to_vec(),
                "hsv_upper": config.player_hsv_upper.to_vec(),
            },
            "blob_size_min": config.min_blob_size,
            "blob_size_max": config.max_blob_size,
            "circularity_min": config.min_circularity,
        },
        "other_players": {
            "color_ranges": config
                .other_player_hsv_ranges
                .iter()
                .map(|(lo, hi)| json!({"hsv_lower": lo.to_vec(), "hsv_upper": hi.to_vec()}))
                .collect::<Vec<Value>>(),
            "circularity_min": config.min_circularity_other,
        },
        "temporal_smoothing": {
            "enabled": config.temporal_smoothing,
            "alpha": config.smoothing_alpha,
        },
    })
}

/// Atomic write of the nested document.
pub fn save_config(path: &Path, config: &DetectorConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(&export_config(config))?)?;
    fs::rename(&tmp, path)?;
    info!(path = %path.display(), "detector config saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_the_nested_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("detector.json");
        let mut config = DetectorConfig::default();
        config.player_hsv_lower = [25, 150, 150];
        config.min_blob_size = 3.0;
        config.smoothing_alpha = 0.5;
        save_config(&path, &config).unwrap();

        let loaded = load_config(&path);
        assert_eq!(loaded.player_hsv_lower, [25, 150, 150]);
        assert_eq!(loaded.min_blob_size, 3.0);
        assert_eq!(loaded.smoothing_alpha, 0.5);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_config(&dir.path().join("absent.json"));
        assert_eq!(loaded, DetectorConfig::default());
    }

    #[test]
    fn partial_document_keeps_defaults_elsewhere() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.json");
        std::fs::write(&path, r#"{"player": {"circularity_min": 0.5}}"#).unwrap();
        let loaded = load_config(&path);
        assert_eq!(loaded.min_circularity, 0.5);
        assert_eq!(loaded.max_blob_size, DetectorConfig::default().max_blob_size);
    }
}
