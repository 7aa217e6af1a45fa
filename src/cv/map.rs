//! Saved minimap capture regions and their departure points (waypoints).
//!
//! One config is active at a time. The store persists the whole registry
//! atomically (`{configs: [...], active_config: name|null}`).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::util;

/// Hit predicate for a departure point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToleranceMode {
    YAxis,
    XAxis,
    YGreater,
    YLess,
    XGreater,
    XLess,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationMode {
    Random,
    Sequential,
    Single,
}

/// Fixed Y tolerance for `Both` (X uses the configured value).
const BOTH_Y_TOLERANCE: i32 = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeparturePoint {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub x: i32,
    pub y: i32,
    #[serde(default)]
    pub order: u32,
    #[serde(default = "default_tolerance_mode")]
    pub tolerance_mode: ToleranceMode,
    #[serde(default = "default_tolerance_value")]
    pub tolerance_value: i32,
    #[serde(default)]
    pub created_at: f64,
    #[serde(default)]
    pub rotation_paths: Vec<String>,
    #[serde(default = "default_rotation_mode")]
    pub rotation_mode: RotationMode,
    #[serde(default)]
    pub is_teleport_point: bool,
    #[serde(default = "default_true")]
    pub auto_play: bool,
    #[serde(default)]
    pub pathfinding_sequence: Option<String>,
}

fn default_tolerance_mode() -> ToleranceMode {
    ToleranceMode::Both
}
fn default_tolerance_value() -> i32 {
    5
}
fn default_rotation_mode() -> RotationMode {
    RotationMode::Random
}
fn default_true() -> bool {
    true
}

impl DeparturePoint {
    /// Does the current position satisfy this point's predicate?
    pub fn check_hit(&self, cx: i32, cy: i32) -> bool {
        match self.tolerance_mode {
            ToleranceMode::YAxis => (cy - self.y).abs() <= self.tolerance_value,
            ToleranceMode::XAxis => (cx - self.x).abs() <= self.tolerance_value,
            ToleranceMode::YGreater => cy > self.y,
            ToleranceMode::YLess => cy < self.y,
            ToleranceMode::XGreater => cx > self.x,
            ToleranceMode::XLess => cx < self.x,
            ToleranceMode::Both => {
                (cx - self.x).abs() <= self.tolerance_value
                    && (cy - self.y).abs() <= BOTH_Y_TOLERANCE
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapConfig {
    pub name: String,
    pub tl_x: i32,
    pub tl_y: i32,
    pub width: i32,
    pub height: i32,
    #[serde(default)]
    pub created_at: f64,
    #[serde(default)]
    pub last_used_at: f64,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub departure_points: Vec<DeparturePoint>,
}

impl MapConfig {
    pub fn tr(&self) -> (i32, i32) {
        (self.tl_x + self.width, self.tl_y)
    }
    pub fn bl(&self) -> (i32, i32) {
        (self.tl_x, self.tl_y + self.height)
    }
    pub fn br(&self) -> (i32, i32) {
        (self.tl_x + self.width, self.tl_y + self.height)
    }

    /// All four corners keyed `tl`/`tr`/`bl`/`br`.
    pub fn corners(&self) -> HashMap<&'static str, (i32, i32)> {
        HashMap::from([
            ("tl", (self.tl_x, self.tl_y)),
            ("tr", self.tr()),
            ("bl", self.bl()),
            ("br", self.br()),
        ])
    }

    /// Append a waypoint; returns a copy of the stored point.
    pub fn add_departure_point(&mut self, x: i32, y: i32, name: Option<String>) -> DeparturePoint {
        let order = self.departure_points.len() as u32;
        let point = DeparturePoint {
            id: util::random_id(),
            name: name.unwrap_or_else(|| format!("Point {}", order + 1)),
            x,
            y,
            order,
            tolerance_mode: default_tolerance_mode(),
            tolerance_value: default_tolerance_value(),
            created_at: util::unix_ts(),
            rotation_paths: Vec::new(),
            rotation_mode: default_rotation_mode(),
            is_teleport_point: false,
            auto_play: true,
            pathfinding_sequence: None,
        };
        self.departure_points.push(point.clone());
        point
    }

    pub fn remove_departure_point(&mut self, point_id: &str) -> bool {
        let before = self.departure_points.len();
        self.departure_points.retain(|p| p.id != point_id);
        let removed = self.departure_points.len() != before;
        if removed {
            self.renumber_points();
        }
        removed
    }

    fn renumber_points(&mut self) {
        for (i, p) in self.departure_points.iter_mut().enumerate() {
            p.order = i as u32;
        }
    }

    pub fn check_all_departure_hits(&self, cx: i32, cy: i32) -> HashMap<String, bool> {
        self.departure_points
            .iter()
            .map(|p| (p.id.clone(), p.check_hit(cx, cy)))
            .collect()
    }
}

/// On-disk registry document.
#[derive(Debug, Default, Serialize, Deserialize)]
struct MapConfigDoc {
    #[serde(default)]
    configs: Vec<MapConfig>,
    #[serde(default)]
    active_config: Option<String>,
}

/// Registry of map configs, persisted atomically on every mutation.
pub struct MapStore {
    path: PathBuf,
    configs: HashMap<String, MapConfig>,
    active: Option<String>,
}

impl MapStore {
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let mut store = MapStore {
            path,
            configs: HashMap::new(),
            active: None,
        };
        store.reload();
        store
    }

    /// Re-read the registry from disk (used after external edits).
    pub fn reload(&mut self) {
        self.configs.clear();
        self.active = None;
        if !self.path.exists() {
            return;
        }
        let doc: MapConfigDoc = match fs::read_to_string(&self.path)
            .map_err(Error::from)
            .and_then(|t| serde_json::from_str(&t).map_err(Error::from))
        {
            Ok(doc) => doc,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "map config registry unreadable");
                return;
            }
        };
        for mut config in doc.configs {
            config.is_active = false;
            self.configs.insert(config.name.clone(), config);
        }
        if let Some(name) = doc.active_config {
            if let Some(cfg) = self.configs.get_mut(&name) {
                cfg.is_active = true;
                self.active = Some(name);
            }
        }
        info!(count = self.configs.len(), active = ?self.active, "map configs loaded");
    }

    fn persist(&self) -> Result<()> {
        let mut configs: Vec<MapConfig> = self.configs.values().cloned().collect();
        configs.sort_by(|a, b| {
            b.last_used_at
                .partial_cmp(&a.last_used_at)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(
                    b.created_at
                        .partial_cmp(&a.created_at)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
        });
        let doc = MapConfigDoc {
            configs,
            active_config: self.active.clone(),
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&doc)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn list(&self) -> Vec<MapConfig> {
        let mut out: Vec<MapConfig> = self.configs.values().cloned().collect();
        out.sort_by(|a, b| {
            b.last_used_at
                .partial_cmp(&a.last_used_at)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        out
    }

    pub fn get(&self, name: &str) -> Option<&MapConfig> {
        self.configs.get(name)
    }

    pub fn active(&self) -> Option<&MapConfig> {
        self.active.as_deref().and_then(|n| self.configs.get(n))
    }

    pub fn save(&mut self, mut config: MapConfig) -> Result<()> {
        if config.name.trim().is_empty() {
            return Err(Error::protocol("config name cannot be empty"));
        }
        if config.width <= 0 || config.height <= 0 {
            return Err(Error::protocol(format!(
                "invalid dimensions: {}x{}",
                config.width, config.height
            )));
        }
        if config.tl_x < 0 || config.tl_y < 0 {
            return Err(Error::protocol(format!(
                "invalid coordinates: ({}, {})",
                config.tl_x, config.tl_y
            )));
        }
        match self.configs.get(&config.name) {
            Some(existing) => config.created_at = existing.created_at,
            None => config.created_at = util::unix_ts(),
        }
        self.configs.insert(config.name.clone(), config);
        self.persist()
    }

    /// Delete a config. The active one cannot be deleted. Returns the name
    /// so callers can notify the CV-item registry.
    pub fn delete(&mut self, name: &str) -> Result<bool> {
        if Some(name) == self.active.as_deref() {
            warn!(name, "refusing to delete the active map config");
            return Ok(false);
        }
        let removed = self.configs.remove(name).is_some();
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    pub fn activate(&mut self, name: &str) -> Result<MapConfig> {
        if !self.configs.contains_key(name) {
            return Err(Error::NotFound(format!("map config {name}")));
        }
        if let Some(prev) = self.active.take() {
            if let Some(cfg) = self.configs.get_mut(&prev) {
                cfg.is_active = false;
            }
        }
        let cfg = self
            .configs
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("map config {name}")))?;
        cfg.is_active = true;
        cfg.last_used_at = util::unix_ts();
        let snapshot = cfg.clone();
        self.active = Some(name.to_string());
        self.persist()?;
        info!(name, "map config activated");
        Ok(snapshot)
    }

    pub fn deactivate(&mut self) -> Result<()> {
        if let Some(prev) = self.active.take() {
            if let Some(cfg) = self.configs.get_mut(&prev) {
                cfg.is_active = false;
            }
        }
        self.persist()
    }
}
