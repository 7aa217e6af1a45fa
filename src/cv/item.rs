//! CV items: reusable bundles binding a map config to departure points and
//! pathfinding configuration.
//!
//! Activating an item also activates its referenced map config. Deleting a
//! map config nulls the reference on items that point at it without deleting
//! them.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use super::map::{DeparturePoint, MapStore};
use crate::error::{Error, Result};
use crate::util;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CvItem {
    pub name: String,
    /// Null once the referenced map config is deleted.
    #[serde(default)]
    pub map_config_name: Option<String>,
    /// Class-based pathfinding configuration (free-form document; parsed by
    /// the pathfinder).
    #[serde(default)]
    pub pathfinding_config: Value,
    #[serde(default)]
    pub departure_points: Vec<DeparturePoint>,
    #[serde(default)]
    pub created_at: f64,
    #[serde(default)]
    pub last_used_at: f64,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl CvItem {
    /// Check the item is complete enough to drive CV-AUTO.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::protocol("CV item name cannot be empty"));
        }
        if self.map_config_name.is_none() {
            return Err(Error::protocol("CV item must reference a map config"));
        }
        if self.departure_points.is_empty() {
            return Err(Error::protocol("CV item needs at least one departure point"));
        }
        if !self
            .departure_points
            .iter()
            .any(|p| !p.rotation_paths.is_empty())
        {
            return Err(Error::protocol(
                "at least one departure point must have linked rotations",
            ));
        }
        if let Some(class_type) = self.pathfinding_config.get("class_type").and_then(Value::as_str)
        {
            if class_type != "other" && class_type != "magician" {
                return Err(Error::protocol(format!(
                    "invalid pathfinding class_type: {class_type}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CvItemDoc {
    #[serde(default)]
    cv_items: Vec<CvItem>,
    #[serde(default)]
    active_item: Option<String>,
}

pub struct CvItemStore {
    path: PathBuf,
    items: HashMap<String, CvItem>,
    active: Option<String>,
}

impl CvItemStore {
    pub fn load(path: impl AsRef<Path>) -> Self {
        let mut store = CvItemStore {
            path: path.as_ref().to_path_buf(),
            items: HashMap::new(),
            active: None,
        };
        store.reload();
        store
    }

    pub fn reload(&mut self) {
        self.items.clear();
        self.active = None;
        if !self.path.exists() {
            return;
        }
        let doc: CvItemDoc = match fs::read_to_string(&self.path)
            .map_err(Error::from)
            .and_then(|t| serde_json::from_str(&t).map_err(Error::from))
        {
            Ok(doc) => doc,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "CV item registry unreadable");
                return;
            }
        };
        for mut item in doc.cv_items {
            item.is_active = false;
            self.items.insert(item.name.clone(), item);
        }
        if let Some(name) = doc.active_item {
            if let Some(item) = self.items.get_mut(&name) {
                item.is_active = true;
                self.active = Some(name);
            }
        }
        info!(count = self.items.len(), active = ?self.active, "CV items loaded");
    }

    fn persist(&self) -> Result<()> {
        let mut cv_items: Vec<CvItem> = self.items.values().cloned().collect();
        cv_items.sort_by(|a, b| a.name.cmp(&b.name));
        let doc = CvItemDoc {
            cv_items,
            active_item: self.active.clone(),
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&doc)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn list(&self) -> Vec<CvItem> {
        let mut out: Vec<CvItem> = self.items.values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn get(&self, name: &str) -> Option<&CvItem> {
        self.items.get(name)
    }

    pub fn active(&self) -> Option<&CvItem> {
        self.active.as_deref().and_then(|n| self.items.get(n))
    }

    pub fn save(&mut self, mut item: CvItem) -> Result<()> {
        item.validate()?;
        match self.items.get(&item.name) {
            Some(existing) => item.created_at = existing.created_at,
            None => item.created_at = util::unix_ts(),
        }
        self.items.insert(item.name.clone(), item);
        self.persist()
    }

    pub fn delete(&mut self, name: &str) -> Result<bool> {
        if Some(name) == self.active.as_deref() {
            self.active = None;
        }
        let removed = self.items.remove(name).is_some();
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Activate an item and chain-activate its map config.
    pub fn activate(&mut self, name: &str, maps: &mut MapStore) -> Result<CvItem> {
        let map_name = {
            let item = self
                .items
                .get(name)
                .ok_or_else(|| Error::NotFound(format!("CV item {name}")))?;
            item.map_config_name
                .clone()
                .ok_or_else(|| Error::state("CV item has no map config (it was deleted)"))?
        };
        maps.activate(&map_name)?;

        if let Some(prev) = self.active.take() {
            if let Some(item) = self.items.get_mut(&prev) {
                item.is_active = false;
            }
        }
        let item = self
            .items
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("CV item {name}")))?;
        item.is_active = true;
        item.last_used_at = util::unix_ts();
        let snapshot = item.clone();
        self.active = Some(name.to_string());
        self.persist()?;
        info!(name, map = %map_name, "CV item activated");
        Ok(snapshot)
    }

    pub fn deactivate(&mut self) -> Result<()> {
        if let Some(prev) = self.active.take() {
            if let Some(item) = self.items.get_mut(&prev) {
                item.is_active = false;
            }
        }
        self.persist()
    }

    /// A map config went away: null the reference, keep the items.
    pub fn handle_map_config_deleted(&mut self, map_name: &str) -> Result<()> {
        let mut touched = false;
        for item in self.items.values_mut() {
            if item.map_config_name.as_deref() == Some(map_name) {
                item.map_config_name = None;
                touched = true;
            }
        }
        if touched {
            self.persist()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cv::map::{MapConfig, RotationMode, ToleranceMode};

    fn sample_point() -> DeparturePoint {
        DeparturePoint {
            id: "pt".into(),
            name: "pt".into(),
            x: 5,
            y: 5,
            order: 0,
            tolerance_mode: ToleranceMode::Both,
            tolerance_value: 5,
            created_at: 0.0,
            rotation_paths: vec!["rot/a".into()],
            rotation_mode: RotationMode::Random,
            is_teleport_point: false,
            auto_play: true,
            pathfinding_sequence: None,
        }
    }

    fn sample_item(name: &str, map: &str) -> CvItem {
        CvItem {
            name: name.into(),
            map_config_name: Some(map.into()),
            pathfinding_config: serde_json::json!({"class_type": "other"}),
            departure_points: vec![sample_point()],
            created_at: 0.0,
            last_used_at: 0.0,
            is_active: false,
            description: String::new(),
            tags: vec!["t1".into()],
        }
    }

    fn sample_map(name: &str) -> MapConfig {
        MapConfig {
            name: name.into(),
            tl_x: 0,
            tl_y: 0,
            width: 100,
            height: 50,
            created_at: 0.0,
            last_used_at: 0.0,
            is_active: false,
            departure_points: Vec::new(),
        }
    }

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.json");
        let mut store = CvItemStore::load(&path);
        store.save(sample_item("farm", "m1")).unwrap();

        let reloaded = CvItemStore::load(&path);
        let item = reloaded.get("farm").unwrap();
        assert_eq!(item.departure_points, vec![sample_point()]);
        assert_eq!(item.tags, vec!["t1".to_string()]);
    }

    #[test]
    fn activation_chains_to_map_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut maps = MapStore::load(dir.path().join("maps.json"));
        maps.save(sample_map("m1")).unwrap();
        let mut items = CvItemStore::load(dir.path().join("items.json"));
        items.save(sample_item("farm", "m1")).unwrap();

        let activated = items.activate("farm", &mut maps).unwrap();
        assert!(activated.is_active);
        assert_eq!(maps.active().map(|m| m.name.as_str()), Some("m1"));
    }

    #[test]
    fn map_deletion_nulls_reference_keeps_item() {
        let dir = tempfile::tempdir().unwrap();
        let mut items = CvItemStore::load(dir.path().join("items.json"));
        items.save(sample_item("farm", "m1")).unwrap();
        items.handle_map_config_deleted("m1").unwrap();
        let item = items.get("farm").unwrap();
        assert!(item.map_config_name.is_none());
    }

    #[test]
    fn validation_rejects_incomplete_items() {
        let mut item = sample_item("x", "m");
        item.departure_points[0].rotation_paths.clear();
        assert!(item.validate().is_err());

        let mut item2 = sample_item("x", "m");
        item2.map_config_name = None;
        assert!(item2.validate().is_err());

        let mut item3 = sample_item("x", "m");
        item3.pathfinding_config = serde_json::json!({"class_type": "warrior"});
        assert!(item3.validate().is_err());
    }
}
