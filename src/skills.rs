//! Skill configurations and their on-disk store (one JSON file per skill).
//!
//! Files use camelCase keys (the shape the web UI produces); loading also
//! accepts snake_case via serde aliases.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::util;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillConfig {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub keystroke: String,
    /// Base cooldown in seconds.
    #[serde(alias = "cooldown_s", alias = "cooldown_seconds")]
    pub cooldown: f64,
    #[serde(default, alias = "key_replacement")]
    pub key_replacement: bool,
    #[serde(default = "default_replace_rate", alias = "replace_rate")]
    pub replace_rate: f64,
    #[serde(default, alias = "frozen_rotation_during_casting")]
    pub frozen_rotation_during_casting: bool,
    #[serde(default, alias = "is_selected")]
    pub is_selected: bool,
    #[serde(default)]
    pub order: u32,
    #[serde(default, alias = "group_id")]
    pub group_id: Option<String>,
    /// Delay after this skill casts, for group sequencing.
    #[serde(default, alias = "delay_after", alias = "delay_after_s")]
    pub delay_after: f64,
    /// Base delay before the opposite-arrow trigger fires.
    #[serde(default = "default_cast_position", alias = "cast_position")]
    pub cast_position: f64,
    /// Extra wait after every cast, before rotation resumes.
    #[serde(default, alias = "skill_delay")]
    pub skill_delay: f64,
    // UI state, persisted verbatim.
    #[serde(default = "default_variant")]
    pub variant: String,
    #[serde(default, alias = "is_open")]
    pub is_open: bool,
    #[serde(default = "default_true", alias = "is_enabled")]
    pub is_enabled: bool,
}

fn default_replace_rate() -> f64 {
    0.7
}
fn default_cast_position() -> f64 {
    0.3
}
fn default_variant() -> String {
    "cd skill".to_string()
}
fn default_true() -> bool {
    true
}

impl SkillConfig {
    /// Fill in a missing id.
    pub fn ensure_id(&mut self) {
        if self.id.trim().is_empty() {
            self.id = util::random_id();
        }
    }
}

/// Per-file skill store under the skills directory.
pub struct SkillManager {
    dir: PathBuf,
}

impl SkillManager {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(SkillManager { dir })
    }

    fn file_for(&self, skill_id: &str) -> PathBuf {
        // Filesystem-safe id.
        let safe: String = skill_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        self.dir.join(format!("{safe}.json"))
    }

    pub fn list(&self) -> Vec<SkillConfig> {
        let mut skills = Vec::new();
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return skills;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(Error::from)
                .and_then(|t| serde_json::from_str::<SkillConfig>(&t).map_err(Error::from))
            {
                Ok(skill) => skills.push(skill),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable skill file");
                }
            }
        }
        skills.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        skills
    }

    pub fn get(&self, skill_id: &str) -> Option<SkillConfig> {
        let path = self.file_for(skill_id);
        let text = fs::read_to_string(path).ok()?;
        serde_json::from_str(&text).ok()
    }

    pub fn save(&self, mut skill: SkillConfig) -> Result<SkillConfig> {
        skill.ensure_id();
        let path = self.file_for(&skill.id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&skill)?)?;
        fs::rename(&tmp, &path)?;
        Ok(skill)
    }

    /// Merge a JSON patch into an existing skill and persist.
    pub fn update(&self, skill_id: &str, patch: &serde_json::Value) -> Result<SkillConfig> {
        let existing = self
            .get(skill_id)
            .ok_or_else(|| Error::NotFound(format!("skill {skill_id}")))?;
        let mut doc = serde_json::to_value(&existing)?;
        if let (Some(base), Some(updates)) = (doc.as_object_mut(), patch.as_object()) {
            for (k, v) in updates {
                base.insert(k.clone(), v.clone());
            }
        }
        let updated: SkillConfig = serde_json::from_value(doc)?;
        self.save(updated)
    }

    pub fn delete(&self, skill_id: &str) -> Result<bool> {
        let path = self.file_for(skill_id);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(path)?;
        Ok(true)
    }

    pub fn selected(&self) -> Vec<SkillConfig> {
        self.list().into_iter().filter(|s| s.is_selected).collect()
    }

    /// Persist a new ordering; unknown ids are ignored.
    pub fn reorder(&self, ordered_ids: &[String]) -> Result<Vec<SkillConfig>> {
        for (i, id) in ordered_ids.iter().enumerate() {
            if let Some(mut skill) = self.get(id) {
                skill.order = i as u32;
                self.save(skill)?;
            }
        }
        Ok(self.list())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skill(name: &str, selected: bool) -> SkillConfig {
        SkillConfig {
            id: String::new(),
            name: name.to_string(),
            keystroke: "Q".to_string(),
            cooldown: 30.0,
            key_replacement: false,
            replace_rate: 0.7,
            frozen_rotation_during_casting: false,
            is_selected: selected,
            order: 0,
            group_id: None,
            delay_after: 0.0,
            cast_position: 0.3,
            skill_delay: 0.0,
            variant: "cd skill".into(),
            is_open: false,
            is_enabled: true,
        }
    }

    #[test]
    fn save_assigns_id_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = SkillManager::new(dir.path()).unwrap();
        let saved = mgr.save(skill("Burst", true)).unwrap();
        assert!(!saved.id.is_empty());
        let loaded = mgr.get(&saved.id).unwrap();
        assert_eq!(loaded, saved);
    }

    #[test]
    fn list_sorted_and_selected_filter() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = SkillManager::new(dir.path()).unwrap();
        mgr.save(skill("zeta", false)).unwrap();
        mgr.save(skill("Alpha", true)).unwrap();
        let all = mgr.list();
        assert_eq!(all[0].name, "Alpha");
        assert_eq!(mgr.selected().len(), 1);
    }

    #[test]
    fn update_merges_patch() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = SkillManager::new(dir.path()).unwrap();
        let saved = mgr.save(skill("Buff", false)).unwrap();
        let patch = serde_json::json!({"cooldown": 12.5, "isSelected": true});
        let updated = mgr.update(&saved.id, &patch).unwrap();
        assert_eq!(updated.cooldown, 12.5);
        assert!(updated.is_selected);
    }

    #[test]
    fn snake_case_files_load() {
        let text = r#"{
            "id": "abc", "name": "Old", "keystroke": "W",
            "cooldown_s": 45.0, "key_replacement": true,
            "frozen_rotation_during_casting": true, "is_selected": true,
            "group_id": "g1", "delay_after_s": 1.5
        }"#;
        let skill: SkillConfig = serde_json::from_str(text).unwrap();
        assert_eq!(skill.cooldown, 45.0);
        assert!(skill.key_replacement);
        assert_eq!(skill.group_id.as_deref(), Some("g1"));
        assert_eq!(skill.delay_after, 1.5);
    }

    #[test]
    fn reorder_persists_order() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = SkillManager::new(dir.path()).unwrap();
        let a = mgr.save(skill("a", false)).unwrap();
        let b = mgr.save(skill("b", false)).unwrap();
        mgr.reorder(&[b.id.clone(), a.id.clone()]).unwrap();
        assert_eq!(mgr.get(&b.id).unwrap().order, 0);
        assert_eq!(mgr.get(&a.id).unwrap().order, 1);
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = SkillManager::new(dir.path()).unwrap();
        let saved = mgr.save(skill("gone", false)).unwrap();
        assert!(mgr.delete(&saved.id).unwrap());
        assert!(!mgr.delete(&saved.id).unwrap());
    }
}
